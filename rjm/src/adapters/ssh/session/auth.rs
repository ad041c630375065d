// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use russh::client::{AuthResult, Handle, KeyboardInteractiveAuthResponse};
use russh::{MethodKind, MethodSet};

use crate::adapters::ssh::AuthenticationFailure;
use crate::app::services::otp::OtpLedger;
use crate::app::types::Credentials;

use super::ClientHandler;

/// Upper bound on info-request rounds before giving up.
const MAX_CHALLENGE_ROUNDS: usize = 8;

#[derive(Debug, PartialEq, Eq)]
enum AuthDecision {
    Success,
    KeyboardInteractive,
    Failure,
}

fn auth_decision(result: AuthResult) -> AuthDecision {
    match result {
        AuthResult::Success => AuthDecision::Success,
        AuthResult::Failure {
            remaining_methods,
            partial_success,
        } if partial_success
            && remaining_methods.contains(&MethodKind::KeyboardInteractive) =>
        {
            AuthDecision::KeyboardInteractive
        }
        AuthResult::Failure { .. } => AuthDecision::Failure,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChallengeAnswer {
    Password,
    Otp,
}

/// The first prompt of a login gets the password, every later one a fresh
/// one-time password.
#[derive(Debug, Default)]
pub(crate) struct ChallengeResponder {
    password_sent: bool,
}

impl ChallengeResponder {
    fn after_password() -> Self {
        Self {
            password_sent: true,
        }
    }

    pub(crate) fn next_answer(&mut self) -> ChallengeAnswer {
        if self.password_sent {
            ChallengeAnswer::Otp
        } else {
            self.password_sent = true;
            ChallengeAnswer::Password
        }
    }
}

enum ChallengeOutcome {
    Success,
    Rejected { remaining_methods: MethodSet },
}

/// Password plus one-time password. Keyboard-interactive is tried first; a
/// server that only offers `password` gets that, with any follow-up
/// challenge answered by the one-time password.
pub(super) async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    credentials: &Credentials,
    ledger: &OtpLedger,
    hop: &str,
) -> Result<()> {
    let response = handle
        .authenticate_keyboard_interactive_start(credentials.username.clone(), None::<String>)
        .await
        .context("keyboard-interactive start failed")?;
    let mut responder = ChallengeResponder::default();
    let outcome = answer_challenges(handle, response, &mut responder, credentials, ledger, hop).await?;

    let remaining_methods = match outcome {
        ChallengeOutcome::Success => return Ok(()),
        ChallengeOutcome::Rejected { remaining_methods } => remaining_methods,
    };
    if responder.password_sent || !remaining_methods.contains(&MethodKind::Password) {
        return Err(anyhow::Error::new(AuthenticationFailure).context(format!("{hop} rejected credentials")));
    }

    tracing::debug!(hop, "keyboard-interactive not offered, trying password");
    let result = handle
        .authenticate_password(credentials.username.clone(), credentials.password.clone())
        .await
        .context("password authentication failed")?;
    match auth_decision(result) {
        AuthDecision::Success => Ok(()),
        AuthDecision::KeyboardInteractive => {
            let response = handle
                .authenticate_keyboard_interactive_start(
                    credentials.username.clone(),
                    None::<String>,
                )
                .await
                .context("keyboard-interactive start failed")?;
            let mut responder = ChallengeResponder::after_password();
            match answer_challenges(handle, response, &mut responder, credentials, ledger, hop)
                .await?
            {
                ChallengeOutcome::Success => Ok(()),
                ChallengeOutcome::Rejected { .. } => Err(anyhow::Error::new(AuthenticationFailure)
                    .context(format!("{hop} rejected one-time password"))),
            }
        }
        AuthDecision::Failure => Err(anyhow::Error::new(AuthenticationFailure)
            .context(format!("{hop} rejected password"))),
    }
}

async fn answer_challenges(
    handle: &mut Handle<ClientHandler>,
    mut response: KeyboardInteractiveAuthResponse,
    responder: &mut ChallengeResponder,
    credentials: &Credentials,
    ledger: &OtpLedger,
    hop: &str,
) -> Result<ChallengeOutcome> {
    for _ in 0..MAX_CHALLENGE_ROUNDS {
        match response {
            KeyboardInteractiveAuthResponse::Success => return Ok(ChallengeOutcome::Success),
            KeyboardInteractiveAuthResponse::Failure {
                remaining_methods,
                partial_success,
            } => {
                tracing::debug!(
                    hop,
                    partial_success,
                    "keyboard-interactive rejected (remaining={:?})",
                    remaining_methods
                );
                return Ok(ChallengeOutcome::Rejected { remaining_methods });
            }
            KeyboardInteractiveAuthResponse::InfoRequest {
                name,
                instructions,
                prompts,
            } => {
                tracing::debug!(
                    hop,
                    name = %name,
                    instructions = %instructions,
                    prompts = prompts.len(),
                    "answering keyboard-interactive challenge"
                );
                let mut answers = Vec::with_capacity(prompts.len());
                for prompt in &prompts {
                    let kind = responder.next_answer();
                    tracing::debug!(hop, prompt = %prompt.prompt.trim(), answer = ?kind, "prompt");
                    answers.push(match kind {
                        ChallengeAnswer::Password => credentials.password.clone(),
                        ChallengeAnswer::Otp => ledger.fresh_token().await?,
                    });
                }
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .context("keyboard-interactive respond failed")?;
            }
        }
    }
    Err(anyhow::Error::new(AuthenticationFailure).context(format!(
        "{hop}: challenge not settled after {MAX_CHALLENGE_ROUNDS} rounds"
    )))
}
