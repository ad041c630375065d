// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use tokio::sync::Mutex;

use crate::app::errors::{AppResult, config_error};
use crate::app::ports::secret_store::LAST_OTP_USED_KEY;
use crate::app::ports::{ClockPort, SecretStorePort};

type HmacSha1 = Hmac<Sha1>;

pub const TIME_STEP_SECS: u64 = 30;
pub const DIGITS: u32 = 6;

/// Extra wait past a step boundary so the server clock has moved too.
const STEP_BOUNDARY_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtpToken {
    pub code: String,
    pub step: u64,
}

/// RFC 6238 generator (HMAC-SHA1, 30 second steps, 6 digits).
#[derive(Clone)]
pub struct TotpGenerator {
    mac: HmacSha1,
}

impl TotpGenerator {
    /// Accepts the usual authenticator-app spellings: lower case, spaces, padding.
    pub fn from_base32(seed: &str) -> AppResult<Self> {
        let normalized: String = seed
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '=' && *c != '-')
            .map(|c| c.to_ascii_uppercase())
            .collect();
        if normalized.is_empty() {
            return Err(config_error("otp seed is empty"));
        }
        let key = BASE32_NOPAD
            .decode(normalized.as_bytes())
            .map_err(|e| config_error(format!("otp seed is not valid base32: {e}")))?;
        let mac = HmacSha1::new_from_slice(&key)
            .map_err(|e| config_error(format!("otp seed cannot be used as a key: {e}")))?;
        Ok(Self { mac })
    }

    pub fn step_at(unix_secs: i64) -> u64 {
        u64::try_from(unix_secs).unwrap_or(0) / TIME_STEP_SECS
    }

    /// Time left until the step containing `unix_secs` ends.
    pub fn remaining(unix_secs: i64) -> Duration {
        let secs = u64::try_from(unix_secs).unwrap_or(0);
        Duration::from_secs(TIME_STEP_SECS - secs % TIME_STEP_SECS)
    }

    pub fn token_at(&self, unix_secs: i64) -> OtpToken {
        let step = Self::step_at(unix_secs);
        OtpToken {
            code: self.code_for_step(step),
            step,
        }
    }

    pub fn now(&self, clock: &dyn ClockPort) -> OtpToken {
        self.token_at(clock.now_utc().unix_timestamp())
    }

    pub fn is_expired(token: &OtpToken, unix_secs: i64) -> bool {
        Self::step_at(unix_secs) != token.step
    }

    pub fn code_for_step(&self, step: u64) -> String {
        let mut mac = self.mac.clone();
        mac.update(&step.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        let offset = usize::from(digest[digest.len() - 1] & 0x0f);
        let binary = (u32::from(digest[offset] & 0x7f) << 24)
            | (u32::from(digest[offset + 1]) << 16)
            | (u32::from(digest[offset + 2]) << 8)
            | u32::from(digest[offset + 3]);
        let code = binary % 10u32.pow(DIGITS);
        format!("{code:0width$}", width = DIGITS as usize)
    }
}

/// Hands out one-time passwords, never the same one twice in a row.
///
/// The last issued code lives in the secret store so the guarantee holds
/// across process runs. Issuance is serialized: concurrent callers queue on
/// the internal lock and each gets a code from its own time step.
pub struct OtpLedger {
    generator: TotpGenerator,
    secrets: Arc<dyn SecretStorePort>,
    clock: Arc<dyn ClockPort>,
    issue: Mutex<()>,
}

impl OtpLedger {
    pub fn new(
        generator: TotpGenerator,
        secrets: Arc<dyn SecretStorePort>,
        clock: Arc<dyn ClockPort>,
    ) -> Self {
        Self {
            generator,
            secrets,
            clock,
            issue: Mutex::new(()),
        }
    }

    /// The code is committed to the store before it is returned.
    pub async fn fresh_token(&self) -> AppResult<String> {
        let _guard = self.issue.lock().await;
        loop {
            let token = self.generator.now(self.clock.as_ref());
            let last = self.secrets.get(LAST_OTP_USED_KEY)?;
            if last.as_deref() != Some(token.code.as_str()) {
                self.secrets.put(LAST_OTP_USED_KEY, &token.code)?;
                tracing::debug!(step = token.step, "issued one-time password");
                return Ok(token.code);
            }
            self.outwait(&token).await;
        }
    }

    /// Sleeps until `token` belongs to a past step.
    async fn outwait(&self, token: &OtpToken) {
        loop {
            let now = self.clock.now_utc().unix_timestamp();
            if TotpGenerator::is_expired(token, now) {
                return;
            }
            let wait = TotpGenerator::remaining(now) + STEP_BOUNDARY_SLACK;
            tracing::info!(
                wait_secs = wait.as_secs(),
                "current one-time password was already used, waiting for the next one"
            );
            self.clock.sleep(wait).await;
        }
    }
}
