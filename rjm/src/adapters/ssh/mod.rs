// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::Config;
use russh_sftp::protocol::StatusCode;

use crate::app::errors::{
    AppError, AppErrorKind, AppResult, codes, remote_error, transport_error,
};
use crate::app::ports::{RemoteSession, TransportPort};
use crate::app::services::otp::OtpLedger;
use crate::app::types::{Credentials, ExecCapture, SshEndpoints};

mod error;
mod session;

pub use error::{AuthenticationFailure, HostKeyRejected};
pub use session::TwoHopSession;

/// Opens authenticated sessions on the login node through the lander.
#[derive(Clone)]
pub struct SshTransport {
    endpoints: SshEndpoints,
    credentials: Credentials,
    ledger: Arc<OtpLedger>,
    config: Arc<Config>,
}

impl SshTransport {
    pub fn new(
        endpoints: SshEndpoints,
        credentials: Credentials,
        ledger: Arc<OtpLedger>,
        keepalive: Duration,
    ) -> Self {
        let cfg = Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            keepalive_interval: Some(keepalive),
            ..Default::default()
        };
        Self {
            endpoints,
            credentials,
            ledger,
            config: Arc::new(cfg),
        }
    }
}

fn app_error_in(err: &anyhow::Error) -> Option<AppError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<AppError>())
        .cloned()
}

fn ssh_error_code(err: &anyhow::Error) -> &'static str {
    if err.chain().any(|cause| {
        cause.is::<AuthenticationFailure>() || cause.is::<HostKeyRejected>()
    }) {
        codes::AUTHENTICATION_FAILURE
    } else {
        codes::CONNECTION_FAILURE
    }
}

fn map_connect_error(err: anyhow::Error, host: &str) -> AppError {
    if let Some(app) = app_error_in(&err) {
        return app;
    }
    match ssh_error_code(&err) {
        codes::AUTHENTICATION_FAILURE => AppError::with_message(
            AppErrorKind::Auth,
            codes::AUTHENTICATION_FAILURE,
            format!("ssh connect to {host} failed: {err}"),
        ),
        code => AppError::with_message(
            AppErrorKind::Network,
            code,
            format!("ssh connect to {host} failed: {err}"),
        ),
    }
}

fn map_auth_error(err: anyhow::Error, host: &str) -> AppError {
    if let Some(app) = app_error_in(&err) {
        return app;
    }
    match ssh_error_code(&err) {
        codes::AUTHENTICATION_FAILURE => AppError::with_message(
            AppErrorKind::Auth,
            codes::AUTHENTICATION_FAILURE,
            format!("authentication to {host} failed: {err:#}"),
        ),
        _ => transport_error(format!("authentication to {host} interrupted: {err:#}")),
    }
}

fn map_exec_error(err: anyhow::Error) -> AppError {
    app_error_in(&err).unwrap_or_else(|| transport_error(format!("ssh exec failed: {err:#}")))
}

fn map_transfer_error(err: anyhow::Error) -> AppError {
    if let Some(app) = app_error_in(&err) {
        return app;
    }
    if is_channel_failure(&err) {
        return transport_error(format!("file transfer failed: {err:#}"));
    }
    match sftp_status_in(&err) {
        Some(StatusCode::NoSuchFile) => remote_error(format!("remote file not found: {err:#}")),
        // The server answered; the channel itself is still usable.
        _ => remote_error(format!("file transfer refused: {err:#}")),
    }
}

/// The error says nothing about the remote file, only about the channel.
fn is_channel_failure(err: &anyhow::Error) -> bool {
    app_error_in(err).is_none() && sftp_status_in(err).is_none()
}

fn sftp_status_in(err: &anyhow::Error) -> Option<StatusCode> {
    err.chain().find_map(|cause| {
        match cause.downcast_ref::<russh_sftp::client::error::Error>()? {
            russh_sftp::client::error::Error::Status(status) => Some(status.status_code),
            _ => None,
        }
    })
}

#[async_trait]
impl TransportPort for SshTransport {
    #[tracing::instrument(
        name = "ssh",
        level = "debug",
        skip(self),
        fields(op = "open", lander = %self.endpoints.lander_host, login = %self.endpoints.login_host, user = %self.credentials.username)
    )]
    async fn open(&self) -> AppResult<Box<dyn RemoteSession>> {
        let session = TwoHopSession::connect(
            self.config.clone(),
            &self.endpoints,
            &self.credentials,
            &self.ledger,
        )
        .await?;
        Ok(Box::new(session))
    }
}

#[async_trait]
impl RemoteSession for TwoHopSession {
    #[tracing::instrument(name = "ssh", level = "debug", skip(self, command), fields(op = "run", host = %self.login_host()))]
    async fn run(&self, command: &str) -> AppResult<ExecCapture> {
        self.exec_capture(command).await.map_err(map_exec_error)
    }

    #[tracing::instrument(name = "ssh", level = "debug", skip(self, local_path), fields(op = "upload", local = %local_path.display()))]
    async fn upload(&self, local_path: &Path, remote_path: &str) -> AppResult<()> {
        self.upload_file(local_path, remote_path)
            .await
            .map_err(map_transfer_error)
    }

    #[tracing::instrument(name = "ssh", level = "debug", skip(self, local_path), fields(op = "download", local = %local_path.display()))]
    async fn download(&self, remote_path: &str, local_path: &Path) -> AppResult<u64> {
        self.download_file(remote_path, local_path)
            .await
            .map_err(map_transfer_error)
    }

    async fn is_closed(&self) -> bool {
        TwoHopSession::is_closed(self).await
    }

    async fn close(&self) {
        self.shutdown().await;
    }
}
