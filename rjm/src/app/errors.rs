// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;

pub mod codes {
    pub const AUTHENTICATION_FAILURE: &str = "authentication_failure";
    pub const CONNECTION_FAILURE: &str = "connection_failure";
    pub const NETWORK_ERROR: &str = "network_error";
    pub const TRANSPORT_ERROR: &str = "transport_error";
    pub const REMOTE_ERROR: &str = "remote_error";
    pub const PARSE_ERROR: &str = "parse_error";
    pub const STATE_CORRUPTION: &str = "state_corruption";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const CONFIG_ERROR: &str = "config_error";
    pub const LOCAL_ERROR: &str = "local_error";
    pub const CANCELED: &str = "canceled";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorKind {
    /// Host unreachable or name resolution failed.
    Network,
    /// Bad credentials, rejected OTP, exhausted challenge. Never retried.
    Auth,
    /// Channel failure inside an established session; the session is unusable.
    Transport,
    /// Remote API returned a non-zero exit code or unparseable output.
    RemoteCommand,
    /// Job record unreadable or inconsistent.
    StateCorruption,
    InvalidArgument,
    Config,
    Local,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct AppError {
    kind: AppErrorKind,
    code: &'static str,
    message: String,
    context: Option<String>,
}

impl AppError {
    #[cfg(test)]
    pub fn new(kind: AppErrorKind, code: &'static str) -> Self {
        Self {
            kind,
            code,
            message: code.to_string(),
            context: None,
        }
    }

    pub fn with_message(
        kind: AppErrorKind,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn kind(&self) -> AppErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    #[cfg(test)]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[cfg(test)]
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Whether repeating the failed operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            AppErrorKind::Network | AppErrorKind::RemoteCommand | AppErrorKind::Local
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ctx) = &self.context {
            write!(f, "{} ({})", self.message, ctx)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

pub fn network_error(message: impl Into<String>) -> AppError {
    AppError::with_message(AppErrorKind::Network, codes::NETWORK_ERROR, message)
}

pub fn transport_error(message: impl Into<String>) -> AppError {
    AppError::with_message(AppErrorKind::Transport, codes::TRANSPORT_ERROR, message)
}

pub fn remote_error(message: impl Into<String>) -> AppError {
    AppError::with_message(AppErrorKind::RemoteCommand, codes::REMOTE_ERROR, message)
}

pub fn parse_error(message: impl Into<String>) -> AppError {
    AppError::with_message(AppErrorKind::RemoteCommand, codes::PARSE_ERROR, message)
}

pub fn state_corruption(message: impl Into<String>) -> AppError {
    AppError::with_message(
        AppErrorKind::StateCorruption,
        codes::STATE_CORRUPTION,
        message,
    )
}

pub fn invalid_argument(message: impl Into<String>) -> AppError {
    AppError::with_message(
        AppErrorKind::InvalidArgument,
        codes::INVALID_ARGUMENT,
        message,
    )
}

pub fn config_error(message: impl Into<String>) -> AppError {
    AppError::with_message(AppErrorKind::Config, codes::CONFIG_ERROR, message)
}

pub fn local_error(message: impl Into<String>) -> AppError {
    AppError::with_message(AppErrorKind::Local, codes::LOCAL_ERROR, message)
}
