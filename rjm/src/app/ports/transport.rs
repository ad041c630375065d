// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::ExecCapture;

#[async_trait]
/// Opens authenticated sessions to the cluster login node.
pub trait TransportPort: Send + Sync {
    async fn open(&self) -> AppResult<Box<dyn RemoteSession>>;
}

#[async_trait]
/// One authenticated connection. Owned by whoever opened it and closed explicitly.
/// A non-zero exit code from `run` is not an error at this layer.
pub trait RemoteSession: Send + Sync {
    async fn run(&self, command: &str) -> AppResult<ExecCapture>;

    async fn upload(&self, local_path: &Path, remote_path: &str) -> AppResult<()>;

    /// Returns the number of bytes written to `local_path`.
    async fn download(&self, remote_path: &str, local_path: &Path) -> AppResult<u64>;

    /// True once either hop has dropped or `close` was called.
    async fn is_closed(&self) -> bool;

    /// Safe to call more than once.
    async fn close(&self);
}
