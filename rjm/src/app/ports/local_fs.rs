// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;

use async_trait::async_trait;

use crate::app::errors::AppResult;

#[async_trait]
/// Local filesystem boundary for the core.
/// Provides file reads and renames with consistent errors.
pub trait LocalFilesystemPort: Send + Sync {
    async fn read_to_string(&self, path: &Path) -> AppResult<String>;
    /// `None` when the file does not exist.
    async fn read_optional(&self, path: &Path) -> AppResult<Option<String>>;
    async fn is_dir(&self, path: &Path) -> bool;
    async fn rename(&self, from: &Path, to: &Path) -> AppResult<()>;
    async fn remove_file(&self, path: &Path) -> AppResult<()>;
}
