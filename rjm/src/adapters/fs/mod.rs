// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io::ErrorKind;
use std::path::Path;

use async_trait::async_trait;

use crate::app::errors::{AppResult, local_error};
use crate::app::ports::LocalFilesystemPort;

mod job_record;

pub use job_record::TomlJobStore;

#[derive(Clone, Default)]
pub struct LocalFilesystem;

impl LocalFilesystem {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LocalFilesystemPort for LocalFilesystem {
    #[tracing::instrument(name = "fs", level = "debug", skip(self, path), fields(op = "read_to_string", path = %path.display()))]
    async fn read_to_string(&self, path: &Path) -> AppResult<String> {
        std::fs::read_to_string(path)
            .map_err(|err| local_error(format!("failed to read {}: {err}", path.display())))
    }

    #[tracing::instrument(name = "fs", level = "debug", skip(self, path), fields(op = "read_optional", path = %path.display()))]
    async fn read_optional(&self, path: &Path) -> AppResult<Option<String>> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(local_error(format!(
                "failed to read {}: {err}",
                path.display()
            ))),
        }
    }

    async fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    #[tracing::instrument(name = "fs", level = "debug", skip(self, from, to), fields(op = "rename", from = %from.display(), to = %to.display()))]
    async fn rename(&self, from: &Path, to: &Path) -> AppResult<()> {
        std::fs::rename(from, to).map_err(|err| {
            local_error(format!(
                "failed to move {} to {}: {err}",
                from.display(),
                to.display()
            ))
        })
    }

    async fn remove_file(&self, path: &Path) -> AppResult<()> {
        std::fs::remove_file(path)
            .map_err(|err| local_error(format!("failed to remove {}: {err}", path.display())))
    }
}
