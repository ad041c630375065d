// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tempfile::NamedTempFile;

use crate::app::errors::{AppResult, local_error, state_corruption};
use crate::app::ports::SecretStorePort;

type Secrets = BTreeMap<String, String>;

/// Secrets as a JSON object in a file only the owner can read.
pub struct FileSecretStore {
    path: PathBuf,
    write: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> AppResult<Secrets> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Secrets::new()),
            Err(err) => {
                return Err(local_error(format!(
                    "failed to read secret store {}: {err}",
                    self.path.display()
                )));
            }
        };
        serde_json::from_str(&content).map_err(|err| {
            state_corruption(format!(
                "secret store {} is unreadable: {err}",
                self.path.display()
            ))
        })
    }

    fn write_all(&self, secrets: &Secrets) -> AppResult<()> {
        let write_err = |err: std::io::Error| {
            local_error(format!(
                "failed to write secret store {}: {err}",
                self.path.display()
            ))
        };
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(write_err)?;

        let rendered = serde_json::to_vec_pretty(secrets)
            .map_err(|err| local_error(format!("failed to encode secrets: {err}")))?;
        let mut tmp = NamedTempFile::new_in(dir).map_err(write_err)?;
        restrict_permissions(tmp.as_file()).map_err(write_err)?;
        tmp.write_all(&rendered).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|err| write_err(err.error))?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &std::fs::File) -> std::io::Result<()> {
    Ok(())
}

impl SecretStorePort for FileSecretStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.read_all()?.remove(key))
    }

    fn put(&self, key: &str, value: &str) -> AppResult<()> {
        let _guard = self
            .write
            .lock()
            .map_err(|_| local_error("secret store lock poisoned"))?;
        let mut secrets = self.read_all()?;
        secrets.insert(key.to_string(), value.to_string());
        self.write_all(&secrets)
    }
}
