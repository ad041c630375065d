// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::OpenFlags;
use tokio::fs as tokiofs;
use tokio::io::AsyncWriteExt;
use tokio::sync::MutexGuard;

use crate::app::errors::{local_error, remote_error};

use super::TwoHopSession;

/// An SFTP subsystem channel on the login node.
pub(crate) struct FileChannel {
    sftp: SftpSession,
}

impl FileChannel {
    /// Writes the local file to `remote_path`, replacing what was there.
    async fn put(&self, local_path: &Path, remote_path: &str) -> Result<u64> {
        let mut local = tokiofs::File::open(local_path).await.map_err(|err| {
            anyhow::Error::new(local_error(format!(
                "cannot read {}: {err}",
                local_path.display()
            )))
        })?;
        let expected = local
            .metadata()
            .await
            .map_err(|err| {
                anyhow::Error::new(local_error(format!(
                    "cannot stat {}: {err}",
                    local_path.display()
                )))
            })?
            .len();

        let flags = OpenFlags::WRITE
            .union(OpenFlags::CREATE)
            .union(OpenFlags::TRUNCATE);
        let mut remote = self
            .sftp
            .open_with_flags(remote_path, flags)
            .await
            .with_context(|| format!("opening {remote_path} for writing"))?;
        let copied = tokio::io::copy(&mut local, &mut remote)
            .await
            .with_context(|| format!("writing {remote_path}"))?;
        remote.flush().await?;
        remote.shutdown().await?;
        if copied != expected {
            return Err(anyhow!(
                "short upload to {remote_path}: {copied} of {expected} bytes"
            ));
        }
        Ok(copied)
    }

    /// Reads `remote_path` into a newly created local file.
    async fn get(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        let expected = self
            .sftp
            .metadata(remote_path)
            .await
            .with_context(|| format!("stat {remote_path}"))?
            .size;
        let mut remote = self
            .sftp
            .open(remote_path)
            .await
            .with_context(|| format!("opening {remote_path}"))?;
        let mut local = tokiofs::File::create(local_path).await.map_err(|err| {
            anyhow::Error::new(local_error(format!(
                "cannot create {}: {err}",
                local_path.display()
            )))
        })?;
        let copied = tokio::io::copy(&mut remote, &mut local)
            .await
            .with_context(|| format!("reading {remote_path}"))?;
        local.flush().await?;
        local.sync_all().await.map_err(|err| {
            anyhow::Error::new(local_error(format!(
                "cannot sync {}: {err}",
                local_path.display()
            )))
        })?;
        if let Some(expected) = expected.filter(|size| *size != copied) {
            return Err(anyhow::Error::new(remote_error(format!(
                "short download of {remote_path}: {copied} of {expected} bytes"
            ))));
        }
        Ok(copied)
    }
}

/// The next transfer reopens the channel after a failure of the channel itself.
fn forget_broken_channel<T>(slot: &mut Option<FileChannel>, result: &Result<T>) {
    if let Err(err) = result {
        if super::super::is_channel_failure(err) {
            tracing::debug!("dropping sftp channel after failure: {err:#}");
            *slot = None;
        }
    }
}

impl TwoHopSession {
    async fn open_transfer_channel(&self) -> Result<FileChannel> {
        let guard = self.login.lock().await;
        let handle = guard
            .as_ref()
            .filter(|h| !h.is_closed())
            .ok_or_else(|| anyhow!("ssh session to {} is closed", self.login_host))?;
        let channel = handle
            .channel_open_session()
            .await
            .context("open sftp channel")?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .context("request sftp subsystem")?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .context("sftp handshake")?;
        Ok(FileChannel { sftp })
    }

    /// One SFTP channel per session, opened on first use. Holding the guard
    /// serializes transfers on it.
    async fn transfer_channel(&self) -> Result<MutexGuard<'_, Option<FileChannel>>> {
        let mut guard = self.transfer.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_transfer_channel().await?);
        }
        Ok(guard)
    }

    pub(crate) async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let mut guard = self.transfer_channel().await?;
        let channel = guard
            .as_ref()
            .ok_or_else(|| anyhow!("sftp channel unavailable"))?;
        let result = channel.put(local_path, remote_path).await;
        forget_broken_channel(&mut guard, &result);
        let bytes = result?;
        tracing::debug!(
            "uploaded {} -> {remote_path} ({bytes} bytes)",
            local_path.display()
        );
        Ok(())
    }

    pub(crate) async fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<u64> {
        let mut guard = self.transfer_channel().await?;
        let channel = guard
            .as_ref()
            .ok_or_else(|| anyhow!("sftp channel unavailable"))?;
        let result = channel.get(remote_path, local_path).await;
        forget_broken_channel(&mut guard, &result);
        let bytes = result?;
        tracing::debug!(
            "downloaded {remote_path} -> {} ({bytes} bytes)",
            local_path.display()
        );
        Ok(bytes)
    }
}
