// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Login material for both hops. Loaded once per process run.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub otp_seed: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("otp_seed", &"<redacted>")
            .finish()
    }
}

/// Where the lander and the login node live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshEndpoints {
    pub lander_host: String,
    pub login_host: String,
    pub port: u16,
    pub known_hosts_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ExecCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecCapture {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Durable per-job-directory progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobRecord {
    pub remote_job_id: Option<String>,
    pub remote_directory: Option<String>,
    pub remote_descriptor: Option<String>,
    pub download_done: bool,
}

/// Lifecycle stage derived from a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    New,
    Prepared,
    Submitted,
    Finished,
}

impl JobRecord {
    pub fn stage(&self) -> JobStage {
        match (&self.remote_directory, &self.remote_job_id) {
            (_, Some(_)) if self.download_done => JobStage::Finished,
            (_, Some(_)) => JobStage::Submitted,
            (Some(_), None) => JobStage::Prepared,
            (None, None) => JobStage::New,
        }
    }
}

/// Parameters passed to the remote `prepare_job` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub remote_base_directory: String,
    pub commands: Vec<String>,
    pub mem: String,
    pub vmem: String,
    pub walltime: String,
    pub jobtype: String,
    pub account: Option<String>,
}

/// Remote job id to scheduler status token.
pub type StatusMap = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_wait: Duration::from_millis(500),
            max_wait: Duration::from_secs(5),
        }
    }
}

/// Absolute paths of the four remote API executables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteApiPaths {
    pub prepare_job: String,
    pub submit_job: String,
    pub get_job_statuses: String,
    pub cancel_jobs: String,
}

/// File names, relative to a job directory, of the transfer manifests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestNames {
    pub uploads: String,
    pub downloads: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_redacts_secrets() {
        let creds = Credentials {
            username: "alice".to_string(),
            password: "hunter2".to_string(),
            otp_seed: "JBSWY3DPEHPK3PXP".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("JBSWY3DPEHPK3PXP"));
    }

    #[test]
    fn stage_follows_committed_fields() {
        let mut record = JobRecord::default();
        assert_eq!(record.stage(), JobStage::New);
        record.remote_directory = Some("/remote/job".to_string());
        assert_eq!(record.stage(), JobStage::Prepared);
        record.remote_job_id = Some("42.0".to_string());
        assert_eq!(record.stage(), JobStage::Submitted);
        record.download_done = true;
        assert_eq!(record.stage(), JobStage::Finished);
    }
}
