// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::errors::{AppResult, parse_error, remote_error};
use crate::app::ports::RemoteSession;
use crate::app::services::shell::sh_escape;
use crate::app::types::{ExecCapture, JobSpec, RemoteApiPaths, StatusMap};

/// Appended to the scheduler's base id to address the primary task.
pub const PRIMARY_TASK_SUFFIX: &str = ".0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedJob {
    pub directory: String,
    pub descriptor: String,
}

/// Wraps the four executables of the remote job API. Stateless; every call
/// runs exactly one remote command on the session it is given.
#[derive(Debug, Clone)]
pub struct RemoteJobApi {
    paths: RemoteApiPaths,
}

impl RemoteJobApi {
    pub fn new(paths: RemoteApiPaths) -> Self {
        Self { paths }
    }

    pub fn prepare_command(&self, job_name: &str, spec: &JobSpec) -> String {
        let mut cmd = format!(
            "{} --basedir {} --jobname {} --mem {} --vmem {} --walltime {} --jobtype {}",
            self.paths.prepare_job,
            sh_escape(&spec.remote_base_directory),
            sh_escape(job_name),
            sh_escape(&spec.mem),
            sh_escape(&spec.vmem),
            sh_escape(&spec.walltime),
            sh_escape(&spec.jobtype),
        );
        if let Some(account) = spec.account.as_deref().filter(|a| !a.is_empty()) {
            cmd.push_str(" --account ");
            cmd.push_str(&sh_escape(account));
        }
        for command in &spec.commands {
            cmd.push_str(" --cmd ");
            cmd.push_str(&sh_escape(command));
        }
        cmd
    }

    pub async fn prepare(
        &self,
        session: &dyn RemoteSession,
        job_name: &str,
        spec: &JobSpec,
    ) -> AppResult<PreparedJob> {
        let capture = session.run(&self.prepare_command(job_name, spec)).await?;
        ensure_success(&capture, "prepare job")?;
        parse_prepare_output(&capture.stdout_lossy())
    }

    /// Returns the primary-task id (`<base>.0`).
    pub async fn submit(&self, session: &dyn RemoteSession, descriptor: &str) -> AppResult<String> {
        let cmd = format!("{} {}", self.paths.submit_job, sh_escape(descriptor));
        let capture = session.run(&cmd).await?;
        ensure_success(&capture, "submit job")?;
        let base = capture.stdout_lossy().trim().to_string();
        if base.is_empty() || base.split_whitespace().count() != 1 {
            return Err(parse_error(format!(
                "unexpected output from submit_job: {:?}",
                base
            )));
        }
        Ok(format!("{base}{PRIMARY_TASK_SUFFIX}"))
    }

    pub async fn status_all(&self, session: &dyn RemoteSession) -> AppResult<StatusMap> {
        let capture = session.run(&self.paths.get_job_statuses).await?;
        ensure_success(&capture, "get job statuses")?;
        parse_status_output(&capture.stdout_lossy())
    }

    /// One remote call for the whole list. An empty list makes no call.
    pub async fn cancel(&self, session: &dyn RemoteSession, job_ids: &[String]) -> AppResult<()> {
        if job_ids.is_empty() {
            return Ok(());
        }
        let ids = job_ids
            .iter()
            .map(|id| sh_escape(id))
            .collect::<Vec<_>>()
            .join(" ");
        let capture = session
            .run(&format!("{} {}", self.paths.cancel_jobs, ids))
            .await?;
        ensure_success(&capture, "cancel jobs")
    }

    pub async fn remove_directory(
        &self,
        session: &dyn RemoteSession,
        remote_dir: &str,
    ) -> AppResult<()> {
        if remote_dir.trim().is_empty() || remote_dir.trim() == "/" {
            return Err(crate::app::errors::invalid_argument(format!(
                "refusing to remove remote directory {remote_dir:?}"
            )));
        }
        let capture = session
            .run(&format!("rm -rf {}", sh_escape(remote_dir)))
            .await?;
        ensure_success(&capture, "remove remote directory")
    }
}

fn ensure_success(capture: &ExecCapture, what: &str) -> AppResult<()> {
    if capture.exit_code == 0 {
        return Ok(());
    }
    let stderr = capture.stderr_lossy();
    let err = remote_error(format!(
        "failed to {what}: exit status {}",
        capture.exit_code
    ));
    Err(if stderr.trim().is_empty() {
        err
    } else {
        err.with_context(stderr.trim().to_string())
    })
}

/// `prepare_job` prints `<remote directory>,<descriptor>`.
pub fn parse_prepare_output(stdout: &str) -> AppResult<PreparedJob> {
    let line = stdout.trim();
    let mut parts = line.split(',');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(dir), Some(descriptor), None)
            if !dir.trim().is_empty() && !descriptor.trim().is_empty() =>
        {
            Ok(PreparedJob {
                directory: dir.trim().to_string(),
                descriptor: descriptor.trim().to_string(),
            })
        }
        _ => Err(parse_error(format!(
            "unexpected output from prepare_job: {line:?}"
        ))),
    }
}

/// After trimming the whole output, every line must be exactly
/// `<id> <status>`. A job the scheduler no longer reports is simply absent
/// from the map.
pub fn parse_status_output(stdout: &str) -> AppResult<StatusMap> {
    let mut statuses = StatusMap::new();
    let body = stdout.trim();
    if body.is_empty() {
        return Ok(statuses);
    }
    for line in body.lines().map(str::trim) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let [id, status] = tokens.as_slice() else {
            return Err(parse_error(format!(
                "unable to parse job status line: {line:?}"
            )));
        };
        statuses.insert((*id).to_string(), (*status).to_string());
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::errors::AppErrorKind;
    use crate::app::testing::{ScriptedTransport, exit_with, ok_stdout, test_api_paths};
    use crate::app::ports::TransportPort;

    fn spec() -> JobSpec {
        JobSpec {
            remote_base_directory: "/nesi/nobackup/proj".to_string(),
            commands: vec!["module load Python".to_string(), "python run.py".to_string()],
            mem: "2G".to_string(),
            vmem: "4G".to_string(),
            walltime: "01:00:00".to_string(),
            jobtype: "serial".to_string(),
            account: Some("nesi99999".to_string()),
        }
    }

    #[test]
    fn prepare_command_quotes_every_argument() {
        let api = RemoteJobApi::new(test_api_paths());
        let cmd = api.prepare_command("run 1", &spec());
        assert_eq!(
            cmd,
            "/api/prepare_job --basedir '/nesi/nobackup/proj' --jobname 'run 1' --mem '2G' \
             --vmem '4G' --walltime '01:00:00' --jobtype 'serial' --account 'nesi99999' \
             --cmd 'module load Python' --cmd 'python run.py'"
        );
    }

    #[test]
    fn prepare_command_omits_empty_account() {
        let api = RemoteJobApi::new(test_api_paths());
        let mut spec = spec();
        spec.account = Some(String::new());
        assert!(!api.prepare_command("j", &spec).contains("--account"));
        spec.account = None;
        assert!(!api.prepare_command("j", &spec).contains("--account"));
    }

    #[test]
    fn parses_prepare_output() {
        let prepared = parse_prepare_output("/remote/rjm/job_x1,/remote/rjm/job_x1/rjm_job.sl\n").unwrap();
        assert_eq!(prepared.directory, "/remote/rjm/job_x1");
        assert_eq!(prepared.descriptor, "/remote/rjm/job_x1/rjm_job.sl");
        assert!(parse_prepare_output("only-one-field").is_err());
        assert!(parse_prepare_output("a,b,c").is_err());
        assert!(parse_prepare_output(",b").is_err());
    }

    #[test]
    fn parses_status_lines() {
        let statuses = parse_status_output("\n12.0 RUNNING\n13.0 PENDING\n\n").unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses.get("12.0").map(String::as_str), Some("RUNNING"));
        assert!(parse_status_output("").unwrap().is_empty());
        assert!(parse_status_output(" \n\n").unwrap().is_empty());
    }

    #[test]
    fn blank_line_inside_status_output_is_a_parse_error() {
        let err = parse_status_output("12.0 RUNNING\n\n13.0 PENDING\n").unwrap_err();
        assert_eq!(err.code(), crate::app::errors::codes::PARSE_ERROR);
    }

    #[test]
    fn malformed_status_line_is_a_parse_error() {
        let err = parse_status_output("12.0 RUNNING extra\n").unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::RemoteCommand);
        assert!(parse_status_output("12.0\n").is_err());
    }

    #[tokio::test]
    async fn submit_appends_primary_task_suffix() {
        let transport = ScriptedTransport::new(|cmd| {
            assert_eq!(cmd, "/api/submit_job '/remote/job/rjm_job.sl'");
            Ok(ok_stdout("4242\n"))
        });
        let session = transport.open().await.unwrap();
        let api = RemoteJobApi::new(test_api_paths());
        let id = api.submit(session.as_ref(), "/remote/job/rjm_job.sl").await.unwrap();
        assert_eq!(id, "4242.0");
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_remote_error_with_stderr() {
        let transport = ScriptedTransport::new(|_| Ok(exit_with(2, "sbatch: error: invalid account")));
        let session = transport.open().await.unwrap();
        let api = RemoteJobApi::new(test_api_paths());
        let err = api.submit(session.as_ref(), "/d").await.unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::RemoteCommand);
        assert_eq!(err.context(), Some("sbatch: error: invalid account"));
    }

    #[tokio::test]
    async fn cancel_sends_one_call_and_skips_empty_lists() {
        let transport = ScriptedTransport::new(|_| Ok(ok_stdout("")));
        let session = transport.open().await.unwrap();
        let api = RemoteJobApi::new(test_api_paths());

        api.cancel(session.as_ref(), &[]).await.unwrap();
        assert!(transport.commands().is_empty());

        api.cancel(session.as_ref(), &["1.0".to_string(), "2.0".to_string()])
            .await
            .unwrap();
        assert_eq!(transport.commands(), vec!["/api/cancel_jobs '1.0' '2.0'"]);
    }

    #[tokio::test]
    async fn remove_directory_refuses_root() {
        let transport = ScriptedTransport::new(|_| Ok(ok_stdout("")));
        let session = transport.open().await.unwrap();
        let api = RemoteJobApi::new(test_api_paths());
        assert!(api.remove_directory(session.as_ref(), "/").await.is_err());
        api.remove_directory(session.as_ref(), "/remote/job").await.unwrap();
        assert_eq!(transport.commands(), vec!["rm -rf '/remote/job'"]);
    }
}
