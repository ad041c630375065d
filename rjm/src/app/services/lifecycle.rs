// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::app::errors::{AppResult, invalid_argument, state_corruption, transport_error};
use crate::app::ports::{JobStorePort, LocalFilesystemPort, RemoteSession, TransportPort};
use crate::app::services::manifest;
use crate::app::services::remote_api::RemoteJobApi;
use crate::app::services::retry::Retry;
use crate::app::types::{JobRecord, JobSpec, ManifestNames};

/// A session opened on first use. Jobs that need no remote work never
/// cause a connection (and never spend a one-time password).
pub struct SessionSlot<'t> {
    transport: &'t dyn TransportPort,
    session: Option<Box<dyn RemoteSession>>,
}

impl<'t> SessionSlot<'t> {
    pub fn new(transport: &'t dyn TransportPort) -> Self {
        Self {
            transport,
            session: None,
        }
    }

    pub async fn get(&mut self) -> AppResult<&dyn RemoteSession> {
        if self.session.is_none() {
            self.session = Some(self.transport.open().await?);
        }
        self.session
            .as_deref()
            .ok_or_else(|| transport_error("session unavailable"))
    }

    /// Whether a session was opened and is still connected.
    pub async fn is_alive(&self) -> bool {
        match &self.session {
            Some(session) => !session.is_closed().await,
            None => false,
        }
    }

    /// Drops a session that is no longer usable; the next `get` reconnects.
    pub async fn discard(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOut {
    AlreadyDone,
    Downloaded(usize),
}

/// Drives one job directory through prepare, upload, submit and download,
/// persisting the record after every step that changes remote state.
pub struct JobLifecycle {
    api: RemoteJobApi,
    records: Arc<dyn JobStorePort>,
    local_fs: Arc<dyn LocalFilesystemPort>,
    retry: Retry,
    manifests: ManifestNames,
}

impl JobLifecycle {
    pub fn new(
        api: RemoteJobApi,
        records: Arc<dyn JobStorePort>,
        local_fs: Arc<dyn LocalFilesystemPort>,
        retry: Retry,
        manifests: ManifestNames,
    ) -> Self {
        Self {
            api,
            records,
            local_fs,
            retry,
            manifests,
        }
    }

    /// Idempotent: a record that already carries a job id is returned as is.
    pub async fn submit(
        &self,
        slot: &mut SessionSlot<'_>,
        job_dir: &Path,
        spec: &JobSpec,
    ) -> AppResult<JobRecord> {
        let mut record = self.records.load(job_dir)?;
        if let Some(id) = &record.remote_job_id {
            tracing::info!(job_id = %id, dir = %job_dir.display(), "job already submitted");
            return Ok(record);
        }

        let session = slot.get().await?;
        let api = &self.api;

        let (remote_dir, descriptor) = match (
            record.remote_directory.clone(),
            record.remote_descriptor.clone(),
        ) {
            (None, _) => {
                let job_name = job_name(job_dir)?;
                let job_name = job_name.as_str();
                tracing::debug!(dir = %job_dir.display(), "creating remote job directory");
                let prepared = self
                    .retry
                    .run("prepare_job", move || api.prepare(session, job_name, spec))
                    .await?;
                record.remote_directory = Some(prepared.directory.clone());
                record.remote_descriptor = Some(prepared.descriptor.clone());
                self.records.save(job_dir, &record)?;
                tracing::debug!(remote_dir = %prepared.directory, "remote job directory created");
                (prepared.directory, prepared.descriptor)
            }
            (Some(dir), Some(descriptor)) => {
                tracing::info!(remote_dir = %dir, "resuming prepared job");
                (dir, descriptor)
            }
            (Some(dir), None) => {
                return Err(state_corruption(format!(
                    "job record in {} names remote directory {dir} but no job descriptor",
                    job_dir.display()
                )));
            }
        };

        let uploaded = self.stage_in(session, job_dir, &remote_dir).await?;
        tracing::debug!(files = uploaded, "input files staged in");

        // Not retried: a lost reply would leave a duplicate job on the cluster.
        let job_id = api.submit(session, &descriptor).await?;
        record.remote_job_id = Some(job_id.clone());
        self.records.save(job_dir, &record)?;
        tracing::info!(job_id = %job_id, dir = %job_dir.display(), "job submitted");
        Ok(record)
    }

    /// Uploads every file of the upload manifest. No manifest means no inputs.
    pub async fn stage_in(
        &self,
        session: &dyn RemoteSession,
        job_dir: &Path,
        remote_dir: &str,
    ) -> AppResult<usize> {
        let entries = self.read_manifest(job_dir, &self.manifests.uploads).await?;
        for entry in &entries {
            let local = manifest::resolve_local(job_dir, entry);
            let file_name = file_name_of(&local)?;
            let remote = manifest::join_remote(remote_dir, &file_name);
            tracing::debug!(local = %local.display(), remote = %remote, "uploading");
            let (local, remote) = (local.as_path(), remote.as_str());
            self.retry
                .run("upload", move || session.upload(local, remote))
                .await?;
        }
        Ok(entries.len())
    }

    /// Downloads every file of the download manifest into the job directory.
    ///
    /// Files land under a hidden temporary name and are renamed once
    /// complete. `download_done` is persisted only after all of them made it.
    pub async fn stage_out(&self, slot: &mut SessionSlot<'_>, job_dir: &Path) -> AppResult<StageOut> {
        let mut record = self.records.load(job_dir)?;
        if record.download_done {
            return Ok(StageOut::AlreadyDone);
        }
        let remote_dir = record.remote_directory.clone().ok_or_else(|| {
            state_corruption(format!(
                "job record in {} has no remote directory",
                job_dir.display()
            ))
        })?;

        let entries = self
            .read_manifest(job_dir, &self.manifests.downloads)
            .await?;
        if !entries.is_empty() {
            let session = slot.get().await?;
            for entry in &entries {
                self.download_one(session, job_dir, &remote_dir, entry)
                    .await?;
            }
        }

        record.download_done = true;
        self.records.save(job_dir, &record)?;
        Ok(StageOut::Downloaded(entries.len()))
    }

    async fn download_one(
        &self,
        session: &dyn RemoteSession,
        job_dir: &Path,
        remote_dir: &str,
        entry: &str,
    ) -> AppResult<()> {
        let file_name = file_name_of(Path::new(entry))?;
        let remote = manifest::join_remote(remote_dir, entry);
        let target = job_dir.join(&file_name);
        let partial = job_dir.join(format!(".{file_name}.part"));
        tracing::debug!(remote = %remote, local = %target.display(), "downloading");

        let (remote_ref, partial_ref) = (remote.as_str(), partial.as_path());
        let result = self
            .retry
            .run("download", move || session.download(remote_ref, partial_ref))
            .await;
        if let Err(err) = result {
            if let Err(cleanup) = self.local_fs.remove_file(&partial).await {
                tracing::debug!("leaving partial download {}: {cleanup}", partial.display());
            }
            return Err(err);
        }
        self.local_fs.rename(&partial, &target).await
    }

    async fn read_manifest(&self, job_dir: &Path, name: &str) -> AppResult<Vec<String>> {
        let path = job_dir.join(name);
        let (fs, path_ref) = (self.local_fs.as_ref(), path.as_path());
        let content = self
            .retry
            .run("read manifest", move || fs.read_optional(path_ref))
            .await?;
        Ok(content.as_deref().map(manifest::parse_lines).unwrap_or_default())
    }
}

/// Remote job names are the local directory's base name.
fn job_name(job_dir: &Path) -> AppResult<String> {
    file_name_of(job_dir)
}

fn file_name_of(path: &Path) -> AppResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| invalid_argument(format!("{} has no usable file name", path.display())))
}

/// Resolves the configured job-directory list into paths.
pub fn job_dirs_from_list(content: &str) -> Vec<PathBuf> {
    manifest::parse_lines(content)
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::fs::{LocalFilesystem, TomlJobStore};
    use crate::app::errors::{AppErrorKind, remote_error};
    use crate::app::testing::{
        FakeClock, ScriptedTransport, ok_stdout, quick_retry, test_api_paths, test_manifests,
    };
    use std::sync::atomic::{AtomicBool, Ordering};

    fn spec() -> JobSpec {
        JobSpec {
            remote_base_directory: "/remote/base".to_string(),
            commands: vec!["./run.sh".to_string()],
            mem: "1G".to_string(),
            vmem: "1G".to_string(),
            walltime: "00:10:00".to_string(),
            jobtype: "serial".to_string(),
            account: None,
        }
    }

    fn cluster() -> Arc<ScriptedTransport> {
        Arc::new(ScriptedTransport::new(|cmd| {
            if cmd.starts_with("/api/prepare_job") {
                Ok(ok_stdout("/remote/base/job1,/remote/base/job1/rjm_job.sl\n"))
            } else if cmd.starts_with("/api/submit_job") {
                Ok(ok_stdout("777\n"))
            } else {
                Err(remote_error(format!("unexpected command {cmd}")))
            }
        }))
    }

    fn lifecycle_with(records: Arc<dyn JobStorePort>) -> JobLifecycle {
        let clock = Arc::new(FakeClock::at_unix(1_700_000_000));
        JobLifecycle::new(
            RemoteJobApi::new(test_api_paths()),
            records,
            Arc::new(LocalFilesystem),
            quick_retry(clock),
            test_manifests(),
        )
    }

    fn lifecycle() -> JobLifecycle {
        lifecycle_with(Arc::new(TomlJobStore::default()))
    }

    fn job_dir(root: &tempfile::TempDir) -> PathBuf {
        let dir = root.path().join("job1");
        std::fs::create_dir(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn fresh_job_is_prepared_uploaded_and_submitted() {
        let root = tempfile::tempdir().unwrap();
        let dir = job_dir(&root);
        std::fs::write(dir.join("input.dat"), b"42").unwrap();
        std::fs::write(dir.join("rjm_uploads.txt"), "input.dat\n\n").unwrap();

        let transport = cluster();
        let engine = lifecycle();
        let mut slot = SessionSlot::new(transport.as_ref());
        let record = engine.submit(&mut slot, &dir, &spec()).await.unwrap();

        assert_eq!(record.remote_job_id.as_deref(), Some("777.0"));
        assert_eq!(record.remote_directory.as_deref(), Some("/remote/base/job1"));
        assert_eq!(transport.uploads(), vec!["/remote/base/job1/input.dat"]);
        assert_eq!(transport.remote_file("/remote/base/job1/input.dat").unwrap(), b"42");
        assert!(transport.commands()[0].contains("--jobname 'job1'"));

        let stored = TomlJobStore::default().load(&dir).unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn submitted_job_makes_no_remote_calls() {
        let root = tempfile::tempdir().unwrap();
        let dir = job_dir(&root);
        let store = TomlJobStore::default();
        store
            .save(
                &dir,
                &JobRecord {
                    remote_job_id: Some("5.0".to_string()),
                    remote_directory: Some("/remote/base/job1".to_string()),
                    remote_descriptor: Some("/remote/base/job1/rjm_job.sl".to_string()),
                    download_done: false,
                },
            )
            .unwrap();

        let transport = cluster();
        let mut slot = SessionSlot::new(transport.as_ref());
        let record = lifecycle().submit(&mut slot, &dir, &spec()).await.unwrap();
        assert_eq!(record.remote_job_id.as_deref(), Some("5.0"));
        assert_eq!(transport.opens(), 0);
        assert!(!slot.is_alive().await);
    }

    #[tokio::test]
    async fn prepared_job_resumes_at_upload() {
        let root = tempfile::tempdir().unwrap();
        let dir = job_dir(&root);
        TomlJobStore::default()
            .save(
                &dir,
                &JobRecord {
                    remote_directory: Some("/remote/base/job1".to_string()),
                    remote_descriptor: Some("/remote/base/job1/rjm_job.sl".to_string()),
                    ..JobRecord::default()
                },
            )
            .unwrap();

        let transport = cluster();
        let mut slot = SessionSlot::new(transport.as_ref());
        let record = lifecycle().submit(&mut slot, &dir, &spec()).await.unwrap();
        assert_eq!(record.remote_job_id.as_deref(), Some("777.0"));
        assert_eq!(
            transport.commands(),
            vec!["/api/submit_job '/remote/base/job1/rjm_job.sl'"]
        );
    }

    #[tokio::test]
    async fn missing_descriptor_is_state_corruption() {
        let root = tempfile::tempdir().unwrap();
        let dir = job_dir(&root);
        TomlJobStore::default()
            .save(
                &dir,
                &JobRecord {
                    remote_directory: Some("/remote/base/job1".to_string()),
                    ..JobRecord::default()
                },
            )
            .unwrap();
        let transport = cluster();
        let mut slot = SessionSlot::new(transport.as_ref());
        let err = lifecycle().submit(&mut slot, &dir, &spec()).await.unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::StateCorruption);
        assert!(transport.commands().is_empty());
    }

    #[tokio::test]
    async fn failed_upload_keeps_remote_directory_and_no_id() {
        let root = tempfile::tempdir().unwrap();
        let dir = job_dir(&root);
        std::fs::write(dir.join("rjm_uploads.txt"), "missing.dat\n").unwrap();

        let transport = cluster();
        let mut slot = SessionSlot::new(transport.as_ref());
        let err = lifecycle().submit(&mut slot, &dir, &spec()).await.unwrap_err();
        assert_eq!(err.kind(), AppErrorKind::Local);

        let stored = TomlJobStore::default().load(&dir).unwrap();
        assert_eq!(stored.remote_directory.as_deref(), Some("/remote/base/job1"));
        assert!(stored.remote_job_id.is_none());
        assert!(!transport.commands().iter().any(|c| c.starts_with("/api/submit_job")));
    }

    fn submitted_record() -> JobRecord {
        JobRecord {
            remote_job_id: Some("777.0".to_string()),
            remote_directory: Some("/remote/base/job1".to_string()),
            remote_descriptor: Some("/remote/base/job1/rjm_job.sl".to_string()),
            download_done: false,
        }
    }

    #[tokio::test]
    async fn stage_out_downloads_and_marks_done() {
        let root = tempfile::tempdir().unwrap();
        let dir = job_dir(&root);
        TomlJobStore::default().save(&dir, &submitted_record()).unwrap();
        std::fs::write(dir.join("rjm_downloads.txt"), "out.txt\nlogs/err.txt\n").unwrap();

        let transport = cluster();
        transport.put_remote_file("/remote/base/job1/out.txt", b"result");
        transport.put_remote_file("/remote/base/job1/logs/err.txt", b"");

        let mut slot = SessionSlot::new(transport.as_ref());
        let outcome = lifecycle().stage_out(&mut slot, &dir).await.unwrap();
        assert_eq!(outcome, StageOut::Downloaded(2));
        assert_eq!(std::fs::read(dir.join("out.txt")).unwrap(), b"result");
        assert!(dir.join("err.txt").exists());
        assert!(!dir.join(".out.txt.part").exists());
        assert!(TomlJobStore::default().load(&dir).unwrap().download_done);

        let mut slot = SessionSlot::new(transport.as_ref());
        let again = lifecycle().stage_out(&mut slot, &dir).await.unwrap();
        assert_eq!(again, StageOut::AlreadyDone);
        assert_eq!(transport.downloads().len(), 2);
    }

    #[tokio::test]
    async fn failed_download_leaves_download_done_unset() {
        let root = tempfile::tempdir().unwrap();
        let dir = job_dir(&root);
        TomlJobStore::default().save(&dir, &submitted_record()).unwrap();
        std::fs::write(dir.join("rjm_downloads.txt"), "a.txt\nb.txt\n").unwrap();

        let transport = cluster();
        transport.put_remote_file("/remote/base/job1/a.txt", b"a");
        transport.put_remote_file("/remote/base/job1/b.txt", b"b");
        transport.fail_download("/remote/base/job1/b.txt", 10);

        let mut slot = SessionSlot::new(transport.as_ref());
        assert!(lifecycle().stage_out(&mut slot, &dir).await.is_err());
        assert!(!TomlJobStore::default().load(&dir).unwrap().download_done);
        assert!(dir.join("a.txt").exists());
        assert!(!dir.join(".b.txt.part").exists());
    }

    #[tokio::test]
    async fn transient_download_failure_is_retried() {
        let root = tempfile::tempdir().unwrap();
        let dir = job_dir(&root);
        TomlJobStore::default().save(&dir, &submitted_record()).unwrap();
        std::fs::write(dir.join("rjm_downloads.txt"), "a.txt\n").unwrap();

        let transport = cluster();
        transport.put_remote_file("/remote/base/job1/a.txt", b"a");
        transport.fail_download("/remote/base/job1/a.txt", 2);

        let mut slot = SessionSlot::new(transport.as_ref());
        let outcome = lifecycle().stage_out(&mut slot, &dir).await.unwrap();
        assert_eq!(outcome, StageOut::Downloaded(1));
    }

    /// Fails the first save that sets `download_done`, as if the process died there.
    struct CrashBeforeDone {
        inner: TomlJobStore,
        crashed: AtomicBool,
    }

    impl JobStorePort for CrashBeforeDone {
        fn load(&self, job_dir: &Path) -> AppResult<JobRecord> {
            self.inner.load(job_dir)
        }

        fn save(&self, job_dir: &Path, record: &JobRecord) -> AppResult<()> {
            if record.download_done && !self.crashed.swap(true, Ordering::SeqCst) {
                return Err(crate::app::errors::local_error("simulated crash"));
            }
            self.inner.save(job_dir, record)
        }
    }

    #[tokio::test]
    async fn crash_before_marking_done_repeats_the_download() {
        let root = tempfile::tempdir().unwrap();
        let dir = job_dir(&root);
        TomlJobStore::default().save(&dir, &submitted_record()).unwrap();
        std::fs::write(dir.join("rjm_downloads.txt"), "out.txt\n").unwrap();

        let transport = cluster();
        transport.put_remote_file("/remote/base/job1/out.txt", b"v1");
        let engine = lifecycle_with(Arc::new(CrashBeforeDone {
            inner: TomlJobStore::default(),
            crashed: AtomicBool::new(false),
        }));

        let mut slot = SessionSlot::new(transport.as_ref());
        assert!(engine.stage_out(&mut slot, &dir).await.is_err());
        assert!(!TomlJobStore::default().load(&dir).unwrap().download_done);

        let mut slot = SessionSlot::new(transport.as_ref());
        assert_eq!(
            engine.stage_out(&mut slot, &dir).await.unwrap(),
            StageOut::Downloaded(1)
        );
        assert_eq!(transport.downloads().len(), 2);
        assert!(TomlJobStore::default().load(&dir).unwrap().download_done);
    }

    #[tokio::test]
    async fn no_download_manifest_marks_done_without_connecting() {
        let root = tempfile::tempdir().unwrap();
        let dir = job_dir(&root);
        TomlJobStore::default().save(&dir, &submitted_record()).unwrap();

        let transport = cluster();
        let mut slot = SessionSlot::new(transport.as_ref());
        let outcome = lifecycle().stage_out(&mut slot, &dir).await.unwrap();
        assert_eq!(outcome, StageOut::Downloaded(0));
        assert_eq!(transport.opens(), 0);
    }

    #[test]
    fn job_dir_list_skips_blank_lines() {
        let dirs = job_dirs_from_list("/a/job1\n\n  \n/a/job2\n");
        assert_eq!(dirs, vec![PathBuf::from("/a/job1"), PathBuf::from("/a/job2")]);
    }
}
