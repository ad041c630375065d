// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::app::errors::{
    AppError, AppErrorKind, AppResult, codes, invalid_argument, local_error,
};
use crate::app::ports::{JobStorePort, LocalFilesystemPort, TransportPort};
use crate::app::services::lifecycle::{self, JobLifecycle, SessionSlot, StageOut};
use crate::app::services::remote_api::RemoteJobApi;
use crate::app::services::retry::Retry;
use crate::app::types::{JobRecord, JobSpec, JobStage, ManifestNames, StatusMap};

#[derive(Debug)]
pub struct JobFailure {
    pub job_dir: PathBuf,
    pub error: AppError,
}

/// Outcome of a batch operation over `total` job directories.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub total: usize,
    pub failures: Vec<JobFailure>,
}

impl BatchReport {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            failures: Vec::new(),
        }
    }

    pub fn fail(&mut self, job_dir: PathBuf, error: AppError) {
        self.failures.push(JobFailure { job_dir, error });
    }

    pub fn succeeded(&self) -> usize {
        self.total.saturating_sub(self.failures.len())
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Clone)]
pub struct UseCases {
    pub(crate) transport: Arc<dyn TransportPort>,
    pub(crate) records: Arc<dyn JobStorePort>,
    pub(crate) local_fs: Arc<dyn LocalFilesystemPort>,
    pub(crate) lifecycle: Arc<JobLifecycle>,
    pub(crate) api: RemoteJobApi,
    pub(crate) retry: Retry,
    pub(crate) workers: usize,
}

impl UseCases {
    pub fn new(
        transport: Arc<dyn TransportPort>,
        records: Arc<dyn JobStorePort>,
        local_fs: Arc<dyn LocalFilesystemPort>,
        api: RemoteJobApi,
        retry: Retry,
        manifests: ManifestNames,
        workers: usize,
    ) -> Self {
        let lifecycle = Arc::new(JobLifecycle::new(
            api.clone(),
            records.clone(),
            local_fs.clone(),
            retry.clone(),
            manifests,
        ));
        Self {
            transport,
            records,
            local_fs,
            lifecycle,
            api,
            retry,
            workers: workers.max(1),
        }
    }

    /// Reads the list of job directories, one per line.
    pub async fn load_job_dirs(&self, list_file: &Path) -> AppResult<Vec<PathBuf>> {
        let fs = self.local_fs.as_ref();
        let content = self
            .retry
            .run("read job directory list", move || fs.read_to_string(list_file))
            .await?;
        let dirs = lifecycle::job_dirs_from_list(&content);
        if dirs.is_empty() {
            return Err(invalid_argument(format!(
                "{} lists no job directories",
                list_file.display()
            )));
        }
        Ok(dirs)
    }

    /// Opens a session on both hops and closes it again.
    pub async fn authenticate(&self) -> AppResult<String> {
        let session = self.transport.open().await?;
        let result = session.run("hostname").await;
        session.close().await;
        let capture = result?;
        Ok(capture.stdout_lossy().trim().to_string())
    }

    pub async fn status(&self) -> AppResult<StatusMap> {
        let session = self.transport.open().await?;
        let api = &self.api;
        let session_ref = session.as_ref();
        let result = self
            .retry
            .run("get_job_statuses", move || api.status_all(session_ref))
            .await;
        session.close().await;
        result
    }

    /// Submits every job directory. Failures are collected per directory and
    /// never abort the batch, except an authentication failure, which stops
    /// further connection attempts.
    pub async fn submit_many(&self, job_dirs: Vec<PathBuf>, spec: JobSpec) -> BatchReport {
        let mut report = BatchReport::new(job_dirs.len());
        if job_dirs.is_empty() {
            return report;
        }
        let workers = self.workers.min(job_dirs.len());
        tracing::info!(jobs = job_dirs.len(), workers, "submitting jobs");

        let queue = Arc::new(Mutex::new(job_dirs.iter().cloned().collect::<VecDeque<_>>()));
        let spec = Arc::new(spec);
        let auth_failure: Arc<Mutex<Option<AppError>>> = Arc::new(Mutex::new(None));
        let (tx, mut rx) = mpsc::unbounded_channel::<(PathBuf, AppResult<JobRecord>)>();

        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            let this = self.clone();
            let queue = queue.clone();
            let spec = spec.clone();
            let auth_failure = auth_failure.clone();
            let tx = tx.clone();
            tasks.spawn(async move {
                this.submit_worker(worker, queue, spec, auth_failure, tx)
                    .await
            });
        }
        drop(tx);

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::error!("submit worker stopped unexpectedly: {err}");
            }
        }

        let mut seen = HashSet::new();
        while let Some((job_dir, result)) = rx.recv().await {
            seen.insert(job_dir.clone());
            if let Err(err) = result {
                report.fail(job_dir, err);
            }
        }
        for job_dir in job_dirs {
            if !seen.contains(&job_dir) {
                report.fail(job_dir, local_error("job was not processed"));
            }
        }
        report
    }

    async fn submit_worker(
        &self,
        worker: usize,
        queue: Arc<Mutex<VecDeque<PathBuf>>>,
        spec: Arc<JobSpec>,
        auth_failure: Arc<Mutex<Option<AppError>>>,
        tx: mpsc::UnboundedSender<(PathBuf, AppResult<JobRecord>)>,
    ) {
        let mut slot = SessionSlot::new(self.transport.as_ref());
        loop {
            let next = queue.lock().ok().and_then(|mut q| q.pop_front());
            let Some(job_dir) = next else {
                break;
            };

            let aborted = auth_failure.lock().ok().and_then(|guard| guard.clone());
            let result = match aborted {
                Some(err) => Err(err),
                None => self.submit_one(&mut slot, &job_dir, &spec).await,
            };

            if let Err(err) = &result {
                tracing::error!(
                    worker,
                    dir = %job_dir.display(),
                    code = err.code(),
                    "problem submitting job, skipping: {err}"
                );
                match err.kind() {
                    AppErrorKind::Auth => {
                        if let Ok(mut guard) = auth_failure.lock() {
                            guard.get_or_insert_with(|| err.clone());
                        }
                        slot.discard().await;
                    }
                    AppErrorKind::Transport | AppErrorKind::Network => slot.discard().await,
                    _ => {}
                }
            }
            if tx.send((job_dir, result)).is_err() {
                break;
            }
        }
        slot.discard().await;
    }

    async fn submit_one(
        &self,
        slot: &mut SessionSlot<'_>,
        job_dir: &Path,
        spec: &JobSpec,
    ) -> AppResult<JobRecord> {
        if !self.local_fs.is_dir(job_dir).await {
            return Err(invalid_argument(format!(
                "local job directory does not exist: {}",
                job_dir.display()
            )));
        }
        tracing::info!(dir = %job_dir.display(), "submitting job");
        self.lifecycle.submit(slot, job_dir, spec).await
    }

    /// Polls the scheduler until every listed job has left its queue, staging
    /// out results as jobs finish. A session is opened per poll cycle.
    pub async fn wait_many(
        &self,
        job_dirs: Vec<PathBuf>,
        poll_interval: Duration,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> AppResult<BatchReport> {
        let mut report = BatchReport::new(job_dirs.len());
        let mut pending: BTreeMap<String, PathBuf> = BTreeMap::new();
        for job_dir in job_dirs {
            let record = match self.records.load(&job_dir) {
                Ok(record) => record,
                Err(err) => {
                    tracing::warn!(dir = %job_dir.display(), "unreadable job record, skipping: {err}");
                    report.fail(job_dir, err);
                    continue;
                }
            };
            match (record.stage(), record.remote_job_id) {
                (JobStage::Submitted, Some(id)) => {
                    if let Some(first) = pending.get(&id) {
                        let err = invalid_argument(format!(
                            "job id {id} is also recorded in {}",
                            first.display()
                        ));
                        tracing::warn!(dir = %job_dir.display(), "{err}, skipping");
                        report.fail(job_dir, err);
                    } else {
                        pending.insert(id, job_dir);
                    }
                }
                (JobStage::Finished, id) => {
                    tracing::debug!(job_id = ?id, "results already downloaded");
                }
                (stage, _) => {
                    tracing::warn!(dir = %job_dir.display(), ?stage, "job has not been submitted, skipping");
                    report.fail(job_dir, invalid_argument("job has not been submitted"));
                }
            }
        }
        if pending.is_empty() {
            tracing::info!("no jobs to wait for");
            return Ok(report);
        }

        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancelled(&mut cancel_rx) => return Err(cancelled_error()),
            }
            tracing::info!(pending = pending.len(), "checking job statuses");
            let outcome = self.poll_cycle(&mut pending, &mut report).await;
            // A full interval separates the end of one cycle from the next.
            ticker.reset();
            match outcome {
                Ok(()) if pending.is_empty() => break,
                Ok(()) => {}
                // Logging in again would only spend more one-time passwords.
                Err(err) if err.kind() == AppErrorKind::Auth => return Err(err),
                Err(err) => tracing::warn!(
                    code = err.code(),
                    "status poll failed, will try again: {err}"
                ),
            }
        }
        tracing::info!("all jobs finished");
        Ok(report)
    }

    async fn poll_cycle(
        &self,
        pending: &mut BTreeMap<String, PathBuf>,
        report: &mut BatchReport,
    ) -> AppResult<()> {
        let mut slot = SessionSlot::new(self.transport.as_ref());
        let result = self.poll_with(&mut slot, pending, report).await;
        slot.discard().await;
        result
    }

    async fn poll_with(
        &self,
        slot: &mut SessionSlot<'_>,
        pending: &mut BTreeMap<String, PathBuf>,
        report: &mut BatchReport,
    ) -> AppResult<()> {
        let statuses = {
            let session = slot.get().await?;
            let api = &self.api;
            self.retry
                .run("get_job_statuses", move || api.status_all(session))
                .await?
        };
        let finished: Vec<String> = pending
            .keys()
            .filter(|id| !statuses.contains_key(*id))
            .cloned()
            .collect();

        for id in finished {
            let Some(job_dir) = pending.get(&id).cloned() else {
                continue;
            };
            tracing::info!(job_id = %id, "job finished, downloading results");
            let outcome = self.lifecycle.stage_out(slot, &job_dir).await;
            let session_lost = match &outcome {
                Err(err) if err.kind() == AppErrorKind::Transport => !slot.is_alive().await,
                _ => false,
            };
            match outcome {
                Ok(StageOut::Downloaded(files)) => {
                    tracing::info!(job_id = %id, files, "results downloaded");
                    pending.remove(&id);
                }
                Ok(StageOut::AlreadyDone) => {
                    pending.remove(&id);
                }
                Err(err) if err.kind() == AppErrorKind::Auth => return Err(err),
                Err(err) if session_lost => {
                    // Session is gone; the remaining jobs are retried next cycle.
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        job_id = %id,
                        dir = %job_dir.display(),
                        "failed to download results: {err}"
                    );
                    pending.remove(&id);
                    report.fail(job_dir, err);
                }
            }
        }
        Ok(())
    }

    /// Cancels the listed jobs with a single remote call; with `wait`, polls
    /// until the scheduler no longer reports any of them.
    pub async fn cancel_many(
        &self,
        job_dirs: Vec<PathBuf>,
        poll_interval: Duration,
        wait: bool,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> AppResult<BatchReport> {
        let mut report = BatchReport::new(job_dirs.len());
        let mut ids = Vec::new();
        for job_dir in job_dirs {
            match self.records.load(&job_dir) {
                Ok(record) => match (record.stage(), record.remote_job_id) {
                    (JobStage::Submitted, Some(id)) => ids.push(id),
                    (JobStage::Finished, id) => {
                        tracing::info!(job_id = ?id, "job already finished, nothing to cancel");
                    }
                    _ => report.fail(job_dir, invalid_argument("job has not been submitted")),
                },
                Err(err) => {
                    tracing::warn!(dir = %job_dir.display(), "unreadable job record, skipping: {err}");
                    report.fail(job_dir, err);
                }
            }
        }
        if ids.is_empty() {
            tracing::info!("no jobs to cancel");
            return Ok(report);
        }

        {
            let session = self.transport.open().await?;
            let result = self.api.cancel(session.as_ref(), &ids).await;
            session.close().await;
            result?;
        }
        tracing::info!(jobs = ids.len(), "cancellation requested");
        if !wait {
            return Ok(report);
        }

        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The cancel call just went out; give the scheduler one interval.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancelled(&mut cancel_rx) => return Err(cancelled_error()),
            }
            let outcome = self.status().await;
            ticker.reset();
            match outcome {
                Ok(statuses) => {
                    let remaining = ids.iter().filter(|id| statuses.contains_key(*id)).count();
                    if remaining == 0 {
                        break;
                    }
                    tracing::info!(remaining, "waiting for cancelled jobs to leave the queue");
                }
                Err(err) if err.kind() == AppErrorKind::Auth => return Err(err),
                Err(err) => tracing::warn!(
                    code = err.code(),
                    "status poll failed, will try again: {err}"
                ),
            }
        }
        Ok(report)
    }

    /// Removes the remote directories of the listed jobs.
    pub async fn clean_many(&self, job_dirs: Vec<PathBuf>) -> AppResult<BatchReport> {
        let mut report = BatchReport::new(job_dirs.len());
        let mut targets = Vec::new();
        for job_dir in job_dirs {
            match self.records.load(&job_dir) {
                Ok(JobRecord {
                    remote_directory: Some(remote_dir),
                    ..
                }) => targets.push((job_dir, remote_dir)),
                Ok(_) => tracing::info!(dir = %job_dir.display(), "no remote directory to remove"),
                Err(err) => report.fail(job_dir, err),
            }
        }
        if targets.is_empty() {
            return Ok(report);
        }

        let session = self.transport.open().await?;
        let api = &self.api;
        for (job_dir, remote_dir) in targets {
            let (session_ref, dir_ref) = (session.as_ref(), remote_dir.as_str());
            let result = self
                .retry
                .run("remove remote directory", move || {
                    api.remove_directory(session_ref, dir_ref)
                })
                .await;
            match result {
                Ok(()) => tracing::info!(remote_dir = %remote_dir, "removed remote directory"),
                Err(err) => {
                    tracing::warn!(remote_dir = %remote_dir, "failed to remove remote directory: {err}");
                    let stop = err.kind() == AppErrorKind::Transport;
                    report.fail(job_dir, err);
                    if stop {
                        break;
                    }
                }
            }
        }
        session.close().await;
        Ok(report)
    }
}

/// Resolves once cancellation is requested; never if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn cancelled_error() -> AppError {
    AppError::with_message(AppErrorKind::Cancelled, codes::CANCELED, "interrupted")
}
