// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! In-memory port implementations shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::app::errors::{AppError, AppResult, local_error, remote_error, transport_error};
use crate::app::ports::{ClockPort, RemoteSession, SecretStorePort, TransportPort};
use crate::app::services::retry::Retry;
use crate::app::types::{ExecCapture, ManifestNames, RemoteApiPaths, RetryPolicy};

/// Virtual clock: `sleep` records the duration and moves time forward.
pub struct FakeClock {
    now: Mutex<OffsetDateTime>,
    sleeps: Mutex<Vec<Duration>>,
}

impl FakeClock {
    pub fn at_unix(unix: i64) -> Self {
        Self {
            now: Mutex::new(OffsetDateTime::from_unix_timestamp(unix).unwrap()),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClockPort for FakeClock {
    fn now_utc(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        *self.now.lock().unwrap() += duration;
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
pub struct MemorySecretStore {
    values: Mutex<HashMap<String, String>>,
}

impl SecretStorePort for MemorySecretStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> AppResult<()> {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

type CommandHandler = dyn Fn(&str) -> AppResult<ExecCapture> + Send + Sync;

struct DownloadFault {
    remaining: usize,
    error: AppError,
    sever: bool,
}

struct ScriptState {
    handler: Box<CommandHandler>,
    commands: Mutex<Vec<String>>,
    remote_files: Mutex<HashMap<String, Vec<u8>>>,
    uploads: Mutex<Vec<String>>,
    downloads: Mutex<Vec<String>>,
    failing_downloads: Mutex<HashMap<String, DownloadFault>>,
    open_errors: Mutex<VecDeque<AppError>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

/// Transport whose sessions answer commands through a closure and keep
/// uploaded files in memory.
pub struct ScriptedTransport {
    state: Arc<ScriptState>,
}

impl ScriptedTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str) -> AppResult<ExecCapture> + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(ScriptState {
                handler: Box::new(handler),
                commands: Mutex::new(Vec::new()),
                remote_files: Mutex::new(HashMap::new()),
                uploads: Mutex::new(Vec::new()),
                downloads: Mutex::new(Vec::new()),
                failing_downloads: Mutex::new(HashMap::new()),
                open_errors: Mutex::new(VecDeque::new()),
                opens: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn put_remote_file(&self, path: &str, contents: &[u8]) {
        self.state
            .remote_files
            .lock()
            .unwrap()
            .insert(path.to_string(), contents.to_vec());
    }

    pub fn remote_file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.remote_files.lock().unwrap().get(path).cloned()
    }

    /// The next `times` downloads of `path` fail with a remote error.
    pub fn fail_download(&self, path: &str, times: usize) {
        self.fail_download_with(path, times, remote_error(format!("simulated failure for {path}")));
    }

    /// The next `times` downloads of `path` fail with `error`; the session stays up.
    pub fn fail_download_with(&self, path: &str, times: usize, error: AppError) {
        self.add_fault(path, times, error, false);
    }

    /// The next download of `path` drops the connection.
    pub fn sever_on_download(&self, path: &str) {
        self.add_fault(path, 1, transport_error("connection reset"), true);
    }

    fn add_fault(&self, path: &str, remaining: usize, error: AppError, sever: bool) {
        self.state.failing_downloads.lock().unwrap().insert(
            path.to_string(),
            DownloadFault {
                remaining,
                error,
                sever,
            },
        );
    }

    pub fn fail_next_open(&self, err: AppError) {
        self.state.open_errors.lock().unwrap().push_back(err);
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.state.uploads.lock().unwrap().clone()
    }

    pub fn downloads(&self) -> Vec<String> {
        self.state.downloads.lock().unwrap().clone()
    }

    pub fn opens(&self) -> usize {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportPort for ScriptedTransport {
    async fn open(&self) -> AppResult<Box<dyn RemoteSession>> {
        self.state.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.state.open_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(Box::new(ScriptedSession {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
            severed: AtomicBool::new(false),
        }))
    }
}

struct ScriptedSession {
    state: Arc<ScriptState>,
    closed: AtomicBool,
    severed: AtomicBool,
}

impl ScriptedSession {
    fn ensure_open(&self) -> AppResult<()> {
        if self.closed.load(Ordering::SeqCst) || self.severed.load(Ordering::SeqCst) {
            return Err(transport_error("session already closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn run(&self, command: &str) -> AppResult<ExecCapture> {
        self.ensure_open()?;
        self.state
            .commands
            .lock()
            .unwrap()
            .push(command.to_string());
        (self.state.handler)(command)
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> AppResult<()> {
        self.ensure_open()?;
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| local_error(format!("read {}: {e}", local_path.display())))?;
        self.state
            .remote_files
            .lock()
            .unwrap()
            .insert(remote_path.to_string(), bytes);
        self.state
            .uploads
            .lock()
            .unwrap()
            .push(remote_path.to_string());
        Ok(())
    }

    async fn download(&self, remote_path: &str, local_path: &Path) -> AppResult<u64> {
        self.ensure_open()?;
        {
            let mut failing = self.state.failing_downloads.lock().unwrap();
            if let Some(fault) = failing.get_mut(remote_path) {
                if fault.remaining > 0 {
                    fault.remaining -= 1;
                    if fault.sever {
                        self.severed.store(true, Ordering::SeqCst);
                    }
                    return Err(fault.error.clone());
                }
            }
        }
        let bytes = self
            .state
            .remote_files
            .lock()
            .unwrap()
            .get(remote_path)
            .cloned()
            .ok_or_else(|| remote_error(format!("no such remote file: {remote_path}")))?;
        tokio::fs::write(local_path, &bytes)
            .await
            .map_err(|e| local_error(format!("write {}: {e}", local_path.display())))?;
        self.state
            .downloads
            .lock()
            .unwrap()
            .push(remote_path.to_string());
        Ok(bytes.len() as u64)
    }

    async fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.severed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

pub fn ok_stdout(stdout: &str) -> ExecCapture {
    ExecCapture {
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
        exit_code: 0,
    }
}

pub fn exit_with(code: i32, stderr: &str) -> ExecCapture {
    ExecCapture {
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
        exit_code: code,
    }
}

pub fn test_api_paths() -> RemoteApiPaths {
    RemoteApiPaths {
        prepare_job: "/api/prepare_job".to_string(),
        submit_job: "/api/submit_job".to_string(),
        get_job_statuses: "/api/get_job_statuses".to_string(),
        cancel_jobs: "/api/cancel_jobs".to_string(),
    }
}

pub fn test_manifests() -> ManifestNames {
    ManifestNames {
        uploads: "rjm_uploads.txt".to_string(),
        downloads: "rjm_downloads.txt".to_string(),
    }
}

/// Three attempts, no waiting.
pub fn quick_retry(clock: Arc<dyn ClockPort>) -> Retry {
    Retry::new(
        RetryPolicy {
            max_attempts: 3,
            min_wait: Duration::ZERO,
            max_wait: Duration::ZERO,
        },
        clock,
    )
}
