// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::app::types::{ManifestNames, RemoteApiPaths, RetryPolicy, SshEndpoints};

const APP_DIR_NAME: &str = "rjm";
const CONFIG_FILE_NAME: &str = "rjm.toml";
const CONFIG_ENV_VAR: &str = "RJM_CONFIG_PATH";
const SECRETS_FILE_NAME: &str = "secrets.json";
const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_UPLOADS_FILE: &str = "rjm_uploads.txt";
pub const DEFAULT_DOWNLOADS_FILE: &str = "rjm_downloads.txt";
const DEFAULT_REMOTE_API_DIR: &str = "/share/apps/remoteapi/0.2";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_WORKERS: usize = 1;
const SSH_KEEPALIVE: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lander_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_remote_base_directory: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_hosts_path: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilesSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uploads_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloads_file: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RemoteApiSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prepare_job: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submit_job: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub get_job_statuses: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_jobs: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_wait_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_secs: Option<f64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollingSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

/// The config file as written on disk; every field is optional.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets_path: Option<String>,
    pub cluster: ClusterSection,
    pub files: FilesSection,
    pub remote_api: RemoteApiSection,
    pub retry: RetrySection,
    pub polling: PollingSection,
    pub batch: BatchSection,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub endpoints: SshEndpoints,
    pub default_account: Option<String>,
    pub default_remote_base_directory: Option<String>,
    pub manifests: ManifestNames,
    pub remote_api: RemoteApiPaths,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
    pub workers: usize,
    pub secrets_path: PathBuf,
    pub keepalive: Duration,
    #[allow(dead_code)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub secrets_path: ConfigValue<PathBuf>,
    pub poll_interval_secs: ConfigValue<u64>,
    pub workers: ConfigValue<usize>,
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub poll_interval_secs: Option<u64>,
    pub workers: Option<usize>,
}

/// Where the config file lives and whether it has to exist.
#[derive(Debug, Clone)]
pub struct ConfigLocation {
    pub path: Option<PathBuf>,
    pub source: Option<ConfigSource>,
    pub required: bool,
}

pub fn locate(config_path_override: Option<PathBuf>) -> Result<ConfigLocation> {
    let location = match config_path_override {
        Some(path) => ConfigLocation {
            path: Some(expand_path(path)),
            source: Some(ConfigSource::Override),
            required: true,
        },
        None => match config_path_from_env()? {
            Some(path) => ConfigLocation {
                path: Some(expand_path(path)),
                source: Some(ConfigSource::Env),
                required: true,
            },
            None => ConfigLocation {
                path: default_config_path().ok(),
                source: Some(ConfigSource::Default),
                required: false,
            },
        },
    };
    Ok(location)
}

#[allow(dead_code)]
pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    Ok(load_with_report(config_path_override, overrides)?.config)
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let location = locate(config_path_override)?;
    let config_path = location.path.clone();
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);
    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, location.required)?,
        None => FileConfig::default(),
    };
    let base_dir = config_path.as_deref().and_then(|path| path.parent());

    let cluster = &file_config.cluster;
    let lander_host = required_host(cluster.lander_host.as_deref(), "cluster.lander_host")?;
    let login_host = required_host(cluster.login_host.as_deref(), "cluster.login_host")?;
    let port = cluster.port.unwrap_or(DEFAULT_SSH_PORT);
    if port == 0 {
        anyhow::bail!("cluster.port must be between 1 and 65535");
    }
    let endpoints = SshEndpoints {
        lander_host,
        login_host,
        port,
        known_hosts_path: cluster
            .known_hosts_path
            .as_deref()
            .map(|raw| resolve_path(raw, base_dir)),
    };

    let manifests = ManifestNames {
        uploads: non_empty_or(file_config.files.uploads_file.as_deref(), DEFAULT_UPLOADS_FILE),
        downloads: non_empty_or(
            file_config.files.downloads_file.as_deref(),
            DEFAULT_DOWNLOADS_FILE,
        ),
    };

    let api = &file_config.remote_api;
    let remote_api = RemoteApiPaths {
        prepare_job: remote_api_path(api.prepare_job.as_deref(), "prepare_job"),
        submit_job: remote_api_path(api.submit_job.as_deref(), "submit_job"),
        get_job_statuses: remote_api_path(api.get_job_statuses.as_deref(), "get_job_statuses"),
        cancel_jobs: remote_api_path(api.cancel_jobs.as_deref(), "cancel_jobs"),
    };

    let retry = retry_policy(&file_config.retry)?;

    let (poll_interval_secs, poll_source) = match overrides.poll_interval_secs {
        Some(secs) => (secs, ConfigSource::Override),
        None => match file_config.polling.interval_secs {
            Some(secs) => (secs, ConfigSource::ConfigFile),
            None => (DEFAULT_POLL_INTERVAL_SECS, ConfigSource::Default),
        },
    };
    if poll_interval_secs == 0 {
        anyhow::bail!("polling interval must be at least 1 second");
    }

    let (workers, workers_source) = match overrides.workers {
        Some(workers) => (workers, ConfigSource::Override),
        None => match file_config.batch.workers {
            Some(workers) => (workers, ConfigSource::ConfigFile),
            None => (DEFAULT_WORKERS, ConfigSource::Default),
        },
    };
    if workers == 0 {
        anyhow::bail!("batch.workers must be at least 1");
    }

    let (secrets_path, secrets_source) = match file_config.secrets_path.as_deref() {
        Some(raw) => (resolve_path(raw, base_dir), ConfigSource::ConfigFile),
        None => (
            default_secrets_path().with_context(|| {
                "failed to resolve default secrets path; set secrets_path in the config file"
            })?,
            ConfigSource::Default,
        ),
    };

    let config = Config {
        endpoints,
        default_account: cluster
            .default_account
            .clone()
            .filter(|value| !value.trim().is_empty()),
        default_remote_base_directory: cluster
            .default_remote_base_directory
            .clone()
            .filter(|value| !value.trim().is_empty()),
        manifests,
        remote_api,
        retry,
        poll_interval: Duration::from_secs(poll_interval_secs),
        workers,
        secrets_path,
        keepalive: SSH_KEEPALIVE,
        config_path: config_path.clone(),
    };

    let report = ConfigReport {
        config_path,
        config_path_source: location.source,
        config_file_present,
        secrets_path: ConfigValue {
            value: config.secrets_path.clone(),
            source: secrets_source,
        },
        poll_interval_secs: ConfigValue {
            value: poll_interval_secs,
            source: poll_source,
        },
        workers: ConfigValue {
            value: workers,
            source: workers_source,
        },
    };

    Ok(LoadResult { config, report })
}

/// Secrets path for a possibly incomplete config, as `configure` needs it.
pub fn secrets_path_for(file_config: &FileConfig, config_path: Option<&Path>) -> Result<PathBuf> {
    match file_config.secrets_path.as_deref() {
        Some(raw) => Ok(resolve_path(raw, config_path.and_then(|path| path.parent()))),
        None => default_secrets_path(),
    }
}

pub fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

/// Replaces the config file in one step.
pub fn write_config_file(path: &Path, file_config: &FileConfig) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    let rendered = toml::to_string_pretty(file_config).context("failed to encode config")?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(rendered.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("failed to write config file {}", path.display()))?;
    Ok(())
}

fn required_host(value: Option<&str>, key: &str) -> Result<String> {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        Some(host) => Ok(host.to_string()),
        None => anyhow::bail!("{key} is not set; run `rjm configure` or edit the config file"),
    }
}

fn non_empty_or(value: Option<&str>, default: &str) -> String {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn remote_api_path(value: Option<&str>, name: &str) -> String {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        Some(path) => path.to_string(),
        None => format!("{DEFAULT_REMOTE_API_DIR}/{name}"),
    }
}

fn retry_policy(section: &RetrySection) -> Result<RetryPolicy> {
    let defaults = RetryPolicy::default();
    let max_attempts = section.max_attempts.unwrap_or(defaults.max_attempts);
    if max_attempts == 0 {
        anyhow::bail!("retry.max_attempts must be at least 1");
    }
    let min_wait = match section.min_wait_secs {
        Some(secs) => seconds(secs, "retry.min_wait_secs")?,
        None => defaults.min_wait,
    };
    let max_wait = match section.max_wait_secs {
        Some(secs) => seconds(secs, "retry.max_wait_secs")?,
        None => defaults.max_wait,
    };
    if min_wait > max_wait {
        anyhow::bail!("retry.min_wait_secs must not exceed retry.max_wait_secs");
    }
    Ok(RetryPolicy {
        max_attempts,
        min_wait,
        max_wait,
    })
}

fn seconds(value: f64, key: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("{key} must be a non-negative number of seconds"))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn default_secrets_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("failed to resolve data directory")?;
    Ok(base.join(APP_DIR_NAME).join(SECRETS_FILE_NAME))
}
