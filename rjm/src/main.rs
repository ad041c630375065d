// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;

use adapters::cli::{Command, Opts, prompt};
use app::ports::{ClockPort, SecretStorePort};
use app::ports::secret_store::USERNAME_KEY;
use app::services::otp::{OtpLedger, TotpGenerator};
use app::services::remote_api::RemoteJobApi;
use app::services::retry::Retry;
use app::types::{Credentials, JobSpec};
use app::usecases::{BatchReport, UseCases};

mod adapters;
mod app;
mod config;
mod logging;

fn log_config_report(report: &config::ConfigReport) {
    match (&report.config_path, report.config_path_source) {
        (Some(path), Some(source)) => {
            tracing::debug!(
                "config path: {} (source={}, present={})",
                path.display(),
                source.as_str(),
                report.config_file_present
            );
        }
        (Some(path), None) => {
            tracing::debug!(
                "config path: {} (present={})",
                path.display(),
                report.config_file_present
            );
        }
        (None, _) => {
            tracing::debug!("config path: (none)");
        }
    }
    tracing::debug!(
        "config secrets_path: {} (source={})",
        report.secrets_path.value.display(),
        report.secrets_path.source.as_str()
    );
    tracing::debug!(
        "config polling.interval_secs: {} (source={})",
        report.poll_interval_secs.value,
        report.poll_interval_secs.source.as_str()
    );
    tracing::debug!(
        "config batch.workers: {} (source={})",
        report.workers.value,
        report.workers.source.as_str()
    );
}

fn build_usecases(config: &config::Config) -> anyhow::Result<UseCases> {
    let secrets: Arc<dyn SecretStorePort> =
        Arc::new(adapters::secrets::FileSecretStore::new(&config.secrets_path));
    let clock: Arc<dyn ClockPort> = Arc::new(adapters::time::SystemClock::new());
    let credentials = Credentials::load(secrets.as_ref())?;
    let generator = TotpGenerator::from_base32(&credentials.otp_seed)?;
    let ledger = Arc::new(OtpLedger::new(generator, secrets, clock.clone()));
    let transport = Arc::new(adapters::ssh::SshTransport::new(
        config.endpoints.clone(),
        credentials,
        ledger,
        config.keepalive,
    ));
    Ok(UseCases::new(
        transport,
        Arc::new(adapters::fs::TomlJobStore::default()),
        Arc::new(adapters::fs::LocalFilesystem::new()),
        RemoteJobApi::new(config.remote_api.clone()),
        Retry::new(config.retry, clock),
        config.manifests.clone(),
        config.workers,
    ))
}

/// Flips to true on the first Ctrl-C.
fn interrupt_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted; stopping after the current step");
            let _ = tx.send(true);
        }
    });
    rx
}

fn finish(report: &BatchReport) -> ExitCode {
    println!("{} of {} jobs succeeded", report.succeeded(), report.total);
    for failure in &report.failures {
        println!("  {}: {}", failure.job_dir.display(), failure.error);
    }
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn configure(config_override: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let location = config::locate(config_override)?;
    let path = location
        .path
        .context("cannot determine a config file location; pass --config")?;
    let mut file_config = config::read_config_file(&path, false)?;
    let secrets_path = config::secrets_path_for(&file_config, Some(&path))?;
    let secrets = adapters::secrets::FileSecretStore::new(&secrets_path);
    let known_user = secrets.get(USERNAME_KEY).ok().flatten();

    println!("Writing configuration to {}", path.display());
    let username = prompt::ask("Cluster username", known_user.as_deref()).await?;
    let password = prompt::ask_secret("Cluster password", "RJM_PASSWORD").await?;
    let otp_seed = prompt::ask_secret("OTP secret (base32)", "RJM_OTP_SEED").await?;
    TotpGenerator::from_base32(&otp_seed)?;

    let cluster = &mut file_config.cluster;
    cluster.lander_host = Some(prompt::ask("Lander host", cluster.lander_host.as_deref()).await?);
    cluster.login_host = Some(prompt::ask("Login host", cluster.login_host.as_deref()).await?);
    cluster.default_account =
        Some(prompt::ask("Default project account", cluster.default_account.as_deref()).await?);
    cluster.default_remote_base_directory = Some(
        prompt::ask(
            "Default remote base directory",
            cluster.default_remote_base_directory.as_deref(),
        )
        .await?,
    );
    let files = &mut file_config.files;
    files.uploads_file = Some(
        prompt::ask(
            "File in each job directory listing files to upload",
            Some(
                files
                    .uploads_file
                    .as_deref()
                    .unwrap_or(config::DEFAULT_UPLOADS_FILE),
            ),
        )
        .await?,
    );
    files.downloads_file = Some(
        prompt::ask(
            "File in each job directory listing files to download",
            Some(
                files
                    .downloads_file
                    .as_deref()
                    .unwrap_or(config::DEFAULT_DOWNLOADS_FILE),
            ),
        )
        .await?,
    );

    config::write_config_file(&path, &file_config)?;
    Credentials {
        username,
        password,
        otp_seed,
    }
    .store(&secrets)?;
    println!("Credentials stored in {}", secrets.path().display());
    Ok(ExitCode::SUCCESS)
}

async fn run(opts: Opts) -> anyhow::Result<ExitCode> {
    let overrides = match &opts.command {
        Command::Configure => return configure(opts.config).await,
        Command::Submit(args) => config::Overrides {
            workers: args.workers,
            ..Default::default()
        },
        Command::Wait(args) => config::Overrides {
            poll_interval_secs: args.polling_interval_secs,
            ..Default::default()
        },
        Command::Cancel(args) => config::Overrides {
            poll_interval_secs: args.polling_interval_secs,
            ..Default::default()
        },
        Command::Authenticate | Command::Clean(_) | Command::Status => config::Overrides::default(),
    };
    let config::LoadResult { config, report } = config::load_with_report(opts.config, overrides)?;
    log_config_report(&report);
    let usecases = build_usecases(&config)?;

    match opts.command {
        Command::Configure => Ok(ExitCode::SUCCESS),
        Command::Authenticate => {
            let host = usecases.authenticate().await?;
            println!("Authenticated on {host}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Status => {
            let mut statuses: Vec<_> = usecases.status().await?.into_iter().collect();
            statuses.sort();
            for (id, status) in statuses {
                println!("{id} {status}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Submit(args) => {
            let remote_base_directory = args
                .remote_base_dir
                .or_else(|| config.default_remote_base_directory.clone())
                .context(
                    "no remote base directory; pass --remote-base-dir or set cluster.default_remote_base_directory",
                )?;
            let spec = JobSpec {
                remote_base_directory,
                commands: args.commands,
                vmem: args.vmem.unwrap_or_else(|| args.mem.clone()),
                mem: args.mem,
                walltime: args.walltime,
                jobtype: args.jobtype,
                account: args.account.or_else(|| config.default_account.clone()),
            };
            let job_dirs = usecases.load_job_dirs(&args.list.job_dirs).await?;
            Ok(finish(&usecases.submit_many(job_dirs, spec).await))
        }
        Command::Wait(args) => {
            let job_dirs = usecases.load_job_dirs(&args.list.job_dirs).await?;
            let report = usecases
                .wait_many(job_dirs, config.poll_interval, interrupt_signal())
                .await?;
            Ok(finish(&report))
        }
        Command::Cancel(args) => {
            let job_dirs = usecases.load_job_dirs(&args.list.job_dirs).await?;
            let report = usecases
                .cancel_many(job_dirs, config.poll_interval, args.wait, interrupt_signal())
                .await?;
            Ok(finish(&report))
        }
        Command::Clean(args) => {
            let job_dirs = usecases.load_job_dirs(&args.job_dirs).await?;
            Ok(finish(&usecases.clean_many(job_dirs).await?))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = adapters::cli::parse_opts();
    logging::init(opts.verbose, opts.log_file.as_deref());
    match run(opts).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("rjm: {err:#}");
            ExitCode::FAILURE
        }
    }
}
