// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use clap::{Args, CommandFactory, FromArgMatches, Parser, Subcommand};

pub mod prompt;

#[derive(Parser, Debug)]
#[command(
    name = "rjm",
    version,
    about = "Run batch jobs on a cluster behind an MFA-protected SSH lander",
    long_about = None,
    after_help = "Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: defaults < RJM_CONFIG_PATH < --config.\n\
Every batch command reads a file listing one local job directory per line.\n\
Logging: RJM_LOG sets the filter, RJM_LOG_FORMAT picks json|pretty|compact, RJM_LOG_FILE copies logs to a file."
)]
pub struct Opts {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, rjm uses RJM_CONFIG_PATH if set, otherwise the default config file location."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging, including logs from the ssh stack."
    )]
    pub verbose: bool,
    #[arg(
        short = 'l',
        long,
        global = true,
        value_name = "PATH",
        help = "Also write logs to this file. Overrides RJM_LOG_FILE."
    )]
    pub log_file: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write the config file and store credentials.
    Configure,
    /// Log in through the lander to the login node and out again.
    Authenticate,
    /// Prepare, stage in and submit every listed job.
    Submit(SubmitArgs),
    /// Wait for listed jobs to finish and download their results.
    Wait(WaitArgs),
    /// Cancel listed jobs.
    Cancel(CancelArgs),
    /// Remove the remote directories of listed jobs.
    Clean(JobListArgs),
    /// Print the scheduler status of all jobs of the user.
    Status,
}

#[derive(Args, Debug)]
pub struct JobListArgs {
    #[arg(
        short = 'f',
        long = "job-dirs",
        value_name = "FILE",
        help = "File listing one local job directory per line."
    )]
    pub job_dirs: PathBuf,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub list: JobListArgs,
    #[arg(
        short = 'c',
        long = "cmd",
        value_name = "COMMAND",
        required = true,
        help = "Command to run in the job; repeat for several commands."
    )]
    pub commands: Vec<String>,
    #[arg(
        short = 'd',
        long,
        value_name = "DIR",
        help = "Remote base directory for job directories. Defaults to `cluster.default_remote_base_directory`."
    )]
    pub remote_base_dir: Option<String>,
    #[arg(short = 'j', long, help = "Job type, as understood by the remote API.")]
    pub jobtype: String,
    #[arg(short = 'm', long, help = "Memory per job, e.g. 2G.")]
    pub mem: String,
    #[arg(long, help = "Virtual memory per job. Defaults to --mem.")]
    pub vmem: Option<String>,
    #[arg(short = 'w', long, help = "Wall time, e.g. 01:00:00.")]
    pub walltime: String,
    #[arg(
        short = 'a',
        long,
        help = "Project account to charge. Defaults to `cluster.default_account`."
    )]
    pub account: Option<String>,
    #[arg(
        long,
        value_name = "N",
        help = "Number of concurrent sessions. Overrides `batch.workers`."
    )]
    pub workers: Option<usize>,
}

#[derive(Args, Debug)]
pub struct WaitArgs {
    #[command(flatten)]
    pub list: JobListArgs,
    #[arg(
        short = 'z',
        long = "polling-interval",
        value_name = "SECS",
        help = "Seconds between status polls. Overrides `polling.interval_secs`."
    )]
    pub polling_interval_secs: Option<u64>,
}

#[derive(Args, Debug)]
pub struct CancelArgs {
    #[command(flatten)]
    pub list: JobListArgs,
    #[arg(
        short = 'w',
        long,
        action = clap::ArgAction::SetTrue,
        help = "Poll until the scheduler no longer reports the cancelled jobs."
    )]
    pub wait: bool,
    #[arg(
        short = 'z',
        long = "polling-interval",
        value_name = "SECS",
        help = "Seconds between status polls while waiting. Overrides `polling.interval_secs`."
    )]
    pub polling_interval_secs: Option<u64>,
}

const HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}
";

fn apply_help_template_recursively(cmd: &mut clap::Command) {
    let mut owned = std::mem::take(cmd);
    owned = owned.help_template(HELP_TEMPLATE);
    for sub in owned.get_subcommands_mut() {
        apply_help_template_recursively(sub);
    }
    *cmd = owned;
}

pub fn cli_command() -> clap::Command {
    let mut cmd = Opts::command();
    apply_help_template_recursively(&mut cmd);
    cmd
}

pub fn parse_opts() -> Opts {
    let matches = cli_command().get_matches();
    Opts::from_arg_matches(&matches).unwrap_or_else(|err| err.exit())
}
