mod event;
mod execution;
mod repository;
mod service;

use crate::conf::{self, Config, LogFormat};
use crate::store::{self, Stores};
use anyhow::{Context, Result};
use chrono_humanize::HumanTime;
use clap::{Parser, Subcommand};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser, Clone)]
#[command(name = "pacer")]
#[command(bin_name = "pacer")]
#[command(about = "Pacer decides which pipeline executions get to run and when.")]
#[command(
    long_about = "Pacer decides which pipeline executions get to run and when.\n\n It receives source-control \
    events, checks that the sender may trigger pipelines, creates execution records for them and then admits \
    those records one repository at a time, never running more of them than the repository allows."
)]
#[command(version)]
pub struct Args {
    /// Set configuration path; if empty default paths are used
    #[arg(long, value_name = "PATH")]
    pub config_path: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Commands {
    /// Manages service related commands pertaining to administration.
    Service(service::ServiceSubcommands),

    /// Manages repository registrations.
    Repository(repository::RepositorySubcommands),

    /// Inspect execution records.
    Execution(execution::ExecutionSubcommands),

    /// Feed source-control events to pacer.
    Event(event::EventSubcommands),
}

#[derive(Debug, Clone)]
pub struct Cli {
    args: Args,
    conf: Config,
}

impl Cli {
    pub fn new() -> Result<Self> {
        let args = Args::parse();
        let conf = Config::parse(args.config_path.as_deref())
            .context("Could not parse configuration")?;

        Ok(Self { args, conf })
    }

    pub async fn run(&self) -> Result<()> {
        match self.args.command.clone() {
            Commands::Service(service) => self.handle_service_subcommands(service).await,
            Commands::Repository(repository) => {
                self.handle_repository_subcommands(repository).await
            }
            Commands::Execution(execution) => self.handle_execution_subcommands(execution).await,
            Commands::Event(event) => self.handle_event_subcommands(event).await,
        }
    }

    async fn stores(&self) -> Result<Stores> {
        store::new(&self.conf.store)
            .await
            .context("Could not open store")
    }

    /// Turns an epoch millisecond timestamp into something like '5m ago'.
    fn format_time(&self, epoch_milli: u64) -> Option<String> {
        humanize_relative_duration(epoch_milli)
    }
}

/// Installs the global tracing subscriber. `RUST_LOG` wins over the configured level and dev_mode always gets
/// human readable output.
pub fn init_logging(general: &conf::General) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&general.log_level))
        .context("Could not parse log_level")?;

    let base = fmt::layer().with_target(true);

    let result = match (general.dev_mode, general.log_format) {
        (true, _) => tracing_subscriber::registry()
            .with(env_filter)
            .with(base.pretty().with_file(true).with_line_number(true))
            .try_init(),
        (false, LogFormat::Json) => tracing_subscriber::registry()
            .with(env_filter)
            .with(base.json())
            .try_init(),
        (false, LogFormat::Pretty) => tracing_subscriber::registry()
            .with(env_filter)
            .with(base.compact())
            .try_init(),
    };

    result.context("Could not install log subscriber")
}

/// Transforms the given time into a humanized duration string from the current time, or None if the time is
/// not set. (i.e. 'about an hour ago')
fn humanize_relative_duration(time: u64) -> Option<String> {
    if time == 0 {
        return None;
    }

    let time_diff = crate::epoch_milli().saturating_sub(time);
    let time_diff_duration = chrono::Duration::milliseconds(-(time_diff as i64));
    Some(HumanTime::from(time_diff_duration).to_string())
}
