use crate::{
    cli::Cli,
    conf::watch::HotSettings,
    dispatch::{Dispatcher, Outcome},
    models::Event,
    provider,
};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tokio::sync::watch;

#[derive(Debug, Args, Clone)]
pub struct EventSubcommands {
    #[clap(subcommand)]
    pub command: EventCommands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum EventCommands {
    /// Submit a normalized event.
    #[clap(
        long_about = "Reads a normalized source-control event as JSON and acts on it: the sender is authorized \
    against the configured provider, then either the matching executions are cancelled or one execution record \
    is created per pipeline. A running controller admits the created records."
    )]
    Submit {
        /// Path to the event JSON. Use '-' to read from stdin.
        #[arg(short, long)]
        file: String,

        /// Name of a pipeline to run for this event. Can be repeated.
        #[arg(short, long)]
        pipeline: Vec<String>,
    },
}

impl Cli {
    pub async fn handle_event_subcommands(&self, command: EventSubcommands) -> Result<()> {
        let cmds = command.command;
        match cmds {
            EventCommands::Submit { file, pipeline } => self.event_submit(&file, &pipeline).await,
        }
    }

    pub async fn event_submit(&self, file: &str, pipelines: &[String]) -> Result<()> {
        let raw = if file == "-" {
            tokio::task::spawn_blocking(|| std::io::read_to_string(std::io::stdin()))
                .await
                .context("Could not read event from stdin")??
        } else {
            tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("Could not read event file '{file}'"))?
        };

        let event: Event = serde_json::from_str(&raw).context("Could not parse event")?;

        let provider = provider::new(&self.conf.provider).context("Could not set up provider")?;
        let (_, settings) = watch::channel(HotSettings::from(&self.conf));

        let stores = self.stores().await?;
        let dispatcher = Dispatcher::new(
            stores,
            provider,
            settings,
            self.conf.controller.retry_config(),
        );

        let outcome = dispatcher
            .handle(&event, pipelines)
            .await
            .context("Could not handle event")?;

        match outcome {
            Outcome::NoRepository => {
                println!("No repository is registered for '{}'; nothing to do.", event.url)
            }
            Outcome::Unauthorized => println!(
                "'{}' is not allowed to trigger pipelines for '{}'.",
                event.sender.login, event.url
            ),
            Outcome::Cancelled => println!("Matching executions cancelled."),
            Outcome::NotCancellable => println!(
                "Only pull request events with a pull request number can cancel executions; nothing to do."
            ),
            Outcome::Created(keys) => {
                for key in keys {
                    println!("Created execution '{key}'");
                }
            }
        }

        Ok(())
    }
}
