use crate::{cli::Cli, reconciler};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Args, Clone)]
pub struct ServiceSubcommands {
    #[clap(subcommand)]
    pub command: ServiceCommands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum ServiceCommands {
    /// Start the pacer controller.
    #[clap(
        long_about = "Starts the long running controller. It watches execution records, admits queued ones as \
    their repository frees up slots and releases slots as executions finish. This command will block and only \
    gracefully stop on SIGINT or SIGTERM signals."
    )]
    Start,
}

impl Cli {
    pub async fn handle_service_subcommands(&self, command: ServiceSubcommands) -> Result<()> {
        let cmds = command.command;
        match cmds {
            ServiceCommands::Start => self.service_start().await,
        }
    }

    pub async fn service_start(&self) -> Result<()> {
        super::init_logging(&self.conf.general)?;

        let stores = self.stores().await?;
        let cancel = CancellationToken::new();

        tokio::spawn(wait_for_shutdown_signal(cancel.clone()));

        info!(engine = %self.conf.store.engine, dev_mode = self.conf.general.dev_mode, "starting pacer");

        reconciler::start(
            &self.conf,
            self.args.config_path.clone(),
            stores,
            cancel,
        )
        .await
        .context("Controller encountered errors while running")
    }
}

async fn wait_for_shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "could not listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("received shutdown signal; stopping");
    cancel.cancel();
}
