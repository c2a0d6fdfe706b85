use crate::{cli::Cli, models::labels, store::LabelSelector};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use comfy_table::{presets::ASCII_MARKDOWN, Cell, CellAlignment, Color, ContentArrangement};

#[derive(Debug, Args, Clone)]
pub struct ExecutionSubcommands {
    #[clap(subcommand)]
    pub command: ExecutionCommands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum ExecutionCommands {
    /// List execution records.
    List {
        /// Only show records in this namespace.
        #[arg(short, long)]
        namespace: Option<String>,

        /// Label selector in the form 'key=value,key'.
        #[arg(short, long)]
        selector: Option<String>,
    },
}

impl Cli {
    pub async fn handle_execution_subcommands(&self, command: ExecutionSubcommands) -> Result<()> {
        let cmds = command.command;
        match cmds {
            ExecutionCommands::List {
                namespace,
                selector,
            } => self.execution_list(namespace, selector).await,
        }
    }

    pub async fn execution_list(
        &self,
        namespace: Option<String>,
        selector: Option<String>,
    ) -> Result<()> {
        let selector: LabelSelector = match selector {
            Some(selector) => selector.parse().context("Could not parse label selector")?,
            None => LabelSelector::new(),
        };

        let stores = self.stores().await?;
        let records = stores
            .executions
            .list_executions(namespace.as_deref(), &selector)
            .await
            .context("Could not successfully retrieve execution records")?;

        let mut table = comfy_table::Table::new();
        table
            .load_preset(ASCII_MARKDOWN)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("namespace")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("name")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("repository")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("state")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("status")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("created")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
            ]);

        for record in records {
            let state = record
                .labels
                .get(labels::STATE)
                .cloned()
                .unwrap_or_else(|| "unmanaged".to_string());

            let status = if record.is_done() {
                "done".to_string()
            } else if record.spec_status.to_string().is_empty() {
                "-".to_string()
            } else {
                record.spec_status.to_string()
            };

            table.add_row(vec![
                Cell::new(&record.namespace),
                Cell::new(&record.name).fg(Color::Green),
                Cell::new(record.repository().unwrap_or("-")),
                Cell::new(state),
                Cell::new(status),
                Cell::new(
                    self.format_time(record.created)
                        .unwrap_or_else(|| "Unknown".to_string()),
                ),
            ]);
        }

        println!("{}", &table.to_string());
        Ok(())
    }
}
