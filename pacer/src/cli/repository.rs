use crate::{cli::Cli, models::Repository, validate};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Subcommand};
use comfy_table::{presets::ASCII_MARKDOWN, Cell, CellAlignment, Color, ContentArrangement};

#[derive(Debug, Args, Clone)]
pub struct RepositorySubcommands {
    #[clap(subcommand)]
    pub command: RepositoryCommands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum RepositoryCommands {
    /// List all registered repositories.
    List {
        /// Only show repositories in this namespace.
        #[arg(short, long)]
        namespace: Option<String>,
    },

    /// Register a repository so events for it are acted on.
    Create {
        /// Namespace the repository and its execution records live in.
        namespace: String,

        /// Repository identifier.
        ///
        /// Must be:
        /// * 63 >= characters >= 1
        /// * Only lowercase alphanumeric characters or hyphens
        name: String,

        /// The URL events for this repository carry.
        url: String,

        /// Maximum number of executions allowed to run at the same time. Unlimited if unset or 0.
        #[arg(short, long)]
        concurrency_limit: Option<u64>,
    },

    /// Remove a repository registration. Existing execution records are left alone.
    Delete { namespace: String, name: String },
}

impl Cli {
    pub async fn handle_repository_subcommands(&self, command: RepositorySubcommands) -> Result<()> {
        let cmds = command.command;
        match cmds {
            RepositoryCommands::List { namespace } => self.repository_list(namespace).await,
            RepositoryCommands::Create {
                namespace,
                name,
                url,
                concurrency_limit,
            } => {
                self.repository_create(&namespace, &name, &url, concurrency_limit)
                    .await
            }
            RepositoryCommands::Delete { namespace, name } => {
                self.repository_delete(&namespace, &name).await
            }
        }
    }

    pub async fn repository_list(&self, namespace: Option<String>) -> Result<()> {
        let stores = self.stores().await?;
        let repositories = stores
            .repositories
            .list_repositories(namespace.as_deref())
            .await
            .context("Could not successfully retrieve repositories")?;

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
                Cell::new("url")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
                Cell::new("concurrency limit")
                    .set_alignment(CellAlignment::Center)
                    .fg(Color::Blue),
            ]);

        for repository in repositories {
            table.add_row(vec![
                Cell::new(repository.namespace),
                Cell::new(repository.name).fg(Color::Green),
                Cell::new(repository.url),
                Cell::new(
                    repository
                        .concurrency_limit
                        .filter(|limit| *limit > 0)
                        .map(|limit| limit.to_string())
                        .unwrap_or_else(|| "unlimited".to_string()),
                ),
            ]);
        }

        println!("{}", &table.to_string());
        Ok(())
    }

    pub async fn repository_create(
        &self,
        namespace: &str,
        name: &str,
        url: &str,
        concurrency_limit: Option<u64>,
    ) -> Result<()> {
        validate::arg("namespace", namespace, vec![validate::is_valid_name])
            .map_err(|e| anyhow!(e))?;
        validate::arg("name", name, vec![validate::is_valid_name]).map_err(|e| anyhow!(e))?;
        validate::arg("url", url, vec![validate::not_empty_str]).map_err(|e| anyhow!(e))?;

        let stores = self.stores().await?;
        stores
            .repositories
            .create_repository(&Repository::new(namespace, name, url, concurrency_limit))
            .await
            .context("Could not successfully create repository")?;

        println!("Successfully created repository '{namespace}/{name}'!");
        Ok(())
    }

    pub async fn repository_delete(&self, namespace: &str, name: &str) -> Result<()> {
        let stores = self.stores().await?;
        stores
            .repositories
            .delete_repository(namespace, name)
            .await
            .context("Could not successfully delete repository")?;

        println!("Repository '{namespace}/{name}' deleted!");
        Ok(())
    }
}
