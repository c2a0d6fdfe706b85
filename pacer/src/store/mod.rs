//! Persistence for execution records and repository registrations.
//!
//! Two engines implement the same traits: an in-memory engine used by tests and single-process setups, and a
//! sqlite engine for anything that needs to survive a restart. Both keep a secondary index on labels so that
//! selector queries never scan every record, and both enforce optimistic concurrency through
//! `resource_version`.

pub mod memory;
pub mod retry;
pub mod selector;
pub mod sqlite;
pub mod watch;

#[cfg(test)]
pub(crate) mod racing;

use crate::models::{ExecutionKey, ExecutionRecord, Repository};
use async_trait::async_trait;
use futures::TryFutureExt;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use strum::{Display, EnumString};
use tokio::sync::broadcast;

pub use retry::{retry_on_conflict, RetryConfig};
pub use selector::{LabelSelector, Requirement, SelectorError};
pub use watch::{WatchBus, WatchEvent, WatchEventKind};

/// Represents different store failure possibilities.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("could not establish connection to store; {0}")]
    Connection(String),

    #[error("requested entity not found")]
    NotFound,

    #[error("entity already exists")]
    Exists,

    /// The write was based on a stale copy of the record. Re-read and try again.
    #[error("entity was modified concurrently; resource version is stale")]
    Conflict,

    #[error("unexpected store error occurred; {0}")]
    Internal(String),

    /// Failed to start due to misconfigured settings, usually from a misconfigured settings file.
    #[error("could not init store; {0}")]
    FailedPrecondition(String),
}

#[async_trait]
pub trait ExecutionStore: Debug + Send + Sync + 'static {
    /// Returns every record matching the selector, ordered by namespace then name. `None` lists across
    /// namespaces.
    async fn list_executions(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<ExecutionRecord>, StoreError>;

    async fn get_execution(&self, key: &ExecutionKey) -> Result<ExecutionRecord, StoreError>;

    /// Inserts a new record and returns the stored copy with its first resource version.
    async fn create_execution(
        &self,
        record: &ExecutionRecord,
    ) -> Result<ExecutionRecord, StoreError>;

    /// Replaces labels, spec status and conditions of an existing record. Fails with [`StoreError::Conflict`]
    /// if `record.resource_version` is not the stored one.
    async fn update_execution(
        &self,
        record: &ExecutionRecord,
    ) -> Result<ExecutionRecord, StoreError>;

    async fn delete_execution(&self, key: &ExecutionKey) -> Result<(), StoreError>;

    /// Subscribes to changes made after this call returns.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

#[async_trait]
pub trait RepositoryStore: Debug + Send + Sync + 'static {
    async fn list_repositories(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<Repository>, StoreError>;

    async fn get_repository(&self, namespace: &str, name: &str) -> Result<Repository, StoreError>;

    async fn create_repository(&self, repository: &Repository) -> Result<(), StoreError>;

    async fn delete_repository(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Engine {
    #[default]
    Memory,
    Sqlite,
}

/// Both halves of the store, usually backed by the same engine.
#[derive(Debug, Clone)]
pub struct Stores {
    pub executions: Arc<dyn ExecutionStore>,
    pub repositories: Arc<dyn RepositoryStore>,
}

impl Stores {
    /// A fresh in-memory store. Handy for tests.
    pub fn in_memory() -> Self {
        let engine = Arc::new(memory::Engine::new());

        Self {
            executions: engine.clone(),
            repositories: engine,
        }
    }
}

pub async fn new(config: &crate::conf::Store) -> Result<Stores, StoreError> {
    match config.engine {
        Engine::Memory => Ok(Stores::in_memory()),
        Engine::Sqlite => {
            let Some(sqlite_config) = &config.sqlite else {
                return Err(StoreError::FailedPrecondition(
                    "Sqlite engine settings not found in config".into(),
                ));
            };

            let engine = sqlite::Engine::new(sqlite_config)
                .map_err(|err| StoreError::FailedPrecondition(err.to_string()))
                .await?;
            let engine = Arc::new(engine);

            Ok(Stores {
                executions: engine.clone(),
                repositories: engine,
            })
        }
    }
}
