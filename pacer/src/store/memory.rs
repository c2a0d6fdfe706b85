use super::{
    ExecutionStore, LabelSelector, Requirement, RepositoryStore, StoreError, WatchBus, WatchEvent,
    WatchEventKind,
};
use crate::models::{ExecutionKey, ExecutionRecord, Repository};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

type LabelIndex = HashMap<(String, String), BTreeSet<ExecutionKey>>;

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<ExecutionKey, ExecutionRecord>,

    /// (label key, label value) -> records carrying that pair.
    label_index: LabelIndex,

    repositories: BTreeMap<(String, String), Repository>,
}

impl State {
    fn index(&mut self, record: &ExecutionRecord) {
        let key = record.key();
        for (label, value) in &record.labels {
            self.label_index
                .entry((label.clone(), value.clone()))
                .or_default()
                .insert(key.clone());
        }
    }

    fn unindex(&mut self, record: &ExecutionRecord) {
        let key = record.key();
        for (label, value) in &record.labels {
            let pair = (label.clone(), value.clone());
            if let Some(keys) = self.label_index.get_mut(&pair) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.label_index.remove(&pair);
                }
            }
        }
    }

    /// Narrows the candidate set using the equality requirements. Returns `None` when the selector has none,
    /// meaning every record is a candidate.
    fn candidates(&self, selector: &LabelSelector) -> Option<BTreeSet<ExecutionKey>> {
        let empty = BTreeSet::new();

        let mut sets: Vec<&BTreeSet<ExecutionKey>> = selector
            .requirements()
            .iter()
            .filter_map(|requirement| match requirement {
                Requirement::Equals { key, value } => Some(
                    self.label_index
                        .get(&(key.clone(), value.clone()))
                        .unwrap_or(&empty),
                ),
                Requirement::Exists { .. } => None,
            })
            .collect();

        if sets.is_empty() {
            return None;
        }

        sets.sort_by_key(|set| set.len());
        let (smallest, rest) = sets.split_first()?;

        Some(
            smallest
                .iter()
                .filter(|key| rest.iter().all(|set| set.contains(*key)))
                .cloned()
                .collect(),
        )
    }
}

/// Keeps everything in process memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct Engine {
    state: RwLock<State>,
    watch: WatchBus,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|e| StoreError::Internal(format!("memory store lock poisoned; {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|e| StoreError::Internal(format!("memory store lock poisoned; {e}")))
    }
}

#[async_trait]
impl ExecutionStore for Engine {
    async fn list_executions(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        let state = self.read()?;

        let in_scope = |record: &&ExecutionRecord| {
            namespace.map_or(true, |ns| record.namespace == ns) && selector.matches(&record.labels)
        };

        let records = match state.candidates(selector) {
            Some(keys) => keys
                .iter()
                .filter_map(|key| state.records.get(key))
                .filter(in_scope)
                .cloned()
                .collect(),
            None => state.records.values().filter(in_scope).cloned().collect(),
        };

        Ok(records)
    }

    async fn get_execution(&self, key: &ExecutionKey) -> Result<ExecutionRecord, StoreError> {
        self.read()?
            .records
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create_execution(
        &self,
        record: &ExecutionRecord,
    ) -> Result<ExecutionRecord, StoreError> {
        let stored = {
            let mut state = self.write()?;
            let key = record.key();

            if state.records.contains_key(&key) {
                return Err(StoreError::Exists);
            }

            let mut stored = record.clone();
            stored.resource_version = 1;
            state.index(&stored);
            state.records.insert(key, stored.clone());
            stored
        };

        self.watch.publish(WatchEventKind::Added, stored.clone());
        Ok(stored)
    }

    async fn update_execution(
        &self,
        record: &ExecutionRecord,
    ) -> Result<ExecutionRecord, StoreError> {
        let stored = {
            let mut state = self.write()?;
            let key = record.key();

            let current = state.records.get(&key).cloned().ok_or(StoreError::NotFound)?;
            if current.resource_version != record.resource_version {
                return Err(StoreError::Conflict);
            }

            let mut stored = record.clone();
            stored.created = current.created;
            stored.resource_version = current.resource_version + 1;

            state.unindex(&current);
            state.index(&stored);
            state.records.insert(key, stored.clone());
            stored
        };

        self.watch.publish(WatchEventKind::Modified, stored.clone());
        Ok(stored)
    }

    async fn delete_execution(&self, key: &ExecutionKey) -> Result<(), StoreError> {
        let removed = {
            let mut state = self.write()?;
            let removed = state.records.remove(key).ok_or(StoreError::NotFound)?;
            state.unindex(&removed);
            removed
        };

        self.watch.publish(WatchEventKind::Deleted, removed);
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.watch.subscribe()
    }
}

#[async_trait]
impl RepositoryStore for Engine {
    async fn list_repositories(
        &self,
        namespace: Option<&str>,
    ) -> Result<Vec<Repository>, StoreError> {
        Ok(self
            .read()?
            .repositories
            .values()
            .filter(|repo| namespace.map_or(true, |ns| repo.namespace == ns))
            .cloned()
            .collect())
    }

    async fn get_repository(&self, namespace: &str, name: &str) -> Result<Repository, StoreError> {
        self.read()?
            .repositories
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn create_repository(&self, repository: &Repository) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let key = (repository.namespace.clone(), repository.name.clone());

        if state.repositories.contains_key(&key) {
            return Err(StoreError::Exists);
        }

        state.repositories.insert(key, repository.clone());
        Ok(())
    }

    async fn delete_repository(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.write()?
            .repositories
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}
