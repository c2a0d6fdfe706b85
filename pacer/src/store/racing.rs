use super::{ExecutionStore, LabelSelector, StoreError, WatchEvent};
use crate::models::{ExecutionKey, ExecutionRecord};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Wraps an execution store so that the first update lands right after somebody else modified the same record.
/// The interfering write goes through the wrapped store, so the update fails with a genuine
/// [`StoreError::Conflict`] and whoever issued it has to re-read.
#[derive(Debug)]
pub struct RacingStore {
    inner: Arc<dyn ExecutionStore>,
    interference: Mutex<Option<fn(&mut ExecutionRecord)>>,
}

impl RacingStore {
    pub fn new(inner: Arc<dyn ExecutionStore>, interference: fn(&mut ExecutionRecord)) -> Self {
        Self {
            inner,
            interference: Mutex::new(Some(interference)),
        }
    }

    /// Whether the interfering write already happened.
    pub fn raced(&self) -> bool {
        self.interference.lock().unwrap().is_none()
    }
}

#[async_trait]
impl ExecutionStore for RacingStore {
    async fn list_executions(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.inner.list_executions(namespace, selector).await
    }

    async fn get_execution(&self, key: &ExecutionKey) -> Result<ExecutionRecord, StoreError> {
        self.inner.get_execution(key).await
    }

    async fn create_execution(
        &self,
        record: &ExecutionRecord,
    ) -> Result<ExecutionRecord, StoreError> {
        self.inner.create_execution(record).await
    }

    async fn update_execution(
        &self,
        record: &ExecutionRecord,
    ) -> Result<ExecutionRecord, StoreError> {
        let interference = self.interference.lock().unwrap().take();

        if let Some(interfere) = interference {
            let mut current = self.inner.get_execution(&record.key()).await?;
            interfere(&mut current);
            self.inner.update_execution(&current).await?;
        }

        self.inner.update_execution(record).await
    }

    async fn delete_execution(&self, key: &ExecutionKey) -> Result<(), StoreError> {
        self.inner.delete_execution(key).await
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.watch()
    }
}
