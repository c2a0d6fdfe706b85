//! Resolves cancellation requests against the live set of execution records.
//!
//! Records are found through the same labels the dispatcher writes when it creates them: the repository name,
//! the commit and the pull request number, optionally narrowed to a single logical pipeline. Cancelling only
//! asks the execution engine to stop; nothing here waits for the run to actually end.

use crate::models::{labels, Event, ExecutionKey, Repository, SpecStatus, TriggerTarget};
use crate::store::{retry_on_conflict, ExecutionStore, LabelSelector, RetryConfig, StoreError};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CancelError {
    #[error("could not list executions to cancel; {0}")]
    List(StoreError),

    /// Records cancelled before this one stay cancelled.
    #[error("could not cancel execution '{key}'; {source}")]
    Persist {
        key: ExecutionKey,
        source: StoreError,
    },
}

/// Builds the selector for the records an event may cancel. Returns None for events that carry no request
/// number, since those cannot identify any record.
pub fn selector_for(event: &Event) -> Option<LabelSelector> {
    let request = event.pull_request_number?;

    let mut selector = LabelSelector::new()
        .eq(labels::URL_REPOSITORY, &labels::clean_value(&event.repository))
        .eq(labels::SHA, &labels::clean_value(&event.sha))
        .eq(labels::PULL_REQUEST, &request.to_string());

    if let Some(target) = event.cancel_target() {
        selector = selector.eq(labels::ORIGINAL_PR_NAME, target);
    }

    Some(selector)
}

#[derive(Debug, Clone)]
pub struct CancellationResolver {
    executions: Arc<dyn ExecutionStore>,
    retry: RetryConfig,
}

impl CancellationResolver {
    pub fn new(executions: Arc<dyn ExecutionStore>, retry: RetryConfig) -> Self {
        Self { executions, retry }
    }

    /// Marks every eligible record matching the event as cancelled. Events that are not pull requests asking
    /// for cancellation are ignored. The first record that fails to persist aborts the rest of the batch.
    pub async fn cancel_executions(
        &self,
        event: &Event,
        repository: &Repository,
    ) -> Result<(), CancelError> {
        if event.trigger_target != TriggerTarget::PullRequest || !event.state.cancel_pipeline_runs {
            debug!(trigger_target = %event.trigger_target,
                cancel_pipeline_runs = event.state.cancel_pipeline_runs,
                "event does not request cancellation");
            return Ok(());
        }

        let Some(selector) = selector_for(event) else {
            warn!(repository = event.repository, sha = event.sha,
                "cancellation requested without a pull request number; nothing to match");
            return Ok(());
        };

        let records = self
            .executions
            .list_executions(Some(&repository.namespace), &selector)
            .await
            .map_err(CancelError::List)?;

        if records.is_empty() {
            info!(namespace = repository.namespace, selector = %selector, "no executions to cancel");
            return Ok(());
        }

        for record in records {
            if !record.is_cancellable() {
                debug!(namespace = record.namespace, name = record.name, spec_status = %record.spec_status,
                    "execution is done or already stopping; skipping");
                continue;
            }

            let key = record.key();
            let cancelled = self
                .cancel(&key)
                .await
                .map_err(|source| CancelError::Persist {
                    key: key.clone(),
                    source,
                })?;

            if cancelled {
                info!(namespace = key.namespace, name = key.name, "execution cancelled");
            }
        }

        Ok(())
    }

    /// Returns false if the record vanished or stopped being eligible since it was listed.
    async fn cancel(&self, key: &ExecutionKey) -> Result<bool, StoreError> {
        let executions = &self.executions;

        retry_on_conflict(self.retry, move || async move {
            let mut record = match executions.get_execution(key).await {
                Ok(record) => record,
                Err(StoreError::NotFound) => return Ok(false),
                Err(e) => return Err(e),
            };

            if !record.is_cancellable() {
                return Ok(false);
            }

            record.spec_status = SpecStatus::CancelledRunFinally;
            executions.update_execution(&record).await?;
            Ok(true)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::event::State as EventState;
    use crate::models::execution::{Condition, ConditionStatus, State};
    use crate::models::ExecutionRecord;
    use crate::store::{memory, racing::RacingStore};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use tokio::sync::broadcast;

    fn repository() -> Repository {
        Repository::new("foo", "foo", "https://github.com/fooorg/foo", None)
    }

    fn cancel_event(target: Option<&str>) -> Event {
        Event {
            trigger_target: TriggerTarget::PullRequest,
            url: "https://github.com/fooorg/foo".into(),
            organization: "fooorg".into(),
            repository: "foo".into(),
            sha: "foosha".into(),
            pull_request_number: Some(11),
            state: EventState {
                cancel_pipeline_runs: true,
                target_cancel_pipeline_run: target.map(String::from),
            },
            ..Default::default()
        }
    }

    fn record(name: &str, original_name: Option<&str>) -> ExecutionRecord {
        let mut labels = BTreeMap::from([
            (labels::URL_REPOSITORY.to_string(), "foo".to_string()),
            (labels::SHA.to_string(), "foosha".to_string()),
            (labels::PULL_REQUEST.to_string(), "11".to_string()),
        ]);
        if let Some(original_name) = original_name {
            labels.insert(labels::ORIGINAL_PR_NAME.to_string(), original_name.to_string());
        }

        let mut record = ExecutionRecord::new("foo", name, labels);
        record.set_state(State::Started);
        record
    }

    async fn setup(records: Vec<ExecutionRecord>) -> (Arc<memory::Engine>, CancellationResolver) {
        let store = Arc::new(memory::Engine::new());
        for record in records {
            store.create_execution(&record).await.unwrap();
        }

        let resolver = CancellationResolver::new(store.clone(), RetryConfig::DEFAULT);
        (store, resolver)
    }

    async fn status_of(store: &memory::Engine, name: &str) -> SpecStatus {
        store
            .get_execution(&ExecutionKey::new("foo", name))
            .await
            .unwrap()
            .spec_status
    }

    async fn version_of(store: &memory::Engine, name: &str) -> u64 {
        store
            .get_execution(&ExecutionKey::new("foo", name))
            .await
            .unwrap()
            .resource_version
    }

    #[tokio::test]
    async fn ignores_events_that_are_not_pull_requests() {
        let (store, resolver) = setup(vec![record("pr-foo", None)]).await;

        for trigger_target in [TriggerTarget::Push, TriggerTarget::Comment, TriggerTarget::Other] {
            let event = Event {
                trigger_target,
                ..cancel_event(None)
            };
            resolver.cancel_executions(&event, &repository()).await.unwrap();
        }

        assert_eq!(status_of(&store, "pr-foo").await, SpecStatus::Unset);
        assert_eq!(version_of(&store, "pr-foo").await, 1);
    }

    #[tokio::test]
    async fn ignores_pull_requests_without_cancel_intent() {
        let (store, resolver) = setup(vec![record("pr-foo", None)]).await;
        let event = Event {
            state: EventState::default(),
            ..cancel_event(None)
        };

        resolver.cancel_executions(&event, &repository()).await.unwrap();

        assert_eq!(status_of(&store, "pr-foo").await, SpecStatus::Unset);
    }

    #[tokio::test]
    async fn cancels_the_matching_running_execution() {
        let (store, resolver) = setup(vec![record("pr-foo", None)]).await;

        resolver
            .cancel_executions(&cancel_event(None), &repository())
            .await
            .unwrap();

        assert_eq!(
            status_of(&store, "pr-foo").await,
            SpecStatus::CancelledRunFinally
        );
    }

    #[tokio::test]
    async fn nothing_to_cancel_is_success() {
        let (_, resolver) = setup(vec![]).await;

        resolver
            .cancel_executions(&cancel_event(None), &repository())
            .await
            .unwrap();
        resolver
            .cancel_executions(&cancel_event(Some("pr-nothing")), &repository())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn target_narrows_to_one_logical_pipeline() {
        let (store, resolver) = setup(vec![
            record("pr-foo-abc-123", Some("pr-foo-abc")),
            record("pr-foo-1", Some("pr-foo")),
            record("pr-foo-2", None),
        ])
        .await;

        resolver
            .cancel_executions(&cancel_event(Some("pr-foo-abc")), &repository())
            .await
            .unwrap();

        assert_eq!(
            status_of(&store, "pr-foo-abc-123").await,
            SpecStatus::CancelledRunFinally
        );
        assert_eq!(status_of(&store, "pr-foo-1").await, SpecStatus::Unset);
        assert_eq!(status_of(&store, "pr-foo-2").await, SpecStatus::Unset);
    }

    #[tokio::test]
    async fn leaves_finished_and_stopping_executions_alone() {
        let mut succeeded = record("pr-foo-succeeded", None);
        succeeded.conditions = vec![Condition::succeeded(ConditionStatus::True, "Succeeded")];

        let mut stopped = record("pr-foo-stopped", None);
        stopped.spec_status = SpecStatus::StoppedRunFinally;

        let (store, resolver) = setup(vec![succeeded, stopped]).await;

        resolver
            .cancel_executions(&cancel_event(None), &repository())
            .await
            .unwrap();

        assert_eq!(status_of(&store, "pr-foo-succeeded").await, SpecStatus::Unset);
        assert_eq!(version_of(&store, "pr-foo-succeeded").await, 1);
        assert_eq!(
            status_of(&store, "pr-foo-stopped").await,
            SpecStatus::StoppedRunFinally
        );
        assert_eq!(version_of(&store, "pr-foo-stopped").await, 1);
    }

    #[tokio::test]
    async fn mixed_batches_only_touch_eligible_records() {
        let mut failed = record("pr-foo-failed", None);
        failed.conditions = vec![Condition::succeeded(ConditionStatus::False, "Failed")];

        let mut queued = record("pr-foo-queued", None);
        queued.set_state(State::Queued);
        queued.spec_status = SpecStatus::Pending;

        let (store, resolver) = setup(vec![failed, queued, record("pr-foo-running", None)]).await;

        resolver
            .cancel_executions(&cancel_event(None), &repository())
            .await
            .unwrap();

        assert_eq!(status_of(&store, "pr-foo-failed").await, SpecStatus::Unset);
        assert_eq!(
            status_of(&store, "pr-foo-queued").await,
            SpecStatus::CancelledRunFinally
        );
        assert_eq!(
            status_of(&store, "pr-foo-running").await,
            SpecStatus::CancelledRunFinally
        );
    }

    #[tokio::test]
    async fn cancelling_twice_changes_nothing() {
        let (store, resolver) = setup(vec![record("pr-foo", None)]).await;

        resolver
            .cancel_executions(&cancel_event(None), &repository())
            .await
            .unwrap();
        let version = version_of(&store, "pr-foo").await;

        resolver
            .cancel_executions(&cancel_event(None), &repository())
            .await
            .unwrap();

        assert_eq!(version_of(&store, "pr-foo").await, version);
        assert_eq!(
            status_of(&store, "pr-foo").await,
            SpecStatus::CancelledRunFinally
        );
    }

    #[tokio::test]
    async fn only_matches_the_same_commit_and_request() {
        let mut other_sha = record("other-sha", None);
        other_sha
            .labels
            .insert(labels::SHA.to_string(), "barsha".to_string());

        let mut other_request = record("other-request", None);
        other_request
            .labels
            .insert(labels::PULL_REQUEST.to_string(), "12".to_string());

        let (store, resolver) = setup(vec![other_sha, other_request]).await;

        resolver
            .cancel_executions(&cancel_event(None), &repository())
            .await
            .unwrap();

        assert_eq!(status_of(&store, "other-sha").await, SpecStatus::Unset);
        assert_eq!(status_of(&store, "other-request").await, SpecStatus::Unset);
    }

    #[test]
    fn selector_cleans_free_text() {
        let event = Event {
            repository: "fooorg/foo".into(),
            ..cancel_event(Some("pr-foo"))
        };

        assert_eq!(
            selector_for(&event).unwrap().to_string(),
            format!(
                "{}=fooorg-foo,{}=foosha,{}=11,{}=pr-foo",
                labels::URL_REPOSITORY,
                labels::SHA,
                labels::PULL_REQUEST,
                labels::ORIGINAL_PR_NAME
            )
        );

        let without_request = Event {
            pull_request_number: None,
            ..cancel_event(None)
        };
        assert_eq!(selector_for(&without_request), None);
    }

    /// Fails every update after the first.
    #[derive(Debug)]
    struct FlakyStore {
        inner: memory::Engine,
        updates: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ExecutionStore for FlakyStore {
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
            if self
                .updates
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                > 0
            {
                return Err(StoreError::Internal("disk on fire".into()));
            }

            self.inner.update_execution(record).await
        }

        async fn delete_execution(&self, key: &ExecutionKey) -> Result<(), StoreError> {
            self.inner.delete_execution(key).await
        }

        fn watch(&self) -> broadcast::Receiver<crate::store::WatchEvent> {
            self.inner.watch()
        }
    }

    #[tokio::test]
    async fn first_persistence_error_aborts_the_batch() {
        let store = Arc::new(FlakyStore {
            inner: memory::Engine::new(),
            updates: Default::default(),
        });
        for name in ["pr-foo-a", "pr-foo-b", "pr-foo-c"] {
            store.create_execution(&record(name, None)).await.unwrap();
        }

        let resolver = CancellationResolver::new(store.clone(), RetryConfig::DEFAULT);
        let err = resolver
            .cancel_executions(&cancel_event(None), &repository())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            CancelError::Persist {
                key: ExecutionKey::new("foo", "pr-foo-b"),
                source: StoreError::Internal("disk on fire".into()),
            }
        );

        let status = |name: &'static str| {
            let store = store.clone();
            async move {
                store
                    .get_execution(&ExecutionKey::new("foo", name))
                    .await
                    .unwrap()
                    .spec_status
            }
        };
        assert_eq!(status("pr-foo-a").await, SpecStatus::CancelledRunFinally);
        assert_eq!(status("pr-foo-b").await, SpecStatus::Unset);
        assert_eq!(status("pr-foo-c").await, SpecStatus::Unset);
    }

    #[tokio::test]
    /// A promotion that lands between reading and cancelling a record is kept; the cancel is applied on top of it.
    async fn cancellation_rereads_after_a_concurrent_promotion() {
        let store = Arc::new(memory::Engine::new());
        let mut queued = record("pr-foo", None);
        queued.set_state(State::Queued);
        queued.spec_status = SpecStatus::Pending;
        store.create_execution(&queued).await.unwrap();

        let racing = Arc::new(RacingStore::new(store.clone(), |record| {
            record.set_state(State::Started);
            record.spec_status = SpecStatus::Unset;
        }));
        let resolver = CancellationResolver::new(racing.clone(), RetryConfig::DEFAULT);

        resolver
            .cancel_executions(&cancel_event(None), &repository())
            .await
            .unwrap();

        assert!(racing.raced());
        let record = store
            .get_execution(&ExecutionKey::new("foo", "pr-foo"))
            .await
            .unwrap();
        assert_eq!(record.spec_status, SpecStatus::CancelledRunFinally);
        assert_eq!(record.state(), Some(State::Started));
        assert_eq!(record.resource_version, 3);
    }

    #[tokio::test]
    async fn cancellation_skips_records_that_finished_concurrently() {
        let (store, _) = setup(vec![record("pr-foo", None)]).await;

        let racing = Arc::new(RacingStore::new(store.clone(), |record| {
            record.conditions = vec![Condition::succeeded(ConditionStatus::True, "Succeeded")];
        }));
        let resolver = CancellationResolver::new(racing.clone(), RetryConfig::DEFAULT);

        resolver
            .cancel_executions(&cancel_event(None), &repository())
            .await
            .unwrap();

        assert!(racing.raced());
        assert_eq!(status_of(&store, "pr-foo").await, SpecStatus::Unset);
        assert_eq!(version_of(&store, "pr-foo").await, 2);
    }
}
