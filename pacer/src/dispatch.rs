//! Turns a normalized event into execution records.
//!
//! The dispatcher finds the repository the event is about, makes sure the sender may trigger anything, and
//! then either hands the event to the cancellation resolver or creates one record per requested pipeline.
//! Records are created queued when the repository has a concurrency limit and the reconciler takes it from
//! there.

use crate::acl::{AclError, Authorizer};
use crate::cancel::{CancelError, CancellationResolver};
use crate::conf::watch::HotSettings;
use crate::models::{
    execution::State, labels, Event, ExecutionKey, ExecutionRecord, Repository, SpecStatus,
    TriggerTarget,
};
use crate::provider::Provider;
use crate::store::{RetryConfig, StoreError, Stores};
use crate::{sync, validate};
use rand::{distributions::Alphanumeric, Rng};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Length of the random suffix appended to pipeline names.
const NAME_SUFFIX_LENGTH: usize = 5;

/// Attempts at finding a free record name before giving up.
const NAME_ATTEMPTS: usize = 3;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("invalid argument; {0}")]
    InvalidArgument(String),

    #[error("could not look up repositories; {0}")]
    Repositories(StoreError),

    #[error("could not authorize event; {0}")]
    Authorization(#[from] AclError),

    #[error("could not cancel executions; {0}")]
    Cancel(#[from] CancelError),

    /// Records created before this one are kept.
    #[error("could not create execution for pipeline '{pipeline}'; {source}")]
    Create {
        pipeline: String,
        source: StoreError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No registered repository matches the event URL.
    NoRepository,

    /// The sender may not trigger executions for this repository.
    Unauthorized,

    /// The event asked for cancellation and it was carried out.
    Cancelled,

    /// The event asked for cancellation but is not a pull request event carrying a pull request number, so
    /// there is nothing it could match. Nothing was cancelled or created.
    NotCancellable,

    Created(Vec<ExecutionKey>),
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    stores: Stores,
    authorizer: Authorizer,
    cancellation: CancellationResolver,
    settings: watch::Receiver<HotSettings>,
}

impl Dispatcher {
    pub fn new(
        stores: Stores,
        provider: Option<Arc<dyn Provider>>,
        settings: watch::Receiver<HotSettings>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            authorizer: Authorizer::new(provider, settings.clone()),
            cancellation: CancellationResolver::new(stores.executions.clone(), retry),
            stores,
            settings,
        }
    }

    pub async fn handle(&self, event: &Event, pipelines: &[String]) -> Result<Outcome, DispatchError> {
        for pipeline in pipelines {
            validate::arg(
                "pipeline",
                pipeline.as_str(),
                vec![validate::not_empty_str, is_valid_pipeline_name],
            )
            .map_err(DispatchError::InvalidArgument)?;
        }

        let Some(repository) = self.find_repository(&event.url).await? else {
            info!(url = event.url, "no repository registered for event");
            return Ok(Outcome::NoRepository);
        };

        if needs_authorization(event.trigger_target) && !self.authorizer.is_allowed(event).await? {
            info!(sender = event.sender.login, repository = repository.queue_key(),
                "sender is not allowed to trigger executions");
            return Ok(Outcome::Unauthorized);
        }

        if event.state.cancel_pipeline_runs {
            if event.trigger_target != TriggerTarget::PullRequest
                || event.pull_request_number.is_none()
            {
                info!(trigger_target = %event.trigger_target, pull_request = ?event.pull_request_number,
                    "cancellation requested by an event that cannot match executions; ignoring");
                return Ok(Outcome::NotCancellable);
            }

            self.cancellation
                .cancel_executions(event, &repository)
                .await?;
            return Ok(Outcome::Cancelled);
        }

        let limit = sync::effective_limit(
            repository.concurrency_limit,
            self.settings.borrow().max_concurrency,
        );

        let mut created = vec![];
        for pipeline in pipelines {
            let record = self.create(event, &repository, pipeline, limit.is_some()).await?;
            created.push(record.key());
        }

        Ok(Outcome::Created(created))
    }

    async fn find_repository(&self, url: &str) -> Result<Option<Repository>, DispatchError> {
        let repositories = self
            .stores
            .repositories
            .list_repositories(None)
            .await
            .map_err(DispatchError::Repositories)?;

        Ok(repositories
            .into_iter()
            .find(|repository| repository.matches_url(url)))
    }

    async fn create(
        &self,
        event: &Event,
        repository: &Repository,
        pipeline: &str,
        limited: bool,
    ) -> Result<ExecutionRecord, DispatchError> {
        let labels = execution_labels(event, repository, pipeline, limited);
        let mut last_error = StoreError::Exists;

        for _ in 0..NAME_ATTEMPTS {
            let mut record = ExecutionRecord::new(
                &repository.namespace,
                &execution_name(pipeline),
                labels.clone(),
            );
            if limited {
                record.spec_status = SpecStatus::Pending;
            }

            match self.stores.executions.create_execution(&record).await {
                Ok(record) => {
                    info!(namespace = record.namespace, name = record.name, pipeline,
                        state = ?record.state(), "execution created");
                    return Ok(record);
                }
                Err(StoreError::Exists) => {
                    debug!(namespace = record.namespace, name = record.name,
                        "execution name already taken; picking another");
                }
                Err(e) => {
                    last_error = e;
                    break;
                }
            }
        }

        warn!(pipeline, error = %last_error, "could not create execution");
        Err(DispatchError::Create {
            pipeline: pipeline.to_string(),
            source: last_error,
        })
    }
}

/// Pull requests and comments come from people who may not belong to the repository. Pushes can only come from
/// somebody with write access.
fn needs_authorization(trigger_target: TriggerTarget) -> bool {
    matches!(
        trigger_target,
        TriggerTarget::PullRequest | TriggerTarget::Comment
    )
}

/// Leaves room for the random suffix.
fn is_valid_pipeline_name(pipeline: &str) -> Result<(), String> {
    validate::is_valid_name(pipeline)?;

    if pipeline.len() + NAME_SUFFIX_LENGTH + 1 > validate::MAX_NAME_LENGTH {
        return Err(format!(
            "length cannot be greater than {}",
            validate::MAX_NAME_LENGTH - NAME_SUFFIX_LENGTH - 1
        ));
    }

    Ok(())
}

fn execution_name(pipeline: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NAME_SUFFIX_LENGTH)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();

    format!("{pipeline}-{suffix}")
}

fn execution_labels(
    event: &Event,
    repository: &Repository,
    pipeline: &str,
    limited: bool,
) -> BTreeMap<String, String> {
    let event_type = if event.event_type.is_empty() {
        event.trigger_target.to_string()
    } else {
        event.event_type.clone()
    };

    let state = if limited {
        State::Queued
    } else {
        State::Started
    };

    let mut labels = BTreeMap::from([
        (labels::REPOSITORY.to_string(), repository.name.clone()),
        (labels::URL_REPOSITORY.to_string(), labels::clean_value(&event.repository)),
        (labels::SHA.to_string(), labels::clean_value(&event.sha)),
        (labels::ORIGINAL_PR_NAME.to_string(), pipeline.to_string()),
        (labels::EVENT_TYPE.to_string(), labels::clean_value(&event_type)),
        (labels::SENDER.to_string(), labels::clean_value(&event.sender.login)),
        (labels::STATE.to_string(), state.to_string()),
    ]);

    if let Some(request) = event.pull_request_number {
        labels.insert(labels::PULL_REQUEST.to_string(), request.to_string());
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf;
    use crate::models::event::State as EventState;
    use crate::models::Actor;
    use crate::provider::fake::FakeProvider;
    use crate::store::LabelSelector;
    use lazy_regex::regex;
    use pretty_assertions::assert_eq;

    const URL: &str = "https://github.com/fooorg/foo";

    fn settings(max_concurrency: u64) -> watch::Receiver<HotSettings> {
        let (_, receiver) = watch::channel(HotSettings {
            acl: conf::Acl::default(),
            max_concurrency,
        });
        receiver
    }

    fn pull_request() -> Event {
        Event {
            trigger_target: TriggerTarget::PullRequest,
            event_type: "pull_request".into(),
            url: URL.into(),
            organization: "fooorg".into(),
            repository: "foo".into(),
            sha: "foosha".into(),
            default_branch: "main".into(),
            pull_request_number: Some(11),
            sender: Actor::new("1000", "contributor"),
            ..Default::default()
        }
    }

    fn pipelines(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    async fn dispatcher(
        limit: Option<u64>,
        provider: Option<FakeProvider>,
        max_concurrency: u64,
    ) -> (Dispatcher, Stores) {
        let stores = Stores::in_memory();
        stores
            .repositories
            .create_repository(&Repository::new("foo", "foo", URL, limit))
            .await
            .unwrap();

        let provider = provider.map(|provider| Arc::new(provider) as Arc<dyn Provider>);
        let dispatcher = Dispatcher::new(
            stores.clone(),
            provider,
            settings(max_concurrency),
            RetryConfig::DEFAULT,
        );

        (dispatcher, stores)
    }

    async fn all_records(stores: &Stores) -> Vec<ExecutionRecord> {
        stores
            .executions
            .list_executions(None, &LabelSelector::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_repositories_are_ignored() {
        let (dispatcher, stores) = dispatcher(None, None, 0).await;
        let event = Event {
            url: "https://github.com/fooorg/bar".into(),
            ..pull_request()
        };

        let outcome = dispatcher.handle(&event, &pipelines(&["pr-foo"])).await.unwrap();

        assert_eq!(outcome, Outcome::NoRepository);
        assert!(all_records(&stores).await.is_empty());
    }

    #[tokio::test]
    async fn strangers_create_nothing() {
        let (dispatcher, stores) = dispatcher(None, Some(FakeProvider::default()), 0).await;

        let outcome = dispatcher
            .handle(&pull_request(), &pipelines(&["pr-foo"]))
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::Unauthorized);
        assert!(all_records(&stores).await.is_empty());
    }

    #[tokio::test]
    async fn authorization_errors_propagate() {
        let (dispatcher, _) = dispatcher(None, None, 0).await;

        let err = dispatcher
            .handle(&pull_request(), &pipelines(&["pr-foo"]))
            .await
            .unwrap_err();

        assert_eq!(err, DispatchError::Authorization(AclError::NotConfigured));
    }

    #[tokio::test]
    async fn pushes_are_trusted() {
        let (dispatcher, stores) = dispatcher(None, None, 0).await;
        let event = Event {
            trigger_target: TriggerTarget::Push,
            pull_request_number: None,
            ..pull_request()
        };

        let outcome = dispatcher.handle(&event, &pipelines(&["push-foo"])).await.unwrap();

        let Outcome::Created(keys) = outcome else {
            panic!("expected records to be created");
        };
        assert_eq!(keys.len(), 1);

        let record = stores.executions.get_execution(&keys[0]).await.unwrap();
        assert!(!record.labels.contains_key(labels::PULL_REQUEST));
    }

    #[tokio::test]
    async fn unlimited_repositories_start_right_away() {
        let provider = FakeProvider::default().with_member("1000");
        let (dispatcher, stores) = dispatcher(None, Some(provider), 0).await;

        let outcome = dispatcher
            .handle(&pull_request(), &pipelines(&["pr-foo", "pr-bar"]))
            .await
            .unwrap();

        let Outcome::Created(keys) = outcome else {
            panic!("expected records to be created");
        };
        assert_eq!(keys.len(), 2);

        for key in &keys {
            let record = stores.executions.get_execution(key).await.unwrap();
            assert_eq!(record.state(), Some(State::Started));
            assert_eq!(record.spec_status, SpecStatus::Unset);
        }
    }

    #[tokio::test]
    async fn limited_repositories_queue_new_records() {
        let provider = FakeProvider::default().with_member("1000");
        let (dispatcher, stores) = dispatcher(Some(2), Some(provider), 0).await;

        let outcome = dispatcher
            .handle(&pull_request(), &pipelines(&["pr-foo"]))
            .await
            .unwrap();

        let Outcome::Created(keys) = outcome else {
            panic!("expected records to be created");
        };

        let record = stores.executions.get_execution(&keys[0]).await.unwrap();
        assert_eq!(record.namespace, "foo");
        assert!(regex!("^pr-foo-[a-z0-9]{5}$").is_match(&record.name));
        assert_eq!(record.spec_status, SpecStatus::Pending);

        let expected = BTreeMap::from([
            (labels::REPOSITORY.to_string(), "foo".to_string()),
            (labels::URL_REPOSITORY.to_string(), "foo".to_string()),
            (labels::SHA.to_string(), "foosha".to_string()),
            (labels::PULL_REQUEST.to_string(), "11".to_string()),
            (labels::ORIGINAL_PR_NAME.to_string(), "pr-foo".to_string()),
            (labels::EVENT_TYPE.to_string(), "pull_request".to_string()),
            (labels::SENDER.to_string(), "contributor".to_string()),
            (labels::STATE.to_string(), "queued".to_string()),
        ]);
        assert_eq!(record.labels, expected);
    }

    #[tokio::test]
    async fn global_ceiling_queues_unlimited_repositories() {
        let provider = FakeProvider::default().with_member("1000");
        let (dispatcher, stores) = dispatcher(None, Some(provider), 1).await;

        dispatcher
            .handle(&pull_request(), &pipelines(&["pr-foo"]))
            .await
            .unwrap();

        let records = all_records(&stores).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state(), Some(State::Queued));
    }

    #[tokio::test]
    async fn cancel_intent_cancels_instead_of_creating() {
        let provider = FakeProvider::default().with_member("1000");
        let (dispatcher, stores) = dispatcher(None, Some(provider), 0).await;

        dispatcher
            .handle(&pull_request(), &pipelines(&["pr-foo"]))
            .await
            .unwrap();

        let event = Event {
            state: EventState {
                cancel_pipeline_runs: true,
                target_cancel_pipeline_run: None,
            },
            ..pull_request()
        };
        let outcome = dispatcher.handle(&event, &pipelines(&["pr-foo"])).await.unwrap();

        assert_eq!(outcome, Outcome::Cancelled);

        let records = all_records(&stores).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].spec_status, SpecStatus::CancelledRunFinally);
    }

    #[tokio::test]
    async fn cancel_intent_outside_pull_requests_is_reported() {
        let provider = FakeProvider::default().with_member("1000");
        let (dispatcher, stores) = dispatcher(None, Some(provider), 0).await;

        dispatcher
            .handle(&pull_request(), &pipelines(&["pr-foo"]))
            .await
            .unwrap();

        let cancel = EventState {
            cancel_pipeline_runs: true,
            target_cancel_pipeline_run: None,
        };
        let push = Event {
            trigger_target: TriggerTarget::Push,
            event_type: "push".into(),
            state: cancel.clone(),
            ..pull_request()
        };
        let numberless = Event {
            pull_request_number: None,
            state: cancel,
            ..pull_request()
        };

        for event in [push, numberless] {
            let outcome = dispatcher.handle(&event, &pipelines(&["pr-foo"])).await.unwrap();
            assert_eq!(outcome, Outcome::NotCancellable);
        }

        let records = all_records(&stores).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].spec_status, SpecStatus::Unset);
    }

    #[tokio::test]
    async fn invalid_pipeline_names_are_rejected() {
        let provider = FakeProvider::default().with_member("1000");
        let (dispatcher, stores) = dispatcher(None, Some(provider), 0).await;

        let long = "a".repeat(60);
        for name in ["", "Pr-Foo", "pr_foo", long.as_str()] {
            let err = dispatcher
                .handle(&pull_request(), &pipelines(&["pr-ok", name]))
                .await
                .unwrap_err();
            assert!(matches!(err, DispatchError::InvalidArgument(_)), "{name}");
        }

        assert!(all_records(&stores).await.is_empty());
    }

    #[test]
    fn free_text_labels_are_cleaned() {
        let event = Event {
            repository: "fooorg/foo".into(),
            event_type: "Merge Request Hook".into(),
            sender: Actor::new("1", "renovate[bot]"),
            ..pull_request()
        };
        let repository = Repository::new("foo", "foo", URL, None);

        let labels = execution_labels(&event, &repository, "pr-foo", false);

        assert_eq!(labels[labels::URL_REPOSITORY], "fooorg-foo");
        assert_eq!(labels[labels::EVENT_TYPE], "Merge_Request_Hook");
        assert_eq!(labels[labels::SENDER], "renovate__bot__");
        assert_eq!(labels[labels::STATE], "started");
    }
}
