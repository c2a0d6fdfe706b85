use super::labels;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use strum::{Display, EnumString};

/// Name of the condition the execution engine uses to report completion.
pub const CONDITION_SUCCEEDED: &str = "Succeeded";

/// The namespaced identity of an execution record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExecutionKey {
    pub namespace: String,
    pub name: String,
}

impl ExecutionKey {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The value of the `state` label. Records without the label are not managed by pacer.
#[derive(Debug, Clone, Copy, Display, PartialEq, EnumString, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum State {
    /// Admitted and handed to the execution engine.
    Started,

    /// Waiting behind the repository's concurrency limit.
    Queued,

    /// Finished and already removed from the admission queue.
    Completed,
}

/// The mutable `spec.status` field of an execution record. The string forms are the tokens the execution
/// engine understands.
#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Hash, Serialize, Deserialize,
)]
pub enum SpecStatus {
    /// Pending or running normally.
    #[default]
    #[serde(rename = "")]
    #[strum(serialize = "")]
    Unset,

    /// Created but held back from the execution engine until admitted.
    #[serde(rename = "PipelineRunPending")]
    #[strum(serialize = "PipelineRunPending")]
    Pending,

    /// A graceful stop was requested.
    #[serde(rename = "StoppedRunFinally")]
    #[strum(serialize = "StoppedRunFinally")]
    StoppedRunFinally,

    /// Cancellation was requested.
    #[serde(rename = "CancelledRunFinally")]
    #[strum(serialize = "CancelledRunFinally")]
    CancelledRunFinally,
}

impl SpecStatus {
    /// Stop and cancel requests can never be taken back.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            SpecStatus::StoppedRunFinally | SpecStatus::CancelledRunFinally
        )
    }
}

#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Hash, Serialize, Deserialize,
)]
pub enum ConditionStatus {
    True,
    False,

    #[default]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub kind: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Condition {
    pub fn succeeded(status: ConditionStatus, reason: &str) -> Self {
        Self {
            kind: CONDITION_SUCCEEDED.into(),
            status,
            reason: reason.into(),
            message: String::new(),
        }
    }
}

/// One pipeline execution instance as seen by pacer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub namespace: String,
    pub name: String,

    /// Time of creation in epoch milliseconds. Used to restore queue order after a restart.
    pub created: u64,

    /// Bumped by the store on every successful write. Updates carrying a stale version are rejected.
    pub resource_version: u64,

    /// Flat key/value tags. Selected on through the store's label index.
    pub labels: BTreeMap<String, String>,

    pub spec_status: SpecStatus,

    /// Reported by the execution engine.
    pub conditions: Vec<Condition>,
}

impl ExecutionRecord {
    pub fn new(namespace: &str, name: &str, labels: BTreeMap<String, String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            created: crate::epoch_milli(),
            resource_version: 0,
            labels,
            spec_status: SpecStatus::Unset,
            conditions: vec![],
        }
    }

    pub fn key(&self) -> ExecutionKey {
        ExecutionKey::new(&self.namespace, &self.name)
    }

    /// Whether pacer is responsible for this record at all.
    pub fn is_managed(&self) -> bool {
        self.labels.contains_key(labels::STATE)
    }

    /// Returns the parsed state label. Records with an unrecognized value are treated like records without one.
    pub fn state(&self) -> Option<State> {
        self.labels
            .get(labels::STATE)
            .and_then(|value| value.parse().ok())
    }

    pub fn set_state(&mut self, state: State) {
        self.labels
            .insert(labels::STATE.to_string(), state.to_string());
    }

    /// Name of the repository registration this record belongs to. Lives in the same namespace as the record.
    pub fn repository(&self) -> Option<&str> {
        self.labels.get(labels::REPOSITORY).map(String::as_str)
    }

    pub fn condition(&self, kind: &str) -> Option<&Condition> {
        self.conditions.iter().find(|condition| condition.kind == kind)
    }

    /// A record is done once the execution engine reports a definitive success or failure.
    pub fn is_done(&self) -> bool {
        matches!(
            self.condition(CONDITION_SUCCEEDED).map(|c| c.status),
            Some(ConditionStatus::True) | Some(ConditionStatus::False)
        )
    }

    /// Records that are done or already asked to stop must never be targeted by a new cancellation.
    pub fn is_cancellable(&self) -> bool {
        !self.is_done() && !self.spec_status.is_final()
    }
}
