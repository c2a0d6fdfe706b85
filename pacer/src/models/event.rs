use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(
    Debug, Clone, Copy, Display, Default, PartialEq, EnumString, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum TriggerTarget {
    Push,
    PullRequest,
    Comment,

    #[default]
    Other,
}

/// Somebody acting on the source-control provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    /// The provider specific user identifier. Some providers (GitLab) key membership by a numeric id.
    pub id: String,

    /// The user's handle.
    pub login: String,
}

impl Actor {
    pub fn new(id: &str, login: &str) -> Self {
        Self {
            id: id.into(),
            login: login.into(),
        }
    }
}

/// Operator intent carried by an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct State {
    /// Cancel the execution records that match this event instead of starting new ones.
    pub cancel_pipeline_runs: bool,

    /// Limit the cancellation to the records created from this logical pipeline name. None cancels everything
    /// matching.
    pub target_cancel_pipeline_run: Option<String>,
}

/// A normalized source-control event. Events are constructed by whatever parses the provider webhook and are
/// never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Event {
    pub trigger_target: TriggerTarget,

    /// The provider's name for the event, for example "Merge Request Hook". Informational only.
    pub event_type: String,

    /// Full URL of the repository the event originated from.
    pub url: String,

    pub organization: String,

    /// Short name of the repository.
    pub repository: String,

    /// Numeric project identity for providers that need one.
    pub project_id: Option<u64>,

    pub sha: String,
    pub base_branch: String,
    pub head_branch: String,
    pub default_branch: String,

    pub pull_request_number: Option<u64>,

    pub sender: Actor,

    pub state: State,
}

impl Event {
    /// Returns the explicit cancellation target, treating an empty string the same as no target.
    pub fn cancel_target(&self) -> Option<&str> {
        self.state
            .target_cancel_pipeline_run
            .as_deref()
            .filter(|target| !target.is_empty())
    }
}
