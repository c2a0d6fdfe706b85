//! Decides whether the sender of an event may trigger executions.
//!
//! An actor is allowed when any of the following holds, checked in order:
//!
//! 1. The provider says they are a member of the repository.
//! 2. They are listed in the repository's OWNERS file on the default branch.
//! 3. Somebody who passes checks 1 or 2 opened a discussion thread on the pull request with an ok-to-test
//!    comment.
//!
//! Failing to read membership or the OWNERS file only closes that path. Failing to list discussions fails the
//! whole decision, since there is no remaining path to fall back on.

pub mod owners;


use crate::conf::{self, watch::HotSettings};
use crate::models::{Actor, Event};
use crate::provider::{Provider, ProviderError, RepoId};
use owners::Owners;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use strum::{Display, EnumString};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const DEFAULT_OK_TO_TEST_REGEX: &str = r"(?i)(^|\n)/ok-to-test(\r?\n|$)";
pub const DEFAULT_OWNERS_FILE: &str = "OWNERS";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AclError {
    /// There is no provider to ask. This is a setup problem and retrying will not help.
    #[error("no provider client has been initialized (hint: is a provider configured for pacer?)")]
    NotConfigured,

    #[error("invalid ok-to-test regex '{regex}'; {reason}")]
    InvalidRegex { regex: String, reason: String },

    #[error("could not check membership of '{login}'; {source}")]
    Membership {
        login: String,
        source: ProviderError,
    },

    #[error("could not list discussions for request {request}; {source}")]
    Discussions { request: u64, source: ProviderError },
}

/// What to do when the provider cannot answer a membership question.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MembershipErrorPolicy {
    /// Log the error and continue with the OWNERS file.
    #[default]
    FallThrough,

    /// Fail the authorization decision with the lookup error.
    Propagate,
}

/// The acl settings in their ready to use form.
#[derive(Debug)]
struct Policy {
    source: conf::Acl,
    ok_to_test: Regex,
}

impl Policy {
    fn new(source: conf::Acl) -> Result<Self, AclError> {
        let ok_to_test =
            Regex::new(&source.ok_to_test_regex).map_err(|e| AclError::InvalidRegex {
                regex: source.ok_to_test_regex.clone(),
                reason: e.to_string(),
            })?;

        Ok(Self { source, ok_to_test })
    }
}

#[derive(Debug, Clone)]
pub struct Authorizer {
    provider: Option<Arc<dyn Provider>>,
    settings: watch::Receiver<HotSettings>,

    /// The compiled form of the settings last seen on the channel.
    policy: Arc<Mutex<Option<Arc<Policy>>>>,
}

impl Authorizer {
    pub fn new(provider: Option<Arc<dyn Provider>>, settings: watch::Receiver<HotSettings>) -> Self {
        Self {
            provider,
            settings,
            policy: Arc::new(Mutex::new(None)),
        }
    }

    /// An authorizer with settings that never change.
    pub fn with_acl(provider: Option<Arc<dyn Provider>>, acl: conf::Acl) -> Self {
        let (_, settings) = watch::channel(HotSettings {
            acl,
            max_concurrency: 0,
        });

        Self::new(provider, settings)
    }

    fn policy(&self) -> Result<Arc<Policy>, AclError> {
        let acl = self.settings.borrow().acl.clone();

        let mut cached = self.policy.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(policy) = cached.as_ref().filter(|policy| policy.source == acl) {
            return Ok(policy.clone());
        }

        let policy = Arc::new(Policy::new(acl)?);
        *cached = Some(policy.clone());
        Ok(policy)
    }

    pub async fn is_allowed(&self, event: &Event) -> Result<bool, AclError> {
        let provider = self.provider.as_deref().ok_or(AclError::NotConfigured)?;
        let policy = self.policy()?;
        let repo = RepoId::from(event);

        if self
            .allowed_as(provider, &policy, &repo, event, &event.sender)
            .await?
        {
            return Ok(true);
        }

        self.ok_to_test_from_allowed_member(provider, &policy, &repo, event)
            .await
    }

    /// Membership first, then OWNERS.
    async fn allowed_as(
        &self,
        provider: &dyn Provider,
        policy: &Policy,
        repo: &RepoId,
        event: &Event,
        actor: &Actor,
    ) -> Result<bool, AclError> {
        match provider.check_membership(repo, actor).await {
            Ok(true) => {
                debug!(login = actor.login, repository = repo.full_name(), "actor is a repository member");
                return Ok(true);
            }
            Ok(false) => {}
            Err(e) => match policy.source.membership_error_policy {
                MembershipErrorPolicy::FallThrough => {
                    warn!(error = %e, login = actor.login, repository = repo.full_name(),
                        "membership lookup failed; falling back to the owners file");
                }
                MembershipErrorPolicy::Propagate => {
                    return Err(AclError::Membership {
                        login: actor.login.clone(),
                        source: e,
                    });
                }
            },
        }

        Ok(self
            .allowed_by_owners(provider, policy, repo, event, actor)
            .await)
    }

    /// Any failure here only means the OWNERS file grants nothing.
    async fn allowed_by_owners(
        &self,
        provider: &dyn Provider,
        policy: &Policy,
        repo: &RepoId,
        event: &Event,
        actor: &Actor,
    ) -> bool {
        let owners_file = &policy.source.owners_file;

        let content = match provider
            .fetch_file(repo, owners_file, &event.default_branch)
            .await
        {
            Ok(content) => content,
            Err(e) => {
                debug!(error = %e, file = owners_file, repository = repo.full_name(),
                    "could not fetch owners file");
                return false;
            }
        };

        if content.is_empty() {
            return false;
        }

        match Owners::parse(&content) {
            Ok(owners) => {
                let listed = owners.contains(&actor.login);
                if listed {
                    debug!(login = actor.login, file = owners_file, "actor is listed in owners file");
                }
                listed
            }
            Err(e) => {
                debug!(error = %e, file = owners_file, repository = repo.full_name(),
                    "could not parse owners file");
                false
            }
        }
    }

    /// Only the note that opened a thread counts. Replies further down never authorize anything.
    async fn ok_to_test_from_allowed_member(
        &self,
        provider: &dyn Provider,
        policy: &Policy,
        repo: &RepoId,
        event: &Event,
    ) -> Result<bool, AclError> {
        let Some(request) = event.pull_request_number else {
            return Ok(false);
        };

        let discussions = provider
            .list_discussions(repo, request)
            .await
            .map_err(|source| AclError::Discussions { request, source })?;

        for discussion in discussions {
            let Some(top) = discussion.notes.first() else {
                continue;
            };

            if !policy.ok_to_test.is_match(&top.body) {
                continue;
            }

            if self
                .allowed_as(provider, policy, repo, event, &top.author)
                .await?
            {
                info!(sender = event.sender.login, approver = top.author.login, request,
                    "event allowed through ok-to-test comment");
                return Ok(true);
            }
        }

        Ok(false)
    }
}
