//! Source-control provider clients.
//!
//! The authorization resolver only needs three capabilities from a provider, so that is all the [`Provider`]
//! trait exposes. Each forge gets its own small REST client built on reqwest.

#[cfg(test)]
pub mod fake;
pub mod github;
pub mod gitlab;

use crate::models::{Actor, Event};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use strum::{Display, EnumString};

/// Upper bound on pages followed for a single listing.
const MAX_PAGES: usize = 100;

const USER_AGENT: &str = concat!("pacer/", env!("CARGO_PKG_VERSION"));

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider request failed; {0}")]
    Transport(String),

    #[error("provider returned status {status}; {message}")]
    Api { status: u16, message: String },

    #[error("could not parse provider response; {0}")]
    Parse(String),

    /// The provider cannot be used as configured.
    #[error("provider is misconfigured; {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            return Self::Parse(value.to_string());
        }

        Self::Transport(value.to_string())
    }
}

/// The repository a provider call is about. Which fields matter depends on the forge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoId {
    pub organization: String,
    pub repository: String,

    /// Numeric project identity. Preferred by GitLab when present.
    pub project_id: Option<u64>,
}

impl RepoId {
    /// `organization/repository`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.organization, self.repository)
    }
}

impl From<&Event> for RepoId {
    fn from(event: &Event) -> Self {
        Self {
            organization: event.organization.clone(),
            repository: event.repository.clone(),
            project_id: event.project_id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Note {
    pub author: Actor,
    pub body: String,
}

/// A thread of notes on a pull or merge request. The first note is the one that opened the thread.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discussion {
    pub notes: Vec<Note>,
}

#[async_trait]
pub trait Provider: Debug + Send + Sync + 'static {
    /// Whether `user` is a member of the repository, inherited membership included.
    async fn check_membership(&self, repo: &RepoId, user: &Actor) -> Result<bool, ProviderError>;

    /// Raw contents of `path` at `git_ref`. A missing file is returned as empty content.
    async fn fetch_file(
        &self,
        repo: &RepoId,
        path: &str,
        git_ref: &str,
    ) -> Result<Vec<u8>, ProviderError>;

    async fn list_discussions(
        &self,
        repo: &RepoId,
        request_id: u64,
    ) -> Result<Vec<Discussion>, ProviderError>;
}

#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Kind {
    /// No provider; every authorization check fails with a configuration error.
    #[default]
    None,
    Github,
    Gitlab,
}

/// Builds the configured provider, or `None` when no provider is configured.
pub fn new(config: &crate::conf::Provider) -> Result<Option<Arc<dyn Provider>>, ProviderError> {
    let timeout = Duration::from_secs(config.timeout);

    match config.kind {
        Kind::None => Ok(None),
        Kind::Github => {
            let api_url = config.api_url.as_deref().unwrap_or(github::DEFAULT_API_URL);
            let client = github::Client::new(api_url, &config.token, timeout)?;
            Ok(Some(Arc::new(client)))
        }
        Kind::Gitlab => {
            let api_url = config.api_url.as_deref().unwrap_or(gitlab::DEFAULT_API_URL);
            let client = gitlab::Client::new(api_url, &config.token, timeout)?;
            Ok(Some(Arc::new(client)))
        }
    }
}

fn parse_base_url(api_url: &str) -> Result<Url, ProviderError> {
    let url = Url::parse(api_url)
        .map_err(|e| ProviderError::Configuration(format!("invalid api_url '{api_url}'; {e}")))?;

    if url.cannot_be_a_base() {
        return Err(ProviderError::Configuration(format!(
            "api_url '{api_url}' cannot be used as a base url"
        )));
    }

    Ok(url)
}

/// Appends path segments to the API base, percent-encoding each one. A segment containing `/` is kept as a
/// single encoded segment, which is what GitLab expects for project paths and file paths.
fn endpoint<I>(base: &Url, segments: I) -> Result<Url, ProviderError>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut url = base.clone();

    url.path_segments_mut()
        .map_err(|_| ProviderError::Configuration(format!("api_url '{base}' cannot be a base")))?
        .pop_if_empty()
        .extend(segments);

    Ok(url)
}

/// Turns a non-success response into an error, keeping the body for context.
async fn api_error(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let message = response.text().await.unwrap_or_default();

    ProviderError::Api {
        status: status.as_u16(),
        message,
    }
}

fn is_not_found(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND
}
