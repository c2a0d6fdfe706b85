use serde::{Deserialize, Serialize};

/// A registration of a source-control repository that pacer watches events for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub namespace: String,
    pub name: String,

    /// The URL events for this repository will carry.
    pub url: String,

    /// Maximum number of execution records allowed to run at the same time for this repository.
    /// None or zero means no limit of its own.
    pub concurrency_limit: Option<u64>,
}

impl Repository {
    pub fn new(namespace: &str, name: &str, url: &str, concurrency_limit: Option<u64>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            url: url.into(),
            concurrency_limit,
        }
    }

    /// The key this repository's admission queue is stored under.
    pub fn queue_key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Whether the given URL points at this repository. Trailing slashes and a `.git` suffix are ignored.
    pub fn matches_url(&self, url: &str) -> bool {
        normalize_url(&self.url) == normalize_url(url)
    }
}

fn normalize_url(url: &str) -> &str {
    let url = url.trim().trim_end_matches('/');
    url.strip_suffix(".git").unwrap_or(url)
}
