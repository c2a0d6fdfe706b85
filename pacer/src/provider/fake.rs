//! An in-memory provider for tests.

use super::{Discussion, Note, Provider, ProviderError, RepoId};
use crate::models::Actor;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct FakeProvider {
    /// Actor ids the provider reports as members.
    pub members: HashSet<String>,
    pub membership_error: bool,

    /// Path -> content. Missing paths come back empty.
    pub files: HashMap<String, Vec<u8>>,
    pub file_error: bool,

    pub discussions: Vec<Discussion>,
    pub discussions_error: bool,

    /// Every actor id membership was asked about, in order.
    pub membership_checks: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn with_member(mut self, id: &str) -> Self {
        self.members.insert(id.into());
        self
    }

    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.files.insert(path.into(), content.as_bytes().to_vec());
        self
    }

    /// Adds a thread whose notes are written by the given (author, body) pairs.
    pub fn with_thread(mut self, notes: &[(Actor, &str)]) -> Self {
        self.discussions.push(Discussion {
            notes: notes
                .iter()
                .map(|(author, body)| Note {
                    author: author.clone(),
                    body: body.to_string(),
                })
                .collect(),
        });
        self
    }

    pub fn checked(&self) -> Vec<String> {
        self.membership_checks
            .lock()
            .map(|checks| checks.clone())
            .unwrap_or_default()
    }
}

fn unavailable() -> ProviderError {
    ProviderError::Api {
        status: 503,
        message: "service unavailable".into(),
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn check_membership(&self, _repo: &RepoId, user: &Actor) -> Result<bool, ProviderError> {
        if let Ok(mut checks) = self.membership_checks.lock() {
            checks.push(user.id.clone());
        }

        if self.membership_error {
            return Err(unavailable());
        }

        Ok(self.members.contains(&user.id))
    }

    async fn fetch_file(
        &self,
        _repo: &RepoId,
        path: &str,
        _git_ref: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        if self.file_error {
            return Err(unavailable());
        }

        Ok(self.files.get(path).cloned().unwrap_or_default())
    }

    async fn list_discussions(
        &self,
        _repo: &RepoId,
        _request_id: u64,
    ) -> Result<Vec<Discussion>, ProviderError> {
        if self.discussions_error {
            return Err(unavailable());
        }

        Ok(self.discussions.clone())
    }
}
