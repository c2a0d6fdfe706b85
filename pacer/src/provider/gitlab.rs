use super::{
    api_error, endpoint, is_not_found, parse_base_url, Discussion, Note, Provider, ProviderError,
    RepoId, MAX_PAGES, USER_AGENT,
};
use crate::models::Actor;
use async_trait::async_trait;
use reqwest::{header, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

pub const DEFAULT_API_URL: &str = "https://gitlab.com/api/v4/";

const PAGE_SIZE: &str = "100";

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: u64,
    username: String,
}

#[derive(Debug, Deserialize)]
struct ApiNote {
    author: ApiUser,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct ApiDiscussion {
    #[serde(default)]
    notes: Vec<ApiNote>,
}

#[derive(Debug, Deserialize)]
struct ApiMember {
    id: u64,
}

impl From<ApiDiscussion> for Discussion {
    fn from(discussion: ApiDiscussion) -> Self {
        Discussion {
            notes: discussion
                .notes
                .into_iter()
                .map(|note| Note {
                    author: Actor::new(&note.author.id.to_string(), &note.author.username),
                    body: note.body,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base: Url,
}

impl Client {
    pub fn new(api_url: &str, token: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            "PRIVATE-TOKEN",
            header::HeaderValue::from_str(token).map_err(|e| {
                ProviderError::Configuration(format!("token is not a valid header value; {e}"))
            })?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base: parse_base_url(api_url)?,
        })
    }

    /// Projects are addressed by numeric id when known, otherwise by their encoded full path.
    fn project(&self, repo: &RepoId) -> String {
        match repo.project_id {
            Some(id) => id.to_string(),
            None => repo.full_name(),
        }
    }
}

#[async_trait]
impl Provider for Client {
    #[instrument(skip(self), fields(provider = "gitlab"), level = "debug")]
    async fn check_membership(&self, repo: &RepoId, user: &Actor) -> Result<bool, ProviderError> {
        let url = endpoint(
            &self.base,
            ["projects", self.project(repo).as_str(), "members", "all", user.id.as_str()],
        )?;

        let response = self.http.get(url).send().await?;

        if is_not_found(response.status()) {
            return Ok(false);
        }

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        let member: ApiMember = response.json().await?;
        Ok(member.id.to_string() == user.id)
    }

    #[instrument(skip(self), fields(provider = "gitlab"), level = "debug")]
    async fn fetch_file(
        &self,
        repo: &RepoId,
        path: &str,
        git_ref: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let mut url = endpoint(
            &self.base,
            ["projects", self.project(repo).as_str(), "repository", "files", path, "raw"],
        )?;
        url.query_pairs_mut().append_pair("ref", git_ref);

        let response = self.http.get(url).send().await?;

        if is_not_found(response.status()) {
            return Ok(vec![]);
        }

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        Ok(response.bytes().await?.to_vec())
    }

    #[instrument(skip(self), fields(provider = "gitlab"), level = "debug")]
    async fn list_discussions(
        &self,
        repo: &RepoId,
        request_id: u64,
    ) -> Result<Vec<Discussion>, ProviderError> {
        let project = self.project(repo);
        let request = request_id.to_string();

        let mut discussions = vec![];
        let mut page = String::from("1");

        for _ in 0..MAX_PAGES {
            let mut url = endpoint(
                &self.base,
                ["projects", project.as_str(), "merge_requests", request.as_str(), "discussions"],
            )?;
            url.query_pairs_mut()
                .append_pair("per_page", PAGE_SIZE)
                .append_pair("page", page.as_str());

            let response = self.http.get(url).send().await?;

            if !response.status().is_success() {
                return Err(api_error(response).await);
            }

            let next = next_page(response.headers());
            let batch: Vec<ApiDiscussion> = response.json().await?;
            discussions.extend(batch.into_iter().map(Discussion::from));

            match next {
                Some(next) => page = next,
                None => return Ok(discussions),
            }
        }

        debug!(pages = MAX_PAGES, "stopped following discussion pages");
        Ok(discussions)
    }
}

/// GitLab sets `x-next-page` to the next page number, or to an empty string on the last page.
fn next_page(headers: &header::HeaderMap) -> Option<String> {
    headers
        .get("x-next-page")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
}
