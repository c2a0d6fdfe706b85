use super::{
    api_error, endpoint, is_not_found, parse_base_url, Discussion, Note, Provider, ProviderError,
    RepoId, MAX_PAGES, USER_AGENT,
};
use crate::models::Actor;
use async_trait::async_trait;
use reqwest::{header, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

pub const DEFAULT_API_URL: &str = "https://api.github.com/";

const RAW_MEDIA_TYPE: &str = "application/vnd.github.raw+json";

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: u64,
    login: String,
}

#[derive(Debug, Deserialize)]
struct ApiComment {
    user: ApiUser,
    #[serde(default)]
    body: String,
}

/// Issue comments are flat, so every comment is a thread of one.
impl From<ApiComment> for Discussion {
    fn from(comment: ApiComment) -> Self {
        Discussion {
            notes: vec![Note {
                author: Actor::new(&comment.user.id.to_string(), &comment.user.login),
                body: comment.body,
            }],
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
            header::AUTHORIZATION,
            header::HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
                ProviderError::Configuration(format!("token is not a valid header value; {e}"))
            })?,
        );
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/vnd.github+json"),
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

    /// GitHub answers membership style questions with 204 for yes and 404 for no.
    async fn answers_yes(&self, url: Url) -> Result<bool, ProviderError> {
        let response = self.http.get(url).send().await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(true),
            status if is_not_found(status) => Ok(false),
            status if status.is_success() => Ok(true),
            _ => Err(api_error(response).await),
        }
    }
}

#[async_trait]
impl Provider for Client {
    #[instrument(skip(self), fields(provider = "github"), level = "debug")]
    async fn check_membership(&self, repo: &RepoId, user: &Actor) -> Result<bool, ProviderError> {
        let org_member = endpoint(
            &self.base,
            ["orgs", repo.organization.as_str(), "members", user.login.as_str()],
        )?;

        if self.answers_yes(org_member).await? {
            return Ok(true);
        }

        let collaborator = endpoint(
            &self.base,
            [
                "repos",
                repo.organization.as_str(),
                repo.repository.as_str(),
                "collaborators",
                user.login.as_str(),
            ],
        )?;

        self.answers_yes(collaborator).await
    }

    #[instrument(skip(self), fields(provider = "github"), level = "debug")]
    async fn fetch_file(
        &self,
        repo: &RepoId,
        path: &str,
        git_ref: &str,
    ) -> Result<Vec<u8>, ProviderError> {
        let segments = ["repos", repo.organization.as_str(), repo.repository.as_str(), "contents"]
            .into_iter()
            .chain(path.split('/').filter(|segment| !segment.is_empty()));

        let mut url = endpoint(&self.base, segments)?;
        url.query_pairs_mut().append_pair("ref", git_ref);

        let response = self
            .http
            .get(url)
            .header(header::ACCEPT, RAW_MEDIA_TYPE)
            .send()
            .await?;

        if is_not_found(response.status()) {
            return Ok(vec![]);
        }

        if !response.status().is_success() {
            return Err(api_error(response).await);
        }

        Ok(response.bytes().await?.to_vec())
    }

    #[instrument(skip(self), fields(provider = "github"), level = "debug")]
    async fn list_discussions(
        &self,
        repo: &RepoId,
        request_id: u64,
    ) -> Result<Vec<Discussion>, ProviderError> {
        let mut url = endpoint(
            &self.base,
            [
                "repos",
                repo.organization.as_str(),
                repo.repository.as_str(),
                "issues",
                request_id.to_string().as_str(),
                "comments",
            ],
        )?;
        url.query_pairs_mut().append_pair("per_page", "100");

        let mut discussions = vec![];

        for _ in 0..MAX_PAGES {
            let response = self.http.get(url.clone()).send().await?;

            if !response.status().is_success() {
                return Err(api_error(response).await);
            }

            let next = next_link(response.headers());
            let batch: Vec<ApiComment> = response.json().await?;
            discussions.extend(batch.into_iter().map(Discussion::from));

            match next {
                Some(next) => {
                    url = Url::parse(&next).map_err(|e| {
                        ProviderError::Parse(format!("invalid next page link '{next}'; {e}"))
                    })?;
                }
                None => return Ok(discussions),
            }
        }

        debug!(pages = MAX_PAGES, "stopped following comment pages");
        Ok(discussions)
    }
}

/// Extracts the `rel="next"` target from a `Link` header.
fn next_link(headers: &header::HeaderMap) -> Option<String> {
    let link = headers.get(header::LINK)?.to_str().ok()?;

    link.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        let is_next = params
            .split(';')
            .any(|param| param.trim() == r#"rel="next""#);

        is_next.then(|| {
            target
                .trim()
                .trim_start_matches('<')
                .trim_end_matches('>')
                .to_string()
        })
    })
}
