//! Upstream REST API client
//!
//! A single connection-pooled client owned by the gateway process. Every
//! call attaches the bearer token and the API version headers; callers are
//! expected to route through the response cache or the aggregator so a
//! request does not burn upstream rate-limit budget needlessly.

use crate::config::Config;
use crate::error::{GatewayError, Result};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

const API_VERSION_HEADER: &str = "X-GitHub-Api-Version";
const API_VERSION: &str = "2022-11-28";
const ACCEPT_JSON: &str = "application/vnd.github+json";

/// Normalized view of one upstream repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub name: String,
    pub full_name: String,
    pub stars: u64,
    pub language: Option<String>,
    pub html_url: String,
    pub description: Option<String>,
}

/// Normalized view of one upstream issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub state: String,
    pub html_url: String,
    pub description: Option<String>,
}

/// Raw repository shape as the upstream API returns it.
#[derive(Debug, Deserialize)]
struct RawRepo {
    name: String,
    full_name: String,
    stargazers_count: u64,
    language: Option<String>,
    html_url: String,
    description: Option<String>,
}

impl From<RawRepo> for Repo {
    fn from(raw: RawRepo) -> Self {
        Self {
            name: raw.name,
            full_name: raw.full_name,
            stars: raw.stargazers_count,
            language: raw.language,
            html_url: raw.html_url,
            description: raw.description,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    number: u64,
    title: String,
    state: String,
    html_url: String,
    body: Option<String>,
}

impl From<RawIssue> for Issue {
    fn from(raw: RawIssue) -> Self {
        Self {
            number: raw.number,
            title: raw.title,
            state: raw.state,
            html_url: raw.html_url,
            description: raw.body,
        }
    }
}

/// Connection-pooled client for the upstream REST API.
#[derive(Clone)]
pub struct UpstreamClient {
    client: reqwest::Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(config: &Config) -> Result<Self> {
        let mut auth_val = HeaderValue::from_str(&format!("Bearer {}", config.upstream_token))
            .map_err(|_| GatewayError::Config("upstream token is not a valid header value".to_string()))?;
        auth_val.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth_val);
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_JSON));
        headers.insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("hubgate/", env!("CARGO_PKG_VERSION"))),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.upstream_timeout)
            .build()
            .map_err(|e| GatewayError::Config(format!("failed to build upstream client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.upstream_base_url.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch a resource path and deserialize the JSON body.
    ///
    /// Consumes one unit of the upstream rate-limit budget per call.
    pub async fn fetch<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);

        let resp = self.client.get(&url).query(query).send().await?;
        let status = resp.status();

        if status == StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound);
        }
        if !status.is_success() {
            // The body may describe internal upstream detail; log it here
            // and surface only the status.
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(
                status = status.as_u16(),
                path,
                body_len = body.len(),
                "upstream call failed"
            );
            tracing::debug!(%body, "upstream error body");
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
            });
        }

        resp.json::<T>()
            .await
            .map_err(|e| GatewayError::Transport(format!("invalid upstream body: {e}")))
    }

    /// Fetch one repository as a normalized view.
    pub async fn get_repo(&self, owner: &str, name: &str) -> Result<Repo> {
        let raw: RawRepo = self.fetch(&format!("/repos/{owner}/{name}"), &[]).await?;
        Ok(raw.into())
    }

    /// List issues for a repository, first page only.
    pub async fn list_issues(&self, owner: &str, name: &str, state: &str) -> Result<Vec<Issue>> {
        let raw: Vec<RawIssue> = self
            .fetch(
                &format!("/repos/{owner}/{name}/issues"),
                &[("state", state), ("per_page", "100")],
            )
            .await?;
        Ok(raw.into_iter().map(Issue::from).collect())
    }

    /// Count the first page of a collection endpoint.
    ///
    /// Only an approximation of the live total: pagination past the first
    /// page is deliberately not followed.
    pub async fn count_collection(&self, path: &str, query: &[(&str, &str)]) -> Result<u64> {
        let mut query: Vec<(&str, &str)> = query.to_vec();
        query.push(("per_page", "100"));
        let items: Vec<serde_json::Value> = self.fetch(path, &query).await?;
        Ok(items.len() as u64)
    }
}

/// Retry a transport-failing operation with bounded exponential backoff.
///
/// Retries are a caller policy, not part of the client itself; only
/// `Transport` errors are retried, everything else returns immediately.
pub async fn with_retry<T, F, Fut>(max_attempts: u32, base_delay: Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(GatewayError::Transport(reason)) if attempt + 1 < max_attempts => {
                let delay = base_delay * 2u32.saturating_pow(attempt);
                tracing::warn!(%reason, attempt, delay_ms = delay.as_millis() as u64, "retrying upstream call");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
