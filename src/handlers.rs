use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::aggregator::{AggregateResult, Aggregator, Metric};
use crate::cache::ResponseCache;
use crate::error::{GatewayError, Result};
use crate::upstream::{with_retry, Issue, Repo, UpstreamClient};
use crate::webhook::{DispatchOutcome, EventContext, EventDispatcher, WebhookEnvelope, WebhookVerifier};

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub upstream: Arc<UpstreamClient>,
    pub cache: Arc<ResponseCache>,
    pub aggregator: Arc<Aggregator>,
    pub verifier: Arc<WebhookVerifier>,
    pub dispatcher: Arc<EventDispatcher>,
    pub cache_ttl: Duration,
    pub cache_backend: &'static str,
}

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStateFilter {
    Open,
    Closed,
    All,
}

impl IssueStateFilter {
    fn as_str(self) -> &'static str {
        match self {
            IssueStateFilter::Open => "open",
            IssueStateFilter::Closed => "closed",
            IssueStateFilter::All => "all",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IssuesParams {
    pub state: Option<IssueStateFilter>,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: String,
    pub event: String,
    pub handled: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub cache_backend: String,
}

/// GET /resource/:owner/:name — cached repository view.
pub async fn get_resource(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<Repo>> {
    validate_segment(&owner)?;
    validate_segment(&name)?;

    let key = format!("repo:{owner}/{name}");
    let repo: Repo = state
        .cache
        .get_or_fetch(&key, state.cache_ttl, || {
            let upstream = Arc::clone(&state.upstream);
            let owner = owner.clone();
            let name = name.clone();
            async move {
                with_retry(RETRY_ATTEMPTS, RETRY_BASE_DELAY, || {
                    upstream.get_repo(&owner, &name)
                })
                .await
            }
        })
        .await?;

    Ok(Json(repo))
}

/// GET /resource/:owner/:name/issues — cached issue list, first page.
pub async fn get_resource_issues(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    Query(params): Query<IssuesParams>,
) -> Result<Json<Vec<Issue>>> {
    validate_segment(&owner)?;
    validate_segment(&name)?;

    let filter = params.state.unwrap_or(IssueStateFilter::Open);
    let key = format!("issues:{owner}/{name}:{}", filter.as_str());
    let issues: Vec<Issue> = state
        .cache
        .get_or_fetch(&key, state.cache_ttl, || {
            let upstream = Arc::clone(&state.upstream);
            let owner = owner.clone();
            let name = name.clone();
            async move {
                with_retry(RETRY_ATTEMPTS, RETRY_BASE_DELAY, || {
                    upstream.list_issues(&owner, &name, filter.as_str())
                })
                .await
            }
        })
        .await?;

    Ok(Json(issues))
}

/// GET /resource/:owner/:name/stats — cached aggregate statistics.
pub async fn get_resource_stats(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
) -> Result<Json<AggregateResult>> {
    validate_segment(&owner)?;
    validate_segment(&name)?;

    let key = format!("stats:{owner}/{name}");
    let stats: AggregateResult = state
        .cache
        .get_or_fetch(&key, state.cache_ttl, || {
            let aggregator = Arc::clone(&state.aggregator);
            let owner = owner.clone();
            let name = name.clone();
            async move { aggregator.aggregate(&owner, &name, &Metric::ALL).await }
        })
        .await?;

    Ok(Json(stats))
}

/// POST /webhook/:owner/:name — verify the callback and dispatch by event
/// type. Verification runs against the raw body before anything is parsed.
pub async fn post_webhook(
    State(state): State<AppState>,
    Path((owner, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    validate_segment(&owner)?;
    validate_segment(&name)?;

    let envelope = WebhookEnvelope::from_request(&headers, body, state.verifier.scheme());

    let event_type = state.verifier.verify(&envelope).map_err(|e| {
        tracing::warn!(
            owner = %owner,
            repo = %name,
            signature_present = envelope.signature_header.is_some(),
            "webhook signature verification failed"
        );
        e
    })?;

    let payload = serde_json::from_slice(&envelope.raw_body).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "webhook body is not JSON, dispatching with null payload");
        serde_json::Value::Null
    });

    let ctx = EventContext {
        owner,
        name,
        payload,
    };
    let outcome = state.dispatcher.dispatch(&event_type, &ctx).await?;

    Ok(Json(WebhookResponse {
        status: "ok".to_string(),
        event: event_type,
        handled: outcome == DispatchOutcome::Handled,
    }))
}

/// GET /health — liveness probe.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache_backend: state.cache_backend.to_string(),
    })
}

/// Owner and repository names are passed through to upstream paths, so
/// anything that is not a plain path segment is treated as nonexistent.
fn validate_segment(segment: &str) -> Result<()> {
    let ok = !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && segment != "."
        && segment != "..";

    if ok {
        Ok(())
    } else {
        tracing::debug!(segment, "rejecting malformed path segment");
        Err(GatewayError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_allow_common_repo_names() {
        assert!(validate_segment("acme").is_ok());
        assert!(validate_segment("my-repo_v2.0").is_ok());
    }

    #[test]
    fn segments_reject_traversal_and_separators() {
        assert!(validate_segment("..").is_err());
        assert!(validate_segment("").is_err());
        assert!(validate_segment("a/b").is_err());
        assert!(validate_segment("a?b=c").is_err());
    }

    #[test]
    fn issue_state_filter_deserializes_lowercase() {
        let filter: IssueStateFilter = serde_json::from_str(r#""closed""#).unwrap();
        assert_eq!(filter, IssueStateFilter::Closed);
    }
}
