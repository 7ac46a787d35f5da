//! Aggregate statistics
//!
//! Fans out one upstream call per requested metric, all started
//! concurrently, and merges the outcomes into a single composite result.
//! A failing sub-fetch zeroes its metric instead of aborting the
//! aggregate; the call as a whole fails only when every metric fails.

use crate::error::{GatewayError, Result};
use crate::upstream::UpstreamClient;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Metrics derivable from first-page collection counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    OpenIssues,
    PullRequests,
    Contributors,
    Branches,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::OpenIssues,
        Metric::PullRequests,
        Metric::Contributors,
        Metric::Branches,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Metric::OpenIssues => "open_issues",
            Metric::PullRequests => "pull_requests",
            Metric::Contributors => "contributors",
            Metric::Branches => "branches",
        }
    }

    fn path(self, owner: &str, name: &str) -> String {
        match self {
            Metric::OpenIssues => format!("/repos/{owner}/{name}/issues"),
            Metric::PullRequests => format!("/repos/{owner}/{name}/pulls"),
            Metric::Contributors => format!("/repos/{owner}/{name}/contributors"),
            Metric::Branches => format!("/repos/{owner}/{name}/branches"),
        }
    }

    fn query(self) -> &'static [(&'static str, &'static str)] {
        match self {
            Metric::OpenIssues => &[("state", "open")],
            _ => &[],
        }
    }
}

/// Composite statistic built from independent per-metric fetches.
///
/// Counts reflect only the first page of each collection endpoint, an
/// approximation rather than a live total.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateResult {
    pub counts: HashMap<String, u64>,
}

pub struct Aggregator {
    client: Arc<UpstreamClient>,
}

impl Aggregator {
    pub fn new(client: Arc<UpstreamClient>) -> Self {
        Self { client }
    }

    /// Fetch all requested metrics concurrently and merge the outcomes.
    pub async fn aggregate(
        &self,
        owner: &str,
        name: &str,
        metrics: &[Metric],
    ) -> Result<AggregateResult> {
        let fetches = metrics.iter().map(|&metric| {
            let client = Arc::clone(&self.client);
            let path = metric.path(owner, name);
            async move {
                let count = client.count_collection(&path, metric.query()).await;
                (metric, count)
            }
        });

        // Join-all: sibling fetches are never cancelled by one failure,
        // and the merge below is order-independent.
        let outcomes = join_all(fetches).await;
        merge(outcomes)
    }
}

/// Merge per-metric outcomes; failed metrics contribute a zero count.
fn merge(outcomes: Vec<(Metric, Result<u64>)>) -> Result<AggregateResult> {
    let total = outcomes.len();
    let mut failed = 0;
    let mut counts = HashMap::with_capacity(total);

    for (metric, outcome) in outcomes {
        let count = match outcome {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(metric = metric.name(), error = %e, "sub-fetch failed, zeroing metric");
                failed += 1;
                0
            }
        };
        counts.insert(metric.name().to_string(), count);
    }

    if total > 0 && failed == total {
        return Err(GatewayError::Aggregate);
    }

    Ok(AggregateResult { counts })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_zeroes_the_failed_metric() {
        let outcomes = vec![
            (Metric::OpenIssues, Ok(7)),
            (
                Metric::PullRequests,
                Err(GatewayError::Transport("timeout".to_string())),
            ),
            (Metric::Contributors, Ok(3)),
        ];

        let result = merge(outcomes).unwrap();
        assert_eq!(result.counts["open_issues"], 7);
        assert_eq!(result.counts["pull_requests"], 0);
        assert_eq!(result.counts["contributors"], 3);
    }

    #[test]
    fn all_failures_fail_the_aggregate() {
        let outcomes = vec![
            (
                Metric::OpenIssues,
                Err(GatewayError::Transport("a".to_string())),
            ),
            (
                Metric::Branches,
                Err(GatewayError::Upstream { status: 500 }),
            ),
        ];

        assert!(matches!(merge(outcomes), Err(GatewayError::Aggregate)));
    }

    #[test]
    fn single_failure_among_many_still_succeeds() {
        let outcomes = vec![
            (Metric::OpenIssues, Ok(1)),
            (
                Metric::Branches,
                Err(GatewayError::Upstream { status: 500 }),
            ),
        ];

        let result = merge(outcomes).unwrap();
        assert_eq!(result.counts.len(), 2);
        assert_eq!(result.counts["branches"], 0);
    }

    #[test]
    fn empty_metric_set_yields_empty_counts() {
        let result = merge(Vec::new()).unwrap();
        assert!(result.counts.is_empty());
    }

    #[test]
    fn metric_names_are_stable() {
        let names: Vec<&str> = Metric::ALL.iter().map(|m| m.name()).collect();
        assert_eq!(
            names,
            vec!["open_issues", "pull_requests", "contributors", "branches"]
        );
    }
}
