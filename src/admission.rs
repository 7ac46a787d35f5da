//! Admission controller
//!
//! Sliding-window rate limiter gating every inbound request per client
//! identity before it reaches a handler. Each identity owns an ordered
//! window of request timestamps; the prune/check/append sequence runs
//! while the map entry is held, so the decision is atomic per identity
//! without any global lock.

use crate::error::GatewayError;
use crate::middleware::client_identity;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Per-identity window state: request timestamps within the trailing window.
#[derive(Default)]
struct ClientWindow {
    timestamps: VecDeque<Instant>,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed { remaining: u32 },
    Throttled { retry_after: Duration },
}

pub struct AdmissionController {
    windows: DashMap<String, ClientWindow>,
    max_requests: u32,
    window: Duration,
}

impl AdmissionController {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window,
        }
    }

    /// Decide whether a request from `identity` is admitted right now.
    ///
    /// Non-blocking and O(window size); no await happens while the entry
    /// guard is held.
    pub fn check(&self, identity: &str) -> Decision {
        let now = Instant::now();
        let mut entry = self.windows.entry(identity.to_string()).or_default();
        let window = entry.value_mut();

        while let Some(oldest) = window.timestamps.front() {
            if now.duration_since(*oldest) >= self.window {
                window.timestamps.pop_front();
            } else {
                break;
            }
        }

        if window.timestamps.len() >= self.max_requests as usize {
            // Time until the oldest timestamp slides out of the window.
            let retry_after = window
                .timestamps
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Decision::Throttled { retry_after };
        }

        window.timestamps.push_back(now);
        Decision::Allowed {
            remaining: self.max_requests - window.timestamps.len() as u32,
        }
    }

    /// Drop identities whose newest timestamp has been outside the window
    /// for longer than one window duration.
    pub fn collect_idle(&self) -> usize {
        let now = Instant::now();
        let threshold = self.window * 2;
        let before = self.windows.len();

        self.windows.retain(|_, window| {
            window
                .timestamps
                .back()
                .is_some_and(|last| now.duration_since(*last) < threshold)
        });

        before - self.windows.len()
    }

    /// Number of identities currently tracked.
    pub fn tracked_identities(&self) -> usize {
        self.windows.len()
    }
}

/// Periodic garbage collection of idle client windows.
pub fn spawn_window_gc(controller: Arc<AdmissionController>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = controller.collect_idle();
            if removed > 0 {
                tracing::debug!(removed, "collected idle client windows");
            }
        }
    });
}

/// Axum middleware applying the admission check ahead of every route,
/// webhooks included.
pub async fn admission_middleware(
    State(controller): State<Arc<AdmissionController>>,
    request: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let identity = client_identity(&request);

    match controller.check(&identity) {
        Decision::Allowed { remaining } => {
            tracing::trace!(identity = %identity, remaining, "request admitted");
            Ok(next.run(request).await)
        }
        Decision::Throttled { retry_after } => {
            tracing::warn!(
                identity = %identity,
                retry_after_secs = retry_after.as_secs(),
                "request throttled"
            );
            Err(GatewayError::RateLimited { retry_after })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn over_limit_request_is_throttled() {
        let controller = AdmissionController::new(3, Duration::from_secs(60));

        for _ in 0..3 {
            assert!(matches!(controller.check("alice"), Decision::Allowed { .. }));
        }
        assert!(matches!(
            controller.check("alice"),
            Decision::Throttled { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn identities_are_limited_independently() {
        let controller = AdmissionController::new(1, Duration::from_secs(60));

        assert!(matches!(controller.check("alice"), Decision::Allowed { .. }));
        assert!(matches!(controller.check("bob"), Decision::Allowed { .. }));
        assert!(matches!(
            controller.check("alice"),
            Decision::Throttled { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn window_drains_naturally() {
        let controller = AdmissionController::new(2, Duration::from_secs(60));

        assert!(matches!(controller.check("alice"), Decision::Allowed { .. }));
        assert!(matches!(controller.check("alice"), Decision::Allowed { .. }));
        assert!(matches!(
            controller.check("alice"),
            Decision::Throttled { .. }
        ));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(matches!(controller.check("alice"), Decision::Allowed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_tracks_oldest_timestamp() {
        let controller = AdmissionController::new(2, Duration::from_secs(60));

        controller.check("alice");
        tokio::time::advance(Duration::from_secs(30)).await;
        controller.check("alice");

        match controller.check("alice") {
            Decision::Throttled { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(30));
            }
            Decision::Allowed { .. } => panic!("expected throttle"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_windows_are_collected() {
        let controller = AdmissionController::new(5, Duration::from_secs(60));

        controller.check("alice");
        controller.check("bob");
        assert_eq!(controller.tracked_identities(), 2);

        tokio::time::advance(Duration::from_secs(90)).await;
        controller.check("bob");

        // Alice is idle past one full window beyond expiry; Bob is not.
        tokio::time::advance(Duration::from_secs(45)).await;
        let removed = controller.collect_idle();
        assert_eq!(removed, 1);
        assert_eq!(controller.tracked_identities(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_admit_exactly_the_limit() {
        let controller = Arc::new(AdmissionController::new(10, Duration::from_secs(60)));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let controller = Arc::clone(&controller);
            handles.push(tokio::spawn(async move {
                matches!(controller.check("shared"), Decision::Allowed { .. })
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }
}
