use crate::admission::{admission_middleware, spawn_window_gc, AdmissionController};
use crate::aggregator::Aggregator;
use crate::cache::{CacheStore, MemoryStore, RedisStore, ResponseCache};
use crate::config::Config;
use crate::error::Result;
use crate::handlers::{
    get_resource, get_resource_issues, get_resource_stats, health_check, post_webhook, AppState,
};
use crate::middleware::logging_middleware;
use crate::upstream::UpstreamClient;
use crate::webhook::{EventDispatcher, WebhookVerifier};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the gateway router on top of the given backing store.
///
/// The admission layer wraps every route, webhooks included, so no
/// handler runs for a throttled identity.
pub fn create_app(config: &Config, store: Arc<dyn CacheStore>, cache_backend: &'static str) -> Result<Router> {
    let upstream = Arc::new(UpstreamClient::new(config)?);
    let cache = Arc::new(ResponseCache::new(store));
    let aggregator = Arc::new(Aggregator::new(Arc::clone(&upstream)));
    let verifier = Arc::new(WebhookVerifier::new(
        config.webhook_secret.clone(),
        config.webhook_scheme,
    ));
    let dispatcher = Arc::new(EventDispatcher::with_default_handlers());

    let admission = Arc::new(AdmissionController::new(
        config.rate_limit_max,
        config.rate_limit_window,
    ));
    spawn_window_gc(Arc::clone(&admission), config.cleanup_interval);

    let state = AppState {
        upstream,
        cache,
        aggregator,
        verifier,
        dispatcher,
        cache_ttl: config.cache_ttl,
        cache_backend,
    };

    let app = Router::new()
        .route("/resource/:owner/:name", get(get_resource))
        .route("/resource/:owner/:name/issues", get(get_resource_issues))
        .route("/resource/:owner/:name/stats", get(get_resource_stats))
        .route("/webhook/:owner/:name", post(post_webhook))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(axum::middleware::from_fn(logging_middleware))
                .layer(axum::middleware::from_fn_with_state(
                    admission,
                    admission_middleware,
                )),
        );

    Ok(app)
}

pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(self) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (store, backend): (Arc<dyn CacheStore>, &'static str) =
            match &self.config.redis_url {
                Some(url) => {
                    let store = RedisStore::connect(url).await?;
                    tracing::info!(redis_url = %url, "using Redis cache store");
                    (Arc::new(store), "redis")
                }
                None => {
                    tracing::info!(
                        max_entries = self.config.cache_max_entries,
                        "REDIS_URL not set, using in-memory cache store"
                    );
                    (
                        Arc::new(MemoryStore::new(self.config.cache_max_entries)),
                        "memory",
                    )
                }
            };

        let app = create_app(&self.config, store, backend)?;
        let listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;

        tracing::info!(addr = %self.config.bind_addr, "gateway listening");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("received terminate signal, initiating graceful shutdown");
        },
    }
}
