//! HTTP server exposing the metrics endpoint.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    registry: Registry,
}

/// Create the HTTP router.
fn create_router(registry: Registry) -> Router {
    let state = AppState { registry };

    Router::new()
        .route("/", get(index_handler))
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Handler for the static index page.
async fn index_handler() -> Html<&'static str> {
    Html(
        "<html>\n\
         <head><title>Graphql Exporter</title></head>\n\
         <body>\n\
         <h1>Graphql Exporter</h1>\n\
         <p><a href='metrics'>Metrics</a></p>\n\
         </body>\n\
         </html>\n",
    )
}

/// Handler for the /metrics endpoint. Gathering triggers the collector's
/// background refresh; the response is always served from cache.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let families = state.registry.gather();
    let mut buffer = Vec::new();

    if let Err(err) = TextEncoder::new().encode(&families, &mut buffer) {
        error!(error = %err, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "encoding error\n").into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// HTTP scrape surface.
pub struct HttpServer {
    registry: Registry,
    listen_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(registry: Registry, listen_addr: SocketAddr) -> Self {
        Self {
            registry,
            listen_addr,
        }
    }

    /// Run the HTTP server until the shutdown signal is received.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = create_router(self.registry);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|err| anyhow::anyhow!("failed to bind to {}: {}", self.listen_addr, err))?;

        info!(addr = %self.listen_addr, "listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|err| anyhow::anyhow!("HTTP server error: {}", err))?;

        Ok(())
    }
}
