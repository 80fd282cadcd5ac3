use crate::api::session_routes;
use crate::config::Config;
use crate::error::Result as CodeboxResult;
use crate::session::SessionOrchestrator;
use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sessions: Arc<SessionOrchestrator>,
}

pub struct Server {
    config: Config,
    app: Router,
}

impl Server {
    pub fn new(config: Config, sessions: Arc<SessionOrchestrator>) -> Self {
        let app_state = AppState {
            config: config.clone(),
            sessions,
        };

        let app = create_app(app_state);

        Self { config, app }
    }

    /// Serve until `shutdown` resolves.
    pub async fn run<F>(self, shutdown: F) -> CodeboxResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);

        info!("🚀 Codebox server starting on {}", addr);

        let listener = TcpListener::bind(&addr).await?;

        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // API routes
        .nest("/api", session_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "codebox",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.config.worker.backend.as_str(),
        "sessions": state.sessions.registry().len(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}
