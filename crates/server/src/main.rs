use std::sync::Arc;

use anyhow::Context;
use db::{
    DBService,
    store::{DocumentStore, MemoryDocumentStore, SqliteDocumentStore},
};
use server::{
    AppState,
    config::{ServerConfig, StoreBackend},
    routes,
};
use services::services::{
    claude_api::ClaudeApiError, clock::SystemClock, feedback_evaluator::FeedbackEvaluator,
    journal_gate::JournalGate,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_FILTER: &str = "info,server=debug,services=debug,db=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let store: Arc<dyn DocumentStore> = match config.store {
        StoreBackend::Sqlite => {
            let db = DBService::new(&config.database_url)
                .await
                .with_context(|| format!("failed to open database {}", config.database_url))?;
            Arc::new(SqliteDocumentStore::new(db.pool))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory journal store; data is lost on shutdown");
            Arc::new(MemoryDocumentStore::new())
        }
    };

    let gate = Arc::new(JournalGate::new(store, Arc::new(SystemClock)));

    let evaluator = match FeedbackEvaluator::from_env(gate.clone()) {
        Ok(evaluator) => Some(Arc::new(evaluator)),
        Err(ClaudeApiError::MissingApiKey) => {
            warn!("ANTHROPIC_API_KEY not set; journal feedback evaluation disabled");
            None
        }
        Err(e) => return Err(e).context("failed to build Claude API client"),
    };

    let app = routes::router(AppState::new(gate, evaluator));

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
    info!(
        address = %listener.local_addr()?,
        store = %config.store,
        "herbcare server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
