use axum::{
    http::Method,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod auth;
mod automations;
mod config;
mod database;
mod error;
mod handlers;
mod integrations;
mod jobs;
mod storage;
mod validation;

pub use error::{ApiResult, AppError};


use automations::{AutomationEngine, Collaborators, RecurrenceOracle, Stores, SystemClock};
use config::{Config, StorageBackend};
use integrations::HttpCollaborators;
use storage::{
    MemoryAutomationRepository, MemoryMetricsStore, MemoryRunQueue, PgAutomationRepository,
    PgMetricsStore, PgRunQueue,
};

pub struct AppState {
    pub config: Config,
    /// `None` when running on the in-memory backend.
    pub db_pool: Option<sqlx::PgPool>,
    pub engine: Arc<AutomationEngine>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    Router::new()
        .route("/", get(|| async { "Autoflow Automation API v0.1.0" }))
        .route("/health", get(handlers::health_check))
        .route("/health/detailed", get(handlers::detailed_health_check))
        .nest("/api/automations", handlers::automation_routes())
        .nest("/api/webhook", handlers::platform_webhook_routes())
        .nest("/api/hooks", handlers::automation_hook_routes())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

fn build_stores(backend: StorageBackend, db_pool: Option<&sqlx::PgPool>) -> anyhow::Result<Stores> {
    match (backend, db_pool) {
        (StorageBackend::Postgres, Some(pool)) => Ok(Stores {
            automations: Arc::new(PgAutomationRepository::new(pool.clone())),
            metrics: Arc::new(PgMetricsStore::new(pool.clone())),
            runs: Arc::new(PgRunQueue::new(pool.clone())),
        }),
        (StorageBackend::Postgres, None) => {
            Err(anyhow::anyhow!("postgres storage selected without a database pool"))
        }
        (StorageBackend::Memory, _) => Ok(Stores {
            automations: Arc::new(MemoryAutomationRepository::new()),
            metrics: Arc::new(MemoryMetricsStore::new()),
            runs: Arc::new(MemoryRunQueue::new()),
        }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let db_pool = match config.storage {
        StorageBackend::Postgres => {
            let pool = database::create_pool(&config.database_url).await?;
            database::migrate(&pool).await?;
            Some(pool)
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; automations and pending runs are lost on restart");
            None
        }
    };

    if !config.collaborators.is_configured() {
        tracing::warn!("COLLABORATOR_API_TOKEN not set; contact and messaging calls will be rejected");
    }
    let http = Arc::new(HttpCollaborators::new(&config.collaborators)?);
    let collaborators = Collaborators {
        contacts: http.clone(),
        templates: http.clone(),
        dispatcher: http,
    };

    let engine = Arc::new(AutomationEngine::new(
        build_stores(config.storage, db_pool.as_ref())?,
        collaborators,
        Arc::new(SystemClock),
        Arc::new(RecurrenceOracle),
        config.engine.clone(),
    ));

    let mut scheduler = jobs::JobScheduler::new(engine.clone(), jobs::JobConfig::from(&config.engine)).await?;
    scheduler.start().await?;

    let server_addr = config.server_addr.clone();
    let app_state = Arc::new(AppState {
        config,
        db_pool,
        engine,
    });
    let app = build_router(app_state);

    let listener = tokio::net::TcpListener::bind(&server_addr).await?;
    tracing::info!("Server running on {}", server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    scheduler.shutdown().await?;
    Ok(())
}
