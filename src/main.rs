use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use ticketing_payments::build_router;
use ticketing_payments::config::AppConfig;
use ticketing_payments::database::connection::get_db_client;
use ticketing_payments::database::memory_store::MemoryStore;
use ticketing_payments::database::mongo_store::MongoStore;
use ticketing_payments::services::clock::SystemClock;
use ticketing_payments::services::gateway::PaymentGateway;
use ticketing_payments::services::mpesa_service::MpesaService;
use ticketing_payments::state::{AppState, Stores};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::from_env().context("failed to load configuration")?;
    config.log_summary();

    let stores = initialize_stores(&config).await?;
    let gateway = initialize_gateway(&config).await?;
    let app_state = AppState::new(&config, stores, gateway, Arc::new(SystemClock));

    spawn_expiry_sweep(app_state.clone(), config.payments.sweep_interval);

    let app = build_router(app_state);
    start_server(app, &config).await
}

async fn initialize_stores(config: &AppConfig) -> anyhow::Result<Stores> {
    match &config.database_url {
        Some(url) => {
            let (client, db) = get_db_client(url, &config.database_name)
                .await
                .context("failed to connect to MongoDB")?;
            let store = MongoStore::new(client, db);
            store.ensure_indexes().await.context("failed to create indexes")?;
            tracing::info!("✅ Using MongoDB store '{}'", config.database_name);
            Ok(Stores::shared(Arc::new(store), "mongodb"))
        }
        None => {
            tracing::warn!("⚠️ DATABASE_URL not set, using the in-memory store; nothing will persist");
            Ok(Stores::shared(Arc::new(MemoryStore::new()), "memory"))
        }
    }
}

async fn initialize_gateway(config: &AppConfig) -> anyhow::Result<Option<Arc<dyn PaymentGateway>>> {
    let mpesa = match &config.mpesa {
        Some(mpesa) => mpesa.clone(),
        None => {
            tracing::warn!("M-Pesa service will be disabled");
            return Ok(None);
        }
    };

    tracing::info!("🔧 Attempting to initialize M-Pesa service...");
    let service = MpesaService::new(mpesa, config.payments.gateway_timeout)
        .context("failed to build M-Pesa client")?;

    // Bad credentials should be loud at startup, but Daraja being down is not fatal.
    match service.get_access_token().await {
        Ok(_) => tracing::info!("✅ M-Pesa access token obtained"),
        Err(e) => tracing::error!("❌ Failed to get M-Pesa access token: {}", e),
    }

    Ok(Some(Arc::new(service)))
}

fn spawn_expiry_sweep(state: AppState, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = state.poller.sweep_expired().await {
                tracing::error!("❌ Expiry sweep failed: {}", e);
            }
        }
    });
}

async fn start_server(app: axum::Router, config: &AppConfig) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", config.host, config.port))?;

    tracing::info!("🚀 Server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
