mod auth;
mod balance;
mod config;
mod db;
mod error;
mod guard;
mod handlers;
mod insights;
mod ledger;
mod rate_limit;
mod structs;
mod views;
mod webhook;

use std::io;
use std::sync::Arc;

use actix_web::{App, HttpServer};
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::auth::JwtResolver;
use crate::config::{CounterBackend, LogFormat, Settings, StoreBackend};
use crate::db::PgLedger;
use crate::handlers::AppData;
use crate::insights::LocalInsights;
use crate::ledger::{LedgerStore, MemoryLedger};
use crate::rate_limit::{CounterStore, MemoryCounterStore, RateLimiter, RedisCounterStore};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
    }
}

async fn build_app_data(settings: &Settings) -> io::Result<AppData> {
    let ledger: Arc<dyn LedgerStore> = match settings.store_backend {
        StoreBackend::Postgres => {
            let pool = db::create_pool(&settings.database).map_err(io::Error::other)?;
            Arc::new(PgLedger::new(pool, &settings.database))
        }
        StoreBackend::Memory => {
            warn!("Transactions are kept in memory and are lost on restart");
            Arc::new(MemoryLedger::new())
        }
    };

    let counters: Arc<dyn CounterStore> = match settings.counter_backend {
        CounterBackend::Redis => Arc::new(
            RedisCounterStore::connect(&settings.redis_url)
                .await
                .map_err(io::Error::other)?,
        ),
        CounterBackend::Memory => {
            warn!("Rate limit counters are per process");
            Arc::new(MemoryCounterStore::new())
        }
    };

    if settings.webhook_secret.is_none() {
        warn!("VAPI_WEBHOOK_SECRET is not set; webhook calls are not authenticated");
    }

    Ok(AppData::new(
        ledger,
        Arc::new(JwtResolver::new(
            settings.jwt_secret.as_bytes(),
            settings.jwt_audience.as_deref(),
        )),
        RateLimiter::new(counters, settings.rate_limit),
        Arc::new(LocalInsights::new()),
        settings.webhook_secret.clone(),
    ))
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();

    let settings = Settings::from_env().map_err(io::Error::other)?;
    init_tracing(settings.log_format);

    let app_data = build_app_data(&settings).await?;
    info!(
        bind_addr = %settings.bind_addr,
        store = ?settings.store_backend,
        counters = ?settings.counter_backend,
        limit = settings.rate_limit.limit,
        window_secs = settings.rate_limit.window.as_secs(),
        "Starting ledger guard"
    );

    HttpServer::new(move || App::new().configure(handlers::configure(app_data.clone())))
        .bind(&settings.bind_addr)?
        .run()
        .await
}
