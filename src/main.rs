use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod auth;
mod config;
mod db;
mod error;
mod models;
mod services;
mod utils;

use crate::auth::jwt::JwtManager;
use crate::auth::password::{Argon2PasswordHasher, PasswordHasher};
use crate::config::AppConfig;
use crate::db::Database;
use crate::services::anti_abuse::GuestCheckoutLimiter;
use crate::services::mercadopago::{MercadoPagoClient, MpProvider};
use crate::services::reservations::ReservationService;

pub struct AppState {
    pub config: AppConfig,
    pub db: Database,
    pub jwt: JwtManager,
    pub password_hasher: Arc<dyn PasswordHasher>,
    pub mp_provider: Arc<dyn MpProvider>,
    pub checkout_limiter: GuestCheckoutLimiter,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storefront_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = AppConfig::load()?;

    tracing::info!("Starting storefront backend v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Mercado Pago environment: {}", config.mercadopago_env.as_str());

    // Initialize database
    let db = Database::connect(&config.database_url).await?;
    db.run_migrations().await?;
    tracing::info!("Database connected, migrations applied");

    let jwt = JwtManager::from_config(&config)?;
    let mp_provider: Arc<dyn MpProvider> = Arc::new(MercadoPagoClient::new(&config)?);
    tracing::info!(
        "Mercado Pago client initialized (timeout: {}s)",
        config.mercadopago_timeout_seconds
    );

    // Build application state
    let state = Arc::new(AppState {
        config: config.clone(),
        db,
        jwt,
        password_hasher: Arc::new(Argon2PasswordHasher),
        mp_provider,
        checkout_limiter: GuestCheckoutLimiter::new(),
    });

    // Start the reservation sweeper. Expiration is also run opportunistically
    // at the start of payment and webhook flows; this loop bounds how stale
    // an idle system can get.
    let sweeper_pool = state.db.pool.clone();
    let sweep_interval = config.reservation_sweep_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));
        tracing::info!("Reservation sweeper started (every {}s)", sweep_interval);
        loop {
            interval.tick().await;
            match ReservationService::sweep_expired(&sweeper_pool).await {
                Ok(0) => {}
                Ok(expired) => {
                    tracing::info!("Reservation sweep expired {} reservations", expired);
                }
                Err(e) => {
                    tracing::error!("Reservation sweep failed: {}", e);
                }
            }
        }
    });

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .merge(api::routes::create_router(state.clone()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
