//! Outbound call orchestrator: places telephony calls via a carrier
//! gateway, bridges live audio to a conversational AI agent, records
//! outcomes, and retries failed attempts on a fixed ladder.

mod agent;
mod api;
mod bridge;
mod carrier;
mod clock;
mod config;
mod crm;
mod db;
mod error;
mod http_client;
mod notifier;
mod queue;
mod retry;

use agent::AgentClient;
use api::{create_router, AppState};
use carrier::CarrierClient;
use config::Config;
use crm::CrmClient;
use db::Database;
use notifier::Notifier;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_orchestrator=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Arc::new(Config::from_env());

    if let Some(parent) = PathBuf::from(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path, "opening database");
    let db = Database::open(&config.db_path)?;

    match queue::run_startup_recovery(&db, &config) {
        Ok(recovered) => {
            if recovered > 0 {
                tracing::info!(recovered, "startup recovery swept stale in-flight entries");
            }
        }
        Err(e) => tracing::warn!(error = %e, "startup recovery sweep failed"),
    }

    let carrier = Arc::new(CarrierClient::new(
        config.carrier_base_url.clone(),
        config.carrier_account_sid.clone(),
        config.carrier_auth_token.clone(),
    ));
    let agent = Arc::new(AgentClient::new(
        config.agent_base_url.clone(),
        config.agent_api_key.clone(),
        config.agent_id.clone(),
    ));
    let crm = match (&config.crm_base_url, &config.crm_client_id, &config.crm_client_secret) {
        (Some(base_url), Some(client_id), Some(client_secret)) => Some(Arc::new(CrmClient::new(
            base_url.clone(),
            client_id.clone(),
            client_secret.clone(),
            db.clone(),
        ))),
        _ => {
            tracing::info!("CRM credentials not configured, CRM integration disabled");
            None
        }
    };
    let notifier = Notifier::new(config.notifier_webhook_url.clone());

    tokio::spawn(queue::run_scheduler(
        db.clone(),
        carrier.clone(),
        agent.clone(),
        notifier.clone(),
        config.clone(),
    ));

    let state = AppState::new(db, carrier, agent, crm, notifier, config.clone());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = axum::Router::new()
        .nest(&config.route_prefix, create_router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let port: u16 = std::env::var("PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(8000);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("call orchestrator listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
