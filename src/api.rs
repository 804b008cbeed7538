//! HTTP and WebSocket surface for the outbound call orchestrator.

mod handlers;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)]
pub use types::*;

use crate::agent::AgentClient;
use crate::carrier::CarrierClient;
use crate::config::Config;
use crate::crm::CrmClient;
use crate::db::Database;
use crate::notifier::Notifier;
use std::sync::Arc;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub carrier: Arc<CarrierClient>,
    pub agent: Arc<AgentClient>,
    pub crm: Option<Arc<CrmClient>>,
    pub notifier: Notifier,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        db: Database,
        carrier: Arc<CarrierClient>,
        agent: Arc<AgentClient>,
        crm: Option<Arc<CrmClient>>,
        notifier: Notifier,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            carrier,
            agent,
            crm,
            notifier,
            config,
        }
    }
}
