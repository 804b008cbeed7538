//! Process configuration, loaded once at startup from the environment.

use chrono_tz::Tz;
use std::time::Duration;

/// All tunables enumerated in the external-interfaces configuration table,
/// plus the ambient ones (DB path, stale-in-flight threshold, notifier
/// webhook) a complete deployment needs.
#[derive(Debug, Clone)]
pub struct Config {
    pub max_active_calls: u32,
    pub queue_interval: Duration,
    pub max_attempts: i64,
    pub civil_timezone: Tz,
    pub source_phone: String,
    pub public_url: String,
    pub route_prefix: String,
    pub db_path: String,
    pub stale_in_flight_threshold: Duration,

    pub carrier_account_sid: String,
    pub carrier_auth_token: String,
    pub carrier_base_url: String,

    pub agent_id: String,
    pub agent_api_key: String,
    pub agent_base_url: String,

    pub crm_base_url: Option<String>,
    pub crm_client_id: Option<String>,
    pub crm_client_secret: Option<String>,

    pub notifier_webhook_url: Option<String>,
}

/// Minimum scheduler tick enforced regardless of configured value (spec: "min 5s").
const MIN_QUEUE_INTERVAL: Duration = Duration::from_secs(5);

impl Config {
    pub fn from_env() -> Self {
        let queue_interval_ms: u64 = std::env::var("QUEUE_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        let queue_interval = Duration::from_millis(queue_interval_ms).max(MIN_QUEUE_INTERVAL);

        let civil_timezone = std::env::var("CIVIL_TIMEZONE")
            .ok()
            .and_then(|v| v.parse::<Tz>().ok())
            .unwrap_or(chrono_tz::Europe::Rome);

        Self {
            max_active_calls: std::env::var("MAX_ACTIVE_CALLS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            queue_interval,
            // Clamped to the ladder's fixed size: `retry::next` has no table
            // entries past index `MAX_ATTEMPTS - 2` and panics if asked for one.
            max_attempts: std::env::var("MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(crate::retry::MAX_ATTEMPTS)
                .min(crate::retry::MAX_ATTEMPTS),
            civil_timezone,
            source_phone: std::env::var("SOURCE_PHONE").expect("SOURCE_PHONE must be set"),
            public_url: std::env::var("PUBLIC_URL").expect("PUBLIC_URL must be set"),
            route_prefix: std::env::var("ROUTE_PREFIX").unwrap_or_else(|_| "/outgoing".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                format!("{home}/.call-orchestrator/orchestrator.db")
            }),
            stale_in_flight_threshold: Duration::from_secs(
                std::env::var("STALE_IN_FLIGHT_THRESHOLD_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
            ),

            carrier_account_sid: std::env::var("CARRIER_ACCOUNT_SID")
                .expect("CARRIER_ACCOUNT_SID must be set"),
            carrier_auth_token: std::env::var("CARRIER_AUTH_TOKEN")
                .expect("CARRIER_AUTH_TOKEN must be set"),
            carrier_base_url: std::env::var("CARRIER_BASE_URL")
                .unwrap_or_else(|_| "https://api.twilio.com".to_string()),

            agent_id: std::env::var("AGENT_ID").expect("AGENT_ID must be set"),
            agent_api_key: std::env::var("AGENT_API_KEY").expect("AGENT_API_KEY must be set"),
            agent_base_url: std::env::var("AGENT_BASE_URL")
                .unwrap_or_else(|_| "https://api.elevenlabs.io".to_string()),

            crm_base_url: std::env::var("CRM_BASE_URL").ok(),
            crm_client_id: std::env::var("CRM_CLIENT_ID").ok(),
            crm_client_secret: std::env::var("CRM_CLIENT_SECRET").ok(),

            notifier_webhook_url: std::env::var("NOTIFIER_WEBHOOK_URL").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_interval_floor_is_five_seconds() {
        std::env::set_var("QUEUE_INTERVAL_MS", "1000");
        std::env::set_var("SOURCE_PHONE", "+10000000000");
        std::env::set_var("PUBLIC_URL", "https://example.test");
        std::env::set_var("CARRIER_ACCOUNT_SID", "AC_test");
        std::env::set_var("CARRIER_AUTH_TOKEN", "token");
        std::env::set_var("AGENT_ID", "agent_test");
        std::env::set_var("AGENT_API_KEY", "key");

        let config = Config::from_env();
        assert_eq!(config.queue_interval, MIN_QUEUE_INTERVAL);
    }
}
