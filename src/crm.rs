//! CRM HTTP client: contact read/update, appointment booking, workflow
//! enrollment, OAuth refresh. Treated as an opaque request/response
//! dependency — the core never inspects response bodies beyond what it
//! passes through to the agent initiation frame.

use crate::db::{Database, OAuthTokenRecord};
use crate::http_client::{DownstreamError, HttpClient, RetryPolicy};
use chrono::Utc;
use serde::Deserialize;

pub type CrmError = DownstreamError;

#[derive(Debug, Deserialize)]
struct RefreshTokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

/// Client for the CRM integration. The core only reads valid tokens; the
/// refresh routine itself is external to the core per spec, but is
/// implemented here as the natural single-writer counterpart to
/// `Database::get_oauth_token`.
pub struct CrmClient {
    http: HttpClient,
    base_url: String,
    client_id: String,
    client_secret: String,
    db: Database,
}

impl CrmClient {
    pub fn new(base_url: String, client_id: String, client_secret: String, db: Database) -> Self {
        Self {
            http: HttpClient::new(RetryPolicy::crm()),
            base_url,
            client_id,
            client_secret,
            db,
        }
    }

    /// Return a cached token for `location_id`, refreshing it first if it
    /// is missing.
    pub async fn valid_token(&self, location_id: &str) -> Result<OAuthTokenRecord, CrmError> {
        if let Some(record) = self
            .db
            .get_oauth_token(location_id)
            .map_err(|e| CrmError::unknown(format!("token store read failed: {e}")))?
        {
            if record.expires_at > Utc::now() {
                return Ok(record);
            }
            return self.refresh_token(location_id, &record.refresh_token).await;
        }
        Err(CrmError::unknown(format!(
            "no cached token for location {location_id}"
        )))
    }

    async fn refresh_token(&self, location_id: &str, refresh_token: &str) -> Result<OAuthTokenRecord, CrmError> {
        let url = format!("{}/oauth/token", self.base_url);
        let form = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token),
        ];
        let response = self
            .http
            .execute_with_retry(|| self.http.inner().post(&url).form(&form))
            .await?;
        let parsed: RefreshTokenResponse = response
            .json()
            .await
            .map_err(|e| CrmError::unknown(format!("failed to parse token refresh response: {e}")))?;

        let record = OAuthTokenRecord {
            location_id: location_id.to_string(),
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(parsed.expires_in),
            updated_at: Utc::now(),
        };
        self.db
            .put_oauth_token(&record)
            .map_err(|e| CrmError::unknown(format!("token store write failed: {e}")))?;
        Ok(record)
    }

    /// Opaque contact lookup; the returned JSON is passed through, not
    /// interpreted beyond what the agent initiation frame needs.
    pub async fn get_contact(&self, location_id: &str, contact_id: &str) -> Result<serde_json::Value, CrmError> {
        let token = self.valid_token(location_id).await?;
        let url = format!("{}/contacts/{}", self.base_url, contact_id);
        let access_token = token.access_token.clone();
        let response = self
            .http
            .execute_with_retry(|| self.http.inner().get(&url).bearer_auth(&access_token))
            .await?;
        response
            .json()
            .await
            .map_err(|e| CrmError::unknown(format!("failed to parse contact response: {e}")))
    }

    /// Opaque contact update; no business logic beyond the pass-through.
    pub async fn update_contact(
        &self,
        location_id: &str,
        contact_id: &str,
        fields: &serde_json::Value,
    ) -> Result<(), CrmError> {
        let token = self.valid_token(location_id).await?;
        let url = format!("{}/contacts/{}", self.base_url, contact_id);
        let access_token = token.access_token.clone();
        self.http
            .execute_with_retry(|| {
                self.http
                    .inner()
                    .put(&url)
                    .bearer_auth(&access_token)
                    .json(fields)
            })
            .await?;
        Ok(())
    }

    /// Opaque appointment booking; calendar/appointment semantics are
    /// explicitly out of scope beyond passing the payload through.
    pub async fn book_appointment(
        &self,
        location_id: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, CrmError> {
        let token = self.valid_token(location_id).await?;
        let url = format!("{}/appointments", self.base_url);
        let access_token = token.access_token.clone();
        let response = self
            .http
            .execute_with_retry(|| {
                self.http
                    .inner()
                    .post(&url)
                    .bearer_auth(&access_token)
                    .json(payload)
            })
            .await?;
        response
            .json()
            .await
            .map_err(|e| CrmError::unknown(format!("failed to parse appointment response: {e}")))
    }

    /// Opaque workflow enrollment.
    pub async fn enroll_workflow(
        &self,
        location_id: &str,
        contact_id: &str,
        workflow_id: &str,
    ) -> Result<(), CrmError> {
        let token = self.valid_token(location_id).await?;
        let url = format!("{}/contacts/{}/workflow/{}", self.base_url, contact_id, workflow_id);
        let access_token = token.access_token.clone();
        self.http
            .execute_with_retry(|| self.http.inner().post(&url).bearer_auth(&access_token))
            .await?;
        Ok(())
    }
}
