//! QuickBooks vendor capability.
//!
//! Pulls Customers and Invoices through the QuickBooks Online query API.
//! Incremental sync filters on `MetaData.LastUpdatedTime` and orders by
//! (LastUpdatedTime, Id) so pages line up with the engine's compound
//! watermark; the boundary itself is re-filtered client-side because the
//! query API only supports a timestamp predicate.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use ledgersync_core::{
    CredentialSet, Error, IntegrationAccount, ObjectKind, Result, VendorCapability, VendorPage,
    VendorRecord, Watermark,
};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::instrument;

#[derive(Debug, Clone)]
pub struct QuickBooksConfig {
    pub api_base_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub timeout: Duration,
}

impl QuickBooksConfig {
    /// Load QuickBooks config from environment.
    ///
    /// Returns `Ok(None)` if QuickBooks is not configured (no client id).
    /// Returns `Err` if it IS configured but the client secret is missing.
    pub fn from_env() -> Result<Option<Self>> {
        let client_id = match std::env::var("LEDGERSYNC_QB_CLIENT_ID").ok() {
            Some(v) => v,
            None => return Ok(None),
        };
        let client_secret = std::env::var("LEDGERSYNC_QB_CLIENT_SECRET").map_err(|_| {
            Error::InvalidInput(
                "LEDGERSYNC_QB_CLIENT_SECRET is required when LEDGERSYNC_QB_CLIENT_ID is set"
                    .to_string(),
            )
        })?;

        let api_base_url = std::env::var("LEDGERSYNC_QB_API_BASE_URL")
            .unwrap_or_else(|_| "https://quickbooks.api.intuit.com".to_string());
        let token_url = std::env::var("LEDGERSYNC_QB_TOKEN_URL").unwrap_or_else(|_| {
            "https://oauth.platform.intuit.com/oauth2/v1/tokens/bearer".to_string()
        });
        let timeout_secs = std::env::var("LEDGERSYNC_QB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        Ok(Some(Self {
            api_base_url,
            token_url,
            client_id,
            client_secret,
            timeout: Duration::from_secs(timeout_secs),
        }))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    expires_in: i64,
}

pub struct QuickBooksVendor {
    client: Client,
    config: QuickBooksConfig,
}

impl QuickBooksVendor {
    pub fn new(config: QuickBooksConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::backend("build quickbooks client", e))?;
        Ok(Self { client, config })
    }

    fn entity_name(kind: ObjectKind) -> &'static str {
        match kind {
            ObjectKind::Customer => "Customer",
            ObjectKind::Invoice => "Invoice",
        }
    }

    fn build_query(
        kind: ObjectKind,
        watermark: &Watermark,
        page_size: u32,
        start_position: u32,
    ) -> String {
        let entity = Self::entity_name(kind);
        let mut clauses: Vec<String> = Vec::new();

        // Customer queries default to active rows only; include both.
        if kind == ObjectKind::Customer {
            clauses.push("Active IN (true, false)".to_string());
        }
        if *watermark != Watermark::origin() {
            // `>=` on the timestamp: equal-instant records beyond the
            // watermark id are refetched and filtered client-side. The query
            // language has no OR, so the compound boundary cannot be
            // expressed server-side.
            let since = watermark
                .updated_at
                .to_rfc3339_opts(SecondsFormat::Secs, true);
            clauses.push(format!("MetaData.LastUpdatedTime >= '{since}'"));
        }

        let mut query = format!("SELECT * FROM {entity}");
        if !clauses.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&clauses.join(" AND "));
        }
        query.push_str(" ORDERBY MetaData.LastUpdatedTime, Id");
        if start_position > 1 {
            query.push_str(&format!(" STARTPOSITION {start_position}"));
        }
        query.push_str(&format!(" MAXRESULTS {page_size}"));
        query
    }

    fn parse_record(data: &serde_json::Value) -> VendorRecord {
        let id = data
            .get("Id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let updated_at = data
            .pointer("/MetaData/LastUpdatedTime")
            .and_then(|v| v.as_str())
            .and_then(parse_qb_timestamp);
        VendorRecord {
            id,
            updated_at,
            payload: data.clone(),
        }
    }

    /// Drop records at or before the watermark and order the rest by the
    /// compound key. Records without a position (missing id or timestamp)
    /// are kept for the normalizer to reject per record.
    fn filter_page(records: Vec<VendorRecord>, watermark: &Watermark) -> Vec<VendorRecord> {
        let mut out: Vec<VendorRecord> = records
            .into_iter()
            .filter(|r| match (&r.updated_at, &r.id) {
                (Some(ts), Some(id)) => Watermark::new(*ts, id.clone()) > *watermark,
                _ => true,
            })
            .collect();
        out.sort_by(|a, b| record_key(a).cmp(&record_key(b)));
        out
    }

    fn classify_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> Error {
        match status {
            StatusCode::UNAUTHORIZED => {
                Error::CredentialExpired(format!("quickbooks rejected access token: {body}"))
            }
            StatusCode::FORBIDDEN => Error::TerminalConfiguration(format!(
                "quickbooks authorization revoked or insufficient: {body}"
            )),
            StatusCode::TOO_MANY_REQUESTS => Error::RateLimited { retry_after },
            s if s.is_server_error() => {
                Error::TransientNetwork(format!("quickbooks returned {s}"))
            }
            s => Error::BackendMessage(format!("quickbooks returned {s}: {body}")),
        }
    }

    async fn execute_query(
        &self,
        account: &IntegrationAccount,
        query: &str,
    ) -> Result<serde_json::Value> {
        let url = format!(
            "{}/v3/company/{}/query",
            self.config.api_base_url, account.external_account_id
        );
        let resp = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .bearer_auth(&account.credentials.access_token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(transport_err)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::classify_error(status, retry_after, &body));
        }

        let body: serde_json::Value = resp.json().await.map_err(transport_err)?;
        Ok(body
            .get("QueryResponse")
            .cloned()
            .unwrap_or_else(|| serde_json::json!({})))
    }
}

#[async_trait]
impl VendorCapability for QuickBooksVendor {
    async fn id(&self) -> &'static str {
        "quickbooks"
    }

    #[instrument(level = "debug", skip(self, account, watermark), fields(realm = %account.external_account_id))]
    async fn fetch_since(
        &self,
        account: &IntegrationAccount,
        kind: ObjectKind,
        watermark: &Watermark,
        page_size: u32,
    ) -> Result<VendorPage> {
        let mut start_position = 1u32;
        loop {
            let query = Self::build_query(kind, watermark, page_size, start_position);
            let response = self.execute_query(account, &query).await?;

            let items = response
                .get(Self::entity_name(kind))
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();
            let fetched = items.len() as u32;

            let records = Self::filter_page(
                items.iter().map(Self::parse_record).collect(),
                watermark,
            );

            // A full page means the window may extend past what we got back.
            let has_more = fetched >= page_size;
            if !records.is_empty() || !has_more {
                return Ok(VendorPage { records, has_more });
            }

            // A full page of already-persisted boundary records (an
            // equal-instant group wider than one page): scan forward within
            // the same window.
            start_position += page_size;
        }
    }

    #[instrument(level = "info", skip(self, credentials))]
    async fn refresh_credentials(&self, credentials: &CredentialSet) -> Result<CredentialSet> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", credentials.refresh_token.as_str()),
        ];
        let resp = self
            .client
            .post(&self.config.token_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(transport_err)?;

        let status = resp.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            // invalid_grant: the refresh token itself was revoked or rotated
            // away. No retry can recover this.
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::TerminalConfiguration(format!(
                "quickbooks refresh token rejected ({status}): {body}"
            )));
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(Error::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(Error::TransientNetwork(format!(
                "quickbooks token endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::BackendMessage(format!(
                "quickbooks token endpoint returned {status}: {body}"
            )));
        }

        let token: TokenResponse = resp.json().await.map_err(transport_err)?;
        CredentialSet::new(
            token.access_token,
            token.refresh_token,
            Utc::now() + chrono::Duration::seconds(token.expires_in),
        )
    }
}

fn record_key(r: &VendorRecord) -> Watermark {
    Watermark::new(
        r.updated_at.unwrap_or(DateTime::<Utc>::MIN_UTC),
        r.id.clone().unwrap_or_default(),
    )
}

fn parse_qb_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn transport_err(e: reqwest::Error) -> Error {
    if e.is_timeout() || e.is_connect() {
        Error::TransientNetwork(e.to_string())
    } else {
        Error::backend("quickbooks request", e)
    }
}
