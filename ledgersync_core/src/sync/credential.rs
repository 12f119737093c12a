use crate::sync::models::CredentialSet;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Pure expiry policy: decides when stored credentials must be refreshed
/// before use. Refresh fires `lead_time` ahead of expiry so API calls
/// normally never see an expired token; the orchestrator still tolerates
/// the race by refreshing on an auth failure mid-cycle.
#[derive(Debug, Clone)]
pub struct CredentialPolicy {
    lead_time: Duration,
}

impl CredentialPolicy {
    pub fn new(lead_time: Duration) -> Self {
        Self { lead_time }
    }

    pub fn needs_refresh(&self, credentials: &CredentialSet, now: DateTime<Utc>) -> bool {
        credentials.needs_refresh(now, self.lead_time)
    }
}
