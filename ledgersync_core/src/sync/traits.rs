use crate::sync::models::{CredentialSet, IntegrationAccount, ObjectKind, Watermark};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// A raw record pulled from a vendor, after the vendor client's field
/// mapping but before normalization.
///
/// `id` and `updated_at` are optional on purpose: extraction failures are
/// the normalizer's per-record concern, not a reason to abort a fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct VendorRecord {
    /// Vendor-assigned object id, when the payload carried one.
    pub id: Option<String>,
    /// Vendor update timestamp, when the payload carried one.
    pub updated_at: Option<DateTime<Utc>>,
    /// The unmodified vendor representation.
    pub payload: serde_json::Value,
}

/// One page of a vendor's change stream.
#[derive(Debug, Clone, PartialEq)]
pub struct VendorPage {
    /// Records ordered by (update timestamp, vendor id), all strictly after
    /// the requested watermark.
    pub records: Vec<VendorRecord>,
    /// False once the cursor window is exhausted.
    pub has_more: bool,
}

impl VendorPage {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            has_more: false,
        }
    }
}

/// Pluggable vendor integration: pagination, field mapping, rate-limit and
/// auth signaling live behind this seam. One implementation per vendor;
/// the orchestrator is generic over it.
#[async_trait]
pub trait VendorCapability: Send + Sync {
    /// Stable vendor identifier (matches `IntegrationKind::as_str`).
    async fn id(&self) -> &'static str;

    /// Fetch the next page of records strictly after `watermark` in
    /// (update timestamp, vendor id) order. Finite per call; restartable
    /// from any watermark. Errors must map onto the core taxonomy so the
    /// orchestrator can classify them.
    async fn fetch_since(
        &self,
        account: &IntegrationAccount,
        kind: ObjectKind,
        watermark: &Watermark,
        page_size: u32,
    ) -> Result<VendorPage>;

    /// Exchange the refresh token for a fresh credential set.
    async fn refresh_credentials(&self, credentials: &CredentialSet) -> Result<CredentialSet>;
}
