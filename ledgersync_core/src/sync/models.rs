use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
}

/// Connected-account identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub Uuid);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for AccountId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl FromStr for AccountId {
    type Err = IdParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| IdParseError::InvalidUuid(s.to_string()))?;
        Ok(Self(id))
    }
}

/// Supported vendor integrations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationKind {
    Quickbooks,
}

impl IntegrationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationKind::Quickbooks => "quickbooks",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "quickbooks" => Some(IntegrationKind::Quickbooks),
            _ => None,
        }
    }

    /// Object kinds synced for this vendor, in sync order.
    pub fn object_kinds(&self) -> &'static [ObjectKind] {
        match self {
            IntegrationKind::Quickbooks => &[ObjectKind::Customer, ObjectKind::Invoice],
        }
    }
}

impl fmt::Display for IntegrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of vendor objects tracked by the sync engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Customer,
    Invoice,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Customer => "customer",
            ObjectKind::Invoice => "invoice",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "customer" => Some(ObjectKind::Customer),
            "invoice" => Some(ObjectKind::Invoice),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// OAuth credential value object. Replaced atomically on refresh, never
/// partially mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CredentialSet {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Result<Self> {
        let access_token = access_token.into();
        if access_token.trim().is_empty() {
            return Err(Error::InvalidInput("access_token is empty".to_string()));
        }
        let refresh_token = refresh_token.into();
        if refresh_token.trim().is_empty() {
            return Err(Error::InvalidInput("refresh_token is empty".to_string()));
        }
        Ok(Self {
            access_token,
            refresh_token,
            expires_at,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// True once `now` is within `lead_time` of expiry. Refreshing ahead of
    /// expiry keeps API calls from failing with an auth error first.
    pub fn needs_refresh(&self, now: DateTime<Utc>, lead_time: Duration) -> bool {
        let lead = chrono::Duration::from_std(lead_time).unwrap_or_else(|_| chrono::Duration::zero());
        now >= self.expires_at - lead
    }
}

/// Lifecycle status of a connected account.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Expired,
    Error,
    Disabled,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Expired => "expired",
            AccountStatus::Error => "error",
            AccountStatus::Disabled => "disabled",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(AccountStatus::Active),
            "expired" => Some(AccountStatus::Expired),
            "error" => Some(AccountStatus::Error),
            "disabled" => Some(AccountStatus::Disabled),
            _ => None,
        }
    }

    /// Whether the control loop may run a cycle. `Expired` is runnable: the
    /// cycle refreshes credentials before fetching.
    pub fn is_runnable(&self) -> bool {
        matches!(self, AccountStatus::Active | AccountStatus::Expired)
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate root for one connected vendor account.
///
/// Invariants:
/// - `(integration, external_account_id)` is unique across the system
/// - at most one active control loop per account
/// - never physically deleted while cursors/objects reference it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationAccount {
    pub id: AccountId,
    pub integration: IntegrationKind,
    /// Vendor tenant identifier (e.g. a QuickBooks realm id).
    pub external_account_id: String,
    pub credentials: CredentialSet,
    pub status: AccountStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IntegrationAccount {
    pub fn new(
        integration: IntegrationKind,
        external_account_id: impl Into<String>,
        credentials: CredentialSet,
        now: Option<DateTime<Utc>>,
    ) -> Result<Self> {
        let external_account_id = external_account_id.into();
        if external_account_id.trim().is_empty() {
            return Err(Error::InvalidInput(
                "external_account_id is empty".to_string(),
            ));
        }
        let now = now.unwrap_or_else(Utc::now);
        Ok(Self {
            id: AccountId(Uuid::new_v4()),
            integration,
            external_account_id,
            credentials,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
        })
    }

    /// Replace the credential set and recompute status from its expiry.
    pub fn update_credentials(&mut self, credentials: CredentialSet, now: DateTime<Utc>) {
        self.status = if credentials.is_expired(now) {
            AccountStatus::Expired
        } else {
            AccountStatus::Active
        };
        self.credentials = credentials;
        self.updated_at = now;
    }

    pub fn mark_error(&mut self, now: DateTime<Utc>) {
        self.status = AccountStatus::Error;
        self.updated_at = now;
    }

    pub fn mark_disabled(&mut self, now: DateTime<Utc>) {
        self.status = AccountStatus::Disabled;
        self.updated_at = now;
    }
}

/// Position in a vendor's change stream for one object kind.
///
/// Compound ordering key: vendor update timestamp first, vendor object id as
/// the tie-break. The tie-break makes the order total even when many records
/// share an instant, so a page boundary inside such a group cannot skip
/// records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Watermark {
    pub updated_at: DateTime<Utc>,
    pub object_id: String,
}

impl Watermark {
    pub fn new(updated_at: DateTime<Utc>, object_id: impl Into<String>) -> Self {
        Self {
            updated_at,
            object_id: object_id.into(),
        }
    }

    /// The vendor-defined minimum: precedes every real record.
    pub fn origin() -> Self {
        Self {
            updated_at: DateTime::<Utc>::MIN_UTC,
            object_id: String::new(),
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.updated_at.to_rfc3339(), self.object_id)
    }
}

/// Outcome of the most recent sync attempt for a (account, kind) pair.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorState {
    Idle,
    InProgress,
    Succeeded,
    Failed,
}

impl CursorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorState::Idle => "idle",
            CursorState::InProgress => "in_progress",
            CursorState::Succeeded => "succeeded",
            CursorState::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(CursorState::Idle),
            "in_progress" => Some(CursorState::InProgress),
            "succeeded" => Some(CursorState::Succeeded),
            "failed" => Some(CursorState::Failed),
            _ => None,
        }
    }
}

/// Durable sync progress per (account, object kind).
///
/// Invariants:
/// - the watermark is monotonically non-decreasing over the entity's lifetime
/// - the watermark advances only after the corresponding persistence batch
///   is durable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub account_id: AccountId,
    pub kind: ObjectKind,
    pub watermark: Watermark,
    pub state: CursorState,
    pub last_error: Option<String>,
    pub records_synced: u64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_advanced_at: Option<DateTime<Utc>>,
}

impl SyncCursor {
    /// Lazily-created cursor at the vendor minimum.
    pub fn initial(account_id: AccountId, kind: ObjectKind) -> Self {
        Self {
            account_id,
            kind,
            watermark: Watermark::origin(),
            state: CursorState::Idle,
            last_error: None,
            records_synced: 0,
            last_attempt_at: None,
            last_advanced_at: None,
        }
    }

    pub fn mark_attempt(&mut self, now: DateTime<Utc>) {
        self.state = CursorState::InProgress;
        self.last_attempt_at = Some(now);
    }

    pub fn mark_failure(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.state = CursorState::Failed;
        self.last_error = Some(message.into());
        self.last_attempt_at = Some(now);
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.state = CursorState::Succeeded;
        self.last_error = None;
        self.last_attempt_at = Some(now);
    }

    /// Advance to `candidate` after a committed batch of `records` records.
    ///
    /// A candidate behind the stored watermark is an invariant violation,
    /// not an expected runtime path: the cursor is left untouched and the
    /// batch must be aborted.
    pub fn advance(
        &mut self,
        candidate: Watermark,
        records: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if candidate < self.watermark {
            return Err(Error::CursorRegression {
                current: self.watermark.to_string(),
                attempted: candidate.to_string(),
            });
        }
        self.watermark = candidate;
        self.records_synced += records;
        self.last_advanced_at = Some(now);
        Ok(())
    }
}

/// One vendor record as last seen, stored exactly as received.
///
/// Natural key `(account_id, kind, vendor_object_id)` is unique; repeated
/// ingestion overwrites payload and timestamps, last-write-wins by vendor
/// update timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawExternalObject {
    pub account_id: AccountId,
    pub kind: ObjectKind,
    pub vendor_object_id: String,
    pub payload: serde_json::Value,
    pub vendor_updated_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
}

impl RawExternalObject {
    pub fn new(
        account_id: AccountId,
        kind: ObjectKind,
        vendor_object_id: impl Into<String>,
        payload: serde_json::Value,
        vendor_updated_at: DateTime<Utc>,
        ingested_at: DateTime<Utc>,
    ) -> Result<Self> {
        let vendor_object_id = vendor_object_id.into();
        if vendor_object_id.trim().is_empty() {
            return Err(Error::InvalidInput("vendor_object_id is empty".to_string()));
        }
        if payload.is_null() {
            return Err(Error::InvalidInput("payload is null".to_string()));
        }
        Ok(Self {
            account_id,
            kind,
            vendor_object_id,
            payload,
            vendor_updated_at,
            ingested_at,
        })
    }

    /// Position of this record in the change stream.
    pub fn watermark(&self) -> Watermark {
        Watermark::new(self.vendor_updated_at, self.vendor_object_id.clone())
    }
}

/// Per-account execution lease; at most one live control loop per account
/// across workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLease {
    pub account_id: AccountId,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}
