//! ledgersync core library: the sync orchestration engine and its
//! collaborator seams (vendor capability, storage adapter).

pub mod config;
pub mod error;
pub mod store;
pub mod sync;

pub use config::SyncConfig;
pub use error::{Error, FailureClass, Result};
pub use store::{MemorySyncStore, SqliteSyncStore, SyncStore};
pub use sync::credential::CredentialPolicy;
pub use sync::cursor::CursorTracker;
pub use sync::gateway::PersistenceGateway;
pub use sync::models::{
    AccountId, AccountStatus, CredentialSet, CursorState, IntegrationAccount, IntegrationKind,
    ObjectKind, RawExternalObject, SyncCursor, SyncLease, Watermark,
};
pub use sync::normalize::normalize;
pub use sync::orchestrator::{CycleReport, KindReport, SyncEngine};
pub use sync::runner::SyncRunner;
pub use sync::traits::{VendorCapability, VendorPage, VendorRecord};
