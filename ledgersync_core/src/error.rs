use std::error::Error as StdError;
use std::time::Duration;

/// Common error type for `ledgersync_core`.
///
/// Concrete backend implementations (SQLite, vendor HTTP clients, etc.) should
/// preserve the underlying error chain where possible via `Error::backend`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("rate limited by vendor")]
    RateLimited { retry_after: Option<Duration> },

    #[error("credentials expired: {0}")]
    CredentialExpired(String),

    #[error("normalization failed: {0}")]
    Normalization(String),

    #[error("cursor regression: candidate {attempted} is behind stored {current}")]
    CursorRegression { current: String, attempted: String },

    #[error("terminal configuration error: {0}")]
    TerminalConfiguration(String),

    #[error("backend error: {context}")]
    Backend {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error("backend error: {0}")]
    BackendMessage(String),
}

/// How the orchestrator reacts to a failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FailureClass {
    /// Retry with exponential backoff, capped per cycle, then defer to the
    /// next cycle.
    Transient,
    /// Retry after the vendor-provided wait (or a default rate-limit wait).
    RateLimited,
    /// Drive a credential refresh, then retry the failed call once.
    AuthExpired,
    /// Abort the current cycle for this kind without advancing anything;
    /// the account stays runnable and is retried next cycle.
    CycleFatal,
    /// Halt the account's loop and surface via account status; requires
    /// operator remediation.
    Terminal,
}

impl Error {
    pub fn backend(
        context: impl Into<String> + std::fmt::Debug,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Classify this failure for the orchestrator's retry/halt decision.
    pub fn class(&self) -> FailureClass {
        match self {
            Error::TransientNetwork(_) | Error::Backend { .. } | Error::BackendMessage(_) => {
                FailureClass::Transient
            }
            Error::RateLimited { .. } => FailureClass::RateLimited,
            Error::CredentialExpired(_) => FailureClass::AuthExpired,
            Error::Normalization(_) | Error::CursorRegression { .. } => FailureClass::CycleFatal,
            Error::InvalidInput(_)
            | Error::NotFound(_)
            | Error::Conflict(_)
            | Error::TerminalConfiguration(_) => FailureClass::Terminal,
        }
    }

    /// The vendor's requested wait, when this is a rate-limit signal.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
