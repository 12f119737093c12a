use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "ledgersync", version, about = "Continuous vendor-record replication")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the sync daemon: start a control loop for every runnable account.
    Serve {
        /// Data directory holding the SQLite store.
        #[arg(long, env = "LEDGERSYNC_DATA_DIR", default_value = ".ledgersync")]
        data_dir: PathBuf,
    },

    /// Connect an account from already-exchanged OAuth credentials and start
    /// syncing it on the next `serve`.
    Register {
        #[arg(long, env = "LEDGERSYNC_DATA_DIR", default_value = ".ledgersync")]
        data_dir: PathBuf,

        /// Integration type (e.g. "quickbooks").
        #[arg(long)]
        integration: String,

        /// Vendor tenant identifier (e.g. the QuickBooks realm id).
        #[arg(long)]
        external_account_id: String,

        #[arg(long, env = "LEDGERSYNC_ACCESS_TOKEN")]
        access_token: String,

        #[arg(long, env = "LEDGERSYNC_REFRESH_TOKEN")]
        refresh_token: String,

        /// Seconds until the access token expires.
        #[arg(long, default_value = "3600")]
        expires_in_secs: i64,
    },

    /// Soft-disable an account; its loop stops at the next idle checkpoint.
    Disable {
        #[arg(long, env = "LEDGERSYNC_DATA_DIR", default_value = ".ledgersync")]
        data_dir: PathBuf,

        #[arg(long)]
        account_id: Uuid,
    },

    /// List connected accounts.
    Accounts {
        #[arg(long, env = "LEDGERSYNC_DATA_DIR", default_value = ".ledgersync")]
        data_dir: PathBuf,
    },

    /// Show per-kind sync status (cursor watermarks) for an account.
    Status {
        #[arg(long, env = "LEDGERSYNC_DATA_DIR", default_value = ".ledgersync")]
        data_dir: PathBuf,

        #[arg(long)]
        account_id: Uuid,
    },
}
