mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands};
use ledgersync_core::{
    AccountId, CredentialSet, IntegrationKind, SqliteSyncStore, SyncConfig, SyncEngine,
    SyncRunner, SyncStore,
};
use ledgersync_integrations::quickbooks::{QuickBooksConfig, QuickBooksVendor};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // JSON logs to stdout, filtered by RUST_LOG (default info).
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cmd = cli.command.unwrap_or(Commands::Serve {
        data_dir: ".ledgersync".into(),
    });

    match cmd {
        Commands::Serve { data_dir } => serve(&data_dir).await?,
        Commands::Register {
            data_dir,
            integration,
            external_account_id,
            access_token,
            refresh_token,
            expires_in_secs,
        } => {
            let store = open_store(&data_dir).await?;
            let integration = parse_integration(&integration)?;
            let credentials = CredentialSet::new(
                access_token,
                refresh_token,
                chrono::Utc::now() + chrono::Duration::seconds(expires_in_secs),
            )?;
            let account = ledgersync_core::IntegrationAccount::new(
                integration,
                external_account_id,
                credentials,
                None,
            )?;
            store.insert_account(&account).await?;
            println!("{}", account.id);
            tracing::info!(account = %account.id, "account registered; run `ledgersync serve` to sync");
        }
        Commands::Disable {
            data_dir,
            account_id,
        } => {
            let store = open_store(&data_dir).await?;
            store
                .set_account_status(
                    AccountId(account_id),
                    ledgersync_core::AccountStatus::Disabled,
                    chrono::Utc::now(),
                )
                .await?;
            tracing::info!(account = %account_id, "account disabled");
        }
        Commands::Accounts { data_dir } => {
            let store = open_store(&data_dir).await?;
            let accounts = store.list_accounts().await?;
            for account in &accounts {
                println!(
                    "{}  {}  {}  {}",
                    account.id, account.integration, account.external_account_id, account.status
                );
            }
            if accounts.is_empty() {
                println!("no accounts connected");
            }
        }
        Commands::Status {
            data_dir,
            account_id,
        } => {
            let store = open_store(&data_dir).await?;
            let cursors = store.list_cursors(AccountId(account_id)).await?;
            if cursors.is_empty() {
                println!("no sync activity yet");
            }
            for cursor in &cursors {
                println!("{}", serde_json::to_string_pretty(cursor)?);
            }
        }
    }

    Ok(())
}

async fn open_store(data_dir: &Path) -> anyhow::Result<Arc<SqliteSyncStore>> {
    let store = SqliteSyncStore::new(data_dir.join("ledgersync.db"))
        .await
        .context("open sqlite store")?;
    Ok(Arc::new(store))
}

fn parse_integration(s: &str) -> anyhow::Result<IntegrationKind> {
    IntegrationKind::parse_str(s)
        .with_context(|| format!("unknown integration '{s}' (expected: quickbooks)"))
}

async fn serve(data_dir: &Path) -> anyhow::Result<()> {
    let store: Arc<dyn SyncStore> = open_store(data_dir).await?;
    let config = SyncConfig::from_env()?;

    let engine = Arc::new(SyncEngine::new(store.clone(), config.clone()));
    match QuickBooksConfig::from_env()? {
        Some(qb) => {
            engine
                .register_vendor(Arc::new(QuickBooksVendor::new(qb)?))
                .await?;
            tracing::info!("quickbooks vendor registered");
        }
        None => {
            tracing::warn!("quickbooks not configured (LEDGERSYNC_QB_CLIENT_ID unset); quickbooks accounts will halt with a configuration error");
        }
    }

    let runner = SyncRunner::new(engine, store, config);
    let started = runner.start_all().await?;
    tracing::info!(accounts = started, "sync daemon running");

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down");
    runner.shutdown().await;
    Ok(())
}
