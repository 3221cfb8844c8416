//! mailhub binary: stdio MCP server and one-shot sync runner

use std::sync::Arc;

use clap::{Parser, Subcommand};
use mailhub::attachments::LocalAttachmentStore;
use mailhub::config::{ServerConfig, seed_accounts};
use mailhub::credentials::RefreshSignals;
use mailhub::provider::ProviderRegistry;
use mailhub::server::MailhubServer;
use mailhub::service::Mailhub;
use mailhub::store::Store;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mailhub", version, about = "Multi-provider mail sync and dispatch engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve MCP tools over stdio (default)
    Serve,
    /// Sync one account and exit
    Sync {
        #[arg(long)]
        account: i64,
        /// Ignore the last sync time and fetch everything
        #[arg(long)]
        all: bool,
    },
}

/// Application entry point
///
/// Initializes tracing from environment, loads config, seeds configured
/// accounts and then either serves over stdio or runs a single sync.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load_from_env()?;

    let store = Arc::new(Store::open(&config.database_path)?);
    let seeded = seed_accounts(&store, config.user_id, &config.accounts)?;
    info!(accounts = seeded.len(), "configured accounts loaded");

    let attachments = Arc::new(LocalAttachmentStore::open(config.attachment_dir.clone()).await?);
    let providers = ProviderRegistry::standard(&config.engine.provider_settings())?;
    let (refresher, mut refreshes) = RefreshSignals::channel();
    let (hub, mut failures) = Mailhub::new(
        config.engine.clone(),
        store,
        providers,
        attachments,
        Arc::new(refresher),
    )?;
    let hub = Arc::new(hub);
    tokio::spawn(async move {
        while let Some(failure) = failures.recv().await {
            warn!(
                account_id = failure.account_id,
                error = %failure.error,
                "background sync reported failure"
            );
        }
    });

    // Tokens are supplied through the environment, so a due refresh means the
    // operator has to rotate MAILHUB_ACCOUNT_<SEGMENT>_ACCESS_TOKEN.
    tokio::spawn(async move {
        while let Some(request) = refreshes.recv().await {
            warn!(
                account_id = request.account_id,
                expires_at = ?request.expires_at,
                "access token close to expiry; rotate it and restart"
            );
        }
    });

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let service = MailhubServer::new(Arc::clone(&hub), config.user_id)
                .serve(stdio())
                .await?;
            service.waiting().await?;
        }
        Command::Sync { account, all } => {
            let result = hub.sync_account(config.user_id, account, all).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    hub.shutdown().await;
    Ok(())
}
