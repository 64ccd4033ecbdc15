use std::fs;
use std::io::Write as _;
use std::io::{self, BufRead};
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use vacuumd::account::AccountClient;
use vacuumd::account::SessionCredentials;
use vacuumd::config::Config;
use vacuumd::hub::Hub;
use vacuumd::options::OptionsStore;

#[derive(Parser)]
#[command(name = "vacuumd", about = "Robot vacuum bridge daemon")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long, default_value = "vacuumd.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading config from {}", args.config.display()))?;

    tracing_subscriber::fmt()
        .with_max_level(config.logging.level)
        .init();

    tracing::info!("vacuumd starting");
    tracing::info!("Loaded config from: {}", args.config.display());

    let account = match &config.account.base_url {
        Some(base_url) => AccountClient::with_base_url(&config.account.username, base_url),
        None => AccountClient::new(&config.account.username),
    };

    let session = obtain_session(&account, &config.account.session_file).await?;

    let options = OptionsStore::load(&config.store.options_file)
        .with_context(|| format!("loading {}", config.store.options_file.display()))?;

    let hub = Arc::new(Hub::bootstrap(&account, &session, &options).await?);

    let (api_shutdown_tx, api_shutdown_rx) = tokio::sync::oneshot::channel();
    let api_task = tokio::spawn(vacuumd::api::serve(
        config.api.listen.clone(),
        config.api.port,
        Arc::clone(&hub),
        api_shutdown_rx,
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received");

    let _ = api_shutdown_tx.send(());
    match api_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("API server error: {e:#}"),
        Err(e) => tracing::error!("API server task panicked: {e}"),
    }

    match Arc::try_unwrap(hub) {
        Ok(hub) => hub.shutdown().await,
        Err(_) => tracing::warn!("hub still referenced at shutdown, skipping device release"),
    }

    tracing::info!("vacuumd stopped");
    Ok(())
}

/// Load the cached session, or run the interactive email-code login and
/// cache the result for next time.
async fn obtain_session(
    account: &AccountClient,
    session_file: &Path,
) -> anyhow::Result<SessionCredentials> {
    if session_file.exists() {
        let text = fs::read_to_string(session_file)
            .with_context(|| format!("reading {}", session_file.display()))?;
        let session: SessionCredentials =
            serde_json::from_str(&text).context("cached session is corrupt, delete it to re-login")?;
        tracing::info!("using cached session from {}", session_file.display());
        return Ok(session);
    }

    account
        .request_verification()
        .await
        .context("requesting verification code")?;
    print!("Verification code sent. Enter it here: ");
    io::stdout().flush()?;

    let mut code = String::new();
    io::stdin()
        .lock()
        .read_line(&mut code)
        .context("reading verification code")?;

    let session = account
        .exchange_code(code.trim())
        .await
        .context("code exchange failed")?;

    fs::write(session_file, serde_json::to_string_pretty(&session)?)
        .with_context(|| format!("caching session to {}", session_file.display()))?;
    tracing::info!("session cached to {}", session_file.display());

    Ok(session)
}
