// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # WePay Node
//!
//! Entry point for the `wepay-node` binary. Parses CLI arguments, loads
//! settings and merchant keys once, opens the configured store, and serves
//! the HTTP API until SIGINT or SIGTERM.
//!
//! Subcommands:
//!
//! - `run`     start the service
//! - `init`    write a development key pair and a settings template
//! - `version` print build version information

mod api;
mod cli;
mod logging;
mod metrics;
mod settings;

use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::signal;

use wepay_core::config::AES_KEY_LENGTH;
use wepay_core::psp::{PspClient, TransferGateway};
use wepay_core::storage::{BalanceStore, PgStore, TransferStore, WePayDB};
use wepay_core::TransferCoordinator;

use cli::{Commands, WePayNodeCli};
use logging::LogFormat;
use metrics::{InstrumentedGateway, NodeMetrics};
use settings::Settings;

/// Pool size for the PostgreSQL backend.
const PG_MAX_CONNECTIONS: u32 = 10;

/// Merchant signing key size written by `init`.
const RSA_KEY_BITS: usize = 2048;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = WePayNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Loads everything, then serves until a shutdown signal.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        settings.listen_addr = listen;
    }

    logging::init_logging(logging::DEFAULT_FILTER, settings.log_format());
    tracing::info!(
        mch_id = %settings.mch_id,
        appid = %settings.appid,
        listen = %settings.listen_addr,
        psp = %settings.psp_base_url,
        "starting wepay-node"
    );

    // --- Merchant keys, read exactly once ---
    let merchant = Arc::new(settings.merchant()?);
    tracing::info!(
        cert_serial = %merchant.cert_serial(),
        pay_public_key_id = %merchant.pay_public_key_id(),
        "merchant keys loaded"
    );

    // --- Persistent storage ---
    let (transfers, balances) = open_store(&settings.database_dsn).await?;

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    // --- PSP client ---
    let client = PspClient::with_base_url(
        Arc::clone(&merchant),
        settings.psp_base_url.as_str(),
        settings.io_timeout(),
    )
    .context("failed to build PSP client")?;
    let gateway: Arc<dyn TransferGateway> =
        Arc::new(InstrumentedGateway::new(client, Arc::clone(&node_metrics)));

    // --- Application state ---
    let coordinator = TransferCoordinator::new(
        transfers,
        balances,
        gateway,
        merchant,
        settings.transfer_settings(),
    );
    let router = api::create_router(api::AppState {
        coordinator,
        metrics: node_metrics,
    });

    // --- Serve ---
    let listener = tokio::net::TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("failed to bind listener on {}", settings.listen_addr))?;
    tracing::info!("HTTP API listening on {}", settings.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    tracing::info!("wepay-node stopped");
    Ok(())
}

type Stores = (Arc<dyn TransferStore>, Arc<dyn BalanceStore>);

/// Picks the backend from the DSN scheme.
async fn open_store(dsn: &str) -> Result<Stores> {
    if dsn.starts_with("postgres://") || dsn.starts_with("postgresql://") {
        let store = PgStore::connect(dsn, PG_MAX_CONNECTIONS)
            .await
            .context("failed to connect to PostgreSQL")?;
        store
            .ensure_schema()
            .await
            .context("failed to create PostgreSQL schema")?;
        tracing::info!("using PostgreSQL store");
        let store = Arc::new(store);
        return Ok((store.clone() as Arc<dyn TransferStore>, store as Arc<dyn BalanceStore>));
    }

    let db = if dsn == "sled::memory" {
        tracing::warn!("using a temporary sled store; nothing survives a restart");
        WePayDB::open_temporary().context("failed to open temporary sled store")?
    } else {
        let path = dsn.strip_prefix("sled://").unwrap_or(dsn);
        if path.is_empty() {
            bail!("database_dsn `{dsn}` names no path");
        }
        let db = WePayDB::open(path)
            .with_context(|| format!("failed to open sled store at {path}"))?;
        tracing::info!(path, "using sled store");
        db
    };
    let db = Arc::new(db);
    Ok((db.clone() as Arc<dyn TransferStore>, db as Arc<dyn BalanceStore>))
}

/// Writes a fresh merchant key pair, an API v3 key and `wepay.toml`.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("wepay_node=info", LogFormat::Pretty);

    let dir = &args.dir;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let key_path = dir.join("apiclient_key.pem");
    let pub_path = dir.join("apiclient_pub.pem");
    let config_path = dir.join("wepay.toml");
    if !args.force {
        for path in [&key_path, &pub_path, &config_path] {
            if path.exists() {
                bail!("{} already exists; pass --force to overwrite", path.display());
            }
        }
    }

    tracing::info!(bits = RSA_KEY_BITS, "generating merchant key pair");
    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| anyhow!("RSA key generation failed: {e}"))?;
    let public_key = RsaPublicKey::from(&private_key);

    let private_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| anyhow!("failed to encode private key: {e}"))?;
    let public_pem = public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| anyhow!("failed to encode public key: {e}"))?;

    write_file(&key_path, private_pem.as_bytes())?;
    restrict_permissions(&key_path)?;
    write_file(&pub_path, public_pem.as_bytes())?;

    let api_v3_key: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(AES_KEY_LENGTH)
        .map(char::from)
        .collect();
    write_file(&config_path, settings::template(dir, &api_v3_key).as_bytes())?;
    restrict_permissions(&config_path)?;

    println!("Merchant files written.");
    println!("  Private key : {}", key_path.display());
    println!("  Public key  : {}", pub_path.display());
    println!("  Settings    : {}", config_path.display());
    println!();
    println!("Fill in appid, mch_id, cert_serial and the PSP public key in wepay.toml,");
    println!("then start with `wepay-node run --config {}`.", config_path.display());

    Ok(())
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    std::fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))
}

/// Owner-only on Unix. Both the private key and the API v3 key are secrets.
fn restrict_permissions(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn print_version() {
    println!("wepay-node {}", env!("CARGO_PKG_VERSION"));
    println!("rustc      {}", option_env!("RUSTC_VERSION").unwrap_or("unknown"));
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received, draining connections");
}
