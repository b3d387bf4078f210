//! Scanpass - scan-to-login server
//!
//! A user signed in on one device approves a login on another device by
//! scanning the QR code it displays.

use anyhow::{Context, Result};
use clap::Parser;
use scanpass_auth::{
    AccountStore, HandoffSigner, Handshake, Keyring, LoginMethod, RetryPolicy, SessionStorage,
    SessionStore, SigningKey, SystemClock, RETENTION_SECONDS,
};
use scanpass_core::{Config, MAX_APP_SESSION_HOURS};
use scanpass_server::{create_router, create_rustls_config_from_files, AppState};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Scanpass - authorize a sign-in by scanning its QR code
#[derive(Parser, Debug)]
#[command(name = "scanpass")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Server port
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Persist QR sessions to a JSON file.
    /// Without a value, uses ~/.config/scanpass/sessions.json
    #[arg(long, num_args = 0..=1)]
    state_file: Option<Option<PathBuf>>,

    /// Secret used to sign handoff tokens
    #[arg(long, env = "SCANPASS_HANDOFF_SECRET", hide_env_values = true)]
    handoff_secret: Option<String>,

    /// Path to TLS certificate file (PEM format)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Create this user at startup and print a bearer token for it
    #[arg(long)]
    seed_user: Option<String>,

    /// Lifetime of application sessions in hours
    #[arg(
        long,
        default_value = "24",
        value_parser = clap::value_parser!(i64).range(1..=MAX_APP_SESSION_HOURS)
    )]
    app_session_hours: i64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .with_env_filter(EnvFilter::from_default_env().add_directive(log_level.into()))
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();

    info!("Scanpass v{}", env!("CARGO_PKG_VERSION"));

    let tls = args.cert.is_some() && args.key.is_some();
    let config = Config::new()
        .with_bind(args.bind)
        .with_port(args.port)
        .with_state_file(args.state_file.clone().flatten())
        .with_app_session_hours(args.app_session_hours)
        .with_tls(args.cert.clone(), args.key.clone())
        .with_secure_cookies(tls);
    config.validate()?;

    // QR session storage
    let storage = match &args.state_file {
        Some(Some(path)) => {
            info!("Persisting QR sessions to {:?}", path);
            SessionStorage::with_path(path.clone()).await
        }
        Some(None) => {
            info!("Persisting QR sessions to the default state file");
            SessionStorage::new().await
        }
        None => {
            info!("Keeping QR sessions in memory");
            Ok(SessionStorage::in_memory())
        }
    }
    .context("Failed to open session storage")?;
    let storage = Arc::new(storage);
    let store: Arc<dyn SessionStore> = storage.clone();

    // Sweep finished sessions even when no new ones are created
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
        loop {
            interval.tick().await;
            let grace = chrono::Duration::seconds(RETENTION_SECONDS);
            if let Err(e) = storage.purge_expired(chrono::Utc::now(), grace).await {
                warn!("Failed to purge expired sessions: {}", e);
            }
        }
    });

    // Handoff signing key
    let keyring = match args.handoff_secret.as_deref() {
        Some(secret) if !secret.is_empty() => Keyring::from_secret(secret),
        _ => {
            warn!("No handoff secret configured; generated a random key for this run");
            warn!("Handoff tokens will not survive a restart. Set SCANPASS_HANDOFF_SECRET to fix.");
            Keyring::new(SigningKey::generate())
        }
    };

    let clock = Arc::new(SystemClock);
    let retry = RetryPolicy {
        attempts: config.storage_attempts,
        backoff: config.storage_backoff(),
    };
    let handshake = Handshake::new(store, clock.clone(), HandoffSigner::new(Arc::new(keyring)))
        .with_retry(retry);
    let accounts = AccountStore::with_session_ttl(
        clock,
        chrono::Duration::hours(config.app_session_hours),
    );

    if let Some(username) = args.seed_user.as_deref() {
        let user = accounts
            .create_user(username)
            .await
            .context("Failed to create seed user")?;
        let issued = accounts
            .issue_session(&user.id, "Bootstrap", "local")
            .await
            .context("Failed to issue bootstrap session")?;
        accounts
            .record_login(&user.id, LoginMethod::Bootstrap, "Bootstrap", true)
            .await;

        info!("");
        info!("  Seeded user '{}' ({})", user.username, user.id);
        info!("  Scanner bearer token (shown once):");
        info!("");
        println!("{}", issued.token);
        info!("");
    }

    let addr = config.socket_addr();
    let protocol = if config.tls_enabled() { "https" } else { "http" };
    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::new(handshake),
        Arc::new(accounts),
    ));
    let router = create_router(state);

    info!("Listening on {}://{}", protocol, addr);
    info!("Press Ctrl+C to stop.");

    if let (Some(cert), Some(key)) = (&config.tls_cert, &config.tls_key) {
        let tls_config = create_rustls_config_from_files(cert, key)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to load TLS certificate: {}", e))?;

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();

        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
            shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
        });

        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(router.into_make_service())
            .await?;
    } else {
        let shutdown = async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        };

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
    }

    info!("Server stopped");
    Ok(())
}
