use anyhow::Result;
use std::sync::Arc;

use signup_gateway::auth::{
    CredentialStore, MemoryCredentialStore, OAuthStateStore, SqliteCredentialStore, System,
    TokenError, TokenManager,
};
use signup_gateway::config::{Config, LogFormat};
use signup_gateway::routes;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match config.log_format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }

    config.validate()?;

    tracing::info!("🚀 Signup Gateway starting...");
    tracing::info!(
        "Server configured: {}:{}",
        config.server_host,
        config.server_port
    );

    // Credential store
    let store: Arc<dyn CredentialStore> = if config.is_in_memory_store() {
        tracing::warn!("Using in-memory credential store; connections are lost on restart");
        Arc::new(MemoryCredentialStore::new())
    } else {
        tracing::info!(
            "Opening credential store: {}",
            config.credentials_db_file.display()
        );
        Arc::new(SqliteCredentialStore::open(&config.credentials_db_file)?)
    };

    let tokens = Arc::new(TokenManager::new(
        store,
        config.oauth_clients(),
        config.token_refresh_margin,
        config.token_refresh_timeout,
    )?);

    check_integrations(&tokens).await;

    let oauth_states = OAuthStateStore::new(config.oauth_state_ttl);
    tokio::spawn(prune_oauth_states(oauth_states.clone(), 60));

    let app_state = routes::AppState {
        admin_api_key: config.admin_api_key.clone(),
        tokens,
        oauth_states,
    };

    let app = routes::build_router(app_state);

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    print_startup_banner(&config);

    tracing::info!("🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("👋 Server shutdown complete");

    Ok(())
}

/// Log the credential state of each integration at startup
///
/// Failures are reported, not fatal: an integration may be connected later
/// through the admin endpoints.
async fn check_integrations(tokens: &TokenManager) {
    for system in System::ALL {
        match tokens.get_valid_access_token(system).await {
            Ok(_) => tracing::info!("✅ {} integration ready", system),
            Err(TokenError::NotConfigured { .. }) => {
                tracing::info!("{} integration not configured, skipping", system)
            }
            Err(TokenError::NotAuthorized { .. }) => tracing::warn!(
                "{} integration not connected; open /admin/integrations/{}/connect",
                system,
                system
            ),
            Err(e) => {
                tracing::error!("❌ {}", e);
                tracing::warn!("{} requests will fail until credentials recover", system);
            }
        }
    }
}

/// Periodically drop OAuth state tokens that were never used
async fn prune_oauth_states(states: OAuthStateStore, interval_secs: u64) {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));

    loop {
        interval.tick().await;
        states.prune_expired();
        tracing::debug!(
            "OAuth state cleanup complete, {} pending",
            states.pending_count()
        );
    }
}

/// Print startup banner
fn print_startup_banner(config: &Config) {
    println!();
    println!("  Signup Gateway {}", env!("CARGO_PKG_VERSION"));
    println!(
        "  Server:      http://{}:{}",
        config.server_host, config.server_port
    );
    println!("  Store:       {}", config.credentials_db_file.display());
    println!("  Log Level:   {}", config.log_level);
    for system in System::ALL {
        let configured = config
            .integrations
            .get(&system)
            .and_then(|i| i.oauth_client())
            .is_some();
        println!(
            "  {:<12} {}",
            format!("{}:", system),
            if configured { "configured" } else { "disabled" }
        );
    }
    println!();
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
