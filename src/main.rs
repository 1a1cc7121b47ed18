use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use courier_server::auth::{jwt, JwtVerifier};
use courier_server::config::{generate_config_template, Config};
use courier_server::state::AppState;
use courier_server::store::{MemoryMessageStore, MessageStore, SqliteMessageStore};
use courier_server::{db, routes};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("courier_server=info"))
    };
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(env_filter()).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(env_filter()).init();
    }

    tracing::info!("Courier server v{} starting", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn MessageStore> = match config.message_store.as_str() {
        "memory" => {
            tracing::warn!("Using in-memory message store, messages are lost on restart");
            Arc::new(MemoryMessageStore::new())
        }
        "sqlite" => Arc::new(SqliteMessageStore::new(db::init_db(&config.data_dir)?)),
        other => return Err(format!("unknown message_store {other:?}, expected sqlite or memory").into()),
    };

    // Load or generate JWT signing key (256-bit random, stored in data_dir)
    let jwt_secret = jwt::load_or_generate_jwt_secret(&config.data_dir)?;
    let verifier = Arc::new(JwtVerifier::new(&jwt_secret));

    tracing::info!(
        outbound_capacity = config.hub.outbound_capacity,
        liveness_window_secs = config.hub.liveness_window_secs,
        write_wait_secs = config.hub.write_wait_secs,
        throttle_limit = config.hub.throttle_limit,
        throttle_window_secs = config.hub.throttle_window_secs,
        "Hub configured"
    );

    let app_state = AppState::new(store, verifier, config.hub.clone());

    // Spawn background task to clean up throttle state
    routes::spawn_throttle_cleanup(&app_state, Duration::from_secs(60));

    let app = routes::build_router(app_state);

    // Bind and serve
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
