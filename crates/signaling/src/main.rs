use signaling_server::{run_server, SignalingServerConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,signaling_server=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is normal outside local runs.
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_target(false)
        .compact()
        .init();

    if let Err(err) = dotenv {
        if !err.not_found() {
            warn!(error = %err, "ignoring unreadable .env file");
        }
    }

    let config = SignalingServerConfig::from_env()?;
    info!(
        listen_addr = %config.listen_addr,
        public_base_url = %config.public_base_url,
        max_message_bytes = config.max_message_bytes,
        "relay configured"
    );
    run_server(config).await
}
