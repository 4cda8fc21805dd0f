//! termgate - SSH gateway for terminal sharing
//!
//! Usage: `termgate [config.toml]`

use anyhow::Result;
use tracing::info;

use termgate::config::Config;
use termgate::paths;
use termgate::server::Gateway;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("termgate=info".parse()?),
        )
        .init();

    let arg = std::env::args().nth(1);
    let config_path = paths::config_path(arg.as_deref());
    let config = Config::load(&config_path)?;

    info!(
        host = %config.host,
        proxy_protocol = config.use_proxy_protocol,
        exec = config.exec_enabled,
        "starting termgate"
    );
    match config.recording {
        Some(ref recording) => info!(url = %recording.url, topic = %recording.topic, "recording sessions"),
        None => info!("recording is disabled, no [recording] url configured"),
    }

    let bind_address = config.bind_address.clone();
    let port = config.port;
    let keys_dir = config.keys_dir.clone();

    Gateway::new(config)?
        .run_server(&bind_address, port, &keys_dir)
        .await
}
