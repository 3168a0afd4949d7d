use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};

use suiterun_common::Config;
use suiterun_web::FunctionHandler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let web_addr: SocketAddr = std::env::var("SUITERUN_WEB_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let config = Config::from_env(None)?;
    if config.api_token.is_none() {
        warn!("API_TOKEN is not set; every invocation will be rejected");
    }

    info!(
        "Starting suiterun {} (browser: {}, automation server: {}:{}/{})",
        suiterun_common::VERSION,
        config.browser.strategy,
        config.server.host,
        config.server.ports[0],
        config.server.ports[1]
    );

    let handler = Arc::new(FunctionHandler::from_config(&config)?);
    suiterun_web::server::serve(web_addr, handler).await
}
