use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (PRESSPASS_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("PRESSPASS_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("presspass_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = presspass_server::config::ServerConfig::parse();
    tracing::info!("Starting audience access server on {}", config.listen_addr);
    if config.client_id.is_empty() {
        tracing::warn!("PRESSPASS_CLIENT_ID not set, every identity token will fail the audience check");
    }
    if config.membership_url.is_none() {
        tracing::info!("No membership oracle configured; subscription checks always answer no");
    }

    let state = presspass_server::web::build_state(config)?;
    let (addr, handle) = presspass_server::web::start(state).await?;
    tracing::info!(%addr, "presspass listening");
    handle.await?;
    Ok(())
}
