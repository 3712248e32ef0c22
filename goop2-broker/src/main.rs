use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = std::env::var("GOOP2_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("goop2_broker=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = goop2_broker::BrokerConfig::parse();
    tracing::info!(bind = %config.bind, "starting goop2 rendezvous broker");
    goop2_broker::run(config).await
}
