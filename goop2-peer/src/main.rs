use anyhow::{Context, Result};
use clap::Parser;
use goop2_peer::config::{Cli, Command, PeerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let json_logs = std::env::var("GOOP2_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("goop2_peer=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let cli = Cli::parse();
    match cli.command {
        Command::Run { peer_dir, listen_port, web_addr } => run(peer_dir, listen_port, web_addr).await,
        Command::Broker { bind, mirror_path } => {
            let config = goop2_broker::BrokerConfig { bind, mirror_path, ..Default::default() };
            tracing::info!(bind = %config.bind, "starting standalone goop2 rendezvous broker");
            goop2_broker::run(config).await
        }
        Command::ExportSite { peer_dir, out } => export_site(peer_dir, out),
        Command::ImportSite { peer_dir, bundle } => import_site(peer_dir, bundle),
    }
}

async fn run(peer_dir: std::path::PathBuf, listen_port: Option<u16>, web_addr: Option<String>) -> Result<()> {
    let mut config = PeerConfig::load(&peer_dir).context("loading goop.json")?;
    if let Some(port) = listen_port {
        config.p2p.listen_port = port;
    }
    if let Some(addr) = web_addr {
        config.viewer.addr = addr;
    }

    let peer = goop2_peer::Peer::start(config).await?;
    tracing::info!(self_id = %peer.self_id(), "goop2 peer started");
    peer.serve_web().await
}

/// Copy the peer's `site/` tree (including `lua/` and `.state/`, which the
/// runtime's content store deliberately never serves) into a standalone
/// bundle directory.
fn export_site(peer_dir: std::path::PathBuf, out: std::path::PathBuf) -> Result<()> {
    let config = PeerConfig::load(&peer_dir)?;
    let site_dir = config.site_dir();
    std::fs::create_dir_all(&out)?;
    copy_dir_recursive(&site_dir, &out)?;
    tracing::info!(from = %site_dir.display(), to = %out.display(), "exported site bundle");
    Ok(())
}

fn import_site(peer_dir: std::path::PathBuf, bundle: std::path::PathBuf) -> Result<()> {
    let config = PeerConfig::load(&peer_dir)?;
    let site_dir = config.site_dir();
    std::fs::create_dir_all(&site_dir)?;
    copy_dir_recursive(&bundle, &site_dir)?;
    tracing::info!(from = %bundle.display(), to = %site_dir.display(), "imported site bundle");
    Ok(())
}

fn copy_dir_recursive(from: &std::path::Path, to: &std::path::Path) -> Result<()> {
    for entry in std::fs::read_dir(from).with_context(|| format!("reading {}", from.display()))? {
        let entry = entry?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            std::fs::create_dir_all(&dst)?;
            copy_dir_recursive(&src, &dst)?;
        } else {
            std::fs::copy(&src, &dst).with_context(|| format!("copying {} to {}", src.display(), dst.display()))?;
        }
    }
    Ok(())
}
