//! weft daemon binary
//!
//! Loads configuration, wires the platform drivers, and runs a mesh node
//! until interrupted.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, EnvFilter};
use weft::negotiate::{LocalCidrDetector, NegotiateError};
use weft::node::{Drivers, Node, TunnelKey};
use weft::Config;

/// weft mesh daemon
#[derive(Parser, Debug)]
#[command(name = "weftd", version, about)]
struct Args {
    /// Path to configuration file (overrides default search paths)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Tunnel private key (base64)
    #[arg(long, value_name = "KEY", env = "WEFT_TUNNEL_PRIVATE_KEY")]
    tunnel_private_key: String,

    /// Tunnel public key (base64)
    #[arg(long, value_name = "KEY", env = "WEFT_TUNNEL_PUBLIC_KEY")]
    tunnel_public_key: String,
}

/// Data channels require an external WebRTC implementation; the daemon
/// refuses ICE peerings until one is wired in.
struct NoDataChannels;

#[async_trait::async_trait]
impl weft::negotiate::DataChannelRpc for NoDataChannels {
    async fn negotiate(
        &self,
        server: &str,
        peer_id: &str,
        _tunnel_port: u16,
    ) -> Result<Box<dyn weft::negotiate::DataChannelSession>, NegotiateError> {
        Err(NegotiateError::Negotiation {
            peer: peer_id.to_string(),
            server: server.to_string(),
            reason: "no data-channel implementation configured".to_string(),
        })
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    info!("weft starting");

    // Load configuration
    let (config, loaded_paths) = if let Some(config_path) = &args.config {
        match Config::load_file(config_path) {
            Ok(config) => (config, vec![config_path.clone()]),
            Err(e) => {
                error!(
                    "failed to load configuration from {}: {}",
                    config_path.display(),
                    e
                );
                std::process::exit(1);
            }
        }
    } else {
        match Config::load() {
            Ok(result) => result,
            Err(e) => {
                error!("failed to load configuration: {}", e);
                std::process::exit(1);
            }
        }
    };
    if loaded_paths.is_empty() {
        info!("no config files found, using defaults");
    } else {
        for path in &loaded_paths {
            info!("loaded config from {}", path.display());
        }
    }

    let key = TunnelKey {
        private_key: args.tunnel_private_key,
        public_key: args.tunnel_public_key,
    };

    #[cfg(target_os = "linux")]
    let detector: Arc<dyn LocalCidrDetector> = Arc::new(weft::negotiate::NetlinkDetector {
        skip_interfaces: vec!["weft0".to_string()],
    });
    #[cfg(not(target_os = "linux"))]
    let detector: Arc<dyn LocalCidrDetector> = Arc::new(weft::negotiate::StaticCidrs(Vec::new()));

    let mut drivers = Drivers::in_memory(Arc::new(NoDataChannels));
    drivers.detector = detector;

    let node = match Node::connect(config, key, drivers).await {
        Ok(node) => node,
        Err(e) => {
            error!("failed to start node: {}", e);
            std::process::exit(1);
        }
    };
    info!(node = %node.id(), "node running, press ctrl-c to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to wait for interrupt: {}", e);
    }
    info!("interrupt received, shutting down");
    if let Err(e) = node.shutdown().await {
        error!("shutdown failed: {}", e);
        std::process::exit(1);
    }
    info!("goodbye");
}
