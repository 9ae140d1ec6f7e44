//! XP Tunnel server
//!
//! Accepts tunnel connections over the configured transport, dials the
//! requested targets and splices. Unauthenticated peers are deflected to
//! the cover site when probe resistance is on.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use xp_tunnel::config::{example_config, Config};
use xp_tunnel::obfuscation::ObfuscationConfig;
use xp_tunnel::server::{handle_connection, ServerSettings};
use xp_tunnel::{crypto, transport};

/// XP Tunnel server - anti-DPI, anti-probe, stealth
#[derive(Parser, Debug)]
#[command(name = "xp-server")]
#[command(about = "XP Tunnel server - encrypted tunnel egress")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, default_value = "config.yaml")]
    config: String,

    /// Generate a new key and exit
    #[arg(long)]
    genkey: bool,

    /// Print an example configuration and exit
    #[arg(long)]
    genconfig: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.genkey {
        println!("{}", crypto::key_to_base64(&crypto::generate_key()));
        return Ok(());
    }
    if args.genconfig {
        println!("{}", example_config("server"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let config = Config::load(&args.config).with_context(|| {
        format!(
            "failed to load {} (run with --genconfig for an example)",
            args.config
        )
    })?;

    let key = config.server.key_bytes().context("invalid server key")?;

    info!("XP Tunnel server v{}", xp_tunnel::VERSION);
    info!("listen: {}", config.server.listen);
    info!("transport: {}", config.transport.mode);
    info!(
        "cover site: {} | probe resist: {} | padding: {} | timing jitter: {}",
        config.server.fake_site,
        config.server.probe_resist,
        config.server.padding,
        config.server.timing_jitter
    );

    let settings = Arc::new(ServerSettings {
        key,
        obfs: ObfuscationConfig::from_flags(
            config.server.fragment,
            config.server.padding,
            config.server.timing_jitter,
        ),
        probe_resist: config.server.probe_resist,
        fallback_site: config.server.fallback().to_string(),
    });

    let transport = transport::from_config(&config).context("failed to build transport")?;
    let mut listener = transport
        .listen(&config.server.listen)
        .await
        .context("failed to start listener")?;

    info!("waiting for connections on {}", listener.local_addr());

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                // One bad client must not kill the accept loop
                let conn = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("accept error: {}", e);
                        continue;
                    }
                };
                let peer = conn.remote_addr();
                info!("connection from {}", peer);

                let settings = Arc::clone(&settings);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(conn, peer.clone(), settings).await {
                        warn!("[{}] session error: {}", peer, e);
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down...");
                break;
            }
        }
    }

    Ok(())
}
