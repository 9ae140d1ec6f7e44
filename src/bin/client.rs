//! XP Tunnel client
//!
//! Connects to the server over the configured transport, wraps the
//! connection in the encrypted tunnel and serves a local SOCKS5 proxy.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use xp_tunnel::config::{example_config, Config};
use xp_tunnel::obfuscation::ObfuscationConfig;
use xp_tunnel::proxy::Socks5Server;
use xp_tunnel::tunnel::Tunnel;
use xp_tunnel::{crypto, transport, uri};

/// XP Tunnel client - anti-DPI, stealth, fast
#[derive(Parser, Debug)]
#[command(name = "xp-client")]
#[command(about = "XP Tunnel client - censorship-circumventing SOCKS5 proxy")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, default_value = "config.yaml")]
    config: String,

    /// Share link (xp://...) instead of a config file
    #[arg(long)]
    uri: Option<String>,

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
        println!("{}", example_config("client"));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&args.log_level))
        .init();

    let config = match &args.uri {
        Some(link) => uri::parse_share_link(link).context("failed to parse share link")?,
        None => Config::load(&args.config).with_context(|| {
            format!(
                "failed to load {} (run with --genconfig for an example, or pass --uri)",
                args.config
            )
        })?,
    };

    if config.client.server_addr.is_empty() {
        return Err(anyhow!("no server_addr in [client] configuration"));
    }
    let key = config.client.key_bytes().context("invalid client key")?;

    info!("XP Tunnel client v{}", xp_tunnel::VERSION);
    info!("server: {}", config.client.server_addr);
    info!("transport: {}", config.transport.mode);
    info!(
        "SNI: {} | fragment: {} | padding: {} | timing jitter: {}",
        config.client.fake_sni,
        config.client.fragment,
        config.client.padding,
        config.client.timing_jitter
    );

    let transport = transport::from_config(&config).context("failed to build transport")?;

    info!("connecting to {}...", config.client.server_addr);
    let conn = transport
        .dial(&config.client.server_addr)
        .await
        .context("failed to connect to server")?;
    info!("connected to server");

    let obfs = ObfuscationConfig::from_flags(
        config.client.fragment,
        config.client.padding,
        config.client.timing_jitter,
    );
    let tunnel = Arc::new(Tunnel::new(conn, &key, obfs).context("failed to create tunnel")?);

    let socks5 = Socks5Server::bind(&config.client.socks_addr)
        .await
        .context("failed to bind SOCKS5 listener")?;
    socks5.set_tunnel(Arc::clone(&tunnel)).await;

    info!("SOCKS5 proxy ready on {}", config.client.socks_addr);
    info!("point your browser or apps at socks5://{}", config.client.socks_addr);

    tokio::select! {
        result = socks5.run() => {
            if let Err(e) = result {
                error!("SOCKS5 server error: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down...");
            tunnel.close().await;
        }
    }

    Ok(())
}
