//! `flared`, the Flare gateway daemon.
//!
//! Serves the WebSocket attachment endpoint backed by the in-memory dev
//! collaborators. `--demo-tokens N` creates a session at startup and prints
//! N ready-to-use attachment URLs, which is all it takes to try the wire
//! protocol with any WebSocket client.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flare_core::ParticipantProfile;
use flare_gateway::{GatewayConfig, GatewayServer, MemorySessionStore, StaticTokenVerifier};

/// Palette for demo participant avatars.
const DEMO_COLORS: [&str; 5] = ["#e4572e", "#17bebb", "#ffc914", "#2e282a", "#76b041"];

#[derive(Debug, Parser)]
#[command(name = "flared", about = "Flare location-sharing gateway daemon")]
struct Args {
    /// Path to the gateway configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<String>,

    /// Create a demo session and print this many attachment URLs.
    #[arg(long, default_value_t = 0)]
    demo_tokens: usize,

    /// Demo session lifetime in seconds.
    #[arg(long, default_value_t = 3600)]
    demo_ttl_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,flare_gateway=debug")),
        )
        .init();

    let args = Args::parse();
    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.gateway.listen_addr = listen;
    }

    let store = Arc::new(MemorySessionStore::new());
    let verifier = Arc::new(StaticTokenVerifier::new());

    let server = GatewayServer::start(config, store.clone(), verifier.clone()).await?;

    if args.demo_tokens > 0 {
        let session = store.create_session(
            Some("demo".into()),
            Duration::from_secs(args.demo_ttl_secs),
        );
        info!(%session, tokens = args.demo_tokens, "Demo session created");
        for n in 1..=args.demo_tokens {
            let profile = ParticipantProfile::new(
                format!("Guest {n}"),
                DEMO_COLORS[n.checked_rem(DEMO_COLORS.len()).unwrap_or_default()],
            )?;
            let token = verifier.issue(session, format!("guest-{n}").into(), profile);
            println!("ws://{}/attach?token={token}", server.local_addr());
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received");
    server.shutdown().await;
    Ok(())
}
