use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parley_core::config::Config;
use parley_core::media::rtc::RtcLinkFactory;
use parley_core::media::{LocalMedia, SyntheticCapture};
use parley_core::signaling::ws::WsRelay;
use parley_core::{Peer, PeerEvent};

#[derive(Parser, Debug)]
#[command(name = "parley")]
struct Cli {
    /// Identity to register under. Must be unique among registered peers;
    /// a random one is generated when omitted.
    #[arg(long, env = "PARLEY_IDENTITY")]
    identity: Option<String>,

    /// Call this identity as soon as registration completes.
    #[arg(long)]
    call: Option<String>,

    #[arg(long, env = "PARLEY_RELAY_URL")]
    relay_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(url) = cli.relay_url {
        config.relay_url = url;
    }
    let identity = cli
        .identity
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // Local media is acquired once, eagerly, before any call exists. A
    // failure is reported here and never retried; calls then negotiate
    // without local tracks.
    let media = Arc::new(LocalMedia::new());
    if let Err(err) = media.acquire(&SyntheticCapture) {
        warn!(error = %err, "local media unavailable; calls will carry no local tracks");
    }

    let relay = WsRelay::connect(&config.relay_url)
        .await
        .context("connecting to signaling relay")?;
    let links = Arc::new(RtcLinkFactory::new(config.ice_servers.clone()));
    let peer = Peer::register(&identity, relay, links, media)
        .await
        .context("registering identity")?;
    info!(identity = peer.identity(), "registered with relay");

    let mut events = peer.events().await?;
    if let Some(remote) = cli.call {
        info!(to = %remote, "calling");
        peer.start_call(&remote)?;
    }

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(PeerEvent::IncomingCall { from }) => {
                        info!(from = %from, "incoming call; answering");
                    }
                    Some(PeerEvent::StateChanged(state)) => {
                        info!(state = %state, "call state");
                    }
                    Some(PeerEvent::RemoteTrack(track)) => {
                        info!(id = %track.id, kind = ?track.kind, "remote track");
                    }
                    Some(PeerEvent::CallEnded { by }) => {
                        info!(by = %by, "call ended by partner");
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("hanging up");
                let _ = peer.hang_up();
                // Let the hang-up frame leave the socket before exiting.
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                break;
            }
        }
    }
    Ok(())
}
