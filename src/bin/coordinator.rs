//! Coordinator Application
//!
//! Declares itself coordinator, serves HTTP bootstrap, advertises on the LAN
//! and decodes the audio every member streams to it.

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use soundsync_mesh::{
    audio::DecodePipeline,
    codec::{DecodedFrame, FrameEvent},
    config::AppConfig,
    constants::*,
    identity::PeerIdentity,
    network::{HttpBootstrapClient, LanDiscovery, WebRtcFactory},
    signaling::{http, HubEvent, SignalingHub},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting soundsync coordinator");

    let config = AppConfig::load()?;
    let identity = PeerIdentity::local(config.peer.name.clone());
    tracing::info!("Local peer {}", identity);

    let hub = SignalingHub::new(
        identity,
        config.signaling.clone(),
        Arc::new(WebRtcFactory::new(config.signaling.ice_servers.clone())),
        Arc::new(HttpBootstrapClient::new(config.signaling.connect_timeout())?),
        Arc::new(LanDiscovery::new(config.signaling.discovery_port)),
    );
    hub.register_as_coordinator().await?;

    let addr: SocketAddr = format!(
        "{}:{}",
        config.signaling.bind_address, config.signaling.http_port
    )
    .parse()?;
    let server = tokio::spawn(http::serve(hub.clone(), addr));

    tracing::info!(
        "Members can join at http://{}{}",
        addr,
        CONNECT_ROUTE
    );

    // Audio from every member ends up here; there is no device output, so
    // frames are only counted
    let (frames_tx, mut frames_rx) = mpsc::channel::<DecodedFrame>(PIPELINE_QUEUE_CAPACITY * 4);
    let (loss_tx, mut loss_rx) = mpsc::unbounded_channel::<FrameEvent>();
    tokio::spawn(async move {
        let mut received = 0u64;
        while let Some(frame) = frames_rx.recv().await {
            received += 1;
            if received % 500 == 0 {
                tracing::info!("{} audio frames received (last seq {})", received, frame.sequence);
            }
        }
    });
    tokio::spawn(async move {
        while let Some(event) = loss_rx.recv().await {
            tracing::debug!("Audio: {:?}", event);
        }
    });

    let mut events = hub.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(HubEvent::PeerConnected(peer)) => {
                    tracing::info!("Member joined: {}", peer);
                    if let Some(link) = hub.registry().get(&peer.uuid) {
                        let pipeline = DecodePipeline::from_config(&config.audio, config.audio.working_sample_rate)?
                            .with_events(loss_tx.clone());
                        pipeline.attach_to_peer(&link, frames_tx.clone());
                    }
                }
                Ok(HubEvent::PeerDisconnected { uuid, reason }) => {
                    tracing::info!("Member left: {} ({})", uuid, reason);
                }
                Ok(HubEvent::ConnectionFailed { uuid, error }) => {
                    tracing::warn!("Member {} failed to connect: {}", uuid, error);
                }
                Ok(HubEvent::ControllerMessage { from, message }) => {
                    tracing::debug!("{} from {}", message.type_name(), from);
                }
                Err(e) => tracing::warn!("Event stream: {}", e),
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    server.abort();
    Ok(())
}
