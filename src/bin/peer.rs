//! Peer Application
//!
//! Joins a coordinator (given on the command line, configured, or found on
//! the LAN) and streams a test tone to it.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use soundsync_mesh::{
    audio::{DecodePipeline, EncodePipeline},
    config::AppConfig,
    constants::*,
    identity::PeerIdentity,
    network::{Discovery, HttpBootstrapClient, LanDiscovery, StaticDiscovery, WebRtcFactory},
    signaling::{HubEvent, SignalingHub},
};

/// Test tone frequency
const TONE_HZ: f32 = 440.0;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting soundsync peer");

    let config = AppConfig::load()?;
    let identity = PeerIdentity::local(config.peer.name.clone());
    tracing::info!("Local peer {}", identity);

    // Coordinator from args, then config, then discovery
    let address = std::env::args()
        .nth(1)
        .or_else(|| config.signaling.coordinator_address.clone());
    let discovery: Arc<dyn Discovery> = match address {
        Some(_) => Arc::new(StaticDiscovery::default()),
        None => Arc::new(LanDiscovery::new(config.signaling.discovery_port)),
    };

    let hub = SignalingHub::new(
        identity,
        config.signaling.clone(),
        Arc::new(WebRtcFactory::new(config.signaling.ice_servers.clone())),
        Arc::new(HttpBootstrapClient::new(config.signaling.connect_timeout())?),
        discovery,
    );
    let mut events = hub.subscribe();

    let coordinator = hub.connect_to_coordinator(address.as_deref()).await?;
    tracing::info!("Joined the mesh through {}", coordinator.identity());

    let (tone_tx, tone_rx) = mpsc::channel(PIPELINE_QUEUE_CAPACITY);
    let encoder = EncodePipeline::from_config(&config.audio, config.audio.working_sample_rate)?;
    let stream = encoder.stream_to_peer(coordinator.clone(), tone_rx);
    tokio::spawn(generate_tone(
        tone_tx,
        config.audio.working_sample_rate,
        config.audio.channels,
        config.audio.chunk_duration_ms,
    ));

    let (frames_tx, mut frames_rx) = mpsc::channel(PIPELINE_QUEUE_CAPACITY * 4);
    tokio::spawn(async move {
        let mut received = 0u64;
        while frames_rx.recv().await.is_some() {
            received += 1;
            if received % 500 == 0 {
                tracing::info!("{} audio frames received from members", received);
            }
        }
    });

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(HubEvent::PeerConnected(peer)) => {
                    tracing::info!("Linked with {}", peer);
                    if let Some(link) = hub.registry().get(&peer.uuid) {
                        DecodePipeline::from_config(&config.audio, config.audio.working_sample_rate)?
                            .attach_to_peer(&link, frames_tx.clone());
                    }
                }
                Ok(HubEvent::PeerDisconnected { uuid, reason }) => {
                    tracing::info!("Lost {} ({})", uuid, reason);
                    if hub.registry().coordinator().is_none() {
                        tracing::warn!("Coordinator is gone");
                        break;
                    }
                }
                Ok(HubEvent::ConnectionFailed { uuid, error }) => {
                    tracing::warn!("Link to {} failed: {}", uuid, error);
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

    stream.abort();
    coordinator.close("shutting down").await;
    Ok(())
}

/// Feed a sine wave into `tx` in real time, one chunk per tick
async fn generate_tone(tx: mpsc::Sender<Vec<f32>>, sample_rate: u32, channels: u16, chunk_ms: u32) {
    let frames = (sample_rate * chunk_ms / 1000) as usize;
    let step = 2.0 * std::f32::consts::PI * TONE_HZ / sample_rate as f32;
    let mut phase = 0.0f32;
    let mut ticker = tokio::time::interval(Duration::from_millis(chunk_ms as u64));

    loop {
        ticker.tick().await;
        let mut block = Vec::with_capacity(frames * channels as usize);
        for _ in 0..frames {
            let sample = phase.sin() * 0.2;
            block.extend(std::iter::repeat(sample).take(channels as usize));
            phase = (phase + step) % (2.0 * std::f32::consts::PI);
        }
        if tx.send(block).await.is_err() {
            break;
        }
    }
}
