//! WebRTC transport
//!
//! One `RTCPeerConnection` with a single ordered data channel. The offerer
//! opens the channel before creating its offer; the answerer adopts the one
//! announced by the remote side. Candidates are gathered fully before the
//! local description is handed out, so signaling never has to trickle.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::constants::DATA_CHANNEL_LABEL;
use crate::error::TransportError;
use crate::network::transport::{
    ChannelMessage, ConnectionFactory, ConnectionRole, PeerConnection, TransportEvent,
};
use crate::protocol::{IceCandidate, SdpKind, SessionDescription};

fn negotiation(err: webrtc::Error) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(negotiation)
}

fn from_rtc(desc: RTCSessionDescription) -> Option<SessionDescription> {
    match desc.sdp_type {
        RTCSdpType::Offer => Some(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Some(SessionDescription::answer(desc.sdp)),
        _ => None,
    }
}

/// Forward data channel callbacks as transport events
fn wire_channel(dc: &Arc<RTCDataChannel>, events: &mpsc::UnboundedSender<TransportEvent>) {
    let tx = events.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            tracing::debug!("Data channel open");
            let _ = tx.send(TransportEvent::Connected);
        })
    }));

    let tx = events.clone();
    dc.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::Disconnected("data channel closed".into()));
        })
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let message = if msg.is_string {
                ChannelMessage::Control(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                ChannelMessage::Audio(msg.data)
            };
            let _ = tx.send(TransportEvent::Message(message));
        })
    }));
}

/// `PeerConnection` over the webrtc crate
pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl WebRtcConnection {
    async fn open(
        pc: Arc<RTCPeerConnection>,
        role: ConnectionRole,
    ) -> Result<Self, TransportError> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::new(Mutex::new(None));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                tracing::debug!("Peer connection state: {}", state);
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    let _ = tx.send(TransportEvent::Disconnected(format!(
                        "peer connection {}",
                        state
                    )));
                }
            })
        }));

        match role {
            ConnectionRole::Offerer => {
                let init = RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                };
                let dc = pc
                    .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
                    .await
                    .map_err(negotiation)?;
                wire_channel(&dc, &events);
                *channel.lock() = Some(dc);
            }
            ConnectionRole::Answerer => {
                let slot = channel.clone();
                pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                    let slot = slot.clone();
                    let events = events.clone();
                    Box::pin(async move {
                        if dc.label() != DATA_CHANNEL_LABEL {
                            tracing::debug!("Ignoring data channel '{}'", dc.label());
                            return;
                        }
                        wire_channel(&dc, &events);
                        *slot.lock() = Some(dc);
                    })
                }));
            }
        }

        Ok(Self {
            pc,
            channel,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(negotiation)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            ..Default::default()
        };
        self.pc.add_ice_candidate(init).await.map_err(negotiation)
    }

    async fn wait_ice_gathering_complete(&self) {
        let mut gather = self.pc.gathering_complete_promise().await;
        let _ = gather.recv().await;
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.pc.local_description().await.and_then(from_rtc)
    }

    async fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        let dc = self
            .channel
            .lock()
            .clone()
            .ok_or(TransportError::ChannelNotOpen)?;
        if dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::ChannelNotOpen);
        }
        let sent = match message {
            ChannelMessage::Control(text) => dc.send_text(text).await,
            ChannelMessage::Audio(data) => dc.send(&data).await,
        };
        sent.map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::debug!("Error closing peer connection: {}", e);
        }
    }
}

/// Builds WebRTC connections with the configured ICE servers
pub struct WebRtcFactory {
    ice_servers: Vec<String>,
}

impl WebRtcFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn build_api() -> Result<API, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(negotiation)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(negotiation)?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcFactory {
    async fn create_connection(
        &self,
        role: ConnectionRole,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let api = Self::build_api()?;
        let config = RTCConfiguration {
            ice_servers: if self.ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: self.ice_servers.clone(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };
        let pc = api
            .new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(negotiation)?;

        let connection = WebRtcConnection::open(pc, role).await?;
        Ok(Arc::new(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_announces_data_channel() {
        let factory = WebRtcFactory::new(Vec::new());
        let connection = factory
            .create_connection(ConnectionRole::Offerer)
            .await
            .unwrap();

        let offer = connection.create_offer().await.unwrap();
        assert!(offer.is_offer());
        assert!(offer.sdp.contains("m=application"));

        connection.set_local_description(offer).await.unwrap();
        let local = connection.local_description().await.unwrap();
        assert!(local.is_offer());
        assert!(connection.take_events().is_some());
        assert!(connection.take_events().is_none());
        connection.close().await;
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let factory = WebRtcFactory::new(Vec::new());
        let connection = factory
            .create_connection(ConnectionRole::Answerer)
            .await
            .unwrap();
        let err = connection
            .send(ChannelMessage::Control("{}".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ChannelNotOpen));
        connection.close().await;
    }

    #[test]
    fn test_description_conversion() {
        let sdp = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n";
        let rtc = to_rtc(SessionDescription::answer(sdp)).unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Answer);
        assert_eq!(from_rtc(rtc), Some(SessionDescription::answer(sdp)));
    }
}
