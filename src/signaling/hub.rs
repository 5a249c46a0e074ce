//! Signaling hub
//!
//! Owns the peer registry and runs the mesh protocol:
//!
//! - the coordinator accepts offers over HTTP bootstrap and relays
//!   `peerConnectionInfo` between members
//! - members join through the coordinator and open links to each other with
//!   relayed offers
//! - the coordinator keeps everyone informed with `peerInfo` and
//!   `peerDisconnected`
//!
//! Observers follow along through [`SignalingHub::subscribe`].

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::config::SignalingConfig;
use crate::constants::PLACEHOLDER_COORDINATOR_UUID;
use crate::error::{ConnectionError, Error, Result, SignalingError, TransportError};
use crate::identity::PeerIdentity;
use crate::network::bootstrap::BootstrapClient;
use crate::network::discovery::{Discovery, ServiceAddress};
use crate::network::transport::{
    ChannelMessage, ConnectionFactory, ConnectionRole, PeerConnection, TransportEvent,
};
use crate::peer::{ConnectionState, Delivery, Direction, Peer, TransportStatus};
use crate::protocol::{ConnectRequest, ControllerMessage, IceCandidate, SessionDescription};
use crate::signaling::registry::PeerRegistry;

/// Capacity of the observer channel
const EVENT_CAPACITY: usize = 256;

/// Something observers of the mesh may care about
#[derive(Debug, Clone)]
pub enum HubEvent {
    PeerConnected(PeerIdentity),
    PeerDisconnected { uuid: String, reason: String },
    ConnectionFailed { uuid: String, error: String },
    /// A controller message arrived from `from`
    ControllerMessage {
        from: String,
        message: ControllerMessage,
    },
}

/// Per-peer outcome of a broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    /// Peers still negotiating; the message goes out once they connect
    pub queued: Vec<String>,
    /// `(uuid, error)` for every send that failed
    pub failed: Vec<(String, String)>,
}

impl BroadcastReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Hook run after a peer disconnects
///
/// Called inline on the hub's event path, so implementations must return
/// quickly and spawn anything slow.
pub trait ReconnectHandler: Send + Sync {
    fn on_disconnect(&self, peer: &PeerIdentity, reason: &str);
}

/// Default handler: log and move on
pub struct LogOnly;

impl ReconnectHandler for LogOnly {
    fn on_disconnect(&self, peer: &PeerIdentity, reason: &str) {
        tracing::info!("Not reconnecting to {} ({})", peer, reason);
    }
}

/// Registry owner and protocol driver for one local peer
pub struct SignalingHub {
    local: Arc<Peer>,
    config: SignalingConfig,
    registry: PeerRegistry,
    factory: Arc<dyn ConnectionFactory>,
    bootstrap: Arc<dyn BootstrapClient>,
    discovery: Arc<dyn Discovery>,
    events: broadcast::Sender<HubEvent>,
    reconnect: RwLock<Arc<dyn ReconnectHandler>>,
    /// Identities announced by the coordinator, for naming relayed peers
    known: DashMap<String, PeerIdentity>,
}

impl SignalingHub {
    pub fn new(
        identity: PeerIdentity,
        config: SignalingConfig,
        factory: Arc<dyn ConnectionFactory>,
        bootstrap: Arc<dyn BootstrapClient>,
        discovery: Arc<dyn Discovery>,
    ) -> Arc<Self> {
        let local = Peer::new(identity);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            registry: PeerRegistry::new(local.clone()),
            local,
            config,
            factory,
            bootstrap,
            discovery,
            events,
            reconnect: RwLock::new(Arc::new(LogOnly)),
            known: DashMap::new(),
        })
    }

    pub fn local_identity(&self) -> PeerIdentity {
        self.local.identity()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.events.subscribe()
    }

    pub fn set_reconnect_handler(&self, handler: Arc<dyn ReconnectHandler>) {
        *self.reconnect.write() = handler;
    }

    fn emit(&self, event: HubEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Make the local peer the coordinator and advertise it
    ///
    /// Repeating the call is a no-op. Declaring while attached to another
    /// coordinator is a configuration error.
    pub async fn register_as_coordinator(&self) -> Result<()> {
        let local_uuid = self.local.uuid();
        if let Err(current) = self.registry.claim_coordinator(&local_uuid) {
            if current == local_uuid {
                return Ok(());
            }
            return Err(Error::Config(format!(
                "already attached to coordinator {}",
                current
            )));
        }
        self.local.set_coordinator(true);
        tracing::info!("{} is the coordinator", self.local.identity());

        if let Err(e) = self.discovery.advertise(self.config.http_port).await {
            tracing::warn!("Failed to advertise coordinator: {}", e);
        }
        Ok(())
    }

    /// Answer an offer that arrived over HTTP bootstrap
    ///
    /// A second offer from a uuid that is still connected replaces the first
    /// link. The answer is returned once ICE gathering completes; the move to
    /// `Connected` finishes in the background.
    pub async fn accept_inbound_offer(
        self: &Arc<Self>,
        remote_name: &str,
        remote_uuid: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        if !self.local.is_coordinator() {
            return Err(SignalingError::NotCoordinator.into());
        }
        if remote_uuid == self.local.uuid() {
            return Err(SignalingError::SelfConnection.into());
        }
        if remote_uuid.is_empty() {
            return Err(SignalingError::Malformed("empty peer uuid".into()).into());
        }
        if !offer.is_offer() {
            return Err(SignalingError::Malformed("expected an offer".into()).into());
        }

        tracing::info!("Inbound offer from {} ({})", remote_name, remote_uuid);
        self.answer_offer(PeerIdentity::remote(remote_uuid, remote_name), offer)
            .await
    }

    async fn answer_offer(
        self: &Arc<Self>,
        identity: PeerIdentity,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        let peer = Peer::new(identity);
        if let Some(previous) = self.registry.insert(peer.clone()) {
            tracing::info!("Replacing link to {}", previous.identity());
            previous.close("replaced by a newer offer").await;
        }

        match self.negotiate_inbound(&peer, offer).await {
            Ok(answer) => {
                self.spawn_connect_wait(peer);
                Ok(answer)
            }
            Err(e) => {
                self.fail_peer(&peer, &e).await;
                Err(e)
            }
        }
    }

    async fn negotiate_inbound(
        self: &Arc<Self>,
        peer: &Arc<Peer>,
        offer: SessionDescription,
    ) -> Result<SessionDescription> {
        peer.begin(Direction::Inbound)?;
        let connection = self
            .factory
            .create_connection(ConnectionRole::Answerer)
            .await?;
        peer.attach(connection.clone());
        self.spawn_event_pump(peer, &connection);

        peer.apply_remote_description(offer).await?;
        peer.transition(ConnectionState::IceGathering)?;
        let answer = connection.create_answer().await?;
        connection.set_local_description(answer).await?;
        self.gather(&connection).await?;
        peer.transition(ConnectionState::IceComplete)?;

        let answer = Self::gathered_description(&connection).await?;
        peer.transition(ConnectionState::AnswerSent)?;
        Ok(answer)
    }

    /// Create the offer for an outbound attempt, ready to send
    async fn prepare_offer(self: &Arc<Self>, peer: &Arc<Peer>) -> Result<SessionDescription> {
        let connection = self
            .factory
            .create_connection(ConnectionRole::Offerer)
            .await?;
        peer.attach(connection.clone());
        self.spawn_event_pump(peer, &connection);

        let offer = connection.create_offer().await?;
        connection.set_local_description(offer).await?;
        peer.transition(ConnectionState::OfferCreated)?;
        peer.transition(ConnectionState::IceGathering)?;
        self.gather(&connection).await?;
        peer.transition(ConnectionState::IceComplete)?;
        Self::gathered_description(&connection).await
    }

    async fn gather(&self, connection: &Arc<dyn PeerConnection>) -> Result<()> {
        let limit = self.config.ice_gathering_timeout();
        tokio::time::timeout(limit, connection.wait_ice_gathering_complete())
            .await
            .map_err(|_| ConnectionError::IceGatheringTimeout(limit))?;
        Ok(())
    }

    async fn gathered_description(
        connection: &Arc<dyn PeerConnection>,
    ) -> Result<SessionDescription> {
        connection.local_description().await.ok_or_else(|| {
            TransportError::Negotiation("no local description after gathering".into()).into()
        })
    }

    /// Join the mesh through a coordinator
    ///
    /// Without an address the coordinator is found through discovery.
    pub async fn connect_to_coordinator(
        self: &Arc<Self>,
        address: Option<&str>,
    ) -> Result<Arc<Peer>> {
        if self.local.is_coordinator() {
            return Err(Error::Config(
                "the local peer is the coordinator and cannot join another".into(),
            ));
        }
        let address = match address {
            Some(address) => address.to_string(),
            None => self.discover().await?.to_string(),
        };

        if let Err(current) = self.registry.claim_coordinator(PLACEHOLDER_COORDINATOR_UUID) {
            return Err(Error::Config(format!(
                "already attached to coordinator {}",
                current
            )));
        }
        let peer = Peer::new(
            PeerIdentity::remote(PLACEHOLDER_COORDINATOR_UUID, "coordinator").with_coordinator(true),
        );
        self.registry.insert(peer.clone());

        match self.join_through(&peer, &address).await {
            Ok(()) => Ok(peer),
            Err(e) => {
                self.fail_peer(&peer, &e).await;
                Err(e)
            }
        }
    }

    async fn discover(&self) -> Result<ServiceAddress> {
        let limit = self.config.discovery_timeout();
        tracing::info!("Looking for a coordinator (up to {:?})", limit);
        match tokio::time::timeout(limit, self.discovery.resolve()).await {
            Ok(Ok(Some(address))) => Ok(address),
            Ok(Ok(None)) | Err(_) => Err(Error::DiscoveryTimeout(limit)),
            Ok(Err(e)) => Err(e),
        }
    }

    async fn join_through(self: &Arc<Self>, peer: &Arc<Peer>, address: &str) -> Result<()> {
        peer.begin(Direction::Outbound)?;
        let offer = self.prepare_offer(peer).await?;
        let local = self.local.identity();
        let request = ConnectRequest {
            name: local.name,
            uuid: local.uuid.clone(),
            sdp: offer,
        };

        // The state must be past OfferSent before the answer can be applied
        peer.transition(ConnectionState::OfferSent)?;
        tracing::info!("Sending offer to coordinator at {}", address);
        let (answer, coordinator_uuid) = self
            .bootstrap
            .connect(address, &request)
            .await?
            .into_answer()?;
        if coordinator_uuid == local.uuid {
            return Err(SignalingError::SelfConnection.into());
        }

        if let Some(displaced) =
            self.registry
                .rekey(PLACEHOLDER_COORDINATOR_UUID, &coordinator_uuid, peer)
        {
            displaced.close("superseded by the coordinator link").await;
        }
        peer.apply_remote_description(answer).await?;
        self.finish_connect(peer).await
    }

    /// Fan `message` out to every remote peer not in `exclude`
    ///
    /// Never fails as a whole; per-peer failures land in the report.
    pub async fn broadcast(&self, message: &ControllerMessage, exclude: &[String]) -> BroadcastReport {
        let local_uuid = self.local.uuid();
        let mut targets = self.registry.remotes();
        if let Some(coordinator) = self.registry.coordinator_peer() {
            targets.push(coordinator);
        }

        let mut seen = HashSet::new();
        targets.retain(|peer| {
            let uuid = peer.uuid();
            uuid != local_uuid && !exclude.contains(&uuid) && seen.insert(uuid)
        });

        let sends = targets.iter().map(|peer| async move {
            (peer.uuid(), peer.send_controller(message).await)
        });

        let mut report = BroadcastReport::default();
        for (uuid, result) in join_all(sends).await {
            match result {
                Ok(Delivery::Sent) => report.delivered.push(uuid),
                Ok(Delivery::Queued) => report.queued.push(uuid),
                Err(e) => {
                    tracing::warn!("Broadcast of {} to {} failed: {}", message.type_name(), uuid, e);
                    report.failed.push((uuid, e.to_string()));
                }
            }
        }
        tracing::debug!(
            "Broadcast {}: {} sent, {} queued, {} failed",
            message.type_name(),
            report.delivered.len(),
            report.queued.len(),
            report.failed.len()
        );
        report
    }

    /// Send to a single peer; the local peer hands the message to observers
    pub async fn send_to(&self, uuid: &str, message: &ControllerMessage) -> Result<Delivery> {
        if uuid == self.local.uuid() {
            self.emit(HubEvent::ControllerMessage {
                from: uuid.to_string(),
                message: message.clone(),
            });
            return Ok(Delivery::Sent);
        }
        let peer = self
            .registry
            .get(uuid)
            .ok_or_else(|| ConnectionError::NotConnected(uuid.to_string()))?;
        peer.send_controller(message).await
    }

    /// The registered peer for `uuid`, or a fresh `New` one
    pub fn get_or_create_peer(&self, uuid: &str) -> Arc<Peer> {
        self.registry.get_or_insert_with(uuid, || {
            let name = self
                .known
                .get(uuid)
                .map(|identity| identity.name.clone())
                .unwrap_or_else(|| uuid.to_string());
            Peer::new(PeerIdentity::remote(uuid, name))
        })
    }

    /// Open a link to `uuid` with an offer relayed by the coordinator
    ///
    /// Concurrent calls for the same peer share one attempt.
    pub async fn connect_peer(self: &Arc<Self>, uuid: &str) -> Result<Arc<Peer>> {
        if uuid == self.local.uuid() {
            return Err(SignalingError::SelfConnection.into());
        }
        let coordinator = self
            .registry
            .coordinator_peer()
            .filter(|coordinator| !coordinator.is_local())
            .ok_or(SignalingError::NoRelay)?;

        let peer = self.get_or_create_peer(uuid);
        let _guard = peer.connect_guard().await;
        match peer.state() {
            ConnectionState::New => {}
            ConnectionState::Connected => return Ok(peer.clone()),
            ConnectionState::Disconnected => {
                return Err(ConnectionError::Closed(peer.last_error().unwrap_or_default()).into());
            }
            // Inbound negotiation from the other side is already running
            _ => {
                self.wait_settled(&peer).await?;
                return Ok(peer.clone());
            }
        }

        match self.relay_connect(&peer, &coordinator).await {
            Ok(()) => Ok(peer.clone()),
            Err(e) => {
                self.fail_peer(&peer, &e).await;
                Err(e)
            }
        }
    }

    async fn relay_connect(self: &Arc<Self>, peer: &Arc<Peer>, coordinator: &Arc<Peer>) -> Result<()> {
        peer.begin(Direction::Outbound)?;
        let offer = self.prepare_offer(peer).await?;
        peer.transition(ConnectionState::OfferSent)?;
        tracing::info!("Relaying offer to {} via {}", peer.identity(), coordinator.identity());
        coordinator
            .send_controller(&ControllerMessage::relay_offer(peer.uuid(), offer))
            .await?;
        self.finish_connect(peer).await
    }

    async fn wait_settled(&self, peer: &Arc<Peer>) -> Result<()> {
        let limit = self.config.connect_timeout();
        let mut state = peer.subscribe_state();
        let reached = *tokio::time::timeout(
            limit,
            state.wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Disconnected)),
        )
        .await
        .map_err(|_| ConnectionError::ConnectTimeout(limit))?
        .map_err(|_| ConnectionError::Closed("peer dropped".into()))?;

        if reached == ConnectionState::Disconnected {
            return Err(ConnectionError::Closed(peer.last_error().unwrap_or_default()).into());
        }
        Ok(())
    }

    fn spawn_connect_wait(self: &Arc<Self>, peer: Arc<Peer>) {
        let hub = self.clone();
        tokio::spawn(async move {
            if let Err(e) = hub.finish_connect(&peer).await {
                hub.fail_peer(&peer, &e).await;
            }
        });
    }

    /// Wait (bounded) for the transport, then enter `Connected`
    async fn finish_connect(self: &Arc<Self>, peer: &Arc<Peer>) -> Result<()> {
        peer.wait_connectable(self.config.connect_timeout()).await?;
        self.on_connected(peer).await
    }

    async fn on_connected(&self, peer: &Arc<Peer>) -> Result<()> {
        peer.mark_connected().await?;
        let identity = peer.identity();
        tracing::info!("Connected to {}", identity);
        self.emit(HubEvent::PeerConnected(identity));

        if self.local.is_coordinator() {
            self.introduce(peer).await;
        }
        Ok(())
    }

    /// Tell a newcomer who is here, and everyone else about the newcomer
    async fn introduce(&self, newcomer: &Arc<Peer>) {
        let mut members = vec![self.local.identity()];
        members.extend(
            self.registry
                .remotes()
                .into_iter()
                .filter(|p| !Arc::ptr_eq(p, newcomer) && p.state() == ConnectionState::Connected)
                .map(|p| p.identity()),
        );
        for member in members {
            if let Err(e) = newcomer
                .send_controller(&ControllerMessage::PeerInfo { peer: member })
                .await
            {
                tracing::warn!("Failed to introduce members to {}: {}", newcomer.identity(), e);
                break;
            }
        }

        let identity = newcomer.identity();
        let exclude = [identity.uuid.clone()];
        self.broadcast(&ControllerMessage::PeerInfo { peer: identity }, &exclude)
            .await;
    }

    /// Close, unregister and report a failed attempt
    async fn fail_peer(&self, peer: &Arc<Peer>, error: &Error) {
        let reason = error.to_string();
        tracing::warn!("Connection to {} failed: {}", peer.identity(), reason);
        peer.close(reason.clone()).await;
        if self.registry.unregister(peer) {
            self.emit(HubEvent::ConnectionFailed {
                uuid: peer.uuid(),
                error: reason,
            });
        }
    }

    /// Tear down a link that went away
    ///
    /// Only the registered instance is reported, so replaced links close
    /// silently.
    async fn handle_disconnect(&self, peer: &Arc<Peer>, reason: &str) {
        peer.close(reason).await;
        if !self.registry.unregister(peer) {
            return;
        }
        let identity = peer.identity();
        tracing::info!("Peer {} disconnected: {}", identity, reason);
        self.known.remove(&identity.uuid);

        let handler = self.reconnect.read().clone();
        handler.on_disconnect(&identity, reason);
        self.emit(HubEvent::PeerDisconnected {
            uuid: identity.uuid.clone(),
            reason: reason.to_string(),
        });

        if self.local.is_coordinator() {
            self.broadcast(
                &ControllerMessage::PeerDisconnected {
                    peer_uuid: identity.uuid,
                },
                &[],
            )
            .await;
        }
    }

    fn spawn_event_pump(self: &Arc<Self>, peer: &Arc<Peer>, connection: &Arc<dyn PeerConnection>) {
        let Some(mut events) = connection.take_events() else {
            tracing::warn!("Events of the link to {} already taken", peer.identity());
            return;
        };
        let hub = Arc::downgrade(self);
        let peer = peer.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                match event {
                    TransportEvent::Connected => peer.set_transport(TransportStatus::Up),
                    TransportEvent::Disconnected(reason) => {
                        peer.set_transport(TransportStatus::Down(reason.clone()));
                        hub.handle_disconnect(&peer, &reason).await;
                        break;
                    }
                    TransportEvent::Message(ChannelMessage::Control(text)) => {
                        hub.dispatch(&peer, &text).await;
                    }
                    TransportEvent::Message(ChannelMessage::Audio(record)) => {
                        peer.deliver_audio(record);
                    }
                }
            }
        });
    }

    /// Handle one controller message from `from`
    async fn dispatch(self: &Arc<Self>, from: &Arc<Peer>, text: &str) {
        let message = match ControllerMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Dropping message from {}: {}", from.identity(), e);
                return;
            }
        };
        let sender = from.uuid();
        tracing::debug!("{} from {}", message.type_name(), from.identity());

        match &message {
            ControllerMessage::PeerConnectionInfo {
                peer_uuid,
                offer,
                answer,
                ice_candidate,
            } => {
                if self.local.is_coordinator() && *peer_uuid != self.local.uuid() {
                    self.relay(&sender, peer_uuid, &message).await;
                } else {
                    // Relayed to us: `peer_uuid` names the origin
                    let origin = if self.local.is_coordinator() {
                        sender.clone()
                    } else {
                        peer_uuid.clone()
                    };
                    self.handle_signal(origin, offer.clone(), answer.clone(), ice_candidate.clone())
                        .await;
                }
            }
            ControllerMessage::PeerInfo { peer } => self.handle_peer_info(peer.clone()),
            ControllerMessage::PeerDisconnected { peer_uuid } => {
                if *peer_uuid != self.local.uuid() {
                    self.known.remove(peer_uuid);
                    if let Some(gone) = self.registry.get(peer_uuid) {
                        self.handle_disconnect(&gone, "left the mesh").await;
                    }
                }
            }
            ControllerMessage::Unknown => {
                tracing::debug!("Ignoring unknown controller message from {}", from.identity());
            }
        }

        self.emit(HubEvent::ControllerMessage {
            from: sender,
            message,
        });
    }

    /// Forward signaling from `sender` to `target`, naming the sender
    async fn relay(&self, sender: &str, target: &str, message: &ControllerMessage) {
        let ControllerMessage::PeerConnectionInfo {
            offer,
            answer,
            ice_candidate,
            ..
        } = message.clone()
        else {
            return;
        };
        let Some(target_peer) = self.registry.get(target) else {
            tracing::warn!("Cannot relay to unknown peer {}", target);
            return;
        };

        let forwarded = ControllerMessage::PeerConnectionInfo {
            peer_uuid: sender.to_string(),
            offer,
            answer,
            ice_candidate,
        };
        if let Err(e) = target_peer.send_controller(&forwarded).await {
            tracing::warn!("Relay from {} to {} failed: {}", sender, target, e);
        }
    }

    async fn handle_signal(
        self: &Arc<Self>,
        origin: String,
        offer: Option<SessionDescription>,
        answer: Option<SessionDescription>,
        candidate: Option<IceCandidate>,
    ) {
        if let Some(offer) = offer {
            let name = self
                .known
                .get(&origin)
                .map(|identity| identity.name.clone())
                .unwrap_or_else(|| origin.clone());
            let answer = match self
                .answer_offer(PeerIdentity::remote(origin.clone(), name), offer)
                .await
            {
                Ok(answer) => answer,
                Err(e) => {
                    tracing::warn!("Could not answer relayed offer from {}: {}", origin, e);
                    return;
                }
            };
            let reply = ControllerMessage::relay_answer(origin.clone(), answer);
            let sent = match self.registry.coordinator_peer() {
                Some(coordinator) => coordinator.send_controller(&reply).await.map(|_| ()),
                None => Err(SignalingError::NoRelay.into()),
            };
            if let Err(e) = sent {
                tracing::warn!("Could not return answer to {}: {}", origin, e);
                if let Some(peer) = self.registry.get(&origin) {
                    self.fail_peer(&peer, &e).await;
                }
            }
        }

        if let Some(answer) = answer {
            let Some(peer) = self.registry.get(&origin) else {
                tracing::warn!("Answer from {} matches no pending link", origin);
                return;
            };
            if let Err(e) = peer.apply_remote_description(answer).await {
                self.fail_peer(&peer, &e).await;
                return;
            }
        }

        if let Some(candidate) = candidate {
            match self.registry.get(&origin) {
                Some(peer) => {
                    if let Err(e) = peer.add_remote_candidate(candidate).await {
                        tracing::warn!("Bad ICE candidate from {}: {}", origin, e);
                    }
                }
                None => tracing::debug!("ICE candidate for unknown peer {}", origin),
            }
        }
    }

    fn handle_peer_info(self: &Arc<Self>, identity: PeerIdentity) {
        if identity.uuid == self.local.uuid() {
            return;
        }
        self.known.insert(identity.uuid.clone(), identity.clone());

        if let Some(existing) = self.registry.get(&identity.uuid) {
            existing.set_name(identity.name);
            return;
        }
        // The lower uuid offers, so two members never offer to each other
        if self.config.auto_connect_peers
            && !self.local.is_coordinator()
            && self.local.uuid() < identity.uuid
        {
            let hub = self.clone();
            tokio::spawn(async move {
                if let Err(e) = hub.connect_peer(&identity.uuid).await {
                    tracing::warn!("Auto-connect to {} failed: {}", identity, e);
                }
            });
        }
    }
}
