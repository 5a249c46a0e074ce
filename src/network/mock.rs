//! In-memory transport for tests and simulation
//!
//! `MockNetwork` links connections the way WebRTC would, but through
//! process memory: an offer is `mock:<id>`, applying it on the other side
//! pairs the two connections, and both report `Connected` once the offerer
//! has applied the answer. Faults are injected per owner name.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{SignalingError, TransportError};
use crate::network::bootstrap::BootstrapClient;
use crate::network::transport::{
    ChannelMessage, ConnectionFactory, ConnectionRole, PeerConnection, TransportEvent,
};
use crate::protocol::{ConnectRequest, ConnectResponse, IceCandidate, SdpKind, SessionDescription};
use crate::signaling::SignalingHub;

const SDP_PREFIX: &str = "mock:";

#[derive(Default)]
struct NetworkState {
    connections: HashMap<u64, Weak<MockConnection>>,
    /// Owners whose connections refuse incoming messages
    unreachable: HashSet<String>,
    /// Owners whose ICE gathering never completes
    stalled: HashSet<String>,
}

/// Shared medium for mock connections
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
    next_id: Arc<AtomicU64>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose connections belong to `owner`
    pub fn factory(&self, owner: impl Into<String>) -> Arc<MockConnectionFactory> {
        Arc::new(MockConnectionFactory {
            network: self.clone(),
            owner: owner.into(),
        })
    }

    /// Make sends towards `owner`'s connections fail
    pub fn set_unreachable(&self, owner: &str, unreachable: bool) {
        let mut state = self.state.lock();
        if unreachable {
            state.unreachable.insert(owner.to_string());
        } else {
            state.unreachable.remove(owner);
        }
    }

    /// Make ICE gathering hang for connections created by `owner`
    pub fn stall_ice_gathering(&self, owner: &str) {
        self.state.lock().stalled.insert(owner.to_string());
    }

    fn register(&self, connection: &Arc<MockConnection>) {
        self.state
            .lock()
            .connections
            .insert(connection.id, Arc::downgrade(connection));
    }

    fn lookup(&self, id: u64) -> Option<Arc<MockConnection>> {
        self.state.lock().connections.get(&id).and_then(Weak::upgrade)
    }

    fn is_unreachable(&self, owner: &str) -> bool {
        self.state.lock().unreachable.contains(owner)
    }

    fn is_stalled(&self, owner: &str) -> bool {
        self.state.lock().stalled.contains(owner)
    }
}

/// `ConnectionFactory` over a `MockNetwork`
pub struct MockConnectionFactory {
    network: MockNetwork,
    owner: String,
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn create_connection(
        &self,
        role: ConnectionRole,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(MockConnection {
            id: self.network.next_id.fetch_add(1, Ordering::SeqCst),
            owner: self.owner.clone(),
            role,
            network: self.network.clone(),
            local: Mutex::new(None),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
            events_rx: Mutex::new(Some(events_rx)),
        });
        self.network.register(&connection);
        Ok(connection)
    }
}

/// One end of an in-memory link
pub struct MockConnection {
    id: u64,
    owner: String,
    role: ConnectionRole,
    network: MockNetwork,
    local: Mutex<Option<SessionDescription>>,
    remote: Mutex<Option<u64>>,
    candidates: Mutex<Vec<IceCandidate>>,
    open: AtomicBool,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MockConnection {
    fn partner(&self) -> Option<Arc<MockConnection>> {
        let id = (*self.remote.lock())?;
        self.network.lookup(id)
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn mark_open(&self) {
        if !self.open.swap(true, Ordering::SeqCst) {
            self.emit(TransportEvent::Connected);
        }
    }

    fn shut(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open.store(false, Ordering::SeqCst);
            self.emit(TransportEvent::Disconnected(reason.to_string()));
        }
    }

    /// Candidates applied by the remote side
    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    fn parse_sdp(desc: &SessionDescription) -> Result<u64, TransportError> {
        desc.sdp
            .strip_prefix(SDP_PREFIX)
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| TransportError::Negotiation(format!("not a mock SDP: {}", desc.sdp)))
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if self.role != ConnectionRole::Offerer {
            return Err(TransportError::Negotiation("answerer cannot create an offer".into()));
        }
        Ok(SessionDescription::offer(format!("{}{}", SDP_PREFIX, self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.remote.lock().is_none() {
            return Err(TransportError::Negotiation("no remote offer".into()));
        }
        Ok(SessionDescription::answer(format!("{}{}", SDP_PREFIX, self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        *self.local.lock() = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let remote_id = Self::parse_sdp(&desc)?;
        let partner = self
            .network
            .lookup(remote_id)
            .ok_or_else(|| TransportError::Negotiation(format!("connection {} is gone", remote_id)))?;
        *self.remote.lock() = Some(remote_id);

        // The offerer applies the answer last; both ends are linked now
        if desc.kind == SdpKind::Answer {
            if *partner.remote.lock() != Some(self.id) {
                return Err(TransportError::Negotiation("answer from an unlinked peer".into()));
            }
            partner.mark_open();
            self.mark_open();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn wait_ice_gathering_complete(&self) {
        if self.network.is_stalled(&self.owner) {
            std::future::pending::<()>().await;
        }
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    async fn send(&self, message: ChannelMessage) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelNotOpen);
        }
        let partner = self.partner().ok_or(TransportError::Closed)?;
        if partner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.network.is_unreachable(&partner.owner) {
            return Err(TransportError::SendFailed(format!(
                "{} is unreachable",
                partner.owner
            )));
        }
        partner.emit(TransportEvent::Message(message));
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) {
        self.shut("closed locally");
        if let Some(partner) = self.partner() {
            partner.shut("remote closed");
        }
    }
}

/// Bootstrap client that calls hubs in the same process
///
/// Addresses without a registered hub behave like a refused connection.
#[derive(Default)]
pub struct MockRendezvous {
    hubs: Mutex<HashMap<String, Weak<SignalingHub>>>,
}

impl MockRendezvous {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, address: impl Into<String>, hub: &Arc<SignalingHub>) {
        self.hubs.lock().insert(address.into(), Arc::downgrade(hub));
    }
}

#[async_trait]
impl BootstrapClient for MockRendezvous {
    async fn connect(
        &self,
        address: &str,
        request: &ConnectRequest,
    ) -> Result<ConnectResponse, SignalingError> {
        let hub = self
            .hubs
            .lock()
            .get(address)
            .and_then(Weak::upgrade)
            .ok_or_else(|| SignalingError::Unreachable {
                address: address.to_string(),
                reason: "connection refused".into(),
            })?;

        match hub
            .accept_inbound_offer(&request.name, &request.uuid, request.sdp.clone())
            .await
        {
            Ok(answer) => Ok(ConnectResponse::ok(answer, hub.local_identity().uuid)),
            Err(e) => Err(SignalingError::Rejected(e.to_string())),
        }
    }
}
