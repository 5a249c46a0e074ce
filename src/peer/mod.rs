//! Remote peers
//!
//! A `Peer` is one endpoint of the mesh. It owns its transport handle
//! exclusively and carries everything that accumulates while a connection
//! is negotiated: the state machine, ICE candidates that arrived too early,
//! controller messages sent before the channel opened, and the last error.

pub mod state;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};

pub use state::{ConnectionState, Direction};

use crate::constants::AUDIO_QUEUE_CAPACITY;
use crate::error::{ConnectionError, Result};
use crate::identity::PeerIdentity;
use crate::network::transport::{ChannelMessage, PeerConnection};
use crate::protocol::{ControllerMessage, IceCandidate, SessionDescription};

/// Transport-level link status, tracked apart from negotiation state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus {
    Pending,
    Up,
    Down(String),
}

/// Outcome of sending a controller message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// Held until the connection opens
    Queued,
}

/// One endpoint of the mesh
pub struct Peer {
    identity: RwLock<PeerIdentity>,
    direction: Mutex<Option<Direction>>,
    state: watch::Sender<ConnectionState>,
    transport: watch::Sender<TransportStatus>,
    connection: Mutex<Option<Arc<dyn PeerConnection>>>,
    remote_description_set: AtomicBool,
    pending_candidates: Mutex<Vec<IceCandidate>>,
    outbound: Mutex<VecDeque<ControllerMessage>>,
    last_error: Mutex<Option<String>>,
    audio_tx: mpsc::Sender<Bytes>,
    audio_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl Peer {
    pub fn new(identity: PeerIdentity) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::New);
        let (transport, _) = watch::channel(TransportStatus::Pending);
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE_CAPACITY);
        Arc::new(Self {
            identity: RwLock::new(identity),
            direction: Mutex::new(None),
            state,
            transport,
            connection: Mutex::new(None),
            remote_description_set: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            outbound: Mutex::new(VecDeque::new()),
            last_error: Mutex::new(None),
            audio_tx,
            audio_rx: Mutex::new(Some(audio_rx)),
            connect_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn identity(&self) -> PeerIdentity {
        self.identity.read().clone()
    }

    pub fn uuid(&self) -> String {
        self.identity.read().uuid.clone()
    }

    pub fn is_local(&self) -> bool {
        self.identity.read().is_local
    }

    pub fn is_coordinator(&self) -> bool {
        self.identity.read().is_coordinator
    }

    pub fn set_coordinator(&self, coordinator: bool) {
        self.identity.write().is_coordinator = coordinator;
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.identity.write().name = name.into();
    }

    pub(crate) fn set_uuid(&self, uuid: impl Into<String>) {
        self.identity.write().uuid = uuid.into();
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn direction(&self) -> Option<Direction> {
        *self.direction.lock()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Start a connection attempt in `direction`
    pub fn begin(&self, direction: Direction) -> std::result::Result<(), ConnectionError> {
        let state = self.state();
        if state != ConnectionState::New {
            return Err(ConnectionError::InvalidTransition {
                from: state.to_string(),
                to: format!("{:?} attempt", direction),
            });
        }
        *self.direction.lock() = Some(direction);
        Ok(())
    }

    /// Advance the state machine, rejecting steps the direction does not allow
    pub fn transition(&self, to: ConnectionState) -> std::result::Result<(), ConnectionError> {
        let direction = self.direction();
        let mut result = Ok(());
        self.state.send_if_modified(|current| {
            let allowed = match direction {
                Some(direction) => current.can_transition(to, direction),
                None => to == ConnectionState::Disconnected && !current.is_terminal(),
            };
            if allowed {
                *current = to;
                true
            } else {
                result = Err(ConnectionError::InvalidTransition {
                    from: current.to_string(),
                    to: to.to_string(),
                });
                false
            }
        });
        if result.is_ok() {
            tracing::debug!("Peer {} -> {}", self.identity(), to);
        }
        result
    }

    pub fn attach(&self, connection: Arc<dyn PeerConnection>) {
        *self.connection.lock() = Some(connection);
    }

    pub fn connection(&self) -> std::result::Result<Arc<dyn PeerConnection>, ConnectionError> {
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| ConnectionError::NotConnected(self.uuid()))
    }

    pub fn set_transport(&self, status: TransportStatus) {
        self.transport.send_replace(status);
    }

    pub fn transport_status(&self) -> TransportStatus {
        self.transport.borrow().clone()
    }

    /// Wait until the transport reports up and negotiation has reached the
    /// step right before `Connected`
    pub async fn wait_connectable(&self, limit: Duration) -> std::result::Result<(), ConnectionError> {
        let direction = self
            .direction()
            .ok_or_else(|| ConnectionError::NotConnected(self.uuid()))?;
        let mut transport = self.transport.subscribe();
        let mut state = self.state.subscribe();

        let wait = async {
            let status = transport
                .wait_for(|s| *s != TransportStatus::Pending)
                .await
                .map_err(|_| ConnectionError::Closed("peer dropped".into()))?
                .clone();
            if let TransportStatus::Down(reason) = status {
                return Err(ConnectionError::Closed(reason));
            }

            let reached = *state
                .wait_for(|s| s.is_terminal() || s.awaits_transport(direction))
                .await
                .map_err(|_| ConnectionError::Closed("peer dropped".into()))?;
            if reached.is_terminal() {
                return Err(ConnectionError::Closed("disconnected while connecting".into()));
            }
            Ok::<(), ConnectionError>(())
        };

        tokio::time::timeout(limit, wait)
            .await
            .map_err(|_| ConnectionError::ConnectTimeout(limit))?
    }

    /// Apply the remote description, then any candidates that beat it here
    pub async fn apply_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let connection = self.connection()?;
        connection.set_remote_description(desc).await?;
        self.remote_description_set.store(true, Ordering::SeqCst);
        self.transition(ConnectionState::RemoteDescriptionSet)?;

        let pending = std::mem::take(&mut *self.pending_candidates.lock());
        for candidate in pending {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                tracing::warn!("Dropping ICE candidate for {}: {}", self.identity(), e);
            }
        }
        Ok(())
    }

    /// Add a remote candidate, or queue it until the remote description is set
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.remote_description_set.load(Ordering::SeqCst) {
            self.connection()?.add_ice_candidate(candidate).await?;
        } else {
            self.pending_candidates.lock().push(candidate);
        }
        Ok(())
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.lock().len()
    }

    /// Send a controller message, queueing it while still negotiating
    pub async fn send_controller(&self, message: &ControllerMessage) -> Result<Delivery> {
        {
            let mut outbound = self.outbound.lock();
            match self.state() {
                ConnectionState::Connected => {}
                ConnectionState::Disconnected => {
                    return Err(ConnectionError::Closed(format!("{} is disconnected", self.uuid())).into());
                }
                _ => {
                    outbound.push_back(message.clone());
                    return Ok(Delivery::Queued);
                }
            }
        }

        let connection = self.connection()?;
        connection
            .send(ChannelMessage::Control(message.to_json()))
            .await?;
        Ok(Delivery::Sent)
    }

    /// Enter `Connected` and flush queued controller messages
    pub async fn mark_connected(&self) -> Result<()> {
        let queued: Vec<ControllerMessage> = {
            let mut outbound = self.outbound.lock();
            self.transition(ConnectionState::Connected)?;
            outbound.drain(..).collect()
        };
        if queued.is_empty() {
            return Ok(());
        }

        let connection = self.connection()?;
        tracing::debug!("Flushing {} queued messages to {}", queued.len(), self.identity());
        for message in queued {
            connection
                .send(ChannelMessage::Control(message.to_json()))
                .await?;
        }
        Ok(())
    }

    /// Send audio wire records; only valid once connected
    pub async fn send_audio(&self, record: Bytes) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected(self.uuid()).into());
        }
        self.connection()?
            .send(ChannelMessage::Audio(record))
            .await?;
        Ok(())
    }

    /// Queue received audio for the decode pipeline; drops when full
    pub fn deliver_audio(&self, record: Bytes) {
        if self.audio_tx.try_send(record).is_err() {
            tracing::trace!("Audio queue for {} full, dropping record", self.uuid());
        }
    }

    /// Received audio; only the first caller gets it
    pub fn take_audio_receiver(&self) -> Option<mpsc::Receiver<Bytes>> {
        self.audio_rx.lock().take()
    }

    /// Move to `Disconnected`, remembering why. False if already there.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        if self.transition(ConnectionState::Disconnected).is_err() {
            return false;
        }
        *self.last_error.lock() = Some(reason);
        self.outbound.lock().clear();
        true
    }

    /// Fail and release the transport
    pub async fn close(&self, reason: impl Into<String>) -> bool {
        let changed = self.fail(reason);
        let connection = self.connection.lock().take();
        if let Some(connection) = connection {
            connection.close().await;
        }
        changed
    }

    /// Serializes connection attempts on this peer
    pub async fn connect_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.connect_lock.lock().await
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("identity", &self.identity())
            .field("state", &self.state())
            .finish()
    }
}
