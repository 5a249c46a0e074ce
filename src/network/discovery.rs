//! Coordinator discovery
//!
//! The coordinator advertises its bootstrap port; joining peers resolve it.
//! On the LAN this is a UDP broadcast query answered with
//! `{"serviceName": "soundsync", "port": 6512}`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::constants::SERVICE_NAME;
use crate::error::Result;

/// Where a coordinator's bootstrap server listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAddress {
    pub host: IpAddr,
    pub port: u16,
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", SocketAddr::new(self.host, self.port))
    }
}

/// Service advertisement and lookup
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Announce the local bootstrap server on `port`
    async fn advertise(&self, port: u16) -> Result<()>;

    /// Find a coordinator; may wait indefinitely, callers bound it
    async fn resolve(&self) -> Result<Option<ServiceAddress>>;
}

/// Fixed answer, for configured coordinator addresses and tests
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    address: Option<ServiceAddress>,
}

impl StaticDiscovery {
    pub fn new(address: Option<ServiceAddress>) -> Self {
        Self { address }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn advertise(&self, _port: u16) -> Result<()> {
        Ok(())
    }

    async fn resolve(&self) -> Result<Option<ServiceAddress>> {
        Ok(self.address.clone())
    }
}

/// Discovery datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Datagram {
    #[serde(rename_all = "camelCase")]
    Query { service_name: String },
    #[serde(rename_all = "camelCase")]
    Announce { service_name: String, port: u16 },
}

/// Interval between broadcast queries while resolving
const QUERY_INTERVAL: Duration = Duration::from_millis(500);

/// UDP broadcast discovery
pub struct LanDiscovery {
    discovery_port: u16,
    query_target: IpAddr,
    responder: Mutex<Option<(u16, JoinHandle<()>)>>,
}

impl LanDiscovery {
    pub fn new(discovery_port: u16) -> Self {
        Self {
            discovery_port,
            query_target: IpAddr::V4(Ipv4Addr::BROADCAST),
            responder: Mutex::new(None),
        }
    }

    /// Send queries to `target` instead of the broadcast address
    pub fn with_query_target(mut self, target: IpAddr) -> Self {
        self.query_target = target;
        self
    }

    /// Port the responder is bound to, once advertising
    pub fn responder_port(&self) -> Option<u16> {
        self.responder.lock().as_ref().map(|(port, _)| *port)
    }

    fn bind(port: u16) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
        socket.bind(&addr.into())?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    async fn respond(socket: UdpSocket, port: u16) {
        let reply = Datagram::Announce {
            service_name: SERVICE_NAME.to_string(),
            port,
        };
        let reply = match serde_json::to_vec(&reply) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("Failed to encode discovery reply: {}", e);
                return;
            }
        };

        let mut buf = [0u8; 1024];
        let mut failures = 0u32;
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(received) => {
                    failures = 0;
                    received
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_SOCKET_FAILURES {
                        tracing::error!(
                            "Discovery responder stopping after {} socket errors: {}",
                            failures,
                            e
                        );
                        return;
                    }
                    let delay = error_backoff(failures);
                    tracing::warn!("Discovery socket error, retrying in {:?}: {}", delay, e);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            match serde_json::from_slice::<Datagram>(&buf[..len]) {
                Ok(Datagram::Query { service_name }) if service_name == SERVICE_NAME => {
                    tracing::debug!("Answering discovery query from {}", from);
                    if let Err(e) = socket.send_to(&reply, from).await {
                        tracing::warn!("Failed to answer {}: {}", from, e);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Consecutive receive errors after which the responder gives up
const MAX_SOCKET_FAILURES: u32 = 10;

/// Pause before the next receive after `failures` errors in a row
fn error_backoff(failures: u32) -> Duration {
    let millis = 50u64.saturating_mul(1 << failures.saturating_sub(1).min(6));
    Duration::from_millis(millis).min(Duration::from_secs(2))
}

#[async_trait]
impl Discovery for LanDiscovery {
    async fn advertise(&self, port: u16) -> Result<()> {
        let socket = Self::bind(self.discovery_port)?;
        let bound = socket.local_addr()?.port();
        let task = tokio::spawn(Self::respond(socket, port));

        if let Some((_, previous)) = self.responder.lock().replace((bound, task)) {
            previous.abort();
        }
        tracing::info!(
            "Advertising '{}' on UDP {} (bootstrap port {})",
            SERVICE_NAME,
            bound,
            port
        );
        Ok(())
    }

    async fn resolve(&self) -> Result<Option<ServiceAddress>> {
        let socket = Self::bind(0)?;
        let query = serde_json::to_vec(&Datagram::Query {
            service_name: SERVICE_NAME.to_string(),
        })
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let target = SocketAddr::new(self.query_target, self.discovery_port);

        let mut buf = [0u8; 1024];
        loop {
            socket.send_to(&query, target).await?;

            let deadline = tokio::time::Instant::now() + QUERY_INTERVAL;
            while let Ok(received) =
                tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await
            {
                let (len, from) = received?;
                if let Ok(Datagram::Announce { service_name, port }) =
                    serde_json::from_slice::<Datagram>(&buf[..len])
                {
                    if service_name == SERVICE_NAME {
                        let address = ServiceAddress {
                            host: from.ip(),
                            port,
                        };
                        tracing::info!("Found coordinator at {}", address);
                        return Ok(Some(address));
                    }
                }
            }
        }
    }
}

impl Drop for LanDiscovery {
    fn drop(&mut self) {
        if let Some((_, task)) = self.responder.lock().take() {
            task.abort();
        }
    }
}
