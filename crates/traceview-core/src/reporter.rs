//! Best-effort event reporting.
//!
//! The reporter serializes events and hands them to a [`Transport`]. Sending
//! never blocks and never fails outward: anything that goes wrong is counted,
//! logged at debug level, and the event is dropped.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Mutex, RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Result, TraceError};
use crate::event::Event;
use crate::message;

/// Default collector host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default collector port.
pub const DEFAULT_PORT: u16 = 7831;

/// Moves serialized events to the collector.
pub trait Transport: Send + Sync {
    /// Hand one message to the transport without blocking.
    fn send(&self, payload: &[u8]) -> Result<()>;

    /// Human-readable destination, for logs.
    fn describe(&self) -> String;
}

/// Connectionless, non-blocking UDP transport.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpTransport {
    /// Connect to a `host:port` or bare `host` address (port defaults to 7831).
    pub fn connect(address: &str) -> Result<Self> {
        let target = resolve(address)?;
        let local = match target.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };

        let socket = UdpSocket::bind(local)?;
        socket.connect(target)?;
        socket.set_nonblocking(true)?;

        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl Transport for UdpTransport {
    fn send(&self, payload: &[u8]) -> Result<()> {
        let written = self.socket.send(payload)?;
        if written != payload.len() {
            return Err(TraceError::transport(format!(
                "short write: {written} of {} bytes",
                payload.len()
            )));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("udp://{}", self.target)
    }
}

/// Split an address into host and port, applying the default port.
pub fn split_address(address: &str) -> (String, u16) {
    let address = address.trim();
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return (addr.ip().to_string(), addr.port());
    }
    if let Ok(ip) = address.trim_matches(['[', ']']).parse::<IpAddr>() {
        return (ip.to_string(), DEFAULT_PORT);
    }
    match address.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (address.to_string(), DEFAULT_PORT),
        },
        None => (address.to_string(), DEFAULT_PORT),
    }
}

/// Join a host and port, bracketing IPv6 hosts.
pub fn join_address(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn resolve(address: &str) -> Result<SocketAddr> {
    let (host, port) = split_address(address);
    if host.is_empty() {
        return Err(TraceError::Config(format!("Invalid address '{address}'")));
    }
    (host.as_str(), port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| TraceError::Config(format!("Address '{address}' did not resolve")))
}

/// Discards everything; used when reporting is disabled.
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        "null".to_string()
    }
}

/// Keeps every payload in memory.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    payloads: Mutex<Vec<Vec<u8>>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.payloads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Remove and return everything sent so far.
    pub fn take(&self) -> Vec<Vec<u8>> {
        std::mem::take(
            &mut *self
                .payloads
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

impl Transport for MemoryTransport {
    fn send(&self, payload: &[u8]) -> Result<()> {
        self.payloads
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(payload.to_vec());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn send(&self, payload: &[u8]) -> Result<()> {
        (**self).send(payload)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Counters for reporter activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReporterStats {
    pub sent: u64,
    pub dropped: u64,
}

/// Where a reporter currently sends, and the endpoint it was pointed at.
struct Destination {
    transport: Box<dyn Transport>,
    endpoint: Option<(String, u16)>,
}

/// Sends events to the collector, shared process-wide.
///
/// A UDP reporter can be pointed at another collector while running. Sends
/// take a read lock, retargeting briefly takes the write lock.
pub struct Reporter {
    destination: RwLock<Destination>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl fmt::Debug for Reporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("transport", &self.destination())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Reporter {
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::with_destination(Destination {
            transport: Box::new(transport),
            endpoint: None,
        })
    }

    fn with_destination(destination: Destination) -> Self {
        Self {
            destination: RwLock::new(destination),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// A reporter sending to a UDP collector.
    pub fn udp(address: &str) -> Result<Self> {
        Ok(Self::with_destination(connect(address)?))
    }

    /// A reporter that drops everything.
    pub fn disabled() -> Self {
        Self::new(NullTransport)
    }

    fn read(&self) -> RwLockReadGuard<'_, Destination> {
        self.destination
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Serialize and send one event. Returns whether the transport accepted it.
    pub fn send(&self, event: &Event) -> bool {
        let destination = self.read();
        match message::encode(event).and_then(|payload| destination.transport.send(&payload)) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(
                    error = %e,
                    op_id = %event.op_id(),
                    destination = %destination.transport.describe(),
                    dropped,
                    "Dropping trace event"
                );
                false
            }
        }
    }

    /// Point the reporter at a new `host[:port]` collector.
    ///
    /// If the new address cannot be connected the current transport stays in place.
    pub fn set_address(&self, address: &str) -> Result<()> {
        match connect(address) {
            Ok(next) => {
                tracing::info!(destination = %next.transport.describe(), "Reporter retargeted");
                *self
                    .destination
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(address, error = %e, "Keeping current reporter destination");
                Err(e)
            }
        }
    }

    /// Change the collector host, keeping the current (or default) port.
    pub fn set_host(&self, host: &str) -> Result<()> {
        let port = self.port().unwrap_or(DEFAULT_PORT);
        self.set_address(&join_address(host, port))
    }

    /// Change the collector port, keeping the current (or default) host.
    pub fn set_port(&self, port: u16) -> Result<()> {
        let host = self.host().unwrap_or_else(|| DEFAULT_HOST.to_string());
        self.set_address(&join_address(&host, port))
    }

    /// Collector host, for UDP reporters.
    pub fn host(&self) -> Option<String> {
        self.read().endpoint.as_ref().map(|(host, _)| host.clone())
    }

    /// Collector port, for UDP reporters.
    pub fn port(&self) -> Option<u16> {
        self.read().endpoint.as_ref().map(|(_, port)| *port)
    }

    /// Collector `host:port`, for UDP reporters.
    pub fn address(&self) -> Option<String> {
        self.read()
            .endpoint
            .as_ref()
            .map(|(host, port)| join_address(host, *port))
    }

    pub fn stats(&self) -> ReporterStats {
        ReporterStats {
            sent: self.sent.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn destination(&self) -> String {
        self.read().transport.describe()
    }
}

fn connect(address: &str) -> Result<Destination> {
    let transport = UdpTransport::connect(address)?;
    tracing::debug!(target = %transport.target(), "UDP reporter connected");
    Ok(Destination {
        transport: Box::new(transport),
        endpoint: Some(split_address(address)),
    })
}
