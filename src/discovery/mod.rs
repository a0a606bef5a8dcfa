//! DAC discovery
//!
//! Ether Dream DACs announce themselves with a 36-byte UDP broadcast about
//! once a second. The listener maintains a live directory of DACs keyed by
//! id and pushes an immutable snapshot to every subscriber whenever a DAC
//! appears or expires.

use bytes::Buf;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::constants::{
    BROADCAST_PACKET_LEN, BROADCAST_PORT, BROADCAST_RECV_TIMEOUT, DAC_EXPIRY,
};
use crate::error::DiscoveryError;

/// Snapshot of the DACs currently broadcasting, keyed by id.
pub type DacMap = BTreeMap<String, DiscoveredDac>;

/// Callback invoked with a fresh snapshot on every directory change.
pub type DiscoveryCallback = Box<dyn FnMut(&DacMap) + Send>;

/// Identity of a DAC observed on the LAN. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDac {
    /// Six hex characters derived from bytes 3..5 of the broadcast packet
    pub id: String,
    pub ip_addr: IpAddr,
    pub hardware_rev: u16,
    pub software_rev: u16,
    /// On-device point buffer capacity as advertised by the DAC
    pub buffer_capacity: u16,
}

/// Passive broadcast listener with subscriber callbacks.
///
/// The background thread starts on the first [`subscribe`](Self::subscribe)
/// and runs for the process lifetime; a socket error logs and terminates it.
pub struct DacDiscovery {
    inner: Arc<Inner>,
}

struct Inner {
    port: u16,
    expiry: Duration,
    recv_timeout: Duration,
    subscribers: Mutex<Vec<DiscoveryCallback>>,
    listener: Mutex<ListenerState>,
}

#[derive(Default)]
struct ListenerState {
    started: bool,
    local_addr: Option<SocketAddr>,
}

impl DacDiscovery {
    pub fn new() -> Self {
        Self::with_config(BROADCAST_PORT, DAC_EXPIRY, BROADCAST_RECV_TIMEOUT)
    }

    /// Listener with non-standard port and timing, used by tests.
    pub(crate) fn with_config(port: u16, expiry: Duration, recv_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                port,
                expiry,
                recv_timeout,
                subscribers: Mutex::new(Vec::new()),
                listener: Mutex::new(ListenerState::default()),
            }),
        }
    }

    /// Register a callback invoked with a snapshot whenever the directory
    /// changes. The first subscription binds the socket and starts the
    /// listener thread; a bind failure is reported synchronously.
    pub fn subscribe(&self, callback: DiscoveryCallback) -> Result<(), DiscoveryError> {
        self.inner.subscribers.lock().unwrap().push(callback);

        let mut listener = self.inner.listener.lock().unwrap();
        if listener.started {
            return Ok(());
        }

        let socket = bind_broadcast_socket(self.inner.port, self.inner.recv_timeout)?;
        listener.local_addr = socket.local_addr().ok();
        listener.started = true;

        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("dac-discovery".to_string())
            .spawn(move || run_listener(socket, inner))
            .map_err(|e| DiscoveryError::BindFailed(e.to_string()))?;

        Ok(())
    }

    /// Address the listener socket is bound to, once started.
    #[cfg(test)]
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.listener.lock().unwrap().local_addr
    }
}

impl Default for DacDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

fn bind_broadcast_socket(port: u16, recv_timeout: Duration) -> Result<UdpSocket, DiscoveryError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| DiscoveryError::BindFailed(e.to_string()))?;
    // SO_REUSEADDR so a monitor and the player can share the broadcast port
    socket
        .set_reuse_address(true)
        .map_err(|e| DiscoveryError::BindFailed(e.to_string()))?;

    let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
    socket
        .bind(&addr.into())
        .map_err(|e| DiscoveryError::BindFailed(e.to_string()))?;

    let socket: UdpSocket = socket.into();
    socket
        .set_read_timeout(Some(recv_timeout))
        .map_err(|e| DiscoveryError::BindFailed(e.to_string()))?;
    Ok(socket)
}

fn run_listener(socket: UdpSocket, inner: Arc<Inner>) {
    tracing::info!("DAC discovery listening on UDP port {}", inner.port);

    let mut seen: HashMap<String, (DiscoveredDac, Instant)> = HashMap::new();
    let mut buf = [0u8; 256];

    loop {
        let mut changed = false;

        match socket.recv_from(&mut buf) {
            Ok((len, src)) => {
                if let Some(dac) = parse_broadcast(&buf[..len], src.ip()) {
                    let added = !seen.contains_key(&dac.id);
                    if added {
                        tracing::info!("Discovered DAC {} at {}", dac.id, dac.ip_addr);
                    }
                    seen.insert(dac.id.clone(), (dac, Instant::now()));
                    changed |= added;
                }
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                tracing::error!("Discovery socket error, listener exiting: {}", e);
                return;
            }
        }

        changed |= evict_stale(&mut seen, Instant::now(), inner.expiry);

        if changed {
            let snapshot: DacMap = seen
                .iter()
                .map(|(id, (dac, _))| (id.clone(), dac.clone()))
                .collect();
            let mut subscribers = inner.subscribers.lock().unwrap();
            for callback in subscribers.iter_mut() {
                callback(&snapshot);
            }
        }
    }
}

/// Parse a broadcast packet; anything that is not exactly 36 bytes is
/// silently dropped.
fn parse_broadcast(packet: &[u8], src: IpAddr) -> Option<DiscoveredDac> {
    if packet.len() != BROADCAST_PACKET_LEN {
        return None;
    }

    let id = format!("{:02x}{:02x}{:02x}", packet[3], packet[4], packet[5]);
    let mut fields = &packet[6..12];

    Some(DiscoveredDac {
        id,
        ip_addr: src,
        hardware_rev: fields.get_u16_le(),
        software_rev: fields.get_u16_le(),
        buffer_capacity: fields.get_u16_le(),
    })
}

/// Drop entries not refreshed within `expiry`. Returns true if any were
/// removed.
fn evict_stale(
    seen: &mut HashMap<String, (DiscoveredDac, Instant)>,
    now: Instant,
    expiry: Duration,
) -> bool {
    let before = seen.len();
    seen.retain(|id, (_, last_seen)| {
        let alive = now.duration_since(*last_seen) <= expiry;
        if !alive {
            tracing::info!("DAC {} expired", id);
        }
        alive
    });
    seen.len() != before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    /// Broadcast packet with id `abcdef`, hwRev 1, swRev 2, capacity 1800.
    fn sample_packet() -> [u8; 36] {
        let mut packet = [0u8; 36];
        packet[3..6].copy_from_slice(&[0xAB, 0xCD, 0xEF]);
        packet[6..8].copy_from_slice(&1u16.to_le_bytes());
        packet[8..10].copy_from_slice(&2u16.to_le_bytes());
        packet[10..12].copy_from_slice(&1800u16.to_le_bytes());
        packet
    }

    #[test]
    fn parse_broadcast_extracts_identity() {
        let src: IpAddr = "10.0.0.5".parse().unwrap();
        let dac = parse_broadcast(&sample_packet(), src).unwrap();

        assert_eq!(dac.id, "abcdef");
        assert_eq!(dac.ip_addr, src);
        assert_eq!(dac.hardware_rev, 1);
        assert_eq!(dac.software_rev, 2);
        assert_eq!(dac.buffer_capacity, 1800);
    }

    #[test]
    fn parse_broadcast_rejects_other_lengths() {
        let src: IpAddr = "10.0.0.5".parse().unwrap();
        assert!(parse_broadcast(&[0u8; 35], src).is_none());
        assert!(parse_broadcast(&[0u8; 37], src).is_none());
        assert!(parse_broadcast(&[], src).is_none());
    }

    #[test]
    fn evict_stale_drops_only_expired_entries() {
        let src: IpAddr = "10.0.0.5".parse().unwrap();
        let dac = parse_broadcast(&sample_packet(), src).unwrap();
        let now = Instant::now();

        let mut seen = HashMap::new();
        seen.insert("old".to_string(), (dac.clone(), now - Duration::from_secs(4)));
        seen.insert("fresh".to_string(), (dac, now));

        assert!(evict_stale(&mut seen, now, Duration::from_secs(3)));
        assert_eq!(seen.len(), 1);
        assert!(seen.contains_key("fresh"));

        assert!(!evict_stale(&mut seen, now, Duration::from_secs(3)));
    }

    #[test]
    fn listener_reports_add_then_expiry() {
        let discovery =
            DacDiscovery::with_config(0, Duration::from_millis(150), Duration::from_millis(25));
        let (tx, rx) = bounded::<DacMap>(16);

        discovery
            .subscribe(Box::new(move |snapshot| {
                let _ = tx.try_send(snapshot.clone());
            }))
            .unwrap();

        let addr = discovery.local_addr().unwrap();
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port());

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&sample_packet(), target).unwrap();

        let added = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(added.len(), 1);
        let dac = added.get("abcdef").unwrap();
        assert_eq!(dac.hardware_rev, 1);
        assert_eq!(dac.software_rev, 2);
        assert_eq!(dac.buffer_capacity, 1800);

        // no further packets: the entry must expire
        let expired = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(expired.is_empty());
    }

    #[test]
    fn malformed_packets_produce_no_snapshot() {
        let discovery =
            DacDiscovery::with_config(0, Duration::from_millis(150), Duration::from_millis(25));
        let (tx, rx) = bounded::<DacMap>(16);

        discovery
            .subscribe(Box::new(move |snapshot| {
                let _ = tx.try_send(snapshot.clone());
            }))
            .unwrap();

        let addr = discovery.local_addr().unwrap();
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port());

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&[0u8; 12], target).unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }
}
