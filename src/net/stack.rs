//! Network stack abstraction
//!
//! [`NetStack`] models the interface this daemon consumes from the host
//! networking layer: datagram endpoints with callback delivery, best-effort
//! sends, a local-address query, and link-state notifications. The socket
//! pool is written against this trait; [`OsStack`] is the production
//! implementation over `std::net`, and `net::sim::SimStack` is the scripted
//! implementation used by tests and hardware-free runs.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Opaque per-endpoint handle issued by the stack
pub type StackHandle = i32;

/// Shared dispatch routine invoked by the stack for every received datagram
pub type RxDispatch = Arc<dyn Fn(StackHandle, SocketAddrV4, &[u8]) + Send + Sync>;

/// Largest datagram the receive path will hand to dispatch
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Link-state notification events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Up,
    Down,
}

/// Cached Ethernet link state
///
/// Updated from stack notifications; until the first notification arrives,
/// link state is inferred from whether a local address has been assigned.
/// Readers never take a lock.
#[derive(Debug, Default)]
pub struct LinkState {
    known: AtomicBool,
    up: AtomicBool,
}

impl LinkState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn notify(&self, event: LinkEvent) {
        self.up.store(event == LinkEvent::Up, Ordering::Relaxed);
        self.known.store(true, Ordering::Relaxed);
    }

    /// Current link state, falling back to the address heuristic while no
    /// notification has been seen
    pub fn is_up(&self, local_ip: Option<Ipv4Addr>) -> bool {
        if self.known.load(Ordering::Relaxed) {
            self.up.load(Ordering::Relaxed)
        } else {
            local_ip.is_some_and(|ip| !ip.is_unspecified())
        }
    }
}

/// Interface the daemon consumes from the host networking layer
pub trait NetStack: Send + Sync {
    /// Open a datagram endpoint bound to `local_port`
    ///
    /// Received datagrams are delivered to `dispatch` in the stack's own
    /// context; the dispatch routine must not block for long.
    fn open(&self, local_port: u16, dispatch: RxDispatch) -> Result<StackHandle>;

    /// Close an endpoint, stopping delivery to its dispatch routine
    fn close(&self, handle: StackHandle) -> Result<()>;

    /// Best-effort send; the payload is copied out before this returns
    fn send(&self, handle: StackHandle, remote: SocketAddrV4, payload: &[u8]) -> Result<()>;

    /// Currently assigned local IPv4 address, if any
    fn local_ip(&self) -> Option<Ipv4Addr>;
}

struct OsSocket {
    socket: Arc<UdpSocket>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

/// `std::net`-backed stack implementation
///
/// Each open endpoint gets a reader thread that feeds the shared dispatch
/// routine, mirroring callback-style delivery. When a network interface name
/// is configured, a monitor thread polls its sysfs carrier file and feeds
/// [`LinkState`]; otherwise the link heuristic applies.
pub struct OsStack {
    link: Arc<LinkState>,
    sockets: parking_lot::Mutex<HashMap<StackHandle, OsSocket>>,
    next_handle: AtomicI32,
    stop: Arc<AtomicBool>,
    monitor: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

/// How often the reader threads wake to check for shutdown
const READER_POLL: Duration = Duration::from_millis(100);
/// Carrier file poll interval
const CARRIER_POLL: Duration = Duration::from_millis(500);

impl OsStack {
    pub fn new(link: Arc<LinkState>, interface: Option<&str>) -> Arc<Self> {
        let stack = Arc::new(Self {
            link: Arc::clone(&link),
            sockets: parking_lot::Mutex::new(HashMap::new()),
            next_handle: AtomicI32::new(1),
            stop: Arc::new(AtomicBool::new(false)),
            monitor: parking_lot::Mutex::new(None),
        });

        if let Some(iface) = interface {
            let carrier: PathBuf = format!("/sys/class/net/{}/carrier", iface).into();
            let stop = Arc::clone(&stack.stop);
            match thread::Builder::new()
                .name("link-mon".to_string())
                .spawn(move || carrier_monitor(carrier, link, stop))
            {
                Ok(handle) => *stack.monitor.lock() = Some(handle),
                Err(e) => log::error!("Failed to spawn link monitor: {}", e),
            }
        }

        stack
    }
}

/// Poll the interface carrier file, pushing transitions into the link cache
fn carrier_monitor(path: PathBuf, link: Arc<LinkState>, stop: Arc<AtomicBool>) {
    let mut last: Option<bool> = None;

    while !stop.load(Ordering::Relaxed) {
        if let Ok(contents) = std::fs::read_to_string(&path) {
            let up = contents.trim() == "1";
            if last != Some(up) {
                log::info!("Link {}", if up { "up" } else { "down" });
                link.notify(if up { LinkEvent::Up } else { LinkEvent::Down });
                last = Some(up);
            }
        }
        thread::sleep(CARRIER_POLL);
    }
}

impl NetStack for OsStack {
    fn open(&self, local_port: u16, dispatch: RxDispatch) -> Result<StackHandle> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, local_port))
            .map_err(|e| Error::NetError(format!("bind port {}: {}", local_port, e)))?;
        socket
            .set_read_timeout(Some(READER_POLL))
            .map_err(|e| Error::NetError(format!("set read timeout: {}", e)))?;

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        let socket = Arc::new(socket);
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let socket = Arc::clone(&socket);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("udp-rx-{}", local_port))
                .spawn(move || reader_loop(handle, socket, dispatch, stop))
                .map_err(|e| Error::NetError(format!("spawn reader: {}", e)))?
        };

        self.sockets.lock().insert(
            handle,
            OsSocket {
                socket,
                stop,
                reader: Some(reader),
            },
        );

        log::debug!("Opened UDP endpoint {} on port {}", handle, local_port);
        Ok(handle)
    }

    fn close(&self, handle: StackHandle) -> Result<()> {
        let Some(mut entry) = self.sockets.lock().remove(&handle) else {
            return Err(Error::InvalidArgument(format!(
                "unknown stack handle {}",
                handle
            )));
        };

        entry.stop.store(true, Ordering::Relaxed);
        if let Some(reader) = entry.reader.take() {
            let _ = reader.join();
        }
        Ok(())
    }

    fn send(&self, handle: StackHandle, remote: SocketAddrV4, payload: &[u8]) -> Result<()> {
        let socket = {
            let sockets = self.sockets.lock();
            let Some(entry) = sockets.get(&handle) else {
                return Err(Error::InvalidArgument(format!(
                    "unknown stack handle {}",
                    handle
                )));
            };
            Arc::clone(&entry.socket)
        };

        match socket.send_to(payload, remote) {
            Ok(_) => Ok(()),
            Err(e) => Err(Error::NetError(format!("send to {}: {}", remote, e))),
        }
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        // UDP connect performs local route selection without emitting a
        // packet, exposing the address the OS would source from.
        let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
        probe.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
        match probe.local_addr().ok()? {
            SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Some(*addr.ip()),
            _ => None,
        }
    }
}

fn reader_loop(
    handle: StackHandle,
    socket: Arc<UdpSocket>,
    dispatch: RxDispatch,
    stop: Arc<AtomicBool>,
) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    while !stop.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((len, SocketAddr::V4(remote))) => {
                dispatch(handle, remote, &buf[..len]);
            }
            Ok((_, SocketAddr::V6(remote))) => {
                log::debug!("Ignoring IPv6 datagram from {}", remote);
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::warn!("UDP receive error on endpoint {}: {}", handle, e);
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

impl Drop for OsStack {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(monitor) = self.monitor.lock().take() {
            let _ = monitor.join();
        }

        let handles: Vec<StackHandle> = self.sockets.lock().keys().copied().collect();
        for handle in handles {
            let _ = self.close(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_state_heuristic_before_notification() {
        let link = LinkState::new();

        // No notification yet: non-zero local address means up
        assert!(!link.is_up(None));
        assert!(!link.is_up(Some(Ipv4Addr::UNSPECIFIED)));
        assert!(link.is_up(Some(Ipv4Addr::new(10, 0, 0, 2))));
    }

    #[test]
    fn test_link_state_notification_overrides_heuristic() {
        let link = LinkState::new();

        link.notify(LinkEvent::Down);
        assert!(!link.is_up(Some(Ipv4Addr::new(10, 0, 0, 2))));

        link.notify(LinkEvent::Up);
        assert!(link.is_up(None));
    }
}
