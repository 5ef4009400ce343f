//! Shared runtime state for the acquisition and network tasks
//!
//! Both long-lived task threads hang off a single [`NodeState`]. All scalar
//! configuration (threshold, batch size, channel) lives in atomics so the
//! acquisition loop can read it locklessly every millisecond while the
//! network task applies CONFIGURE commands. Each field fits in a machine
//! word and is validated before the store, so readers observing either the
//! old or the new value is always safe.
//!
//! The transmit target is the one piece of multi-word shared state; it sits
//! behind a mutex and is latched from the sender of the first START command.

use crate::config::Config;
use crate::net::protocol::Sequencer;
use parking_lot::Mutex;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Instant;

/// ADC reference voltage in millivolts
pub const ADC_VREF_MV: u16 = 3300;
/// Full-scale 12-bit ADC value
pub const ADC_MAX_VALUE: u16 = 4095;
/// Number of selectable ADC channels
pub const ADC_CHANNEL_COUNT: u8 = 8;
/// Upper bound on samples per data packet
pub const MAX_BATCH_SIZE: u16 = 500;

/// Acquisition task state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AcqState {
    Idle = 0,
    Running = 1,
    Error = 2,
}

impl AcqState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => AcqState::Running,
            2 => AcqState::Error,
            _ => AcqState::Idle,
        }
    }
}

/// Network task state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NetState {
    Init = 0,
    WaitLink = 1,
    WaitIp = 2,
    Ready = 3,
    Error = 4,
}

impl NetState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => NetState::WaitLink,
            2 => NetState::WaitIp,
            3 => NetState::Ready,
            4 => NetState::Error,
            _ => NetState::Init,
        }
    }
}

/// Acquisition-side counters, monotonic until reboot
#[derive(Debug, Default)]
pub struct AcqStats {
    pub samples_collected: AtomicU64,
    pub packets_sent: AtomicU64,
    pub errors: AtomicU64,
}

/// Network-side counters, monotonic until reboot
#[derive(Debug, Default)]
pub struct NetStats {
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub errors: AtomicU64,
}

impl NetStats {
    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Shared state of the daemon
///
/// Created once in `main` and handed to both task threads behind an `Arc`.
pub struct NodeState {
    /// Sample threshold in millivolts (0-3300)
    pub threshold_mv: AtomicU16,
    /// Qualifying samples per data packet (1-500)
    pub batch_size: AtomicU16,
    /// Active ADC channel (0-7)
    pub channel: AtomicU8,
    /// Bumped on every batch-size or channel change; the acquisition loop
    /// discards its in-progress batch when it observes a new value
    pub config_epoch: AtomicU32,

    acq_state: AtomicU8,
    net_state: AtomicU8,

    /// Destination for data packets, latched from the first START sender
    target: Mutex<Option<SocketAddrV4>>,

    pub sequencer: Sequencer,
    pub acq_stats: AcqStats,
    pub net_stats: NetStats,

    started: Instant,
}

impl NodeState {
    pub fn new(config: &Config) -> Self {
        Self {
            threshold_mv: AtomicU16::new(config.acquisition.threshold_mv),
            batch_size: AtomicU16::new(config.acquisition.batch_size),
            channel: AtomicU8::new(config.adc.channel),
            config_epoch: AtomicU32::new(0),
            acq_state: AtomicU8::new(AcqState::Idle as u8),
            net_state: AtomicU8::new(NetState::Init as u8),
            target: Mutex::new(None),
            sequencer: Sequencer::new(),
            acq_stats: AcqStats::default(),
            net_stats: NetStats::default(),
            started: Instant::now(),
        }
    }

    pub fn acq_state(&self) -> AcqState {
        AcqState::from_u8(self.acq_state.load(Ordering::Relaxed))
    }

    pub fn set_acq_state(&self, state: AcqState) {
        self.acq_state.store(state as u8, Ordering::Relaxed);
    }

    pub fn net_state(&self) -> NetState {
        NetState::from_u8(self.net_state.load(Ordering::Relaxed))
    }

    pub fn set_net_state(&self, state: NetState) {
        self.net_state.store(state as u8, Ordering::Relaxed);
    }

    pub fn is_net_ready(&self) -> bool {
        self.net_state() == NetState::Ready
    }

    /// Replace the transmit target
    pub fn set_target(&self, target: SocketAddrV4) {
        *self.target.lock() = Some(target);
    }

    pub fn target(&self) -> Option<SocketAddrV4> {
        *self.target.lock()
    }

    /// Invalidate any in-progress batch
    pub fn bump_config_epoch(&self) {
        self.config_epoch.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u32 {
        self.started.elapsed().as_secs() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_state_transitions() {
        let state = NodeState::new(&Config::default());
        assert_eq!(state.acq_state(), AcqState::Idle);
        assert_eq!(state.net_state(), NetState::Init);

        state.set_acq_state(AcqState::Running);
        assert_eq!(state.acq_state(), AcqState::Running);

        state.set_net_state(NetState::Ready);
        assert!(state.is_net_ready());
        state.set_net_state(NetState::WaitLink);
        assert!(!state.is_net_ready());
    }

    #[test]
    fn test_target_latch() {
        let state = NodeState::new(&Config::default());
        assert!(state.target().is_none());

        let first = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 10), 40000);
        let second = SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 41000);

        state.set_target(first);
        assert_eq!(state.target(), Some(first));

        // A later START replaces the previous target
        state.set_target(second);
        assert_eq!(state.target(), Some(second));
    }

    #[test]
    fn test_config_epoch() {
        let state = NodeState::new(&Config::default());
        let before = state.config_epoch.load(Ordering::Relaxed);
        state.bump_config_epoch();
        assert_eq!(state.config_epoch.load(Ordering::Relaxed), before + 1);
    }
}
