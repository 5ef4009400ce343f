//! Network task: bring-up, receive loop, and command dispatch
//!
//! Lifecycle: wait for link (30 s deadline) → wait for a local address
//! (30 s deadline) → bind the UDP control socket → Ready. In Ready the loop
//! re-checks the link each iteration (loss drops back to link recovery) and
//! blocks on the socket for 100 ms at a time, dispatching whatever arrives:
//! pings get pongs, commands are applied, everything else is logged and
//! dropped. Bring-up deadline exhaustion is terminal; the task parks in the
//! Error state.
//!
//! The first START command latches its sender as the transmit target for
//! data bursts. Status replies always go back to the requester, which need
//! not be the target.

use crate::error::{Error, Result};
use crate::net::protocol::{
    self, CommandCode, CommandPayload, ConfigParam, MsgType, StatusPayload,
};
use crate::net::socket::{SocketId, SocketPool, MAX_PAYLOAD_SIZE};
use crate::state::{NetState, NodeState};
use crate::tasks::acquisition::Acquisition;
use parking_lot::Mutex;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Poll interval while waiting for link or address
const BRINGUP_POLL: Duration = Duration::from_millis(500);
/// Overall deadline for each bring-up phase
const BRINGUP_TIMEOUT: Duration = Duration::from_secs(30);
/// Blocking receive timeout in the Ready loop
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Network-side handle shared with the acquisition task
///
/// Carries everything needed to address and send a data packet: the socket
/// (once bound), the latched transmit target, and the network counters.
#[derive(Clone)]
pub struct NetHandle {
    state: Arc<NodeState>,
    pool: Arc<SocketPool>,
    socket: Arc<Mutex<Option<SocketId>>>,
}

impl NetHandle {
    pub fn new(state: Arc<NodeState>, pool: Arc<SocketPool>) -> Self {
        Self {
            state,
            pool,
            socket: Arc::new(Mutex::new(None)),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_net_ready()
    }

    pub(crate) fn bind_socket(&self, id: SocketId) {
        *self.socket.lock() = Some(id);
    }

    fn socket(&self) -> Result<SocketId> {
        self.socket
            .lock()
            .ok_or_else(|| Error::NetError("socket not created".into()))
    }

    /// Send a pre-built packet to the current transmit target
    ///
    /// Requires the network task to be in Ready and a target to have been
    /// latched. Success updates the network counters.
    pub fn send_raw(&self, data: &[u8]) -> Result<()> {
        if !self.is_ready() {
            return Err(Error::LinkDown);
        }
        let target = self
            .state
            .target()
            .ok_or_else(|| Error::NetError("no transmit target".into()))?;

        self.pool.send(self.socket()?, target, data)?;
        self.state.net_stats.record_sent(data.len());
        Ok(())
    }

    /// Send a pre-built packet to an explicit endpoint (replies)
    pub fn send_to(&self, remote: SocketAddrV4, data: &[u8]) -> Result<()> {
        self.pool.send(self.socket()?, remote, data)?;
        self.state.net_stats.record_sent(data.len());
        Ok(())
    }

    /// Programmatically set the transmit target from a dotted-quad address
    ///
    /// The target is normally latched from START command traffic; this is the
    /// configuration-driven override.
    pub fn set_target(&self, ip: &str, port: u16) -> Result<()> {
        let addr: std::net::Ipv4Addr = ip
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid IPv4 address: {}", ip)))?;
        self.state.set_target(SocketAddrV4::new(addr, port));
        log::info!("Transmit target set to {}:{}", ip, port);
        Ok(())
    }
}

/// The network task itself
pub struct NetworkTask {
    state: Arc<NodeState>,
    pool: Arc<SocketPool>,
    acquisition: Acquisition,
    handle: NetHandle,
    local_port: u16,
    running: Arc<AtomicBool>,
}

impl NetworkTask {
    pub fn new(
        state: Arc<NodeState>,
        pool: Arc<SocketPool>,
        acquisition: Acquisition,
        handle: NetHandle,
        local_port: u16,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            state,
            pool,
            acquisition,
            handle,
            local_port,
            running,
        }
    }

    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("net-task".to_string())
            .spawn(move || self.run())
    }

    fn run(self) {
        self.state.set_net_state(NetState::WaitLink);
        log::info!("Network task: waiting for link...");

        if !wait_for_link(&self.pool, &self.running, BRINGUP_TIMEOUT) {
            if self.running.load(Ordering::Relaxed) {
                log::error!("Link timeout");
                self.state.set_net_state(NetState::Error);
            }
            return;
        }

        log::info!("Link up, waiting for address...");
        self.state.set_net_state(NetState::WaitIp);

        if !wait_for_ip(&self.pool, &self.running, BRINGUP_TIMEOUT) {
            if self.running.load(Ordering::Relaxed) {
                log::error!("Address timeout");
                self.state.set_net_state(NetState::Error);
            }
            return;
        }

        if let Some(ip) = self.pool.local_ip() {
            log::info!("Local address: {}", ip);
        }

        let socket = match self.pool.create(self.local_port) {
            Ok(id) => id,
            Err(e) => {
                log::error!("Failed to create UDP socket: {}", e);
                self.state.set_net_state(NetState::Error);
                return;
            }
        };
        self.handle.bind_socket(socket);

        log::info!("UDP socket created on port {}", self.local_port);
        self.state.set_net_state(NetState::Ready);

        let ctx = NetCtx {
            state: Arc::clone(&self.state),
            acquisition: self.acquisition.clone(),
            handle: self.handle.clone(),
        };

        let mut rx_buf = vec![0u8; MAX_PAYLOAD_SIZE];

        while self.running.load(Ordering::Relaxed) {
            if !self.pool.is_link_up() {
                log::warn!("Link lost");
                self.state.set_net_state(NetState::WaitLink);

                if !wait_for_link(&self.pool, &self.running, BRINGUP_TIMEOUT) {
                    if self.running.load(Ordering::Relaxed) {
                        log::error!("Link recovery timeout");
                        self.state.set_net_state(NetState::Error);
                    }
                    break;
                }

                self.state.set_net_state(NetState::Ready);
                log::info!("Link restored");
            }

            match self.pool.recv(socket, &mut rx_buf, RECV_TIMEOUT) {
                Ok((len, remote)) if len > 0 => {
                    self.state.net_stats.record_received(len);
                    process_packet(&ctx, &rx_buf[..len], remote);
                }
                Ok(_) => {}
                Err(Error::Timeout) => {}
                Err(e) => {
                    log::warn!("Receive error: {}", e);
                    self.state.net_stats.errors.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let _ = self.pool.close(socket);
        log::info!("Network task exiting");
    }
}

fn wait_for_link(pool: &SocketPool, running: &AtomicBool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;

    while running.load(Ordering::Relaxed) {
        if pool.is_link_up() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(BRINGUP_POLL);
    }
    false
}

fn wait_for_ip(pool: &SocketPool, running: &AtomicBool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;

    while running.load(Ordering::Relaxed) {
        if pool.local_ip().is_some_and(|ip| !ip.is_unspecified()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(BRINGUP_POLL);
    }
    false
}

/// Everything the dispatch path needs
pub(crate) struct NetCtx {
    pub(crate) state: Arc<NodeState>,
    pub(crate) acquisition: Acquisition,
    pub(crate) handle: NetHandle,
}

/// Parse and dispatch one received datagram
pub(crate) fn process_packet(ctx: &NetCtx, data: &[u8], remote: SocketAddrV4) {
    let (header, payload) = match protocol::parse_packet(data) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::warn!("Invalid packet from {}: {}", remote, e);
            ctx.state.net_stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    match MsgType::try_from(header.msg_type) {
        Ok(MsgType::Ping) => {
            log::debug!("Ping from {}, sending pong", remote);
            let mut buf = [0u8; protocol::HEADER_SIZE];
            match protocol::build_pong(&mut buf, &ctx.state.sequencer) {
                Ok(len) => {
                    if let Err(e) = ctx.handle.send_to(remote, &buf[..len]) {
                        log::warn!("Failed to send pong: {}", e);
                        ctx.state.net_stats.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => log::error!("Failed to build pong: {}", e),
            }
        }
        Ok(MsgType::Cmd) => match CommandPayload::parse(payload) {
            Ok(cmd) => handle_command(ctx, cmd, remote),
            Err(e) => {
                log::warn!("Malformed command from {}: {}", remote, e);
                ctx.state.net_stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        },
        Ok(MsgType::Pong) => {
            log::debug!("Pong from {}", remote);
        }
        Ok(other) => {
            log::warn!("Unexpected message type {:?} from {}", other, remote);
        }
        Err(raw) => {
            log::warn!("Unknown message type 0x{:02X} from {}", raw, remote);
        }
    }
}

/// Apply one control command
fn handle_command(ctx: &NetCtx, cmd: CommandPayload, remote: SocketAddrV4) {
    log::info!(
        "Command 0x{:02X} from {} (param_type {}, param {})",
        cmd.cmd,
        remote,
        cmd.param_type,
        cmd.param
    );

    match CommandCode::try_from(cmd.cmd) {
        Ok(CommandCode::StartAcq) => {
            // The START sender becomes the data destination
            ctx.state.set_target(remote);
            log::info!("Acquisition target set to {}", remote);
            ctx.acquisition.start();
            // No response - fire and forget
        }
        Ok(CommandCode::StopAcq) => {
            ctx.acquisition.stop();
        }
        Ok(CommandCode::GetStatus) => {
            let status = StatusPayload {
                acquiring: ctx.acquisition.is_running(),
                channel: ctx.state.channel.load(Ordering::Relaxed),
                threshold_mv: ctx.state.threshold_mv.load(Ordering::Relaxed),
                uptime: ctx.state.uptime_secs(),
                samples_sent: ctx.state.net_stats.packets_sent.load(Ordering::Relaxed) as u32,
            };

            let mut buf = [0u8; protocol::HEADER_SIZE + protocol::STATUS_PAYLOAD_SIZE];
            match protocol::build_status(&mut buf, &ctx.state.sequencer, &status) {
                // Status always goes back to the requester
                Ok(len) => {
                    if let Err(e) = ctx.handle.send_to(remote, &buf[..len]) {
                        log::warn!("Failed to send status: {}", e);
                        ctx.state.net_stats.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => log::error!("Failed to build status: {}", e),
            }
        }
        Ok(CommandCode::Configure) => apply_configure(ctx, cmd),
        Err(raw) => {
            log::warn!("Unknown command 0x{:02X}", raw);
        }
    }
}

/// Apply a CONFIGURE command; out-of-range values are rejected without reply
fn apply_configure(ctx: &NetCtx, cmd: CommandPayload) {
    match ConfigParam::try_from(cmd.param_type) {
        Ok(ConfigParam::ThresholdPercent) => {
            match ctx.acquisition.set_threshold_percent(cmd.param) {
                Ok(()) => log::info!("Threshold set to {}%", cmd.param),
                Err(e) => log::warn!("{}", e),
            }
        }
        Ok(ConfigParam::ThresholdMv) => match ctx.acquisition.set_threshold_mv(cmd.param) {
            Ok(()) => log::info!("Threshold set to {} mV", cmd.param),
            Err(e) => log::warn!("{}", e),
        },
        Ok(ConfigParam::BatchSize) => match ctx.acquisition.set_batch_size(cmd.param) {
            Ok(()) => log::info!("Batch size set to {}", cmd.param),
            Err(e) => log::warn!("{}", e),
        },
        Ok(ConfigParam::Channel) => match ctx.acquisition.set_channel(cmd.param) {
            Ok(()) => log::info!("Channel set to {}", cmd.param),
            Err(e) => log::warn!("{}", e),
        },
        Ok(ConfigParam::ResetSequence) => {
            ctx.state.sequencer.reset();
            log::info!("Sequence counter reset");
        }
        Ok(ConfigParam::LogLevel) => apply_log_level(cmd.param),
        Err(raw) => {
            log::warn!("Unknown config param_type: {}", raw);
        }
    }
}

/// Map the wire log level (0=Debug .. 5=None) onto the logger
fn apply_log_level(param: u16) {
    let filter = match param {
        0 => log::LevelFilter::Debug,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Warn,
        // Critical has no direct counterpart; both map onto Error
        3 | 4 => log::LevelFilter::Error,
        5 => log::LevelFilter::Off,
        other => {
            log::warn!("Log level {} out of range", other);
            return;
        }
    };

    // Log before the new filter can suppress the message
    log::info!("Log level set to {}", filter);
    log::set_max_level(filter);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adc::SimAdc;
    use crate::config::Config;
    use crate::net::sim::SimStack;
    use crate::net::stack::{LinkEvent, LinkState, NetStack};
    use std::net::Ipv4Addr;

    struct Fixture {
        stack: Arc<SimStack>,
        link: Arc<LinkState>,
        pool: Arc<SocketPool>,
        ctx: NetCtx,
    }

    fn fixture() -> Fixture {
        let stack = SimStack::new();
        let link = LinkState::new();
        link.notify(LinkEvent::Up);

        let pool = SocketPool::new(Arc::clone(&stack) as Arc<dyn NetStack>, Arc::clone(&link));
        let state = Arc::new(NodeState::new(&Config::default()));
        let acquisition =
            Acquisition::new(Arc::clone(&state), Box::new(SimAdc::new())).unwrap();

        let handle = NetHandle::new(Arc::clone(&state), Arc::clone(&pool));
        let socket = pool.create(5000).unwrap();
        handle.bind_socket(socket);
        state.set_net_state(NetState::Ready);

        Fixture {
            stack,
            link,
            pool,
            ctx: NetCtx {
                state,
                acquisition,
                handle,
            },
        }
    }

    fn sender() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 50), 40000)
    }

    #[test]
    fn test_ping_gets_pong() {
        let f = fixture();

        // Literal ping from the host: 7A DA 01 00 00 00 00
        process_packet(&f.ctx, &[0x7A, 0xDA, 0x01, 0x00, 0x00, 0x00, 0x00], sender());

        let sent = f.stack.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].remote, sender());
        assert_eq!(&sent[0].payload[..3], &[0x7A, 0xDA, 0x02]);
        assert_eq!(
            f.ctx.state.net_stats.packets_sent.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_start_latches_target_and_runs() {
        let f = fixture();

        let mut buf = [0u8; 16];
        let seq = protocol::Sequencer::new();
        let len =
            protocol::build_command(&mut buf, &seq, CommandCode::StartAcq, 0, 0).unwrap();

        process_packet(&f.ctx, &buf[..len], sender());

        assert_eq!(f.ctx.state.target(), Some(sender()));
        assert!(f.ctx.acquisition.is_running());
        // START is fire and forget
        assert_eq!(f.stack.sent_count(), 0);
    }

    #[test]
    fn test_stop_command() {
        let f = fixture();
        f.ctx.acquisition.start();

        let mut buf = [0u8; 16];
        let seq = protocol::Sequencer::new();
        let len =
            protocol::build_command(&mut buf, &seq, CommandCode::StopAcq, 0, 0).unwrap();
        process_packet(&f.ctx, &buf[..len], sender());

        assert!(!f.ctx.acquisition.is_running());
    }

    #[test]
    fn test_status_replies_to_sender_not_target() {
        let f = fixture();

        // Target latched by an earlier START from a different host
        let other = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 99), 3333);
        f.ctx.state.set_target(other);
        f.ctx.acquisition.set_threshold_mv(2000).unwrap();

        let mut buf = [0u8; 16];
        let seq = protocol::Sequencer::new();
        let len =
            protocol::build_command(&mut buf, &seq, CommandCode::GetStatus, 0, 0).unwrap();
        process_packet(&f.ctx, &buf[..len], sender());

        let sent = f.stack.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].remote, sender());

        let (header, payload) = protocol::parse_packet(&sent[0].payload).unwrap();
        assert_eq!(header.msg_type, MsgType::Status as u8);

        let status = StatusPayload::parse(payload).unwrap();
        assert!(!status.acquiring);
        assert_eq!(status.channel, 0);
        assert_eq!(status.threshold_mv, 2000);
    }

    #[test]
    fn test_reset_sequence_then_status() {
        let f = fixture();

        // Burn a few sequence numbers
        let mut buf = [0u8; 16];
        for _ in 0..5 {
            protocol::build_ping(&mut buf, &f.ctx.state.sequencer).unwrap();
        }

        let seq = protocol::Sequencer::new();
        let len = protocol::build_command(
            &mut buf,
            &seq,
            CommandCode::Configure,
            ConfigParam::ResetSequence as u8,
            0,
        )
        .unwrap();
        process_packet(&f.ctx, &buf[..len], sender());

        let len =
            protocol::build_command(&mut buf, &seq, CommandCode::GetStatus, 0, 0).unwrap();
        process_packet(&f.ctx, &buf[..len], sender());

        let sent = f.stack.take_sent();
        let (header, _) = protocol::parse_packet(&sent[0].payload).unwrap();
        assert_eq!(header.sequence, 0);
    }

    #[test]
    fn test_configure_batch_size() {
        let f = fixture();

        let mut buf = [0u8; 16];
        let seq = protocol::Sequencer::new();
        let len = protocol::build_command(
            &mut buf,
            &seq,
            CommandCode::Configure,
            ConfigParam::BatchSize as u8,
            250,
        )
        .unwrap();
        process_packet(&f.ctx, &buf[..len], sender());

        assert_eq!(f.ctx.state.batch_size.load(Ordering::Relaxed), 250);
        // Out-of-range values are ignored without a reply
        let len = protocol::build_command(
            &mut buf,
            &seq,
            CommandCode::Configure,
            ConfigParam::BatchSize as u8,
            501,
        )
        .unwrap();
        process_packet(&f.ctx, &buf[..len], sender());

        assert_eq!(f.ctx.state.batch_size.load(Ordering::Relaxed), 250);
        assert_eq!(f.stack.sent_count(), 0);
    }

    #[test]
    fn test_configure_unknown_param_ignored() {
        let f = fixture();

        let mut buf = [0u8; 16];
        let seq = protocol::Sequencer::new();
        let len =
            protocol::build_command(&mut buf, &seq, CommandCode::Configure, 99, 1).unwrap();
        process_packet(&f.ctx, &buf[..len], sender());

        assert_eq!(f.stack.sent_count(), 0);
    }

    #[test]
    fn test_invalid_packet_counted_and_dropped() {
        let f = fixture();

        process_packet(&f.ctx, &[0xEF, 0xBE, 0x01, 0x00, 0x00, 0x00, 0x00], sender());

        assert_eq!(f.ctx.state.net_stats.errors.load(Ordering::Relaxed), 1);
        assert_eq!(f.stack.sent_count(), 0);
    }

    #[test]
    fn test_set_target_override() {
        let f = fixture();

        f.ctx.handle.set_target("10.1.2.3", 7000).unwrap();
        assert_eq!(
            f.ctx.state.target(),
            Some(SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 7000))
        );

        assert!(f.ctx.handle.set_target("256.0.0.1", 7000).is_err());
        assert!(f.ctx.handle.set_target("not-an-address", 7000).is_err());
    }

    #[test]
    fn test_wait_for_link_timeout() {
        let f = fixture();
        f.link.notify(LinkEvent::Down);

        let running = AtomicBool::new(true);
        let start = Instant::now();
        assert!(!wait_for_link(
            &f.pool,
            &running,
            Duration::from_millis(20)
        ));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_wait_for_ip() {
        let f = fixture();
        let running = AtomicBool::new(true);

        f.stack.set_local_ip(None);
        assert!(!wait_for_ip(&f.pool, &running, Duration::from_millis(20)));

        f.stack.set_local_ip(Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert!(wait_for_ip(&f.pool, &running, Duration::from_millis(20)));
    }
}
