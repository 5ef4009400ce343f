//! Acquisition task: threshold-gated sampling and batch transmission
//!
//! One iteration per millisecond while running: read a sample, compare it
//! against the threshold, append qualifying samples to the batch, and flush
//! a full batch as a single data packet addressed to the current transmit
//! target. When idle, or while the network is not ready, the loop backs off
//! to a 100 ms poll, so a STOP command takes effect within a millisecond
//! when running and within ~100 ms when waiting.
//!
//! Configuration writes arrive from the network task: scalar changes are
//! plain atomic stores; batch-size and channel changes additionally bump the
//! config epoch, which the loop observes to discard its in-progress batch.
//! A channel change tears the ADC down and re-initializes it on the new
//! channel; if that fails the task enters the Error state and stops sampling
//! until a START brings it back.

use crate::adc::AdcDriver;
use crate::error::{Error, Result};
use crate::net::protocol::{self, HEADER_SIZE, MAX_DATA_PAYLOAD};
use crate::state::{
    AcqState, NodeState, ADC_CHANNEL_COUNT, ADC_MAX_VALUE, ADC_VREF_MV, MAX_BATCH_SIZE,
};
use crate::tasks::network::NetHandle;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Sampling cadence while running
const LOOP_DELAY: Duration = Duration::from_millis(1);
/// Poll interval while idle or waiting for the network
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Convert a millivolt threshold to the equivalent 12-bit ADC value
pub fn mv_to_adc(mv: u16) -> u16 {
    (mv as u32 * ADC_MAX_VALUE as u32 / ADC_VREF_MV as u32) as u16
}

/// Control surface of the acquisition subsystem
///
/// Cheap to clone; the network task holds a clone to apply commands while
/// the loop thread samples.
#[derive(Clone)]
pub struct Acquisition {
    state: Arc<NodeState>,
    adc: Arc<Mutex<Box<dyn AdcDriver>>>,
}

impl Acquisition {
    /// Wrap the ADC and initialize it on the configured channel
    pub fn new(state: Arc<NodeState>, mut adc: Box<dyn AdcDriver>) -> Result<Self> {
        let channel = state.channel.load(Ordering::Relaxed);
        adc.init(channel)?;
        log::info!("Acquisition initialized on channel {}", channel);

        Ok(Self {
            state,
            adc: Arc::new(Mutex::new(adc)),
        })
    }

    /// Begin sampling; discards any previous partial batch
    pub fn start(&self) {
        if self.state.acq_state() == AcqState::Running {
            return;
        }
        self.state.bump_config_epoch();
        self.state.set_acq_state(AcqState::Running);
        log::info!(
            "Acquisition started on channel {}, threshold {} mV",
            self.state.channel.load(Ordering::Relaxed),
            self.state.threshold_mv.load(Ordering::Relaxed)
        );
    }

    pub fn stop(&self) {
        self.state.set_acq_state(AcqState::Idle);
        log::info!("Acquisition stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state.acq_state() == AcqState::Running
    }

    pub fn set_threshold_mv(&self, mv: u16) -> Result<()> {
        if mv > ADC_VREF_MV {
            return Err(Error::InvalidArgument(format!(
                "threshold {} mV above reference {}",
                mv, ADC_VREF_MV
            )));
        }
        self.state.threshold_mv.store(mv, Ordering::Relaxed);
        log::debug!("Threshold set to {} mV", mv);
        Ok(())
    }

    pub fn set_threshold_percent(&self, percent: u16) -> Result<()> {
        if percent > 100 {
            return Err(Error::InvalidArgument(format!(
                "threshold {}% above 100",
                percent
            )));
        }
        let mv = (percent as u32 * ADC_VREF_MV as u32 / 100) as u16;
        self.state.threshold_mv.store(mv, Ordering::Relaxed);
        log::debug!("Threshold set to {}% ({} mV)", percent, mv);
        Ok(())
    }

    /// Change the batch size; the in-progress batch is discarded
    pub fn set_batch_size(&self, size: u16) -> Result<()> {
        if size == 0 || size > MAX_BATCH_SIZE {
            return Err(Error::InvalidArgument(format!(
                "batch size {} outside 1-{}",
                size, MAX_BATCH_SIZE
            )));
        }
        self.state.batch_size.store(size, Ordering::Relaxed);
        self.state.bump_config_epoch();
        log::debug!("Batch size set to {} samples", size);
        Ok(())
    }

    /// Switch the ADC channel, re-initializing the converter
    ///
    /// On re-init failure the acquisition state goes to Error and sampling
    /// halts until the next START.
    pub fn set_channel(&self, channel: u16) -> Result<()> {
        if channel >= ADC_CHANNEL_COUNT as u16 {
            return Err(Error::InvalidArgument(format!(
                "channel {} outside 0-{}",
                channel,
                ADC_CHANNEL_COUNT - 1
            )));
        }
        let channel = channel as u8;
        if channel == self.state.channel.load(Ordering::Relaxed) {
            return Ok(());
        }

        // The ADC lock pauses the sampling loop for the duration of the
        // re-initialization.
        let mut adc = self.adc.lock();
        adc.deinit()?;
        if let Err(e) = adc.init(channel) {
            log::error!("Failed to switch to channel {}: {}", channel, e);
            self.state.set_acq_state(AcqState::Error);
            return Err(e);
        }

        self.state.channel.store(channel, Ordering::Relaxed);
        self.state.bump_config_epoch();
        log::info!("ADC channel set to {}", channel);
        Ok(())
    }

    /// Spawn the sampling loop thread
    pub fn spawn(
        &self,
        net: NetHandle,
        running: Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let state = Arc::clone(&self.state);
        let adc = Arc::clone(&self.adc);
        thread::Builder::new()
            .name("acq-task".to_string())
            .spawn(move || acquisition_loop(state, adc, net, running))
    }
}

fn acquisition_loop(
    state: Arc<NodeState>,
    adc: Arc<Mutex<Box<dyn AdcDriver>>>,
    net: NetHandle,
    running: Arc<AtomicBool>,
) {
    log::info!("Acquisition task running");

    let mut batch: Vec<u16> = Vec::with_capacity(MAX_BATCH_SIZE as usize);
    let mut epoch = state.config_epoch.load(Ordering::Relaxed);
    let mut tx_buf = vec![0u8; HEADER_SIZE + MAX_DATA_PAYLOAD];

    while running.load(Ordering::Relaxed) {
        if state.acq_state() != AcqState::Running {
            thread::sleep(IDLE_POLL);
            continue;
        }

        if !net.is_ready() {
            thread::sleep(IDLE_POLL);
            continue;
        }

        // A batch-size or channel change invalidates the partial batch
        let current_epoch = state.config_epoch.load(Ordering::Relaxed);
        if current_epoch != epoch {
            batch.clear();
            epoch = current_epoch;
        }

        sample_once(&state, &adc, &net, &mut batch, &mut tx_buf);
        thread::sleep(LOOP_DELAY);
    }

    log::info!("Acquisition task exiting");
}

/// One sampling iteration: read, gate, batch, flush when full
fn sample_once(
    state: &NodeState,
    adc: &Mutex<Box<dyn AdcDriver>>,
    net: &NetHandle,
    batch: &mut Vec<u16>,
    tx_buf: &mut [u8],
) {
    let value = match adc.lock().read_sync() {
        Ok(v) => v,
        Err(e) => {
            log::debug!("ADC read failed: {}", e);
            state.acq_stats.errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let threshold_adc = mv_to_adc(state.threshold_mv.load(Ordering::Relaxed));
    if value < threshold_adc {
        return;
    }

    batch.push(value);
    state
        .acq_stats
        .samples_collected
        .fetch_add(1, Ordering::Relaxed);

    let batch_size = state.batch_size.load(Ordering::Relaxed) as usize;
    if batch.len() >= batch_size {
        flush_batch(state, net, batch, tx_buf);
    }
}

/// Build and send the batch as one data packet; the batch empties regardless
fn flush_batch(state: &NodeState, net: &NetHandle, batch: &mut Vec<u16>, tx_buf: &mut [u8]) {
    let channel = state.channel.load(Ordering::Relaxed);

    match protocol::build_data(tx_buf, &state.sequencer, channel, batch) {
        Ok(len) => match net.send_raw(&tx_buf[..len]) {
            Ok(()) => {
                state.acq_stats.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::warn!("Failed to send data packet: {}", e);
                state.acq_stats.errors.fetch_add(1, Ordering::Relaxed);
            }
        },
        Err(e) => {
            log::error!("Failed to build data packet: {}", e);
            state.acq_stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adc::SimAdc;
    use crate::config::Config;
    use crate::net::protocol::DataView;
    use crate::net::sim::{SendFailure, SimStack};
    use crate::net::socket::SocketPool;
    use crate::net::stack::{LinkEvent, LinkState, NetStack};
    use crate::state::NetState;
    use std::net::{Ipv4Addr, SocketAddrV4};

    struct Fixture {
        stack: Arc<SimStack>,
        link: Arc<LinkState>,
        state: Arc<NodeState>,
        net: NetHandle,
        adc: Arc<Mutex<Box<dyn AdcDriver>>>,
        acquisition: Acquisition,
    }

    fn make(samples: &[u16], with_target: bool) -> Fixture {
        let stack = SimStack::new();
        let link = LinkState::new();
        link.notify(LinkEvent::Up);

        let pool = SocketPool::new(Arc::clone(&stack) as Arc<dyn NetStack>, Arc::clone(&link));
        let state = Arc::new(NodeState::new(&Config::default()));
        let acquisition =
            Acquisition::new(Arc::clone(&state), Box::new(SimAdc::scripted(samples))).unwrap();

        let net = NetHandle::new(Arc::clone(&state), Arc::clone(&pool));
        let socket = pool.create(5000).unwrap();
        net.bind_socket(socket);
        state.set_net_state(NetState::Ready);
        if with_target {
            state.set_target(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 50), 40000));
        }

        let adc = Arc::clone(&acquisition.adc);
        Fixture {
            stack,
            link,
            state,
            net,
            adc,
            acquisition,
        }
    }

    fn fixture(samples: &[u16]) -> Fixture {
        make(samples, true)
    }

    fn drive(f: &Fixture, iterations: usize) {
        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE as usize);
        let mut tx_buf = vec![0u8; HEADER_SIZE + MAX_DATA_PAYLOAD];
        for _ in 0..iterations {
            sample_once(&f.state, &f.adc, &f.net, &mut batch, &mut tx_buf);
        }
    }

    #[test]
    fn test_mv_to_adc_boundaries() {
        assert_eq!(mv_to_adc(0), 0);
        assert_eq!(mv_to_adc(1650), 2047);
        assert_eq!(mv_to_adc(3300), 4095);
    }

    #[test]
    fn test_threshold_gating_and_batch_flush() {
        // Threshold 1650 mV = 2047 counts; batch of 3.
        // {100, 2500, 3000, 4000, 500, 2100}: 2500/3000/4000 fill the batch,
        // 500 is gated out, 2100 starts the next batch.
        let f = fixture(&[100, 2500, 3000, 4000, 500, 2100]);
        f.acquisition.set_batch_size(3).unwrap();

        drive(&f, 6);

        let sent = f.stack.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload.len(), 17);
        assert_eq!(
            sent[0].remote,
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 50), 40000)
        );

        let (header, payload) = protocol::parse_packet(&sent[0].payload).unwrap();
        assert_eq!(header.payload_len, 10);

        let view = DataView::parse(payload).unwrap();
        assert_eq!(view.channel, 0);
        assert_eq!(view.sample_count, 3);
        assert_eq!(view.samples().collect::<Vec<_>>(), vec![2500, 3000, 4000]);

        // 2100 >= 2047 qualified but has not flushed
        assert_eq!(
            f.state.acq_stats.samples_collected.load(Ordering::Relaxed),
            4
        );
        assert_eq!(f.state.acq_stats.packets_sent.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_no_subthreshold_sample_transmitted() {
        let f = fixture(&[2047, 2046, 3000, 100, 4095, 0]);
        f.acquisition.set_batch_size(3).unwrap();

        drive(&f, 6);

        let sent = f.stack.take_sent();
        assert_eq!(sent.len(), 1);
        let (_, payload) = protocol::parse_packet(&sent[0].payload).unwrap();
        let view = DataView::parse(payload).unwrap();
        let threshold_adc = mv_to_adc(1650);
        assert!(view.samples().all(|s| s >= threshold_adc));
    }

    #[test]
    fn test_adc_failure_counts_error() {
        // Script runs dry after two reads; further reads report Busy
        let f = fixture(&[3000, 3000]);
        f.acquisition.set_batch_size(10).unwrap();

        drive(&f, 5);

        assert_eq!(f.state.acq_stats.errors.load(Ordering::Relaxed), 3);
        assert_eq!(
            f.state.acq_stats.samples_collected.load(Ordering::Relaxed),
            2
        );
    }

    #[test]
    fn test_send_failure_counts_error_and_clears_batch() {
        let f = fixture(&[3000, 3100, 3200, 3300]);
        f.acquisition.set_batch_size(2).unwrap();
        f.stack.set_send_failure(Some(SendFailure::NetError));

        drive(&f, 4);

        // Two full batches, both failed, both discarded
        assert_eq!(f.state.acq_stats.errors.load(Ordering::Relaxed), 2);
        assert_eq!(f.state.acq_stats.packets_sent.load(Ordering::Relaxed), 0);

        // Recovery: the next batch goes out whole
        f.stack.set_send_failure(None);
        let mut batch = Vec::new();
        let mut tx_buf = vec![0u8; HEADER_SIZE + MAX_DATA_PAYLOAD];
        let samples = [3000u16, 3100];
        {
            let mut adc = f.adc.lock();
            *adc = Box::new(SimAdc::scripted(&samples));
        }
        for _ in 0..2 {
            sample_once(&f.state, &f.adc, &f.net, &mut batch, &mut tx_buf);
        }
        assert_eq!(f.stack.take_sent().len(), 1);
    }

    #[test]
    fn test_threshold_validation() {
        let f = fixture(&[]);
        assert!(f.acquisition.set_threshold_percent(0).is_ok());
        assert_eq!(f.state.threshold_mv.load(Ordering::Relaxed), 0);

        assert!(f.acquisition.set_threshold_percent(100).is_ok());
        assert_eq!(f.state.threshold_mv.load(Ordering::Relaxed), 3300);

        assert!(f.acquisition.set_threshold_percent(101).is_err());
        assert!(f.acquisition.set_threshold_mv(3301).is_err());
        assert!(f.acquisition.set_threshold_mv(1650).is_ok());
    }

    #[test]
    fn test_batch_size_validation() {
        let f = fixture(&[]);
        assert!(f.acquisition.set_batch_size(0).is_err());
        assert!(f.acquisition.set_batch_size(501).is_err());
        assert!(f.acquisition.set_batch_size(1).is_ok());
        assert!(f.acquisition.set_batch_size(500).is_ok());
    }

    #[test]
    fn test_batch_size_change_bumps_epoch() {
        let f = fixture(&[]);
        let before = f.state.config_epoch.load(Ordering::Relaxed);
        f.acquisition.set_batch_size(50).unwrap();
        assert!(f.state.config_epoch.load(Ordering::Relaxed) > before);
    }

    #[test]
    fn test_channel_change_reinitializes() {
        let f = fixture(&[]);
        f.acquisition.set_channel(5).unwrap();
        assert_eq!(f.state.channel.load(Ordering::Relaxed), 5);

        assert!(f.acquisition.set_channel(8).is_err());
        assert_eq!(f.state.channel.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn test_start_stop_transitions() {
        let f = fixture(&[]);
        assert_eq!(f.state.acq_state(), AcqState::Idle);

        f.acquisition.start();
        assert!(f.acquisition.is_running());

        // Redundant start is a no-op
        f.acquisition.start();
        assert!(f.acquisition.is_running());

        f.acquisition.stop();
        assert_eq!(f.state.acq_state(), AcqState::Idle);
    }

    #[test]
    fn test_link_down_send_counts_one_error() {
        let f = fixture(&[3000]);
        f.acquisition.set_batch_size(1).unwrap();
        f.link.notify(LinkEvent::Down);

        drive(&f, 1);

        assert_eq!(f.state.acq_stats.errors.load(Ordering::Relaxed), 1);
        assert_eq!(f.state.acq_stats.packets_sent.load(Ordering::Relaxed), 0);
        assert_eq!(f.stack.sent_count(), 0);
    }

    #[test]
    fn test_send_without_target_is_error() {
        let f = make(&[3000], false);
        f.acquisition.set_batch_size(1).unwrap();

        drive(&f, 1);

        assert_eq!(f.state.acq_stats.errors.load(Ordering::Relaxed), 1);
        assert_eq!(f.stack.sent_count(), 0);
    }
}
