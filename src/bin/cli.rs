//! Control client for a Bindu acquisition node
//!
//! Sends the UDP command set (start/stop/status/configure/ping) and receives
//! streamed data packets. Received samples go to stdout as CSV lines so the
//! output can be piped to other tools; logs go to stderr.

use bindu::error::{Error, Result};
use bindu::net::protocol::{
    self, CommandCode, ConfigParam, DataView, MsgType, Sequencer, StatusPayload,
};
use bindu::state::{ADC_MAX_VALUE, ADC_VREF_MV};
use clap::{Parser, Subcommand};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about = "Control client for a Bindu acquisition node", long_about = None)]
struct Args {
    /// Device IP address
    #[arg(long, default_value = "192.168.1.100")]
    host: String,

    /// Device UDP port
    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// Local UDP port to bind
    #[arg(long, default_value_t = 5001)]
    local_port: u16,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ping the device and measure round-trip time
    Ping {
        /// Number of pings to send
        #[arg(short, long, default_value_t = 4)]
        count: u32,
    },
    /// Configure, start acquisition, and stream received data
    Start {
        /// Threshold in millivolts (0-3300)
        #[arg(long)]
        threshold_mv: Option<u16>,
        /// Threshold as a percentage (0-100)
        #[arg(long, conflicts_with = "threshold_mv")]
        threshold_percent: Option<u16>,
        /// Samples per data packet (1-500)
        #[arg(long)]
        batch_size: Option<u16>,
        /// ADC channel (0-7)
        #[arg(long)]
        channel: Option<u16>,
        /// Device log level (0=DEBUG .. 5=NONE)
        #[arg(long)]
        log_level: Option<u16>,
        /// Reset the device sequence counter first
        #[arg(long)]
        reset_sequence: bool,
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
        /// Stop after this many samples
        #[arg(long)]
        samples: Option<u64>,
    },
    /// Stop acquisition
    Stop,
    /// Query device status
    Status,
    /// Apply a single configuration parameter
    Configure {
        #[arg(long)]
        threshold_mv: Option<u16>,
        #[arg(long, conflicts_with = "threshold_mv")]
        threshold_percent: Option<u16>,
        #[arg(long)]
        batch_size: Option<u16>,
        #[arg(long)]
        channel: Option<u16>,
        #[arg(long)]
        log_level: Option<u16>,
        #[arg(long)]
        reset_sequence: bool,
    },
    /// Receive data packets without sending commands
    Listen {
        #[arg(long)]
        duration: Option<u64>,
        #[arg(long)]
        samples: Option<u64>,
    },
}

/// Session statistics printed at the end of a receive loop
#[derive(Debug, Default)]
struct Statistics {
    packets_received: u64,
    samples_received: u64,
    bytes_received: u64,
}

impl Statistics {
    fn print_summary(&self, elapsed: Duration) {
        let rate = if elapsed.as_secs_f64() > 0.0 {
            self.samples_received as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        eprintln!("{}", "=".repeat(60));
        eprintln!("Session Statistics");
        eprintln!("  Duration:         {:.2} s", elapsed.as_secs_f64());
        eprintln!("  Packets received: {}", self.packets_received);
        eprintln!("  Samples received: {}", self.samples_received);
        eprintln!("  Bytes received:   {}", self.bytes_received);
        eprintln!("  Sample rate:      {:.1} samples/s", rate);
        eprintln!("{}", "=".repeat(60));
    }
}

/// UDP client for the acquisition node
struct Client {
    socket: UdpSocket,
    target: SocketAddr,
    seq: Sequencer,
    stats: Statistics,
}

impl Client {
    fn new(host: &str, port: u16, local_port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", local_port))?;
        socket.set_read_timeout(Some(Duration::from_secs(1)))?;

        let target: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid host: {}", host)))?;

        log::info!("Client bound to port {}, target {}", local_port, target);

        Ok(Self {
            socket,
            target,
            seq: Sequencer::new(),
            stats: Statistics::default(),
        })
    }

    fn send_command(&self, cmd: CommandCode, param_type: u8, param: u16) -> Result<()> {
        let mut buf = [0u8; protocol::HEADER_SIZE + protocol::CMD_PAYLOAD_SIZE];
        let len = protocol::build_command(&mut buf, &self.seq, cmd, param_type, param)?;
        self.socket.send_to(&buf[..len], self.target)?;
        log::debug!(
            "Sent command 0x{:02X} (param_type={}, param={})",
            cmd as u8,
            param_type,
            param
        );
        Ok(())
    }

    fn ping(&self) -> Result<Option<Duration>> {
        let mut buf = [0u8; protocol::HEADER_SIZE];
        let len = protocol::build_ping(&mut buf, &self.seq)?;

        let start = Instant::now();
        self.socket.send_to(&buf[..len], self.target)?;

        let mut rx = [0u8; 2048];
        match self.socket.recv_from(&mut rx) {
            Ok((n, _)) => {
                let (header, _) = protocol::parse_packet(&rx[..n])?;
                if header.msg_type == MsgType::Pong as u8 {
                    Ok(Some(start.elapsed()))
                } else {
                    Ok(None)
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get_status(&self) -> Result<Option<StatusPayload>> {
        self.send_command(CommandCode::GetStatus, 0, 0)?;

        let mut rx = [0u8; 2048];
        match self.socket.recv_from(&mut rx) {
            Ok((n, _)) => {
                let (header, payload) = protocol::parse_packet(&rx[..n])?;
                if header.msg_type == MsgType::Status as u8 {
                    Ok(Some(StatusPayload::parse(payload)?))
                } else {
                    Ok(None)
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                log::warn!("Status request timed out");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Receive data packets until duration/sample limits or Ctrl-C
    ///
    /// Each data packet becomes one CSV line on stdout:
    /// `sequence,channel,sample0,sample1,...`
    fn receive_loop(&mut self, duration: Option<u64>, max_samples: Option<u64>) -> Result<()> {
        let running = Arc::new(AtomicBool::new(true));
        let r = Arc::clone(&running);
        let _ = ctrlc::set_handler(move || r.store(false, Ordering::Relaxed));

        let start = Instant::now();
        let deadline = duration.map(|s| start + Duration::from_secs(s));
        let mut rx = [0u8; 2048];

        log::info!("Receiving (Ctrl-C to stop)");

        while running.load(Ordering::Relaxed) {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            if max_samples.is_some_and(|max| self.stats.samples_received >= max) {
                break;
            }

            let (n, addr) = match self.socket.recv_from(&mut rx) {
                Ok(received) => received,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let (header, payload) = match protocol::parse_packet(&rx[..n]) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::warn!("Invalid packet from {}: {}", addr, e);
                    continue;
                }
            };

            if header.msg_type != MsgType::Data as u8 {
                log::debug!("Ignoring message type 0x{:02X}", header.msg_type);
                continue;
            }

            let view = match DataView::parse(payload) {
                Ok(view) => view,
                Err(e) => {
                    log::warn!("Bad data payload: {}", e);
                    continue;
                }
            };

            self.stats.packets_received += 1;
            self.stats.samples_received += view.sample_count as u64;
            self.stats.bytes_received += n as u64;

            let mut line = format!("{},{}", header.sequence, view.channel);
            for sample in view.samples() {
                line.push(',');
                line.push_str(&sample.to_string());
            }
            println!("{}", line);

            if log::log_enabled!(log::Level::Debug) && view.sample_count > 0 {
                let sum: u64 = view.samples().map(u64::from).sum();
                let avg = sum as f64 / view.sample_count as f64;
                let mv = avg / ADC_MAX_VALUE as f64 * ADC_VREF_MV as f64;
                log::debug!(
                    "[{:5}] CH{}: {} samples, avg={:.1} ({:.0} mV)",
                    header.sequence,
                    view.channel,
                    view.sample_count,
                    avg,
                    mv
                );
            }
        }

        self.stats.print_summary(start.elapsed());
        Ok(())
    }

    /// Apply the optional configuration flags shared by `start` and
    /// `configure`, with a short settle delay between commands
    #[allow(clippy::too_many_arguments)]
    fn apply_configuration(
        &self,
        threshold_mv: Option<u16>,
        threshold_percent: Option<u16>,
        batch_size: Option<u16>,
        channel: Option<u16>,
        log_level: Option<u16>,
        reset_sequence: bool,
    ) -> Result<()> {
        const SETTLE: Duration = Duration::from_millis(100);

        if reset_sequence {
            self.send_command(CommandCode::Configure, ConfigParam::ResetSequence as u8, 0)?;
            std::thread::sleep(SETTLE);
        }
        if let Some(level) = log_level {
            self.send_command(CommandCode::Configure, ConfigParam::LogLevel as u8, level)?;
            std::thread::sleep(SETTLE);
        }
        if let Some(size) = batch_size {
            self.send_command(CommandCode::Configure, ConfigParam::BatchSize as u8, size)?;
            std::thread::sleep(SETTLE);
        }
        if let Some(mv) = threshold_mv {
            self.send_command(CommandCode::Configure, ConfigParam::ThresholdMv as u8, mv)?;
            std::thread::sleep(SETTLE);
        } else if let Some(percent) = threshold_percent {
            self.send_command(
                CommandCode::Configure,
                ConfigParam::ThresholdPercent as u8,
                percent,
            )?;
            std::thread::sleep(SETTLE);
        }
        if let Some(ch) = channel {
            self.send_command(CommandCode::Configure, ConfigParam::Channel as u8, ch)?;
            std::thread::sleep(SETTLE);
        }

        Ok(())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let mut client = Client::new(&args.host, args.port, args.local_port)?;

    match args.command {
        Command::Ping { count } => {
            for i in 0..count {
                match client.ping()? {
                    Some(rtt) => println!(
                        "Pong from {}: time={:.2} ms",
                        args.host,
                        rtt.as_secs_f64() * 1000.0
                    ),
                    None => println!("Request timed out"),
                }
                if i + 1 < count {
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        }
        Command::Start {
            threshold_mv,
            threshold_percent,
            batch_size,
            channel,
            log_level,
            reset_sequence,
            duration,
            samples,
        } => {
            client.apply_configuration(
                threshold_mv,
                threshold_percent,
                batch_size,
                channel,
                log_level,
                reset_sequence,
            )?;

            client.send_command(CommandCode::StartAcq, 0, 0)?;
            log::info!("Sent START_ACQ");
            std::thread::sleep(Duration::from_millis(100));

            let result = client.receive_loop(duration, samples);

            // Always try to stop the device on the way out
            let _ = client.send_command(CommandCode::StopAcq, 0, 0);
            result?;
        }
        Command::Stop => {
            client.send_command(CommandCode::StopAcq, 0, 0)?;
            log::info!("Stop command sent");
        }
        Command::Status => match client.get_status()? {
            Some(status) => {
                println!("Acquiring:    {}", status.acquiring);
                println!("Channel:      {}", status.channel);
                println!("Threshold:    {} mV", status.threshold_mv);
                println!("Uptime:       {} s", status.uptime);
                println!("Samples sent: {}", status.samples_sent);
            }
            None => {
                log::error!("Failed to get status");
                std::process::exit(1);
            }
        },
        Command::Configure {
            threshold_mv,
            threshold_percent,
            batch_size,
            channel,
            log_level,
            reset_sequence,
        } => {
            client.apply_configuration(
                threshold_mv,
                threshold_percent,
                batch_size,
                channel,
                log_level,
                reset_sequence,
            )?;
            log::info!("Configuration sent");
        }
        Command::Listen { duration, samples } => {
            client.receive_loop(duration, samples)?;
        }
    }

    Ok(())
}
