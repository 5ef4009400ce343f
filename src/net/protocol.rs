//! Application layer protocol for data acquisition over UDP
//!
//! Packet format, little-endian throughout:
//!
//! ```text
//! HEADER (7 bytes)
//! +--------+--------+--------+--------+--------+--------+--------+
//! |    MAGIC (2B)   |MSG_TYPE| SEQUENCE (2B)   |PAYLOAD_LEN (2B) |
//! |  0x7A  |  0xDA  |  type  | seq_lo | seq_hi | len_lo | len_hi |
//! +--------+--------+--------+--------+--------+--------+--------+
//!
//! DATA payload (MSG_TYPE = 0x10)
//! | channel | reserved | sample_count (2B) | samples[] (2B each, LE) |
//!
//! COMMAND payload (MSG_TYPE = 0x20)
//! | cmd | param_type | param (2B) |
//!
//! STATUS payload (MSG_TYPE = 0x30)
//! | acquiring | channel | threshold_mv (2B) | uptime (4B) | samples_sent (4B) |
//!
//! PING / PONG (MSG_TYPE = 0x01 / 0x02): empty payload
//! ```
//!
//! Builders write into a caller-supplied buffer and return the packet length;
//! the shared sequence counter advances exactly once per successfully built
//! packet and never on failure. Parsing validates framing only (length,
//! magic, declared payload length) and returns a borrowed view of the
//! payload; interpreting payload contents is the dispatcher's job. Trailing
//! bytes beyond the declared payload length are ignored.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU16, Ordering};

/// Protocol magic number for packet identification
pub const MAGIC: u16 = 0xDA7A;
/// Wire size of the packet header
pub const HEADER_SIZE: usize = 7;
/// Maximum data payload size in bytes
pub const MAX_DATA_PAYLOAD: usize = 1400;
/// Fixed prefix of the data payload before the sample array
const DATA_PREFIX: usize = 4;
/// Maximum samples that fit a data packet: (1400 - 4) / 2
pub const MAX_SAMPLES_PER_PACKET: usize = (MAX_DATA_PAYLOAD - DATA_PREFIX) / 2;
/// Wire size of the command payload
pub const CMD_PAYLOAD_SIZE: usize = 4;
/// Wire size of the status payload
pub const STATUS_PAYLOAD_SIZE: usize = 12;

/// Protocol message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Ping = 0x01,
    Pong = 0x02,
    Data = 0x10,
    Cmd = 0x20,
    Status = 0x30,
}

impl TryFrom<u8> for MsgType {
    type Error = u8;

    fn try_from(v: u8) -> std::result::Result<Self, u8> {
        match v {
            0x01 => Ok(MsgType::Ping),
            0x02 => Ok(MsgType::Pong),
            0x10 => Ok(MsgType::Data),
            0x20 => Ok(MsgType::Cmd),
            0x30 => Ok(MsgType::Status),
            other => Err(other),
        }
    }
}

/// Command codes carried in a command payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandCode {
    StartAcq = 0x01,
    StopAcq = 0x02,
    GetStatus = 0x03,
    Configure = 0x04,
}

impl TryFrom<u8> for CommandCode {
    type Error = u8;

    fn try_from(v: u8) -> std::result::Result<Self, u8> {
        match v {
            0x01 => Ok(CommandCode::StartAcq),
            0x02 => Ok(CommandCode::StopAcq),
            0x03 => Ok(CommandCode::GetStatus),
            0x04 => Ok(CommandCode::Configure),
            other => Err(other),
        }
    }
}

/// Configuration parameter tags for CONFIGURE commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfigParam {
    /// Threshold as a percentage of full scale (0-100)
    ThresholdPercent = 0,
    /// Threshold in millivolts (0-3300)
    ThresholdMv = 1,
    /// Samples per data packet (1-500)
    BatchSize = 2,
    /// ADC channel (0-7)
    Channel = 3,
    /// Reset the sequence counter (param ignored)
    ResetSequence = 4,
    /// Log level (0=Debug .. 5=None)
    LogLevel = 5,
}

impl TryFrom<u8> for ConfigParam {
    type Error = u8;

    fn try_from(v: u8) -> std::result::Result<Self, u8> {
        match v {
            0 => Ok(ConfigParam::ThresholdPercent),
            1 => Ok(ConfigParam::ThresholdMv),
            2 => Ok(ConfigParam::BatchSize),
            3 => Ok(ConfigParam::Channel),
            4 => Ok(ConfigParam::ResetSequence),
            5 => Ok(ConfigParam::LogLevel),
            other => Err(other),
        }
    }
}

/// Parsed packet header
///
/// `msg_type` is kept raw so the dispatcher can log unknown types instead of
/// the parser rejecting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u16,
    pub msg_type: u8,
    pub sequence: u16,
    pub payload_len: u16,
}

/// Shared outbound sequence counter
///
/// Wraps at 65536. Packets are built from both task threads (data bursts on
/// the acquisition thread, replies on the network thread), so the counter is
/// atomic.
#[derive(Debug, Default)]
pub struct Sequencer(AtomicU16);

impl Sequencer {
    pub fn new() -> Self {
        Self(AtomicU16::new(0))
    }

    /// Claim the next sequence number, advancing the counter
    fn advance(&self) -> u16 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Peek at the next sequence number without advancing
    pub fn current(&self) -> u16 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
        log::debug!("Sequence counter reset");
    }
}

/// Typed view of a command payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPayload {
    pub cmd: u8,
    pub param_type: u8,
    pub param: u16,
}

impl CommandPayload {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < CMD_PAYLOAD_SIZE {
            return Err(Error::InvalidMessage(format!(
                "command payload too short: {} bytes",
                payload.len()
            )));
        }
        Ok(Self {
            cmd: payload[0],
            param_type: payload[1],
            param: u16::from_le_bytes([payload[2], payload[3]]),
        })
    }
}

/// Typed view of a status payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusPayload {
    pub acquiring: bool,
    pub channel: u8,
    pub threshold_mv: u16,
    pub uptime: u32,
    pub samples_sent: u32,
}

impl StatusPayload {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < STATUS_PAYLOAD_SIZE {
            return Err(Error::InvalidMessage(format!(
                "status payload too short: {} bytes",
                payload.len()
            )));
        }
        Ok(Self {
            acquiring: payload[0] != 0,
            channel: payload[1],
            threshold_mv: u16::from_le_bytes([payload[2], payload[3]]),
            uptime: u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]),
            samples_sent: u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]),
        })
    }
}

/// Typed view of a data payload (borrowed, samples decoded on demand)
#[derive(Debug, Clone, Copy)]
pub struct DataView<'a> {
    pub channel: u8,
    pub sample_count: u16,
    samples: &'a [u8],
}

impl<'a> DataView<'a> {
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        if payload.len() < DATA_PREFIX {
            return Err(Error::InvalidMessage(format!(
                "data payload too short: {} bytes",
                payload.len()
            )));
        }
        let sample_count = u16::from_le_bytes([payload[2], payload[3]]);
        let needed = DATA_PREFIX + sample_count as usize * 2;
        if payload.len() < needed {
            return Err(Error::InvalidMessage(format!(
                "data payload truncated: {} samples declared, {} bytes present",
                sample_count,
                payload.len()
            )));
        }
        Ok(Self {
            channel: payload[0],
            sample_count,
            samples: &payload[DATA_PREFIX..needed],
        })
    }

    pub fn samples(&self) -> impl Iterator<Item = u16> + '_ {
        self.samples
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
    }
}

// ============================================================================
// Builders
// ============================================================================

fn write_header(buf: &mut [u8], msg_type: MsgType, sequence: u16, payload_len: u16) {
    buf[0..2].copy_from_slice(&MAGIC.to_le_bytes());
    buf[2] = msg_type as u8;
    buf[3..5].copy_from_slice(&sequence.to_le_bytes());
    buf[5..7].copy_from_slice(&payload_len.to_le_bytes());
}

fn check_capacity(buf: &[u8], needed: usize) -> Result<()> {
    if buf.len() < needed {
        return Err(Error::BufferTooSmall {
            needed,
            have: buf.len(),
        });
    }
    Ok(())
}

/// Build a ping packet, returning its length
pub fn build_ping(buf: &mut [u8], seq: &Sequencer) -> Result<usize> {
    check_capacity(buf, HEADER_SIZE)?;
    write_header(buf, MsgType::Ping, seq.advance(), 0);
    Ok(HEADER_SIZE)
}

/// Build a pong response packet, returning its length
pub fn build_pong(buf: &mut [u8], seq: &Sequencer) -> Result<usize> {
    check_capacity(buf, HEADER_SIZE)?;
    write_header(buf, MsgType::Pong, seq.advance(), 0);
    Ok(HEADER_SIZE)
}

/// Build a data packet carrying ADC samples, returning its length
pub fn build_data(buf: &mut [u8], seq: &Sequencer, channel: u8, samples: &[u16]) -> Result<usize> {
    if samples.len() > MAX_SAMPLES_PER_PACKET {
        return Err(Error::InvalidArgument(format!(
            "sample count {} exceeds {} per packet",
            samples.len(),
            MAX_SAMPLES_PER_PACKET
        )));
    }

    let payload_len = DATA_PREFIX + samples.len() * 2;
    let total = HEADER_SIZE + payload_len;
    check_capacity(buf, total)?;

    write_header(buf, MsgType::Data, seq.advance(), payload_len as u16);
    buf[HEADER_SIZE] = channel;
    buf[HEADER_SIZE + 1] = 0; // reserved
    buf[HEADER_SIZE + 2..HEADER_SIZE + 4]
        .copy_from_slice(&(samples.len() as u16).to_le_bytes());

    let mut offset = HEADER_SIZE + DATA_PREFIX;
    for sample in samples {
        buf[offset..offset + 2].copy_from_slice(&sample.to_le_bytes());
        offset += 2;
    }

    Ok(total)
}

/// Build a command packet, returning its length
pub fn build_command(
    buf: &mut [u8],
    seq: &Sequencer,
    cmd: CommandCode,
    param_type: u8,
    param: u16,
) -> Result<usize> {
    let total = HEADER_SIZE + CMD_PAYLOAD_SIZE;
    check_capacity(buf, total)?;

    write_header(buf, MsgType::Cmd, seq.advance(), CMD_PAYLOAD_SIZE as u16);
    buf[HEADER_SIZE] = cmd as u8;
    buf[HEADER_SIZE + 1] = param_type;
    buf[HEADER_SIZE + 2..HEADER_SIZE + 4].copy_from_slice(&param.to_le_bytes());

    Ok(total)
}

/// Build a status report packet, returning its length
pub fn build_status(buf: &mut [u8], seq: &Sequencer, status: &StatusPayload) -> Result<usize> {
    let total = HEADER_SIZE + STATUS_PAYLOAD_SIZE;
    check_capacity(buf, total)?;

    write_header(buf, MsgType::Status, seq.advance(), STATUS_PAYLOAD_SIZE as u16);
    buf[HEADER_SIZE] = status.acquiring as u8;
    buf[HEADER_SIZE + 1] = status.channel;
    buf[HEADER_SIZE + 2..HEADER_SIZE + 4].copy_from_slice(&status.threshold_mv.to_le_bytes());
    buf[HEADER_SIZE + 4..HEADER_SIZE + 8].copy_from_slice(&status.uptime.to_le_bytes());
    buf[HEADER_SIZE + 8..HEADER_SIZE + 12].copy_from_slice(&status.samples_sent.to_le_bytes());

    Ok(total)
}

// ============================================================================
// Parsing
// ============================================================================

/// Parse a received packet, returning the header and a payload view
///
/// Validates framing only: minimum length, magic, and that the buffer holds
/// at least the declared payload. Trailing bytes are ignored.
pub fn parse_packet(data: &[u8]) -> Result<(Header, &[u8])> {
    if data.len() < HEADER_SIZE {
        return Err(Error::InvalidMessage(format!(
            "packet too short: {} bytes",
            data.len()
        )));
    }

    let header = Header {
        magic: u16::from_le_bytes([data[0], data[1]]),
        msg_type: data[2],
        sequence: u16::from_le_bytes([data[3], data[4]]),
        payload_len: u16::from_le_bytes([data[5], data[6]]),
    };

    if header.magic != MAGIC {
        return Err(Error::InvalidMessage(format!(
            "invalid magic: 0x{:04X}",
            header.magic
        )));
    }

    let expected = HEADER_SIZE + header.payload_len as usize;
    if data.len() < expected {
        return Err(Error::InvalidMessage(format!(
            "packet length mismatch: got {}, expected {}",
            data.len(),
            expected
        )));
    }

    Ok((header, &data[HEADER_SIZE..expected]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ping_packet() {
        let seq = Sequencer::new();
        let mut buf = [0u8; 16];
        let len = build_ping(&mut buf, &seq).unwrap();

        // Ping: 7A DA 01 00 00 00 00
        assert_eq!(len, 7);
        assert_eq!(&buf[..7], &[0x7A, 0xDA, 0x01, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_pong_packet() {
        let seq = Sequencer::new();
        let mut buf = [0u8; 16];
        let len = build_pong(&mut buf, &seq).unwrap();

        assert_eq!(len, 7);
        assert_eq!(buf[0], 0x7A); // magic low byte first
        assert_eq!(buf[1], 0xDA);
        assert_eq!(buf[2], 0x02);
    }

    #[test]
    fn test_empty_data_packet() {
        let seq = Sequencer::new();
        let mut buf = [0u8; 32];
        let len = build_data(&mut buf, &seq, 0, &[]).unwrap();

        // Header (7) + channel + reserved + count (2) = 11
        assert_eq!(len, 11);
        let (header, payload) = parse_packet(&buf[..len]).unwrap();
        assert_eq!(header.payload_len, 4);
        assert_eq!(payload, &[0, 0, 0, 0]);
    }

    #[test]
    fn test_max_data_packet() {
        let seq = Sequencer::new();
        let samples = [0xABCDu16; 500];
        let mut buf = [0u8; 1500];
        let len = build_data(&mut buf, &seq, 2, &samples).unwrap();

        // 7 + 4 + 2*500 = 1011
        assert_eq!(len, 1011);
        let (header, payload) = parse_packet(&buf[..len]).unwrap();
        assert_eq!(header.payload_len, 1004);
        let view = DataView::parse(payload).unwrap();
        assert_eq!(view.channel, 2);
        assert_eq!(view.sample_count, 500);
        assert!(view.samples().all(|s| s == 0xABCD));
    }

    #[test]
    fn test_data_sample_encoding() {
        let seq = Sequencer::new();
        let mut buf = [0u8; 64];
        let len = build_data(&mut buf, &seq, 1, &[2500, 3000, 4000]).unwrap();

        assert_eq!(len, 17);
        let (_, payload) = parse_packet(&buf[..len]).unwrap();
        let view = DataView::parse(payload).unwrap();
        assert_eq!(view.channel, 1);
        assert_eq!(view.samples().collect::<Vec<_>>(), vec![2500, 3000, 4000]);

        // Samples are little-endian on the wire: 2500 = 0x09C4
        assert_eq!(buf[11], 0xC4);
        assert_eq!(buf[12], 0x09);
    }

    #[test]
    fn test_oversized_sample_count_rejected() {
        let seq = Sequencer::new();
        let samples = vec![0u16; MAX_SAMPLES_PER_PACKET + 1];
        let mut buf = vec![0u8; 4096];
        assert!(matches!(
            build_data(&mut buf, &seq, 0, &samples),
            Err(Error::InvalidArgument(_))
        ));
        // A failed build must not advance the sequence counter
        assert_eq!(seq.current(), 0);
    }

    #[test]
    fn test_buffer_too_small() {
        let seq = Sequencer::new();
        let mut buf = [0u8; 6];
        assert!(matches!(
            build_ping(&mut buf, &seq),
            Err(Error::BufferTooSmall { needed: 7, have: 6 })
        ));
        assert_eq!(seq.current(), 0);
    }

    #[test]
    fn test_command_round_trip() {
        let seq = Sequencer::new();
        let mut buf = [0u8; 16];
        let len = build_command(
            &mut buf,
            &seq,
            CommandCode::Configure,
            ConfigParam::BatchSize as u8,
            250,
        )
        .unwrap();

        assert_eq!(len, 11);
        let (header, payload) = parse_packet(&buf[..len]).unwrap();
        assert_eq!(header.msg_type, MsgType::Cmd as u8);

        let cmd = CommandPayload::parse(payload).unwrap();
        assert_eq!(cmd.cmd, CommandCode::Configure as u8);
        assert_eq!(cmd.param_type, 2);
        assert_eq!(cmd.param, 250);
    }

    #[test]
    fn test_status_round_trip() {
        let seq = Sequencer::new();
        let status = StatusPayload {
            acquiring: true,
            channel: 3,
            threshold_mv: 1650,
            uptime: 3600,
            samples_sent: 123456,
        };

        let mut buf = [0u8; 32];
        let len = build_status(&mut buf, &seq, &status).unwrap();
        assert_eq!(len, HEADER_SIZE + STATUS_PAYLOAD_SIZE);

        let (header, payload) = parse_packet(&buf[..len]).unwrap();
        assert_eq!(header.msg_type, MsgType::Status as u8);
        assert_eq!(StatusPayload::parse(payload).unwrap(), status);
    }

    #[test]
    fn test_sequence_advances_per_packet() {
        let seq = Sequencer::new();
        let mut buf = [0u8; 64];

        build_ping(&mut buf, &seq).unwrap();
        build_pong(&mut buf, &seq).unwrap();
        build_data(&mut buf, &seq, 0, &[1, 2]).unwrap();

        let len = build_ping(&mut buf, &seq).unwrap();
        let (header, _) = parse_packet(&buf[..len]).unwrap();
        assert_eq!(header.sequence, 3);
        assert_eq!(seq.current(), 4);
    }

    #[test]
    fn test_sequence_reset() {
        let seq = Sequencer::new();
        let mut buf = [0u8; 16];
        build_ping(&mut buf, &seq).unwrap();
        build_ping(&mut buf, &seq).unwrap();
        seq.reset();

        let len = build_ping(&mut buf, &seq).unwrap();
        let (header, _) = parse_packet(&buf[..len]).unwrap();
        assert_eq!(header.sequence, 0);
    }

    #[test]
    fn test_sequence_wraps() {
        let seq = Sequencer::new();
        seq.0.store(0xFFFF, Ordering::Relaxed);

        let mut buf = [0u8; 16];
        let len = build_ping(&mut buf, &seq).unwrap();
        let (header, _) = parse_packet(&buf[..len]).unwrap();
        assert_eq!(header.sequence, 0xFFFF);
        assert_eq!(seq.current(), 0);
    }

    #[test]
    fn test_parse_too_short() {
        assert!(matches!(
            parse_packet(&[0x7A, 0xDA, 0x01, 0x00, 0x00, 0x00]),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_parse_bad_magic() {
        // Magic 0xBEEF instead of 0xDA7A
        assert!(matches!(
            parse_packet(&[0xEF, 0xBE, 0x01, 0x00, 0x00, 0x00, 0x00]),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_parse_declared_length_exceeds_actual() {
        // Declares a 10-byte payload but carries none
        assert!(matches!(
            parse_packet(&[0x7A, 0xDA, 0x20, 0x00, 0x00, 0x0A, 0x00]),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_parse_ignores_trailing_bytes() {
        let seq = Sequencer::new();
        let mut buf = [0u8; 64];
        let len = build_command(&mut buf, &seq, CommandCode::StartAcq, 0, 0).unwrap();

        // Tack garbage onto the datagram; declared length governs
        let mut data = buf[..len].to_vec();
        data.extend_from_slice(&[0xFF; 8]);

        let (header, payload) = parse_packet(&data).unwrap();
        assert_eq!(header.payload_len as usize, payload.len());
        assert_eq!(payload.len(), CMD_PAYLOAD_SIZE);
    }

    #[test]
    fn test_parse_unknown_msg_type_accepted() {
        // Framing-valid packet with an unassigned type; the dispatcher
        // decides what to do with it
        let data = [0x7A, 0xDA, 0x7F, 0x00, 0x00, 0x00, 0x00];
        let (header, _) = parse_packet(&data).unwrap();
        assert_eq!(header.msg_type, 0x7F);
        assert!(MsgType::try_from(header.msg_type).is_err());
    }

    #[test]
    fn test_command_payload_too_short() {
        assert!(CommandPayload::parse(&[0x01, 0x00]).is_err());
    }

    #[test]
    fn test_data_view_truncated() {
        // Declares 4 samples, carries 1
        let payload = [0x00, 0x00, 0x04, 0x00, 0x10, 0x00];
        assert!(DataView::parse(&payload).is_err());
    }
}
