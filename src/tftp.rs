// TFTP wire format (RFC 1350).
//
// Every packet starts with a 2-byte big-endian opcode:
//
// opcode   operation
// 1        Read req (RRQ)      | 0x01 | Filename | 0x00 | Mode | 0x00
// 2        Write req (WRQ)     | 0x02 | Filename | 0x00 | Mode | 0x00
// 3        Data (DATA)         | 0x03 | Block # (2 bytes) | Data (0..block size bytes)
// 4        ACK                 | 0x04 | Block # (2 bytes)
// 5        ERROR               | 0x05 | ErrorCode (2 bytes) | ErrMsg | 0x00
//
// A DATA packet shorter than the block size ends the transfer. Block numbers are 16 bits wide and
// wrap around on very large files.

use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Block size used when none was negotiated.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Smallest block size accepted by the client (RFC 2348).
pub const MIN_BLOCK_SIZE: usize = 8;

/// Largest block size that fits in a single UDP datagram (RFC 2348).
pub const MAX_BLOCK_SIZE: usize = 65464;

/// Opcode plus block number.
pub const HEADER_LEN: usize = 4;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the TFTP Socket handler
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    PacketParse(String),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {e}"),
            SocketError::PacketParse(e) => write!(f, "Packet parsing error: {e}"),
            SocketError::Timeout(_) => write!(f, "Socket IO timeout"),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

pub type TftpResult<T> = Result<T, SocketError>;

/// Represents the transfer mode named in a read or write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    NetAscii,
    Octet,
    Mail,
}

impl FileMode {
    fn as_str(&self) -> &'static str {
        match self {
            FileMode::NetAscii => "netascii",
            FileMode::Octet => "octet",
            FileMode::Mail => "mail",
        }
    }
}

/// Represents a TFTP Error code surfaced by a TFTP Error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Undefined,
    FileNotFound,
    AccessViolation,
    DiskFull,
    Illegal,
    UnknownTid,
    FileAlreadyExists,
    NoSuchUser,
}

impl From<u16> for ErrorCode {
    fn from(raw: u16) -> Self {
        match raw {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::Illegal,
            5 => ErrorCode::UnknownTid,
            6 => ErrorCode::FileAlreadyExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::Undefined,
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        match code {
            ErrorCode::Undefined => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::Illegal => 4,
            ErrorCode::UnknownTid => 5,
            ErrorCode::FileAlreadyExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }
}

/// TFTP OpCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Rrq,
    Wrq,
    Data,
    Ack,
    Error,
}

impl From<OpCode> for u16 {
    fn from(op: OpCode) -> u16 {
        match op {
            OpCode::Rrq => 1,
            OpCode::Wrq => 2,
            OpCode::Data => 3,
            OpCode::Ack => 4,
            OpCode::Error => 5,
        }
    }
}

/// An enum representing a TFTP packet and its associated data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A read request packet
    ReadReq {
        /// The file path the client wants to read.
        path: String,

        /// The file mode.
        mode: FileMode,
    },

    /// A write request packet
    WriteReq { path: String, mode: FileMode },

    /// A data packet
    Data {
        /// The block number for this data packet.
        block: u16,

        /// The contents of the data itself.
        data: Vec<u8>,
    },

    /// An acknowledgment packet
    Ack {
        /// The block being acknowledged.
        block: u16,
    },

    /// An error packet.
    Error { code: ErrorCode, message: String },
}

fn u16_from_buffer(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// Given a buffer, assumes the string begins at the beginning of the buffer and concatenates until
/// it finds a 0 byte, which it assumes terminates the string.
///
/// Returns the string extracted from the buffer as well as the position of the 0 byte in the
/// buffer it was given (or the size of the buffer, if no 0 byte was encountered)
fn string_from_buffer(buf: &[u8]) -> (String, usize) {
    let end = buf.iter().position(|&c| c == 0x00).unwrap_or(buf.len());
    let s = buf[..end].iter().map(|&c| char::from(c)).collect();
    (s, end)
}

fn retrieve_op_code(buf: &[u8]) -> TftpResult<OpCode> {
    let rawcode = u16_from_buffer(&buf[..2]);
    match rawcode {
        1 => Ok(OpCode::Rrq),
        2 => Ok(OpCode::Wrq),
        3 => Ok(OpCode::Data),
        4 => Ok(OpCode::Ack),
        5 => Ok(OpCode::Error),
        _ => Err(SocketError::PacketParse(format!(
            "Unknown opcode retrieved: {rawcode}"
        ))),
    }
}

fn parse_path_and_mode(buf: &[u8]) -> TftpResult<(String, FileMode)> {
    let (path, path_end) = string_from_buffer(buf);

    if path_end == buf.len() {
        return Err(SocketError::PacketParse(
            "Request does not contain a mode, but it needs to!".to_string(),
        ));
    }

    let (raw_mode, mode_end) = string_from_buffer(&buf[path_end + 1..]);

    if path_end + 1 + mode_end >= buf.len() {
        return Err(SocketError::PacketParse(
            "Mode must be terminated with a null byte!".to_string(),
        ));
    }

    let mode = match raw_mode.to_lowercase().as_str() {
        "netascii" => FileMode::NetAscii,
        "octet" => FileMode::Octet,
        "mail" => FileMode::Mail,
        _ => {
            return Err(SocketError::PacketParse(format!(
                "Unknown file mode: '{raw_mode}'"
            )))
        }
    };

    Ok((path, mode))
}

fn push_request(buf: &mut Vec<u8>, path: &str, mode: FileMode) {
    buf.extend_from_slice(path.as_bytes());
    buf.push(0x00);
    buf.extend_from_slice(mode.as_str().as_bytes());
    buf.push(0x00);
}

impl Packet {
    pub fn op_code(&self) -> OpCode {
        match self {
            Packet::ReadReq { .. } => OpCode::Rrq,
            Packet::WriteReq { .. } => OpCode::Wrq,
            Packet::Data { .. } => OpCode::Data,
            Packet::Ack { .. } => OpCode::Ack,
            Packet::Error { .. } => OpCode::Error,
        }
    }

    /// Encodes the packet into its wire representation.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(&u16::from(self.op_code()).to_be_bytes());

        match self {
            Packet::ReadReq { path, mode } | Packet::WriteReq { path, mode } => {
                push_request(&mut buf, path, *mode);
            }
            Packet::Data { block, data } => {
                buf.reserve(data.len() + 2);
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                buf.extend_from_slice(&u16::from(*code).to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0x00);
            }
        }

        buf
    }

    /// Decodes a packet from a received datagram.
    ///
    /// Only the framing is checked here: at least an opcode, and a block/error field for DATA,
    /// ACK and ERROR. Whether the packet makes sense for the transfer is up to the caller.
    pub fn deserialize(buf: &[u8]) -> TftpResult<Packet> {
        if buf.len() < 2 {
            return Err(SocketError::PacketParse("Packet too short!".to_string()));
        }

        let op = retrieve_op_code(buf)?;
        if matches!(op, OpCode::Data | OpCode::Ack | OpCode::Error) && buf.len() < HEADER_LEN {
            return Err(SocketError::PacketParse(format!(
                "{op:?} packet must be at least {HEADER_LEN} bytes, got {}",
                buf.len()
            )));
        }

        match op {
            OpCode::Rrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::ReadReq { path, mode })
            }
            OpCode::Wrq => {
                let (path, mode) = parse_path_and_mode(&buf[2..])?;
                Ok(Packet::WriteReq { path, mode })
            }
            OpCode::Data => Ok(Packet::Data {
                block: u16_from_buffer(&buf[2..4]),
                data: buf[4..].to_vec(),
            }),
            OpCode::Ack => Ok(Packet::Ack {
                block: u16_from_buffer(&buf[2..4]),
            }),
            OpCode::Error => {
                let code = ErrorCode::from(u16_from_buffer(&buf[2..4]));
                let (message, _) = string_from_buffer(&buf[4..]);
                Ok(Packet::Error { code, message })
            }
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that parses TFTP headers and
/// returns the packets in a more structured format.
pub struct TftpSocket {
    sock: Async<UdpSocket>,
    recv_len: usize,
}

impl TftpSocket {
    /// Binds a socket able to receive DATA packets carrying up to `block_size` bytes.
    pub fn bind(addr: SocketAddr, block_size: usize) -> TftpResult<TftpSocket> {
        Ok(TftpSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
            recv_len: block_size + HEADER_LEN,
        })
    }

    pub fn local_addr(&self) -> TftpResult<SocketAddr> {
        Ok(self.sock.get_ref().local_addr()?)
    }

    pub async fn send(&self, packet: &Packet, dst: SocketAddr) -> TftpResult<()> {
        let buf = packet.serialize();
        let sent = self.sock.send_to(&buf, dst).await?;
        if sent != buf.len() {
            return Err(SocketError::IO(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short send: {sent} of {} bytes", buf.len()),
            )));
        }
        Ok(())
    }

    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Packet, SocketAddr)> {
        let mut buf = vec![0; self.recv_len];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;

        let packet = Packet::deserialize(&buf[..total_written])?;
        Ok((packet, src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn test_packet_read_req() {
        let mut buf = vec![0x00, 0x01];
        buf.extend_from_slice(b"images/openwrt-sysupgrade.bin\0");
        buf.extend_from_slice(b"OCTET\0");

        let packet = assert_ok!(Packet::deserialize(&buf));
        assert_eq!(
            packet,
            Packet::ReadReq { path: "images/openwrt-sysupgrade.bin".to_string(), mode: FileMode::Octet }
        );
    }

    #[test]
    fn test_serialize_read_req_uses_octet() {
        let packet = Packet::ReadReq { path: "fw.bin".to_string(), mode: FileMode::Octet };
        assert_eq!(
            packet.serialize(),
            vec![0x00, 0x01, b'f', b'w', b'.', b'b', b'i', b'n', 0x00, b'o', b'c', b't', b'e', b't', 0x00]
        );
        assert_eq!(Packet::deserialize(&packet.serialize()).unwrap(), packet);
    }

    #[test]
    fn test_packet_parses_data() {
        let buf = vec![
            // opcode
            0x00, 0x03,
            // block number
            0x12, 0x34,
            // data
            0xDE, 0xAD, 0xBE, 0xEF];

        let packet = Packet::deserialize(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::Data { block: 0x1234, data: vec![0xDE, 0xAD, 0xBE, 0xEF] });
    }

    #[test]
    fn test_packet_parses_empty_data() {
        let buf = vec![0x00, 0x03, 0x00, 0x04];
        assert_eq!(Packet::deserialize(&buf).unwrap(), Packet::Data { block: 4, data: vec![] });
    }

    #[test]
    fn test_packet_parses_ack() {
        let buf = vec![0x00, 0x04, 0x10, 0x2f];
        let packet = Packet::deserialize(&buf);
        assert!(packet.is_ok());
        assert_eq!(packet.unwrap(), Packet::Ack { block: 0x102f });
    }

    #[test]
    fn test_packet_parses_error() {
        let mut buf = vec![
            // opcode
            0x00, 0x05,
            // error code: file not found
            0x00, 0x01];
        buf.extend_from_slice(b"fw.bin: no such file\0");

        let packet = assert_ok!(Packet::deserialize(&buf));
        assert_eq!(packet, Packet::Error { code: ErrorCode::FileNotFound, message: "fw.bin: no such file".to_string() });
    }

    #[test]
    fn test_block_numbers_survive_encoding_at_wrap_boundary() {
        for block in [0u16, 1, 65535] {
            let data = Packet::Data { block, data: vec![0xAB; 3] };
            assert_eq!(Packet::deserialize(&data.serialize()).unwrap(), data);

            let ack = Packet::Ack { block };
            assert_eq!(Packet::deserialize(&ack.serialize()).unwrap(), ack);
        }

        let err = Packet::Error { code: ErrorCode::FileNotFound, message: "no such file".to_string() };
        let bytes = err.serialize();
        assert_eq!(&bytes[..4], &[0x00, 0x05, 0x00, 0x01]);
        assert_eq!(*bytes.last().unwrap(), 0x00);
        assert_eq!(Packet::deserialize(&bytes).unwrap(), err);
    }

    #[test]
    fn test_packet_parse_failures() {
        // Too short for an opcode
        assert!(Packet::deserialize(&[]).is_err());
        assert!(Packet::deserialize(&[0x10]).is_err());
        // Invalid opcodes
        assert!(Packet::deserialize(&[0x10, 0x00]).is_err());
        assert!(Packet::deserialize(&[0x00, 0x09]).is_err());
        // DATA / ACK / ERROR without a block field
        assert!(Packet::deserialize(&[0x00, 0x03, 0x00]).is_err());
        assert!(Packet::deserialize(&[0x00, 0x04]).is_err());
        assert!(Packet::deserialize(&[0x00, 0x05, 0x01]).is_err());
        // Invalid read path
        assert!(Packet::deserialize(&[0x00, 0x01, 0x68, 0x69]).is_err());
        // Missing mode string
        assert!(Packet::deserialize(&[0x00, 0x01, 0x68, 0x69, 0x00]).is_err());
        // Invalid mode string
        assert!(Packet::deserialize(&[0x00, 0x01, 0x68, 0x69, 0x00, 0x62, 0x61, 0x64, 0x00]).is_err());
    }

    #[test]
    fn test_error_code_mapping() {
        for raw in 0..=7u16 {
            assert_eq!(u16::from(ErrorCode::from(raw)), raw);
        }
        assert_eq!(ErrorCode::from(42), ErrorCode::Undefined);
    }
}
