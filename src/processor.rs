// Receive side of a read transfer.
//
// The client loop owns the socket and the timers; this module owns the block bookkeeping. Each
// incoming packet is handed to `ReceiveProcessor::process_packet`, which appends the payload to
// the output buffer when appropriate and answers with the action the loop should take next.

use crate::client::{TftpError, TransferError};
use crate::tftp;

/// Represents an action that the caller of ReceiveProcessor should take in
/// response to processing a packet.
#[derive(Debug, PartialEq)]
pub enum ResultAction {
    /// Caller should send the packet and keep waiting for the next block.
    SendPacketAndAwait(tftp::Packet),

    /// Caller should send the final acknowledgement; the transfer is complete.
    TerminateWithPacket(tftp::Packet),

    /// The current attempt failed but the transfer may be retried from scratch.
    AbortAttempt(TransferError),

    /// The transfer failed in a way retrying will not fix.
    AbortTransfer(TransferError),
}

/// How a received block number relates to the one we are waiting for.
#[derive(Debug, PartialEq)]
enum BlockOrder {
    Expected,
    Duplicate,
    Ahead,
}

/// Compares block numbers modulo 2^16 so transfers longer than 65535 blocks keep working after
/// the counter wraps.
fn classify_block(block: u16, expected: u16) -> BlockOrder {
    match expected.wrapping_sub(block) {
        0 => BlockOrder::Expected,
        d if d < 0x8000 => BlockOrder::Duplicate,
        _ => BlockOrder::Ahead,
    }
}

/// Maps a server-reported error code onto the client's error kinds.
pub fn error_kind_for(code: tftp::ErrorCode) -> TftpError {
    match code {
        tftp::ErrorCode::FileNotFound => TftpError::FileNotFound,
        tftp::ErrorCode::AccessViolation => TftpError::AccessViolation,
        tftp::ErrorCode::DiskFull => TftpError::DiskFull,
        tftp::ErrorCode::Illegal => TftpError::IllegalOperation,
        tftp::ErrorCode::UnknownTid => TftpError::UnknownTid,
        tftp::ErrorCode::FileAlreadyExists => TftpError::FileExists,
        tftp::ErrorCode::NoSuchUser => TftpError::NoSuchUser,
        tftp::ErrorCode::Undefined => TftpError::InvalidResponse,
    }
}

#[derive(Debug)]
pub struct ReceiveProcessor {
    block_size: usize,
    expected: u16,
    bytes_received: u64,
}

impl ReceiveProcessor {
    pub fn new(block_size: usize) -> ReceiveProcessor {
        ReceiveProcessor {
            block_size,
            expected: 1,
            bytes_received: 0,
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Given an incoming packet, processes it and describes the action the caller should take.
    pub fn process_packet(&mut self, packet: &tftp::Packet, out: &mut Vec<u8>) -> ResultAction {
        match packet {
            tftp::Packet::Data { block, data } => match classify_block(*block, self.expected) {
                BlockOrder::Expected => {
                    out.extend_from_slice(data);
                    self.bytes_received += data.len() as u64;
                    self.expected = self.expected.wrapping_add(1);

                    let ack = tftp::Packet::Ack { block: *block };
                    if data.len() < self.block_size {
                        ResultAction::TerminateWithPacket(ack)
                    } else {
                        ResultAction::SendPacketAndAwait(ack)
                    }
                }
                // The server missed our ACK and resent the block. Acknowledge it again and drop
                // the payload, we already have it.
                BlockOrder::Duplicate => {
                    ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: *block })
                }
                BlockOrder::Ahead => ResultAction::AbortAttempt(TransferError::new(
                    TftpError::InvalidResponse,
                    format!(
                        "Received block {block} while waiting for block {}",
                        self.expected
                    ),
                )),
            },
            tftp::Packet::Error { code, message } => ResultAction::AbortTransfer(
                TransferError::new(error_kind_for(*code), format!("Server error: {message}")),
            ),
            _ => ResultAction::AbortAttempt(TransferError::new(
                TftpError::InvalidResponse,
                format!("Expected to receive a Data packet, but got {:?} instead", packet.op_code()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(block: u16, len: usize) -> tftp::Packet {
        tftp::Packet::Data { block, data: vec![0x78; len] }
    }

    #[test]
    fn test_receive_multiple_blocks_succeeds() {
        let mut processor = ReceiveProcessor::new(512);
        let mut out = Vec::new();

        assert_eq!(
            processor.process_packet(&data(1, 512), &mut out),
            ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 1 })
        );
        assert_eq!(
            processor.process_packet(&data(2, 7), &mut out),
            ResultAction::TerminateWithPacket(tftp::Packet::Ack { block: 2 })
        );
        assert_eq!(out.len(), 519);
        assert_eq!(processor.bytes_received(), 519);
    }

    #[test]
    fn test_empty_final_block_terminates() {
        let mut processor = ReceiveProcessor::new(512);
        let mut out = Vec::new();
        for block in 1..=3 {
            assert_eq!(
                processor.process_packet(&data(block, 512), &mut out),
                ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block })
            );
        }
        assert_eq!(
            processor.process_packet(&data(4, 0), &mut out),
            ResultAction::TerminateWithPacket(tftp::Packet::Ack { block: 4 })
        );
        assert_eq!(out.len(), 3 * 512);
    }

    #[test]
    fn test_duplicate_block_is_reacked_and_dropped() {
        let mut processor = ReceiveProcessor::new(512);
        let mut out = Vec::new();
        let _ = processor.process_packet(&data(1, 512), &mut out);

        assert_eq!(
            processor.process_packet(&data(1, 512), &mut out),
            ResultAction::SendPacketAndAwait(tftp::Packet::Ack { block: 1 })
        );
        assert_eq!(out.len(), 512);
    }

    #[test]
    fn test_block_ahead_aborts_attempt() {
        let mut processor = ReceiveProcessor::new(512);
        let mut out = Vec::new();

        match processor.process_packet(&data(2, 512), &mut out) {
            ResultAction::AbortAttempt(e) => assert_eq!(e.kind, TftpError::InvalidResponse),
            other => panic!("unexpected action {:?}", other),
        }
        assert!(out.is_empty());
    }

    #[test]
    fn test_server_error_aborts_transfer() {
        let mut processor = ReceiveProcessor::new(512);
        let mut out = Vec::new();

        match processor.process_packet(
            &tftp::Packet::Error { code: tftp::ErrorCode::FileNotFound, message: "nope".to_string() },
            &mut out,
        ) {
            ResultAction::AbortTransfer(e) => {
                assert_eq!(e.kind, TftpError::FileNotFound);
                assert_eq!(e.message, "Server error: nope");
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_unexpected_opcode_is_invalid_response() {
        let mut processor = ReceiveProcessor::new(512);
        let mut out = Vec::new();

        match processor.process_packet(&tftp::Packet::Ack { block: 1 }, &mut out) {
            ResultAction::AbortAttempt(e) => assert_eq!(e.kind, TftpError::InvalidResponse),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_block_order_wraps() {
        assert_eq!(classify_block(0, 0), BlockOrder::Expected);
        assert_eq!(classify_block(65535, 0), BlockOrder::Duplicate);
        assert_eq!(classify_block(1, 0), BlockOrder::Ahead);
        assert_eq!(classify_block(3, 5), BlockOrder::Duplicate);
        assert_eq!(classify_block(6, 5), BlockOrder::Ahead);
    }
}
