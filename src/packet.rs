//! Result packet codec.
//!
//! Each harness connection carries exactly one fixed-size packet:
//!
//! ```text
//! offset  size  field
//! 0       4     header       literal "FUZZ"
//! 4       8     test_run_id  u64, little-endian
//! 12      1     signal       u8 (0 = success)
//! ```
//!
//! A header mismatch does not stop decoding; it is carried on the
//! decoded result so the caller can decide what to do with it.

use bytes::{Buf, BufMut};

/// Protocol tag expected at the start of every packet
pub const HEADER: &[u8; 4] = b"FUZZ";

/// Size of a complete packet on the wire
pub const PACKET_LEN: usize = 13;

/// Upper bound on bytes read from a single connection
pub const READ_BUDGET: usize = 32;

/// Decoded outcome of one test run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestResult {
    pub test_run_id: u64,
    pub signal: u8,
    pub header_valid: bool,
}

impl TestResult {
    /// A zero signal means the run completed without crashing
    pub fn is_success(&self) -> bool {
        self.signal == 0
    }
}

impl std::fmt::Display for TestResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test run: {}, result: {}", self.test_run_id, self.signal)
    }
}

/// Packet decoding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer than `PACKET_LEN` bytes were received
    MalformedPacket { len: usize },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::MalformedPacket { len } => write!(
                f,
                "Malformed packet: received {} bytes, need {}",
                len, PACKET_LEN
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode a result packet. Bytes past `PACKET_LEN` are ignored.
pub fn decode(input: &[u8]) -> Result<TestResult, DecodeError> {
    if input.len() < PACKET_LEN {
        return Err(DecodeError::MalformedPacket { len: input.len() });
    }

    let mut buf = &input[..PACKET_LEN];
    let header_valid = &buf[..HEADER.len()] == HEADER;
    buf.advance(HEADER.len());

    let test_run_id = buf.get_u64_le();
    let signal = buf.get_u8();

    Ok(TestResult {
        test_run_id,
        signal,
        header_valid,
    })
}

/// Encode a result packet with the standard header
pub fn encode(test_run_id: u64, signal: u8) -> [u8; PACKET_LEN] {
    encode_with_header(HEADER, test_run_id, signal)
}

/// Encode a result packet with an arbitrary header
pub fn encode_with_header(header: &[u8; 4], test_run_id: u64, signal: u8) -> [u8; PACKET_LEN] {
    let mut out = [0u8; PACKET_LEN];
    let mut buf = &mut out[..];
    buf.put_slice(header);
    buf.put_u64_le(test_run_id);
    buf.put_u8(signal);
    out
}
