//! Modbus/TCP frame codec
//!
//! Frame boundary detection on a byte stream, read-request classification
//! and parsing, sub-request construction, and reassembly of aggregated read
//! responses.
//!
//! A Modbus/TCP frame is a 7-byte MBAP header followed by the PDU:
//!
//! ```text
//! +----------------+--------------+----------+---------+----------------+
//! | Transaction ID | Protocol ID  | Length   | Unit ID | Function + data|
//! | u16 BE         | u16 BE (= 0) | u16 BE   | u8      | ...            |
//! +----------------+--------------+----------+---------+----------------+
//! ```
//!
//! The length field counts every byte after itself (unit id + PDU). The
//! codec tolerates lengths up to 300 (the protocol caps the PDU at 253) and
//! rejects zero or larger values as protocol errors. Deadline enforcement
//! belongs to the caller; every read here runs until completion or stream
//! error.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, ProxyResult};

/// Length-prefixed portion of the MBAP header (transaction, protocol, length)
pub const MBAP_PREFIX_LEN: usize = 6;

/// Largest MBAP length value accepted on ingress
pub const MAX_MBAP_LENGTH: u16 = 300;

/// Exact size of a read-family request frame
pub const READ_REQUEST_FRAME_LEN: usize = 12;

/// Largest payload a single read response can carry
///
/// The PDU is capped at 253 bytes; function code and byte count take two.
pub const MAX_RESPONSE_PAYLOAD: usize = 251;

/// Protocol identifier for Modbus/TCP, always zero on egress
const PROTOCOL_ID: u16 = 0;

/// Byte offset of the function code within a frame
const FUNCTION_OFFSET: usize = 7;

/// Exception flag on a response function code
const EXCEPTION_BIT: u8 = 0x80;

/// Read-family Modbus function codes
///
/// The proxy only interprets these four; every other function code passes
/// through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReadFunction {
    /// Read Coils (0x01)
    Coils = 0x01,
    /// Read Discrete Inputs (0x02)
    DiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    HoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    InputRegisters = 0x04,
}

impl ReadFunction {
    /// Convert from a raw function code
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ReadFunction::Coils),
            0x02 => Some(ReadFunction::DiscreteInputs),
            0x03 => Some(ReadFunction::HoldingRegisters),
            0x04 => Some(ReadFunction::InputRegisters),
            _ => None,
        }
    }

    /// Convert to the raw function code
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Check if this function addresses single bits rather than registers
    pub fn is_bit_oriented(self) -> bool {
        matches!(self, ReadFunction::Coils | ReadFunction::DiscreteInputs)
    }

    /// Response payload size for a given quantity
    ///
    /// Two bytes per register, one bit per coil packed into bytes.
    pub fn payload_len(self, quantity: u16) -> usize {
        if self.is_bit_oriented() {
            (quantity as usize + 7) / 8
        } else {
            quantity as usize * 2
        }
    }
}

impl fmt::Display for ReadFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadFunction::Coils => "Read Coils",
            ReadFunction::DiscreteInputs => "Read Discrete Inputs",
            ReadFunction::HoldingRegisters => "Read Holding Registers",
            ReadFunction::InputRegisters => "Read Input Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Parsed view of a read-family request frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub function: ReadFunction,
    pub start: u16,
    pub quantity: u16,
}

/// Body of a validated read response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPayload<'a> {
    /// Normal response payload (the bytes after the byte-count field)
    Data(&'a [u8]),
    /// Exception response carrying the exception code
    Exception(u8),
}

/// Read one complete Modbus/TCP frame from a byte stream
///
/// Consumes exactly the 6-byte MBAP prefix, validates the length field,
/// then consumes exactly `length` further bytes. A clean close before the
/// first header byte reports [`ProxyError::ConnectionClosed`]; a close
/// mid-frame is a short-read I/O error.
pub async fn read_frame<R>(reader: &mut R) -> ProxyResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; MBAP_PREFIX_LEN];
    let mut filled = 0;
    while filled < MBAP_PREFIX_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Err(ProxyError::ConnectionClosed);
            }
            return Err(ProxyError::io("short read in MBAP header"));
        }
        filled += n;
    }

    let length = u16::from_be_bytes([header[4], header[5]]);
    if length == 0 || length > MAX_MBAP_LENGTH {
        return Err(ProxyError::InvalidLength { length });
    }

    let mut frame = vec![0u8; MBAP_PREFIX_LEN + length as usize];
    frame[..MBAP_PREFIX_LEN].copy_from_slice(&header);
    reader
        .read_exact(&mut frame[MBAP_PREFIX_LEN..])
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ProxyError::io("short read in frame body"),
            _ => ProxyError::from(e),
        })?;

    Ok(frame)
}

/// Check whether a frame carries a read-family request
pub fn is_read_request(frame: &[u8]) -> bool {
    frame.len() > FUNCTION_OFFSET && ReadFunction::from_u8(frame[FUNCTION_OFFSET]).is_some()
}

/// Extract the transaction id from a frame
///
/// Callers hold frames produced by [`read_frame`], which are always at
/// least 7 bytes.
pub fn transaction_id(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[0], frame[1]])
}

/// Overwrite the transaction id of a frame in place
pub fn set_transaction_id(frame: &mut [u8], transaction_id: u16) {
    frame[..2].copy_from_slice(&transaction_id.to_be_bytes());
}

/// Parse a read-family request frame into its fields
pub fn parse_read_request(frame: &[u8]) -> ProxyResult<ReadRequest> {
    if frame.len() < READ_REQUEST_FRAME_LEN {
        return Err(ProxyError::malformed_frame(format!(
            "read request is {} bytes, expected {}",
            frame.len(),
            READ_REQUEST_FRAME_LEN
        )));
    }

    let function = ReadFunction::from_u8(frame[FUNCTION_OFFSET]).ok_or_else(|| {
        ProxyError::malformed_frame(format!(
            "function code 0x{:02X} is not a read request",
            frame[FUNCTION_OFFSET]
        ))
    })?;

    Ok(ReadRequest {
        transaction_id: transaction_id(frame),
        unit_id: frame[6],
        function,
        start: u16::from_be_bytes([frame[8], frame[9]]),
        quantity: u16::from_be_bytes([frame[10], frame[11]]),
    })
}

/// Build a 12-byte read request frame
///
/// The split planner issues sub-requests with transaction id 0; the echo is
/// rewritten at assembly, so the value is free for the caller to choose.
pub fn build_read_request(
    transaction_id: u16,
    unit_id: u8,
    function: ReadFunction,
    start: u16,
    quantity: u16,
) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(READ_REQUEST_FRAME_LEN);
    frame.put_u16(transaction_id);
    frame.put_u16(PROTOCOL_ID);
    frame.put_u16(6); // unit id + function + start + quantity
    frame.put_u8(unit_id);
    frame.put_u8(function.to_u8());
    frame.put_u16(start);
    frame.put_u16(quantity);
    frame.to_vec()
}

/// Validate a read response frame and borrow its payload
///
/// An exception response (function code with the high bit set) yields
/// [`ReadPayload::Exception`]; the caller decides whether to propagate the
/// frame verbatim. A function code that matches neither form, or a byte
/// count that disagrees with the frame length, is a malformed response.
pub fn parse_read_response(frame: &[u8], expected: ReadFunction) -> ProxyResult<ReadPayload<'_>> {
    if frame.len() < MBAP_PREFIX_LEN + 3 {
        return Err(ProxyError::malformed_response(format!(
            "response is {} bytes, too short for a PDU",
            frame.len()
        )));
    }

    let function_code = frame[FUNCTION_OFFSET];
    if function_code == expected.to_u8() | EXCEPTION_BIT {
        return Ok(ReadPayload::Exception(frame[8]));
    }
    if function_code != expected.to_u8() {
        return Err(ProxyError::malformed_response(format!(
            "unexpected function code 0x{:02X}, expected 0x{:02X}",
            function_code,
            expected.to_u8()
        )));
    }

    let byte_count = frame[8] as usize;
    let payload = &frame[MBAP_PREFIX_LEN + 3..];
    if payload.len() != byte_count {
        return Err(ProxyError::malformed_response(format!(
            "byte count {} disagrees with {} payload bytes",
            byte_count,
            payload.len()
        )));
    }

    Ok(ReadPayload::Data(payload))
}

/// Build a read response frame around an aggregated payload
///
/// Fails with [`ProxyError::AggregationTooLarge`] when the payload cannot
/// be framed within the 253-byte PDU bound.
pub fn build_read_response(
    transaction_id: u16,
    unit_id: u8,
    function: ReadFunction,
    payload: &[u8],
) -> ProxyResult<Vec<u8>> {
    if payload.len() > MAX_RESPONSE_PAYLOAD {
        return Err(ProxyError::AggregationTooLarge { bytes: payload.len() });
    }

    let length = 3 + payload.len(); // unit id + function + byte count + payload
    let mut frame = BytesMut::with_capacity(MBAP_PREFIX_LEN + length);
    frame.put_u16(transaction_id);
    frame.put_u16(PROTOCOL_ID);
    frame.put_u16(length as u16);
    frame.put_u8(unit_id);
    frame.put_u8(function.to_u8());
    frame.put_u8(payload.len() as u8);
    frame.put_slice(payload);
    Ok(frame.to_vec())
}
