use crate::prelude::*;

use bytes::{BufMut, BytesMut};
use nom_derive::{Nom, Parse};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Modbus TCP protocol identifier, always zero.
pub const PROTOCOL_ID: u16 = 0;

/// Set on the function code of exception responses.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// The firmware answers fire-and-forget writes with this function code and
/// exception code 0. That pair means the write was taken, not that it failed.
pub const GENERIC_EXCEPTION_FC: u8 = 0xFF;

/// MBAP header plus the largest legal PDU.
pub const MAX_FRAME_BYTES: usize = 260;

/// Register holding the pilot power command; the adjacent power factor
/// register is always written in the same transaction.
pub const PILOT_POWER_REGISTER: u16 = 41;

/// Scale applied to the power factor on the wire, 0.95 -> 9500.
pub const POWER_FACTOR_SCALE: f64 = 10000.0;

// {{{ MbapHeader
#[derive(Clone, Copy, Debug, Eq, PartialEq, Nom)]
#[nom(BigEndian)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Bytes following the length field: unit id plus PDU.
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub const SIZE: usize = 7;
}
// }}}

// {{{ FunctionCode
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FunctionCode {
    ReadHold = 0x03,
    WriteMulti = 0x10,
}
// }}}

// {{{ ExceptionCode
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 1,
    IllegalDataAddress = 2,
    IllegalDataValue = 3,
    ServerDeviceFailure = 4,
    Acknowledge = 5,
    ServerDeviceBusy = 6,
    MemoryParityError = 8,
    GatewayPathUnavailable = 10,
    GatewayTargetFailed = 11,
}
// }}}

/// What a device response (or error) means for the connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseClass {
    Success,
    /// The request failed but the connection is believed healthy.
    ProtocolError,
    /// The connection itself is suspect and should be torn down.
    ConnectionError,
}

/// Classifies an exception response. Exception codes 1, 4, 6, 10 and 11 come
/// back from this firmware when the TCP session is broken mid-request, so
/// they count against the connection rather than the request.
pub fn classify_exception(function_code: u8, exception_code: u8) -> ResponseClass {
    if function_code == GENERIC_EXCEPTION_FC && exception_code == 0 {
        return ResponseClass::Success;
    }

    match exception_code {
        1 | 4 | 6 | 10 | 11 => ResponseClass::ConnectionError,
        _ => ResponseClass::ProtocolError,
    }
}

/// Substrings that mark a socket-level error text as connection loss.
const CONNECTION_INDICATORS: &[&str] = &[
    "connection",
    "closed",
    "timeout",
    "timed out",
    "disconnected",
    "network",
    "socket",
    "reset",
    "broken pipe",
    "refused",
    "unreachable",
    "no route to host",
    "aborted",
];

/// Classifies a socket error by message text. Errors that bubble up from the
/// OS have no structure to inspect, so this is substring matching on purpose.
pub fn classify_error_text(message: &str) -> ResponseClass {
    let lower = message.to_lowercase();
    if CONNECTION_INDICATORS.iter().any(|i| lower.contains(i)) {
        ResponseClass::ConnectionError
    } else {
        ResponseClass::ProtocolError
    }
}

/// Pilot power on the wire: two's complement in one register word.
pub fn encode_power(power: i32) -> u16 {
    (power & 0xFFFF) as u16
}

/// Validates a power factor and scales it for the wire.
pub fn scale_power_factor(power_factor: f64) -> Result<u16> {
    if !(0.0..=1.0).contains(&power_factor) {
        bail!("power factor {} outside 0.0..=1.0", power_factor);
    }
    Ok((power_factor * POWER_FACTOR_SCALE).round() as u16)
}

// {{{ TcpFrameFactory
pub struct TcpFrameFactory;

impl TcpFrameFactory {
    /// FC 0x03 request frame for `count` holding registers at `address`.
    pub fn read_hold(transaction_id: u16, unit_id: u8, address: u16, count: u16) -> BytesMut {
        let mut buffer = BytesMut::with_capacity(MbapHeader::SIZE + 5);
        buffer.put_u16(transaction_id);
        buffer.put_u16(PROTOCOL_ID);
        buffer.put_u16(6);
        buffer.put_u8(unit_id);
        buffer.put_u8(FunctionCode::ReadHold.into());
        buffer.put_u16(address);
        buffer.put_u16(count);
        buffer
    }

    /// FC 0x10 request frame writing `values` starting at `address`.
    pub fn write_multi(transaction_id: u16, unit_id: u8, address: u16, values: &[u16]) -> BytesMut {
        let count = values.len() as u16;
        let mut buffer = BytesMut::with_capacity(MbapHeader::SIZE + 6 + values.len() * 2);
        buffer.put_u16(transaction_id);
        buffer.put_u16(PROTOCOL_ID);
        buffer.put_u16(7 + count * 2);
        buffer.put_u8(unit_id);
        buffer.put_u8(FunctionCode::WriteMulti.into());
        buffer.put_u16(address);
        buffer.put_u16(count);
        buffer.put_u8((count * 2) as u8);
        for value in values {
            buffer.put_u16(*value);
        }
        buffer
    }
}
// }}}

// {{{ Frame
/// One complete MBAP frame, header plus PDU.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub header: MbapHeader,
    pub function_code: u8,
    /// PDU body after the function code.
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn parse(input: &[u8]) -> Result<Self> {
        let (rest, header) =
            MbapHeader::parse(input).map_err(|_| anyhow!("truncated mbap header"))?;

        if header.protocol_id != PROTOCOL_ID {
            bail!("unexpected protocol id {}", header.protocol_id);
        }

        // length counts the unit id byte, then the PDU
        let pdu_len = (header.length as usize)
            .checked_sub(1)
            .ok_or_else(|| anyhow!("mbap length {} too short", header.length))?;
        if pdu_len < 1 || rest.len() < pdu_len {
            bail!(
                "frame body truncated: expected {} bytes, have {}",
                pdu_len,
                rest.len()
            );
        }

        Ok(Self {
            header,
            function_code: rest[0],
            payload: rest[1..pdu_len].to_vec(),
        })
    }

    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_FLAG != 0
    }

    /// Exception code byte, present only on exception responses.
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            Some(self.payload.first().copied().unwrap_or(0))
        } else {
            None
        }
    }

    /// Register words from an FC 0x03 response payload.
    pub fn registers(&self) -> Result<Vec<u16>> {
        let byte_count = *self
            .payload
            .first()
            .ok_or_else(|| anyhow!("empty read response"))? as usize;

        let data = &self.payload[1..];
        if data.len() != byte_count || byte_count % 2 != 0 {
            bail!(
                "read response byte count {} does not match payload of {}",
                byte_count,
                data.len()
            );
        }

        Ok(data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }
}
// }}}
