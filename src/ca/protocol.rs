use crate::error::FlyScanError;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use log::debug;
use std::io::Read;

// Protocol constants
pub const HEADER_SIZE: usize = 12;
pub const PV_NAME_MAX: usize = 60;
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024; // 16MB

/// Frame operations understood by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Read a scalar register
    Get = 1,
    /// Read a slice of a waveform register
    GetWave = 2,
    /// Write a scalar register
    Put = 3,
    /// Subscribe to value updates for a register
    MonitorStart = 4,
    /// Cancel a subscription
    MonitorCancel = 5,
    /// Server reply to Get/GetWave/Put/MonitorStart/MonitorCancel
    Reply = 6,
    /// Unsolicited monitor update
    Event = 7,
}

impl TryFrom<u16> for Op {
    type Error = FlyScanError;

    fn try_from(raw: u16) -> Result<Self, FlyScanError> {
        match raw {
            1 => Ok(Op::Get),
            2 => Ok(Op::GetWave),
            3 => Ok(Op::Put),
            4 => Ok(Op::MonitorStart),
            5 => Ok(Op::MonitorCancel),
            6 => Ok(Op::Reply),
            7 => Ok(Op::Event),
            other => Err(FlyScanError::Protocol(format!(
                "Unknown frame operation: {other}"
            ))),
        }
    }
}

/// Fixed-size frame header preceding every payload.
///
/// `status` is only meaningful on server frames: 0 means success, anything
/// else carries a gateway error code and the payload holds the message.
/// `request_id` correlates replies with requests; for `Event` frames it
/// carries the subscription id instead.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub op: Op,
    pub status: i16,
    pub request_id: u32,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn request(op: Op, request_id: u32, payload_len: u32) -> Self {
        Self {
            op,
            status: 0,
            request_id,
            payload_len,
        }
    }

    // Safe serialization without unsafe code
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&(self.op as u16).to_be_bytes());
        buf[2..4].copy_from_slice(&self.status.to_be_bytes());
        buf[4..8].copy_from_slice(&self.request_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Result<Self, FlyScanError> {
        let op = Op::try_from(u16::from_be_bytes([buf[0], buf[1]]))?;
        let status = i16::from_be_bytes([buf[2], buf[3]]);
        let request_id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        Ok(Self {
            op,
            status,
            request_id,
            payload_len,
        })
    }
}

/// Append a PV name to a request payload (u16 length prefix + bytes).
pub fn encode_pv(buffer: &mut Vec<u8>, pv: &str) -> Result<(), FlyScanError> {
    let bytes = pv.as_bytes();
    if bytes.is_empty() || bytes.len() > PV_NAME_MAX {
        return Err(FlyScanError::Protocol(format!(
            "PV name length {} outside 1..={PV_NAME_MAX}: {pv}",
            bytes.len()
        )));
    }
    buffer.write_u16::<BigEndian>(bytes.len() as u16)?;
    buffer.extend_from_slice(bytes);
    Ok(())
}

pub fn decode_pv(cursor: &mut std::io::Cursor<&[u8]>) -> Result<String, FlyScanError> {
    let len = cursor.read_u16::<BigEndian>()? as usize;
    if len > PV_NAME_MAX {
        return Err(FlyScanError::Protocol(format!(
            "PV name length {len} exceeds {PV_NAME_MAX}"
        )));
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes)
        .map_err(|_| FlyScanError::Protocol("Invalid UTF-8 in PV name".to_string()))
}

/// Append a value block (u32 count + f64 array) to a payload.
pub fn encode_values(buffer: &mut Vec<u8>, values: &[f64]) -> Result<(), FlyScanError> {
    buffer.write_u32::<BigEndian>(values.len() as u32)?;
    for &value in values {
        buffer.write_f64::<BigEndian>(value)?;
    }
    Ok(())
}

/// Parse a value block from a reply payload.
pub fn decode_values(payload: &[u8]) -> Result<Vec<f64>, FlyScanError> {
    let mut cursor = std::io::Cursor::new(payload);
    let count = cursor.read_u32::<BigEndian>()? as usize;
    let expected = 4 + count * 8;
    if payload.len() < expected {
        return Err(FlyScanError::Protocol(format!(
            "Value block truncated: {} bytes for {count} values",
            payload.len()
        )));
    }
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(cursor.read_f64::<BigEndian>()?);
    }
    Ok(values)
}

/// Parse the error message carried by a non-zero-status reply.
pub fn decode_error(header: &FrameHeader, payload: &[u8]) -> FlyScanError {
    let message = match std::str::from_utf8(payload) {
        Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
        _ => "unspecified gateway error".to_string(),
    };
    FlyScanError::Gateway {
        code: header.status as i32,
        message,
    }
}

/// Helper for reading exact byte counts with better error messages
pub fn read_exact_bytes<const N: usize>(reader: &mut dyn Read) -> Result<[u8; N], FlyScanError> {
    let mut buf = [0u8; N];
    match reader.read_exact(&mut buf) {
        Ok(()) => Ok(buf),
        Err(e) => {
            debug!("Failed to read {} bytes: {} (kind: {:?})", N, e, e.kind());
            Err(FlyScanError::Io(e))
        }
    }
}

/// Helper for reading variable-length payloads with size validation
pub fn read_payload(reader: &mut dyn Read, size: usize) -> Result<Vec<u8>, FlyScanError> {
    if size > MAX_PAYLOAD_SIZE {
        return Err(FlyScanError::Protocol(format!(
            "Payload size {size} exceeds maximum {MAX_PAYLOAD_SIZE}"
        )));
    }
    let mut payload = vec![0u8; size];
    match reader.read_exact(&mut payload) {
        Ok(()) => Ok(payload),
        Err(e) => {
            debug!(
                "Failed to read {} byte payload: {} (kind: {:?})",
                size,
                e,
                e.kind()
            );
            Err(FlyScanError::Io(e))
        }
    }
}
