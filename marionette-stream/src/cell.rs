#![forbid(unsafe_code)]

//! Cell wire format.
//!
//! ```text
//! u32 total_size | u32 payload_len | u32 uuid | u32 instance_id
//! u32 stream_id  | u32 sequence_id | u8 type  | payload | zero padding
//! ```
//!
//! All integers are big endian. `total_size` covers the whole record including
//! itself, so a cell declared larger than its payload is zero padded up to the
//! declared length and the padding is dropped again on decode.

use crate::errors::{Error, Result};
use bytes::{Buf, BufMut};
use std::cmp::Ordering;

/// Fixed header size in bytes.
pub const CELL_HEADER_SIZE: usize = 25;

/// Upper bound for a single stream write and for a marshalled cell.
pub const MAX_CELL_LENGTH: usize = 262_144;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CellType {
    Normal = 1,
    EndOfStream = 2,
    Negotiate = 3,
}

impl TryFrom<u8> for CellType {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            1 => Ok(CellType::Normal),
            2 => Ok(CellType::EndOfStream),
            3 => Ok(CellType::Negotiate),
            other => Err(Error::invalid(format!("unknown cell type {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cell {
    pub cell_type: CellType,
    pub payload: Vec<u8>,
    /// Declared marshalled size; anything beyond header + payload is padding.
    pub length: u32,
    pub stream_id: u32,
    pub sequence_id: u32,
    pub uuid: u32,
    pub instance_id: u32,
}

impl Cell {
    pub fn new(cell_type: CellType, stream_id: u32, sequence_id: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self { cell_type, payload: payload.into(), length: 0, stream_id, sequence_id, uuid: 0, instance_id: 0 }
    }

    /// Empty keepalive cell padded to `length` bytes.
    pub fn empty(length: usize) -> Self {
        Self::new(CellType::Normal, 0, 0, Vec::new()).with_length(length)
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = u32::try_from(length).unwrap_or(u32::MAX);
        self
    }

    pub fn with_identity(mut self, uuid: u32, instance_id: u32) -> Self {
        self.uuid = uuid;
        self.instance_id = instance_id;
        self
    }

    /// Stream id zero with no payload carries nothing for any stream.
    pub fn is_heartbeat(&self) -> bool {
        self.stream_id == 0 && self.payload.is_empty()
    }

    pub fn padding(&self) -> usize {
        (self.length as usize).saturating_sub(CELL_HEADER_SIZE + self.payload.len())
    }

    /// Marshalled size in bytes.
    pub fn size(&self) -> usize {
        CELL_HEADER_SIZE + self.payload.len() + self.padding()
    }

    /// Cells order by sequence id alone.
    pub fn cmp_sequence(&self, other: &Self) -> Ordering {
        self.sequence_id.cmp(&other.sequence_id)
    }

    pub fn marshal(&self) -> Result<Vec<u8>> {
        let size = self.size();
        if size > MAX_CELL_LENGTH {
            return Err(Error::invalid(format!("cell of {size} bytes exceeds {MAX_CELL_LENGTH}")));
        }
        let mut out = Vec::with_capacity(size);
        out.put_u32(size as u32);
        out.put_u32(self.payload.len() as u32);
        out.put_u32(self.uuid);
        out.put_u32(self.instance_id);
        out.put_u32(self.stream_id);
        out.put_u32(self.sequence_id);
        out.put_u8(self.cell_type as u8);
        out.put_slice(&self.payload);
        out.put_bytes(0, self.padding());
        if out.len() != size {
            return Err(Error::invalid(format!("marshalled {} bytes, expected {size}", out.len())));
        }
        Ok(out)
    }

    /// Decode one cell from the front of `buf`. Trailing bytes after
    /// `total_size` are ignored.
    pub fn unmarshal(buf: &[u8]) -> Result<Self> {
        let mut head = buf;
        if head.remaining() < 4 {
            return Err(Error::TruncatedCell);
        }
        let total = head.get_u32() as usize;
        if total < CELL_HEADER_SIZE {
            return Err(Error::invalid(format!("total size {total} below header size")));
        }
        if total > MAX_CELL_LENGTH {
            return Err(Error::invalid(format!("total size {total} exceeds {MAX_CELL_LENGTH}")));
        }
        if head.remaining() < total - 4 {
            return Err(Error::TruncatedCell);
        }
        let mut body = &head[..total - 4];
        let payload_len = body.get_u32() as usize;
        let uuid = body.get_u32();
        let instance_id = body.get_u32();
        let stream_id = body.get_u32();
        let sequence_id = body.get_u32();
        let cell_type = CellType::try_from(body.get_u8())?;
        if body.remaining() < payload_len {
            return Err(Error::TruncatedCell);
        }
        let payload = body[..payload_len].to_vec();
        Ok(Self { cell_type, payload, length: total as u32, stream_id, sequence_id, uuid, instance_id })
    }
}

/// Logical identity only; type and padding are ignored.
impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        self.payload == other.payload
            && self.stream_id == other.stream_id
            && self.uuid == other.uuid
            && self.instance_id == other.instance_id
            && self.sequence_id == other.sequence_id
    }
}

impl Eq for Cell {}
