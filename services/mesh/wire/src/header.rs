//! Bridge header processing for the wire protocol.
//!
//! This module defines the 12-byte header that prefixes every bridged IP
//! packet and the payload checksum it carries.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Magic identifying a bridge datagram ("GEO" in the low 24 bits)
pub const BRIDGE_MAGIC: u32 = 0x0047_454F;

/// Wire protocol version
pub const BRIDGE_VERSION: u8 = 1;

/// Bridge header size in bytes
pub const BRIDGE_HEADER_SIZE: usize = 12;

/// Bridge header structure (12 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeHeader {
    /// Magic number (must be BRIDGE_MAGIC)
    pub magic: u32,
    /// Protocol version (must be 1)
    pub version: u8,
    /// Subnet id of the sending node
    pub src_subnet: u8,
    /// Subnet id of the receiving node
    pub dest_subnet: u8,
    /// Reserved field (sent as zero, ignored on receipt)
    pub reserved: u8,
    /// Length of the payload that follows the header
    pub payload_len: u16,
    /// Checksum over exactly payload_len bytes of payload
    pub checksum: u16,
}

impl BridgeHeader {
    /// Create a header describing `payload`, which must fit in `payload_len`
    pub(crate) fn for_payload(src_subnet: u8, dest_subnet: u8, payload: &[u8]) -> Self {
        Self {
            magic: BRIDGE_MAGIC,
            version: BRIDGE_VERSION,
            src_subnet,
            dest_subnet,
            reserved: 0,
            payload_len: payload.len() as u16,
            checksum: checksum(payload),
        }
    }

    /// Encode the header to bytes (little-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.magic);
        buf.put_u8(self.version);
        buf.put_u8(self.src_subnet);
        buf.put_u8(self.dest_subnet);
        buf.put_u8(self.reserved);
        buf.put_u16_le(self.payload_len);
        buf.put_u16_le(self.checksum);
    }

    /// Decode the header from the front of a datagram (little-endian).
    ///
    /// Only the magic is checked here; [`BridgeHeader::validate`] and
    /// [`crate::BridgeFrame::parse`] check the rest.
    pub fn decode(mut buf: &[u8]) -> Result<Self, crate::WireError> {
        if buf.len() < BRIDGE_HEADER_SIZE {
            return Err(crate::WireError::Incomplete(buf.len()));
        }

        let magic = buf.get_u32_le();
        if magic != BRIDGE_MAGIC {
            return Err(crate::WireError::Magic(magic));
        }

        Ok(Self {
            magic,
            version: buf.get_u8(),
            src_subnet: buf.get_u8(),
            dest_subnet: buf.get_u8(),
            reserved: buf.get_u8(),
            payload_len: buf.get_u16_le(),
            checksum: buf.get_u16_le(),
        })
    }

    /// Check magic and version
    pub fn validate(&self) -> Result<(), crate::WireError> {
        if self.magic != BRIDGE_MAGIC {
            return Err(crate::WireError::Magic(self.magic));
        }

        if self.version != BRIDGE_VERSION {
            return Err(crate::WireError::Version(self.version));
        }

        Ok(())
    }
}

/// Payload checksum: byte sum folded to 16 bits, then complemented.
///
/// This is corruption detection only. It is not the Internet checksum (bytes
/// are summed individually, not as 16-bit words) and must stay byte-for-byte
/// identical for peers to interoperate.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(u32::from(b)));

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}
