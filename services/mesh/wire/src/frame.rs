//! Bridge datagram framing.
//!
//! Builds complete bridge datagrams and parses received ones into a borrowed
//! view over header and payload.

use crate::header::{checksum, BridgeHeader, BRIDGE_HEADER_SIZE};
use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};

/// Largest payload a single bridge datagram can describe
pub const MAX_BRIDGE_PAYLOAD: usize = u16::MAX as usize;

/// Build a bridge datagram carrying `payload` from `src_subnet` to `dest_subnet`
pub fn encapsulate(src_subnet: u8, dest_subnet: u8, payload: &[u8]) -> Result<Bytes, WireError> {
    if payload.len() > MAX_BRIDGE_PAYLOAD {
        return Err(WireError::Size(payload.len()));
    }

    let header = BridgeHeader::for_payload(src_subnet, dest_subnet, payload);

    let mut buf = BytesMut::with_capacity(BRIDGE_HEADER_SIZE + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Parsed view of a received bridge datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeFrame<'a> {
    /// Decoded header
    pub header: BridgeHeader,
    /// Payload following the header
    pub payload: &'a [u8],
}

impl<'a> BridgeFrame<'a> {
    /// Parse a datagram, checking size, magic, version and length in that order.
    ///
    /// The checksum is left to [`BridgeFrame::verify_checksum`] so callers can
    /// apply their own addressing checks first.
    pub fn parse(datagram: &'a [u8]) -> Result<Self, WireError> {
        let header = BridgeHeader::decode(datagram)?;
        header.validate()?;

        let declared = header.payload_len as usize;
        let actual = datagram.len() - BRIDGE_HEADER_SIZE;
        if declared != actual {
            return Err(WireError::Length { declared, actual });
        }

        Ok(Self {
            header,
            payload: &datagram[BRIDGE_HEADER_SIZE..],
        })
    }

    /// Recompute the payload checksum and compare it with the header
    pub fn verify_checksum(&self) -> Result<(), WireError> {
        let actual = checksum(self.payload);
        if actual != self.header.checksum {
            return Err(WireError::Checksum {
                expected: self.header.checksum,
                actual,
            });
        }
        Ok(())
    }

    /// Total datagram length
    pub fn wire_len(&self) -> usize {
        BRIDGE_HEADER_SIZE + self.payload.len()
    }
}
