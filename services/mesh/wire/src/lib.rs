//! Bridge datagram framing, checksum and encoding/decoding for mesh.
//!
//! This crate provides the wire format used to carry IP packets between the
//! local subnets of two mesh nodes. Every bridge datagram is a single mesh
//! transport payload: a fixed 12-byte header followed by the encapsulated
//! packet. Payloads are never fragmented.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 magic            | 0x0047454F ("GEO")         |
//! +----------------------+----------------------------+
//! | u8 version           | 1                          |
//! +----------------------+----------------------------+
//! | u8 src_subnet        | sender's subnet id         |
//! +----------------------+----------------------------+
//! | u8 dest_subnet       | receiver's subnet id       |
//! +----------------------+----------------------------+
//! | u8 reserved          | 0                          |
//! +----------------------+----------------------------+
//! | u16 payload_len      | length of bytes that follow|
//! +----------------------+----------------------------+
//! | u16 checksum         | folded byte sum of payload |
//! +----------------------+----------------------------+
//! | payload              | payload_len bytes          |
//! +----------------------+----------------------------+
//! ```
//!
//! All integers are little-endian.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod header;

// Re-export main types
pub use error::WireError;
pub use frame::{encapsulate, BridgeFrame, MAX_BRIDGE_PAYLOAD};
pub use header::{checksum, BridgeHeader, BRIDGE_HEADER_SIZE, BRIDGE_MAGIC, BRIDGE_VERSION};
