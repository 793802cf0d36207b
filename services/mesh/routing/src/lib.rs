//! Hardware addresses, subnet ids, node records and the bounded route table for mesh.
//!
//! Every mesh node owns a private /24 derived from its own hardware address:
//! subnet id `n` maps to `192.168.(10+n).0/24`. This crate provides the
//! addressing helpers for that convention and the route table used to find
//! which node owns a given subnet.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
pub mod table;

pub use addr::*;
pub use table::*;
