//! Bounded route table of reachable mesh nodes

use crate::addr::{HwAddr, SubnetId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Default route table capacity
pub const DEFAULT_ROUTE_TABLE_CAPACITY: usize = 50;

/// A reachable mesh node as reported by the transport's routing table.
///
/// Only the address and derived subnet id are authoritative. The transport
/// does not report layer, signal strength or role for remote nodes, so those
/// fields stay `None` unless some other source fills them in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Hardware address
    pub addr: HwAddr,
    /// Subnet id derived from the address
    pub subnet_id: SubnetId,
    /// Layer (hop depth from the root), if known
    pub layer: Option<u8>,
    /// Signal strength in dBm, if known
    pub rssi: Option<i8>,
    /// Whether the node is the root, if known
    pub is_root: Option<bool>,
}

impl NodeRecord {
    /// Create a record from an address alone
    pub fn from_addr(addr: HwAddr) -> Self {
        Self {
            addr,
            subnet_id: SubnetId::from_hw_addr(&addr),
            layer: None,
            rssi: None,
            is_root: None,
        }
    }
}

/// Two or more nodes that derived the same subnet id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetCollision {
    /// The contested subnet
    pub subnet_id: SubnetId,
    /// Every node claiming it, in address order
    pub nodes: Vec<HwAddr>,
    /// Whether this node is one of the claimants
    pub involves_local: bool,
}

/// Ordered, bounded table of reachable nodes
#[derive(Debug, Clone)]
pub struct RouteTable {
    /// Maximum number of records kept
    capacity: usize,
    /// Records in transport order
    nodes: Vec<NodeRecord>,
}

impl RouteTable {
    /// Create an empty table
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            nodes: Vec::with_capacity(capacity),
        }
    }

    /// Replace the whole table with a fresh routing-table read.
    ///
    /// Entries past capacity are dropped.
    pub fn replace<I>(&mut self, addrs: I)
    where
        I: IntoIterator<Item = HwAddr>,
    {
        self.nodes.clear();

        let mut dropped = 0usize;
        for addr in addrs {
            if self.nodes.len() < self.capacity {
                self.nodes.push(NodeRecord::from_addr(addr));
            } else {
                dropped += 1;
            }
        }

        if dropped > 0 {
            warn!(
                "Route table full: kept {} nodes, dropped {}",
                self.capacity, dropped
            );
        }
        debug!("Route table updated: {} nodes", self.nodes.len());
    }

    /// Clear all records
    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    /// Find the first node owning `subnet_id`
    pub fn find_by_subnet(&self, subnet_id: SubnetId) -> Option<&NodeRecord> {
        self.nodes.iter().find(|node| node.subnet_id == subnet_id)
    }

    /// Find a node by address
    pub fn get(&self, addr: &HwAddr) -> Option<&NodeRecord> {
        self.nodes.iter().find(|node| node.addr == *addr)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Maximum number of records
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records in transport order
    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    /// Copy of all records
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        self.nodes.clone()
    }

    /// Subnets claimed by more than one node.
    ///
    /// The local node counts as a claimant of `local_subnet` whether or not
    /// the transport lists it in its own routing table.
    pub fn collisions(&self, local_addr: HwAddr, local_subnet: SubnetId) -> Vec<SubnetCollision> {
        let mut owners: BTreeMap<SubnetId, Vec<HwAddr>> = BTreeMap::new();
        owners.entry(local_subnet).or_default().push(local_addr);

        for node in &self.nodes {
            if node.addr == local_addr {
                continue;
            }
            owners.entry(node.subnet_id).or_default().push(node.addr);
        }

        owners
            .into_iter()
            .filter(|(_, nodes)| nodes.len() > 1)
            .map(|(subnet_id, mut nodes)| {
                nodes.sort();
                SubnetCollision {
                    subnet_id,
                    involves_local: subnet_id == local_subnet,
                    nodes,
                }
            })
            .collect()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(DEFAULT_ROUTE_TABLE_CAPACITY)
    }
}
