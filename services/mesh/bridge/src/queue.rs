//! Bounded outbound queue between the bridge and the forwarding worker

use crate::error::BridgeError;
use bytes::Bytes;
use mesh_routing::HwAddr;
use tokio::sync::mpsc::{self, error::TrySendError};

/// A framed datagram waiting for transmission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeJob {
    /// Hardware address of the node owning the destination subnet
    pub dest: HwAddr,
    /// Header plus payload
    pub datagram: Bytes,
}

impl BridgeJob {
    /// Datagram length in bytes
    pub fn len(&self) -> usize {
        self.datagram.len()
    }

    /// Whether the datagram is empty
    pub fn is_empty(&self) -> bool {
        self.datagram.is_empty()
    }
}

/// Producer side of the outbound queue.
///
/// Enqueueing never waits: a full queue drops the job.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    tx: mpsc::Sender<BridgeJob>,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` jobs (at least one)
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BridgeJob>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue a job without waiting
    pub fn try_enqueue(&self, job: BridgeJob) -> Result<(), BridgeError> {
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(BridgeError::ResourceExhausted {
                capacity: self.capacity(),
            }),
            Err(TrySendError::Closed(_)) => {
                Err(BridgeError::InvalidState("outbound queue closed".to_string()))
            }
        }
    }

    /// Jobs currently queued
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Whether no job is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of queued jobs
    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}
