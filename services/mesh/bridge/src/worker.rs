//! Forwarding worker: drains the outbound queue into the mesh

use crate::queue::BridgeJob;
use crate::stats::BridgeCounters;
use mesh_control::MeshController;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Send queued jobs until `running` is cleared.
///
/// Waits at most `poll` for each job so a cleared flag is noticed promptly.
/// Failed sends are logged and dropped. The receiver is handed back so the
/// caller can discard whatever is still queued.
pub(crate) async fn run_worker(
    controller: MeshController,
    mut jobs: mpsc::Receiver<BridgeJob>,
    running: Arc<AtomicBool>,
    counters: Arc<BridgeCounters>,
    poll: Duration,
) -> mpsc::Receiver<BridgeJob> {
    info!("Bridge forwarding worker started");

    while running.load(Ordering::SeqCst) {
        let job = match tokio::time::timeout(poll, jobs.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => continue,
        };

        debug!("Forwarding {} bytes to {}", job.len(), job.dest);
        match controller.send_to_node(job.dest, &job.datagram).await {
            Ok(()) => counters.record_sent(job.len()),
            Err(e) => warn!("Failed to forward packet to {}: {}", job.dest, e),
        }
    }

    info!("Bridge forwarding worker stopped");
    jobs
}
