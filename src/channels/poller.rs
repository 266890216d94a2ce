//! Polling daemon: runs relay passes, pausing a fixed interval after each,
//! until told to stop.
//!
//! A pass is never cancelled midway. Its result is logged and the loop
//! sleeps for the poll interval; no error ends the daemon.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::pipeline::Relay;

/// Spawn the background task that drives relay passes.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop after
/// the current pass.
pub fn spawn_daemon(relay: Arc<Relay>, interval: Duration) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Relay daemon started");

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Relay daemon shutting down");
                return;
            }

            match relay.run_pass().await {
                Ok(report) if report.listed == 0 => info!("Mailbox empty"),
                Ok(report) => info!(
                    listed = report.listed,
                    discarded = report.discarded,
                    ignored = report.ignored,
                    bounces = report.bounces,
                    unsubscribed = report.unsubscribed,
                    test_probes = report.test_probes,
                    broadcasts = report.broadcasts,
                    sent = report.sent,
                    rejected = report.rejected,
                    fetch_failures = report.fetch_failures,
                    "Relay pass complete"
                ),
                Err(e) => error!("Relay pass failed: {e}"),
            }

            // The full delay follows every pass, however long it took.
            tokio::time::sleep(interval).await;
        }
    });

    (handle, shutdown_flag)
}
