//! Dispatcher implementations for Runtime
//!
//! - `orchestration`: fetches instance batches and runs orchestration turns
//! - `worker`: executes activities
//! - `entity`: applies entity operations one at a time per entity

mod entity;
mod orchestration;
mod worker;

use crate::providers::Provider;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Calculate the renewal interval based on lock timeout and buffer settings.
///
/// - If timeout >= 15s: renew at (timeout - buffer), at least 1s
/// - If timeout < 15s: renew at half the timeout (buffer ignored)
pub(super) fn calculate_renewal_interval(lock_timeout: Duration, buffer: Duration) -> Duration {
    if lock_timeout >= Duration::from_secs(15) {
        let buffer = buffer.min(lock_timeout);
        let interval = lock_timeout.checked_sub(buffer).unwrap_or(Duration::from_secs(1));
        interval.max(Duration::from_secs(1))
    } else {
        (lock_timeout / 2).max(Duration::from_millis(100))
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) enum LockedQueue {
    Orchestrator,
    Worker,
}

/// Keep a peek-lock alive while the item is processed. Abort the handle once acked.
pub(super) fn spawn_lock_renewal_task(
    store: Arc<dyn Provider>,
    queue: LockedQueue,
    token: String,
    lock_timeout: Duration,
    buffer: Duration,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let renewal_interval = calculate_renewal_interval(lock_timeout, buffer);

    tracing::debug!(
        target: "durable_e2e::runtime::dispatchers",
        lock_token = %token,
        queue = ?queue,
        lock_timeout_ms = lock_timeout.as_millis() as u64,
        renewal_interval_ms = renewal_interval.as_millis() as u64,
        "Spawning lock renewal task"
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(renewal_interval);
        interval.tick().await; // first tick is immediate

        loop {
            interval.tick().await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            let result = match queue {
                LockedQueue::Orchestrator => store.renew_orchestration_item_lock(&token, lock_timeout).await,
                LockedQueue::Worker => store.renew_work_item_lock(&token, lock_timeout).await,
            };
            match result {
                Ok(()) => {
                    tracing::trace!(
                        target: "durable_e2e::runtime::dispatchers",
                        lock_token = %token,
                        "Lock renewed"
                    );
                }
                Err(e) => {
                    // Lock is gone: acked, abandoned or expired
                    tracing::debug!(
                        target: "durable_e2e::runtime::dispatchers",
                        lock_token = %token,
                        error = %e,
                        "Failed to renew lock"
                    );
                    break;
                }
            }
        }
    })
}
