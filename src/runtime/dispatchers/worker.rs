//! Worker (activity) dispatcher implementation for Runtime
//!
//! - Spawns concurrent activity workers
//! - Executes each `ActivityExecute` item with lock renewal
//! - Acks with the completion or failure in one provider call

use crate::providers::WorkItem;
use crate::{ActivityContext, AppErrorKind, ConfigErrorKind, ErrorDetails};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use super::super::Runtime;
use super::{LockedQueue, spawn_lock_renewal_task};

enum ActivityOutcome {
    Success,
    AppError,
    ConfigError,
}

impl Runtime {
    /// Start the worker dispatcher with N concurrent workers for executing activities
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.worker_concurrency;
        let shutdown = self.shutdown_flag.clone();

        tokio::spawn(async move {
            let mut worker_handles = Vec::new();

            for worker_idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let shutdown = Arc::clone(&shutdown);
                let worker_id = format!("work-{worker_idx}-{}", rt.runtime_id);
                let handle = tokio::spawn(async move {
                    loop {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        match rt.history_store.fetch_work_item(rt.options.worker_lock_timeout).await {
                            Ok(Some((item, token))) => rt.execute_work_item(item, token, &worker_id).await,
                            Ok(None) => tokio::time::sleep(rt.idle_sleep()).await,
                            Err(e) => {
                                warn!(
                                    target: "durable_e2e::runtime",
                                    worker_id = %worker_id,
                                    error = %e,
                                    "Error fetching work item"
                                );
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                        }
                    }
                });
                worker_handles.push(handle);
            }

            for handle in worker_handles {
                let _ = handle.await;
            }
        })
    }

    async fn execute_work_item(self: &Arc<Self>, item: WorkItem, token: String, worker_id: &str) {
        let (instance, execution_id, id, orchestration, name, input) = match item {
            WorkItem::ActivityExecute {
                instance,
                execution_id,
                id,
                orchestration,
                name,
                input,
            } => (instance, execution_id, id, orchestration, name, input),
            other => {
                error!(target: "durable_e2e::runtime", item = ?other, "Unexpected work item in worker queue, discarding");
                let _ = self.history_store.ack_work_item(&token, None).await;
                return;
            }
        };

        let renewal_handle = spawn_lock_renewal_task(
            Arc::clone(&self.history_store),
            LockedQueue::Worker,
            token.clone(),
            self.options.worker_lock_timeout,
            self.options.worker_lock_renewal_buffer,
            Arc::clone(&self.shutdown_flag),
        );

        let activity_ctx = ActivityContext::new(
            instance.clone(),
            execution_id,
            orchestration,
            name.clone(),
            id,
            worker_id.to_string(),
        );

        tracing::debug!(
            target: "durable_e2e::runtime",
            instance_id = %instance,
            execution_id = %execution_id,
            activity_name = %name,
            activity_id = %id,
            worker_id = %worker_id,
            "Activity started"
        );
        let start_time = std::time::Instant::now();

        let (completion, outcome) = match self.activity_registry.get(&name) {
            Some(handler) => match AssertUnwindSafe(handler.invoke(activity_ctx, input))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    let msg = super::super::panic_message(&*payload)
                        .unwrap_or_else(|| "activity panicked".to_string());
                    Err(format!("panicked: {msg}"))
                }) {
                Ok(result) => {
                    tracing::debug!(
                        target: "durable_e2e::runtime",
                        instance_id = %instance,
                        execution_id = %execution_id,
                        activity_name = %name,
                        activity_id = %id,
                        worker_id = %worker_id,
                        outcome = "success",
                        duration_ms = start_time.elapsed().as_millis() as u64,
                        result_size = result.len(),
                        "Activity completed"
                    );
                    (
                        WorkItem::ActivityCompleted {
                            instance: instance.clone(),
                            execution_id,
                            id,
                            result,
                        },
                        ActivityOutcome::Success,
                    )
                }
                Err(error) => {
                    tracing::warn!(
                        target: "durable_e2e::runtime",
                        instance_id = %instance,
                        execution_id = %execution_id,
                        activity_name = %name,
                        activity_id = %id,
                        worker_id = %worker_id,
                        outcome = "app_error",
                        duration_ms = start_time.elapsed().as_millis() as u64,
                        error = %error,
                        "Activity failed (application error)"
                    );
                    (
                        WorkItem::ActivityFailed {
                            instance: instance.clone(),
                            execution_id,
                            id,
                            details: ErrorDetails::Application {
                                kind: AppErrorKind::ActivityFailed,
                                message: format!("Activity function '{name}' failed: {error}"),
                                retryable: false,
                            },
                        },
                        ActivityOutcome::AppError,
                    )
                }
            },
            None => {
                tracing::error!(
                    target: "durable_e2e::runtime",
                    instance_id = %instance,
                    execution_id = %execution_id,
                    activity_name = %name,
                    activity_id = %id,
                    worker_id = %worker_id,
                    outcome = "system_error",
                    error_type = "unregistered",
                    "Activity failed (unregistered)"
                );
                (
                    WorkItem::ActivityFailed {
                        instance: instance.clone(),
                        execution_id,
                        id,
                        details: ErrorDetails::Configuration {
                            kind: ConfigErrorKind::UnregisteredActivity,
                            resource: name.clone(),
                            message: None,
                        },
                    },
                    ActivityOutcome::ConfigError,
                )
            }
        };

        renewal_handle.abort();

        match self.history_store.ack_work_item(&token, Some(completion)).await {
            Ok(()) => match outcome {
                ActivityOutcome::Success => self.metrics.record_activity_success(),
                ActivityOutcome::AppError => self.metrics.record_activity_app_error(),
                ActivityOutcome::ConfigError => self.metrics.record_activity_config_error(),
            },
            Err(e) if e.is_retryable() => {
                warn!(
                    target: "durable_e2e::runtime",
                    instance_id = %instance,
                    execution_id,
                    id,
                    worker_id = %worker_id,
                    error = %e,
                    "worker: ack failed, abandoning for redelivery"
                );
                self.metrics.record_activity_infra_error();
                let _ = self.history_store.abandon_work_item(&token, Some(Duration::from_millis(50))).await;
            }
            Err(e) => {
                // The row is gone: the orchestration cancelled this activity or the lock expired
                warn!(
                    target: "durable_e2e::runtime",
                    instance_id = %instance,
                    execution_id,
                    id,
                    worker_id = %worker_id,
                    error = %e,
                    "worker: ack rejected, dropping result"
                );
                self.metrics.record_activity_infra_error();
            }
        }
    }
}
