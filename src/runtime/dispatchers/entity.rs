//! Entity dispatcher implementation for Runtime
//!
//! The provider hands out at most one operation per entity at a time, so
//! operations on one entity run strictly in enqueue order.

use crate::entity::{EntityContext, EntityError, EntityStateUpdate};
use crate::providers::{EntityCaller, EntityItem, WorkItem};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

use super::super::Runtime;

impl Runtime {
    pub(in crate::runtime) fn start_entity_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.entity_concurrency;
        let shutdown = self.shutdown_flag.clone();

        tokio::spawn(async move {
            let mut worker_handles = Vec::new();

            for worker_idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let shutdown = Arc::clone(&shutdown);
                let worker_id = format!("entity-{worker_idx}-{}", rt.runtime_id);
                let handle = tokio::spawn(async move {
                    loop {
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        match rt.history_store.fetch_entity_item(rt.options.entity_lock_timeout).await {
                            Ok(Some((item, token))) => rt.execute_entity_item(item, &token, &worker_id).await,
                            Ok(None) => tokio::time::sleep(rt.idle_sleep()).await,
                            Err(e) => {
                                warn!(
                                    target: "durable_e2e::runtime",
                                    worker_id = %worker_id,
                                    error = %e,
                                    "Error fetching entity item"
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

    async fn execute_entity_item(self: &Arc<Self>, item: EntityItem, token: &str, worker_id: &str) {
        let EntityItem {
            entity,
            operation,
            input,
            caller,
            state,
        } = item;

        let result = match self.entity_registry.get(&entity.name) {
            Some(handler) => {
                let ctx = EntityContext::new(entity.clone(), operation.clone(), input, state);
                match AssertUnwindSafe(handler.invoke(ctx.clone())).catch_unwind().await {
                    Ok(Ok(output)) => Ok((output, ctx.state_update())),
                    Ok(Err(e)) => Err(e),
                    Err(payload) => {
                        let msg = super::super::panic_message(&*payload)
                            .unwrap_or_else(|| "entity panicked".to_string());
                        Err(EntityError::operation_failed(format!("Operation '{operation}' panicked: {msg}")))
                    }
                }
            }
            None => Err(EntityError::unregistered(&entity)),
        };

        let (state_update, reply) = match result {
            Ok((output, update)) => {
                tracing::debug!(
                    target: "durable_e2e::runtime",
                    entity = %entity,
                    operation = %operation,
                    worker_id = %worker_id,
                    "Entity operation completed"
                );
                self.metrics.record_entity_operation(true);
                let reply = caller.map(|EntityCaller { instance, execution_id, id }| WorkItem::EntityCompleted {
                    instance,
                    execution_id,
                    id,
                    result: output,
                });
                (update, reply)
            }
            Err(error) => {
                tracing::warn!(
                    target: "durable_e2e::runtime",
                    entity = %entity,
                    operation = %operation,
                    worker_id = %worker_id,
                    error_kind = ?error.kind,
                    error = %error.message,
                    "Entity operation failed"
                );
                self.metrics.record_entity_operation(false);
                let reply = caller.map(|EntityCaller { instance, execution_id, id }| WorkItem::EntityFailed {
                    instance,
                    execution_id,
                    id,
                    error,
                });
                (EntityStateUpdate::Unchanged, reply)
            }
        };

        if let Err(e) = self.history_store.ack_entity_item(token, state_update, reply).await {
            warn!(
                target: "durable_e2e::runtime",
                entity = %entity,
                operation = %operation,
                worker_id = %worker_id,
                error = %e,
                "Failed to ack entity item"
            );
            if e.is_retryable() {
                let _ = self
                    .history_store
                    .abandon_entity_item(token, Some(Duration::from_millis(50)))
                    .await;
            }
        }
    }
}
