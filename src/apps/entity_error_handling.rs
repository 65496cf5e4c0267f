//! Entity operation failures seen by calling orchestrations.
use super::{AppEnv, Registries};
use crate::entity::{EntityContext, EntityError, EntityId};
use crate::OrchestrationContext;

pub const THROW_ENTITY_ORCHESTRATION: &str = "ThrowEntityOrchestration";
pub const CATCH_ENTITY_ORCHESTRATION: &str = "CatchEntityOrchestration";
pub const RETRY_ENTITY_ORCHESTRATION: &str = "RetryEntityOrchestration";

pub const COUNTER: &str = "Counter";
pub const COUNTER_KEY: &str = "myCounter";
pub const GET: &str = "get";

fn counter() -> EntityId {
    EntityId::new(COUNTER, COUNTER_KEY)
}

pub fn register(mut regs: Registries, env: &AppEnv) -> Registries {
    regs.orchestrations = regs
        .orchestrations
        .register(THROW_ENTITY_ORCHESTRATION, |ctx: OrchestrationContext, _input: String| async move {
            ctx.call_entity(counter(), GET, ctx.instance_id())
                .into_entity()
                .await
                .map_err(|e| e.to_string())?;
            Ok("Success".to_string())
        })
        .register(CATCH_ENTITY_ORCHESTRATION, |ctx: OrchestrationContext, _input: String| async move {
            match ctx.call_entity(counter(), GET, ctx.instance_id()).into_entity().await {
                Ok(_) => Ok("Success".to_string()),
                Err(e) => Ok(e.to_string()),
            }
        })
        .register(RETRY_ENTITY_ORCHESTRATION, |ctx: OrchestrationContext, _input: String| async move {
            if let Err(e) = ctx.call_entity(counter(), GET, ctx.instance_id()).into_entity().await {
                ctx.trace_warn(format!("entity call failed, calling again: {}", e.message));
                ctx.call_entity(counter(), GET, ctx.instance_id())
                    .into_entity()
                    .await
                    .map_err(|e| e.to_string())?;
            }
            Ok("Success".to_string())
        });

    let faults = env.faults.clone();
    regs.entities = regs.entities.register(COUNTER, move |ctx: EntityContext| {
        let faults = faults.clone();
        async move {
            if ctx.operation() != GET {
                return Err(EntityError::unknown_operation(ctx.entity_id(), ctx.operation()));
            }
            let instance = ctx.input();
            if instance.is_empty() {
                return Err(EntityError::operation_failed(
                    "Did not get a valid instanceId as input to the entity",
                ));
            }
            if faults.should_fail(COUNTER, instance) {
                tracing::warn!(
                    target: "durable_e2e::apps",
                    entity = %ctx.entity_id(),
                    instance_id = %instance,
                    inner = "Inner exception message",
                    "Injected entity failure"
                );
                return Err(EntityError::operation_failed("This entity failed")
                    .with_details("More information about the failure"));
            }
            Ok("0".to_string())
        }
    });
    regs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apps::FaultInjector;
    use crate::config::ScenarioConfig;
    use crate::entity::EntityErrorKind;
    use crate::runtime::EntityHandler;

    fn counter_handler() -> std::sync::Arc<dyn EntityHandler> {
        let env = AppEnv {
            faults: FaultInjector::new(1),
            scenarios: ScenarioConfig::default(),
        };
        let (_, _, entities) = register(Registries::default(), &env).build().unwrap();
        entities.get(COUNTER).unwrap()
    }

    /// Test: the first call per instance fails without exposing the inner cause
    #[tokio::test]
    async fn test_counter_fails_first_call() {
        let handler = counter_handler();
        let ctx = || EntityContext::new(counter(), GET, "inst-1", None);

        let err = handler.invoke(ctx()).await.unwrap_err();
        assert_eq!(err.kind, EntityErrorKind::OperationFailed);
        assert_eq!(err.to_string(), "This entity failed\r\nMore information about the failure");
        assert!(!err.to_string().contains("Inner exception message"));

        assert_eq!(handler.invoke(ctx()).await.unwrap(), "0");
    }

    /// Test: unknown operations and missing input are rejected
    #[tokio::test]
    async fn test_counter_rejects_bad_calls() {
        let handler = counter_handler();
        let err = handler
            .invoke(EntityContext::new(counter(), "add", "inst", None))
            .await
            .unwrap_err();
        assert_eq!(err.kind, EntityErrorKind::UnknownOperation);

        let err = handler
            .invoke(EntityContext::new(counter(), GET, "", None))
            .await
            .unwrap_err();
        assert_eq!(err.message, "Did not get a valid instanceId as input to the entity");
    }
}
