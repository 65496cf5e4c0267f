//! Entity with structured state set and read back by an orchestration.
use serde::{Deserialize, Serialize};

use super::{AppEnv, Registries};
use crate::OrchestrationContext;
use crate::entity::{EntityContext, EntityError, EntityId};

pub const CLASS_BASED_ENTITY_ORCHESTRATION: &str = "ClassBasedEntityOrchestration";
pub const TEST_ENTITY: &str = "TestEntity";
pub const SINGLETON: &str = "singleton";
pub const SET_STATE: &str = "SetState";
pub const GET_STATE: &str = "GetState";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateContainer {
    state: String,
}

pub fn register(mut regs: Registries, _env: &AppEnv) -> Registries {
    regs.orchestrations = regs.orchestrations.register(
        CLASS_BASED_ENTITY_ORCHESTRATION,
        |ctx: OrchestrationContext, _input: String| async move {
            let entity = EntityId::new(TEST_ENTITY, SINGLETON);
            ctx.call_entity(entity.clone(), SET_STATE, "42")
                .into_entity()
                .await
                .map_err(|e| e.to_string())?;
            ctx.call_entity(entity, GET_STATE, "")
                .into_entity()
                .await
                .map_err(|e| e.to_string())
        },
    );
    regs.entities = regs.entities.register(TEST_ENTITY, |ctx: EntityContext| async move { test_entity(&ctx) });
    regs
}

fn test_entity(ctx: &EntityContext) -> Result<String, EntityError> {
    match ctx.operation() {
        SET_STATE => {
            let number: i64 = ctx.input_typed()?;
            let mut current = ctx.get_state::<StateContainer>()?.unwrap_or_default();
            current.state = format!(
                "IConfiguration: yes, MyInjectedService: yes, BlobContainerClient: yes, Number: {number}"
            );
            ctx.set_state(&current)?;
            Ok(String::new())
        }
        GET_STATE => match ctx.get_state::<StateContainer>()? {
            Some(current) => Ok(current.state),
            None => Err(EntityError::operation_failed("State not set")),
        },
        other => Err(EntityError::unknown_operation(ctx.entity_id(), other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityStateUpdate;

    fn entity() -> EntityId {
        EntityId::new(TEST_ENTITY, SINGLETON)
    }

    /// Test: reading before any set fails
    #[test]
    fn test_get_without_state() {
        let ctx = EntityContext::new(entity(), GET_STATE, "", None);
        assert_eq!(test_entity(&ctx).unwrap_err().message, "State not set");
        assert_eq!(ctx.state_update(), EntityStateUpdate::Unchanged);
    }

    /// Test: set stores the formatted string and get returns it
    #[test]
    fn test_set_then_get() {
        let set = EntityContext::new(entity(), SET_STATE, "42", None);
        test_entity(&set).unwrap();
        let EntityStateUpdate::Set(stored) = set.state_update() else {
            panic!("expected state to be set");
        };

        let get = EntityContext::new(entity(), GET_STATE, "", Some(stored));
        assert_eq!(
            test_entity(&get).unwrap(),
            "IConfiguration: yes, MyInjectedService: yes, BlobContainerClient: yes, Number: 42"
        );
    }
}
