//! Durable entities: keyed actors whose state is committed only when an
//! operation succeeds.
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::_typed_codec::{Codec, Json};

/// Entity address, displayed as `@name@key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId {
    pub name: String,
    pub key: String,
}

impl EntityId {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }

    /// Parse the `@name@key` form.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix('@')?;
        let (name, key) = rest.split_once('@')?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, key))
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}@{}", self.name, self.key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityErrorKind {
    OperationFailed,
    UnknownOperation,
    UnregisteredEntity,
    Serialization,
}

/// Failure of an entity operation as seen by the caller.
///
/// Only `message` and the optional `details` cross the entity boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityError {
    pub kind: EntityErrorKind,
    pub message: String,
    pub details: Option<String>,
}

impl EntityError {
    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self {
            kind: EntityErrorKind::OperationFailed,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn unknown_operation(entity: &EntityId, operation: &str) -> Self {
        Self {
            kind: EntityErrorKind::UnknownOperation,
            message: format!("Entity {entity} has no operation '{operation}'"),
            details: None,
        }
    }

    pub fn unregistered(entity: &EntityId) -> Self {
        Self {
            kind: EntityErrorKind::UnregisteredEntity,
            message: format!("unregistered:{}", entity.name),
            details: None,
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self {
            kind: EntityErrorKind::Serialization,
            message: message.into(),
            details: None,
        }
    }
}

impl std::fmt::Display for EntityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.details {
            Some(details) => write!(f, "{}\r\n{}", self.message, details),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for EntityError {}

/// How an operation left the entity's stored state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityStateUpdate {
    Unchanged,
    Set(String),
    Delete,
}

#[derive(Debug)]
struct StateCell {
    value: Option<String>,
    dirty: bool,
}

/// Handed to entity handlers for one operation.
#[derive(Debug, Clone)]
pub struct EntityContext {
    entity_id: EntityId,
    operation: String,
    input: String,
    state: Arc<Mutex<StateCell>>,
}

impl EntityContext {
    pub fn new(entity_id: EntityId, operation: impl Into<String>, input: impl Into<String>, state: Option<String>) -> Self {
        Self {
            entity_id,
            operation: operation.into(),
            input: input.into(),
            state: Arc::new(Mutex::new(StateCell {
                value: state,
                dirty: false,
            })),
        }
    }

    fn cell(&self) -> MutexGuard<'_, StateCell> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn input_typed<T: DeserializeOwned>(&self) -> Result<T, EntityError> {
        Json::decode(&self.input).map_err(EntityError::serialization)
    }

    pub fn has_state(&self) -> bool {
        self.cell().value.is_some()
    }

    /// Current state decoded as `T`, `None` when unset.
    pub fn get_state<T: DeserializeOwned>(&self) -> Result<Option<T>, EntityError> {
        match &self.cell().value {
            Some(raw) => Json::decode(raw).map(Some).map_err(EntityError::serialization),
            None => Ok(None),
        }
    }

    pub fn set_state<T: Serialize>(&self, value: &T) -> Result<(), EntityError> {
        let raw = Json::encode(value).map_err(EntityError::serialization)?;
        let mut cell = self.cell();
        cell.value = Some(raw);
        cell.dirty = true;
        Ok(())
    }

    pub fn delete_state(&self) {
        let mut cell = self.cell();
        cell.value = None;
        cell.dirty = true;
    }

    /// State change to commit if the operation succeeds.
    pub(crate) fn state_update(&self) -> EntityStateUpdate {
        let cell = self.cell();
        match (&cell.value, cell.dirty) {
            (_, false) => EntityStateUpdate::Unchanged,
            (Some(v), true) => EntityStateUpdate::Set(v.clone()),
            (None, true) => EntityStateUpdate::Delete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: entity ids display and parse as @name@key
    #[test]
    fn test_entity_id_display_parse() {
        let id = EntityId::new("Counter", "myCounter");
        assert_eq!(id.to_string(), "@Counter@myCounter");
        assert_eq!(EntityId::parse("@Counter@myCounter"), Some(id));
        assert_eq!(EntityId::parse("Counter@x"), None);
        assert_eq!(EntityId::parse("@@x"), None);
    }

    /// Test: details are appended after CRLF
    #[test]
    fn test_entity_error_display_with_details() {
        let err = EntityError::operation_failed("This entity failed").with_details("More information about the failure");
        assert_eq!(err.to_string(), "This entity failed\r\nMore information about the failure");
        assert_eq!(EntityError::operation_failed("plain").to_string(), "plain");
    }

    /// Test: state changes are tracked for commit
    #[test]
    fn test_state_update_tracking() {
        let ctx = EntityContext::new(EntityId::new("E", "k"), "op", "", Some("1".to_string()));
        assert_eq!(ctx.state_update(), EntityStateUpdate::Unchanged);
        assert_eq!(ctx.get_state::<u32>().unwrap(), Some(1));

        let handle = ctx.clone();
        handle.set_state(&"text").unwrap();
        assert_eq!(ctx.state_update(), EntityStateUpdate::Set("text".to_string()));

        ctx.delete_state();
        assert!(!handle.has_state());
        assert_eq!(ctx.state_update(), EntityStateUpdate::Delete);
    }
}
