//! Scenario applications: the orchestrations, activities and entities the
//! end-to-end suite drives over HTTP.
//!
//! Every scenario module exposes `register(Registries, &AppEnv) -> Registries`
//! and [`register_all`] chains them into the three runtime registries.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};

use crate::config::{AppConfig, ScenarioConfig};
use crate::runtime::{
    ActivityRegistry, ActivityRegistryBuilder, EntityRegistry, EntityRegistryBuilder, OrchestrationRegistry,
    OrchestrationRegistryBuilder,
};

pub mod activity_error_handling;
pub mod activity_input_type;
pub mod class_based_entities;
pub mod entity_error_handling;
pub mod external_event;
pub mod hello_cities;
pub mod large_output;
pub mod restart;
pub mod suspend_resume;
pub mod terminate;
pub mod timeout;

/// Simulated transient failures, counted per `(scope, instance)`.
///
/// The first `fail_first_attempts` calls for a key fail; later ones succeed.
/// Counts live only as long as the injector and are never persisted.
#[derive(Debug, Clone)]
pub struct FaultInjector {
    fail_first_attempts: u32,
    attempts: Arc<Mutex<HashMap<(String, String), u32>>>,
}

impl FaultInjector {
    pub fn new(fail_first_attempts: u32) -> Self {
        Self {
            fail_first_attempts,
            attempts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Never injects a failure.
    pub fn disabled() -> Self {
        Self::new(0)
    }

    pub fn fail_first_attempts(&self) -> u32 {
        self.fail_first_attempts
    }

    /// Count one attempt and report whether it should fail.
    pub fn should_fail(&self, scope: &str, instance: &str) -> bool {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        let count = attempts.entry((scope.to_string(), instance.to_string())).or_insert(0);
        *count += 1;
        *count <= self.fail_first_attempts
    }

    pub fn attempts(&self, scope: &str, instance: &str) -> u32 {
        let attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts
            .get(&(scope.to_string(), instance.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

/// Shared inputs handed to every scenario's registration.
#[derive(Debug, Clone)]
pub struct AppEnv {
    pub faults: FaultInjector,
    pub scenarios: ScenarioConfig,
}

impl AppEnv {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            faults: FaultInjector::new(config.faults.fail_first_attempts),
            scenarios: config.scenarios.clone(),
        }
    }
}

/// Builders threaded through the scenario registrations.
pub struct Registries {
    pub orchestrations: OrchestrationRegistryBuilder,
    pub activities: ActivityRegistryBuilder,
    pub entities: EntityRegistryBuilder,
}

impl Default for Registries {
    fn default() -> Self {
        Self {
            orchestrations: OrchestrationRegistry::builder(),
            activities: ActivityRegistry::builder(),
            entities: EntityRegistry::builder(),
        }
    }
}

impl Registries {
    /// Build all three, failing with every registration error joined.
    pub fn build(self) -> Result<(OrchestrationRegistry, ActivityRegistry, EntityRegistry), String> {
        let mut errors = Vec::new();
        errors.extend(self.orchestrations.errors().iter().cloned());
        errors.extend(self.activities.errors().iter().cloned());
        errors.extend(self.entities.errors().iter().cloned());
        if !errors.is_empty() {
            return Err(errors.join("; "));
        }
        Ok((self.orchestrations.build(), self.activities.build(), self.entities.build()))
    }
}

/// Parse an ISO 8601 timestamp into ms since the epoch.
///
/// Offset-less forms (`2030-01-01T00:00:00.0000000`, `2030-01-01`) are read
/// as UTC. Instants before the epoch clamp to 0.
pub fn parse_timestamp_ms(raw: &str) -> Result<u64, chrono::ParseError> {
    let raw = raw.trim();
    let millis = match DateTime::parse_from_rfc3339(raw) {
        Ok(at) => at.timestamp_millis(),
        Err(e) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDate::parse_from_str(raw, "%Y-%m-%d").map(|d| d.and_time(NaiveTime::MIN)))
            .map_err(|_| e)?
            .and_utc()
            .timestamp_millis(),
    };
    Ok(millis.max(0) as u64)
}

/// Register every scenario with a fault injector built from `config`.
pub fn register_all(config: &AppConfig) -> Result<(OrchestrationRegistry, ActivityRegistry, EntityRegistry), String> {
    register_all_with(&AppEnv::new(config))
}

/// Register every scenario against an existing environment.
pub fn register_all_with(env: &AppEnv) -> Result<(OrchestrationRegistry, ActivityRegistry, EntityRegistry), String> {
    let regs = Registries::default();
    let regs = hello_cities::register(regs, env);
    let regs = activity_error_handling::register(regs, env);
    let regs = entity_error_handling::register(regs, env);
    let regs = class_based_entities::register(regs, env);
    let regs = activity_input_type::register(regs, env);
    let regs = external_event::register(regs, env);
    let regs = large_output::register(regs, env);
    let regs = terminate::register(regs, env);
    let regs = suspend_resume::register(regs, env);
    let regs = timeout::register(regs, env);
    let regs = restart::register(regs, env);
    regs.build()
}
