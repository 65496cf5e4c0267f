//! Short orchestration used to exercise restart.
use super::{AppEnv, Registries};
use crate::OrchestrationContext;

pub const SIMPLE_ORCHESTRATOR: &str = "SimpleOrchestrator";

pub fn register(mut regs: Registries, _env: &AppEnv) -> Registries {
    regs.orchestrations = regs.orchestrations.register_typed(
        SIMPLE_ORCHESTRATOR,
        |_ctx: OrchestrationContext, name: Option<String>| async move {
            Ok::<_, String>(format!("Hello {}", name.unwrap_or_default()))
        },
    );
    regs
}
