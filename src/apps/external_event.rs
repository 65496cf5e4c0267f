//! Orchestration parked on an external approval event.
use super::{AppEnv, Registries};
use crate::OrchestrationContext;

pub const EXTERNAL_EVENT_ORCHESTRATOR: &str = "ExternalEventOrchestrator";
pub const APPROVAL_EVENT: &str = "Approval";

pub fn register(mut regs: Registries, _env: &AppEnv) -> Registries {
    regs.orchestrations = regs.orchestrations.register(
        EXTERNAL_EVENT_ORCHESTRATOR,
        |ctx: OrchestrationContext, _input: String| async move {
            let approval = ctx.schedule_wait(APPROVAL_EVENT).into_event().await;
            ctx.trace_info(format!("Received {APPROVAL_EVENT}: {approval}"));
            Ok("Orchestrator Finished!".to_string())
        },
    );
    regs
}
