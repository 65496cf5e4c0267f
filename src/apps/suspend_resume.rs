//! Orchestration parked on a long durable timer, used for suspend and resume.
use std::time::Duration;

use super::{AppEnv, Registries};
use crate::OrchestrationContext;

pub const LONG_ORCHESTRATOR: &str = "LongOrchestrator";
pub const SUSPEND_REASON: &str = "Suspending the instance for test.";
pub const RESUME_REASON: &str = "Resuming the instance for test.";

pub fn register(mut regs: Registries, env: &AppEnv) -> Registries {
    let wait = Duration::from_secs(env.scenarios.long_timer_minutes.saturating_mul(60));
    regs.orchestrations = regs.orchestrations.register_typed(
        LONG_ORCHESTRATOR,
        move |ctx: OrchestrationContext, _input: Option<String>| async move {
            ctx.schedule_timer(wait).into_timer().await;
            Ok::<_, String>(Vec::<String>::new())
        },
    );
    regs
}
