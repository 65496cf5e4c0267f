//! Orchestration whose output is far larger than a typical queue message.
use super::{AppEnv, Registries};
use crate::OrchestrationContext;

pub const LARGE_OUTPUT_ORCHESTRATOR: &str = "LargeOutputOrchestrator";
pub const LARGE_OUTPUT_SAY_HELLO: &str = "large_output_say_hello";

pub fn generate_large_string(size_kb: usize) -> String {
    "A".repeat(size_kb.saturating_mul(1024))
}

pub fn register(mut regs: Registries, _env: &AppEnv) -> Registries {
    regs.orchestrations = regs.orchestrations.register_typed(
        LARGE_OUTPUT_ORCHESTRATOR,
        |ctx: OrchestrationContext, size_kb: usize| async move {
            ctx.trace_info("Saying hello.");
            let hello = ctx
                .schedule_activity(LARGE_OUTPUT_SAY_HELLO, "Tokyo")
                .into_activity()
                .await?;
            Ok::<_, String>(vec![hello, generate_large_string(size_kb)])
        },
    );
    regs.activities = regs
        .activities
        .register(LARGE_OUTPUT_SAY_HELLO, |_ctx, name: String| async move { Ok(format!("Hello {name}!")) });
    regs
}
