//! Orchestration that keeps working until someone terminates it.
use std::time::Duration;

use super::{AppEnv, Registries};
use crate::{ActivityContext, OrchestrationContext};

pub const LONG_RUNNING_ORCHESTRATOR: &str = "LongRunningOrchestrator";
pub const SIMULATED_WORK_ACTIVITY: &str = "simulated_work_activity";
pub const TERMINATE_REASON: &str = "Long-running orchestration was terminated early.";

const ITERATIONS: u32 = 100_000;

pub fn register(mut regs: Registries, env: &AppEnv) -> Registries {
    let sleep_ms = env.scenarios.simulated_work_ms;
    regs.orchestrations = regs.orchestrations.register_typed(
        LONG_RUNNING_ORCHESTRATOR,
        move |ctx: OrchestrationContext, _input: Option<String>| async move {
            ctx.trace_info("Starting long-running orchestration.");
            let mut outputs = Vec::new();
            for _ in 0..ITERATIONS {
                let out = ctx
                    .schedule_activity_typed(SIMULATED_WORK_ACTIVITY, &sleep_ms)
                    .into_activity()
                    .await?;
                outputs.push(out);
            }
            Ok::<_, String>(outputs)
        },
    );
    regs.activities = regs
        .activities
        .register_typed(SIMULATED_WORK_ACTIVITY, |ctx: ActivityContext, sleep_ms: u64| async move {
            ctx.trace_info(format!("Sleeping for {sleep_ms}ms."));
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            Ok::<_, String>(format!("Slept for {sleep_ms}ms."))
        });
    regs
}
