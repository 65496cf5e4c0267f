//! An activity raced against a durable timer.
use std::time::Duration;

use super::{AppEnv, Registries};
use crate::{ActivityContext, DurableOutput, OrchestrationContext};

pub const TIMEOUT_ORCHESTRATOR: &str = "TimeoutOrchestrator";
pub const LONG_ACTIVITY: &str = "long_activity";
pub const TIMED_OUT: &str = "The activity function timed out";
pub const COMPLETED: &str = "The activity function completed successfully";

pub fn register(mut regs: Registries, env: &AppEnv) -> Registries {
    regs.orchestrations = regs
        .orchestrations
        .register_typed(TIMEOUT_ORCHESTRATOR, |ctx: OrchestrationContext, timeout_s: u64| async move {
            if timeout_s == 0 {
                return Err("Timeout value is required for this orchestration.".to_string());
            }
            let activity = ctx.schedule_activity(LONG_ACTIVITY, ctx.instance_id());
            let timer = ctx.schedule_timer(Duration::from_secs(timeout_s));
            match ctx.select2(activity, timer).await {
                (0, DurableOutput::Activity(result)) => result,
                _ => Ok(TIMED_OUT.to_string()),
            }
        });

    let work = Duration::from_millis(env.scenarios.long_activity_ms);
    regs.activities = regs
        .activities
        .register(LONG_ACTIVITY, move |ctx: ActivityContext, _instance: String| async move {
            ctx.trace_info(format!("Working for {}ms", work.as_millis()));
            tokio::time::sleep(work).await;
            Ok(COMPLETED.to_string())
        });
    regs
}
