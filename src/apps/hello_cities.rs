//! Sequential activity chain, optionally delayed until a scheduled start time.
use super::{AppEnv, Registries, parse_timestamp_ms};
use crate::{ActivityContext, OrchestrationContext};

pub const HELLO_CITIES: &str = "HelloCities";
pub const SAY_HELLO: &str = "say_hello";

const CITIES: [&str; 3] = ["Tokyo", "Seattle", "London"];

pub fn register(mut regs: Registries, _env: &AppEnv) -> Registries {
    regs.orchestrations = regs.orchestrations.register_typed(HELLO_CITIES, hello_cities);
    regs.activities = regs
        .activities
        .register(SAY_HELLO, |ctx: ActivityContext, city: String| async move {
            ctx.trace_info(format!("Saying hello to {city}."));
            Ok(format!("Hello {city}!"))
        });
    regs
}

/// Parse an ISO 8601 start time into ms since the epoch.
pub fn parse_start_time(input: &str) -> Result<u64, String> {
    parse_timestamp_ms(input).map_err(|e| format!("invalid scheduled start time '{input}': {e}"))
}

async fn hello_cities(ctx: OrchestrationContext, scheduled_start: Option<String>) -> Result<Vec<String>, String> {
    if let Some(start) = scheduled_start.as_deref().filter(|s| !s.trim().is_empty()) {
        let fire_at = parse_start_time(start)?;
        if fire_at > ctx.current_time_ms() {
            ctx.trace_info(format!("Waiting until scheduled start {start}"));
            ctx.schedule_timer_at(fire_at).into_timer().await;
        }
    }

    let mut outputs = Vec::with_capacity(CITIES.len());
    for city in CITIES {
        outputs.push(ctx.schedule_activity(SAY_HELLO, city).into_activity().await?);
    }
    Ok(outputs)
}
