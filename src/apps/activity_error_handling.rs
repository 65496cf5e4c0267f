//! Activity failures that are rethrown, caught, or retried under a policy.
use std::time::Duration;

use super::{AppEnv, FaultInjector, Registries};
use crate::{ActivityContext, OrchestrationContext, RetryPolicy};

pub const RETHROW_ACTIVITY_EXCEPTION: &str = "RethrowActivityException";
pub const CATCH_ACTIVITY_EXCEPTION: &str = "CatchActivityException";
pub const RETRY_ACTIVITY_FUNCTION: &str = "RetryActivityFunction";
pub const CUSTOM_RETRY_ACTIVITY_FUNCTION: &str = "CustomRetryActivityFunction";

pub const RAISE_EXCEPTION: &str = "raise_exception";
pub const RAISE_COMPLEX_EXCEPTION: &str = "raise_complex_exception";

pub const RETRY_ATTEMPTS: u32 = 3;

/// Failure raised by the flaky activities; the cause is appended on its own line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioFailure {
    pub message: String,
    pub cause: Option<String>,
}

impl std::fmt::Display for ScenarioFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}\r\n{}", self.message, cause),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ScenarioFailure {}

pub fn register(mut regs: Registries, env: &AppEnv) -> Registries {
    let first_retry = Duration::from_millis(env.scenarios.retry_first_interval_ms);

    regs.orchestrations = regs
        .orchestrations
        .register(RETHROW_ACTIVITY_EXCEPTION, |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity(RAISE_EXCEPTION, ctx.instance_id()).into_activity().await
        })
        .register(CATCH_ACTIVITY_EXCEPTION, |ctx: OrchestrationContext, _input: String| async move {
            match ctx.schedule_activity(RAISE_EXCEPTION, ctx.instance_id()).into_activity().await {
                Ok(output) => Ok(output),
                Err(e) => {
                    ctx.trace_error(format!("Caught exception: {e}"));
                    Ok(format!("Caught exception: {e}"))
                }
            }
        })
        .register(RETRY_ACTIVITY_FUNCTION, move |ctx: OrchestrationContext, _input: String| async move {
            let policy = RetryPolicy::new(RETRY_ATTEMPTS).with_first_retry_interval(first_retry);
            ctx.schedule_activity_with_retry(RAISE_EXCEPTION, ctx.instance_id(), policy)
                .await?;
            Ok("Success".to_string())
        })
        .register(CUSTOM_RETRY_ACTIVITY_FUNCTION, move |ctx: OrchestrationContext, _input: String| async move {
            let policy = RetryPolicy::new(RETRY_ATTEMPTS).with_first_retry_interval(first_retry);
            ctx.schedule_activity_with_retry(RAISE_COMPLEX_EXCEPTION, ctx.instance_id(), policy)
                .await?;
            Ok("Success".to_string())
        });

    let faults = env.faults.clone();
    regs.activities = regs.activities.register(RAISE_EXCEPTION, move |ctx: ActivityContext, instance: String| {
        let faults = faults.clone();
        async move { flaky(&faults, &ctx, RAISE_EXCEPTION, &instance, None) }
    });
    let faults = env.faults.clone();
    regs.activities = regs
        .activities
        .register(RAISE_COMPLEX_EXCEPTION, move |ctx: ActivityContext, instance: String| {
            let faults = faults.clone();
            async move {
                flaky(
                    &faults,
                    &ctx,
                    RAISE_COMPLEX_EXCEPTION,
                    &instance,
                    Some("More information about the failure"),
                )
            }
        });
    regs
}

fn flaky(
    faults: &FaultInjector,
    ctx: &ActivityContext,
    scope: &str,
    instance: &str,
    cause: Option<&str>,
) -> Result<String, String> {
    if faults.should_fail(scope, instance) {
        let failure = ScenarioFailure {
            message: "This activity failed".to_string(),
            cause: cause.map(str::to_string),
        };
        ctx.trace_warn(format!(
            "injected failure, attempt {}",
            faults.attempts(scope, instance)
        ));
        return Err(failure.to_string());
    }
    Ok("This activity succeeded".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity_ctx(name: &str) -> ActivityContext {
        ActivityContext::new("inst".into(), 1, "Orch".into(), name.into(), 2, "work-0".into())
    }

    /// Test: the flaky activity fails only for the configured number of attempts
    #[test]
    fn test_flaky_fails_then_succeeds() {
        let faults = FaultInjector::new(1);
        let ctx = activity_ctx(RAISE_EXCEPTION);
        assert_eq!(
            flaky(&faults, &ctx, RAISE_EXCEPTION, "inst", None).unwrap_err(),
            "This activity failed"
        );
        assert_eq!(
            flaky(&faults, &ctx, RAISE_EXCEPTION, "inst", None).unwrap(),
            "This activity succeeded"
        );
    }

    /// Test: the complex failure carries its cause on a second line
    #[test]
    fn test_complex_failure_text() {
        let faults = FaultInjector::new(1);
        let ctx = activity_ctx(RAISE_COMPLEX_EXCEPTION);
        let err = flaky(
            &faults,
            &ctx,
            RAISE_COMPLEX_EXCEPTION,
            "inst",
            Some("More information about the failure"),
        )
        .unwrap_err();
        assert_eq!(err, "This activity failed\r\nMore information about the failure");
    }
}
