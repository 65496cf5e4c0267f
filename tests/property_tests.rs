//! Property-based tests over replay invariants and retry backoff.

use durable_e2e::providers::Provider;
use durable_e2e::providers::in_memory::InMemoryProvider;
use durable_e2e::runtime::{ActivityRegistry, OrchestrationRegistry, OrchestrationStatus, Runtime};
use durable_e2e::{BackoffStrategy, Client, EventKind, OrchestrationContext};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

fn arb_orch_name() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z][A-Za-z0-9]{0,20}").unwrap()
}

fn arb_input() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9]{0,10}").unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(10))]

    /// Property: event ids within an execution start at 1 and have no gaps
    #[test]
    fn prop_event_ids_contiguous(
        orch_name in arb_orch_name(),
        input in arb_input(),
        steps in 1usize..4,
    ) {
        let result = tokio::runtime::Runtime::new().unwrap().block_on(async {
            let activities = ActivityRegistry::builder()
                .register("Echo", |_ctx, input: String| async move { Ok(format!("done-{input}")) })
                .build();
            let orchestrations = OrchestrationRegistry::builder()
                .register(orch_name.clone(), move |ctx: OrchestrationContext, input: String| async move {
                    let mut last = input;
                    for _ in 0..steps {
                        last = ctx.schedule_activity("Echo", last).into_activity().await?;
                    }
                    Ok(last)
                })
                .build();

            let provider: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
            let rt = Runtime::start_with_store(provider.clone(), Arc::new(activities), orchestrations).await;
            let client = Client::new(provider.clone());
            let instance = format!("prop-{orch_name}");
            client.start_orchestration(&instance, &orch_name, input).await.map_err(|e| e.to_string())?;
            let status = client
                .wait_for_orchestration(&instance, Duration::from_secs(5))
                .await
                .map_err(|e| e.to_string())?;
            rt.shutdown(Some(200)).await;

            if !matches!(status, OrchestrationStatus::Completed { .. }) {
                return Err(format!("unexpected status {status:?}"));
            }
            let history = provider.read(&instance).await.map_err(|e| e.to_string())?;
            let ids: Vec<u64> = history.iter().map(|e| e.event_id).collect();
            let expected: Vec<u64> = (1..=history.len() as u64).collect();
            if ids != expected {
                return Err(format!("event ids not contiguous: {ids:?}"));
            }
            let terminal = history.iter().filter(|e| e.is_terminal()).count();
            if terminal != 1 {
                return Err(format!("expected one terminal event, found {terminal}"));
            }
            let scheduled = history
                .iter()
                .filter(|e| matches!(e.kind, EventKind::ActivityScheduled { .. }))
                .count();
            if scheduled != steps {
                return Err(format!("expected {steps} activities, found {scheduled}"));
            }
            Ok::<(), String>(())
        });
        prop_assert!(result.is_ok(), "{}", result.unwrap_err());
    }

    /// Property: exponential backoff never decreases and never exceeds the cap
    #[test]
    fn prop_exponential_backoff_monotonic(
        base_ms in 1u64..1_000,
        multiplier in 1.0f64..4.0,
        max_ms in 1u64..120_000,
        attempt in 1u32..64,
    ) {
        let backoff = BackoffStrategy::Exponential {
            base: Duration::from_millis(base_ms),
            multiplier,
            max: Duration::from_millis(max_ms),
        };
        let this = backoff.delay_for_attempt(attempt);
        let next = backoff.delay_for_attempt(attempt + 1);
        prop_assert!(this <= Duration::from_millis(max_ms));
        prop_assert!(next >= this);
    }
}
