mod common;

use common::*;
use durable_e2e::EventKind;
use durable_e2e::apps::timeout::{COMPLETED, TIMED_OUT, TIMEOUT_ORCHESTRATOR};
use durable_e2e::runtime::OrchestrationStatus;
use std::time::Duration;

#[tokio::test]
async fn timer_wins_and_activity_is_cancelled() {
    let mut config = fast_config();
    config.scenarios.long_activity_ms = 2_500;
    let app = start_app(config).await;
    app.client
        .start_orchestration_typed("to-1", TIMEOUT_ORCHESTRATOR, 1u64)
        .await
        .unwrap();
    assert_eq!(
        wait_done(&app.client, "to-1", 5_000).await,
        OrchestrationStatus::Completed {
            output: TIMED_OUT.to_string()
        }
    );

    // The losing activity finishing later does not touch the finished instance
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    let hist = app.store.read("to-1").await.unwrap();
    assert_eq!(count_kind(&hist, |k| matches!(k, EventKind::ActivityCompleted { .. })), 0);
    assert_eq!(
        app.client.get_orchestration_status("to-1").await.unwrap(),
        OrchestrationStatus::Completed {
            output: TIMED_OUT.to_string()
        }
    );
    app.shutdown().await;
}

#[tokio::test]
async fn activity_wins_before_timeout() {
    let mut config = fast_config();
    config.scenarios.long_activity_ms = 20;
    let app = start_app(config).await;
    app.client
        .start_orchestration_typed("to-2", TIMEOUT_ORCHESTRATOR, 30u64)
        .await
        .unwrap();
    assert_eq!(
        wait_done(&app.client, "to-2", 5_000).await,
        OrchestrationStatus::Completed {
            output: COMPLETED.to_string()
        }
    );
    app.shutdown().await;
}

#[tokio::test]
async fn zero_timeout_is_rejected() {
    let app = start_app(fast_config()).await;
    app.client
        .start_orchestration_typed("to-0", TIMEOUT_ORCHESTRATOR, 0u64)
        .await
        .unwrap();
    match wait_done(&app.client, "to-0", 5_000).await {
        OrchestrationStatus::Failed { details } => {
            assert!(details.display_message().contains("Timeout value is required"));
        }
        other => panic!("unexpected status: {other:?}"),
    }
    app.shutdown().await;
}
