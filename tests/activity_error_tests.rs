mod common;

use common::*;
use durable_e2e::apps::activity_error_handling::*;
use durable_e2e::runtime::OrchestrationStatus;

#[tokio::test]
async fn rethrown_activity_failure_fails_orchestration() {
    let app = start_app(fast_config()).await;
    app.client
        .start_orchestration("rethrow-1", RETHROW_ACTIVITY_EXCEPTION, "")
        .await
        .unwrap();
    match wait_done(&app.client, "rethrow-1", 5_000).await {
        OrchestrationStatus::Failed { details } => assert_eq!(
            details.display_message(),
            "Orchestrator function 'RethrowActivityException' failed: Activity function 'raise_exception' failed: This activity failed"
        ),
        other => panic!("unexpected status: {other:?}"),
    }
    app.shutdown().await;
}

#[tokio::test]
async fn caught_activity_failure_completes() {
    let app = start_app(fast_config()).await;
    app.client
        .start_orchestration("catch-1", CATCH_ACTIVITY_EXCEPTION, "")
        .await
        .unwrap();
    match wait_done(&app.client, "catch-1", 5_000).await {
        OrchestrationStatus::Completed { output } => assert_eq!(
            output,
            "Caught exception: Activity function 'raise_exception' failed: This activity failed"
        ),
        other => panic!("unexpected status: {other:?}"),
    }
    app.shutdown().await;
}

#[tokio::test]
async fn retry_recovers_after_one_failure() {
    let app = start_app(fast_config()).await;
    app.client
        .start_orchestration("retry-1", RETRY_ACTIVITY_FUNCTION, "")
        .await
        .unwrap();
    assert_eq!(
        wait_done(&app.client, "retry-1", 5_000).await,
        OrchestrationStatus::Completed {
            output: "Success".to_string()
        }
    );
    assert_eq!(app.faults.attempts(RAISE_EXCEPTION, "retry-1"), 2);
    app.shutdown().await;
}

#[tokio::test]
async fn custom_retry_uses_complex_activity() {
    let app = start_app(fast_config()).await;
    app.client
        .start_orchestration("custom-retry-1", CUSTOM_RETRY_ACTIVITY_FUNCTION, "")
        .await
        .unwrap();
    assert_eq!(
        wait_done(&app.client, "custom-retry-1", 5_000).await,
        OrchestrationStatus::Completed {
            output: "Success".to_string()
        }
    );
    assert_eq!(app.faults.attempts(RAISE_COMPLEX_EXCEPTION, "custom-retry-1"), 2);
    app.shutdown().await;
}

#[tokio::test]
async fn retry_budget_exhaustion_surfaces_last_failure() {
    let mut config = fast_config();
    config.faults.fail_first_attempts = 10;
    let app = start_app(config).await;
    app.client
        .start_orchestration("custom-retry-2", CUSTOM_RETRY_ACTIVITY_FUNCTION, "")
        .await
        .unwrap();
    match wait_done(&app.client, "custom-retry-2", 5_000).await {
        OrchestrationStatus::Failed { details } => {
            let msg = details.display_message();
            assert!(msg.contains("This activity failed\r\nMore information about the failure"), "{msg}");
        }
        other => panic!("unexpected status: {other:?}"),
    }
    assert_eq!(app.faults.attempts(RAISE_COMPLEX_EXCEPTION, "custom-retry-2"), 3);
    app.shutdown().await;
}

#[tokio::test]
async fn retry_function_makes_three_attempts_before_failing() {
    let mut config = fast_config();
    config.faults.fail_first_attempts = 10;
    let app = start_app(config).await;
    app.client
        .start_orchestration("retry-2", RETRY_ACTIVITY_FUNCTION, "")
        .await
        .unwrap();
    match wait_done(&app.client, "retry-2", 5_000).await {
        OrchestrationStatus::Failed { details } => {
            assert!(details.display_message().contains("This activity failed"));
        }
        other => panic!("unexpected status: {other:?}"),
    }
    assert_eq!(app.faults.attempts(RAISE_EXCEPTION, "retry-2"), RETRY_ATTEMPTS);
    app.shutdown().await;
}
