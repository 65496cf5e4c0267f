mod common;

use common::*;
use durable_e2e::ClientError;
use durable_e2e::apps::external_event::{APPROVAL_EVENT, EXTERNAL_EVENT_ORCHESTRATOR};
use durable_e2e::runtime::OrchestrationStatus;

#[tokio::test]
async fn approval_event_completes_orchestration() {
    let app = start_app(fast_config()).await;
    app.client
        .start_orchestration("ext-1", EXTERNAL_EVENT_ORCHESTRATOR, "")
        .await
        .unwrap();
    assert!(wait_for_subscription(app.store.clone(), "ext-1", APPROVAL_EVENT, 2_000).await);

    app.client.raise_event("ext-1", APPROVAL_EVENT, "true").await.unwrap();
    assert_eq!(
        wait_done(&app.client, "ext-1", 5_000).await,
        OrchestrationStatus::Completed {
            output: "Orchestrator Finished!".to_string()
        }
    );

    // A finished instance no longer accepts events
    let err = app.client.raise_event("ext-1", APPROVAL_EVENT, "true").await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidState(_)), "{err:?}");
    assert_eq!(err.kind(), "FailedPrecondition");
    app.shutdown().await;
}

#[tokio::test]
async fn raising_to_unknown_instance_is_not_found() {
    let app = start_app(fast_config()).await;
    let err = app.client.raise_event("missing", APPROVAL_EVENT, "true").await.unwrap_err();
    assert!(matches!(err, ClientError::InstanceNotFound(_)));
    assert_eq!(err.to_string(), "No instance with ID missing found");
    app.shutdown().await;
}
