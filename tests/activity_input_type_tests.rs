mod common;

use common::*;
use durable_e2e::apps::activity_input_type::ACTIVITY_INPUT_TYPE_ORCHESTRATOR;
use durable_e2e::runtime::OrchestrationStatus;

#[tokio::test]
async fn every_input_shape_reaches_its_activity() {
    let app = start_app(fast_config()).await;
    app.client
        .start_orchestration("types-1", ACTIVITY_INPUT_TYPE_ORCHESTRATOR, "")
        .await
        .unwrap();
    let output = match wait_done(&app.client, "types-1", 5_000).await {
        OrchestrationStatus::Completed { output } => output,
        other => panic!("unexpected status: {other:?}"),
    };
    let received: Vec<String> = serde_json::from_str(&output).unwrap();
    assert_eq!(received.len(), 7);
    assert_eq!(received[0], "Received byte[]: [1, 2, 3, 4, 5]");
    assert_eq!(received[1], "Received byte[]: []");
    assert_eq!(received[2], "Received byte: 42");
    assert_eq!(
        received[3],
        "Received CustomClass: {Name: Test, Age: 25, Duration: 01:00:00, Data: [1, 2, 3]}"
    );
    assert_eq!(received[4], "Received int[]: [1, 2, 3, 4, 5]");
    assert_eq!(received[5], "Received string: Test string input");
    assert!(received[6].starts_with("Received CustomClass[]: [{Name: Test1"), "{}", received[6]);
    app.shutdown().await;
}
