//! Scenario routes under `/api`.
use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::error::ApiError;
use super::query_param;
use super::state::AppState;
use super::status::{InstanceStatus, check_status_response, payload_value};
use crate::apps::{
    activity_error_handling, entity_error_handling, external_event, hello_cities, large_output, parse_timestamp_ms,
    suspend_resume, terminate, timeout,
};
use crate::client::ClientError;
use crate::providers::{PurgeFilter, PurgeResult, RuntimeStatus};

type Params = Query<HashMap<String, String>>;

pub fn new_instance_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Start `orchestration` under a fresh id and answer with the check-status payload.
async fn start(state: &AppState, orchestration: &str, input: String) -> Result<Response, ApiError> {
    let instance = new_instance_id();
    state
        .client
        .start_orchestration(&instance, orchestration, input)
        .await
        .map_err(|e| ApiError::from_client(&e))?;
    info!(
        target: "durable_e2e::http",
        instance_id = %instance,
        orchestration_name = %orchestration,
        "Started orchestration"
    );
    Ok(check_status_response(state, &instance))
}

pub async fn start_orchestration(State(state): State<AppState>, Query(params): Params) -> Result<Response, ApiError> {
    let name = query_param(&params, "orchestrationName")
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::bad_request("Please pass an orchestrationName in the query string."))?;
    let input = query_param(&params, "input").unwrap_or_default();
    start(&state, &name, input).await
}

/// Start a fixed orchestration, reading an optional `input` query parameter.
pub async fn start_fixed(
    state: AppState,
    params: HashMap<String, String>,
    orchestration: &'static str,
) -> Result<Response, ApiError> {
    let input = query_param(&params, "input").unwrap_or_default();
    start(&state, orchestration, input).await
}

pub async fn hello_cities_scheduled(State(state): State<AppState>, Query(params): Params) -> Result<Response, ApiError> {
    let raw = query_param(&params, "ScheduledStartTime")
        .ok_or_else(|| ApiError::bad_request("Please pass a ScheduledStartTime in the query string."))?;
    hello_cities::parse_start_time(&raw).map_err(ApiError::bad_request)?;
    start(&state, hello_cities::HELLO_CITIES, raw).await
}

pub async fn timeout_start(
    State(state): State<AppState>,
    Query(params): Params,
    body: String,
) -> Result<Response, ApiError> {
    let raw = query_param(&params, "timeoutSeconds").unwrap_or_else(|| body.trim().trim_matches('"').to_string());
    let seconds = raw.trim().parse::<u64>().map_err(|_| {
        ApiError::bad_request("Please pass a valid timeoutSeconds value in the query string or in the request body.")
    })?;
    start(&state, timeout::TIMEOUT_ORCHESTRATOR, seconds.to_string()).await
}

pub async fn large_output_start(
    State(state): State<AppState>,
    Query(params): Params,
    body: String,
) -> Result<Response, ApiError> {
    let size_kb = match serde_json::from_str::<usize>(body.trim()) {
        Ok(size) => size,
        Err(_) => query_param(&params, "sizeInKB")
            .and_then(|s| s.trim().parse::<usize>().ok())
            .unwrap_or(0),
    };
    start(&state, large_output::LARGE_OUTPUT_ORCHESTRATOR, size_kb.to_string()).await
}

pub async fn large_output_query(State(state): State<AppState>, Query(params): Params) -> Result<Response, ApiError> {
    let not_found = || ApiError::not_found("Orchestration metadata not found.");
    let instance = query_param(&params, "id").ok_or_else(not_found)?;
    let info = state
        .client
        .describe_instance(&instance)
        .await
        .map_err(|e| ApiError::from_client(&e))?
        .ok_or_else(not_found)?;
    Ok((StatusCode::OK, Json(payload_value(info.output.as_deref()))).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventTarget {
    instance_id: String,
}

/// Body is either a JSON string id or `{"instanceId": ...}`.
fn parse_event_target(body: &str) -> Option<String> {
    let body = body.trim();
    if let Ok(id) = serde_json::from_str::<String>(body) {
        return Some(id);
    }
    if let Ok(target) = serde_json::from_str::<EventTarget>(body) {
        return Some(target.instance_id);
    }
    (!body.is_empty() && !body.starts_with('{')).then(|| body.to_string())
}

pub async fn send_external_event(State(state): State<AppState>, Query(params): Params, body: String) -> Response {
    let Some(instance) = parse_event_target(&body).or_else(|| query_param(&params, "instanceId")) else {
        return (StatusCode::BAD_REQUEST, "InvalidArgument: an instance id is required").into_response();
    };
    match state
        .client
        .raise_event(&instance, external_event::APPROVAL_EVENT, "true")
        .await
    {
        Ok(()) => (StatusCode::OK, format!("External event sent to {instance}.")).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, format!("{}: {}", e.kind(), e)).into_response(),
    }
}

fn required_instance(params: &HashMap<String, String>) -> Result<String, ApiError> {
    query_param(params, "instanceId")
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("Please pass an instanceId in the query string."))
}

pub async fn terminate_instance(State(state): State<AppState>, Query(params): Params) -> Result<StatusCode, ApiError> {
    let instance = required_instance(&params)?;
    state
        .client
        .terminate_instance(&instance, terminate::TERMINATE_REASON)
        .await
        .map_err(|e| ApiError::from_client(&e))?;
    Ok(StatusCode::OK)
}

pub async fn suspend_instance(State(state): State<AppState>, Query(params): Params) -> Result<StatusCode, ApiError> {
    let instance = required_instance(&params)?;
    state
        .client
        .suspend_instance(&instance, suspend_resume::SUSPEND_REASON)
        .await
        .map_err(|e| ApiError::from_client(&e))?;
    Ok(StatusCode::OK)
}

pub async fn resume_instance(State(state): State<AppState>, Query(params): Params) -> Result<StatusCode, ApiError> {
    let instance = required_instance(&params)?;
    state
        .client
        .resume_instance(&instance, suspend_resume::RESUME_REASON)
        .await
        .map_err(|e| ApiError::from_client(&e))?;
    Ok(StatusCode::OK)
}

fn parse_bound(params: &HashMap<String, String>, name: &str) -> Result<Option<u64>, String> {
    let Some(raw) = query_param(params, name).filter(|s| !s.trim().is_empty()) else {
        return Ok(None);
    };
    parse_timestamp_ms(&raw)
        .map(Some)
        .map_err(|e| format!("Invalid {name} '{raw}': {e}"))
}

async fn purge_between(state: &AppState, params: &HashMap<String, String>) -> Result<PurgeResult, String> {
    let filter = PurgeFilter {
        created_from: parse_bound(params, "purgeStartTime")?,
        created_to: parse_bound(params, "purgeEndTime")?,
        ..PurgeFilter::terminal()
    };
    state.client.purge_instances(filter).await.map_err(|e| e.to_string())
}

pub async fn purge_history(State(state): State<AppState>, Query(params): Params) -> Response {
    match purge_between(&state, &params).await {
        Ok(result) => (StatusCode::OK, format!("Purged {} records", result.instances_deleted)).into_response(),
        Err(e) => ApiError::internal(format!("Failed to purge all instance history: {e}")).into_response(),
    }
}

fn statuses_response(result: Result<Vec<crate::providers::InstanceInfo>, ClientError>) -> Result<Response, ApiError> {
    let infos = result.map_err(|e| ApiError::from_client(&e))?;
    let body: Vec<InstanceStatus> = infos.into_iter().map(InstanceStatus::from).collect();
    Ok((StatusCode::OK, Json(body)).into_response())
}

pub async fn get_all_instances(State(state): State<AppState>) -> Result<Response, ApiError> {
    statuses_response(state.client.list_all_instances().await)
}

pub async fn get_running_instances(State(state): State<AppState>) -> Result<Response, ApiError> {
    statuses_response(
        state
            .client
            .list_instances_by_status(&[RuntimeStatus::Running, RuntimeStatus::Pending, RuntimeStatus::ContinuedAsNew])
            .await,
    )
}

pub async fn restart_start(
    State(state): State<AppState>,
    Path(orchestration): Path<String>,
    Query(params): Params,
) -> Result<Response, ApiError> {
    let input = query_param(&params, "input").unwrap_or_default();
    start(&state, &orchestration, input).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RestartRequest {
    pub instance_id: String,
    #[serde(default)]
    pub restart_with_new_instance_id: bool,
}

pub async fn restart(State(state): State<AppState>, body: String) -> Result<Response, ApiError> {
    let request: RestartRequest = serde_json::from_str(&body).map_err(|_| ApiError::bad_request(""))?;
    let instance = state
        .client
        .restart_instance(&request.instance_id, request.restart_with_new_instance_id)
        .await
        .map_err(|e| ApiError::from_client(&e))?;
    Ok(check_status_response(&state, &instance))
}

pub async fn restart_with_error_handling(State(state): State<AppState>, body: String) -> Response {
    let request: RestartRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("Invalid restart request: {e}")).into_response(),
    };
    match state
        .client
        .restart_instance(&request.instance_id, request.restart_with_new_instance_id)
        .await
    {
        Ok(instance) => (StatusCode::OK, instance).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

pub async fn http_trigger(Query(params): Params, body: String) -> String {
    let name = query_param(&params, "name").or_else(|| {
        serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("name").and_then(Value::as_str).map(str::to_string))
    });
    match name.filter(|n| !n.is_empty()) {
        Some(name) => format!("Hello, {name}. This HTTP triggered function executed successfully."),
        None => "This HTTP triggered function executed successfully. Pass a name in the query string or in the request body for a personalized response.".to_string(),
    }
}

/// `*_HttpStart` aliases: route suffix and the orchestration it starts.
pub const NAMED_STARTS: &[(&str, &str)] = &[
    ("HelloCities_HttpStart", hello_cities::HELLO_CITIES),
    ("LongOrchestrator_HttpStart", suspend_resume::LONG_ORCHESTRATOR),
    ("LongRunningOrchestrator_HttpStart", terminate::LONG_RUNNING_ORCHESTRATOR),
    ("ExternalEventOrchestrator_HttpStart", external_event::EXTERNAL_EVENT_ORCHESTRATOR),
    ("RethrowActivityException_HttpStart", activity_error_handling::RETHROW_ACTIVITY_EXCEPTION),
    ("CatchActivityException_HttpStart", activity_error_handling::CATCH_ACTIVITY_EXCEPTION),
    ("RetryActivityException_HttpStart", activity_error_handling::RETRY_ACTIVITY_FUNCTION),
    ("CustomRetryActivityException_HttpStart", activity_error_handling::CUSTOM_RETRY_ACTIVITY_FUNCTION),
    ("RethrowEntityException_HttpStart", entity_error_handling::THROW_ENTITY_ORCHESTRATION),
    ("CatchEntityException_HttpStart", entity_error_handling::CATCH_ENTITY_ORCHESTRATION),
    ("RetryEntityException_HttpStart", entity_error_handling::RETRY_ENTITY_ORCHESTRATION),
];

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: external event targets accept both body shapes
    #[test]
    fn test_parse_event_target() {
        assert_eq!(parse_event_target("\"abc\"").as_deref(), Some("abc"));
        assert_eq!(parse_event_target("{\"instanceId\":\"xyz\"}").as_deref(), Some("xyz"));
        assert_eq!(parse_event_target("plain"), Some("plain".to_string()));
        assert_eq!(parse_event_target("{}"), None);
        assert_eq!(parse_event_target(""), None);
    }

    #[test]
    fn test_restart_request_shape() {
        let req: RestartRequest =
            serde_json::from_str(r#"{"InstanceId":"a","RestartWithNewInstanceId":true}"#).unwrap();
        assert_eq!(req.instance_id, "a");
        assert!(req.restart_with_new_instance_id);
        let req: RestartRequest = serde_json::from_str(r#"{"InstanceId":"b"}"#).unwrap();
        assert!(!req.restart_with_new_instance_id);
    }
}
