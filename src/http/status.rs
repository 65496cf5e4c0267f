//! Check-status payloads and the instance status API.
use std::collections::HashMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use super::error::ApiError;
use super::query_param;
use super::state::AppState;
use crate::providers::{InstanceInfo, PurgeFilter};

pub const INSTANCES_PATH: &str = "/runtime/webhooks/durabletask/instances";

/// Management links returned when an orchestration is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckStatusPayload {
    pub id: String,
    pub status_query_get_uri: String,
    pub send_event_post_uri: String,
    pub terminate_post_uri: String,
    pub suspend_post_uri: String,
    pub resume_post_uri: String,
    pub purge_history_delete_uri: String,
}

impl CheckStatusPayload {
    pub fn new(base_url: &str, instance: &str) -> Self {
        let root = format!("{base_url}{INSTANCES_PATH}/{instance}");
        Self {
            id: instance.to_string(),
            status_query_get_uri: root.clone(),
            send_event_post_uri: format!("{root}/raiseEvent/{{eventName}}"),
            terminate_post_uri: format!("{root}/terminate?reason={{text}}"),
            suspend_post_uri: format!("{root}/suspend?reason={{text}}"),
            resume_post_uri: format!("{root}/resume?reason={{text}}"),
            purge_history_delete_uri: root,
        }
    }
}

/// 202 Accepted with a `Location` header pointing at the status endpoint.
pub fn check_status_response(state: &AppState, instance: &str) -> Response {
    let payload = CheckStatusPayload::new(&state.base_url(), instance);
    let mut response = (StatusCode::ACCEPTED, Json(&payload)).into_response();
    if let Ok(location) = HeaderValue::from_str(&payload.status_query_get_uri) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    response
}

/// Status document for one instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub name: String,
    pub instance_id: String,
    pub runtime_status: String,
    pub input: Value,
    pub output: Value,
    pub created_time: String,
    pub last_updated_time: String,
}

impl From<InstanceInfo> for InstanceStatus {
    fn from(info: InstanceInfo) -> Self {
        Self {
            name: info.orchestration_name,
            instance_id: info.instance_id,
            runtime_status: info.status.to_string(),
            input: payload_value(Some(&info.input)),
            output: payload_value(info.output.as_deref()),
            created_time: rfc3339(info.created_at),
            last_updated_time: rfc3339(info.updated_at),
        }
    }
}

/// JSON payloads are embedded as JSON; anything else as a string.
pub fn payload_value(raw: Option<&str>) -> Value {
    match raw {
        None => Value::Null,
        Some("") => Value::Null,
        Some(s) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string())),
    }
}

pub fn rfc3339(ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms.min(i64::MAX as u64) as i64)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// GET: 200 when finished, 202 while active, 404 when unknown.
pub async fn get_instance_status(State(state): State<AppState>, Path(instance): Path<String>) -> Result<Response, ApiError> {
    let info = state
        .client
        .describe_instance(&instance)
        .await
        .map_err(|e| ApiError::from_client_rest(&e))?
        .ok_or_else(|| ApiError::not_found(format!("No instance with ID '{instance}' found.")))?;
    let code = if info.status.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((code, Json(InstanceStatus::from(info))).into_response())
}

pub async fn list_instance_statuses(State(state): State<AppState>) -> Result<Json<Vec<InstanceStatus>>, ApiError> {
    let infos = state
        .client
        .list_all_instances()
        .await
        .map_err(|e| ApiError::from_client_rest(&e))?;
    Ok(Json(infos.into_iter().map(InstanceStatus::from).collect()))
}

pub async fn raise_event(
    State(state): State<AppState>,
    Path((instance, event_name)): Path<(String, String)>,
    body: String,
) -> Result<StatusCode, ApiError> {
    state
        .client
        .raise_event(&instance, event_name, body)
        .await
        .map_err(|e| ApiError::from_client_rest(&e))?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn terminate(
    State(state): State<AppState>,
    Path(instance): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    let reason = query_param(&params, "reason").unwrap_or_default();
    state
        .client
        .terminate_instance(&instance, reason)
        .await
        .map_err(|e| ApiError::from_client_rest(&e))?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn suspend(
    State(state): State<AppState>,
    Path(instance): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    let reason = query_param(&params, "reason").unwrap_or_default();
    state
        .client
        .suspend_instance(&instance, reason)
        .await
        .map_err(|e| ApiError::from_client_rest(&e))?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn resume(
    State(state): State<AppState>,
    Path(instance): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<StatusCode, ApiError> {
    let reason = query_param(&params, "reason").unwrap_or_default();
    state
        .client
        .resume_instance(&instance, reason)
        .await
        .map_err(|e| ApiError::from_client_rest(&e))?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PurgeResponse {
    instances_deleted: u64,
}

/// DELETE: purge one finished instance.
pub async fn purge_instance(State(state): State<AppState>, Path(instance): Path<String>) -> Result<Response, ApiError> {
    let result = state
        .client
        .purge_instances(PurgeFilter::terminal().for_instance(instance.clone()))
        .await
        .map_err(|e| ApiError::from_client_rest(&e))?;
    if result.instances_deleted == 0 {
        return Err(ApiError::not_found(format!("No completed instance with ID '{instance}' found.")));
    }
    Ok((
        StatusCode::OK,
        Json(PurgeResponse {
            instances_deleted: result.instances_deleted,
        }),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: management links hang off the instance status url
    #[test]
    fn test_check_status_links() {
        let payload = CheckStatusPayload::new("http://localhost:7071", "abc");
        assert_eq!(
            payload.status_query_get_uri,
            "http://localhost:7071/runtime/webhooks/durabletask/instances/abc"
        );
        assert_eq!(
            payload.send_event_post_uri,
            "http://localhost:7071/runtime/webhooks/durabletask/instances/abc/raiseEvent/{eventName}"
        );
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("purgeHistoryDeleteUri").is_some());
        assert!(json.get("terminatePostUri").is_some());
    }

    #[test]
    fn test_payload_value() {
        assert_eq!(payload_value(None), Value::Null);
        assert_eq!(payload_value(Some("[1,2]")), serde_json::json!([1, 2]));
        assert_eq!(payload_value(Some("Hello World")), Value::String("Hello World".into()));
    }

    #[test]
    fn test_rfc3339() {
        assert_eq!(rfc3339(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(rfc3339(1_500), "1970-01-01T00:00:01.500Z");
    }
}
