//! axum surface: scenario routes under `/api` and the instance status API.
//!
//! Every scenario route accepts both GET and POST. Query parameter names are
//! matched case-insensitively.
use std::collections::HashMap;
use std::future::Future;

use axum::Router;
use axum::extract::{Query, State};
use axum::handler::Handler;
use axum::routing::{MethodRouter, get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod error;
pub mod handlers;
pub mod state;
pub mod status;

pub use error::ApiError;
pub use state::AppState;
pub use status::{CheckStatusPayload, INSTANCES_PATH, InstanceStatus};

/// Case-insensitive lookup of a query parameter.
pub fn query_param(params: &HashMap<String, String>, name: &str) -> Option<String> {
    params
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.clone())
}

fn get_post<H, T>(handler: H) -> MethodRouter<AppState>
where
    H: Handler<T, AppState>,
    T: 'static,
{
    get(handler.clone()).post(handler)
}

fn scenario_routes() -> Router<AppState> {
    let mut router = Router::new()
        .route("/StartOrchestration", get_post(handlers::start_orchestration))
        .route("/HelloCities_HttpStart_Scheduled", get_post(handlers::hello_cities_scheduled))
        .route("/TimeoutOrchestrator_HttpStart", get_post(handlers::timeout_start))
        .route("/LargeOutputOrchestrator_HttpStart", get_post(handlers::large_output_start))
        .route("/LargeOutputOrchestrator_Query_Output", get_post(handlers::large_output_query))
        .route("/SendExternalEvent_HttpStart", get_post(handlers::send_external_event))
        .route("/TerminateInstance", get_post(handlers::terminate_instance))
        .route("/SuspendInstance", get_post(handlers::suspend_instance))
        .route("/ResumeInstance", get_post(handlers::resume_instance))
        .route("/PurgeOrchestrationHistory", get_post(handlers::purge_history))
        .route("/GetAllInstances", get_post(handlers::get_all_instances))
        .route("/GetRunningInstances", get_post(handlers::get_running_instances))
        .route("/RestartOrchestration_HttpStart/:orchestrationName", get_post(handlers::restart_start))
        .route("/RestartOrchestration_HttpRestart", get_post(handlers::restart))
        .route(
            "/RestartOrchestration_HttpRestartWithErrorHandling",
            get_post(handlers::restart_with_error_handling),
        )
        .route("/HttpTrigger", get_post(handlers::http_trigger))
        .route("/http_trigger", get_post(handlers::http_trigger));

    for &(route, orchestration) in handlers::NAMED_STARTS {
        router = router.route(
            &format!("/{route}"),
            get_post(
                move |State(state): State<AppState>, Query(params): Query<HashMap<String, String>>| {
                    handlers::start_fixed(state, params, orchestration)
                },
            ),
        );
    }
    router
}

fn status_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(status::list_instance_statuses))
        .route(
            "/:id",
            get(status::get_instance_status).delete(status::purge_instance),
        )
        .route("/:id/raiseEvent/:eventName", axum::routing::post(status::raise_event))
        .route("/:id/terminate", axum::routing::post(status::terminate))
        .route("/:id/suspend", axum::routing::post(status::suspend))
        .route("/:id/resume", axum::routing::post(status::resume))
}

/// Full router with tracing and permissive CORS.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .nest("/api", scenario_routes())
        .nest(INSTANCES_PATH, status_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(target: "durable_e2e::http", address = %addr, base_url = %state.base_url(), "HTTP server listening");
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_ignores_case() {
        let mut params = HashMap::new();
        params.insert("instanceid".to_string(), "abc".to_string());
        assert_eq!(query_param(&params, "instanceId").as_deref(), Some("abc"));
        assert_eq!(query_param(&params, "name"), None);
    }
}
