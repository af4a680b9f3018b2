use std::sync::Arc;

use axum::http::StatusCode;
use axum::{
    extract::State,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde_json::json;

use crate::garbage_collector::{self, GarbageCollector};
use crate::services::Orchestrator;

/// Internal health/debug surface. Instance operations are not exposed here.
#[derive(Clone)]
pub struct AdminState {
    pub orchestrator: Arc<Orchestrator>,
    pub collectors: Arc<Vec<GarbageCollector>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/admin/status", get(get_status))
        .route("/admin/zones", get(get_zones))
        .route("/admin/reconcile", post(reconcile))
        .with_state(state)
}

async fn root() -> &'static str {
    "Instancer Orchestrator Online"
}

async fn get_status(State(state): State<AdminState>) -> impl IntoResponse {
    let orchestrator = &state.orchestrator;
    match orchestrator.context().store.count_by_status().await {
        Ok(counts) => {
            let instances: serde_json::Map<String, serde_json::Value> = counts
                .into_iter()
                .map(|(status, n)| (status.as_str().to_string(), json!(n)))
                .collect();
            (
                StatusCode::OK,
                Json(json!({
                    "instances": instances,
                    "supervision_tasks": orchestrator.supervisor().in_flight(),
                    "shutting_down": orchestrator.supervisor().is_shutting_down(),
                })),
            )
        }
        Err(e) => {
            tracing::error!(error = %e, "admin status: store error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

async fn get_zones(State(state): State<AdminState>) -> impl IntoResponse {
    match state.orchestrator.list_zones().await {
        Ok(zones) => (StatusCode::OK, Json(json!(zones))),
        Err(e) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

/// Runs one garbage collection pass per provider now.
async fn reconcile(State(state): State<AdminState>) -> impl IntoResponse {
    let mut failed = false;
    let mut results = serde_json::Map::new();
    for (provider, outcome) in garbage_collector::run_all(&state.collectors).await {
        let value = match outcome {
            Ok(summary) => json!({"ok": true, "summary": summary}),
            Err(e) => {
                failed = true;
                json!({"ok": false, "error": e.to_string()})
            }
        };
        results.insert(provider, value);
    }
    let status = if failed {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::OK
    };
    (status, Json(serde_json::Value::Object(results)))
}
