use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use iotistic_domain::{validate_target, CurrentState, LogLevel, ServiceStatus, TargetState};
use iotistic_reconciler::ReconcileTrigger;
use iotistic_store::LogFilter;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn ready(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.store.get_current_state().await?;
    Ok(StatusCode::OK)
}

// ── State ─────────────────────────────────────────────────────────────────────

pub async fn get_state(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let target = state.store.get_target_state().await?.unwrap_or_default();
    let current = state.store.get_current_state().await?.unwrap_or_default();
    let summary = summarize(&target, &current);
    Ok(Json(json!({
        "target": target,
        "current": current,
        "summary": summary,
    })))
}

pub async fn put_target(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let normalized = normalize_target(body)?;
    let mut target: TargetState = serde_json::from_value(normalized)
        .map_err(|e| ApiError::bad_request(format!("malformed target state: {}", e)))?;
    validate_target(&target)?;

    let previous = state.store.get_target_state().await?;
    target.version = previous.map(|t| t.version + 1).unwrap_or(1);
    state.store.put_target_state(&target).await?;
    info!(version = target.version, "target state replaced via admin API");

    state.reconcile.trigger(ReconcileTrigger::TargetChanged);
    Ok(Json(json!({ "status": "accepted", "version": target.version })))
}

pub async fn post_apply(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.reconcile.trigger(ReconcileTrigger::Manual);
    Ok(Json(json!({ "status": "reconcile-queued" })))
}

// ── Logs ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub service: Option<String>,
    pub level: Option<String>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: Option<usize>,
}

pub async fn get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Value>, ApiError> {
    let min_level = match query.level.as_deref() {
        None => None,
        Some(s) => Some(
            LogLevel::parse(s)
                .ok_or_else(|| ApiError::bad_request(format!("unknown level '{}'", s)))?,
        ),
    };
    let filter = LogFilter {
        service_name: query.service,
        min_level,
        since: query.since,
        limit: Some(query.limit.unwrap_or(100).min(1000)),
    };
    let entries = state.local_logs.query(&filter).await;
    Ok(Json(json!({ "count": entries.len(), "logs": entries })))
}

// ── Exec ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ExecCommand {
    Argv(Vec<String>),
    Line(String),
}

#[derive(Debug, Deserialize)]
pub struct ExecBody {
    pub command: ExecCommand,
}

pub async fn post_exec(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
    Json(body): Json<ExecBody>,
) -> Result<Json<Value>, ApiError> {
    let argv: Vec<String> = match body.command {
        ExecCommand::Argv(argv) => argv,
        ExecCommand::Line(line) => line.split_whitespace().map(String::from).collect(),
    };
    if argv.is_empty() {
        return Err(ApiError::bad_request("empty command"));
    }
    let result = state.runtime.exec(&container_id, &argv).await?;
    Ok(Json(json!({
        "stdout": result.stdout,
        "stderr": result.stderr,
        "exit_code": result.exit_code,
    })))
}

// ── Device identity ───────────────────────────────────────────────────────────

pub async fn get_device(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let identity = state
        .store
        .get_identity()
        .await?
        .ok_or_else(|| ApiError::not_found("device identity not initialized"))?;
    // The key hash stays on the device
    Ok(Json(json!({
        "uuid": identity.uuid,
        "device_name": identity.device_name,
        "device_type": identity.device_type,
        "fleet_id": identity.fleet_id,
        "provisioning_state": identity.provisioning_state,
        "api_endpoint": identity.api_endpoint,
        "provisioned_at": identity.provisioned_at,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionBody {
    pub provisioning_key: String,
}

pub async fn post_provision(
    State(state): State<AppState>,
    Json(body): Json<ProvisionBody>,
) -> Result<Json<Value>, ApiError> {
    let client = state
        .cloud
        .as_ref()
        .ok_or_else(|| ApiError::unavailable("no cloud endpoint configured"))?;
    state
        .identity
        .provision(client, &body.provisioning_key, &state.supervisor_version)
        .await?;
    Ok(Json(json!({ "status": "registered" })))
}

pub async fn post_reset(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let identity = state.identity.reset().await?;
    Ok(Json(json!({ "status": "reset", "uuid": identity.uuid })))
}

// ── Metrics ───────────────────────────────────────────────────────────────────

pub async fn get_metrics(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let snapshot = state.metrics.collect().await;
    Ok(Json(json!(snapshot)))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Per-service status chips for the UI: in-sync | needs-update | missing |
/// extra | error, with a short reason where it helps.
fn summarize(target: &TargetState, current: &CurrentState) -> Vec<Value> {
    use iotistic_domain::ReconciliationStatus;

    let mut out = Vec::new();

    for (app_id, app) in &target.apps {
        let cur_app = current.apps.get(app_id);
        for service in &app.services {
            let entry = cur_app.and_then(|a| a.service(service.service_id));
            let (status, reason): (&str, Option<String>) = match entry {
                // A latched failure outranks the target/current diff
                Some(cs) if cs.status == ServiceStatus::Error => ("error", cs.error.clone()),
                _ => match ReconciliationStatus::derive(Some(service), entry) {
                    Some(rs) => (rs.chip(), rs.reason().map(String::from)),
                    None => continue,
                },
            };
            out.push(json!({
                "app_id": app_id,
                "service_id": service.service_id,
                "service_name": service.service_name,
                "status": status,
                "reason": reason,
            }));
        }
    }

    for (app_id, app) in &current.apps {
        let tgt_app = target.apps.get(app_id);
        for cs in &app.services {
            let in_target = tgt_app
                .map(|a| a.service(cs.service_id).is_some())
                .unwrap_or(false);
            if !in_target {
                if let Some(rs) = ReconciliationStatus::derive(None, Some(cs)) {
                    out.push(json!({
                        "app_id": app_id,
                        "service_id": cs.service_id,
                        "service_name": cs.service_name,
                        "status": rs.chip(),
                        "reason": rs.reason(),
                    }));
                }
            }
        }
    }

    out
}

/// Accept `image` as a plain string or an object carrying a `name` field,
/// and fold either into `image_ref`.
fn normalize_target(mut body: Value) -> Result<Value, ApiError> {
    let Some(apps) = body.get_mut("apps").and_then(Value::as_object_mut) else {
        return Ok(body);
    };
    for app in apps.values_mut() {
        let Some(services) = app.get_mut("services").and_then(Value::as_array_mut) else {
            continue;
        };
        for service in services {
            let Some(obj) = service.as_object_mut() else {
                continue;
            };
            if obj.contains_key("image_ref") {
                continue;
            }
            let image_ref = match obj.remove("image") {
                Some(Value::String(s)) => Some(s),
                Some(Value::Object(image)) => match image.get("name").and_then(Value::as_str)
                {
                    Some(name) => Some(name.to_string()),
                    None => {
                        return Err(ApiError::bad_request(
                            "image object without a name field",
                        ))
                    }
                },
                Some(other) => {
                    return Err(ApiError::bad_request(format!(
                        "image must be a string or object, got {}",
                        other
                    )))
                }
                None => None,
            };
            if let Some(image_ref) = image_ref {
                obj.insert("image_ref".into(), Value::String(image_ref));
            }
        }
    }
    Ok(body)
}
