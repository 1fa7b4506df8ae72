//! HTTP route handlers: health and the orchestrator control surface.

use std::path::PathBuf;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use orchestrator::core::types::{Heartbeat, InstanceKind};
use orchestrator::error::Error;
use orchestrator::registry::Registration;

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/orchestrator", post(control))
}

/// GET /api/health
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "instances": state.orch.registry.len(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ControlRequest {
    Register {
        instance_id: String,
        #[serde(flatten)]
        registration: Registration,
    },
    Poll,
    Decide {
        instance_id: String,
    },
    Status {
        #[serde(default)]
        instance_id: Option<String>,
        #[serde(default)]
        task_id: Option<String>,
    },
    Heartbeat {
        instance_id: String,
        status: String,
        #[serde(default)]
        checkpoint_id: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    Pause {
        instance_id: String,
    },
    Resume {
        instance_id: String,
    },
    Rollback {
        instance_id: String,
    },
    Escalate {
        instance_id: String,
        reason: String,
    },
    Logs {
        instance_id: String,
    },
    Dashboard,
    CreateDraft {
        content: String,
        #[serde(default)]
        description: String,
    },
    ValidateDraft {
        draft_id: String,
    },
    Breakdown {
        draft_id: String,
    },
    RunTask {
        task_id: String,
        #[serde(default)]
        working_dir: Option<PathBuf>,
    },
    CompleteDraft {
        draft_id: String,
    },
    MergeDraft {
        draft_id: String,
        approver: String,
    },
}

/// Error response. Internal failures carry only a request id.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: Value,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({ "error": message.into(), "kind": "bad_request" }),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        if let Some(request_id) = err.correlation_id() {
            return Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: json!({ "error": "internal error", "request_id": request_id }),
            };
        }
        let status = match &err {
            Error::Validation(_)
            | Error::InvalidTransition { .. }
            | Error::Plan(_)
            | Error::MalformedDecision(_) => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::TransientWorker(_) | Error::Worker(_) | Error::Timeout { .. } => {
                StatusCode::BAD_GATEWAY
            }
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            body: json!({ "error": err.to_string(), "kind": err.kind() }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn to_json<T: serde::Serialize>(value: T) -> Result<Json<Value>, ApiError> {
    serde_json::to_value(value)
        .map(Json)
        .map_err(|err| ApiError::from(Error::from(anyhow::Error::new(err))))
}

/// POST /api/orchestrator - single control endpoint keyed by `action`.
async fn control(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let request: ControlRequest = serde_json::from_value(body)
        .map_err(|err| ApiError::bad_request(format!("invalid request: {err}")))?;
    let orch = &state.orch;

    match request {
        ControlRequest::Register {
            instance_id,
            registration,
        } => to_json(orch.registry.register(&instance_id, registration)?),
        ControlRequest::Poll => to_json(orch.scheduler.poll_once().await),
        ControlRequest::Decide { instance_id } => {
            to_json(orch.scheduler.decide(&instance_id).await?)
        }
        ControlRequest::Status {
            instance_id,
            task_id,
        } => match (instance_id, task_id) {
            (Some(instance_id), _) => {
                let instance = orch.registry.require(&instance_id)?;
                let related = orch.registry.get_related(&instance_id)?;
                to_json(json!({ "instance": instance, "related": related }))
            }
            (None, Some(task_id)) => {
                let task = orch.entities.get_task(&task_id)?;
                let checkpoints = orch.entities.task_checkpoints(&task_id)?;
                to_json(json!({ "task": task, "checkpoints": checkpoints }))
            }
            (None, None) => to_json(json!({
                "tasks": orch.entities.list_tasks(),
                "drafts": orch.entities.list_drafts(None),
            })),
        },
        ControlRequest::Heartbeat {
            instance_id,
            status,
            checkpoint_id,
            message,
        } => {
            orch.registry.record_heartbeat(
                &instance_id,
                Heartbeat {
                    at: orch.registry.now(),
                    checkpoint_id,
                    status,
                    message,
                },
            )?;
            to_json(json!({ "ok": true }))
        }
        ControlRequest::Pause { instance_id } => to_json(orch.supervisor.pause(&instance_id)?),
        ControlRequest::Resume { instance_id } => {
            let instance = orch.supervisor.resume(&instance_id)?;
            if instance.kind == InstanceKind::Task {
                spawn_drive(&state, instance.id.clone());
            }
            to_json(instance)
        }
        ControlRequest::Rollback { instance_id } => {
            let instance = orch.supervisor.rollback(&instance_id)?;
            spawn_drive(&state, instance.id.clone());
            to_json(instance)
        }
        ControlRequest::Escalate {
            instance_id,
            reason,
        } => {
            let ticket_id = orch
                .supervisor
                .escalate_instance(&instance_id, &reason)
                .await?;
            to_json(json!({ "ticket_id": ticket_id }))
        }
        ControlRequest::Logs { instance_id } => {
            let instance = orch.registry.require(&instance_id)?;
            to_json(json!({
                "log": instance.log,
                "messages": instance.messages,
                "heartbeats": instance.heartbeats,
                "decisions": instance.decisions,
            }))
        }
        ControlRequest::Dashboard => to_json(orch.registry.dashboard()),
        ControlRequest::CreateDraft {
            content,
            description,
        } => to_json(orch.entities.create_draft(&content, &description)?),
        ControlRequest::ValidateDraft { draft_id } => to_json(orch.entities.validate(&draft_id)?),
        ControlRequest::Breakdown { draft_id } => {
            to_json(orch.entities.breakdown(&draft_id).await?)
        }
        ControlRequest::RunTask {
            task_id,
            working_dir,
        } => {
            let working_dir = working_dir.unwrap_or_else(|| PathBuf::from("."));
            let instance = orch.supervisor.start(&task_id, working_dir)?;
            spawn_drive(&state, instance.id.clone());
            to_json(instance)
        }
        ControlRequest::CompleteDraft { draft_id } => {
            to_json(orch.entities.complete_execution(&draft_id)?)
        }
        ControlRequest::MergeDraft { draft_id, approver } => {
            to_json(orch.entities.merge(&draft_id, &approver)?)
        }
    }
}

/// Drive a task run in the background; the request returns immediately.
fn spawn_drive(state: &AppState, instance_id: String) {
    let orch = state.orch.clone();
    tokio::spawn(async move {
        match orch.supervisor.drive(&instance_id).await {
            Ok(run) => info!(%instance_id, state = ?run.state, "task run stopped"),
            Err(err) => warn!(%instance_id, error = %err, "task run failed"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use orchestrator::app::Orchestrator;
    use orchestrator::test_support::{DRAFT_CONTENT, Harness, ScriptedSession, fast_config};
    use tower::ServiceExt;

    fn app(harness: &Harness, max_instances: usize) -> Router {
        let mut config = fast_config();
        config.registry.max_instances = max_instances;
        let state = AppState::new(Orchestrator::in_memory(config, harness.collaborators()));
        Router::new().nest("/api", api_router()).with_state(state)
    }

    async fn post(app: &Router, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/api/orchestrator")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let harness = Harness::new(Vec::new());
        let app = app(&harness, 5);
        let request = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_action_is_bad_request() {
        let harness = Harness::new(Vec::new());
        let app = app(&harness, 5);
        let (status, body) = post(&app, json!({ "action": "self_destruct" })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "bad_request");
    }

    #[tokio::test]
    async fn register_then_pause_and_resume() {
        let harness = Harness::new(Vec::new());
        let app = app(&harness, 5);
        let (status, body) = post(
            &app,
            json!({ "action": "register", "instance_id": "w1", "metadata": { "team": "parser" } }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");
        assert_eq!(body["metadata"]["team"], "parser");

        let (status, body) = post(&app, json!({ "action": "pause", "instance_id": "w1" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "paused");

        let (status, body) = post(&app, json!({ "action": "resume", "instance_id": "w1" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "active");
    }

    #[tokio::test]
    async fn capacity_maps_to_too_many_requests() {
        let harness = Harness::new(Vec::new());
        let app = app(&harness, 1);
        post(&app, json!({ "action": "register", "instance_id": "w1" })).await;
        let (status, body) = post(&app, json!({ "action": "register", "instance_id": "w2" })).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["kind"], "capacity_exceeded");
    }

    #[tokio::test]
    async fn missing_instance_is_not_found() {
        let harness = Harness::new(Vec::new());
        let app = app(&harness, 5);
        let (status, _) = post(&app, json!({ "action": "logs", "instance_id": "ghost" })).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn draft_lifecycle_over_the_control_surface() {
        let harness = Harness::new(Vec::new());
        let app = app(&harness, 5);
        let (status, draft) = post(
            &app,
            json!({ "action": "create_draft", "content": DRAFT_CONTENT, "description": "parser" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let draft_id = draft["id"].as_str().expect("draft id").to_string();

        let (status, validation) =
            post(&app, json!({ "action": "validate_draft", "draft_id": draft_id })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(validation["passed"], true);

        let (status, body) =
            post(&app, json!({ "action": "merge_draft", "draft_id": draft_id, "approver": "sam" }))
                .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "invalid_transition");
    }

    #[tokio::test]
    async fn decide_records_a_wait_by_default() {
        let harness = Harness::new(Vec::new());
        harness
            .worker
            .attach("w1", ScriptedSession::running_forever());
        let app = app(&harness, 5);
        post(&app, json!({ "action": "register", "instance_id": "w1" })).await;
        let (status, body) = post(&app, json!({ "action": "decide", "instance_id": "w1" })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["action"], "wait");
    }
}
