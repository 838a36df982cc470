/**
 * API REST HIVE - Accès pull au dernier snapshot
 *
 * RÔLE : Exposer aux outils de supervision (dashboard, CLI `status`) l'état agrégé
 * du run. Lecture seule : rien n'est jamais écrit sur le bus depuis l'API.
 *
 * ROUTES :
 * - /health                      : liveness du service (toujours accessible)
 * - /health/service              : compteurs du service (refreshs, échecs, MQTT)
 * - /snapshot                    : SystemSnapshot complet
 * - /participants[?stale=bool]   : vues participants
 * - /participants/{id}
 * - /tasks[?status=pending|...]  : tâches dans l'ordre de publication
 * - /tasks/{id}
 *
 * SÉCURITÉ : si HIVE_API_KEY est défini, header x-api-key exigé hors /health.
 */

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::warn;

use crate::aggregator::{ParticipantView, SnapshotHub, SystemSnapshot};
use crate::lifecycle::TaskStatus;
use crate::status::{ServiceHealth, ServiceStatus};
use crate::tasks::TaskState;

pub const API_KEY_ENV: &str = "HIVE_API_KEY";

#[derive(Clone)]
pub struct AppState {
    pub hub: SnapshotHub,
    pub status: ServiceStatus,
    pub api_key: Option<String>,
}

impl AppState {
    pub fn new(hub: SnapshotHub, status: ServiceStatus) -> Self {
        let api_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        Self { hub, status, api_key }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }
    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !ok {
        warn!("[http] rejected request to {} (bad or missing x-api-key)", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/health/service", get(get_service_health))
        .route("/snapshot", get(get_snapshot))
        .route("/participants", get(list_participants))
        .route("/participants/{id}", get(get_participant))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .layer(middleware::from_fn_with_state(app.clone(), require_api_key))
        .with_state(app)
}

async fn get_service_health(State(app): State<AppState>) -> Json<ServiceHealth> {
    Json(app.status.snapshot())
}

async fn get_snapshot(State(app): State<AppState>) -> Json<SystemSnapshot> {
    Json(app.hub.fetch().as_ref().clone())
}

#[derive(Debug, Deserialize)]
struct ParticipantFilter {
    stale: Option<bool>,
}

async fn list_participants(
    State(app): State<AppState>,
    Query(filter): Query<ParticipantFilter>,
) -> Json<Vec<ParticipantView>> {
    let snapshot = app.hub.fetch();
    Json(
        snapshot
            .participants
            .values()
            .filter(|p| filter.stale.map_or(true, |s| p.stale == s))
            .cloned()
            .collect(),
    )
}

async fn get_participant(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ParticipantView>, StatusCode> {
    app.hub
        .fetch()
        .participants
        .get(&id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct TaskFilter {
    status: Option<TaskStatus>,
}

async fn list_tasks(State(app): State<AppState>, Query(filter): Query<TaskFilter>) -> Json<Vec<TaskState>> {
    let snapshot = app.hub.fetch();
    Json(
        snapshot
            .tasks
            .iter()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .cloned()
            .collect(),
    )
}

async fn get_task(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<TaskState>, StatusCode> {
    app.hub
        .fetch()
        .task(&id)
        .cloned()
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::replay;
    use crate::health::HealthMonitor;
    use crate::message::{LogPosition, Message, MessageBody, PublishReason, TaskClaim, TaskPublish, TaskSpec};
    use axum::body::{to_bytes, Body};
    use axum::http::Request as HttpRequest;
    use chrono::Utc;
    use tower::ServiceExt;

    fn app() -> AppState {
        let t = Utc::now();
        let spec = |id: &str| TaskSpec {
            id: id.into(),
            title: id.into(),
            description: String::new(),
            required_skills: vec![],
            priority: 5,
            estimated_hours: 1.0,
            dependencies: Default::default(),
            status: TaskStatus::Pending,
        };
        let messages = vec![
            Message {
                position: LogPosition(1),
                observed_at: t,
                sender: "leader".into(),
                body: MessageBody::TaskPublish(TaskPublish {
                    tasks: vec![spec("task-1"), spec("task-2")],
                    reason: PublishReason::Initial,
                }),
            },
            Message {
                position: LogPosition(2),
                observed_at: t,
                sender: "w1".into(),
                body: MessageBody::TaskClaim(TaskClaim {
                    task_id: "task-1".into(),
                    participant_id: "w1".into(),
                    observed_at: t,
                }),
            },
        ];
        let hub = SnapshotHub::new(replay(&messages, t, &HealthMonitor::default()));
        AppState { hub, status: ServiceStatus::new(), api_key: None }
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(HttpRequest::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn snapshot_and_task_routes() {
        let router = build_router(app());
        let (status, snap) = get_json(router.clone(), "/snapshot").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snap["counts"]["claimed"], 1);
        assert_eq!(snap["asOf"], 2);

        let (_, pending) = get_json(router.clone(), "/tasks?status=pending").await;
        assert_eq!(pending.as_array().unwrap().len(), 1);
        assert_eq!(pending[0]["id"], "task-2");

        let (_, task) = get_json(router.clone(), "/tasks/task-1").await;
        assert_eq!(task["assignee"], "w1");

        let (status, _) = get_json(router, "/tasks/task-9").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn participants_route_lists_senders() {
        let (status, list) = get_json(build_router(app()), "/participants?stale=false").await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<&str> = list.as_array().unwrap().iter().map(|p| p["id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["leader", "w1"]);
    }

    #[tokio::test]
    async fn api_key_guards_everything_but_health() {
        let router = build_router(app().with_api_key("k"));
        let (status, _) = get_json(router.clone(), "/snapshot").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = get_json(router.clone(), "/health/service").await;
        assert_eq!(status, StatusCode::OK);

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/snapshot")
                    .header("x-api-key", "k")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
