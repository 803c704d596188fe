use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::error;

use fitness_core::types::Recommendation;
use fitness_identity::IdentityClient;
use fitness_storage::Database;

use crate::channel::SqliteActivityChannel;
use crate::problem::ProblemResponse;
use crate::{ingress, telemetry};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    storage: Database,
    identity: IdentityClient,
    channel: SqliteActivityChannel,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        storage: Database,
        identity: IdentityClient,
        channel: SqliteActivityChannel,
    ) -> Self {
        Self {
            metrics,
            storage,
            identity,
            channel,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn identity(&self) -> &IdentityClient {
        &self.identity
    }

    pub fn channel(&self) -> &SqliteActivityChannel {
        &self.channel
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/api/activities", post(ingress::submit_activity))
        .route(
            "/api/recommendations/activity/:activity_id",
            get(recommendation_for_activity),
        )
        .route("/api/recommendations/user/:user_id", get(recommendations_for_user))
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        Body::from(body),
    )
}

async fn recommendation_for_activity(
    State(state): State<AppState>,
    Path(activity_id): Path<String>,
) -> Result<Json<Recommendation>, ProblemResponse> {
    let recommendation = state
        .storage()
        .recommendations()
        .fetch_by_activity(&activity_id)
        .await
        .map_err(|err| {
            error!(stage = "storage", %activity_id, error = %err, "failed to load recommendation");
            ProblemResponse::internal("storage_error", "failed to load recommendation")
        })?;

    recommendation.map(Json).ok_or_else(|| {
        ProblemResponse::not_found(
            "recommendation_not_found",
            format!("no recommendation for activity {activity_id}"),
        )
    })
}

async fn recommendations_for_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Recommendation>>, ProblemResponse> {
    state
        .storage()
        .recommendations()
        .list_for_user(&user_id)
        .await
        .map(Json)
        .map_err(|err| {
            error!(stage = "storage", %user_id, error = %err, "failed to list recommendations");
            ProblemResponse::internal("storage_error", "failed to list recommendations")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use httpmock::prelude::*;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;
    use url::Url;

    use fitness_core::types::UserId;

    use crate::channel::ActivityChannel;

    struct Harness {
        state: AppState,
        identity: MockServer,
    }

    impl Harness {
        async fn respond(&self, user_id: &str, status: u16, body: &str) {
            let path = format!("/api/users/{user_id}/validate");
            self.identity
                .mock_async(|when, then| {
                    when.method(GET).path(path);
                    then.status(status).body(body);
                })
                .await;
        }
    }

    async fn harness() -> Harness {
        let identity_server = MockServer::start_async().await;
        let base = Url::parse(&identity_server.url("/")).expect("url");
        let identity = IdentityClient::new(base, Duration::from_secs(2), reqwest::Client::builder)
            .expect("identity client");

        let db = Database::connect("sqlite::memory:").await.expect("connect");
        db.run_migrations().await.expect("migrations");
        let channel = SqliteActivityChannel::new(&db, "activity.queue", Duration::from_secs(30));
        let metrics = telemetry::init_metrics().expect("metrics");

        Harness {
            state: AppState::new(metrics, db, identity, channel),
            identity: identity_server,
        }
    }

    fn submit(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/activities")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let harness = harness().await;
        let response = app_router(harness.state)
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn valid_user_activity_is_queued() {
        let harness = harness().await;
        harness.respond("u1", 200, "true").await;
        let state = harness.state.clone();

        let response = app_router(harness.state)
            .oneshot(submit(json!({
                "userId": "u1",
                "type": "RUNNING",
                "metrics": { "durationMinutes": 30, "caloriesBurned": 300 }
            })))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        let activity_id = body["id"].as_str().expect("id").to_string();
        assert_eq!(body["userId"], "u1");

        let delivery = state
            .channel()
            .receive()
            .await
            .expect("receive")
            .expect("queued activity");
        assert_eq!(delivery.message_id, activity_id);
    }

    #[tokio::test]
    async fn user_header_takes_precedence_over_body() {
        let harness = harness().await;
        harness.respond("u2", 200, "true").await;

        let mut request = submit(json!({ "userId": "u9", "type": "CYCLING" }));
        request
            .headers_mut()
            .insert("x-user-id", "u2".parse().expect("header value"));
        let response = app_router(harness.state)
            .oneshot(request)
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(response).await["userId"], "u2");
    }

    #[tokio::test]
    async fn unknown_user_is_denied() {
        let harness = harness().await;
        harness.respond("ghost", 404, "").await;
        let state = harness.state.clone();

        let response = app_router(harness.state)
            .oneshot(submit(json!({ "userId": "ghost", "type": "RUNNING" })))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["type"], "user_not_found");
        assert_eq!(
            state
                .storage()
                .activity_queue()
                .pending_count("activity.queue")
                .await
                .expect("pending"),
            0
        );
    }

    #[tokio::test]
    async fn identity_outage_is_service_unavailable() {
        let harness = harness().await;
        harness.respond("u1", 500, "").await;

        let response = app_router(harness.state)
            .oneshot(submit(json!({ "userId": "u1", "type": "RUNNING" })))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json_body(response).await["type"], "identity_unavailable");
    }

    #[tokio::test]
    async fn blank_user_is_bad_request() {
        let harness = harness().await;
        let response = app_router(harness.state)
            .oneshot(submit(json!({ "userId": "  ", "type": "RUNNING" })))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["type"], "invalid_user_id");
    }

    #[tokio::test]
    async fn recommendation_lookup() {
        let harness = harness().await;
        let recommendation = Recommendation {
            id: Recommendation::id_for_activity("a1"),
            activity_id: "a1".to_string(),
            user_id: UserId::parse("u1").expect("user id"),
            activity_type: "RUNNING".to_string(),
            content: "Completed a running session.".to_string(),
            improvements: vec![],
            suggestions: vec!["tempo run".to_string()],
            safety: vec![],
            generated_at: Utc::now(),
        };
        harness
            .state
            .storage()
            .recommendations()
            .persist(&recommendation, Utc::now())
            .await
            .expect("persist");
        let router = app_router(harness.state);

        let found = router
            .clone()
            .oneshot(
                Request::get("/api/recommendations/activity/a1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(found.status(), StatusCode::OK);
        assert_eq!(json_body(found).await["activityId"], "a1");

        let listed = router
            .clone()
            .oneshot(
                Request::get("/api/recommendations/user/u1")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(listed.status(), StatusCode::OK);
        assert_eq!(json_body(listed).await.as_array().map(Vec::len), Some(1));

        let missing = router
            .oneshot(
                Request::get("/api/recommendations/activity/nope")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            missing
                .headers()
                .get(header::CONTENT_TYPE)
                .expect("content type"),
            "application/problem+json"
        );
    }
}
