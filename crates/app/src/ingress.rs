use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use metrics::counter;
use serde::Deserialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use fitness_core::types::{Activity, ActivityMetrics, UserId};
use fitness_identity::{ValidationError, ValidationResult};

use crate::problem::ProblemResponse;
use crate::router::AppState;

/// Header set by the gateway for authenticated callers.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Body of `POST /api/activities`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(rename = "type")]
    pub activity_type: String,
    #[serde(default)]
    pub metrics: ActivityMetrics,
}

/// Accepts an activity on behalf of a user and publishes it to the activity channel.
///
/// The user comes from the `X-User-ID` header when present, else from `userId`.
///
/// The user must be positively confirmed by the identity service. "Does not
/// exist" is a denial (403); "could not verify" is unavailability (503).
pub async fn submit_activity(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut request): Json<ActivityRequest>,
) -> Result<(StatusCode, Json<Activity>), ProblemResponse> {
    if let Some(user_id) = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        request.user_id = user_id.to_string();
    }
    let result = accept(&state, request).await;
    let label = match &result {
        Ok(_) => "accepted",
        Err(problem) => problem.problem_type(),
    };
    counter!("activity_ingress_total", "result" => label).increment(1);
    result.map(|activity| (StatusCode::ACCEPTED, Json(activity)))
}

async fn accept(state: &AppState, request: ActivityRequest) -> Result<Activity, ProblemResponse> {
    let user_id = UserId::parse(request.user_id)
        .map_err(|err| ProblemResponse::bad_request("invalid_user_id", err.to_string()))?;
    if request.activity_type.trim().is_empty() {
        return Err(ProblemResponse::bad_request(
            "invalid_activity_type",
            "activity type must not be empty",
        ));
    }

    match state.identity().validate(user_id.as_str()).await {
        Ok(ValidationResult::Valid) => {}
        Ok(ValidationResult::NotFound) => {
            warn!(stage = "ingress", %user_id, "activity rejected: unknown user");
            return Err(ProblemResponse::new(
                StatusCode::FORBIDDEN,
                "user_not_found",
                format!("user {user_id} does not exist"),
            ));
        }
        Ok(ValidationResult::TransientFailure(reason)) => {
            return Err(ProblemResponse::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "identity_unavailable",
                format!("could not verify user: {reason}"),
            ));
        }
        Err(ValidationError::InvalidInput) => {
            return Err(ProblemResponse::bad_request(
                "invalid_user_id",
                "user id must not be empty",
            ));
        }
        Err(err) => {
            error!(stage = "ingress", %user_id, error = %err, "user validation errored");
            return Err(ProblemResponse::internal("validation_error", err.to_string()));
        }
    }

    let activity = Activity {
        id: Uuid::new_v4().to_string(),
        user_id,
        activity_type: request.activity_type.trim().to_string(),
        metrics: request.metrics,
        timestamp: state.now(),
    };

    state.channel().publish(&activity).await.map_err(|err| {
        error!(stage = "ingress", activity_id = %activity.id, error = %err, "failed to publish activity");
        ProblemResponse::internal("queue_unavailable", "activity could not be queued")
    })?;

    info!(
        stage = "ingress",
        activity_id = %activity.id,
        user_id = %activity.user_id,
        activity_type = %activity.activity_type,
        queue = state.channel().queue_name(),
        "activity queued"
    );
    Ok(activity)
}
