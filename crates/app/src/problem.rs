use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// RFC 7807 body returned for every rejected request.
#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

#[derive(Debug)]
pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }

    pub fn bad_request<S: Into<String>>(problem_type: &'static str, detail: S) -> Self {
        Self::new(StatusCode::BAD_REQUEST, problem_type, detail)
    }

    pub fn not_found<S: Into<String>>(problem_type: &'static str, detail: S) -> Self {
        Self::new(StatusCode::NOT_FOUND, problem_type, detail)
    }

    pub fn internal<S: Into<String>>(problem_type: &'static str, detail: S) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, problem_type, detail)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn problem_type(&self) -> &'static str {
        self.body.problem_type
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
