use std::{panic, thread, time::Duration};

use metrics::counter;
use reqwest::{Client, ClientBuilder, StatusCode};
use thiserror::Error;
use tokio::runtime::Builder;
use tracing::{debug, warn};
use url::Url;

use crate::register::RegisterRequestError;

/// Client for the identity service shared by every component that acts on behalf of a user.
#[derive(Clone)]
pub struct IdentityClient {
    http: Client,
    // Unpooled client for the blocking calls; pooled connections would outlive
    // the per-call runtime that drove them.
    blocking_http: Client,
    base_url: Url,
    timeout: Duration,
}

impl IdentityClient {
    /// Creates a client rooted at `base_url` (e.g. `http://userservice:8081/`).
    ///
    /// `http` is called twice so the pooled async client and the unpooled
    /// blocking client carry the same settings. `timeout` is the default
    /// deadline for every remote call.
    pub fn new(
        base_url: Url,
        timeout: Duration,
        http: impl Fn() -> ClientBuilder,
    ) -> Result<Self, IdentityError> {
        if base_url.cannot_be_a_base() {
            return Err(IdentityError::InvalidBaseUrl(base_url.to_string()));
        }
        Ok(Self {
            http: http().build()?,
            blocking_http: http().pool_max_idle_per_host(0).build()?,
            base_url,
            timeout,
        })
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn endpoint(&self, segments: &[&str]) -> Result<Url, IdentityError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| IdentityError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Checks that `user_id` exists, using the configured default timeout.
    pub async fn validate(&self, user_id: &str) -> Result<ValidationResult, ValidationError> {
        self.validate_with_timeout(user_id, self.timeout).await
    }

    /// Checks that `user_id` exists, giving up after `timeout`.
    pub async fn validate_with_timeout(
        &self,
        user_id: &str,
        timeout: Duration,
    ) -> Result<ValidationResult, ValidationError> {
        self.validate_via(&self.http, user_id, timeout).await
    }

    /// Blocking form of [`IdentityClient::validate`] for synchronous callers.
    pub fn validate_blocking(&self, user_id: &str) -> Result<ValidationResult, ValidationError> {
        self.validate_blocking_with_timeout(user_id, self.timeout)
    }

    /// Blocking form of [`IdentityClient::validate_with_timeout`].
    ///
    /// The async call is driven to completion on a scoped thread with its own
    /// current-thread runtime, so it works from plain threads and from
    /// `spawn_blocking` alike. Do not call it on an async worker thread: it
    /// parks that thread until the call returns.
    pub fn validate_blocking_with_timeout(
        &self,
        user_id: &str,
        timeout: Duration,
    ) -> Result<ValidationResult, ValidationError> {
        thread::scope(|scope| {
            let worker = scope.spawn(|| {
                let runtime = Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(ValidationError::Runtime)?;
                runtime.block_on(self.validate_via(&self.blocking_http, user_id, timeout))
            });
            worker
                .join()
                .unwrap_or_else(|payload| panic::resume_unwind(payload))
        })
    }

    async fn validate_via(
        &self,
        http: &Client,
        user_id: &str,
        timeout: Duration,
    ) -> Result<ValidationResult, ValidationError> {
        if user_id.trim().is_empty() {
            counter!("identity_validation_total", "result" => "invalid_input").increment(1);
            return Err(ValidationError::InvalidInput);
        }
        let url = self
            .endpoint(&["api", "users", user_id, "validate"])
            .map_err(|_| ValidationError::InvalidInput)?;

        let result = match tokio::time::timeout(timeout, fetch(http, url)).await {
            Ok(Ok((status, body))) => map_response(status, &body),
            Ok(Err(err)) => ValidationResult::TransientFailure(classify_transport(&err)),
            Err(_) => ValidationResult::TransientFailure(TransientReason::Timeout),
        };

        counter!("identity_validation_total", "result" => result.metric_label()).increment(1);
        match &result {
            ValidationResult::TransientFailure(reason) => {
                warn!(stage = "identity", %user_id, %reason, "user validation could not be completed")
            }
            other => {
                debug!(stage = "identity", %user_id, result = other.metric_label(), "user validation finished")
            }
        }
        Ok(result)
    }
}

async fn fetch(http: &Client, url: Url) -> Result<(StatusCode, Vec<u8>), reqwest::Error> {
    let response = http.get(url).send().await?;
    let status = response.status();
    let body = response.bytes().await?;
    Ok((status, body.to_vec()))
}

/// The single mapping from a remote response to a [`ValidationResult`].
///
/// `200 true` is the only positive confirmation. `200 false` and `404` are
/// authoritative negatives; anything else means the user could not be verified.
pub fn map_response(status: StatusCode, body: &[u8]) -> ValidationResult {
    match status {
        StatusCode::OK => match serde_json::from_slice::<bool>(body) {
            Ok(true) => ValidationResult::Valid,
            Ok(false) => ValidationResult::NotFound,
            Err(_) => ValidationResult::TransientFailure(TransientReason::MalformedPayload),
        },
        StatusCode::NOT_FOUND => ValidationResult::NotFound,
        other => ValidationResult::TransientFailure(TransientReason::Status(other)),
    }
}

fn classify_transport(err: &reqwest::Error) -> TransientReason {
    if err.is_timeout() {
        TransientReason::Timeout
    } else if err.is_connect() {
        TransientReason::Connect
    } else {
        TransientReason::Request
    }
}

/// Outcome of a user-existence check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    /// The identity service positively confirmed the user.
    Valid,
    /// The identity service reported that the user does not exist.
    NotFound,
    /// The user could not be verified; callers should treat this as unavailability.
    TransientFailure(TransientReason),
}

impl ValidationResult {
    pub fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }

    pub fn metric_label(self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::NotFound => "not_found",
            Self::TransientFailure(_) => "transient_failure",
        }
    }
}

/// Why a validation call could not reach a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransientReason {
    #[error("request timed out")]
    Timeout,
    #[error("could not connect to identity service")]
    Connect,
    #[error("identity service answered {0}")]
    Status(StatusCode),
    #[error("identity service returned a non-boolean body")]
    MalformedPayload,
    #[error("request to identity service failed")]
    Request,
}

/// Errors that are not outcomes of the remote check itself.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("user id must not be empty")]
    InvalidInput,
    #[error("failed to start runtime for blocking validation: {0}")]
    Runtime(std::io::Error),
}

/// Errors produced by the identity client outside of user validation.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity base url cannot be used as a base: {0}")]
    InvalidBaseUrl(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("identity service did not answer within {0:?}")]
    Timeout(Duration),
    #[error("invalid registration: {0}")]
    InvalidRegistration(#[from] RegisterRequestError),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
}
