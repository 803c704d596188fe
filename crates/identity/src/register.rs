use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::info;
use url::Url;

use crate::validation::{IdentityClient, IdentityError};

const MIN_PASSWORD_LEN: usize = 6;

/// Registration payload forwarded to the identity service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keycloak_id: Option<String>,
}

impl RegisterRequest {
    /// Applies the field constraints the identity service enforces.
    pub fn validate(&self) -> Result<(), RegisterRequestError> {
        let email = self.email.trim();
        if email.is_empty() {
            return Err(RegisterRequestError::MissingEmail);
        }
        let well_formed = email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
        if !well_formed {
            return Err(RegisterRequestError::InvalidEmail);
        }
        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(RegisterRequestError::PasswordTooShort);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegisterRequestError {
    #[error("email is required")]
    MissingEmail,
    #[error("invalid email format")]
    InvalidEmail,
    #[error("password must be at least 6 characters")]
    PasswordTooShort,
}

impl IdentityClient {
    /// Forwards a registration to `POST /api/users/register`.
    ///
    /// The payload is checked locally first. Non-success statuses are returned
    /// unchanged as [`IdentityError::Status`]; the whole exchange is bounded by
    /// the client's timeout.
    pub async fn register_user(&self, request: &RegisterRequest) -> Result<(), IdentityError> {
        request.validate()?;
        let url = self.endpoint(&["api", "users", "register"])?;
        let timeout = self.timeout();
        let status = tokio::time::timeout(timeout, self.post_registration(url, request))
            .await
            .map_err(|_| IdentityError::Timeout(timeout))??;

        info!(stage = "identity", status = status.as_u16(), "user registration forwarded");
        Ok(())
    }

    async fn post_registration(
        &self,
        url: Url,
        request: &RegisterRequest,
    ) -> Result<StatusCode, IdentityError> {
        let response = self.http().post(url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| String::from("<unavailable>"));
            return Err(IdentityError::Status { status, body });
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use reqwest::Client;
    use serde_json::json;
    use std::time::Duration;

    fn request() -> RegisterRequest {
        RegisterRequest {
            email: "ada@example.com".to_string(),
            password: "secret1".to_string(),
            first_name: Some("Ada".to_string()),
            last_name: None,
            keycloak_id: None,
        }
    }

    fn client(base_url: &Url) -> IdentityClient {
        IdentityClient::new(base_url.clone(), Duration::from_secs(2), Client::builder)
            .expect("identity client")
    }

    #[test]
    fn validate_applies_field_constraints() {
        assert_eq!(request().validate(), Ok(()));

        let mut missing = request();
        missing.email = " ".to_string();
        assert_eq!(missing.validate(), Err(RegisterRequestError::MissingEmail));

        let mut malformed = request();
        malformed.email = "ada.example.com".to_string();
        assert_eq!(malformed.validate(), Err(RegisterRequestError::InvalidEmail));

        let mut short = request();
        short.password = "12345".to_string();
        assert_eq!(short.validate(), Err(RegisterRequestError::PasswordTooShort));
    }

    #[tokio::test]
    async fn register_posts_camel_case_json() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/users/register")
                    .json_body(json!({
                        "email": "ada@example.com",
                        "password": "secret1",
                        "firstName": "Ada"
                    }));
                then.status(201);
            })
            .await;

        client(&base)
            .register_user(&request())
            .await
            .expect("register");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn register_propagates_error_status() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/users/register");
                then.status(409).body("email already registered");
            })
            .await;

        let err = client(&base)
            .register_user(&request())
            .await
            .expect_err("should error");
        match err {
            IdentityError::Status { status, body } => {
                assert_eq!(status, StatusCode::CONFLICT);
                assert_eq!(body, "email already registered");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalid_request_is_rejected_before_sending() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");
        let mock = server
            .mock_async(|when, then| {
                when.any_request();
                then.status(201);
            })
            .await;

        let mut short = request();
        short.password = "123".to_string();
        let err = client(&base)
            .register_user(&short)
            .await
            .expect_err("should reject");
        assert!(matches!(
            err,
            IdentityError::InvalidRegistration(RegisterRequestError::PasswordTooShort)
        ));
        mock.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn stalled_service_hits_client_timeout() {
        let server = MockServer::start_async().await;
        let base = Url::parse(&server.url("/")).expect("url");
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/users/register");
                then.status(201).delay(Duration::from_secs(3));
            })
            .await;

        let client = IdentityClient::new(base, Duration::from_millis(100), Client::builder)
            .expect("identity client");
        let started = std::time::Instant::now();
        let err = client
            .register_user(&request())
            .await
            .expect_err("should time out");
        assert!(matches!(err, IdentityError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
