//! Error handler for dirauth.
//!
//! Directory errors are split by the layer that raises them. Configuration
//! errors are fatal at startup, connection/bind/search errors are runtime
//! faults that the authenticator classifies into rejections or
//! infrastructure errors.

use axum::extract::rejection::JsonRejection;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::ldap::DirectoryEntry;

/// Errors detected while reading or validating configuration.
///
/// None of them can happen once the engine is built.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing `{0}` entry on configuration")]
    Missing(&'static str),

    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("invalid directory URL `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("unparseable filter template `{template}`: {reason}")]
    InvalidFilter { template: String, reason: String },

    #[error("DN pattern `{0}` must contain the `{{0}}` placeholder")]
    InvalidDnPattern(String),

    #[error(
        "neither DN patterns nor a user search are configured, no way to authenticate"
    )]
    NoAuthenticationStrategy,

    #[error("service account `{0}` has an empty password")]
    EmptyServicePassword(String),

    #[error("cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Failure to obtain a usable connection.
#[derive(Debug, Clone, Error)]
pub enum ConnectError {
    #[error("directory server unreachable: {0}")]
    Unreachable(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("service account credentials rejected: {0}")]
    InvalidCredentials(String),

    #[error("connection attempt timed out")]
    Timeout,
}

/// Failure of a bind operation.
#[derive(Debug, Clone, Error)]
pub enum BindError {
    /// Result code 49. The diagnostic text carries vendor sub-codes.
    #[error("invalid credentials: {diagnostic}")]
    InvalidCredentials { diagnostic: String },

    #[error("refusing to bind with an empty password")]
    EmptyPassword,

    #[error("bind timed out")]
    Timeout,

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("bind failed with result code {code}: {message}")]
    Protocol { code: u32, message: String },
}

/// Failure of a search operation.
#[derive(Debug, Clone, Error)]
pub enum SearchError {
    #[error("search timed out")]
    Timeout,

    /// The server stopped early. `collected` holds what was received.
    #[error("search returned partial results ({} entries)", .collected.len())]
    PartialResults { collected: Vec<DirectoryEntry> },

    #[error("malformed search: {0}")]
    Malformed(String),

    #[error("search returned referrals: {}", .urls.join(", "))]
    Referral { urls: Vec<String> },

    #[error("{matches} entries match `{username}`, expected at most one")]
    AmbiguousPrincipal { username: String, matches: usize },

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("search failed with result code {code}: {message}")]
    Protocol { code: u32, message: String },
}

/// Any runtime directory fault.
#[derive(Debug, Clone, Error)]
pub enum DirectoryError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Search(#[from] SearchError),
}

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Axum(#[from] JsonRejection),
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
    errors: Option<Vec<FieldError>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Update `type` field.
    pub fn kind(mut self, kind: &str) -> Self {
        self.r#type = Some(kind.into());
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(
        self,
    ) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/problem+json")
                .body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
            errors: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue.to_string(),
            })
        })
        .collect()
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let response = ResponseError::default()
            .title("There were validation errors with your request.")
            .details(&self.to_string())
            .status(StatusCode::BAD_REQUEST);

        let response = match &self {
            ServerError::Validation(validation_errors) => {
                response.errors(validation_errors)
            },

            ServerError::Axum(rejection) => {
                response.title("Invalid request body.").status(rejection.status())
            },
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/problem+json")
        .body(
            serde_json::json!({
                "type": null,
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "instance": null,
                "errors": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}
