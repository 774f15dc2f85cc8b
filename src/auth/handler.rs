//! Collaborators invoked by the login route after a decision.

use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use super::{AuthFailure, AuthSuccess, FailureKind, GrantedAuthority};
use crate::error::ResponseError;

/// Renders a successful login.
pub trait SuccessHandler: Send + Sync {
    fn on_success(&self, success: &AuthSuccess) -> Response;
}

/// Renders a failed login.
pub trait FailureHandler: Send + Sync {
    fn on_failure(&self, failure: &AuthFailure) -> Response;
}

/// Session bookkeeping after a successful login.
pub trait SessionStrategy: Send + Sync {
    fn on_authentication(&self, success: &AuthSuccess);
}

/// Persistent login support.
pub trait RememberMeServices: Send + Sync {
    fn login_success(&self, success: &AuthSuccess);
    fn login_fail(&self);
}

/// Everything the login route calls once the engine has decided.
#[derive(Clone)]
pub struct LoginHandlers {
    pub success: Arc<dyn SuccessHandler>,
    pub failure: Arc<dyn FailureHandler>,
    pub session: Arc<dyn SessionStrategy>,
    pub remember_me: Arc<dyn RememberMeServices>,
}

impl Default for LoginHandlers {
    fn default() -> Self {
        Self {
            success: Arc::new(JsonSuccessHandler),
            failure: Arc::new(JsonFailureHandler),
            session: Arc::new(NullSessionStrategy),
            remember_me: Arc::new(NullRememberMeServices),
        }
    }
}

#[derive(Debug, PartialEq, Serialize)]
pub struct LoginResponse<'a> {
    pub username: &'a str,
    pub dn: &'a str,
    pub authorities: Vec<&'a GrantedAuthority>,
}

/// `200 OK` with the principal and its authorities as JSON.
#[derive(Debug, Default)]
pub struct JsonSuccessHandler;

impl SuccessHandler for JsonSuccessHandler {
    fn on_success(&self, success: &AuthSuccess) -> Response {
        let body = LoginResponse {
            username: success.principal.username(),
            dn: success.principal.dn(),
            authorities: success.authorities.iter().collect(),
        };
        (StatusCode::OK, Json(body)).into_response()
    }
}

/// Problem JSON with the fixed message of the failure kind.
#[derive(Debug, Default)]
pub struct JsonFailureHandler;

impl JsonFailureHandler {
    pub fn status(kind: FailureKind) -> StatusCode {
        match kind {
            FailureKind::Infrastructure => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

impl FailureHandler for JsonFailureHandler {
    fn on_failure(&self, failure: &AuthFailure) -> Response {
        ResponseError::default()
            .status(Self::status(failure.kind))
            .title("Authentication failed.")
            .kind(failure.kind.as_str())
            .details(failure.kind.message())
            .into_response()
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// Keeps no session.
#[derive(Debug, Default)]
pub struct NullSessionStrategy;

impl SessionStrategy for NullSessionStrategy {
    fn on_authentication(&self, _success: &AuthSuccess) {}
}

/// Never remembers anyone.
#[derive(Debug, Default)]
pub struct NullRememberMeServices;

impl RememberMeServices for NullRememberMeServices {
    fn login_success(&self, _success: &AuthSuccess) {}
    fn login_fail(&self) {}
}
