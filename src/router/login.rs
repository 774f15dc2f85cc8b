//! Login processing endpoint.

use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;
use validator::Validate;

use crate::AppState;
use crate::auth::{AuthResult, Credentials};
use crate::router::Valid;

/// Missing fields are read as empty strings and rejected by the engine.
#[derive(Deserialize, Validate)]
pub struct Body {
    #[serde(default, alias = "user", alias = "j_username")]
    #[validate(length(max = 256, message = "Username is too long."))]
    pub username: String,
    #[serde(default, alias = "pass", alias = "j_password")]
    #[validate(length(max = 1024, message = "Password is too long."))]
    pub password: String,
    #[serde(default, alias = "remember-me", alias = "rememberMe")]
    pub remember_me: bool,
}

/// Handler to authenticate a user against the directory.
pub async fn handler(State(state): State<AppState>, Valid(body): Valid<Body>) -> Response {
    let credentials = Credentials::new(body.username, body.password);

    match state.engine.authenticate(credentials).await {
        AuthResult::Success(success) => {
            state.handlers.session.on_authentication(&success);
            if body.remember_me {
                state.handlers.remember_me.login_success(&success);
            }
            state.handlers.success.on_success(&success)
        },
        AuthResult::Failure(failure) => {
            state.handlers.remember_me.login_fail();
            state.handlers.failure.on_failure(&failure)
        },
    }
}
