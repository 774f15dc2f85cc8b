//! The decision procedure.

use std::sync::Arc;

use super::authenticator::{Authenticator, Fault, Outcome, Rejection};
use super::authorities::{AuthoritiesMapper, AuthoritiesPopulator, IdentityMapper};
use super::events::{AuthEvent, EventPublisher, TracingEventPublisher};
use super::{AuthFailure, AuthResult, AuthSuccess, Credentials, FailureKind};

/// Turns credentials into an [`AuthResult`]. Never fails.
pub struct AuthenticationDecisionEngine {
    authenticator: Authenticator,
    populator: AuthoritiesPopulator,
    mapper: Arc<dyn AuthoritiesMapper>,
    events: Arc<dyn EventPublisher>,
    hide_user_not_found: bool,
}

impl AuthenticationDecisionEngine {
    /// Create a new engine with the identity mapper and tracing events.
    pub fn new(authenticator: Authenticator, populator: AuthoritiesPopulator) -> Self {
        Self {
            authenticator,
            populator,
            mapper: Arc::new(IdentityMapper),
            events: Arc::new(TracingEventPublisher::new()),
            hide_user_not_found: true,
        }
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn AuthoritiesMapper>) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    /// Report unknown users as such instead of as invalid credentials.
    pub fn hide_user_not_found(mut self, hide: bool) -> Self {
        self.hide_user_not_found = hide;
        self
    }

    pub async fn authenticate(&self, credentials: Credentials) -> AuthResult {
        let username = credentials.username().to_owned();
        self.events.publish(AuthEvent::Attempted {
            username: username.clone(),
            authenticator: self.authenticator.name(),
        });

        let result = self.decide(&credentials).await;
        drop(credentials);

        match &result {
            AuthResult::Success(success) => self.events.publish(AuthEvent::Succeeded {
                username,
                dn: success.principal.dn().to_owned(),
                authorities: success.authorities.len(),
            }),
            AuthResult::Failure(failure) => self.events.publish(AuthEvent::Failed {
                username,
                kind: failure.kind,
                detail: failure.detail.clone(),
            }),
        }
        result
    }

    async fn decide(&self, credentials: &Credentials) -> AuthResult {
        if credentials.is_blank() {
            return failure(FailureKind::EmptyCredentials, "blank username or password");
        }

        let principal = match self.authenticator.authenticate(credentials).await {
            Outcome::Authenticated(principal) => principal,
            Outcome::Rejected(Rejection { reason, detail }) => {
                let kind = match reason {
                    FailureKind::UserNotFound if self.hide_user_not_found => {
                        FailureKind::InvalidCredentials
                    },
                    kind => kind,
                };
                return failure(kind, detail);
            },
            Outcome::Errored(Fault { stage, source }) => {
                tracing::error!(stage = stage.as_str(), err = %source, "directory fault during authentication");
                return failure(
                    FailureKind::Infrastructure,
                    format!("{} failed: {source}", stage.as_str()),
                );
            },
        };

        let authorities = match self.populator.resolve(&principal, credentials).await {
            Ok(authorities) => authorities,
            Err(err) => {
                tracing::error!(dn = principal.dn(), %err, "cannot resolve authorities");
                return failure(
                    FailureKind::Infrastructure,
                    format!("authorities lookup failed: {err}"),
                );
            },
        };

        AuthResult::Success(AuthSuccess {
            authorities: self.mapper.map(authorities),
            principal,
        })
    }
}

fn failure(kind: FailureKind, detail: impl Into<String>) -> AuthResult {
    AuthResult::Failure(AuthFailure::new(kind, detail))
}
