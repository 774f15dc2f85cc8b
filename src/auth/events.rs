//! Authentication events.

use super::FailureKind;

/// What happened during one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    Attempted {
        username: String,
        authenticator: &'static str,
    },
    Succeeded {
        username: String,
        dn: String,
        authorities: usize,
    },
    Failed {
        username: String,
        kind: FailureKind,
        detail: String,
    },
}

/// Sink for [`AuthEvent`]s. Publishing never fails and never blocks.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: AuthEvent);
}

/// Logs events and counts them.
#[derive(Debug, Default)]
pub struct TracingEventPublisher;

impl TracingEventPublisher {
    /// Create a new [`TracingEventPublisher`].
    pub fn new() -> Self {
        Self
    }
}

impl EventPublisher for TracingEventPublisher {
    fn publish(&self, event: AuthEvent) {
        match event {
            AuthEvent::Attempted {
                username,
                authenticator,
            } => {
                tracing::debug!(%username, authenticator, "authentication attempted");
                metrics::counter!("auth_attempts_total", "authenticator" => authenticator)
                    .increment(1);
            },
            AuthEvent::Succeeded {
                username,
                dn,
                authorities,
            } => {
                tracing::info!(%username, %dn, authorities, "authentication successful");
                metrics::counter!("auth_success_total").increment(1);
            },
            AuthEvent::Failed {
                username,
                kind,
                detail,
            } => {
                let retryable = if kind.is_retryable() { "true" } else { "false" };
                if kind.is_retryable() {
                    tracing::warn!(%username, kind = kind.as_str(), %detail, "authentication errored");
                } else {
                    tracing::info!(%username, kind = kind.as_str(), %detail, "authentication failed");
                }
                metrics::counter!(
                    "auth_failures_total",
                    "kind" => kind.as_str(),
                    "retryable" => retryable
                )
                .increment(1);
            },
        }
    }
}
