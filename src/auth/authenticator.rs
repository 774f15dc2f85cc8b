//! Credential verification against the directory.
//!
//! Every attempt moves `Idle -> Searching -> Binding` and ends in one of
//! [`Outcome`]'s three states. Steps that are not needed are skipped (a DN
//! pattern bind never searches).

use super::active_directory::ActiveDirectoryAuthenticator;
use super::{Credentials, DirectoryPrincipal, FailureKind};
use crate::error::{BindError, ConfigError, DirectoryError, SearchError};
use crate::ldap::filter::{escape_dn_value, format_template};
use crate::ldap::{
    DirectoryConn, DirectoryConnection, DirectoryEntry, DirectoryUserSearch, Scope,
    SearchRequest, join_dn,
};

/// Where an attempt stood when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStage {
    Idle,
    Searching,
    Binding,
}

impl AuthStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Searching => "searching",
            Self::Binding => "binding",
        }
    }
}

/// Expected failure: the credentials are not good enough.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: FailureKind,
    pub detail: String,
}

impl Rejection {
    pub fn new(reason: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// Infrastructure failure.
#[derive(Debug, Clone)]
pub struct Fault {
    pub stage: AuthStage,
    pub source: DirectoryError,
}

impl Fault {
    pub fn new(stage: AuthStage, source: impl Into<DirectoryError>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Outcome {
    Authenticated(DirectoryPrincipal),
    Rejected(Rejection),
    Errored(Fault),
}

impl Outcome {
    fn rejected(reason: FailureKind, detail: impl Into<String>) -> Self {
        Self::Rejected(Rejection::new(reason, detail))
    }

    fn errored(stage: AuthStage, source: impl Into<DirectoryError>) -> Self {
        Self::Errored(Fault::new(stage, source))
    }
}

/// Closed set of authentication strategies.
pub enum Authenticator {
    Bind(BindAuthenticator),
    ActiveDirectory(ActiveDirectoryAuthenticator),
}

impl Authenticator {
    pub async fn authenticate(&self, credentials: &Credentials) -> Outcome {
        match self {
            Self::Bind(authenticator) => authenticator.authenticate(credentials).await,
            Self::ActiveDirectory(authenticator) => {
                authenticator.authenticate(credentials).await
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Bind(_) => "bind",
            Self::ActiveDirectory(_) => "active_directory",
        }
    }
}

/// Bind with DN patterns, then fall back to search-then-bind.
pub struct BindAuthenticator {
    connection: DirectoryConnection,
    dn_patterns: Vec<String>,
    user_search: Option<DirectoryUserSearch>,
}

impl BindAuthenticator {
    /// Create a new [`BindAuthenticator`].
    ///
    /// Patterns are relative to the endpoint base and must contain `{0}`.
    pub fn new(
        connection: DirectoryConnection,
        dn_patterns: Vec<String>,
        user_search: Option<DirectoryUserSearch>,
    ) -> Result<Self, ConfigError> {
        if dn_patterns.is_empty() && user_search.is_none() {
            return Err(ConfigError::NoAuthenticationStrategy);
        }
        if let Some(pattern) = dn_patterns.iter().find(|p| !p.contains("{0}")) {
            return Err(ConfigError::InvalidDnPattern(pattern.clone()));
        }

        Ok(Self {
            connection,
            dn_patterns,
            user_search,
        })
    }

    /// Absolute DNs to try for `username`, in order.
    pub fn candidate_dns(&self, username: &str) -> Vec<String> {
        let escaped = escape_dn_value(username);
        self.dn_patterns
            .iter()
            .map(|pattern| {
                join_dn(
                    &format_template(pattern, &[&escaped]),
                    &self.connection.endpoint().base,
                )
            })
            .collect()
    }

    pub async fn authenticate(&self, credentials: &Credentials) -> Outcome {
        let username = credentials.username();

        for dn in self.candidate_dns(username) {
            tracing::trace!(stage = AuthStage::Binding.as_str(), %dn, "trying DN pattern");
            match bind_and_read(&self.connection, &dn, username, credentials).await {
                Ok(principal) => return Outcome::Authenticated(principal),
                Err(BindFailure::Rejected(diagnostic)) => {
                    tracing::debug!(%dn, %diagnostic, "DN pattern bind rejected");
                },
                Err(BindFailure::Fault(fault)) => return Outcome::Errored(fault),
            }
        }

        let Some(search) = &self.user_search else {
            return Outcome::rejected(
                FailureKind::InvalidCredentials,
                format!("no DN pattern accepted `{username}`"),
            );
        };

        tracing::trace!(stage = AuthStage::Searching.as_str(), "falling back to user search");
        let principal = match search.find(username).await {
            Ok(Some(principal)) => principal,
            Ok(None) => {
                return Outcome::rejected(
                    FailureKind::UserNotFound,
                    format!("no entry for `{username}`"),
                );
            },
            Err(err) => return Outcome::errored(AuthStage::Searching, err),
        };

        match bind_and_read(&self.connection, principal.dn(), username, credentials).await {
            // The entry read after bind may be restricted; the searched one wins then.
            Ok(bound) if bound.attributes().is_empty() => Outcome::Authenticated(principal),
            Ok(bound) => Outcome::Authenticated(bound),
            Err(BindFailure::Rejected(diagnostic)) => Outcome::rejected(
                FailureKind::InvalidCredentials,
                format!("bind as `{}` rejected: {diagnostic}", principal.dn()),
            ),
            Err(BindFailure::Fault(fault)) => Outcome::Errored(fault),
        }
    }
}

/// Failure of [`bind_and_read`].
pub(crate) enum BindFailure {
    /// Result code 49, with the server diagnostic.
    Rejected(String),
    Fault(Fault),
}

/// Bind as `dn` then read the entry with the user's own rights.
pub(crate) async fn bind_and_read(
    connection: &DirectoryConnection,
    dn: &str,
    username: &str,
    credentials: &Credentials,
) -> Result<DirectoryPrincipal, BindFailure> {
    let mut conn = match connection.bind(dn, credentials.secret()).await {
        Ok(conn) => conn,
        Err(BindError::InvalidCredentials { diagnostic }) => {
            return Err(BindFailure::Rejected(diagnostic));
        },
        Err(BindError::EmptyPassword) => {
            return Err(BindFailure::Rejected("empty password".into()));
        },
        Err(err) => return Err(BindFailure::Fault(Fault::new(AuthStage::Binding, err))),
    };

    let entry = read_entry(connection, conn.as_mut(), dn).await;
    conn.unbind().await;

    let entry = entry.map_err(|err| BindFailure::Fault(Fault::new(AuthStage::Binding, err)))?;
    DirectoryPrincipal::new(username, entry)
        .map_err(|err| BindFailure::Fault(Fault::new(AuthStage::Binding, err)))
}

async fn read_entry(
    connection: &DirectoryConnection,
    conn: &mut dyn DirectoryConn,
    dn: &str,
) -> Result<DirectoryEntry, SearchError> {
    let request = SearchRequest {
        base: dn.to_owned(),
        scope: Scope::Base,
        filter: "(objectClass=*)".into(),
        attributes: Vec::new(),
        time_limit: std::time::Duration::ZERO,
        deref_aliases: false,
    };

    let entry = connection
        .search_on(conn, &request)
        .await?
        .into_iter()
        .next()
        .unwrap_or_else(|| DirectoryEntry::new(dn));
    Ok(entry)
}
