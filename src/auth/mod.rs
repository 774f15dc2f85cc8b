//! Authentication decision.
//!
//! An [`authenticator::Authenticator`] proves the credentials against the
//! directory, an [`authorities::AuthoritiesPopulator`] resolves the granted
//! authorities, and the [`engine::AuthenticationDecisionEngine`] folds both
//! into an [`AuthResult`].

pub mod active_directory;
pub mod authenticator;
pub mod authorities;
pub mod engine;
pub mod events;
pub mod handler;

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::Serialize;
use zeroize::Zeroizing;

use crate::error::SearchError;
use crate::ldap::DirectoryEntry;

/// Username and secret of one login attempt.
///
/// The secret is wiped from memory on drop and never printed.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    secret: Zeroizing<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: Zeroizing::new(secret.into()),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Whether either part is missing. A whitespace-only secret is blank.
    pub fn is_blank(&self) -> bool {
        self.username.trim().is_empty() || self.secret.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"***")
            .finish()
    }
}

/// A role or group identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct GrantedAuthority(String);

impl GrantedAuthority {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GrantedAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A user entry resolved in the directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryPrincipal {
    dn: String,
    username: String,
    attributes: HashMap<String, Vec<String>>,
}

impl DirectoryPrincipal {
    /// Build a principal from the entry found for `username`.
    ///
    /// Fails on an entry without DN.
    pub fn new(
        username: impl Into<String>,
        entry: DirectoryEntry,
    ) -> Result<Self, SearchError> {
        if entry.dn.trim().is_empty() {
            return Err(SearchError::Malformed("entry without DN".into()));
        }

        Ok(Self {
            dn: entry.dn,
            username: username.into(),
            attributes: entry.attributes,
        })
    }

    pub fn dn(&self) -> &str {
        &self.dn
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn attributes(&self) -> &HashMap<String, Vec<String>> {
        &self.attributes
    }

    /// Values of one attribute, matched case-insensitively.
    pub fn attribute(&self, name: &str) -> &[String] {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or_default()
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    EmptyCredentials,
    InvalidCredentials,
    UserNotFound,
    AccountExpired,
    AccountLocked,
    AccountDisabled,
    PasswordExpired,
    PasswordMustChange,
    Infrastructure,
}

impl FailureKind {
    /// Fixed message, safe to show to the caller.
    pub fn message(self) -> &'static str {
        match self {
            Self::EmptyCredentials => "Username and password are required.",
            Self::InvalidCredentials => "Invalid username or password.",
            Self::UserNotFound => "User not found.",
            Self::AccountExpired => "Account has expired.",
            Self::AccountLocked => "Account is locked.",
            Self::AccountDisabled => "Account is disabled.",
            Self::PasswordExpired => "Password has expired.",
            Self::PasswordMustChange => "Password must be changed.",
            Self::Infrastructure => {
                "Authentication service unavailable, try again later."
            },
        }
    }

    /// Only infrastructure faults are worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Infrastructure)
    }

    /// Label value for logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmptyCredentials => "empty_credentials",
            Self::InvalidCredentials => "invalid_credentials",
            Self::UserNotFound => "user_not_found",
            Self::AccountExpired => "account_expired",
            Self::AccountLocked => "account_locked",
            Self::AccountDisabled => "account_disabled",
            Self::PasswordExpired => "password_expired",
            Self::PasswordMustChange => "password_must_change",
            Self::Infrastructure => "infrastructure",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthSuccess {
    pub principal: DirectoryPrincipal,
    pub authorities: BTreeSet<GrantedAuthority>,
}

/// `detail` is for logs only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl AuthFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Final decision on one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Success(AuthSuccess),
    Failure(AuthFailure),
}

impl AuthResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Success(_) => None,
            Self::Failure(failure) => Some(failure.kind),
        }
    }
}
