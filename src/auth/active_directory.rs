//! Active Directory authentication.
//!
//! AD reports why a bind failed through a hexadecimal sub-code inside the
//! diagnostic message of result code 49, e.g.
//! `80090308: LdapErr: DSID-0C09042A, comment: AcceptSecurityContext error, data 532, v3839`.

use std::sync::LazyLock;

use regex_lite::Regex;

use super::authenticator::{AuthStage, Outcome, Rejection};
use super::{Credentials, DirectoryPrincipal, FailureKind};
use crate::error::{BindError, ConfigError, SearchError};
use crate::ldap::filter::{build_filter, validate_template};
use crate::ldap::{
    DirectoryConnection, DirectoryEntry, Scope, SearchRequest, domain_to_dn,
};

/// `{0}` is the user principal name, `{1}` the username as typed.
pub const DEFAULT_SEARCH_FILTER: &str = "(&(objectClass=user)(userPrincipalName={0}))";

static SUB_ERROR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"data\s([0-9a-fA-F]{3,4})").unwrap());

/// Extract the AD sub-error code from a bind diagnostic.
pub fn sub_error_code(diagnostic: &str) -> Option<String> {
    SUB_ERROR_RE
        .captures(diagnostic)
        .and_then(|captures| captures.get(1))
        .map(|code| code.as_str().to_ascii_lowercase())
}

/// Map a rejected bind to a failure kind.
pub fn translate_bind_failure(diagnostic: &str, convert_sub_error_codes: bool) -> Rejection {
    let Some(code) = sub_error_code(diagnostic) else {
        return Rejection::new(FailureKind::InvalidCredentials, diagnostic);
    };
    if !convert_sub_error_codes {
        return Rejection::new(
            FailureKind::InvalidCredentials,
            format!("AD sub-error {code}"),
        );
    }

    let (reason, detail) = match code.as_str() {
        "525" => (FailureKind::UserNotFound, "user not found"),
        "52e" => (FailureKind::InvalidCredentials, "invalid password"),
        "530" => (FailureKind::InvalidCredentials, "logon not permitted at this time"),
        "531" => (FailureKind::InvalidCredentials, "logon not permitted from this workstation"),
        "532" => (FailureKind::PasswordExpired, "password expired"),
        "533" => (FailureKind::AccountDisabled, "account disabled"),
        "701" => (FailureKind::AccountExpired, "account expired"),
        "773" => (FailureKind::PasswordMustChange, "password must be reset"),
        "775" => (FailureKind::AccountLocked, "account locked out"),
        _ => {
            return Rejection::new(
                FailureKind::InvalidCredentials,
                format!("unknown AD sub-error {code}"),
            );
        },
    };
    Rejection::new(reason, format!("AD sub-error {code}: {detail}"))
}

/// Settings of [`ActiveDirectoryAuthenticator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveDirectorySettings {
    pub domain: Option<String>,
    /// Defaults to the DN built from `domain`.
    pub root_dn: Option<String>,
    pub search_filter: String,
    pub convert_sub_error_codes: bool,
}

impl Default for ActiveDirectorySettings {
    fn default() -> Self {
        Self {
            domain: None,
            root_dn: None,
            search_filter: DEFAULT_SEARCH_FILTER.into(),
            convert_sub_error_codes: true,
        }
    }
}

pub struct ActiveDirectoryAuthenticator {
    connection: DirectoryConnection,
    domain: Option<String>,
    root_dn: String,
    search_filter: String,
    convert_sub_error_codes: bool,
}

impl ActiveDirectoryAuthenticator {
    /// Create a new [`ActiveDirectoryAuthenticator`].
    pub fn new(
        connection: DirectoryConnection,
        settings: ActiveDirectorySettings,
    ) -> Result<Self, ConfigError> {
        let domain = settings
            .domain
            .map(|d| d.trim().to_lowercase())
            .filter(|d| !d.is_empty());

        let root_dn = settings
            .root_dn
            .filter(|dn| !dn.trim().is_empty())
            .or_else(|| domain.as_deref().map(domain_to_dn))
            .unwrap_or_else(|| connection.endpoint().base.clone());
        if root_dn.is_empty() {
            return Err(ConfigError::Missing("ldap.active_directory.root_dn"));
        }

        validate_template(&settings.search_filter, 2).map_err(|err| {
            ConfigError::InvalidFilter {
                template: settings.search_filter.clone(),
                reason: err.to_string(),
            }
        })?;

        Ok(Self {
            connection,
            domain,
            root_dn,
            search_filter: settings.search_filter,
            convert_sub_error_codes: settings.convert_sub_error_codes,
        })
    }

    /// `user@domain`, unless the username already carries the domain.
    pub fn principal_name(&self, username: &str) -> String {
        match &self.domain {
            Some(domain) if !username.to_lowercase().ends_with(&format!("@{domain}")) => {
                format!("{username}@{domain}")
            },
            _ => username.to_owned(),
        }
    }

    fn search_request(&self, username: &str) -> SearchRequest {
        let upn = self.principal_name(username);
        SearchRequest {
            base: self.root_dn.clone(),
            scope: Scope::Subtree,
            filter: build_filter(&self.search_filter, &[&upn, username]),
            attributes: Vec::new(),
            time_limit: std::time::Duration::ZERO,
            deref_aliases: false,
        }
    }

    /// Search with the service account (or anonymously) before binding.
    fn searches_first(&self) -> bool {
        let endpoint = self.connection.endpoint();
        endpoint.user_dn.is_some() || endpoint.anonymous_read_only
    }

    pub async fn authenticate(&self, credentials: &Credentials) -> Outcome {
        if self.searches_first() {
            self.search_then_bind(credentials).await
        } else {
            self.bind_then_search(credentials).await
        }
    }

    async fn search_then_bind(&self, credentials: &Credentials) -> Outcome {
        let username = credentials.username();
        let request = self.search_request(username);

        let entry = match self.connection.search(&request).await {
            Ok(entries) => match single_entry(username, entries) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    return Outcome::Rejected(Rejection::new(
                        FailureKind::UserNotFound,
                        format!("no AD entry for `{username}`"),
                    ));
                },
                Err(err) => return errored(AuthStage::Searching, err),
            },
            Err(err) => return errored(AuthStage::Searching, err),
        };

        match self.connection.bind(&entry.dn, credentials.secret()).await {
            Ok(mut conn) => {
                conn.unbind().await;
                match DirectoryPrincipal::new(username, entry) {
                    Ok(principal) => Outcome::Authenticated(principal),
                    Err(err) => errored(AuthStage::Binding, err),
                }
            },
            Err(err) => self.bind_failed(err),
        }
    }

    async fn bind_then_search(&self, credentials: &Credentials) -> Outcome {
        let username = credentials.username();
        let upn = self.principal_name(username);

        let mut conn = match self.connection.bind(&upn, credentials.secret()).await {
            Ok(conn) => conn,
            Err(err) => return self.bind_failed(err),
        };

        let request = self.search_request(username);
        let entries = self.connection.search_on(conn.as_mut(), &request).await;
        conn.unbind().await;

        match entries.and_then(|entries| single_entry(username, entries)) {
            Ok(Some(entry)) => match DirectoryPrincipal::new(username, entry) {
                Ok(principal) => Outcome::Authenticated(principal),
                Err(err) => errored(AuthStage::Searching, err),
            },
            Ok(None) => Outcome::Rejected(Rejection::new(
                FailureKind::UserNotFound,
                format!("`{upn}` bound but no entry matched under {}", self.root_dn),
            )),
            Err(err) => errored(AuthStage::Searching, err),
        }
    }

    fn bind_failed(&self, err: BindError) -> Outcome {
        match err {
            BindError::InvalidCredentials { diagnostic } => Outcome::Rejected(
                translate_bind_failure(&diagnostic, self.convert_sub_error_codes),
            ),
            BindError::EmptyPassword => Outcome::Rejected(Rejection::new(
                FailureKind::EmptyCredentials,
                "empty password",
            )),
            err => errored(AuthStage::Binding, err),
        }
    }
}

fn single_entry(
    username: &str,
    mut entries: Vec<DirectoryEntry>,
) -> Result<Option<DirectoryEntry>, SearchError> {
    match entries.len() {
        0 => Ok(None),
        1 => Ok(entries.pop()),
        matches => Err(SearchError::AmbiguousPrincipal {
            username: username.to_owned(),
            matches,
        }),
    }
}

fn errored(stage: AuthStage, err: impl Into<crate::error::DirectoryError>) -> Outcome {
    Outcome::Errored(super::authenticator::Fault::new(stage, err))
}
