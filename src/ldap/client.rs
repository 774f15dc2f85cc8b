//! `ldap3` wire adapter.

use std::time::Duration;

use async_trait::async_trait;
use ldap3::{
    DerefAliases, Ldap, LdapConnAsync, LdapConnSettings, LdapError, LdapResult,
    ResultEntry, SearchEntry, SearchOptions,
};

use super::connection::{ConnectSettings, Connector, DirectoryConn, SearchOutcome, SearchRequest};
use super::DirectoryEntry;
use crate::error::{BindError, ConnectError, SearchError};

const RC_SUCCESS: u32 = 0;
const RC_TIME_LIMIT_EXCEEDED: u32 = 3;
const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
const RC_PARTIAL_RESULTS: u32 = 9;
const RC_REFERRAL: u32 = 10;
const RC_INVALID_CREDENTIALS: u32 = 49;

/// Opens real connections with `ldap3`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ldap3Connector;

#[async_trait]
impl Connector for Ldap3Connector {
    async fn open(
        &self,
        url: &str,
        settings: &ConnectSettings,
    ) -> Result<Box<dyn DirectoryConn>, ConnectError> {
        let ldap_settings = LdapConnSettings::new()
            .set_conn_timeout(settings.connect_timeout)
            .set_starttls(settings.starttls)
            .set_no_tls_verify(settings.no_tls_verify);

        let (conn, ldap) = LdapConnAsync::with_settings(ldap_settings, url)
            .await
            .map_err(connect_error)?;
        ldap3::drive!(conn);

        tracing::trace!(%url, "directory connection opened");
        Ok(Box::new(Ldap3Conn { ldap }))
    }
}

/// One `ldap3` connection.
pub struct Ldap3Conn {
    ldap: Ldap,
}

#[async_trait]
impl DirectoryConn for Ldap3Conn {
    async fn simple_bind(
        &mut self,
        dn: &str,
        password: &str,
    ) -> Result<(), BindError> {
        let result = self
            .ldap
            .simple_bind(dn, password)
            .await
            .map_err(|err| BindError::Connect(connect_error(err)))?;
        classify_bind(result)
    }

    async fn search(
        &mut self,
        request: &SearchRequest,
    ) -> Result<SearchOutcome, SearchError> {
        let deref = if request.deref_aliases {
            DerefAliases::Always
        } else {
            DerefAliases::Never
        };
        let timelimit = time_limit_secs(request.time_limit);
        let attributes: Vec<&str> = if request.attributes.is_empty() {
            vec!["*"]
        } else {
            request.attributes.iter().map(String::as_str).collect()
        };

        let result = self
            .ldap
            .with_search_options(SearchOptions::new().deref(deref).timelimit(timelimit))
            .search(&request.base, request.scope.to_ldap3(), &request.filter, attributes)
            .await
            .map_err(search_transport_error)?;

        classify_search(result.0, result.1)
    }

    async fn unbind(&mut self) {
        if let Err(err) = self.ldap.unbind().await {
            tracing::debug!(%err, "unbind failed");
        }
    }

    fn is_closed(&mut self) -> bool {
        self.ldap.is_closed()
    }
}

/// Server-side limit in whole seconds, rounded up so that a sub-second
/// limit does not become `0` (unlimited).
fn time_limit_secs(limit: Duration) -> i32 {
    let secs = limit.as_secs() + u64::from(limit.subsec_nanos() > 0);
    i32::try_from(secs).unwrap_or(i32::MAX)
}

fn connect_error(err: LdapError) -> ConnectError {
    match err {
        LdapError::Timeout { .. } => ConnectError::Timeout,
        LdapError::Io { source } => ConnectError::Unreachable(source.to_string()),
        LdapError::NativeTLS { source } => ConnectError::TlsHandshake(source.to_string()),
        other => ConnectError::Unreachable(other.to_string()),
    }
}

fn search_transport_error(err: LdapError) -> SearchError {
    match err {
        LdapError::Timeout { .. } => SearchError::Timeout,
        LdapError::FilterParsing => SearchError::Malformed("unparseable filter".into()),
        other => SearchError::Connect(connect_error(other)),
    }
}

fn classify_bind(result: LdapResult) -> Result<(), BindError> {
    match result.rc {
        RC_SUCCESS => Ok(()),
        RC_INVALID_CREDENTIALS => Err(BindError::InvalidCredentials {
            diagnostic: result.text,
        }),
        RC_TIME_LIMIT_EXCEEDED => Err(BindError::Timeout),
        code => Err(BindError::Protocol {
            code,
            message: result.text,
        }),
    }
}

fn classify_search(
    raw: Vec<ResultEntry>,
    result: LdapResult,
) -> Result<SearchOutcome, SearchError> {
    let mut outcome = SearchOutcome::default();
    for entry in raw {
        if entry.is_ref() {
            outcome.referrals.extend(ldap3::parse_refs(entry.0));
        } else {
            let SearchEntry { dn, attrs, .. } = SearchEntry::construct(entry);
            outcome.entries.push(DirectoryEntry { dn, attributes: attrs });
        }
    }

    match result.rc {
        RC_SUCCESS => Ok(outcome),
        RC_REFERRAL => {
            outcome.referrals.extend(result.refs);
            Ok(outcome)
        },
        RC_TIME_LIMIT_EXCEEDED => Err(SearchError::Timeout),
        RC_SIZE_LIMIT_EXCEEDED | RC_PARTIAL_RESULTS => Err(SearchError::PartialResults {
            collected: outcome.entries,
        }),
        code => Err(SearchError::Protocol {
            code,
            message: result.text,
        }),
    }
}
