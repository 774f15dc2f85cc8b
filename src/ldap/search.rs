//! Resolution of a username to its directory entry.

use std::time::Duration;

use super::filter::build_filter;
use super::{DirectoryConnection, Scope, SearchRequest, join_dn};
use crate::auth::DirectoryPrincipal;
use crate::error::SearchError;

/// How users are looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchSpec {
    /// Relative to the endpoint base DN.
    pub base: String,
    /// `{0}` is the username.
    pub filter: String,
    pub subtree: bool,
    pub time_limit: Duration,
    pub deref_aliases: bool,
    /// Empty means all user attributes.
    pub attributes: Vec<String>,
}

impl SearchSpec {
    pub fn new(base: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            filter: filter.into(),
            subtree: true,
            time_limit: Duration::ZERO,
            deref_aliases: false,
            attributes: Vec::new(),
        }
    }
}

/// Filtered search for a single user.
#[derive(Clone)]
pub struct DirectoryUserSearch {
    connection: DirectoryConnection,
    spec: SearchSpec,
}

impl DirectoryUserSearch {
    pub fn new(connection: DirectoryConnection, spec: SearchSpec) -> Self {
        Self { connection, spec }
    }

    pub fn spec(&self) -> &SearchSpec {
        &self.spec
    }

    /// Search request for `username`, with the username escaped.
    pub fn request(&self, username: &str) -> SearchRequest {
        SearchRequest {
            base: join_dn(&self.spec.base, &self.connection.endpoint().base),
            scope: Scope::from_subtree(self.spec.subtree),
            filter: build_filter(&self.spec.filter, &[username]),
            attributes: self.spec.attributes.clone(),
            time_limit: self.spec.time_limit,
            deref_aliases: self.spec.deref_aliases,
        }
    }

    /// Find the entry of `username`.
    ///
    /// `Ok(None)` is a definitive "not found". Several matches are an
    /// [`SearchError::AmbiguousPrincipal`], never a pick.
    pub async fn find(
        &self,
        username: &str,
    ) -> Result<Option<DirectoryPrincipal>, SearchError> {
        let request = self.request(username);
        tracing::debug!(base = %request.base, filter = %request.filter, "searching for user");

        let mut entries = self.connection.search(&request).await?;
        match entries.len() {
            0 => Ok(None),
            1 => {
                let entry = entries.remove(0);
                DirectoryPrincipal::new(username, entry).map(Some)
            },
            matches => Err(SearchError::AmbiguousPrincipal {
                username: username.to_owned(),
                matches,
            }),
        }
    }
}
