//! LDAP support.
//!
//! Directory access is split in layers: [`connection`] owns the pool and the
//! per-operation deadlines, [`client`] speaks the wire protocol through
//! `ldap3`, and [`search`] resolves a username to exactly one entry.

pub mod client;
pub mod connection;
pub mod filter;
pub mod search;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use client::Ldap3Connector;
pub use connection::{
    ConnectSettings, Connector, DirectoryConn, DirectoryConnection,
    DirectoryEndpoint, ReadConnection, ReferralPolicy, SearchOutcome,
    SearchRequest,
};
pub use search::{DirectoryUserSearch, SearchSpec};

/// A single entry returned by a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Distinguished Name.
    pub dn: String,
    /// Attributes (all values are multi-valued).
    pub attributes: HashMap<String, Vec<String>>,
}

impl DirectoryEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attributes: HashMap::new(),
        }
    }

    /// Add values to an attribute.
    pub fn with_attr<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes
            .entry(name.to_owned())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Values of an attribute, matched case-insensitively.
    pub fn values(&self, name: &str) -> &[String] {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .unwrap_or_default()
    }
}

/// LDAP search scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Search only the base DN.
    Base,
    /// Search one level below the base DN.
    OneLevel,
    /// Search the entire subtree.
    #[default]
    Subtree,
}

impl Scope {
    /// Subtree or single level, from a `search_subtree` flag.
    pub fn from_subtree(subtree: bool) -> Self {
        if subtree { Self::Subtree } else { Self::OneLevel }
    }

    /// Converts to ldap3 scope.
    pub fn to_ldap3(self) -> ldap3::Scope {
        match self {
            Self::Base => ldap3::Scope::Base,
            Self::OneLevel => ldap3::Scope::OneLevel,
            Self::Subtree => ldap3::Scope::Subtree,
        }
    }
}

/// Join a relative DN with a base DN.
pub fn join_dn(relative: &str, base: &str) -> String {
    match (relative.trim(), base.trim()) {
        ("", base) => base.to_owned(),
        (relative, "") => relative.to_owned(),
        (relative, base) => format!("{relative},{base}"),
    }
}

/// Build a base DN such as `dc=example,dc=com` from a domain name.
pub fn domain_to_dn(domain: &str) -> String {
    domain
        .split('.')
        .filter(|part| !part.is_empty())
        .map(|part| format!("dc={part}"))
        .collect::<Vec<_>>()
        .join(",")
}
