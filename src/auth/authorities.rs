//! Granted authorities.

use std::collections::BTreeSet;

use super::{Credentials, DirectoryPrincipal, GrantedAuthority};
use crate::error::{ConfigError, DirectoryError, SearchError};
use crate::ldap::filter::{build_filter, validate_template};
use crate::ldap::{DirectoryConnection, DirectoryEntry, Scope, SearchRequest, join_dn};

pub const DEFAULT_GROUP_FILTER: &str = "(member={0})";
pub const DEFAULT_ROLE_ATTRIBUTE: &str = "cn";
pub const DEFAULT_ROLE_PREFIX: &str = "ROLE_";

/// Closed set of authority sources.
pub enum AuthoritiesPopulator {
    GroupSearch(GroupSearchPopulator),
    /// Grants nothing.
    Null,
}

impl AuthoritiesPopulator {
    pub async fn resolve(
        &self,
        principal: &DirectoryPrincipal,
        credentials: &Credentials,
    ) -> Result<BTreeSet<GrantedAuthority>, DirectoryError> {
        match self {
            Self::GroupSearch(populator) => populator.resolve(principal, credentials).await,
            Self::Null => Ok(BTreeSet::new()),
        }
    }
}

/// Settings of [`GroupSearchPopulator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSearchSettings {
    /// Relative to the endpoint base DN.
    pub base: String,
    /// `{0}` is the user DN, `{1}` the username.
    pub filter: String,
    pub role_attribute: String,
    pub convert_to_uppercase: bool,
    pub role_prefix: String,
    pub subtree: bool,
    pub ignore_partial_results: bool,
    /// Granted to every authenticated user.
    pub default_role: Option<String>,
    /// Search groups bound as the user instead of the service account.
    pub use_authentication_request_credentials: bool,
}

impl Default for GroupSearchSettings {
    fn default() -> Self {
        Self {
            base: String::new(),
            filter: DEFAULT_GROUP_FILTER.into(),
            role_attribute: DEFAULT_ROLE_ATTRIBUTE.into(),
            convert_to_uppercase: true,
            role_prefix: DEFAULT_ROLE_PREFIX.into(),
            subtree: false,
            ignore_partial_results: true,
            default_role: None,
            use_authentication_request_credentials: false,
        }
    }
}

/// Roles from the groups whose members include the user.
pub struct GroupSearchPopulator {
    connection: DirectoryConnection,
    settings: GroupSearchSettings,
}

impl GroupSearchPopulator {
    /// Create a new [`GroupSearchPopulator`].
    pub fn new(
        connection: DirectoryConnection,
        settings: GroupSearchSettings,
    ) -> Result<Self, ConfigError> {
        validate_template(&settings.filter, 2).map_err(|err| ConfigError::InvalidFilter {
            template: settings.filter.clone(),
            reason: err.to_string(),
        })?;
        if settings.role_attribute.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ldap.group_search.role_attribute",
                reason: "must not be empty".into(),
            });
        }

        Ok(Self {
            connection,
            settings,
        })
    }

    fn request(&self, principal: &DirectoryPrincipal) -> SearchRequest {
        SearchRequest {
            base: join_dn(&self.settings.base, &self.connection.endpoint().base),
            scope: Scope::from_subtree(self.settings.subtree),
            filter: build_filter(
                &self.settings.filter,
                &[principal.dn(), principal.username()],
            ),
            attributes: vec![self.settings.role_attribute.clone()],
            time_limit: std::time::Duration::ZERO,
            deref_aliases: false,
        }
    }

    /// Turn one role attribute value into an authority.
    pub fn authority(&self, value: &str) -> GrantedAuthority {
        let value = if self.settings.convert_to_uppercase {
            value.to_uppercase()
        } else {
            value.to_owned()
        };
        GrantedAuthority::new(format!("{}{value}", self.settings.role_prefix))
    }

    pub async fn resolve(
        &self,
        principal: &DirectoryPrincipal,
        credentials: &Credentials,
    ) -> Result<BTreeSet<GrantedAuthority>, DirectoryError> {
        let request = self.request(principal);
        tracing::debug!(base = %request.base, filter = %request.filter, "searching for groups");

        let entries = match self.search(&request, principal, credentials).await {
            Ok(entries) => entries,
            Err(SearchError::PartialResults { collected })
                if self.settings.ignore_partial_results =>
            {
                tracing::warn!(
                    collected = collected.len(),
                    "group search returned partial results, keeping what was collected"
                );
                collected
            },
            Err(err) => return Err(err.into()),
        };

        let mut authorities: BTreeSet<GrantedAuthority> = entries
            .iter()
            .flat_map(|entry| entry.values(&self.settings.role_attribute))
            .filter(|value| !value.is_empty())
            .map(|value| self.authority(value))
            .collect();

        if let Some(role) = &self.settings.default_role {
            authorities.insert(GrantedAuthority::new(role.clone()));
        }

        Ok(authorities)
    }

    async fn search(
        &self,
        request: &SearchRequest,
        principal: &DirectoryPrincipal,
        credentials: &Credentials,
    ) -> Result<Vec<DirectoryEntry>, SearchError> {
        if !self.settings.use_authentication_request_credentials {
            return self.connection.search(request).await;
        }

        let mut conn = self.connection.bind(principal.dn(), credentials.secret()).await?;
        let entries = self.connection.search_on(conn.as_mut(), request).await;
        conn.unbind().await;
        entries
    }
}

/// Post-processing of the resolved authorities.
pub trait AuthoritiesMapper: Send + Sync {
    fn map(&self, authorities: BTreeSet<GrantedAuthority>) -> BTreeSet<GrantedAuthority>;
}

/// Returns its input.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapper;

impl AuthoritiesMapper for IdentityMapper {
    fn map(&self, authorities: BTreeSet<GrantedAuthority>) -> BTreeSet<GrantedAuthority> {
        authorities
    }
}

/// Normalises case, adds a prefix where missing and an optional default
/// authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimpleAuthorityMapper {
    pub prefix: String,
    pub convert_to_uppercase: bool,
    pub default_authority: Option<String>,
}

impl Default for SimpleAuthorityMapper {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_ROLE_PREFIX.into(),
            convert_to_uppercase: false,
            default_authority: None,
        }
    }
}

impl AuthoritiesMapper for SimpleAuthorityMapper {
    fn map(&self, authorities: BTreeSet<GrantedAuthority>) -> BTreeSet<GrantedAuthority> {
        let mut mapped: BTreeSet<GrantedAuthority> = authorities
            .iter()
            .map(|authority| {
                let name = if self.convert_to_uppercase {
                    authority.as_str().to_uppercase()
                } else {
                    authority.as_str().to_owned()
                };
                if name.starts_with(&self.prefix) {
                    GrantedAuthority::new(name)
                } else {
                    GrantedAuthority::new(format!("{}{name}", self.prefix))
                }
            })
            .collect();

        if let Some(default) = &self.default_authority {
            mapped.insert(GrantedAuthority::new(default.clone()));
        }
        mapped
    }
}
