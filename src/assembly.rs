//! Wiring of the decision engine from configuration.
//!
//! connection -> user search -> authenticator -> populator -> engine. Every
//! configuration check happens here, before any directory traffic.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::auth::active_directory::{ActiveDirectoryAuthenticator, ActiveDirectorySettings};
use crate::auth::authenticator::{Authenticator, BindAuthenticator};
use crate::auth::authorities::{
    AuthoritiesPopulator, GroupSearchPopulator, GroupSearchSettings, SimpleAuthorityMapper,
};
use crate::auth::engine::AuthenticationDecisionEngine;
use crate::config;
use crate::error::ConfigError;
use crate::ldap::filter::validate_template;
use crate::ldap::{
    Connector, DirectoryConnection, DirectoryEndpoint, DirectoryUserSearch, Ldap3Connector,
    SearchSpec,
};

const KNOWN_ENVIRONMENT_KEYS: &[&str] = &["starttls", "no_tls_verify"];

/// Build the engine with the `ldap3` connector.
pub fn build_engine(config: &config::Ldap) -> Result<AuthenticationDecisionEngine, ConfigError> {
    build_engine_with(config, Arc::new(Ldap3Connector))
}

/// Build the engine on any [`Connector`].
pub fn build_engine_with(
    config: &config::Ldap,
    connector: Arc<dyn Connector>,
) -> Result<AuthenticationDecisionEngine, ConfigError> {
    let endpoint = endpoint(config)?;
    let connection = DirectoryConnection::new(endpoint, connector);

    let authenticator = match &config.active_directory {
        Some(ad) => Authenticator::ActiveDirectory(ActiveDirectoryAuthenticator::new(
            connection.clone(),
            ActiveDirectorySettings {
                domain: ad.domain.clone(),
                root_dn: ad.root_dn.clone(),
                search_filter: ad.search_filter.clone(),
                convert_sub_error_codes: ad.convert_sub_error_codes,
            },
        )?),
        None => {
            let user_search = config
                .user_search
                .as_ref()
                .map(|search| user_search(&connection, search))
                .transpose()?;
            Authenticator::Bind(BindAuthenticator::new(
                connection.clone(),
                config.dn_patterns.clone(),
                user_search,
            )?)
        },
    };

    let populator = match &config.group_search {
        Some(groups) => AuthoritiesPopulator::GroupSearch(GroupSearchPopulator::new(
            connection,
            GroupSearchSettings {
                base: groups.base.clone(),
                filter: groups.filter.clone(),
                role_attribute: groups.role_attribute.clone(),
                convert_to_uppercase: groups.convert_to_uppercase,
                role_prefix: groups.role_prefix.clone(),
                subtree: groups.subtree,
                ignore_partial_results: groups.ignore_partial_results,
                default_role: groups.default_role.clone(),
                use_authentication_request_credentials: config
                    .use_authentication_request_credentials,
            },
        )?),
        None => AuthoritiesPopulator::Null,
    };

    let mut engine = AuthenticationDecisionEngine::new(authenticator, populator)
        .hide_user_not_found(config.hide_user_not_found);
    if let Some(authorities) = &config.authorities {
        engine = engine.with_mapper(Arc::new(SimpleAuthorityMapper {
            prefix: authorities.prefix.clone(),
            convert_to_uppercase: authorities.convert_to_uppercase,
            default_authority: authorities.default_authority.clone(),
        }));
    }

    tracing::info!(
        urls = ?config.urls,
        base = %config.base,
        active_directory = config.active_directory.is_some(),
        group_search = config.group_search.is_some(),
        "authentication engine assembled"
    );
    Ok(engine)
}

fn endpoint(config: &config::Ldap) -> Result<DirectoryEndpoint, ConfigError> {
    let urls = match config.active_directory.as_ref().and_then(|ad| ad.url.clone()) {
        Some(url) => vec![url],
        None => config.urls.clone(),
    };
    if urls.is_empty() {
        return Err(ConfigError::Missing("ldap.urls"));
    }
    for url in &urls {
        validate_url(url)?;
    }

    let user_dn = config.user_dn.clone().filter(|dn| !dn.trim().is_empty());
    if let Some(dn) = &user_dn {
        if config.password.as_deref().unwrap_or_default().is_empty() {
            return Err(ConfigError::EmptyServicePassword(dn.clone()));
        }
    } else if !config.anonymous_read_only
        && (config.user_search.is_some() || config.group_search.is_some())
    {
        tracing::warn!("no service account and `anonymous_read_only` unset, searches run unauthenticated");
    }

    if config.pooled && config.pool_size == 0 {
        return Err(ConfigError::InvalidValue {
            field: "ldap.pool_size",
            reason: "must be at least 1 when pooled".into(),
        });
    }
    if config.connect_timeout_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "ldap.connect_timeout_ms",
            reason: "must be positive".into(),
        });
    }
    if config.operation_timeout_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "ldap.operation_timeout_ms",
            reason: "must be positive".into(),
        });
    }

    for key in config.environment.keys() {
        if !KNOWN_ENVIRONMENT_KEYS.contains(&key.as_str()) {
            tracing::warn!(%key, "ignoring unknown directory environment property");
        }
    }

    Ok(DirectoryEndpoint {
        urls,
        base: config.base.clone(),
        user_dn,
        password: config.password.clone(),
        pooled: config.pooled,
        pool_size: config.pool_size,
        anonymous_read_only: config.anonymous_read_only,
        referral: config.referral,
        connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        operation_timeout: Duration::from_millis(config.operation_timeout_ms),
        environment: config.environment.clone(),
    })
}

fn validate_url(url: &str) -> Result<(), ConfigError> {
    let parsed = Url::parse(url).map_err(|err| ConfigError::InvalidUrl {
        url: url.to_owned(),
        reason: err.to_string(),
    })?;

    match parsed.scheme() {
        "ldap" | "ldaps" if parsed.host_str().is_some() => Ok(()),
        "ldap" | "ldaps" => Err(ConfigError::InvalidUrl {
            url: url.to_owned(),
            reason: "missing host".into(),
        }),
        scheme => Err(ConfigError::InvalidUrl {
            url: url.to_owned(),
            reason: format!("unsupported scheme `{scheme}`"),
        }),
    }
}

fn user_search(
    connection: &DirectoryConnection,
    config: &config::UserSearch,
) -> Result<DirectoryUserSearch, ConfigError> {
    validate_template(&config.filter, 1).map_err(|err| ConfigError::InvalidFilter {
        template: config.filter.clone(),
        reason: err.to_string(),
    })?;

    Ok(DirectoryUserSearch::new(
        connection.clone(),
        SearchSpec {
            base: config.base.clone(),
            filter: config.filter.clone(),
            subtree: config.subtree,
            time_limit: Duration::from_millis(config.time_limit_ms),
            deref_aliases: config.deref_aliases,
            attributes: config.attributes.clone(),
        },
    ))
}
