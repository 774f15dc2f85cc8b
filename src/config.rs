//! Configuration manager for dirauth.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ConfigError;
use crate::ldap::ReferralPolicy;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Listening socket address.
    pub address: String,
    #[serde(skip_deserializing)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to directory configuration.
    #[serde(skip_serializing)]
    pub ldap: Option<Ldap>,
    /// Related to the login route.
    pub login: Login,
    /// Related to OTLP export.
    #[serde(skip_serializing)]
    pub telemetry: Telemetry,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: env!("CARGO_CRATE_NAME").into(),
            address: "0.0.0.0:1111".into(),
            version: VERSION.to_owned(),
            path: PathBuf::new(),
            ldap: None,
            login: Login::default(),
            telemetry: Telemetry::default(),
        }
    }
}

/// Directory configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ldap {
    /// Tried in order, e.g. `ldap://dc1.example.com:389`.
    pub urls: Vec<String>,
    /// Base DN every relative DN is resolved against.
    pub base: String,
    /// Service account DN used for searches.
    pub user_dn: Option<String>,
    /// Service account password.
    pub password: Option<String>,
    pub pooled: bool,
    pub pool_size: usize,
    /// Search without binding when no service account is set.
    pub anonymous_read_only: bool,
    pub referral: ReferralPolicy,
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    /// Recognised keys: `starttls`, `no_tls_verify`.
    pub environment: HashMap<String, String>,
    pub user_search: Option<UserSearch>,
    /// Relative DN patterns such as `uid={0},ou=people`.
    pub dn_patterns: Vec<String>,
    pub group_search: Option<GroupSearch>,
    pub active_directory: Option<ActiveDirectory>,
    /// Search groups bound as the user instead of the service account.
    pub use_authentication_request_credentials: bool,
    pub hide_user_not_found: bool,
    pub authorities: Option<Authorities>,
}

impl Default for Ldap {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            base: String::new(),
            user_dn: None,
            password: None,
            pooled: true,
            pool_size: crate::ldap::connection::DEFAULT_POOL_SIZE,
            anonymous_read_only: false,
            referral: ReferralPolicy::default(),
            connect_timeout_ms: 5_000,
            operation_timeout_ms: 10_000,
            environment: HashMap::new(),
            user_search: None,
            dn_patterns: Vec::new(),
            group_search: None,
            active_directory: None,
            use_authentication_request_credentials: false,
            hide_user_not_found: true,
            authorities: None,
        }
    }
}

/// User search configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSearch {
    /// Relative to `ldap.base`.
    pub base: String,
    /// `{0}` is the username.
    pub filter: String,
    pub subtree: bool,
    /// Server-side limit, `0` means none.
    pub time_limit_ms: u64,
    pub deref_aliases: bool,
    /// Empty means every user attribute.
    pub attributes: Vec<String>,
}

impl Default for UserSearch {
    fn default() -> Self {
        Self {
            base: String::new(),
            filter: "(uid={0})".into(),
            subtree: true,
            time_limit_ms: 0,
            deref_aliases: false,
            attributes: Vec::new(),
        }
    }
}

/// Group search configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSearch {
    /// Relative to `ldap.base`.
    pub base: String,
    /// `{0}` is the user DN, `{1}` the username.
    pub filter: String,
    pub role_attribute: String,
    pub convert_to_uppercase: bool,
    pub role_prefix: String,
    pub subtree: bool,
    pub ignore_partial_results: bool,
    pub default_role: Option<String>,
}

impl Default for GroupSearch {
    fn default() -> Self {
        use crate::auth::authorities::{
            DEFAULT_GROUP_FILTER, DEFAULT_ROLE_ATTRIBUTE, DEFAULT_ROLE_PREFIX,
        };

        Self {
            base: String::new(),
            filter: DEFAULT_GROUP_FILTER.into(),
            role_attribute: DEFAULT_ROLE_ATTRIBUTE.into(),
            convert_to_uppercase: true,
            role_prefix: DEFAULT_ROLE_PREFIX.into(),
            subtree: false,
            ignore_partial_results: true,
            default_role: None,
        }
    }
}

/// Active Directory configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveDirectory {
    pub domain: Option<String>,
    /// Overrides `ldap.urls` when set.
    pub url: Option<String>,
    pub root_dn: Option<String>,
    /// `{0}` is the user principal name, `{1}` the username.
    pub search_filter: String,
    pub convert_sub_error_codes: bool,
}

impl Default for ActiveDirectory {
    fn default() -> Self {
        Self {
            domain: None,
            url: None,
            root_dn: None,
            search_filter: crate::auth::active_directory::DEFAULT_SEARCH_FILTER.into(),
            convert_sub_error_codes: true,
        }
    }
}

/// Simple authorities mapper configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Authorities {
    pub prefix: String,
    pub convert_to_uppercase: bool,
    pub default_authority: Option<String>,
}

impl Default for Authorities {
    fn default() -> Self {
        Self {
            prefix: crate::auth::authorities::DEFAULT_ROLE_PREFIX.into(),
            convert_to_uppercase: false,
            default_authority: None,
        }
    }
}

/// Login route configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Login {
    pub path: String,
    /// Reject anything but `POST`.
    pub post_only: bool,
}

impl Default for Login {
    fn default() -> Self {
        Self {
            path: "/api/auth/login".into(),
            post_only: true,
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Telemetry {
    /// OTLP collector, e.g. `http://localhost:4317`.
    pub otlp_endpoint: Option<String>,
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Parse a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: Configuration = serde_yaml::from_str(yaml)?;
        config.version = VERSION.to_owned();
        Ok(config)
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location.
    ///
    /// A missing file yields the defaults; a malformed one is an error.
    pub fn read(self) -> Result<Arc<Self>, ConfigError> {
        let file_path = if self.path.is_file() {
            self.path.clone()
        } else {
            Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        match File::open(&file_path) {
            Ok(file) => {
                let mut config: Configuration = serde_yaml::from_reader(file)?;
                config.version = VERSION.to_owned();
                config.path = file_path;
                Ok(Arc::new(config))
            },
            Err(err) => {
                tracing::error!(error = %err, path = %file_path.display(), "`config.yaml` file not found");
                Ok(Arc::new(self))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = Configuration::from_yaml("name: corp").unwrap();
        assert_eq!(config.name, "corp");
        assert_eq!(config.login.path, "/api/auth/login");
        assert!(config.login.post_only);
        assert!(config.ldap.is_none());
        assert_eq!(config.version(), VERSION);
    }

    #[test]
    fn test_full_ldap_section() {
        let config = Configuration::from_yaml(
            r#"
ldap:
  urls: ["ldap://dc1.example.com:389", "ldap://dc2.example.com:389"]
  base: dc=example,dc=com
  user_dn: cn=service,dc=example,dc=com
  password: service-secret
  referral: follow
  environment:
    starttls: "true"
  user_search:
    base: ou=users
    filter: (uid={0})
    time_limit_ms: 3000
  dn_patterns: ["uid={0},ou=people"]
  group_search:
    base: ou=groups
    convert_to_uppercase: false
    default_role: ROLE_USER
  hide_user_not_found: false
"#,
        )
        .unwrap();

        let ldap = config.ldap.unwrap();
        assert_eq!(ldap.urls.len(), 2);
        assert_eq!(ldap.referral, ReferralPolicy::Follow);
        assert!(ldap.pooled);
        assert_eq!(ldap.environment["starttls"], "true");
        assert_eq!(ldap.user_search.unwrap().time_limit_ms, 3000);

        let groups = ldap.group_search.unwrap();
        assert_eq!(groups.filter, "(member={0})");
        assert_eq!(groups.role_attribute, "cn");
        assert_eq!(groups.role_prefix, "ROLE_");
        assert!(!groups.convert_to_uppercase);
        assert!(!ldap.hide_user_not_found);
    }

    #[test]
    fn test_unknown_referral_policy_is_rejected() {
        let result = Configuration::from_yaml("ldap:\n  referral: maybe\n");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }
}
