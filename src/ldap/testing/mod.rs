//! In-memory directory for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

mod filter;

use async_trait::async_trait;

use self::filter::Filter;
use super::connection::{ConnectSettings, Connector, DirectoryConn, SearchOutcome, SearchRequest};
use super::{DirectoryEntry, Scope};
use crate::error::{BindError, ConnectError, SearchError};

/// Operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub opens: usize,
    pub binds: usize,
    pub searches: usize,
}

struct StoredEntry {
    /// Only served by this server URL when set.
    server: Option<String>,
    entry: DirectoryEntry,
    password: Option<String>,
}

#[derive(Default)]
struct State {
    entries: Vec<StoredEntry>,
    bind_diagnostics: HashMap<String, String>,
    bind_delays: HashMap<String, Duration>,
    referrals: HashMap<String, Vec<String>>,
    partial_bases: HashSet<String>,
    unreachable: HashSet<String>,
    search_failure: Option<SearchError>,
    search_delay: Duration,
    stats: Stats,
}

/// A directory held in memory, reachable through [`InMemoryDirectory::connector`].
#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    state: Arc<Mutex<State>>,
}

impl InMemoryDirectory {
    pub const SERVICE_DN: &'static str = "cn=service,dc=example,dc=com";
    pub const SERVICE_PASSWORD: &'static str = "service-secret";

    /// Two users (`alice`, `bob`) with password `secret` and two groups.
    pub fn sample() -> Self {
        let directory = Self::default();
        directory.add_entry(
            DirectoryEntry::new(Self::SERVICE_DN).with_attr("objectClass", ["person"]),
            Some(Self::SERVICE_PASSWORD),
        );
        directory.add_entry(
            DirectoryEntry::new("uid=alice,ou=users,dc=example,dc=com")
                .with_attr("objectClass", ["inetOrgPerson"])
                .with_attr("uid", ["alice"])
                .with_attr("cn", ["Alice Liddell"])
                .with_attr("mail", ["alice@example.com"]),
            Some("secret"),
        );
        directory.add_entry(
            DirectoryEntry::new("uid=bob,ou=users,dc=example,dc=com")
                .with_attr("objectClass", ["inetOrgPerson"])
                .with_attr("uid", ["bob"])
                .with_attr("cn", ["Bob"]),
            Some("secret"),
        );
        directory.add_entry(
            DirectoryEntry::new("cn=admins,ou=groups,dc=example,dc=com")
                .with_attr("objectClass", ["groupOfNames"])
                .with_attr("cn", ["admins"])
                .with_attr("member", ["uid=alice,ou=users,dc=example,dc=com"]),
            None,
        );
        directory.add_entry(
            DirectoryEntry::new("cn=developers,ou=groups,dc=example,dc=com")
                .with_attr("objectClass", ["groupOfNames"])
                .with_attr("cn", ["developers"])
                .with_attr("member", [
                    "uid=alice,ou=users,dc=example,dc=com",
                    "uid=bob,ou=users,dc=example,dc=com",
                ]),
            None,
        );
        directory.add_entry_on(
            "ldap://partner",
            DirectoryEntry::new("uid=carol,ou=partners,dc=example,dc=com")
                .with_attr("objectClass", ["inetOrgPerson"])
                .with_attr("uid", ["carol"]),
            Some("secret"),
        );
        directory
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub fn add_entry(&self, entry: DirectoryEntry, password: Option<&str>) {
        self.state().entries.push(StoredEntry {
            server: None,
            entry,
            password: password.map(Into::into),
        });
    }

    /// Add an entry only visible through `server`.
    pub fn add_entry_on(&self, server: &str, entry: DirectoryEntry, password: Option<&str>) {
        self.state().entries.push(StoredEntry {
            server: Some(server.into()),
            entry,
            password: password.map(Into::into),
        });
    }

    /// Binds as `dn` fail with rc 49 and this diagnostic text.
    pub fn set_bind_diagnostic(&self, dn: &str, diagnostic: &str) {
        self.state()
            .bind_diagnostics
            .insert(normalize_dn(dn), diagnostic.into());
    }

    /// Binds as `dn` answer only after `delay`.
    pub fn set_bind_delay(&self, dn: &str, delay: Duration) {
        self.state().bind_delays.insert(normalize_dn(dn), delay);
    }

    /// Searches on `base` also return a continuation reference to `url`.
    pub fn add_referral(&self, base: &str, url: &str) {
        self.state()
            .referrals
            .entry(normalize_dn(base))
            .or_default()
            .push(url.into());
    }

    /// Searches on `base` stop early with a partial result.
    pub fn set_partial_results(&self, base: &str) {
        self.state().partial_bases.insert(normalize_dn(base));
    }

    pub fn set_unreachable(&self, url: &str) {
        self.state().unreachable.insert(url.into());
    }

    pub fn fail_searches(&self, err: SearchError) {
        self.state().search_failure = Some(err);
    }

    pub fn set_search_delay(&self, delay: Duration) {
        self.state().search_delay = delay;
    }

    pub fn stats(&self) -> Stats {
        self.state().stats
    }
}

#[async_trait]
impl Connector for InMemoryDirectory {
    async fn open(
        &self,
        url: &str,
        _settings: &ConnectSettings,
    ) -> Result<Box<dyn DirectoryConn>, ConnectError> {
        let mut state = self.state();
        if state.unreachable.contains(url) {
            return Err(ConnectError::Unreachable(format!("{url}: connection refused")));
        }
        state.stats.opens += 1;

        Ok(Box::new(InMemoryConn {
            directory: self.clone(),
            server: url.into(),
            closed: false,
        }))
    }
}

struct InMemoryConn {
    directory: InMemoryDirectory,
    server: String,
    closed: bool,
}

#[async_trait]
impl DirectoryConn for InMemoryConn {
    async fn simple_bind(
        &mut self,
        dn: &str,
        password: &str,
    ) -> Result<(), BindError> {
        let key = normalize_dn(dn);
        let delay = self.directory.state().bind_delays.get(&key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.directory.state();
        state.stats.binds += 1;

        if let Some(diagnostic) = state.bind_diagnostics.get(&key) {
            return Err(BindError::InvalidCredentials {
                diagnostic: diagnostic.clone(),
            });
        }

        // Unauthenticated bind, accepted like most servers do.
        if password.is_empty() {
            return Ok(());
        }

        // Active Directory also accepts the user principal name.
        let matches = state.entries.iter().any(|stored| {
            let named = normalize_dn(&stored.entry.dn) == key
                || stored
                    .entry
                    .values("userPrincipalName")
                    .iter()
                    .any(|upn| upn.eq_ignore_ascii_case(dn));
            named && stored.password.as_deref() == Some(password)
        });
        if matches {
            Ok(())
        } else {
            Err(BindError::InvalidCredentials {
                diagnostic: "invalid credentials".into(),
            })
        }
    }

    async fn search(
        &mut self,
        request: &SearchRequest,
    ) -> Result<SearchOutcome, SearchError> {
        let delay = {
            let mut state = self.directory.state();
            state.stats.searches += 1;
            state.search_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let filter = Filter::parse(&request.filter)
            .map_err(|err| SearchError::Malformed(err.to_string()))?;

        let state = self.directory.state();
        if let Some(err) = &state.search_failure {
            return Err(err.clone());
        }

        let base = normalize_dn(&request.base);
        let entries: Vec<DirectoryEntry> = state
            .entries
            .iter()
            .filter(|stored| {
                stored.server.as_deref().is_none_or(|server| server == self.server)
            })
            .filter(|stored| in_scope(&normalize_dn(&stored.entry.dn), &base, request.scope))
            .filter(|stored| matches(&filter, &stored.entry))
            .map(|stored| stored.entry.clone())
            .collect();

        if state.partial_bases.contains(&base) {
            return Err(SearchError::PartialResults { collected: entries });
        }

        Ok(SearchOutcome {
            entries,
            referrals: state.referrals.get(&base).cloned().unwrap_or_default(),
        })
    }

    async fn unbind(&mut self) {
        self.closed = true;
    }

    fn is_closed(&mut self) -> bool {
        self.closed
    }
}

fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| rdn.trim().to_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

fn in_scope(dn: &str, base: &str, scope: Scope) -> bool {
    let parent = dn.split_once(',').map(|(_, parent)| parent).unwrap_or_default();
    match scope {
        Scope::Base => dn == base,
        Scope::OneLevel => parent == base,
        Scope::Subtree => base.is_empty() || dn == base || dn.ends_with(&format!(",{base}")),
    }
}

fn matches(filter: &Filter, entry: &DirectoryEntry) -> bool {
    let values = |attr: &str| {
        entry
            .values(attr)
            .iter()
            .map(|v| normalize_dn(v))
            .collect::<Vec<_>>()
    };

    match filter {
        Filter::And(filters) => filters.iter().all(|f| matches(f, entry)),
        Filter::Or(filters) => filters.iter().any(|f| matches(f, entry)),
        Filter::Not(filter) => !matches(filter, entry),
        Filter::Present { attr } => {
            attr.eq_ignore_ascii_case("objectClass") || !entry.values(attr).is_empty()
        },
        Filter::Equality { attr, value }
        | Filter::Approx { attr, value }
        | Filter::Extensible { attr, value } => {
            values(attr).contains(&normalize_dn(value))
        },
        Filter::GreaterOrEqual { attr, value } => {
            values(attr).iter().any(|v| *v >= value.to_lowercase())
        },
        Filter::LessOrEqual { attr, value } => {
            values(attr).iter().any(|v| *v <= value.to_lowercase())
        },
        Filter::Substring {
            attr,
            initial,
            any,
            last,
        } => values(attr).iter().any(|v| {
            let mut rest = v.as_str();
            if let Some(initial) = initial {
                let Some(stripped) = rest.strip_prefix(initial.to_lowercase().as_str()) else {
                    return false;
                };
                rest = stripped;
            }
            for part in any {
                let part = part.to_lowercase();
                let Some(at) = rest.find(&part) else {
                    return false;
                };
                rest = &rest[at + part.len()..];
            }
            last.as_ref()
                .is_none_or(|last| rest.ends_with(&last.to_lowercase()))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_evaluation() {
        let entry = DirectoryEntry::new("uid=alice,ou=users,dc=example,dc=com")
            .with_attr("uid", ["alice"])
            .with_attr("mail", ["Alice@Example.com"]);

        let eval = |f: &str| matches(&Filter::parse(f).unwrap(), &entry);
        assert!(eval("(uid=ALICE)"));
        assert!(eval("(&(objectClass=*)(mail=alice@*))"));
        assert!(eval("(mail=*example*)"));
        assert!(!eval("(!(uid=alice))"));
        assert!(!eval(r"(uid=\2a)"));
    }

    #[test]
    fn test_scope() {
        let dn = "uid=alice,ou=users,dc=example,dc=com";
        assert!(in_scope(dn, "ou=users,dc=example,dc=com", Scope::OneLevel));
        assert!(!in_scope(dn, "dc=example,dc=com", Scope::OneLevel));
        assert!(in_scope(dn, "dc=example,dc=com", Scope::Subtree));
        assert!(!in_scope(dn, "dc=example,dc=com", Scope::Base));
    }
}
