//! Directory connections.
//!
//! Two kinds of connections are handed out:
//!
//! - *read* connections, bound as the service account (or anonymous when
//!   `anonymous_read_only` is set), optionally pooled, used for searches;
//! - *user* connections, always fresh and never pooled, bound with the
//!   credentials under test.
//!
//! Pooled read connections live in a [`deadpool`] pool. A connection is
//! marked dirty for the duration of each operation and only a clean one
//! passes recycling, so errors, timeouts and task cancellation never hand a
//! half-used connection to the next caller.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool::managed;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use super::{DirectoryEntry, Scope};
use crate::error::{BindError, ConnectError, SearchError};

pub const DEFAULT_POOL_SIZE: usize = 8;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// What to do with referrals returned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralPolicy {
    /// Chase referrals (one hop) and merge their entries.
    Follow,
    /// Drop referrals silently.
    #[default]
    Ignore,
    /// Fail the search with [`SearchError::Referral`].
    Throw,
}

/// Parameters of one search operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    /// Absolute DN.
    pub base: String,
    pub scope: Scope,
    pub filter: String,
    pub attributes: Vec<String>,
    /// Server-side time limit, zero means none.
    pub time_limit: Duration,
    pub deref_aliases: bool,
}

/// Raw result of a search: entries plus continuation references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOutcome {
    pub entries: Vec<DirectoryEntry>,
    pub referrals: Vec<String>,
}

/// A single open connection to a directory server.
#[async_trait]
pub trait DirectoryConn: Send {
    /// Simple bind. A result code 49 is [`BindError::InvalidCredentials`].
    async fn simple_bind(&mut self, dn: &str, password: &str)
    -> Result<(), BindError>;

    async fn search(
        &mut self,
        request: &SearchRequest,
    ) -> Result<SearchOutcome, SearchError>;

    /// Best-effort unbind; the connection is unusable afterwards.
    async fn unbind(&mut self);

    /// Whether the underlying transport is known to be gone.
    fn is_closed(&mut self) -> bool {
        false
    }
}

/// Factory of raw (unbound) connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        url: &str,
        settings: &ConnectSettings,
    ) -> Result<Box<dyn DirectoryConn>, ConnectError>;
}

/// Transport settings derived from the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectSettings {
    pub connect_timeout: Duration,
    pub starttls: bool,
    pub no_tls_verify: bool,
}

/// Where and how to reach the directory.
#[derive(Clone)]
pub struct DirectoryEndpoint {
    /// Tried in order until one accepts the connection.
    pub urls: Vec<String>,
    pub base: String,
    /// Service account used for searches.
    pub user_dn: Option<String>,
    pub password: Option<String>,
    pub pooled: bool,
    pub pool_size: usize,
    pub anonymous_read_only: bool,
    pub referral: ReferralPolicy,
    pub connect_timeout: Duration,
    /// Deadline applied to each bind and search.
    pub operation_timeout: Duration,
    pub environment: HashMap<String, String>,
}

impl fmt::Debug for DirectoryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryEndpoint")
            .field("urls", &self.urls)
            .field("base", &self.base)
            .field("user_dn", &self.user_dn)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("pooled", &self.pooled)
            .field("pool_size", &self.pool_size)
            .field("anonymous_read_only", &self.anonymous_read_only)
            .field("referral", &self.referral)
            .finish_non_exhaustive()
    }
}

impl Default for DirectoryEndpoint {
    fn default() -> Self {
        Self {
            urls: vec!["ldap://localhost:389".into()],
            base: String::new(),
            user_dn: None,
            password: None,
            pooled: true,
            pool_size: DEFAULT_POOL_SIZE,
            anonymous_read_only: false,
            referral: ReferralPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            environment: HashMap::new(),
        }
    }
}

impl DirectoryEndpoint {
    /// Transport settings, reading the recognised environment keys.
    pub fn settings(&self) -> ConnectSettings {
        let flag = |key: &str| {
            self.environment
                .get(key)
                .is_some_and(|v| v.eq_ignore_ascii_case("true"))
        };

        ConnectSettings {
            connect_timeout: self.connect_timeout,
            starttls: flag("starttls"),
            no_tls_verify: flag("no_tls_verify"),
        }
    }
}

/// Opens and authenticates connections for one endpoint.
struct Context {
    endpoint: DirectoryEndpoint,
    connector: Arc<dyn Connector>,
}

impl Context {
    async fn open_url(&self, url: &str) -> Result<Box<dyn DirectoryConn>, ConnectError> {
        let settings = self.endpoint.settings();
        timeout(self.endpoint.connect_timeout, self.connector.open(url, &settings))
            .await
            .map_err(|_| ConnectError::Timeout)?
    }

    /// Open a connection on the first reachable URL.
    async fn open_any(&self) -> Result<Box<dyn DirectoryConn>, ConnectError> {
        let mut last_error = ConnectError::Unreachable("no directory URL configured".into());

        for url in &self.endpoint.urls {
            match self.open_url(url).await {
                Ok(conn) => return Ok(conn),
                // A TLS failure will not get better on another replica.
                Err(err @ ConnectError::TlsHandshake(_)) => return Err(err),
                Err(err) => {
                    tracing::warn!(%url, %err, "directory server unavailable, trying next URL");
                    last_error = err;
                },
            }
        }

        Err(last_error)
    }

    /// Bind a fresh connection as the service account, or leave it
    /// anonymous when `anonymous_read_only` is set or no account is
    /// configured.
    async fn authenticate_context(
        &self,
        conn: &mut dyn DirectoryConn,
    ) -> Result<(), ConnectError> {
        if self.endpoint.anonymous_read_only {
            return Ok(());
        }
        let Some(dn) = self.endpoint.user_dn.as_deref().filter(|dn| !dn.is_empty()) else {
            return Ok(());
        };
        let password = self.endpoint.password.as_deref().unwrap_or_default();
        if password.is_empty() {
            return Err(ConnectError::InvalidCredentials(format!(
                "empty password for service account {dn}"
            )));
        }

        match timeout(self.endpoint.operation_timeout, conn.simple_bind(dn, password)).await {
            Err(_) | Ok(Err(BindError::Timeout)) => Err(ConnectError::Timeout),
            Ok(Ok(())) => Ok(()),
            Ok(Err(BindError::InvalidCredentials { diagnostic })) => {
                Err(ConnectError::InvalidCredentials(diagnostic))
            },
            Ok(Err(BindError::Connect(err))) => Err(err),
            Ok(Err(err)) => Err(ConnectError::Unreachable(err.to_string())),
        }
    }

    async fn read_context(&self) -> Result<ReadContext, ConnectError> {
        let mut conn = self.open_any().await?;
        self.authenticate_context(conn.as_mut()).await?;
        Ok(ReadContext { conn, clean: true })
    }
}

/// A bound read connection.
struct ReadContext {
    conn: Box<dyn DirectoryConn>,
    /// Cleared while an operation runs, set again only when it succeeds.
    clean: bool,
}

struct ReadManager(Arc<Context>);

impl managed::Manager for ReadManager {
    type Type = ReadContext;
    type Error = ConnectError;

    async fn create(&self) -> Result<ReadContext, ConnectError> {
        self.0.read_context().await
    }

    async fn recycle(
        &self,
        context: &mut ReadContext,
        _: &managed::Metrics,
    ) -> managed::RecycleResult<ConnectError> {
        if !context.clean {
            return Err(managed::RecycleError::Message(
                "connection left by an unfinished operation".into(),
            ));
        }
        if context.conn.is_closed() {
            return Err(managed::RecycleError::Message("connection closed".into()));
        }
        Ok(())
    }
}

enum Checkout {
    Pooled(managed::Object<ReadManager>),
    Fresh(ReadContext),
}

/// A read connection checked out from [`DirectoryConnection::connect`].
///
/// Dropping it returns a pooled connection to the pool, where it is
/// recycled only if its last operation completed.
pub struct ReadConnection {
    checkout: Checkout,
}

impl ReadConnection {
    fn context(&mut self) -> &mut ReadContext {
        match &mut self.checkout {
            Checkout::Pooled(object) => &mut **object,
            Checkout::Fresh(context) => context,
        }
    }

    pub fn conn(&mut self) -> &mut dyn DirectoryConn {
        self.context().conn.as_mut()
    }

    /// Close the connection unless it goes back to a pool.
    async fn finish(mut self) {
        if let Checkout::Fresh(context) = &mut self.checkout {
            context.conn.unbind().await;
        }
    }
}

/// Connection manager for one [`DirectoryEndpoint`].
#[derive(Clone)]
pub struct DirectoryConnection {
    context: Arc<Context>,
    pool: Option<managed::Pool<ReadManager>>,
}

impl DirectoryConnection {
    /// Create a new [`DirectoryConnection`].
    pub fn new(endpoint: DirectoryEndpoint, connector: Arc<dyn Connector>) -> Self {
        let pooled = endpoint.pooled;
        let pool_size = endpoint.pool_size.max(1);
        let wait_timeout = endpoint.operation_timeout;
        let context = Arc::new(Context { endpoint, connector });

        let pool = pooled
            .then(|| {
                managed::Pool::builder(ReadManager(Arc::clone(&context)))
                    .max_size(pool_size)
                    .wait_timeout(Some(wait_timeout))
                    .runtime(deadpool::Runtime::Tokio1)
                    .build()
                    .inspect_err(|err| {
                        tracing::error!(%err, "cannot build directory connection pool, connections will not be pooled");
                    })
                    .ok()
            })
            .flatten();

        Self { context, pool }
    }

    pub fn endpoint(&self) -> &DirectoryEndpoint {
        &self.context.endpoint
    }

    /// Number of idle pooled connections.
    pub fn idle_connections(&self) -> usize {
        self.pool
            .as_ref()
            .map(|pool| pool.status().available)
            .unwrap_or_default()
    }

    /// Check out a read connection.
    pub async fn connect(&self) -> Result<ReadConnection, ConnectError> {
        let Some(pool) = &self.pool else {
            return Ok(ReadConnection {
                checkout: Checkout::Fresh(self.context.read_context().await?),
            });
        };

        let object = pool.get().await.map_err(|err| match err {
            managed::PoolError::Timeout(_) => ConnectError::Timeout,
            managed::PoolError::Backend(err) => err,
            err => ConnectError::Unreachable(err.to_string()),
        })?;
        Ok(ReadConnection {
            checkout: Checkout::Pooled(object),
        })
    }

    /// Bind a fresh, unpooled connection with user credentials.
    ///
    /// An empty password never reaches the wire. The returned connection is
    /// bound as `dn`; callers unbind it when done.
    pub async fn bind(
        &self,
        dn: &str,
        password: &str,
    ) -> Result<Box<dyn DirectoryConn>, BindError> {
        if password.is_empty() {
            return Err(BindError::EmptyPassword);
        }

        let mut conn = self.context.open_any().await?;
        let started = Instant::now();
        let result = timeout(self.endpoint().operation_timeout, conn.simple_bind(dn, password))
            .await
            .map_err(|_| BindError::Timeout)?;
        metrics::histogram!("directory_operation_duration_seconds", "operation" => "bind")
            .record(started.elapsed().as_secs_f64());

        result.map(|()| conn)
    }

    /// Search on a pooled read connection, honouring the referral policy.
    pub async fn search(
        &self,
        request: &SearchRequest,
    ) -> Result<Vec<DirectoryEntry>, SearchError> {
        let mut read = self.connect().await?;
        read.context().clean = false;
        let result = self.search_on(read.conn(), request).await;
        read.context().clean = result.is_ok();
        read.finish().await;
        result
    }

    /// Search on a caller-provided connection.
    pub async fn search_on(
        &self,
        conn: &mut dyn DirectoryConn,
        request: &SearchRequest,
    ) -> Result<Vec<DirectoryEntry>, SearchError> {
        let SearchOutcome { mut entries, referrals } =
            self.timed_search(conn, request).await?;

        if referrals.is_empty() {
            return Ok(entries);
        }

        match self.endpoint().referral {
            ReferralPolicy::Ignore => {
                tracing::debug!(count = referrals.len(), base = %request.base, "ignoring referrals");
                Ok(entries)
            },
            ReferralPolicy::Throw => Err(SearchError::Referral { urls: referrals }),
            ReferralPolicy::Follow => {
                for url in referrals {
                    entries.extend(self.follow_referral(&url, request).await?);
                }
                Ok(entries)
            },
        }
    }

    async fn timed_search(
        &self,
        conn: &mut dyn DirectoryConn,
        request: &SearchRequest,
    ) -> Result<SearchOutcome, SearchError> {
        // A server-side limit also bounds the wait on the client.
        let deadline = if request.time_limit.is_zero() {
            self.endpoint().operation_timeout
        } else {
            request.time_limit
        };
        let started = Instant::now();
        let outcome = timeout(deadline, conn.search(request))
            .await
            .map_err(|_| SearchError::Timeout)?;
        metrics::histogram!("directory_operation_duration_seconds", "operation" => "search")
            .record(started.elapsed().as_secs_f64());
        outcome
    }

    /// Chase one referral. Nested referrals are not followed.
    async fn follow_referral(
        &self,
        url: &str,
        request: &SearchRequest,
    ) -> Result<Vec<DirectoryEntry>, SearchError> {
        let (server, dn) = split_referral(url)?;
        tracing::debug!(%server, %dn, "following referral");

        let mut conn = self.context.open_url(&server).await?;
        self.context.authenticate_context(conn.as_mut()).await?;

        let request = SearchRequest {
            base: if dn.is_empty() { request.base.clone() } else { dn },
            ..request.clone()
        };
        let outcome = self.timed_search(conn.as_mut(), &request).await?;
        conn.unbind().await;

        if !outcome.referrals.is_empty() {
            tracing::warn!(count = outcome.referrals.len(), "nested referrals not followed");
        }
        Ok(outcome.entries)
    }
}

/// Split `ldap://host:port/dn?...` into the server URL and the decoded DN.
fn split_referral(referral: &str) -> Result<(String, String), SearchError> {
    let url = url::Url::parse(referral)
        .map_err(|err| SearchError::Malformed(format!("referral `{referral}`: {err}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| SearchError::Malformed(format!("referral `{referral}` has no host")))?;

    let server = match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    };
    let dn = percent_decode_str(url.path().trim_start_matches('/'))
        .decode_utf8_lossy()
        .into_owned();
    Ok((server, dn))
}
