//! Bridge Configuration Settings
//!
//! Configuration types for the bridge, loaded from environment variables.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::identity::{AccountId, UserId};
use crate::domain::rate_limit::RateLimit;

/// Variable lookup; `std::env::var` in production, a map in tests.
pub type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Where rate-limit windows live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitBackend {
    /// Process-local windows.
    #[default]
    Local,
    /// Windows in a shared SQLite file, falling back to local windows.
    Shared,
}

impl RateLimitBackend {
    /// Parse a backend name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for unknown names.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "shared" | "sqlite" => Ok(Self::Shared),
            other => Err(ConfigError::Invalid {
                key: "BRIDGE_RATE_LIMIT_BACKEND".to_string(),
                reason: format!("unknown backend {other:?}"),
            }),
        }
    }

    /// Backend name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Shared => "shared",
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Bind address for both servers.
    pub host: String,
    /// WebSocket and REST port.
    pub http_port: u16,
    /// Health check and metrics port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8090,
            health_port: 8091,
        }
    }
}

/// Session and keepalive settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Envelopes queued per session before backpressure applies.
    pub outbox_capacity: usize,
    /// Sessions silent for longer than this are expired.
    pub liveness_timeout: Duration,
    /// How often the sweeper looks for expired sessions.
    pub sweep_interval: Duration,
    /// How often the bridge pings every session.
    pub keepalive_interval: Duration,
    /// How long a critical fan-out waits for room in a client queue.
    pub critical_wait: Duration,
    /// Maximum envelopes returned per poll.
    pub poll_batch: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            outbox_capacity: 256,
            liveness_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(30),
            critical_wait: Duration::from_millis(250),
            poll_batch: 100,
        }
    }
}

/// Reconnection policy for the connector client.
#[derive(Debug, Clone)]
pub struct ReconnectSettings {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
    /// Randomize each sleep by up to a quarter of the delay.
    pub jitter: bool,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter: true,
        }
    }
}

impl ReconnectSettings {
    /// Read `BRIDGE_RECONNECT_*` variables over the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed.
    pub fn from_lookup(env: Lookup<'_>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            base_delay: millis(env, "BRIDGE_RECONNECT_BASE_MS", defaults.base_delay)?,
            max_delay: secs(env, "BRIDGE_RECONNECT_MAX_SECS", defaults.max_delay)?,
            max_attempts: parse(env, "BRIDGE_RECONNECT_MAX_ATTEMPTS", defaults.max_attempts)?,
            jitter: parse(env, "BRIDGE_RECONNECT_JITTER", defaults.jitter)?,
        })
    }
}

/// Trade execution settings.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// How long to wait for a connector's trade result.
    pub deadline: Duration,
    /// Trade submissions admitted per account and window.
    pub trade_limit: RateLimit,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(15),
            trade_limit: RateLimit::new(10, Duration::from_secs(1)),
        }
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    /// Window store strategy.
    pub backend: RateLimitBackend,
    /// Database file for the shared backend.
    pub shared_path: PathBuf,
    /// How long the shared backend waits on a locked database.
    pub busy_timeout: Duration,
    /// REST calls admitted per caller and window.
    pub api_limit: RateLimit,
    /// How often empty local windows are dropped.
    pub purge_interval: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            backend: RateLimitBackend::Local,
            shared_path: PathBuf::from("connector-bridge-windows.db"),
            busy_timeout: Duration::from_millis(250),
            api_limit: RateLimit::new(120, Duration::from_secs(60)),
            purge_interval: Duration::from_secs(60),
        }
    }
}

/// Static bearer tokens.
#[derive(Clone, Default)]
pub struct AuthSettings {
    /// Connector token to the account it is bound to.
    pub connector_tokens: HashMap<String, AccountId>,
    /// User token to the user and the accounts they may observe.
    pub user_tokens: HashMap<String, (UserId, HashSet<AccountId>)>,
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("connector_tokens", &format!("[REDACTED; {}]", self.connector_tokens.len()))
            .field("user_tokens", &format!("[REDACTED; {}]", self.user_tokens.len()))
            .finish()
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default)]
pub struct BridgeConfig {
    /// Server port settings.
    pub server: ServerSettings,
    /// Session and keepalive settings.
    pub session: SessionSettings,
    /// Connector client reconnection policy.
    pub reconnect: ReconnectSettings,
    /// Trade execution settings.
    pub execution: ExecutionSettings,
    /// Rate limiter settings.
    pub rate_limit: RateLimitSettings,
    /// Bearer tokens.
    pub auth: AuthSettings,
}

impl BridgeConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed.
    pub fn from_lookup(env: Lookup<'_>) -> Result<Self, ConfigError> {
        let server = ServerSettings {
            host: env("BRIDGE_HOST").unwrap_or_else(|| ServerSettings::default().host),
            http_port: parse(env, "BRIDGE_HTTP_PORT", ServerSettings::default().http_port)?,
            health_port: parse(env, "BRIDGE_HEALTH_PORT", ServerSettings::default().health_port)?,
        };

        let defaults = SessionSettings::default();
        let session = SessionSettings {
            outbox_capacity: parse(env, "BRIDGE_OUTBOX_CAPACITY", defaults.outbox_capacity)?,
            liveness_timeout: secs(env, "BRIDGE_LIVENESS_TIMEOUT_SECS", defaults.liveness_timeout)?,
            sweep_interval: secs(env, "BRIDGE_SWEEP_INTERVAL_SECS", defaults.sweep_interval)?,
            keepalive_interval: secs(env, "BRIDGE_KEEPALIVE_INTERVAL_SECS", defaults.keepalive_interval)?,
            critical_wait: millis(env, "BRIDGE_CRITICAL_WAIT_MS", defaults.critical_wait)?,
            poll_batch: parse(env, "BRIDGE_POLL_BATCH", defaults.poll_batch)?,
        };
        if session.outbox_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "BRIDGE_OUTBOX_CAPACITY".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        let reconnect = ReconnectSettings::from_lookup(env)?;

        let defaults = ExecutionSettings::default();
        let execution = ExecutionSettings {
            deadline: millis(env, "BRIDGE_EXECUTION_DEADLINE_MS", defaults.deadline)?,
            trade_limit: RateLimit::new(
                parse(env, "BRIDGE_TRADE_LIMIT", defaults.trade_limit.limit)?,
                millis(env, "BRIDGE_TRADE_WINDOW_MS", defaults.trade_limit.window)?,
            ),
        };

        let defaults = RateLimitSettings::default();
        let rate_limit = RateLimitSettings {
            backend: env("BRIDGE_RATE_LIMIT_BACKEND")
                .map(|s| RateLimitBackend::parse(&s))
                .transpose()?
                .unwrap_or_default(),
            shared_path: env("BRIDGE_RATE_LIMIT_PATH").map_or(defaults.shared_path, PathBuf::from),
            busy_timeout: millis(env, "BRIDGE_RATE_LIMIT_BUSY_TIMEOUT_MS", defaults.busy_timeout)?,
            api_limit: RateLimit::new(
                parse(env, "BRIDGE_API_LIMIT", defaults.api_limit.limit)?,
                secs(env, "BRIDGE_API_WINDOW_SECS", defaults.api_limit.window)?,
            ),
            purge_interval: secs(env, "BRIDGE_RATE_LIMIT_PURGE_SECS", defaults.purge_interval)?,
        };

        let auth = AuthSettings {
            connector_tokens: env("BRIDGE_CONNECTOR_TOKENS")
                .map(|raw| parse_connector_tokens(&raw))
                .transpose()?
                .unwrap_or_default(),
            user_tokens: env("BRIDGE_USER_TOKENS")
                .map(|raw| parse_user_tokens(&raw))
                .transpose()?
                .unwrap_or_default(),
        };

        Ok(Self {
            server,
            session,
            reconnect,
            execution,
            rate_limit,
            auth,
        })
    }

    /// `host:port` for the WebSocket and REST server.
    #[must_use]
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: String,
        /// What was wrong.
        reason: String,
    },
}

/// Parse `token=ACCOUNT;token2=ACCOUNT2`.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] for entries without a token or account.
pub fn parse_connector_tokens(raw: &str) -> Result<HashMap<String, AccountId>, ConfigError> {
    const KEY: &str = "BRIDGE_CONNECTOR_TOKENS";
    entries(raw)
        .map(|entry| {
            let (token, account) = split_pair(KEY, entry, '=')?;
            Ok((token.to_string(), AccountId::new(account)))
        })
        .collect()
}

/// Parse `token=user:ACC1,ACC2;token2=user2:ACC3`.
///
/// # Errors
///
/// Returns [`ConfigError::Invalid`] for entries without a token, user or
/// account list.
pub fn parse_user_tokens(
    raw: &str,
) -> Result<HashMap<String, (UserId, HashSet<AccountId>)>, ConfigError> {
    const KEY: &str = "BRIDGE_USER_TOKENS";
    entries(raw)
        .map(|entry| {
            let (token, grant) = split_pair(KEY, entry, '=')?;
            let (user, accounts) = split_pair(KEY, grant, ':')?;
            let accounts: HashSet<AccountId> = accounts
                .split(',')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(AccountId::new)
                .collect();
            if accounts.is_empty() {
                return Err(invalid(KEY, format!("no accounts for user {user}")));
            }
            Ok((token.to_string(), (UserId::new(user), accounts)))
        })
        .collect()
}

fn entries(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(';').map(str::trim).filter(|e| !e.is_empty())
}

fn split_pair<'a>(key: &str, entry: &'a str, sep: char) -> Result<(&'a str, &'a str), ConfigError> {
    let (left, right) = entry
        .split_once(sep)
        .ok_or_else(|| invalid(key, format!("expected '{sep}' in entry")))?;
    let (left, right) = (left.trim(), right.trim());
    if left.is_empty() || right.is_empty() {
        return Err(invalid(key, "entry has an empty side".to_string()));
    }
    Ok((left, right))
}

fn invalid(key: &str, reason: String) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason,
    }
}

fn parse<T>(env: Lookup<'_>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env(key) {
        None => Ok(default),
        Some(raw) if raw.trim().is_empty() => Err(ConfigError::EmptyValue(key.to_string())),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(key, e.to_string())),
    }
}

fn secs(env: Lookup<'_>, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse(env, key, default.as_secs()).map(Duration::from_secs)
}

fn millis(env: Lookup<'_>, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse(env, key, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_variables() {
        let config = BridgeConfig::from_lookup(&lookup(&[])).unwrap();
        assert_eq!(config.server.http_port, 8090);
        assert_eq!(config.session.outbox_capacity, 256);
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.execution.deadline, Duration::from_secs(15));
        assert_eq!(config.rate_limit.backend, RateLimitBackend::Local);
        assert!(config.auth.connector_tokens.is_empty());
    }

    #[test]
    fn reads_overrides() {
        let env = lookup(&[
            ("BRIDGE_HTTP_PORT", "9000"),
            ("BRIDGE_EXECUTION_DEADLINE_MS", "2500"),
            ("BRIDGE_RATE_LIMIT_BACKEND", "shared"),
            ("BRIDGE_RATE_LIMIT_PATH", "/tmp/windows.db"),
            ("BRIDGE_RECONNECT_JITTER", "false"),
        ]);
        let config = BridgeConfig::from_lookup(&env).unwrap();
        assert_eq!(config.http_addr(), "0.0.0.0:9000");
        assert_eq!(config.execution.deadline, Duration::from_millis(2500));
        assert_eq!(config.rate_limit.backend, RateLimitBackend::Shared);
        assert_eq!(config.rate_limit.shared_path, PathBuf::from("/tmp/windows.db"));
        assert!(!config.reconnect.jitter);
    }

    #[test]
    fn malformed_number_is_an_error() {
        let env = lookup(&[("BRIDGE_HTTP_PORT", "eighty")]);
        assert!(matches!(
            BridgeConfig::from_lookup(&env),
            Err(ConfigError::Invalid { .. })
        ));

        let env = lookup(&[("BRIDGE_POLL_BATCH", " ")]);
        assert!(matches!(
            BridgeConfig::from_lookup(&env),
            Err(ConfigError::EmptyValue(_))
        ));
    }

    #[test]
    fn unknown_backend_is_an_error() {
        assert!(RateLimitBackend::parse("redis").is_err());
        assert_eq!(RateLimitBackend::parse("SQLite").unwrap(), RateLimitBackend::Shared);
    }

    #[test]
    fn parses_connector_tokens() {
        let tokens = parse_connector_tokens("abc=ACC-1; def = ACC-2 ;").unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens["def"], AccountId::new("ACC-2"));
        assert!(parse_connector_tokens("abc").is_err());
        assert!(parse_connector_tokens("=ACC").is_err());
    }

    #[test]
    fn parses_user_tokens() {
        let tokens = parse_user_tokens("u1tok=alice:ACC-1,ACC-2;u2tok=bob:ACC-3").unwrap();
        let (user, accounts) = &tokens["u1tok"];
        assert_eq!(user, &UserId::new("alice"));
        assert!(accounts.contains(&AccountId::new("ACC-2")));
        assert!(parse_user_tokens("tok=alice:").is_err());
        assert!(parse_user_tokens("tok=alice").is_err());
    }

    #[test]
    fn auth_debug_is_redacted() {
        let auth = AuthSettings {
            connector_tokens: parse_connector_tokens("secret-token=ACC").unwrap(),
            user_tokens: HashMap::new(),
        };
        let debug = format!("{auth:?}");
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("REDACTED"));
    }
}
