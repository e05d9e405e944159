//! Bearer Token Authentication
//!
//! Static token tables loaded from configuration. Connector tokens bind a
//! connector to exactly one account; user tokens carry the set of accounts a
//! dashboard user may observe and trade.
//!
//! # Credential Flow
//!
//! 1. Caller opens `/ws/connector`, `/ws/client` or a REST route
//! 2. `Authorization: Bearer <token>` (or `?token=` for browsers that cannot
//!    set headers on a WebSocket upgrade) is extracted
//! 3. The token is resolved to a [`Principal`]; role mismatches are refused

use std::collections::{HashMap, HashSet};

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

use crate::application::ports::{AuthError, Authenticator, Principal};
use crate::domain::identity::{AccountId, UserId};
use crate::infrastructure::config::AuthSettings;

/// Authenticator over fixed token tables.
#[derive(Clone, Default)]
pub struct StaticTokenAuthenticator {
    connectors: HashMap<String, AccountId>,
    users: HashMap<String, (UserId, HashSet<AccountId>)>,
}

impl std::fmt::Debug for StaticTokenAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticTokenAuthenticator")
            .field("connectors", &self.connectors.len())
            .field("users", &self.users.len())
            .finish()
    }
}

impl StaticTokenAuthenticator {
    /// Build from configured token tables.
    #[must_use]
    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self {
            connectors: settings.connector_tokens.clone(),
            users: settings.user_tokens.clone(),
        }
    }

    /// Add a connector token.
    #[must_use]
    pub fn with_connector(mut self, token: impl Into<String>, account: AccountId) -> Self {
        self.connectors.insert(token.into(), account);
        self
    }

    /// Add a user token.
    #[must_use]
    pub fn with_user(
        mut self,
        token: impl Into<String>,
        user: UserId,
        accounts: impl IntoIterator<Item = AccountId>,
    ) -> Self {
        self.users
            .insert(token.into(), (user, accounts.into_iter().collect()));
        self
    }

    /// Whether no token is configured at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty() && self.users.is_empty()
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, token: &str) -> Result<Principal, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        if let Some(account_id) = self.connectors.get(token) {
            return Ok(Principal::Connector {
                account_id: account_id.clone(),
            });
        }
        self.users
            .get(token)
            .map(|(user_id, accounts)| Principal::User {
                user_id: user_id.clone(),
                accounts: accounts.clone(),
            })
            .ok_or(AuthError::Invalid)
    }
}

/// Extract a bearer token from the `Authorization` header, falling back to
/// a `token` query parameter.
///
/// # Errors
///
/// Returns [`AuthError::Missing`] if neither carries a token.
pub fn bearer_token<'a>(
    headers: &'a HeaderMap,
    query_token: Option<&'a str>,
) -> Result<&'a str, AuthError> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            value
                .strip_prefix("Bearer ")
                .or_else(|| value.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|token| !token.is_empty());

    from_header
        .or_else(|| query_token.map(str::trim).filter(|token| !token.is_empty()))
        .ok_or(AuthError::Missing)
}
