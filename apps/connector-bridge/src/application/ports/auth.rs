//! Bearer-token authentication.

use std::collections::HashSet;

use thiserror::Error;

use crate::domain::identity::{AccountId, UserId};

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No token was presented.
    #[error("missing credentials")]
    Missing,

    /// Token is not recognized.
    #[error("invalid credentials")]
    Invalid,

    /// Token is valid for the other side of the bridge.
    #[error("credentials not valid for this endpoint")]
    WrongRole,
}

/// Who a token belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// A connector allowed to bind one account.
    Connector {
        /// Account the connector may serve.
        account_id: AccountId,
    },
    /// A dashboard user.
    User {
        /// User id.
        user_id: UserId,
        /// Accounts the user may observe and trade.
        accounts: HashSet<AccountId>,
    },
}

/// Resolves bearer tokens.
pub trait Authenticator: Send + Sync {
    /// Resolve a token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Invalid`] for unknown tokens.
    fn authenticate(&self, token: &str) -> Result<Principal, AuthError>;

    /// Resolve a connector token to its account.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::WrongRole`] for user tokens.
    fn connector(&self, token: &str) -> Result<AccountId, AuthError> {
        match self.authenticate(token)? {
            Principal::Connector { account_id } => Ok(account_id),
            Principal::User { .. } => Err(AuthError::WrongRole),
        }
    }

    /// Resolve a user token to its id and account set.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::WrongRole`] for connector tokens.
    fn user(&self, token: &str) -> Result<(UserId, HashSet<AccountId>), AuthError> {
        match self.authenticate(token)? {
            Principal::User { user_id, accounts } => Ok((user_id, accounts)),
            Principal::Connector { .. } => Err(AuthError::WrongRole),
        }
    }
}
