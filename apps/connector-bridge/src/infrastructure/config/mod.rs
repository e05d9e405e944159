//! Configuration Module
//!
//! Configuration loading for the bridge service.

mod settings;

pub use settings::{
    AuthSettings, BridgeConfig, ConfigError, ExecutionSettings, Lookup, RateLimitBackend,
    RateLimitSettings, ReconnectSettings, ServerSettings, SessionSettings,
    parse_connector_tokens, parse_user_tokens,
};
