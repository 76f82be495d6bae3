use thiserror::Error;

use crate::state::PluginState;

/// Errors from the plugin runtime.
#[derive(Debug, Error)]
pub enum PluginError {
    /// Container bytes are structurally invalid.
    #[error("invalid plugin file: {0}")]
    InvalidFile(String),

    /// Embedded signature did not verify.
    #[error("plugin signature verification failed")]
    BadSignature,

    /// Trailing checksum does not match the content.
    #[error("plugin checksum mismatch")]
    ChecksumMismatch,

    /// Metadata failed validation.
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Dependency graph problems.
    #[error("circular dependency involving '{0}'")]
    CircularDependency(String),

    #[error("missing dependency '{dependency}' required by '{plugin}'")]
    MissingDependency { plugin: String, dependency: String },

    #[error("dependency '{dependency}' of '{plugin}' is {installed}, required {required}")]
    DependencyVersionMismatch {
        plugin: String,
        dependency: String,
        installed: String,
        required: String,
    },

    /// Transition not on the allowed state graph.
    #[error("invalid state transition {from:?} -> {to:?} for '{plugin}'")]
    InvalidTransition {
        plugin: String,
        from: PluginState,
        to: PluginState,
    },

    #[error("unknown plugin '{0}'")]
    UnknownPlugin(String),

    /// The plugin's worker crashed; dependents are refused until recovery.
    #[error("plugin '{0}' crashed")]
    Crashed(String),

    /// A hook handler reported failure; blocking hooks abort the caller.
    #[error("hook failed in plugin '{plugin}': {reason}")]
    HookFailed { plugin: String, reason: String },

    /// A reindex step was refused by a plugin; node startup aborts.
    #[error("reindex refused by plugin '{0}'")]
    ReindexRefused(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the plugin-facing APIs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PluginApiError {
    #[error("BLOCKCHAIN_{area}_NOT_PERMITTED")]
    BlockchainNotPermitted { area: &'static str },

    #[error("COLLECTION_NOT_PERMITTED: {0}")]
    CollectionNotPermitted(String),

    #[error("Access denied")]
    AccessDenied,

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("db error: {0}")]
    Db(String),
}
