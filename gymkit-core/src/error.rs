//! Error types for the environment API

use thiserror::Error;

/// Core error type for environment operations
#[derive(Error, Debug)]
pub enum GymError {
    /// Environment-related errors
    #[error("Environment error: {0}")]
    Environment(String),

    /// Invalid action
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    /// Dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimensionality
        expected: usize,
        /// Actual dimensionality
        actual: usize,
    },

    /// Environment ID does not match `[namespace/]name[-vN]`
    #[error("Malformed environment ID: {0}")]
    MalformedId(String),

    /// No environment registered under the requested ID
    #[error("Environment `{id}` doesn't exist.{}", .suggestion.as_ref().map(|s| format!(" Did you mean: `{s}`?")).unwrap_or_default())]
    Unregistered {
        /// The ID that was looked up
        id: String,
        /// Closest registered namespace or name, if any
        suggestion: Option<String>,
    },

    /// Requested version is newer than anything registered
    #[error("Environment version `v{version}` for `{name}` doesn't exist. It provides versioned environments: [ {known_versions} ].")]
    VersionNotFound {
        /// Namespaced environment name
        name: String,
        /// The version that was requested
        version: u32,
        /// Registered versions, formatted as `` `v0`, `v1` ``
        known_versions: String,
    },

    /// Requested version has been superseded or the name is unversioned
    #[error("Deprecated environment: {0}")]
    DeprecatedEnv(String),

    /// Registration conflicts (duplicate or versioned/unversioned clash)
    #[error("Registration error: {0}")]
    Registration(String),

    /// Render mode not supported by the environment
    #[error("Invalid render_mode provided: {mode}. Valid render_modes: {valid_modes}")]
    InvalidRenderMode {
        /// The mode that was requested
        mode: String,
        /// Supported modes, `None` first
        valid_modes: String,
    },

    /// `step` was called before `reset`
    #[error("Cannot call env.step() before calling env.reset()")]
    ResetNeeded,

    /// A vectorized call was issued while another is in flight
    #[error("{0}")]
    AlreadyPending(String),

    /// A `*_wait` was called without the matching `*_async`
    #[error("{0}")]
    NoPendingCall(String),

    /// The vectorized environment has been closed
    #[error("Trying to operate on `{0}` after a call to `close()`")]
    ClosedEnvironment(String),

    /// A `*_wait` call ran past its deadline
    #[error("{0}")]
    Timeout(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for environment operations
pub type Result<T> = std::result::Result<T, GymError>;
