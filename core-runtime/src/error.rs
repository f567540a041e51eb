use thiserror::Error;

/// Failures while assembling or validating the runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid [`CoreConfig`](crate::CoreConfig) or logging setup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A host capability was neither injected nor available as a platform default.
    #[error("Capability missing: {capability} - {message}")]
    CapabilityMissing { capability: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
