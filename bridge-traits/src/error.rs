use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Whether the failure is tied to the transport and may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            BridgeError::Timeout(_) | BridgeError::Connection(_) => true,
            BridgeError::Http { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(BridgeError::Timeout("read".into()).is_transient());
        assert!(BridgeError::Connection("reset".into()).is_transient());
        assert!(BridgeError::Http {
            status: 503,
            message: "busy".into()
        }
        .is_transient());
        assert!(BridgeError::Http {
            status: 429,
            message: "slow down".into()
        }
        .is_transient());
        assert!(!BridgeError::Http {
            status: 404,
            message: "gone".into()
        }
        .is_transient());
        assert!(!BridgeError::NotFound("item".into()).is_transient());
    }
}
