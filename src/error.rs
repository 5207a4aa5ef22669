//! Error types and handling for the page store adaptor

use thiserror::Error;

use crate::lsn::Lsn;

/// Result type alias for page store operations
pub type Result<T> = std::result::Result<T, PageStoreError>;

/// Main error type for the page store adaptor
///
/// Transport failures never surface here: they are handled inside the
/// prefetch pipeline by resetting it and retrying at the operation boundary.
#[derive(Error, Debug)]
pub enum PageStoreError {
    /// I/O errors from the local storage fallback
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The page server answered a request with an error message
    #[error("could not read {what} from page server at lsn {lsn}: {message}")]
    PageServer {
        /// What was being read, including the relation/fork/block context
        what: String,
        /// The LSN the failed request was stamped with
        lsn: Lsn,
        /// The error message returned by the page server
        message: String,
    },

    /// Wire protocol violation: unknown tag, truncated body, trailing bytes.
    /// Fatal to the backend; callers must not catch and continue.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation
        message: String,
    },

    /// A state-machine impossibility or violated internal contract
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violated contract
        message: String,
    },

    /// Relation extension would exceed the configured cluster size limit
    #[error("could not extend file because cluster size limit ({limit_mb} MB) has been exceeded")]
    ClusterSizeExceeded {
        /// The configured limit in megabytes
        limit_mb: u64,
    },

    /// A relation persistence byte that is none of the known values
    #[error("unknown relpersistence '{value}'")]
    UnknownPersistence {
        /// The unrecognized persistence byte
        value: char,
    },

    /// An operation that is not permitted for a relation whose persistence
    /// has not been resolved yet
    #[error("cannot {operation} relation with unknown persistence")]
    UnsupportedOperation {
        /// Name of the rejected operation
        operation: &'static str,
    },

    /// Invalid configuration parameter
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message describing the configuration issue
        message: String,
    },
}

impl PageStoreError {
    /// Create a new page-server error with request context
    pub fn page_server(what: impl Into<String>, lsn: Lsn, message: impl Into<String>) -> Self {
        Self::PageServer {
            what: what.into(),
            lsn,
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new unsupported-operation error
    pub fn unsupported(operation: &'static str) -> Self {
        Self::UnsupportedOperation { operation }
    }

    /// Check if this error may go away when the operation is retried
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::PageServer { .. })
    }

    /// Check if this error is fatal to the backend
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Protocol { .. } | Self::Internal { .. })
    }

    /// Check if this error is a policy rejection rather than a failure
    pub fn is_policy_error(&self) -> bool {
        matches!(
            self,
            Self::ClusterSizeExceeded { .. }
                | Self::UnknownPersistence { .. }
                | Self::UnsupportedOperation { .. }
                | Self::InvalidConfig { .. }
        )
    }
}

/// Convenience macro for creating protocol errors
#[macro_export]
macro_rules! protocol_error {
    ($($arg:tt)*) => {
        $crate::error::PageStoreError::protocol(format!($($arg)*))
    };
}

/// Convenience macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::error::PageStoreError::internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PageStoreError::config("test message");
        assert!(matches!(err, PageStoreError::InvalidConfig { .. }));
        assert!(err.is_policy_error());
    }

    #[test]
    fn test_error_classification() {
        let proto = PageStoreError::protocol("trailing bytes");
        assert!(proto.is_fatal());
        assert!(!proto.is_recoverable());

        let server = PageStoreError::page_server("block 7 in rel 1663/5/16384.0", Lsn(0x100), "not found");
        assert!(server.is_recoverable());
        assert!(!server.is_fatal());
        assert!(!server.is_policy_error());

        let limit = PageStoreError::ClusterSizeExceeded { limit_mb: 100 };
        assert!(limit.is_policy_error());
    }

    #[test]
    fn test_error_macros() {
        let err = protocol_error!("unknown tag 0x{:02x}", 0x42);
        assert!(matches!(err, PageStoreError::Protocol { .. }));

        let err = internal_error!("phase {:?} is impossible here", 3);
        assert!(matches!(err, PageStoreError::Internal { .. }));
    }

    #[test]
    fn test_page_server_error_message() {
        let err = PageStoreError::page_server("db size of db 5", Lsn(0x1_0000_0010), "oops");
        let text = err.to_string();
        assert!(text.contains("db size of db 5"));
        assert!(text.contains("1/10"));
        assert!(text.contains("oops"));
    }
}
