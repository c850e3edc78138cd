//! Crate-wide error types.

use thiserror::Error;

use crate::storage::page::PageId;

/// Errors surfaced by the store.
///
/// A missing key is not an error: lookups return `Ok(None)`.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying storage read/write failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A page's checksum did not match on read. Fatal for that page.
    #[error("corrupt page {page}: {reason}")]
    Corruption { page: PageId, reason: String },

    /// Another write transaction is active. Retryable.
    #[error("store is busy: {0}")]
    Busy(&'static str),

    /// The metadata page could not be restored at open time.
    #[error("recovery failed: {0}")]
    Recovery(String),

    /// API misuse: operating on a closed handle or finished transaction.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The key exceeds the per-page key size limit.
    #[error("key of {len} bytes exceeds the limit of {max} bytes")]
    KeyTooLarge { len: usize, max: usize },
}

impl StoreError {
    /// Returns true if the operation may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_))
    }

    fn corrupt(page: PageId, reason: impl Into<String>) -> Self {
        Self::Corruption {
            page,
            reason: reason.into(),
        }
    }
}

/// Constructs a `Corruption` error for the given page.
pub fn corruption(page: PageId, reason: impl Into<String>) -> StoreError {
    StoreError::corrupt(page, reason)
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(StoreError::Busy("writer active").is_retryable());
        assert!(!StoreError::InvalidState("closed").is_retryable());
        assert!(!corruption(PageId(3), "bad checksum").is_retryable());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: StoreError = io.into();
        match err {
            StoreError::Io(inner) => assert_eq!(inner.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_display() {
        let err = corruption(PageId(7), "checksum mismatch");
        assert_eq!(err.to_string(), "corrupt page page 7: checksum mismatch");
    }
}
