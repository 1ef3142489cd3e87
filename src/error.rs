//! Error types surfaced by the segment layer.

use std::io;

use thiserror::Error;

use crate::types::{BlockId, DeviceId, PageId};

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SegmentError>;

/// Errors surfaced by the segment layer.
///
/// Capacity exhaustion is deliberately *not* represented here: a full
/// segment reports it by returning `Ok(None)` from `allocate_page_id`, and
/// callers recover by checkpointing and retrying. The variants below cover
/// hard I/O failures, corruption, and caller contract violations.
#[derive(Debug, Error)]
pub enum SegmentError {
    /// Device read/write/resize/flush failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Persistent state that fails validation.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// A page id outside the segment's allocated address space.
    #[error("page id {0:?} is not allocated in this segment")]
    UnallocatedPage(PageId),
    /// A block id that no page of this segment maps to.
    #[error("block id {0:?} does not belong to this segment")]
    ForeignBlock(BlockId),
    /// A device id with no registration in the page cache.
    #[error("device {0:?} is not registered with the cache")]
    UnknownDevice(DeviceId),
    /// Caller passed a value outside the operation's domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation the segment kind does not support (e.g. interior
    /// deallocation on a linear segment).
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    /// Caller broke a sequencing contract (e.g. recovering into a segment
    /// with live shadow-log state).
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    /// The shadow log could not accommodate a before-image.
    #[error("shadow log is full")]
    LogFull,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert() {
        fn fails() -> Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "boom"))?;
            Ok(())
        }
        assert!(matches!(fails(), Err(SegmentError::Io(_))));
    }

    #[test]
    fn display_names_the_page() {
        let err = SegmentError::UnallocatedPage(PageId(7));
        assert!(err.to_string().contains("PageId(7)"));
    }
}
