//! Ombra: page-addressable segment storage with shadow-paged versioning.
//!
//! The crate maps logical, fixed-size page spaces onto block devices and
//! layers write-ahead-logged, versioned page updates on top, so a database
//! kernel can recover a consistent image after a crash. The segment
//! decorator chain (linear device leaf, random allocation, circular log
//! reclamation, WAL dirty tracking, versioned shadow paging) is the core;
//! the page cache and block devices are supporting collaborators.

#![warn(missing_docs)]

pub mod cache;
pub mod device;
pub mod error;
pub mod segment;
pub mod types;

pub use cache::{CachePage, FuzzyCheckpointSet, MappedPageListener, PageCache, PageGuard};
pub use error::{Result, SegmentError};
pub use segment::{
    CheckpointProvider, CircularSegment, DelegatingSegment, LinearDeviceSegment,
    LinearSegmentOptions, LinearViewSegment, RandomAllocationSegment, RandomSegmentOptions,
    Segment, SegmentBuilder, SegmentId, SegmentRef, TracingSegment, VersionedSegment, WalSegment,
};
pub use types::{
    AllocationOrder, BlockId, CheckpointType, DeviceId, PageId, PageOwnerId, PseudoUuid,
    SegVersionNum,
};
