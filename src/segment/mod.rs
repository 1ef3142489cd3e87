#![forbid(unsafe_code)]

//! The segment family: page-address-space abstractions over block devices.
//!
//! A [`Segment`] maps a logical page space onto physical blocks and keeps
//! its own allocation bookkeeping; all actual I/O goes through the page
//! cache. Decorator segments wrap exactly one delegate and forward the
//! full contract, layering versioning, ring reclamation or WAL tracking on
//! top of a device-backed leaf.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::MappedPageListener;
use crate::error::Result;
use crate::types::{AllocationOrder, BlockId, CheckpointType, PageId, PageOwnerId};

mod builder;
mod circular;
mod delegating;
mod linear;
mod random;
mod versioned;
mod view;
mod wal;

pub use builder::SegmentBuilder;
pub use circular::{CheckpointProvider, CircularSegment};
pub use delegating::{DelegatingSegment, TracingSegment};
pub use linear::{LinearDeviceSegment, LinearSegmentOptions};
pub use random::{RandomAllocationSegment, RandomSegmentOptions};
pub use versioned::{VersionedPageFooter, VersionedSegment, FOOTER_LEN};
pub use view::LinearViewSegment;
pub use wal::WalSegment;

/// Shared handle to a segment in a decorator chain.
pub type SegmentRef = Arc<dyn Segment>;

/// Process-unique identity of one segment instance. The cache's listener
/// registry and checkpoint predicates compare segments by id rather than
/// by pointer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SegmentId(u64);

static NEXT_SEGMENT_ID: AtomicU64 = AtomicU64::new(1);

impl SegmentId {
    pub(crate) fn next() -> Self {
        SegmentId(NEXT_SEGMENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Page-address-space contract shared by every segment kind.
///
/// Implementations confine side effects to their own bookkeeping; device
/// I/O happens only through the page cache. All methods take `&self`;
/// mutable state lives behind each segment's internal lock, which is never
/// held across a cache or device call.
pub trait Segment: MappedPageListener {
    /// This segment's instance identity.
    fn segment_id(&self) -> SegmentId;

    /// How this segment hands out page ids.
    fn allocation_order(&self) -> AllocationOrder;

    /// Maps an allocated page id to its physical block.
    fn translate_page_id(&self, page_id: PageId) -> Result<BlockId>;

    /// Maps a physical block back to the page id that owns it.
    fn translate_block_id(&self, block_id: BlockId) -> Result<PageId>;

    /// Allocates one page tagged with `owner_id`. `Ok(None)` means the
    /// segment is out of space; callers may checkpoint and retry.
    fn allocate_page_id(&self, owner_id: PageOwnerId) -> Result<Option<PageId>>;

    /// Deallocates the inclusive page run from `start` to `end`. `None`
    /// for `start` means "from the beginning"; `None` for `end` means "to
    /// the end". Segment kinds support different range shapes and reject
    /// the rest as [`SegmentError::Unsupported`](crate::SegmentError).
    fn deallocate_page_range(&self, start: Option<PageId>, end: Option<PageId>) -> Result<()>;

    /// True if `page_id` is currently allocated here.
    fn is_page_id_allocated(&self, page_id: PageId) -> bool;

    /// Number of pages currently allocated.
    fn allocated_size_in_pages(&self) -> u64;

    /// Grows the segment to hold at least `n_pages`, extending the backing
    /// device if permitted. `Ok(false)` means the size cap was hit.
    fn ensure_allocated_size(&self, n_pages: u64) -> Result<bool>;

    /// Forward chain link of `page_id`, for segments that define one.
    fn page_successor(&self, page_id: PageId) -> Result<Option<PageId>>;

    /// Sets the forward chain link of `page_id`. Only meaningful for
    /// segments that persist successor links.
    fn set_page_successor(&self, page_id: PageId, successor: Option<PageId>) -> Result<()>;

    /// Page bytes available to clients; decorators that reserve trailer
    /// space report less than the full page size.
    fn usable_page_size(&self) -> usize;

    /// Propagates a checkpoint down the chain on behalf of `requester`,
    /// the outermost segment whose mapped pages are being checkpointed.
    fn delegated_checkpoint(
        &self,
        requester: SegmentId,
        checkpoint_type: CheckpointType,
    ) -> Result<()>;

    /// Checkpoint entry point on the outermost segment of a chain.
    fn checkpoint(&self, checkpoint_type: CheckpointType) -> Result<()> {
        self.delegated_checkpoint(self.segment_id(), checkpoint_type)
    }
}

/// Successor in a dense linear page space: the next page id, or `None`
/// at the end of the allocated range.
pub(crate) fn linear_page_successor(page_id: PageId, n_pages: u64) -> Option<PageId> {
    if page_id.0 + 1 < n_pages {
        Some(PageId(page_id.0 + 1))
    } else {
        None
    }
}
