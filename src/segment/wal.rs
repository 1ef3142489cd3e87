use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cache::{CachePage, MappedPageListener};
use crate::error::Result;
use crate::segment::{Segment, SegmentId, SegmentRef};
use crate::types::{AllocationOrder, BlockId, CheckpointType, PageId, PageOwnerId};

/// Log-segment decorator that tracks which log pages are dirty.
///
/// Its single product is [`min_dirty_page_id`](Self::min_dirty_page_id):
/// the oldest log page not yet durable, which is the frontier the
/// write-ahead rule is checked against. Dirty pages are keyed by block so
/// that unmap events arriving after the ring window has moved still clear
/// the right entry.
pub struct WalSegment {
    id: SegmentId,
    delegate: SegmentRef,
    dirty: Mutex<FxHashMap<BlockId, PageId>>,
}

impl WalSegment {
    /// Wraps the physical log segment `delegate`.
    pub fn new(delegate: SegmentRef) -> Arc<Self> {
        Arc::new(Self {
            id: SegmentId::next(),
            delegate,
            dirty: Mutex::new(FxHashMap::default()),
        })
    }

    /// The oldest dirty log page, or `None` when the whole log is durable.
    pub fn min_dirty_page_id(&self) -> Option<PageId> {
        self.dirty.lock().values().min().copied()
    }

    /// Number of log pages with unflushed contents.
    pub fn dirty_page_count(&self) -> usize {
        self.dirty.lock().len()
    }
}

impl MappedPageListener for WalSegment {
    fn notify_page_map(&self, page: &mut CachePage) {
        self.delegate.notify_page_map(page);
    }

    fn notify_page_unmap(&self, page: &mut CachePage) {
        if page.is_dirty() {
            self.dirty.lock().remove(&page.block_id());
        }
        self.delegate.notify_page_unmap(page);
    }

    fn notify_after_page_read(&self, page: &mut CachePage) -> Result<()> {
        self.delegate.notify_after_page_read(page)
    }

    fn notify_page_dirty(&self, page: &mut CachePage, data_was_valid: bool) -> Result<()> {
        self.delegate.notify_page_dirty(page, data_was_valid)?;
        let block_id = page.block_id();
        let page_id = self.translate_block_id(block_id)?;
        self.dirty.lock().insert(block_id, page_id);
        Ok(())
    }

    fn notify_before_page_flush(&self, page: &mut CachePage) -> Result<()> {
        self.delegate.notify_before_page_flush(page)
    }

    fn notify_after_page_flush(&self, page: &CachePage) {
        self.dirty.lock().remove(&page.block_id());
        self.delegate.notify_after_page_flush(page);
    }

    fn notify_after_page_checkpoint_flush(&self, page: &CachePage) {
        self.delegate.notify_after_page_checkpoint_flush(page);
    }

    fn can_flush_page(&self, page: &CachePage) -> bool {
        self.delegate.can_flush_page(page)
    }
}

impl Segment for WalSegment {
    fn segment_id(&self) -> SegmentId {
        self.id
    }

    fn allocation_order(&self) -> AllocationOrder {
        self.delegate.allocation_order()
    }

    fn translate_page_id(&self, page_id: PageId) -> Result<BlockId> {
        self.delegate.translate_page_id(page_id)
    }

    fn translate_block_id(&self, block_id: BlockId) -> Result<PageId> {
        self.delegate.translate_block_id(block_id)
    }

    fn allocate_page_id(&self, owner_id: PageOwnerId) -> Result<Option<PageId>> {
        self.delegate.allocate_page_id(owner_id)
    }

    fn deallocate_page_range(&self, start: Option<PageId>, end: Option<PageId>) -> Result<()> {
        self.delegate.deallocate_page_range(start, end)
    }

    fn is_page_id_allocated(&self, page_id: PageId) -> bool {
        self.delegate.is_page_id_allocated(page_id)
    }

    fn allocated_size_in_pages(&self) -> u64 {
        self.delegate.allocated_size_in_pages()
    }

    fn ensure_allocated_size(&self, n_pages: u64) -> Result<bool> {
        self.delegate.ensure_allocated_size(n_pages)
    }

    fn page_successor(&self, page_id: PageId) -> Result<Option<PageId>> {
        self.delegate.page_successor(page_id)
    }

    fn set_page_successor(&self, page_id: PageId, successor: Option<PageId>) -> Result<()> {
        self.delegate.set_page_successor(page_id, successor)
    }

    fn usable_page_size(&self) -> usize {
        self.delegate.usable_page_size()
    }

    fn delegated_checkpoint(
        &self,
        requester: SegmentId,
        checkpoint_type: CheckpointType,
    ) -> Result<()> {
        self.delegate.delegated_checkpoint(requester, checkpoint_type)
    }
}
