use std::sync::Arc;

use tracing::trace;

use crate::cache::{CachePage, MappedPageListener};
use crate::error::Result;
use crate::segment::{Segment, SegmentId, SegmentRef};
use crate::types::{AllocationOrder, BlockId, CheckpointType, PageId, PageOwnerId};

/// Pure forwarding decorator: every operation calls the identical
/// operation on the inner segment and returns its result unchanged.
///
/// Concrete decorators (circular, WAL, versioned) follow the same shape,
/// overriding only the operations they change. A delegating segment is
/// transparent to the cache: it reports its delegate's identity, so
/// checkpoint predicates and listener comparisons see one segment.
pub struct DelegatingSegment {
    delegate: SegmentRef,
}

impl DelegatingSegment {
    /// Wraps `delegate`.
    pub fn new(delegate: SegmentRef) -> Arc<Self> {
        Arc::new(Self { delegate })
    }

    /// The wrapped segment.
    pub fn delegate(&self) -> &SegmentRef {
        &self.delegate
    }
}

impl MappedPageListener for DelegatingSegment {
    fn notify_page_map(&self, page: &mut CachePage) {
        self.delegate.notify_page_map(page);
    }

    fn notify_page_unmap(&self, page: &mut CachePage) {
        self.delegate.notify_page_unmap(page);
    }

    fn notify_after_page_read(&self, page: &mut CachePage) -> Result<()> {
        self.delegate.notify_after_page_read(page)
    }

    fn notify_page_dirty(&self, page: &mut CachePage, data_was_valid: bool) -> Result<()> {
        self.delegate.notify_page_dirty(page, data_was_valid)
    }

    fn notify_before_page_flush(&self, page: &mut CachePage) -> Result<()> {
        self.delegate.notify_before_page_flush(page)
    }

    fn notify_after_page_flush(&self, page: &CachePage) {
        self.delegate.notify_after_page_flush(page);
    }

    fn notify_after_page_checkpoint_flush(&self, page: &CachePage) {
        self.delegate.notify_after_page_checkpoint_flush(page);
    }

    fn can_flush_page(&self, page: &CachePage) -> bool {
        self.delegate.can_flush_page(page)
    }
}

impl Segment for DelegatingSegment {
    fn segment_id(&self) -> SegmentId {
        self.delegate.segment_id()
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

/// Forwarding decorator that emits a trace record for each call.
///
/// Instrumentation must never change semantics: results and errors pass
/// through untouched, and no call is added or suppressed.
pub struct TracingSegment {
    label: &'static str,
    delegate: SegmentRef,
}

impl TracingSegment {
    /// Wraps `delegate`, tagging trace records with `label`.
    pub fn new(label: &'static str, delegate: SegmentRef) -> Arc<Self> {
        Arc::new(Self { label, delegate })
    }
}

impl MappedPageListener for TracingSegment {
    fn notify_page_map(&self, page: &mut CachePage) {
        trace!(target: "ombra::segment", segment = self.label, block = page.block_id().block, "segment.notify_page_map");
        self.delegate.notify_page_map(page);
    }

    fn notify_page_unmap(&self, page: &mut CachePage) {
        trace!(target: "ombra::segment", segment = self.label, block = page.block_id().block, "segment.notify_page_unmap");
        self.delegate.notify_page_unmap(page);
    }

    fn notify_after_page_read(&self, page: &mut CachePage) -> Result<()> {
        trace!(target: "ombra::segment", segment = self.label, block = page.block_id().block, "segment.notify_after_page_read");
        self.delegate.notify_after_page_read(page)
    }

    fn notify_page_dirty(&self, page: &mut CachePage, data_was_valid: bool) -> Result<()> {
        trace!(target: "ombra::segment", segment = self.label, block = page.block_id().block, data_was_valid, "segment.notify_page_dirty");
        self.delegate.notify_page_dirty(page, data_was_valid)
    }

    fn notify_before_page_flush(&self, page: &mut CachePage) -> Result<()> {
        trace!(target: "ombra::segment", segment = self.label, block = page.block_id().block, "segment.notify_before_page_flush");
        self.delegate.notify_before_page_flush(page)
    }

    fn notify_after_page_flush(&self, page: &CachePage) {
        trace!(target: "ombra::segment", segment = self.label, block = page.block_id().block, "segment.notify_after_page_flush");
        self.delegate.notify_after_page_flush(page);
    }

    fn notify_after_page_checkpoint_flush(&self, page: &CachePage) {
        trace!(target: "ombra::segment", segment = self.label, block = page.block_id().block, "segment.notify_after_page_checkpoint_flush");
        self.delegate.notify_after_page_checkpoint_flush(page);
    }

    fn can_flush_page(&self, page: &CachePage) -> bool {
        let verdict = self.delegate.can_flush_page(page);
        trace!(target: "ombra::segment", segment = self.label, block = page.block_id().block, verdict, "segment.can_flush_page");
        verdict
    }
}

impl Segment for TracingSegment {
    fn segment_id(&self) -> SegmentId {
        self.delegate.segment_id()
    }

    fn allocation_order(&self) -> AllocationOrder {
        self.delegate.allocation_order()
    }

    fn translate_page_id(&self, page_id: PageId) -> Result<BlockId> {
        trace!(target: "ombra::segment", segment = self.label, page = page_id.0, "segment.translate_page_id");
        self.delegate.translate_page_id(page_id)
    }

    fn translate_block_id(&self, block_id: BlockId) -> Result<PageId> {
        trace!(target: "ombra::segment", segment = self.label, block = block_id.block, "segment.translate_block_id");
        self.delegate.translate_block_id(block_id)
    }

    fn allocate_page_id(&self, owner_id: PageOwnerId) -> Result<Option<PageId>> {
        let allocated = self.delegate.allocate_page_id(owner_id)?;
        trace!(target: "ombra::segment", segment = self.label, page = ?allocated, "segment.allocate_page_id");
        Ok(allocated)
    }

    fn deallocate_page_range(&self, start: Option<PageId>, end: Option<PageId>) -> Result<()> {
        trace!(target: "ombra::segment", segment = self.label, start = ?start, end = ?end, "segment.deallocate_page_range");
        self.delegate.deallocate_page_range(start, end)
    }

    fn is_page_id_allocated(&self, page_id: PageId) -> bool {
        self.delegate.is_page_id_allocated(page_id)
    }

    fn allocated_size_in_pages(&self) -> u64 {
        self.delegate.allocated_size_in_pages()
    }

    fn ensure_allocated_size(&self, n_pages: u64) -> Result<bool> {
        trace!(target: "ombra::segment", segment = self.label, n_pages, "segment.ensure_allocated_size");
        self.delegate.ensure_allocated_size(n_pages)
    }

    fn page_successor(&self, page_id: PageId) -> Result<Option<PageId>> {
        self.delegate.page_successor(page_id)
    }

    fn set_page_successor(&self, page_id: PageId, successor: Option<PageId>) -> Result<()> {
        trace!(target: "ombra::segment", segment = self.label, page = page_id.0, successor = ?successor, "segment.set_page_successor");
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
        trace!(target: "ombra::segment", segment = self.label, checkpoint_type = ?checkpoint_type, "segment.delegated_checkpoint");
        self.delegate.delegated_checkpoint(requester, checkpoint_type)
    }
}
