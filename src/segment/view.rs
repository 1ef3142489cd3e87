use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::{CachePage, MappedPageListener};
use crate::error::{Result, SegmentError};
use crate::segment::{linear_page_successor, Segment, SegmentId, SegmentRef};
use crate::types::{AllocationOrder, BlockId, CheckpointType, PageId, PageOwnerId};

/// Dense linear view over an arbitrary chain of underlying pages.
///
/// At construction the persisted successor chain starting at `first_page`
/// is materialized into an in-memory table; view page `p` is simply the
/// `p`-th entry. Growing the view allocates from the delegate and links
/// the new page after the current tail, so the chain on disk always
/// matches the table.
pub struct LinearViewSegment {
    id: SegmentId,
    delegate: SegmentRef,
    table: Mutex<Vec<PageId>>,
}

impl LinearViewSegment {
    /// Builds the view by walking the delegate's successor chain from
    /// `first_page` (or empty for `None`).
    pub fn new(delegate: SegmentRef, first_page: Option<PageId>) -> Result<Arc<Self>> {
        let mut table = Vec::new();
        let bound = delegate.allocated_size_in_pages();
        let mut cursor = first_page;
        while let Some(page) = cursor {
            table.push(page);
            if table.len() as u64 > bound {
                return Err(SegmentError::Corruption(format!(
                    "page chain from {:?} exceeds the delegate's {} allocated pages",
                    first_page, bound
                )));
            }
            cursor = delegate.page_successor(page)?;
        }
        Ok(Arc::new(Self {
            id: SegmentId::next(),
            delegate,
            table: Mutex::new(table),
        }))
    }

    /// Underlying page backing view page `page_id`.
    pub fn underlying_page(&self, page_id: PageId) -> Result<PageId> {
        self.table
            .lock()
            .get(page_id.0 as usize)
            .copied()
            .ok_or(SegmentError::UnallocatedPage(page_id))
    }
}

impl MappedPageListener for LinearViewSegment {
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

impl Segment for LinearViewSegment {
    fn segment_id(&self) -> SegmentId {
        self.id
    }

    fn allocation_order(&self) -> AllocationOrder {
        AllocationOrder::Ascending
    }

    fn translate_page_id(&self, page_id: PageId) -> Result<BlockId> {
        let underlying = self.underlying_page(page_id)?;
        self.delegate.translate_page_id(underlying)
    }

    fn translate_block_id(&self, block_id: BlockId) -> Result<PageId> {
        let underlying = self.delegate.translate_block_id(block_id)?;
        // Linear scan of the table. View segments are small and reverse
        // translation is diagnostic, so the O(n) lookup has been left as
        // is; revisit if views ever back large page spaces.
        let table = self.table.lock();
        table
            .iter()
            .position(|&page| page == underlying)
            .map(|index| PageId(index as u64))
            .ok_or(SegmentError::ForeignBlock(block_id))
    }

    fn allocate_page_id(&self, owner_id: PageOwnerId) -> Result<Option<PageId>> {
        let Some(new_page) = self.delegate.allocate_page_id(owner_id)? else {
            return Ok(None);
        };
        let mut table = self.table.lock();
        if let Some(&tail) = table.last() {
            self.delegate.set_page_successor(tail, Some(new_page))?;
        }
        table.push(new_page);
        Ok(Some(PageId(table.len() as u64 - 1)))
    }

    fn deallocate_page_range(&self, start: Option<PageId>, end: Option<PageId>) -> Result<()> {
        if start.is_some() || end.is_some() {
            return Err(SegmentError::Unsupported(
                "view segments only support full truncation",
            ));
        }
        let pages: Vec<PageId> = {
            let mut table = self.table.lock();
            std::mem::take(&mut *table)
        };
        for page in pages {
            self.delegate.deallocate_page_range(Some(page), Some(page))?;
        }
        Ok(())
    }

    fn is_page_id_allocated(&self, page_id: PageId) -> bool {
        (page_id.0 as usize) < self.table.lock().len()
    }

    fn allocated_size_in_pages(&self) -> u64 {
        self.table.lock().len() as u64
    }

    fn ensure_allocated_size(&self, n_pages: u64) -> Result<bool> {
        while self.allocated_size_in_pages() < n_pages {
            if self.allocate_page_id(PageOwnerId::ANON)?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn page_successor(&self, page_id: PageId) -> Result<Option<PageId>> {
        let len = self.table.lock().len() as u64;
        if page_id.0 >= len {
            return Err(SegmentError::UnallocatedPage(page_id));
        }
        Ok(linear_page_successor(page_id, len))
    }

    fn set_page_successor(&self, _page_id: PageId, _successor: Option<PageId>) -> Result<()> {
        Err(SegmentError::Unsupported(
            "view successors are implicit in table order",
        ))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::segment::{RandomAllocationSegment, RandomSegmentOptions};
    use crate::segment::{LinearDeviceSegment, LinearSegmentOptions};
    use crate::PageCache;

    fn random_segment() -> (Arc<PageCache>, Arc<RandomAllocationSegment>) {
        let cache = PageCache::new(256);
        let device_id = cache.register_device(Arc::new(MemDevice::new(256)));
        let leaf = LinearDeviceSegment::new(
            Arc::clone(&cache),
            device_id,
            LinearSegmentOptions {
                n_pages_increment: 8,
                ..Default::default()
            },
        )
        .unwrap();
        let random = RandomAllocationSegment::format(
            Arc::clone(&cache),
            leaf,
            RandomSegmentOptions { pages_per_extent: 8 },
        )
        .unwrap();
        (cache, random)
    }

    #[test]
    fn view_materializes_persisted_chain() {
        let (_cache, random) = random_segment();
        let delegate: SegmentRef = random.clone();
        let owner = PageOwnerId(7);

        let a = delegate.allocate_page_id(owner).unwrap().unwrap();
        let b = delegate.allocate_page_id(owner).unwrap().unwrap();
        let c = delegate.allocate_page_id(owner).unwrap().unwrap();
        delegate.set_page_successor(a, Some(b)).unwrap();
        delegate.set_page_successor(b, Some(c)).unwrap();

        let view = LinearViewSegment::new(delegate.clone(), Some(a)).unwrap();
        assert_eq!(view.allocated_size_in_pages(), 3);
        assert_eq!(view.underlying_page(PageId(0)).unwrap(), a);
        assert_eq!(view.underlying_page(PageId(2)).unwrap(), c);

        // Round trip through the delegate's blocks.
        for p in 0..3u64 {
            let block = view.translate_page_id(PageId(p)).unwrap();
            assert_eq!(view.translate_block_id(block).unwrap(), PageId(p));
        }
    }

    #[test]
    fn allocation_links_after_the_tail() {
        let (_cache, random) = random_segment();
        let delegate: SegmentRef = random.clone();
        let owner = PageOwnerId(9);
        let first = delegate.allocate_page_id(owner).unwrap().unwrap();

        let view = LinearViewSegment::new(delegate.clone(), Some(first)).unwrap();
        let appended = view.allocate_page_id(owner).unwrap().unwrap();
        assert_eq!(appended, PageId(1));
        let underlying = view.underlying_page(appended).unwrap();
        assert_eq!(delegate.page_successor(first).unwrap(), Some(underlying));
    }

    #[test]
    fn truncation_frees_the_whole_chain() {
        let (_cache, random) = random_segment();
        let delegate: SegmentRef = random.clone();
        let first = delegate.allocate_page_id(PageOwnerId::ANON).unwrap().unwrap();
        let view = LinearViewSegment::new(delegate.clone(), Some(first)).unwrap();
        view.ensure_allocated_size(4).unwrap();

        assert!(view.deallocate_page_range(None, Some(PageId(1))).is_err());
        view.deallocate_page_range(None, None).unwrap();
        assert_eq!(view.allocated_size_in_pages(), 0);
        assert!(!delegate.is_page_id_allocated(first));
    }
}
