use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::{CachePage, MappedPageListener, PageCache};
use crate::error::{Result, SegmentError};
use crate::segment::{Segment, SegmentId, SegmentRef};
use crate::types::{AllocationOrder, BlockId, CheckpointType, PageId, PageOwnerId};

/// Sink for checkpoint requests raised by a [`CircularSegment`] as its
/// ring fills.
///
/// `request_checkpoint` is invoked from inside an allocation, possibly
/// while the caller holds page locks; implementations must hand the
/// request to another thread (or record it) rather than checkpoint
/// synchronously.
pub trait CheckpointProvider: Send + Sync {
    /// Asks the log consumer to checkpoint so ring space can be reclaimed.
    fn request_checkpoint(&self, checkpoint_type: CheckpointType);
}

struct CircularState {
    // Monotonic page counters; the live window is [oldest, next) and
    // never spans more than n_pages.
    oldest: u64,
    next: u64,
}

/// Ring-buffer reuse of a LINEAR delegate's pages.
///
/// Logical page numbers grow without bound; the backing block is
/// `page % n_pages`. The owner must deallocate consumed pages before the
/// ring wraps into live data: allocation fails with `Ok(None)` at the
/// bound rather than overwriting.
pub struct CircularSegment {
    id: SegmentId,
    cache: Arc<PageCache>,
    delegate: SegmentRef,
    n_pages: u64,
    // Occupancies at which a fuzzy checkpoint is requested; soft
    // backpressure so consumers reclaim space before exhaustion.
    checkpoint_threshold1: u64,
    checkpoint_threshold2: u64,
    provider: Option<Arc<dyn CheckpointProvider>>,
    state: Mutex<CircularState>,
}

impl CircularSegment {
    /// Wraps `delegate` as a ring of `n_pages` slots with default
    /// checkpoint thresholds at 1/3 and 2/3 occupancy.
    pub fn new(
        cache: Arc<PageCache>,
        delegate: SegmentRef,
        n_pages: u64,
        provider: Option<Arc<dyn CheckpointProvider>>,
    ) -> Result<Arc<Self>> {
        Self::with_thresholds(cache, delegate, n_pages, provider, n_pages / 3, 2 * n_pages / 3)
    }

    /// Wraps `delegate` with explicit checkpoint thresholds.
    pub fn with_thresholds(
        cache: Arc<PageCache>,
        delegate: SegmentRef,
        n_pages: u64,
        provider: Option<Arc<dyn CheckpointProvider>>,
        checkpoint_threshold1: u64,
        checkpoint_threshold2: u64,
    ) -> Result<Arc<Self>> {
        if !delegate.allocation_order().is_linear() {
            return Err(SegmentError::InvalidArgument(
                "circular segment requires a LINEAR delegate".into(),
            ));
        }
        if n_pages == 0 {
            return Err(SegmentError::InvalidArgument(
                "circular segment needs at least one page".into(),
            ));
        }
        if !delegate.ensure_allocated_size(n_pages)? {
            return Err(SegmentError::InvalidArgument(format!(
                "delegate cannot grow to {n_pages} ring pages"
            )));
        }
        Ok(Arc::new(Self {
            id: SegmentId::next(),
            cache,
            delegate,
            n_pages,
            checkpoint_threshold1,
            checkpoint_threshold2,
            provider,
            state: Mutex::new(CircularState { oldest: 0, next: 0 }),
        }))
    }

    /// Oldest live logical page number.
    pub fn oldest_page_num(&self) -> u64 {
        self.state.lock().oldest
    }

    /// Next logical page number to be allocated.
    pub fn next_page_num(&self) -> u64 {
        self.state.lock().next
    }
}

impl MappedPageListener for CircularSegment {
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

impl Segment for CircularSegment {
    fn segment_id(&self) -> SegmentId {
        self.id
    }

    fn allocation_order(&self) -> AllocationOrder {
        AllocationOrder::Ascending
    }

    fn translate_page_id(&self, page_id: PageId) -> Result<BlockId> {
        // Deliberately no live-window check: recovery walks logical page
        // numbers recorded before a crash, when the in-memory counters
        // have been reset.
        self.delegate.translate_page_id(PageId(page_id.0 % self.n_pages))
    }

    fn translate_block_id(&self, block_id: BlockId) -> Result<PageId> {
        let base = self.delegate.translate_block_id(block_id)?.0;
        let state = self.state.lock();
        // Of the at most two logical aliases of this block, pick the one
        // inside the live window.
        let candidate = state.oldest + ((base + self.n_pages - state.oldest % self.n_pages)
            % self.n_pages);
        if candidate >= state.next {
            return Err(SegmentError::ForeignBlock(block_id));
        }
        Ok(PageId(candidate))
    }

    fn allocate_page_id(&self, _owner_id: PageOwnerId) -> Result<Option<PageId>> {
        let (page, request) = {
            let mut state = self.state.lock();
            if state.next - state.oldest >= self.n_pages {
                return Ok(None);
            }
            let page = state.next;
            state.next += 1;
            let occupancy = state.next - state.oldest;
            let request = occupancy == self.checkpoint_threshold1
                || occupancy == self.checkpoint_threshold2;
            (page, request)
        };
        if request {
            if let Some(provider) = &self.provider {
                debug!(target: "ombra::segment", page, "circular.request_checkpoint");
                provider.request_checkpoint(CheckpointType::FlushFuzzy);
            }
        }
        Ok(Some(PageId(page)))
    }

    fn deallocate_page_range(&self, start: Option<PageId>, end: Option<PageId>) -> Result<()> {
        if start.is_some() {
            return Err(SegmentError::Unsupported(
                "circular segments only deallocate from the oldest page",
            ));
        }
        let (from, to) = {
            let mut state = self.state.lock();
            let new_oldest = match end {
                Some(end) => {
                    if end.0 < state.oldest || end.0 >= state.next {
                        return Err(SegmentError::InvalidArgument(format!(
                            "page {} outside live window [{}, {})",
                            end.0, state.oldest, state.next
                        )));
                    }
                    end.0 + 1
                }
                None => state.next,
            };
            let from = state.oldest;
            state.oldest = new_oldest;
            (from, new_oldest)
        };
        for page in from..to {
            let block = self.delegate.translate_page_id(PageId(page % self.n_pages))?;
            // Unmap through the cache so dirty-set trackers up the chain
            // hear about pages that die unflushed.
            self.cache.discard_page(block);
        }
        Ok(())
    }

    fn is_page_id_allocated(&self, page_id: PageId) -> bool {
        let state = self.state.lock();
        page_id.0 >= state.oldest && page_id.0 < state.next
    }

    fn allocated_size_in_pages(&self) -> u64 {
        let state = self.state.lock();
        state.next - state.oldest
    }

    fn ensure_allocated_size(&self, n_pages: u64) -> Result<bool> {
        Ok(n_pages <= self.n_pages)
    }

    fn page_successor(&self, page_id: PageId) -> Result<Option<PageId>> {
        // The ring has no intrinsic end; log consumers detect the tail by
        // content (validity, checksum), not by successor exhaustion.
        Ok(Some(PageId(page_id.0 + 1)))
    }

    fn set_page_successor(&self, _page_id: PageId, _successor: Option<PageId>) -> Result<()> {
        Err(SegmentError::Unsupported(
            "circular successors are implicit in page order",
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
    use crate::segment::{LinearDeviceSegment, LinearSegmentOptions};
    use crate::PageCache;
    use parking_lot::Mutex as PlMutex;

    struct RecordingProvider {
        requests: PlMutex<Vec<CheckpointType>>,
    }

    impl RecordingProvider {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                requests: PlMutex::new(Vec::new()),
            })
        }
    }

    impl CheckpointProvider for RecordingProvider {
        fn request_checkpoint(&self, checkpoint_type: CheckpointType) {
            self.requests.lock().push(checkpoint_type);
        }
    }

    fn ring(
        n_pages: u64,
        t1: u64,
        t2: u64,
    ) -> (Arc<CircularSegment>, Arc<RecordingProvider>) {
        let cache = PageCache::new(128);
        let device_id = cache.register_device(Arc::new(MemDevice::new(128)));
        let leaf = LinearDeviceSegment::new(
            Arc::clone(&cache),
            device_id,
            LinearSegmentOptions {
                n_pages_increment: 1,
                ..Default::default()
            },
        )
        .unwrap();
        let provider = RecordingProvider::new();
        let segment = CircularSegment::with_thresholds(
            cache,
            leaf,
            n_pages,
            Some(provider.clone() as Arc<dyn CheckpointProvider>),
            t1,
            t2,
        )
        .unwrap();
        (segment, provider)
    }

    #[test]
    fn thresholds_fire_and_ring_fills() {
        let (segment, provider) = ring(9, 3, 6);
        for expected in 0..7u64 {
            assert_eq!(
                segment.allocate_page_id(PageOwnerId::ANON).unwrap(),
                Some(PageId(expected))
            );
        }
        assert_eq!(provider.requests.lock().len(), 2);
        for _ in 7..9 {
            assert!(segment.allocate_page_id(PageOwnerId::ANON).unwrap().is_some());
        }
        // Full ring: allocation reports exhaustion instead of wrapping.
        assert_eq!(segment.allocate_page_id(PageOwnerId::ANON).unwrap(), None);
        segment
            .deallocate_page_range(None, Some(PageId(0)))
            .unwrap();
        assert_eq!(
            segment.allocate_page_id(PageOwnerId::ANON).unwrap(),
            Some(PageId(9))
        );
    }

    #[test]
    fn window_invariant_holds_across_wraps() {
        let (segment, _provider) = ring(4, 0, 0);
        for round in 0..6u64 {
            let page = segment.allocate_page_id(PageOwnerId::ANON).unwrap().unwrap();
            assert_eq!(page, PageId(round));
            assert!(segment.next_page_num() - segment.oldest_page_num() <= 4);
            segment.deallocate_page_range(None, Some(page)).unwrap();
            assert_eq!(segment.allocated_size_in_pages(), 0);
        }
        assert_eq!(segment.next_page_num(), 6);
        assert_eq!(segment.oldest_page_num(), 6);
    }

    #[test]
    fn block_translation_resolves_live_alias() {
        let (segment, _provider) = ring(4, 0, 0);
        for _ in 0..4 {
            segment.allocate_page_id(PageOwnerId::ANON).unwrap();
        }
        segment.deallocate_page_range(None, Some(PageId(1))).unwrap();
        // Logical pages 4 and 5 reuse the blocks of dead pages 0 and 1.
        assert_eq!(
            segment.allocate_page_id(PageOwnerId::ANON).unwrap(),
            Some(PageId(4))
        );
        let block = segment.translate_page_id(PageId(4)).unwrap();
        assert_eq!(segment.translate_block_id(block).unwrap(), PageId(4));
        // Blocks of still-live un-wrapped pages resolve to themselves.
        let block2 = segment.translate_page_id(PageId(2)).unwrap();
        assert_eq!(segment.translate_block_id(block2).unwrap(), PageId(2));
    }

    #[test]
    fn requires_linear_delegate() {
        let (inner, _provider) = ring(4, 0, 0);
        let cache = PageCache::new(128);
        assert!(matches!(
            CircularSegment::new(cache, inner, 4, None),
            Err(SegmentError::InvalidArgument(_))
        ));
    }
}
