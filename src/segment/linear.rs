use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::{MappedPageListener, PageCache};
use crate::error::{Result, SegmentError};
use crate::segment::{linear_page_successor, Segment, SegmentId};
use crate::types::{AllocationOrder, BlockId, CheckpointType, DeviceId, PageId, PageOwnerId};

/// Sizing policy for a [`LinearDeviceSegment`].
#[derive(Clone, Debug)]
pub struct LinearSegmentOptions {
    /// First device block owned by the segment.
    pub first_block: u64,
    /// Pages to allocate up front.
    pub n_pages_initial: u64,
    /// Device growth granularity in pages; zero grows exactly on demand.
    pub n_pages_increment: u64,
    /// Hard ceiling on allocated pages.
    pub n_pages_max: u64,
}

impl Default for LinearSegmentOptions {
    fn default() -> Self {
        Self {
            first_block: 0,
            n_pages_initial: 0,
            n_pages_increment: 8,
            n_pages_max: u64::MAX,
        }
    }
}

struct LinearState {
    n_pages: u64,
}

/// Leaf segment over one raw device: pages are a dense, auto-extensible
/// run of device blocks starting at `first_block`.
pub struct LinearDeviceSegment {
    id: SegmentId,
    cache: Arc<PageCache>,
    device_id: DeviceId,
    first_block: u64,
    n_pages_increment: u64,
    n_pages_max: u64,
    state: Mutex<LinearState>,
}

impl LinearDeviceSegment {
    /// Opens the segment, deriving the allocated page count from the
    /// device's current size and growing to `n_pages_initial` if needed.
    pub fn new(
        cache: Arc<PageCache>,
        device_id: DeviceId,
        options: LinearSegmentOptions,
    ) -> Result<Arc<Self>> {
        let device = cache.device(device_id)?;
        let on_device = device
            .block_count()
            .saturating_sub(options.first_block)
            .min(options.n_pages_max);
        let segment = Arc::new(Self {
            id: SegmentId::next(),
            cache,
            device_id,
            first_block: options.first_block,
            n_pages_increment: options.n_pages_increment,
            n_pages_max: options.n_pages_max,
            state: Mutex::new(LinearState { n_pages: on_device }),
        });
        if options.n_pages_initial > 0 && !segment.ensure_allocated_size(options.n_pages_initial)? {
            return Err(SegmentError::InvalidArgument(format!(
                "initial size {} exceeds page cap {}",
                options.n_pages_initial, options.n_pages_max
            )));
        }
        Ok(segment)
    }

    // Grows the allocation while the state lock is held. Device extension
    // happens in increment-sized steps so repeated single-page allocations
    // do not resize the device every time.
    fn grow_locked(&self, state: &mut LinearState, n_pages: u64) -> Result<bool> {
        if n_pages <= state.n_pages {
            return Ok(true);
        }
        if n_pages > self.n_pages_max {
            return Ok(false);
        }
        let device = self.cache.device(self.device_id)?;
        let rounded = if self.n_pages_increment == 0 {
            n_pages
        } else {
            n_pages
                .div_ceil(self.n_pages_increment)
                .saturating_mul(self.n_pages_increment)
                .min(self.n_pages_max)
        };
        let needed_blocks = self.first_block + rounded;
        if device.block_count() < needed_blocks {
            device.resize(needed_blocks)?;
        }
        state.n_pages = n_pages;
        Ok(true)
    }
}

impl MappedPageListener for LinearDeviceSegment {}

impl Segment for LinearDeviceSegment {
    fn segment_id(&self) -> SegmentId {
        self.id
    }

    fn allocation_order(&self) -> AllocationOrder {
        AllocationOrder::Linear
    }

    fn translate_page_id(&self, page_id: PageId) -> Result<BlockId> {
        if page_id.0 >= self.state.lock().n_pages {
            return Err(SegmentError::UnallocatedPage(page_id));
        }
        Ok(BlockId::new(self.device_id, self.first_block + page_id.0))
    }

    fn translate_block_id(&self, block_id: BlockId) -> Result<PageId> {
        let n_pages = self.state.lock().n_pages;
        if block_id.device != self.device_id
            || block_id.block < self.first_block
            || block_id.block >= self.first_block + n_pages
        {
            return Err(SegmentError::ForeignBlock(block_id));
        }
        Ok(PageId(block_id.block - self.first_block))
    }

    fn allocate_page_id(&self, _owner_id: PageOwnerId) -> Result<Option<PageId>> {
        let mut state = self.state.lock();
        let next = state.n_pages;
        if !self.grow_locked(&mut state, next + 1)? {
            return Ok(None);
        }
        Ok(Some(PageId(next)))
    }

    fn deallocate_page_range(&self, start: Option<PageId>, end: Option<PageId>) -> Result<()> {
        // Only truncation from a page to the end of the dense range.
        let new_size = match (start, end) {
            (Some(start), None) => start.0,
            (None, None) => 0,
            _ => return Err(SegmentError::Unsupported(
                "linear segments only deallocate from a page to the end",
            )),
        };
        let old_size = {
            let mut state = self.state.lock();
            if new_size > state.n_pages {
                return Err(SegmentError::InvalidArgument(format!(
                    "truncation start {} past allocated size {}",
                    new_size, state.n_pages
                )));
            }
            let old = state.n_pages;
            state.n_pages = new_size;
            old
        };
        for page in new_size..old_size {
            self.cache
                .discard_page(BlockId::new(self.device_id, self.first_block + page));
        }
        debug!(
            target: "ombra::segment",
            old = old_size,
            new = new_size,
            "linear.truncate"
        );
        Ok(())
    }

    fn is_page_id_allocated(&self, page_id: PageId) -> bool {
        page_id.0 < self.state.lock().n_pages
    }

    fn allocated_size_in_pages(&self) -> u64 {
        self.state.lock().n_pages
    }

    fn ensure_allocated_size(&self, n_pages: u64) -> Result<bool> {
        let mut state = self.state.lock();
        self.grow_locked(&mut state, n_pages)
    }

    fn page_successor(&self, page_id: PageId) -> Result<Option<PageId>> {
        let n_pages = self.state.lock().n_pages;
        if page_id.0 >= n_pages {
            return Err(SegmentError::UnallocatedPage(page_id));
        }
        Ok(linear_page_successor(page_id, n_pages))
    }

    fn set_page_successor(&self, _page_id: PageId, _successor: Option<PageId>) -> Result<()> {
        Err(SegmentError::Unsupported(
            "linear segments derive successors from page order",
        ))
    }

    fn usable_page_size(&self) -> usize {
        self.cache.page_size()
    }

    fn delegated_checkpoint(
        &self,
        requester: SegmentId,
        checkpoint_type: CheckpointType,
    ) -> Result<()> {
        self.cache
            .checkpoint_pages(|id| id == requester, checkpoint_type)?;
        if checkpoint_type != CheckpointType::Discard {
            self.cache.device(self.device_id)?.flush()?;
        }
        Ok(())
    }
}
