use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

use crate::cache::{CachePage, MappedPageListener, PageCache, PageGuard};
use crate::error::{Result, SegmentError};
use crate::segment::{Segment, SegmentId, SegmentRef};
use crate::types::{AllocationOrder, BlockId, CheckpointType, PageId, PageOwnerId};

const SEG_ALLOC_MAGIC: u64 = 0x5345_4741_4c4c_4f43; // "SEGALLOC"
const EXTENT_MAGIC: u64 = 0x4558_5441_4c4c_4f43; // "EXTALLOC"

// Segment allocation node layout: magic, next-node link, count of extents
// formatted under this node, then one u32 free-page counter per extent.
const SEG_ALLOC_HEADER: usize = 8 + 8 + 4;
// Extent allocation node layout: magic, then one entry per page of the
// extent (the node itself included as entry zero).
const EXTENT_HEADER: usize = 8;
const ENTRY_LEN: usize = 16;

/// Shape of a [`RandomAllocationSegment`]'s extent map.
#[derive(Clone, Debug)]
pub struct RandomSegmentOptions {
    /// Allocatable data pages per extent.
    pub pages_per_extent: u64,
}

impl Default for RandomSegmentOptions {
    fn default() -> Self {
        Self { pages_per_extent: 32 }
    }
}

/// Geometry derived from the page size and the extent shape. Page ids in
/// this segment are the delegate's own linear page ids, so every mapping
/// below is pure arithmetic.
#[derive(Clone, Copy)]
struct Geometry {
    pages_per_extent: u64,
    extents_per_node: u64,
}

impl Geometry {
    fn new(usable_page_size: usize, pages_per_extent: u64) -> Result<Self> {
        let extents_per_node = ((usable_page_size - SEG_ALLOC_HEADER) / 4) as u64;
        let extent_node_bytes = EXTENT_HEADER + (pages_per_extent as usize + 1) * ENTRY_LEN;
        if pages_per_extent == 0 || extent_node_bytes > usable_page_size || extents_per_node == 0 {
            return Err(SegmentError::InvalidArgument(format!(
                "extent shape {} does not fit a {}-byte page",
                pages_per_extent, usable_page_size
            )));
        }
        Ok(Self {
            pages_per_extent,
            extents_per_node,
        })
    }

    /// Pages spanned by one extent: its allocation node plus its data pages.
    fn extent_span(&self) -> u64 {
        self.pages_per_extent + 1
    }

    /// Pages spanned by one allocation-node group.
    fn group_span(&self) -> u64 {
        1 + self.extents_per_node * self.extent_span()
    }

    fn seg_alloc_page(&self, group: u64) -> PageId {
        PageId(group * self.group_span())
    }

    fn extent_node_page(&self, extent: u64) -> PageId {
        let group = extent / self.extents_per_node;
        let within = extent % self.extents_per_node;
        PageId(self.seg_alloc_page(group).0 + 1 + within * self.extent_span())
    }

    fn data_page(&self, extent: u64, entry: u64) -> PageId {
        debug_assert!(entry >= 1 && entry <= self.pages_per_extent);
        PageId(self.extent_node_page(extent).0 + entry)
    }

    /// Splits a page id into its extent number and entry index, or `None`
    /// for allocation-node pages.
    fn locate(&self, page_id: PageId) -> Option<(u64, u64)> {
        let group = page_id.0 / self.group_span();
        let rest = page_id.0 % self.group_span();
        if rest == 0 {
            return None;
        }
        let within = (rest - 1) / self.extent_span();
        let entry = (rest - 1) % self.extent_span();
        if entry == 0 {
            return None;
        }
        Some((group * self.extents_per_node + within, entry))
    }
}

#[derive(Default)]
struct PageCounters {
    allocated: u64,
    high_water: u64,
}

/// Extent-mapped segment supporting arbitrary allocate/deallocate with
/// page reuse and persisted successor chains.
///
/// The delegate's page 0 holds the first segment allocation node, which
/// carries a free-page counter per extent; each extent starts with an
/// extent allocation node holding one `(owner, successor)` entry per page.
/// All bookkeeping lives in those pages and goes through the cache, so it
/// is checkpointed and recovered like any other data.
pub struct RandomAllocationSegment {
    id: SegmentId,
    cache: Arc<PageCache>,
    delegate: SegmentRef,
    geometry: Geometry,
    counters: Mutex<PageCounters>,
    weak_self: Weak<RandomAllocationSegment>,
}

impl RandomAllocationSegment {
    /// Formats a fresh extent map on `delegate` and returns the segment.
    /// Overwrites whatever the delegate's pages held before.
    pub fn format(
        cache: Arc<PageCache>,
        delegate: SegmentRef,
        options: RandomSegmentOptions,
    ) -> Result<Arc<Self>> {
        let segment = Self::attach(cache, delegate, options)?;
        segment.format_seg_alloc_node(0, None)?;
        segment.format_extent(0)?;
        Ok(segment)
    }

    /// Reopens a previously formatted extent map, verifying the first
    /// allocation node's magic.
    pub fn open(
        cache: Arc<PageCache>,
        delegate: SegmentRef,
        options: RandomSegmentOptions,
    ) -> Result<Arc<Self>> {
        let segment = Self::attach(cache, delegate, options)?;
        {
            let guard = segment.lock_node(PageId(0))?;
            if read_u64(guard.data(), 0) != SEG_ALLOC_MAGIC {
                return Err(SegmentError::Corruption(
                    "segment allocation node magic mismatch".into(),
                ));
            }
        }
        segment.init_for_use()?;
        Ok(segment)
    }

    fn attach(
        cache: Arc<PageCache>,
        delegate: SegmentRef,
        options: RandomSegmentOptions,
    ) -> Result<Arc<Self>> {
        if !delegate.allocation_order().is_linear() {
            return Err(SegmentError::InvalidArgument(
                "extent maps require a linear delegate".into(),
            ));
        }
        let geometry = Geometry::new(delegate.usable_page_size(), options.pages_per_extent)?;
        Ok(Arc::new_cyclic(|weak_self| Self {
            id: SegmentId::next(),
            cache,
            delegate,
            geometry,
            counters: Mutex::new(PageCounters::default()),
            weak_self: weak_self.clone(),
        }))
    }

    fn self_ref(&self) -> SegmentRef {
        self.weak_self
            .upgrade()
            .expect("segment outlived by its own page guard")
    }

    fn lock_node(&self, page_id: PageId) -> Result<PageGuard> {
        self.cache.lock_page(&self.self_ref(), page_id)
    }

    // Grows the delegate far enough to back `page_id`, then maps it fresh.
    fn lock_new_node(&self, page_id: PageId) -> Result<Option<PageGuard>> {
        if !self.delegate.ensure_allocated_size(page_id.0 + 1)? {
            return Ok(None);
        }
        Ok(Some(self.cache.lock_new_page(&self.self_ref(), page_id)?))
    }

    fn format_seg_alloc_node(&self, group: u64, next: Option<PageId>) -> Result<Option<()>> {
        let page = self.geometry.seg_alloc_page(group);
        let Some(mut guard) = self.lock_new_node(page)? else {
            return Ok(None);
        };
        let data = guard.writable_data()?;
        data.fill(0);
        write_u64(data, 0, SEG_ALLOC_MAGIC);
        write_u64(data, 8, PageId::encode_opt(next));
        write_u32(data, 16, 0);
        Ok(Some(()))
    }

    fn format_extent(&self, extent: u64) -> Result<Option<()>> {
        let node_page = self.geometry.extent_node_page(extent);
        let last_data = self.geometry.data_page(extent, self.geometry.pages_per_extent);
        if !self.delegate.ensure_allocated_size(last_data.0 + 1)? {
            return Ok(None);
        }
        {
            let mut guard = self.cache.lock_new_page(&self.self_ref(), node_page)?;
            let data = guard.writable_data()?;
            data.fill(0);
            write_u64(data, 0, EXTENT_MAGIC);
            // Entry zero is the node itself.
            write_entry(data, 0, PageOwnerId::ANON.0, PageId::NONE_REPR);
            for entry in 1..=self.geometry.pages_per_extent {
                write_entry(
                    data,
                    entry as usize,
                    PageOwnerId::UNALLOCATED_REPR,
                    PageId::NONE_REPR,
                );
            }
        }
        // Record the new extent in its group's allocation node.
        let group = extent / self.geometry.extents_per_node;
        let within = (extent % self.geometry.extents_per_node) as usize;
        let mut guard = self.lock_node(self.geometry.seg_alloc_page(group))?;
        let data = guard.writable_data()?;
        let formatted = read_u32(data, 16);
        debug_assert_eq!(formatted as usize, within);
        write_u32(data, 16, formatted + 1);
        write_u32(
            data,
            SEG_ALLOC_HEADER + 4 * within,
            self.geometry.pages_per_extent as u32,
        );
        Ok(Some(()))
    }

    // Claims one free entry in `extent`. The caller has already seen a
    // nonzero free counter; a full scan here means the counter lied.
    fn allocate_from_extent(&self, extent: u64, owner_id: PageOwnerId) -> Result<PageId> {
        let node_page = self.geometry.extent_node_page(extent);
        let mut guard = self.lock_node(node_page)?;
        if read_u64(guard.data(), 0) != EXTENT_MAGIC {
            return Err(SegmentError::Corruption(format!(
                "extent allocation node {:?} magic mismatch",
                node_page
            )));
        }
        for entry in 1..=self.geometry.pages_per_extent {
            let (owner, _) = read_entry(guard.data(), entry as usize);
            if owner == PageOwnerId::UNALLOCATED_REPR {
                let data = guard.writable_data()?;
                write_entry(data, entry as usize, owner_id.0, PageId::NONE_REPR);
                return Ok(self.geometry.data_page(extent, entry));
            }
        }
        Err(SegmentError::Corruption(format!(
            "extent {} free counter disagrees with its entries",
            extent
        )))
    }

    /// Reads the entry for `page_id`, failing for allocation-node pages.
    fn entry_for(&self, page_id: PageId) -> Result<(u64, u64, u64)> {
        let Some((extent, entry)) = self.geometry.locate(page_id) else {
            return Err(SegmentError::InvalidArgument(format!(
                "{:?} is an allocation node, not a data page",
                page_id
            )));
        };
        let guard = self.lock_node(self.geometry.extent_node_page(extent))?;
        let (owner, successor) = read_entry(guard.data(), entry as usize);
        Ok((extent, owner, successor))
    }

    /// Owner tag recorded for an allocated page.
    pub fn page_owner_id(&self, page_id: PageId) -> Result<PageOwnerId> {
        let (_, owner, _) = self.entry_for(page_id)?;
        if owner == PageOwnerId::UNALLOCATED_REPR {
            return Err(SegmentError::UnallocatedPage(page_id));
        }
        Ok(PageOwnerId(owner))
    }

    fn deallocate_single(&self, page_id: PageId) -> Result<()> {
        let Some((extent, entry)) = self.geometry.locate(page_id) else {
            return Err(SegmentError::InvalidArgument(format!(
                "{:?} is an allocation node, not a data page",
                page_id
            )));
        };
        {
            let mut guard = self.lock_node(self.geometry.extent_node_page(extent))?;
            let (owner, _) = read_entry(guard.data(), entry as usize);
            if owner == PageOwnerId::UNALLOCATED_REPR {
                return Err(SegmentError::UnallocatedPage(page_id));
            }
            let data = guard.writable_data()?;
            write_entry(
                data,
                entry as usize,
                PageOwnerId::UNALLOCATED_REPR,
                PageId::NONE_REPR,
            );
        }
        {
            let group = extent / self.geometry.extents_per_node;
            let within = (extent % self.geometry.extents_per_node) as usize;
            let mut guard = self.lock_node(self.geometry.seg_alloc_page(group))?;
            let data = guard.writable_data()?;
            let offset = SEG_ALLOC_HEADER + 4 * within;
            let free = read_u32(data, offset);
            write_u32(data, offset, free + 1);
        }
        self.cache.discard_page(self.delegate.translate_page_id(page_id)?);
        self.counters.lock().allocated -= 1;
        Ok(())
    }

    // Walks the allocation-node chain, calling `visit` with each node's
    // group number and guard until it returns `Some`.
    fn walk_seg_alloc_nodes<T>(
        &self,
        mut visit: impl FnMut(u64, &mut PageGuard) -> Result<Option<T>>,
    ) -> Result<Option<T>> {
        let mut page = Some(PageId(0));
        let mut group = 0u64;
        while let Some(node_page) = page {
            let mut guard = self.lock_node(node_page)?;
            if read_u64(guard.data(), 0) != SEG_ALLOC_MAGIC {
                return Err(SegmentError::Corruption(format!(
                    "segment allocation node {:?} magic mismatch",
                    node_page
                )));
            }
            if let Some(found) = visit(group, &mut guard)? {
                return Ok(Some(found));
            }
            page = PageId::decode_opt(read_u64(guard.data(), 8));
            group += 1;
        }
        Ok(None)
    }

    /// Recounts allocated pages from the persisted free counters and
    /// resets the in-memory page counters. Called when attaching to an
    /// existing extent map.
    pub fn init_for_use(&self) -> Result<()> {
        let allocated = self.count_allocated_pages()?;
        let mut counters = self.counters.lock();
        counters.allocated = allocated;
        counters.high_water = counters.high_water.max(allocated);
        Ok(())
    }

    /// Highest number of pages simultaneously allocated since this handle
    /// was created.
    pub fn pages_occupied_high_water(&self) -> u64 {
        self.counters.lock().high_water
    }

    fn note_allocated(&self) {
        let mut counters = self.counters.lock();
        counters.allocated += 1;
        counters.high_water = counters.high_water.max(counters.allocated);
    }

    /// Total allocated data pages, summed from the free counters.
    pub fn count_allocated_pages(&self) -> Result<u64> {
        let mut total = 0u64;
        self.walk_seg_alloc_nodes::<()>(|_, guard| {
            let formatted = read_u32(guard.data(), 16) as u64;
            for within in 0..formatted as usize {
                let free = read_u32(guard.data(), SEG_ALLOC_HEADER + 4 * within) as u64;
                total += self.geometry.pages_per_extent - free;
            }
            Ok(None)
        })?;
        Ok(total)
    }
}

impl MappedPageListener for RandomAllocationSegment {
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

impl Segment for RandomAllocationSegment {
    fn segment_id(&self) -> SegmentId {
        self.id
    }

    fn allocation_order(&self) -> AllocationOrder {
        AllocationOrder::Random
    }

    fn translate_page_id(&self, page_id: PageId) -> Result<BlockId> {
        // Page ids are the delegate's own ids; allocation nodes translate
        // too, since the segment maps them through the cache itself.
        self.delegate.translate_page_id(page_id)
    }

    fn translate_block_id(&self, block_id: BlockId) -> Result<PageId> {
        self.delegate.translate_block_id(block_id)
    }

    fn allocate_page_id(&self, owner_id: PageOwnerId) -> Result<Option<PageId>> {
        // Pass 1: reuse a free entry in an already-formatted extent.
        let found = self.walk_seg_alloc_nodes(|group, guard| {
            let formatted = read_u32(guard.data(), 16) as u64;
            for within in 0..formatted {
                let free = read_u32(guard.data(), SEG_ALLOC_HEADER + 4 * within as usize);
                if free > 0 {
                    let data = guard.writable_data()?;
                    write_u32(data, SEG_ALLOC_HEADER + 4 * within as usize, free - 1);
                    return Ok(Some(group * self.geometry.extents_per_node + within));
                }
            }
            Ok(None)
        })?;
        if let Some(extent) = found {
            let page = self.allocate_from_extent(extent, owner_id)?;
            self.note_allocated();
            return Ok(Some(page));
        }

        // Pass 2: every formatted extent is full. Format the next extent,
        // chaining a new allocation node first when the last one is full.
        let (last_group, formatted) = self
            .walk_seg_alloc_nodes(|group, guard| {
                let next = PageId::decode_opt(read_u64(guard.data(), 8));
                if next.is_none() {
                    Ok(Some((group, read_u32(guard.data(), 16) as u64)))
                } else {
                    Ok(None)
                }
            })?
            .ok_or_else(|| SegmentError::Corruption("allocation node chain is empty".into()))?;

        let new_extent = if formatted < self.geometry.extents_per_node {
            last_group * self.geometry.extents_per_node + formatted
        } else {
            let new_group = last_group + 1;
            if self.format_seg_alloc_node(new_group, None)?.is_none() {
                return Ok(None);
            }
            let mut guard = self.lock_node(self.geometry.seg_alloc_page(last_group))?;
            let data = guard.writable_data()?;
            write_u64(data, 8, self.geometry.seg_alloc_page(new_group).0);
            new_group * self.geometry.extents_per_node
        };
        if self.format_extent(new_extent)?.is_none() {
            return Ok(None);
        }

        // Claim from the fresh extent.
        let group = new_extent / self.geometry.extents_per_node;
        let within = (new_extent % self.geometry.extents_per_node) as usize;
        {
            let mut guard = self.lock_node(self.geometry.seg_alloc_page(group))?;
            let data = guard.writable_data()?;
            let offset = SEG_ALLOC_HEADER + 4 * within;
            let free = read_u32(data, offset);
            write_u32(data, offset, free - 1);
        }
        let page = self.allocate_from_extent(new_extent, owner_id)?;
        self.note_allocated();
        Ok(Some(page))
    }

    fn deallocate_page_range(&self, start: Option<PageId>, end: Option<PageId>) -> Result<()> {
        match (start, end) {
            (Some(s), Some(e)) if s == e => self.deallocate_single(s),
            (None, None) => {
                // Full reformat: free every entry and reset the counters.
                self.walk_seg_alloc_nodes::<()>(|group, guard| {
                    let formatted = read_u32(guard.data(), 16) as u64;
                    let mut freed = Vec::new();
                    {
                        let data = guard.writable_data()?;
                        for within in 0..formatted as usize {
                            write_u32(
                                data,
                                SEG_ALLOC_HEADER + 4 * within,
                                self.geometry.pages_per_extent as u32,
                            );
                        }
                    }
                    for within in 0..formatted {
                        let extent = group * self.geometry.extents_per_node + within;
                        let node_page = self.geometry.extent_node_page(extent);
                        let mut node = self.lock_node(node_page)?;
                        let data = node.writable_data()?;
                        for entry in 1..=self.geometry.pages_per_extent {
                            let (owner, _) = read_entry(data, entry as usize);
                            if owner != PageOwnerId::UNALLOCATED_REPR {
                                freed.push(self.geometry.data_page(extent, entry));
                            }
                            write_entry(
                                data,
                                entry as usize,
                                PageOwnerId::UNALLOCATED_REPR,
                                PageId::NONE_REPR,
                            );
                        }
                    }
                    for page in freed {
                        self.cache.discard_page(self.delegate.translate_page_id(page)?);
                    }
                    Ok(None)
                })?;
                self.counters.lock().allocated = 0;
                Ok(())
            }
            _ => Err(SegmentError::Unsupported(
                "extent maps deallocate single pages or everything",
            )),
        }
    }

    fn is_page_id_allocated(&self, page_id: PageId) -> bool {
        match self.entry_for(page_id) {
            Ok((_, owner, _)) => owner != PageOwnerId::UNALLOCATED_REPR,
            Err(err) => {
                warn!(target: "ombra::segment", page = page_id.0, %err, "random.entry_read_failed");
                false
            }
        }
    }

    fn allocated_size_in_pages(&self) -> u64 {
        self.counters.lock().allocated
    }

    fn ensure_allocated_size(&self, n_pages: u64) -> Result<bool> {
        // Interpreted as capacity: format extents until `n_pages` data
        // pages could be allocated without further growth.
        loop {
            let mut capacity = 0u64;
            let last = self
                .walk_seg_alloc_nodes(|group, guard| {
                    let formatted = read_u32(guard.data(), 16) as u64;
                    capacity += formatted * self.geometry.pages_per_extent;
                    let next = PageId::decode_opt(read_u64(guard.data(), 8));
                    if next.is_none() {
                        Ok(Some((group, formatted)))
                    } else {
                        Ok(None)
                    }
                })?
                .ok_or_else(|| SegmentError::Corruption("allocation node chain is empty".into()))?;
            if capacity >= n_pages {
                return Ok(true);
            }
            let (last_group, formatted) = last;
            let new_extent = if formatted < self.geometry.extents_per_node {
                last_group * self.geometry.extents_per_node + formatted
            } else {
                let new_group = last_group + 1;
                if self.format_seg_alloc_node(new_group, None)?.is_none() {
                    return Ok(false);
                }
                let mut guard = self.lock_node(self.geometry.seg_alloc_page(last_group))?;
                let data = guard.writable_data()?;
                write_u64(data, 8, self.geometry.seg_alloc_page(new_group).0);
                new_group * self.geometry.extents_per_node
            };
            if self.format_extent(new_extent)?.is_none() {
                return Ok(false);
            }
        }
    }

    fn page_successor(&self, page_id: PageId) -> Result<Option<PageId>> {
        let (_, owner, successor) = self.entry_for(page_id)?;
        if owner == PageOwnerId::UNALLOCATED_REPR {
            return Err(SegmentError::UnallocatedPage(page_id));
        }
        Ok(PageId::decode_opt(successor))
    }

    fn set_page_successor(&self, page_id: PageId, successor: Option<PageId>) -> Result<()> {
        let Some((extent, entry)) = self.geometry.locate(page_id) else {
            return Err(SegmentError::InvalidArgument(format!(
                "{:?} is an allocation node, not a data page",
                page_id
            )));
        };
        let mut guard = self.lock_node(self.geometry.extent_node_page(extent))?;
        let (owner, _) = read_entry(guard.data(), entry as usize);
        if owner == PageOwnerId::UNALLOCATED_REPR {
            return Err(SegmentError::UnallocatedPage(page_id));
        }
        let data = guard.writable_data()?;
        write_entry(data, entry as usize, owner, PageId::encode_opt(successor));
        Ok(())
    }

    fn usable_page_size(&self) -> usize {
        self.delegate.usable_page_size()
    }

    fn delegated_checkpoint(
        &self,
        requester: SegmentId,
        checkpoint_type: CheckpointType,
    ) -> Result<()> {
        // Allocation nodes are mapped under this segment's id, so the
        // predicate must also match self when the request started deeper.
        let own = self.id;
        self.cache
            .checkpoint_pages(|id| id == requester || id == own, checkpoint_type)?;
        self.delegate.delegated_checkpoint(requester, checkpoint_type)
    }
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(data[offset..offset + 4].try_into().unwrap())
}

fn write_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(data[offset..offset + 8].try_into().unwrap())
}

fn write_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

fn read_entry(data: &[u8], entry: usize) -> (u64, u64) {
    let offset = EXTENT_HEADER + entry * ENTRY_LEN;
    (read_u64(data, offset), read_u64(data, offset + 8))
}

fn write_entry(data: &mut [u8], entry: usize, owner: u64, successor: u64) {
    let offset = EXTENT_HEADER + entry * ENTRY_LEN;
    write_u64(data, offset, owner);
    write_u64(data, offset + 8, successor);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::segment::{LinearDeviceSegment, LinearSegmentOptions};

    fn fresh(pages_per_extent: u64) -> (Arc<PageCache>, Arc<RandomAllocationSegment>) {
        let cache = PageCache::new(256);
        let device_id = cache.register_device(Arc::new(MemDevice::new(256)));
        let leaf = LinearDeviceSegment::new(
            Arc::clone(&cache),
            device_id,
            LinearSegmentOptions {
                n_pages_increment: 4,
                ..Default::default()
            },
        )
        .unwrap();
        let segment =
            RandomAllocationSegment::format(Arc::clone(&cache), leaf, RandomSegmentOptions {
                pages_per_extent,
            })
            .unwrap();
        (cache, segment)
    }

    #[test]
    fn allocates_deallocates_and_reuses() {
        let (_cache, segment) = fresh(4);
        let owner = PageOwnerId(3);

        let a = segment.allocate_page_id(owner).unwrap().unwrap();
        let b = segment.allocate_page_id(owner).unwrap().unwrap();
        assert_ne!(a, b);
        assert!(segment.is_page_id_allocated(a));
        assert_eq!(segment.page_owner_id(a).unwrap(), owner);
        assert_eq!(segment.allocated_size_in_pages(), 2);

        segment.deallocate_page_range(Some(a), Some(a)).unwrap();
        assert!(!segment.is_page_id_allocated(a));
        assert_eq!(segment.allocated_size_in_pages(), 1);

        // Freed slot is reused before the extent grows.
        let c = segment.allocate_page_id(owner).unwrap().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn growth_spills_into_a_new_extent() {
        let (_cache, segment) = fresh(2);
        let mut pages = Vec::new();
        for _ in 0..5 {
            pages.push(segment.allocate_page_id(PageOwnerId::ANON).unwrap().unwrap());
        }
        assert_eq!(segment.allocated_size_in_pages(), 5);
        // First extent holds two data pages after its node at page 1.
        assert_eq!(pages[0], PageId(2));
        assert_eq!(pages[1], PageId(3));
        // Second extent's node sits right after, at page 4.
        assert_eq!(pages[2], PageId(5));
        for page in &pages {
            assert!(segment.is_page_id_allocated(*page));
        }
    }

    #[test]
    fn successors_persist_in_the_extent_map() {
        let (_cache, segment) = fresh(4);
        let a = segment.allocate_page_id(PageOwnerId::ANON).unwrap().unwrap();
        let b = segment.allocate_page_id(PageOwnerId::ANON).unwrap().unwrap();

        assert_eq!(segment.page_successor(a).unwrap(), None);
        segment.set_page_successor(a, Some(b)).unwrap();
        assert_eq!(segment.page_successor(a).unwrap(), Some(b));
        segment.set_page_successor(a, None).unwrap();
        assert_eq!(segment.page_successor(a).unwrap(), None);

        assert!(segment.page_successor(PageId(1)).is_err());
    }

    #[test]
    fn unallocated_pages_are_rejected() {
        let (_cache, segment) = fresh(4);
        let a = segment.allocate_page_id(PageOwnerId::ANON).unwrap().unwrap();
        let free = PageId(a.0 + 1);
        assert!(!segment.is_page_id_allocated(free));
        assert!(matches!(
            segment.page_owner_id(free),
            Err(SegmentError::UnallocatedPage(_))
        ));
        assert!(matches!(
            segment.deallocate_page_range(Some(free), Some(free)),
            Err(SegmentError::UnallocatedPage(_))
        ));
    }

    #[test]
    fn full_deallocation_reformats_everything() {
        let (_cache, segment) = fresh(2);
        for _ in 0..5 {
            segment.allocate_page_id(PageOwnerId::ANON).unwrap().unwrap();
        }
        segment.deallocate_page_range(None, None).unwrap();
        assert_eq!(segment.allocated_size_in_pages(), 0);
        let again = segment.allocate_page_id(PageOwnerId::ANON).unwrap().unwrap();
        assert_eq!(again, PageId(2));
    }

    #[test]
    fn counters_track_the_high_water_mark() {
        let (_cache, segment) = fresh(4);
        let a = segment.allocate_page_id(PageOwnerId::ANON).unwrap().unwrap();
        segment.allocate_page_id(PageOwnerId::ANON).unwrap().unwrap();
        assert_eq!(segment.pages_occupied_high_water(), 2);
        segment.deallocate_page_range(Some(a), Some(a)).unwrap();
        assert_eq!(segment.allocated_size_in_pages(), 1);
        assert_eq!(segment.count_allocated_pages().unwrap(), 1);
        assert_eq!(segment.pages_occupied_high_water(), 2);
    }

    #[test]
    fn survives_checkpoint_and_reopen() {
        let cache = PageCache::new(256);
        let device_id = cache.register_device(Arc::new(MemDevice::new(256)));
        let options = RandomSegmentOptions { pages_per_extent: 4 };
        let leaf = LinearDeviceSegment::new(
            Arc::clone(&cache),
            device_id,
            LinearSegmentOptions::default(),
        )
        .unwrap();
        let allocated = {
            let segment = RandomAllocationSegment::format(
                Arc::clone(&cache),
                leaf.clone(),
                options.clone(),
            )
            .unwrap();
            let page = segment.allocate_page_id(PageOwnerId(11)).unwrap().unwrap();
            segment.checkpoint(CheckpointType::FlushAll).unwrap();
            page
        };

        let reopened =
            RandomAllocationSegment::open(Arc::clone(&cache), leaf, options).unwrap();
        assert!(reopened.is_page_id_allocated(allocated));
        assert_eq!(reopened.page_owner_id(allocated).unwrap(), PageOwnerId(11));
    }
}
