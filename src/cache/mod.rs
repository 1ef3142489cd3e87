#![forbid(unsafe_code)]

//! Page cache collaborator.
//!
//! The cache owns every in-memory page copy and mediates all device I/O.
//! Each mapped page carries a weak handle to the segment registered as its
//! [`MappedPageListener`]; the cache invokes the listener's callbacks on
//! map, unmap, dirty, flush and checkpoint events, and honors the
//! `can_flush_page` veto outside checkpoints. Segments hold a strong
//! `Arc<PageCache>` while the registry only holds weak segment handles, so
//! the two sides never form an ownership cycle.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex, RwLock};

use crate::device::BlockDevice;
use crate::error::{Result, SegmentError};
use crate::segment::{Segment, SegmentId, SegmentRef};
use crate::types::{BlockId, CheckpointType, DeviceId, PageId, PageOwnerId};

/// Callbacks a segment receives for pages mapped under its care.
///
/// The segment layer both implements this trait (to receive events) and
/// forwards it along decorator chains (to remain transparent).
pub trait MappedPageListener: Send + Sync {
    /// A page copy for one of this listener's blocks entered the cache.
    fn notify_page_map(&self, _page: &mut CachePage) {}
    /// The page copy is about to leave the cache.
    fn notify_page_unmap(&self, _page: &mut CachePage) {}
    /// The page's contents were read from the device.
    fn notify_after_page_read(&self, _page: &mut CachePage) -> Result<()> {
        Ok(())
    }
    /// The page is about to be modified for the first time since it was
    /// mapped or last flushed. `data_was_valid` is false for freshly
    /// allocated pages whose contents were never initialized.
    fn notify_page_dirty(&self, _page: &mut CachePage, _data_was_valid: bool) -> Result<()> {
        Ok(())
    }
    /// The page is about to be written back to the device.
    fn notify_before_page_flush(&self, _page: &mut CachePage) -> Result<()> {
        Ok(())
    }
    /// The page was written back to the device.
    fn notify_after_page_flush(&self, _page: &CachePage) {}
    /// The page was written back as part of a fuzzy checkpoint set.
    fn notify_after_page_checkpoint_flush(&self, _page: &CachePage) {}
    /// Veto point consulted before lazily writing a dirty page back.
    /// Returning false defers the flush; checkpoint flushes are exempt
    /// because the checkpoint protocol has already made them safe.
    fn can_flush_page(&self, _page: &CachePage) -> bool {
        true
    }
}

/// In-memory copy of one physical block.
pub struct CachePage {
    block_id: BlockId,
    data: Box<[u8]>,
    dirty: bool,
    data_valid: bool,
    eviction_hint: bool,
}

impl CachePage {
    fn new(block_id: BlockId, page_size: usize) -> Self {
        Self {
            block_id,
            data: vec![0; page_size].into_boxed_slice(),
            dirty: false,
            data_valid: false,
            eviction_hint: false,
        }
    }

    /// Physical address of the block this page shadows.
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Full page contents, footer included.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable full page contents. Only listener callbacks should reach
    /// past the usable region; clients go through [`PageGuard`].
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// True if the copy has edits not yet written back.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// True once the copy holds real contents (read or written).
    pub fn is_data_valid(&self) -> bool {
        self.data_valid
    }
}

type PageHandle = Arc<Mutex<CachePage>>;

/// Dirty-page bookkeeping carried across fuzzy checkpoints.
///
/// A page is written out only if it was already dirty when the previous
/// fuzzy checkpoint ran; pages dirtied since then are recorded and wait
/// for the next round. No page stays unflushed for more than two rounds,
/// and the recovery log retained for the skipped pages stays one
/// checkpoint deep.
#[derive(Default)]
pub struct FuzzyCheckpointSet {
    old_dirty: HashSet<BlockId>,
    new_dirty: Vec<BlockId>,
}

impl FuzzyCheckpointSet {
    fn should_flush(&mut self, block_id: BlockId) -> bool {
        if self.old_dirty.contains(&block_id) {
            true
        } else {
            self.new_dirty.push(block_id);
            false
        }
    }

    /// Promotes the pages skipped this round into the next round's set.
    pub fn finish_checkpoint(&mut self) {
        self.old_dirty = self.new_dirty.drain(..).collect();
    }

    /// Forgets all tracked pages. Called after a full checkpoint, which
    /// leaves nothing dirty to carry over.
    pub fn clear(&mut self) {
        self.old_dirty.clear();
        self.new_dirty.clear();
    }
}

struct Slot {
    page: PageHandle,
    listener: Weak<dyn Segment>,
    listener_id: SegmentId,
}

impl Slot {
    fn listener(&self) -> Option<SegmentRef> {
        self.listener.upgrade()
    }
}

/// Exclusive lock on one mapped page.
///
/// `writable_data` marks the page dirty *before* handing out the mutable
/// slice, so listeners observe the pre-edit contents; the versioned
/// segment's before-image copy depends on this ordering.
pub struct PageGuard {
    listener: SegmentRef,
    page_id: PageId,
    usable: usize,
    guard: ArcMutexGuard<RawMutex, CachePage>,
}

impl PageGuard {
    /// Page id in the address space of the locking segment.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Physical block backing the page.
    pub fn block_id(&self) -> BlockId {
        self.guard.block_id()
    }

    /// True if the page has unwritten edits.
    pub fn is_dirty(&self) -> bool {
        self.guard.is_dirty()
    }

    /// True once the page holds real contents.
    pub fn is_data_valid(&self) -> bool {
        self.guard.is_data_valid()
    }

    /// Read access to the usable page region (footer excluded).
    pub fn data(&self) -> &[u8] {
        &self.guard.data()[..self.usable]
    }

    /// Marks the page dirty, driving the listener's `notify_page_dirty`
    /// if the page was clean, then returns the usable region mutably.
    pub fn writable_data(&mut self) -> Result<&mut [u8]> {
        self.mark_dirty()?;
        let usable = self.usable;
        Ok(&mut self.guard.data_mut()[..usable])
    }

    /// Marks the page dirty without touching its contents yet.
    pub fn mark_dirty(&mut self) -> Result<()> {
        if self.guard.dirty {
            return Ok(());
        }
        let data_was_valid = self.guard.data_valid;
        self.guard.dirty = true;
        self.guard.data_valid = true;
        self.listener.notify_page_dirty(&mut self.guard, data_was_valid)
    }

    pub(crate) fn full_data(&self) -> &[u8] {
        self.guard.data()
    }

    pub(crate) fn full_data_mut(&mut self) -> &mut [u8] {
        self.guard.data_mut()
    }
}

/// Block-addressed page cache with a listener registry.
pub struct PageCache {
    page_size: usize,
    devices: RwLock<HashMap<DeviceId, Arc<dyn BlockDevice>>>,
    next_device: Mutex<u32>,
    // BTreeMap so checkpoint flushes walk blocks in address order; the WAL
    // durability frontier advances monotonically that way.
    slots: Mutex<BTreeMap<BlockId, Slot>>,
}

impl PageCache {
    /// Creates a cache for pages of `page_size` bytes.
    pub fn new(page_size: usize) -> Arc<Self> {
        Arc::new(Self {
            page_size,
            devices: RwLock::new(HashMap::new()),
            next_device: Mutex::new(0),
            slots: Mutex::new(BTreeMap::new()),
        })
    }

    /// Size of every page and device block managed by this cache.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Registers a device and returns its assigned id. Ids are assigned in
    /// registration order, so a restart that registers the same devices in
    /// the same order reproduces the same ids.
    pub fn register_device(&self, device: Arc<dyn BlockDevice>) -> DeviceId {
        let mut next = self.next_device.lock();
        let id = DeviceId(*next);
        *next += 1;
        self.devices.write().insert(id, device);
        id
    }

    /// Looks up a registered device.
    pub fn device(&self, id: DeviceId) -> Result<Arc<dyn BlockDevice>> {
        self.devices
            .read()
            .get(&id)
            .cloned()
            .ok_or(SegmentError::UnknownDevice(id))
    }

    /// Listener registered for `block_id`, if the block is mapped and the
    /// segment is still alive.
    pub fn mapped_page_listener(&self, block_id: BlockId) -> Option<SegmentRef> {
        self.slots.lock().get(&block_id).and_then(Slot::listener)
    }

    fn slot_for(
        &self,
        listener: &SegmentRef,
        block_id: BlockId,
    ) -> (PageHandle, bool) {
        let mut slots = self.slots.lock();
        match slots.get(&block_id) {
            Some(slot) => (Arc::clone(&slot.page), false),
            None => {
                let page = Arc::new(Mutex::new(CachePage::new(block_id, self.page_size)));
                slots.insert(
                    block_id,
                    Slot {
                        page: Arc::clone(&page),
                        listener: Arc::downgrade(listener),
                        listener_id: listener.segment_id(),
                    },
                );
                (page, true)
            }
        }
    }

    /// Locks the page for `page_id` in `segment`'s address space, reading
    /// it from the device if this is its first mapping.
    pub fn lock_page(&self, segment: &SegmentRef, page_id: PageId) -> Result<PageGuard> {
        let block_id = segment.translate_page_id(page_id)?;
        let (handle, fresh) = self.slot_for(segment, block_id);
        let mut guard = Mutex::lock_arc(&handle);
        if fresh {
            segment.notify_page_map(&mut guard);
        }
        if !guard.data_valid && !guard.dirty {
            let device = self.device(block_id.device)?;
            device.read_block(block_id.block, guard.data_mut())?;
            guard.data_valid = true;
            segment.notify_after_page_read(&mut guard)?;
        }
        Ok(PageGuard {
            listener: Arc::clone(segment),
            page_id,
            usable: segment.usable_page_size(),
            guard,
        })
    }

    /// Locks the page for `page_id` without reading the device; the page
    /// starts zeroed and data-invalid. Used for freshly allocated pages.
    pub fn lock_new_page(&self, segment: &SegmentRef, page_id: PageId) -> Result<PageGuard> {
        let block_id = segment.translate_page_id(page_id)?;
        let (handle, fresh) = self.slot_for(segment, block_id);
        let mut guard = Mutex::lock_arc(&handle);
        debug_assert!(!guard.dirty, "reallocated a block with unflushed edits");
        guard.data_mut().fill(0);
        guard.data_valid = false;
        if fresh {
            segment.notify_page_map(&mut guard);
        }
        Ok(PageGuard {
            listener: Arc::clone(segment),
            page_id,
            usable: segment.usable_page_size(),
            guard,
        })
    }

    /// Allocates a page from `segment` and maps it. `Ok(None)` means the
    /// segment is out of space.
    pub fn allocate_page(
        &self,
        segment: &SegmentRef,
        owner_id: PageOwnerId,
    ) -> Result<Option<PageGuard>> {
        match segment.allocate_page_id(owner_id)? {
            Some(page_id) => Ok(Some(self.lock_new_page(segment, page_id)?)),
            None => Ok(None),
        }
    }

    /// Writes one dirty page back, honoring the listener's flush veto.
    /// Returns true if the page was written.
    pub fn flush_page(&self, block_id: BlockId) -> Result<bool> {
        let entry = {
            let slots = self.slots.lock();
            slots
                .get(&block_id)
                .map(|slot| (Arc::clone(&slot.page), slot.listener()))
        };
        let Some((handle, listener)) = entry else {
            return Ok(false);
        };
        let Some(listener) = listener else {
            return Ok(false);
        };
        let mut guard = Mutex::lock_arc(&handle);
        if !guard.dirty {
            return Ok(false);
        }
        if !listener.can_flush_page(&guard) {
            return Ok(false);
        }
        self.write_back(&listener, &mut guard, false)?;
        Ok(true)
    }

    fn write_back(
        &self,
        listener: &SegmentRef,
        guard: &mut CachePage,
        checkpoint: bool,
    ) -> Result<()> {
        listener.notify_before_page_flush(guard)?;
        let device = self.device(guard.block_id.device)?;
        device.write_block(guard.block_id.block, guard.data())?;
        guard.dirty = false;
        listener.notify_after_page_flush(guard);
        if checkpoint {
            listener.notify_after_page_checkpoint_flush(guard);
        }
        Ok(())
    }

    /// Flushes (or discards) every mapped page whose listener id satisfies
    /// `keep`. Pages are visited in block order.
    pub fn checkpoint_pages<F>(&self, keep: F, checkpoint_type: CheckpointType) -> Result<()>
    where
        F: Fn(SegmentId) -> bool,
    {
        let matching: Vec<(BlockId, PageHandle, Option<SegmentRef>)> = {
            let slots = self.slots.lock();
            slots
                .iter()
                .filter(|(_, slot)| keep(slot.listener_id))
                .map(|(block, slot)| (*block, Arc::clone(&slot.page), slot.listener()))
                .collect()
        };
        match checkpoint_type {
            CheckpointType::FlushAll | CheckpointType::FlushFuzzy => {
                let fuzzy = checkpoint_type == CheckpointType::FlushFuzzy;
                for (_, handle, listener) in matching {
                    let Some(listener) = listener else { continue };
                    let mut guard = Mutex::lock_arc(&handle);
                    if !guard.dirty {
                        continue;
                    }
                    debug_assert!(
                        listener.can_flush_page(&guard),
                        "checkpoint flush vetoed; log checkpoint ordering broken"
                    );
                    self.write_back(&listener, &mut guard, fuzzy)?;
                }
            }
            CheckpointType::Discard => {
                for (block, handle, listener) in matching {
                    {
                        let mut guard = Mutex::lock_arc(&handle);
                        if let Some(listener) = listener {
                            listener.notify_page_unmap(&mut guard);
                        }
                        guard.dirty = false;
                        guard.data_valid = false;
                    }
                    self.slots.lock().remove(&block);
                }
            }
        }
        Ok(())
    }

    /// Fuzzy variant of [`checkpoint_pages`](Self::checkpoint_pages):
    /// visits the same dirty pages but writes back only those `fuzzy`
    /// selects, recording the rest for the next round.
    pub fn checkpoint_pages_fuzzy<F>(
        &self,
        keep: F,
        fuzzy: &mut FuzzyCheckpointSet,
    ) -> Result<()>
    where
        F: Fn(SegmentId) -> bool,
    {
        let matching: Vec<(BlockId, PageHandle, Option<SegmentRef>)> = {
            let slots = self.slots.lock();
            slots
                .iter()
                .filter(|(_, slot)| keep(slot.listener_id))
                .map(|(block, slot)| (*block, Arc::clone(&slot.page), slot.listener()))
                .collect()
        };
        for (block, handle, listener) in matching {
            let Some(listener) = listener else { continue };
            let mut guard = Mutex::lock_arc(&handle);
            if !guard.dirty {
                continue;
            }
            if !fuzzy.should_flush(block) {
                continue;
            }
            debug_assert!(
                listener.can_flush_page(&guard),
                "checkpoint flush vetoed; log checkpoint ordering broken"
            );
            self.write_back(&listener, &mut guard, true)?;
        }
        Ok(())
    }

    /// Drops the mapping for `block_id`, discarding any unwritten edits.
    /// Used when a segment deallocates the page.
    pub fn discard_page(&self, block_id: BlockId) {
        let entry = {
            let mut slots = self.slots.lock();
            slots.remove(&block_id)
        };
        if let Some(slot) = entry {
            let mut guard = Mutex::lock_arc(&slot.page);
            if let Some(listener) = slot.listener() {
                listener.notify_page_unmap(&mut guard);
            }
        }
    }

    /// Marks the page a good eviction candidate.
    pub fn nice_page(&self, block_id: BlockId) {
        let handle = {
            let slots = self.slots.lock();
            slots.get(&block_id).map(|slot| Arc::clone(&slot.page))
        };
        if let Some(handle) = handle {
            Mutex::lock_arc(&handle).eviction_hint = true;
        }
    }

    /// Evicts clean pages previously hinted via [`nice_page`](Self::nice_page).
    /// Returns the number of pages dropped.
    pub fn reclaim(&self) -> usize {
        let candidates: Vec<(BlockId, PageHandle, Option<SegmentRef>)> = {
            let slots = self.slots.lock();
            slots
                .iter()
                .map(|(block, slot)| (*block, Arc::clone(&slot.page), slot.listener()))
                .collect()
        };
        let mut dropped = 0;
        for (block, handle, listener) in candidates {
            let mut guard = Mutex::lock_arc(&handle);
            if guard.dirty || !guard.eviction_hint {
                continue;
            }
            if let Some(listener) = listener.as_ref() {
                listener.notify_page_unmap(&mut guard);
            }
            drop(guard);
            self.slots.lock().remove(&block);
            dropped += 1;
        }
        dropped
    }

    /// Number of currently mapped pages.
    pub fn mapped_pages(&self) -> usize {
        self.slots.lock().len()
    }
}
