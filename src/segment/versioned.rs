use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::cache::{CachePage, FuzzyCheckpointSet, MappedPageListener, PageCache};
use crate::error::{Result, SegmentError};
use crate::segment::{Segment, SegmentId, SegmentRef, WalSegment};
use crate::types::{
    body_checksum, AllocationOrder, BlockId, CheckpointType, PageId, PageOwnerId, PseudoUuid,
    SegVersionNum,
};

/// Bytes reserved at the end of every page for the version footer.
pub const FOOTER_LEN: usize = 40;

/// Trailer carried by every page of a shadow-paged segment.
///
/// Data pages carry a canonical footer: no data-page id, the version
/// current when the page was last dirtied, the online uuid, checksum zero.
/// Logged before-images carry the id of the data page they shadow and a
/// checksum over the rest of the page; [`body_checksum`] never yields
/// zero, so the checksum field alone tells the two kinds apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionedPageFooter {
    /// Data page this image shadows; `None` on data pages themselves.
    pub data_page_id: Option<PageId>,
    /// Version number current when the page was written.
    pub version: SegVersionNum,
    /// Identity of the online instance that wrote the page.
    pub online_uuid: PseudoUuid,
    /// Checksum over the page body; zero on data pages.
    pub checksum: u64,
}

impl VersionedPageFooter {
    /// Decodes the footer from the trailing bytes of a full page.
    pub fn read(page: &[u8]) -> Self {
        let base = page.len() - FOOTER_LEN;
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&page[base + 16..base + 32]);
        Self {
            data_page_id: PageId::decode_opt(read_u64(page, base)),
            version: read_u64(page, base + 8),
            online_uuid: PseudoUuid(uuid),
            checksum: read_u64(page, base + 32),
        }
    }

    /// Encodes the footer into the trailing bytes of a full page.
    pub fn write(&self, page: &mut [u8]) {
        let base = page.len() - FOOTER_LEN;
        write_u64(page, base, PageId::encode_opt(self.data_page_id));
        write_u64(page, base + 8, self.version);
        page[base + 16..base + 32].copy_from_slice(&self.online_uuid.0);
        write_u64(page, base + 32, self.checksum);
    }
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(data[offset..offset + 8].try_into().unwrap())
}

fn write_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// Checksum over everything before the trailing checksum field.
fn page_checksum(page: &[u8]) -> u64 {
    body_checksum(&page[..page.len() - 8])
}

struct VersionedState {
    version: SegVersionNum,
    online_uuid: PseudoUuid,
    // Data pages whose before-image was logged this epoch.
    data_to_log: FxHashMap<PageId, PageId>,
    oldest_log_page: Option<PageId>,
    newest_log_page: Option<PageId>,
    // Newest log page at the time of the last completed checkpoint.
    last_checkpoint_log_page: Option<PageId>,
    // Log range whose checkpoint is durable and may be deallocated.
    reclaimable_log_page: Option<PageId>,
    in_recovery: bool,
}

/// Shadow-paging decorator: logs a before-image of every page before its
/// first in-place modification of the current epoch, vetoes data flushes
/// that would outrun the log, and replays the log after a crash.
///
/// The log must be the `WalSegment → CircularSegment → LinearDeviceSegment`
/// chain; the WAL tracker is held concretely so the flush veto can read
/// the log durability frontier.
pub struct VersionedSegment {
    id: SegmentId,
    cache: Arc<PageCache>,
    data: SegmentRef,
    wal: Arc<WalSegment>,
    log: SegmentRef,
    state: Mutex<VersionedState>,
    fuzzy_set: Mutex<FuzzyCheckpointSet>,
    weak_self: Weak<VersionedSegment>,
}

impl VersionedSegment {
    /// Wraps `data` with shadow paging backed by the `wal` log chain.
    /// `version` and `online_uuid` come from the last checkpoint record
    /// (zero / freshly generated for a new store).
    pub fn new(
        cache: Arc<PageCache>,
        data: SegmentRef,
        wal: Arc<WalSegment>,
        version: SegVersionNum,
        online_uuid: PseudoUuid,
    ) -> Arc<Self> {
        let log: SegmentRef = wal.clone();
        Arc::new_cyclic(|weak_self| Self {
            id: SegmentId::next(),
            cache,
            data,
            wal,
            log,
            state: Mutex::new(VersionedState {
                version,
                online_uuid,
                data_to_log: FxHashMap::default(),
                oldest_log_page: None,
                newest_log_page: None,
                last_checkpoint_log_page: None,
                reclaimable_log_page: None,
                in_recovery: false,
            }),
            fuzzy_set: Mutex::new(FuzzyCheckpointSet::default()),
            weak_self: weak_self.clone(),
        })
    }

    fn self_ref(&self) -> SegmentRef {
        self.weak_self
            .upgrade()
            .expect("segment outlived by its own page guard")
    }

    /// Current version number; incremented by each non-DISCARD checkpoint.
    pub fn version_number(&self) -> SegVersionNum {
        self.state.lock().version
    }

    /// Identity stamped into pages written by this instance.
    pub fn online_uuid(&self) -> PseudoUuid {
        self.state.lock().online_uuid
    }

    /// The log chain this segment writes before-images to.
    pub fn log_segment(&self) -> SegmentRef {
        Arc::clone(&self.log)
    }

    /// Version recorded in a data page's footer.
    pub fn page_version(&self, page_id: PageId) -> Result<SegVersionNum> {
        let guard = self.cache.lock_page(&self.self_ref(), page_id)?;
        Ok(VersionedPageFooter::read(guard.full_data()).version)
    }

    /// Log page recovery should start from: the oldest retained image, or
    /// the first log page when nothing is retained.
    pub fn recovery_page_id(&self) -> PageId {
        self.state.lock().oldest_log_page.unwrap_or(PageId(0))
    }

    /// Log page online recovery should start from: the first image logged
    /// after the last completed checkpoint.
    pub fn online_recovery_page_id(&self) -> PageId {
        let state = self.state.lock();
        match state.last_checkpoint_log_page {
            Some(page) => PageId(page.0 + 1),
            None => state.oldest_log_page.unwrap_or(PageId(0)),
        }
    }

    /// Before an online recovery pass: force the whole log out to disk
    /// (without discarding it, since recovery is about to read it), then
    /// forget the current epoch's image map and rewind the retained-log
    /// marker to the last checkpoint.
    pub fn prepare_online_recovery(&self) -> Result<()> {
        self.log.checkpoint(CheckpointType::FlushAll)?;
        let mut state = self.state.lock();
        state.data_to_log.clear();
        if let Some(page) = state.last_checkpoint_log_page {
            state.oldest_log_page = Some(PageId(page.0 + 1));
        }
        Ok(())
    }

    /// Deallocates the log range made reclaimable by the last checkpoint.
    /// Called once the checkpoint record itself is durable; until then the
    /// old images must survive a crash.
    pub fn deallocate_checkpointed_log(&self) -> Result<()> {
        let upto = self.state.lock().reclaimable_log_page.take();
        let Some(upto) = upto else {
            return Ok(());
        };
        self.log.deallocate_page_range(None, Some(upto))?;
        let mut state = self.state.lock();
        if state.newest_log_page == Some(upto) {
            state.oldest_log_page = None;
            state.newest_log_page = None;
            state.last_checkpoint_log_page = None;
        } else {
            state.oldest_log_page = Some(PageId(upto.0 + 1));
        }
        Ok(())
    }

    // Writes the before-image of `page` (a clean, valid data page about to
    // be modified) to a fresh log page.
    fn log_before_image(&self, page: &CachePage, data_page_id: PageId) -> Result<PageId> {
        let Some(log_page_id) = self.log.allocate_page_id(PageOwnerId::ANON)? else {
            return Err(SegmentError::LogFull);
        };
        let (version, uuid) = {
            let state = self.state.lock();
            (state.version, state.online_uuid)
        };
        let mut log_guard = self.cache.lock_new_page(&self.log, log_page_id)?;
        log_guard.mark_dirty()?;
        let full = log_guard.full_data_mut();
        full.copy_from_slice(page.data());
        let mut footer = VersionedPageFooter {
            data_page_id: Some(data_page_id),
            version,
            online_uuid: uuid,
            checksum: 0,
        };
        footer.write(full);
        footer.checksum = page_checksum(full);
        footer.write(full);
        let log_block = log_guard.block_id();
        drop(log_guard);
        // Images are written once and read only by recovery.
        self.cache.nice_page(log_block);
        Ok(log_page_id)
    }
}

impl MappedPageListener for VersionedSegment {
    fn notify_page_map(&self, page: &mut CachePage) {
        self.data.notify_page_map(page);
    }

    fn notify_page_unmap(&self, page: &mut CachePage) {
        self.data.notify_page_unmap(page);
    }

    fn notify_after_page_read(&self, page: &mut CachePage) -> Result<()> {
        self.data.notify_after_page_read(page)
    }

    fn notify_page_dirty(&self, page: &mut CachePage, data_was_valid: bool) -> Result<()> {
        self.data.notify_page_dirty(page, data_was_valid)?;
        let (in_recovery, version) = {
            let state = self.state.lock();
            (state.in_recovery, state.version)
        };
        if in_recovery {
            // Recovery restamps footers itself after copying each image.
            return Ok(());
        }
        if !data_was_valid {
            // Freshly allocated page: nothing to shadow, stamp and go.
            VersionedPageFooter {
                data_page_id: None,
                version,
                online_uuid: PseudoUuid::INVALID,
                checksum: 0,
            }
            .write(page.data_mut());
            return Ok(());
        }
        let footer = VersionedPageFooter::read(page.data());
        if footer.version == version {
            // Already versioned this epoch; the retained image (if any)
            // is the one recovery needs.
            return Ok(());
        }
        if footer.version > version {
            return Err(SegmentError::Corruption(format!(
                "page footer version {} ahead of segment version {}",
                footer.version, version
            )));
        }
        let data_page_id = self.data.translate_block_id(page.block_id())?;
        let log_page_id = self.log_before_image(page, data_page_id)?;
        {
            let mut state = self.state.lock();
            state.data_to_log.insert(data_page_id, log_page_id);
            state.newest_log_page = Some(log_page_id);
            if state.oldest_log_page.is_none() {
                state.oldest_log_page = Some(log_page_id);
            }
        }
        VersionedPageFooter {
            data_page_id: None,
            version,
            online_uuid: PseudoUuid::INVALID,
            checksum: 0,
        }
        .write(page.data_mut());
        Ok(())
    }

    fn notify_before_page_flush(&self, page: &mut CachePage) -> Result<()> {
        self.data.notify_before_page_flush(page)
    }

    fn notify_after_page_flush(&self, page: &CachePage) {
        self.data.notify_after_page_flush(page);
    }

    fn notify_after_page_checkpoint_flush(&self, page: &CachePage) {
        self.data.notify_after_page_checkpoint_flush(page);
    }

    fn can_flush_page(&self, page: &CachePage) -> bool {
        // The write-ahead rule: a data page may reach the device only
        // once its before-image is durable.
        let Some(min_dirty) = self.wal.min_dirty_page_id() else {
            return self.data.can_flush_page(page);
        };
        let Ok(data_page_id) = self.data.translate_block_id(page.block_id()) else {
            return false;
        };
        match self.state.lock().data_to_log.get(&data_page_id) {
            Some(&log_page) if log_page >= min_dirty => false,
            _ => self.data.can_flush_page(page),
        }
    }
}

impl Segment for VersionedSegment {
    fn segment_id(&self) -> SegmentId {
        self.id
    }

    fn allocation_order(&self) -> AllocationOrder {
        self.data.allocation_order()
    }

    fn translate_page_id(&self, page_id: PageId) -> Result<BlockId> {
        self.data.translate_page_id(page_id)
    }

    fn translate_block_id(&self, block_id: BlockId) -> Result<PageId> {
        self.data.translate_block_id(block_id)
    }

    fn allocate_page_id(&self, owner_id: PageOwnerId) -> Result<Option<PageId>> {
        self.data.allocate_page_id(owner_id)
    }

    fn deallocate_page_range(&self, start: Option<PageId>, end: Option<PageId>) -> Result<()> {
        match (start, end) {
            (Some(s), Some(e)) if s == e => {
                // Shadow the page before it goes away so recovery can
                // restore its final contents.
                {
                    let mut guard = self.cache.lock_page(&self.self_ref(), s)?;
                    guard.mark_dirty()?;
                }
                self.data.deallocate_page_range(Some(s), Some(s))
            }
            _ => Err(SegmentError::Unsupported(
                "versioned segments deallocate one page at a time",
            )),
        }
    }

    fn is_page_id_allocated(&self, page_id: PageId) -> bool {
        self.data.is_page_id_allocated(page_id)
    }

    fn allocated_size_in_pages(&self) -> u64 {
        self.data.allocated_size_in_pages()
    }

    fn ensure_allocated_size(&self, n_pages: u64) -> Result<bool> {
        self.data.ensure_allocated_size(n_pages)
    }

    fn page_successor(&self, page_id: PageId) -> Result<Option<PageId>> {
        self.data.page_successor(page_id)
    }

    fn set_page_successor(&self, page_id: PageId, successor: Option<PageId>) -> Result<()> {
        self.data.set_page_successor(page_id, successor)
    }

    fn usable_page_size(&self) -> usize {
        self.data.usable_page_size() - FOOTER_LEN
    }

    fn delegated_checkpoint(
        &self,
        requester: SegmentId,
        checkpoint_type: CheckpointType,
    ) -> Result<()> {
        if checkpoint_type != CheckpointType::Discard {
            // Log first, so no data flush below can be vetoed.
            self.log.checkpoint(CheckpointType::FlushAll)?;
        }
        if checkpoint_type == CheckpointType::FlushFuzzy {
            // Write back only pages that have stayed dirty since the
            // previous checkpoint; younger pages wait one more round and
            // are covered by the retained log until then.
            let own_id = self.id;
            let mut fuzzy = self.fuzzy_set.lock();
            self.cache.checkpoint_pages_fuzzy(
                |id| id == requester || id == own_id,
                &mut fuzzy,
            )?;
            fuzzy.finish_checkpoint();
        } else {
            self.data.delegated_checkpoint(requester, checkpoint_type)?;
            self.fuzzy_set.lock().clear();
        }
        if checkpoint_type == CheckpointType::Discard {
            self.log.checkpoint(CheckpointType::Discard)?;
            self.log.deallocate_page_range(None, None)?;
        }
        let mut state = self.state.lock();
        state.data_to_log.clear();
        match checkpoint_type {
            CheckpointType::Discard => {
                // Version unchanged: nothing new became durable.
                state.oldest_log_page = None;
                state.newest_log_page = None;
                state.last_checkpoint_log_page = None;
                state.reclaimable_log_page = None;
            }
            CheckpointType::FlushAll => {
                state.version += 1;
                // Everything logged so far shadows now-durable pages.
                state.reclaimable_log_page = state.newest_log_page;
                state.last_checkpoint_log_page = state.newest_log_page;
            }
            CheckpointType::FlushFuzzy => {
                state.version += 1;
                // Retain one checkpoint's worth of images; older ones are
                // reclaimable. Recovery skips stale images by version.
                state.reclaimable_log_page = state.last_checkpoint_log_page;
                state.last_checkpoint_log_page = state.newest_log_page;
            }
        }
        debug!(
            target: "ombra::segment",
            checkpoint_type = ?checkpoint_type,
            version = state.version,
            newest_log = ?state.newest_log_page,
            "versioned.checkpoint"
        );
        Ok(())
    }
}

impl VersionedSegment {
    /// Replays logged before-images onto the data segment after a crash.
    ///
    /// Scans the log forward from `first_log_page_id`, restoring the first
    /// image seen for each data page whose footer version is newer than
    /// `target_version` (the version persisted by the checkpoint being
    /// recovered to). The scan soft-stops at the log tail: a read failure,
    /// checksum mismatch, or uuid mismatch all mean the remaining pages
    /// were never completely written. Restored pages are left dirty; the
    /// caller checkpoints afterwards to make them durable.
    ///
    /// Returns the number of pages restored.
    pub fn recover(
        &self,
        first_log_page_id: PageId,
        target_version: SegVersionNum,
        expected_uuid: Option<PseudoUuid>,
    ) -> Result<u64> {
        let uuid = {
            let mut state = self.state.lock();
            if !state.data_to_log.is_empty() {
                return Err(SegmentError::Protocol(
                    "recovery requires an empty page map",
                ));
            }
            state.in_recovery = true;
            expected_uuid.unwrap_or(state.online_uuid)
        };
        let outcome = self.recover_scan(first_log_page_id, target_version, uuid);
        self.state.lock().in_recovery = false;
        outcome
    }

    fn recover_scan(
        &self,
        first_log_page_id: PageId,
        target_version: SegVersionNum,
        uuid: PseudoUuid,
    ) -> Result<u64> {
        let mut restored_pages: FxHashSet<PageId> = FxHashSet::default();
        let mut scanned_blocks: FxHashSet<BlockId> = FxHashSet::default();
        let mut restored = 0u64;
        let mut cursor = Some(first_log_page_id);
        while let Some(log_page_id) = cursor {
            // The ring aliases blocks; seeing one twice means the scan
            // wrapped all the way around.
            let Ok(log_block) = self.log.translate_page_id(log_page_id) else {
                break;
            };
            if !scanned_blocks.insert(log_block) {
                break;
            }
            let image = match self.cache.lock_page(&self.log, log_page_id) {
                Ok(guard) => guard.full_data().to_vec(),
                Err(err) => {
                    debug!(
                        target: "ombra::segment",
                        log_page = log_page_id.0,
                        %err,
                        "versioned.recover.stop"
                    );
                    break;
                }
            };
            let footer = VersionedPageFooter::read(&image);
            if footer.checksum == 0 || footer.checksum != page_checksum(&image) {
                debug!(
                    target: "ombra::segment",
                    log_page = log_page_id.0,
                    "versioned.recover.stop"
                );
                break;
            }
            if footer.online_uuid != uuid {
                warn!(
                    target: "ombra::segment",
                    log_page = log_page_id.0,
                    "versioned.recover.uuid_mismatch"
                );
                break;
            }
            let Some(data_page_id) = footer.data_page_id else {
                break;
            };
            if footer.version > target_version + 1 {
                return Err(SegmentError::Corruption(format!(
                    "log page {} carries version {} past recovery target {}",
                    log_page_id.0, footer.version, target_version
                )));
            }
            if footer.version > target_version && restored_pages.insert(data_page_id) {
                let mut guard = self.cache.lock_new_page(&self.self_ref(), data_page_id)?;
                guard.mark_dirty()?;
                let full = guard.full_data_mut();
                full.copy_from_slice(&image);
                VersionedPageFooter {
                    data_page_id: None,
                    version: footer.version,
                    online_uuid: PseudoUuid::INVALID,
                    checksum: 0,
                }
                .write(full);
                restored += 1;
            }
            cursor = self.log.page_successor(log_page_id)?;
        }
        debug!(
            target: "ombra::segment",
            restored,
            target_version,
            "versioned.recover.done"
        );
        Ok(restored)
    }
}
