//! Crash recovery scenarios: shadow-paged edits replayed from the log
//! after losing the cache.

use std::sync::{Arc, Once};

use tracing_subscriber::EnvFilter;

use ombra::device::{BlockDevice, MemDevice};
use ombra::{
    CheckpointType, LinearSegmentOptions, PageCache, PageId, PageOwnerId, PseudoUuid,
    RandomSegmentOptions, Segment, SegmentBuilder, SegmentError, SegmentRef, VersionedSegment,
};

const PAGE: usize = 256;
const RING: u64 = 8;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("ombra::segment=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

/// Devices survive a "crash"; caches and segments do not.
struct Harness {
    data_dev: Arc<MemDevice>,
    log_dev: Arc<MemDevice>,
    uuid: PseudoUuid,
}

impl Harness {
    fn new() -> Self {
        init_tracing();
        Self {
            data_dev: Arc::new(MemDevice::new(PAGE)),
            log_dev: Arc::new(MemDevice::new(PAGE)),
            uuid: PseudoUuid::generate(),
        }
    }

    /// Builds a fresh cache and stack over the surviving devices, as a
    /// restart would, with `version` from the last checkpoint record.
    fn boot(&self, version: u64) -> (Arc<PageCache>, Arc<VersionedSegment>) {
        let cache = PageCache::new(PAGE);
        let data_dev = cache.register_device(self.data_dev.clone());
        let log_dev = cache.register_device(self.log_dev.clone());
        let builder = SegmentBuilder::new(Arc::clone(&cache));
        let data = builder
            .linear_device(
                data_dev,
                LinearSegmentOptions {
                    n_pages_increment: 1,
                    ..Default::default()
                },
            )
            .unwrap();
        let versioned = builder
            .shadow_paged(data, log_dev, RING, None, version, self.uuid)
            .unwrap();
        (cache, versioned)
    }
}

fn write_byte(cache: &PageCache, segment: &SegmentRef, page: PageId, value: u8) {
    let mut guard = cache.lock_page(segment, page).unwrap();
    guard.writable_data().unwrap()[0] = value;
}

fn read_byte(cache: &PageCache, segment: &SegmentRef, page: PageId) -> u8 {
    cache.lock_page(segment, page).unwrap().data()[0]
}

#[test]
fn partial_flush_recovers_to_the_checkpoint() {
    let harness = Harness::new();
    {
        let (cache, versioned) = harness.boot(0);
        let v_ref: SegmentRef = versioned.clone();
        for value in [b'A', b'B', b'C', b'D'] {
            let mut guard = cache.allocate_page(&v_ref, PageOwnerId::ANON).unwrap().unwrap();
            guard.writable_data().unwrap()[0] = value;
        }
        versioned.checkpoint(CheckpointType::FlushAll).unwrap();
        assert_eq!(versioned.version_number(), 1);

        // Post-checkpoint edits: both images logged, only one data page
        // makes it to the device before the crash.
        write_byte(&cache, &v_ref, PageId(1), b'X');
        write_byte(&cache, &v_ref, PageId(2), b'Y');
        versioned.log_segment().checkpoint(CheckpointType::FlushAll).unwrap();
        let block = versioned.translate_page_id(PageId(1)).unwrap();
        assert!(cache.flush_page(block).unwrap());
        // Crash: cache and segments drop here.
    }

    let (cache, versioned) = harness.boot(0);
    let restored = versioned.recover(PageId(0), 0, None).unwrap();
    assert_eq!(restored, 2);
    versioned.checkpoint(CheckpointType::FlushAll).unwrap();

    let v_ref: SegmentRef = versioned.clone();
    assert_eq!(read_byte(&cache, &v_ref, PageId(0)), b'A');
    assert_eq!(read_byte(&cache, &v_ref, PageId(1)), b'B');
    assert_eq!(read_byte(&cache, &v_ref, PageId(2)), b'C');
    assert_eq!(read_byte(&cache, &v_ref, PageId(3)), b'D');
}

#[test]
fn fuzzy_checkpoint_retains_only_needed_images() {
    let harness = Harness::new();
    {
        let (cache, versioned) = harness.boot(0);
        let v_ref: SegmentRef = versioned.clone();
        let mut guard = cache.allocate_page(&v_ref, PageOwnerId::ANON).unwrap().unwrap();
        guard.writable_data().unwrap()[0] = b'A';
        drop(guard);
        versioned.checkpoint(CheckpointType::FlushAll).unwrap();

        write_byte(&cache, &v_ref, PageId(0), b'X');
        versioned.checkpoint(CheckpointType::FlushFuzzy).unwrap();
        assert_eq!(versioned.version_number(), 2);

        // New epoch: image of 'X' logged, 'Y' never reaches the device.
        write_byte(&cache, &v_ref, PageId(0), b'Y');
        versioned.log_segment().checkpoint(CheckpointType::FlushAll).unwrap();
    }

    let (cache, versioned) = harness.boot(1);
    // The stale pre-checkpoint image (version 1) is skipped; the newer
    // image (version 2) restores the fuzzy checkpoint's contents.
    let restored = versioned.recover(PageId(0), 1, None).unwrap();
    assert_eq!(restored, 1);
    versioned.checkpoint(CheckpointType::FlushAll).unwrap();
    let v_ref: SegmentRef = versioned.clone();
    assert_eq!(read_byte(&cache, &v_ref, PageId(0)), b'X');
}

#[test]
fn foreign_uuid_stops_the_scan() {
    let harness = Harness::new();
    {
        let (cache, versioned) = harness.boot(0);
        let v_ref: SegmentRef = versioned.clone();
        let mut guard = cache.allocate_page(&v_ref, PageOwnerId::ANON).unwrap().unwrap();
        guard.writable_data().unwrap()[0] = b'A';
        drop(guard);
        versioned.checkpoint(CheckpointType::FlushAll).unwrap();
        write_byte(&cache, &v_ref, PageId(0), b'X');
        versioned.log_segment().checkpoint(CheckpointType::FlushAll).unwrap();
    }

    let (_cache, versioned) = harness.boot(0);
    let other = PseudoUuid::generate();
    let restored = versioned.recover(PageId(0), 0, Some(other)).unwrap();
    assert_eq!(restored, 0);
}

#[test]
fn torn_log_tail_stops_the_scan_cleanly() {
    let harness = Harness::new();
    {
        let (cache, versioned) = harness.boot(0);
        let v_ref: SegmentRef = versioned.clone();
        for value in [b'A', b'B', b'C'] {
            let mut guard = cache.allocate_page(&v_ref, PageOwnerId::ANON).unwrap().unwrap();
            guard.writable_data().unwrap()[0] = value;
        }
        versioned.checkpoint(CheckpointType::FlushAll).unwrap();
        for (i, value) in [b'X', b'Y', b'Z'].into_iter().enumerate() {
            write_byte(&cache, &v_ref, PageId(i as u64), value);
        }
        versioned.log_segment().checkpoint(CheckpointType::FlushAll).unwrap();
    }

    // The third image is torn on disk: its checksum no longer matches.
    let garbage = vec![0x5Au8; PAGE];
    harness.log_dev.write_block(2, &garbage).unwrap();

    let (cache, versioned) = harness.boot(0);
    let restored = versioned.recover(PageId(0), 0, None).unwrap();
    assert_eq!(restored, 2);
    versioned.checkpoint(CheckpointType::FlushAll).unwrap();
    let v_ref: SegmentRef = versioned.clone();
    assert_eq!(read_byte(&cache, &v_ref, PageId(0)), b'A');
    assert_eq!(read_byte(&cache, &v_ref, PageId(1)), b'B');
}

#[test]
fn recovery_refuses_a_live_page_map() {
    let harness = Harness::new();
    let (cache, versioned) = harness.boot(0);
    let v_ref: SegmentRef = versioned.clone();
    let mut guard = cache.allocate_page(&v_ref, PageOwnerId::ANON).unwrap().unwrap();
    guard.writable_data().unwrap()[0] = 1;
    drop(guard);
    versioned.checkpoint(CheckpointType::FlushAll).unwrap();
    write_byte(&cache, &v_ref, PageId(0), 2);

    assert!(matches!(
        versioned.recover(PageId(0), 0, None),
        Err(SegmentError::Protocol(_))
    ));
}

#[test]
fn deallocation_is_shadowed_like_any_edit() {
    init_tracing();
    let cache = PageCache::new(PAGE);
    let data_dev = cache.register_device(Arc::new(MemDevice::new(PAGE)));
    let log_dev = cache.register_device(Arc::new(MemDevice::new(PAGE)));
    let builder = SegmentBuilder::new(Arc::clone(&cache));
    let data_leaf = builder
        .linear_device(data_dev, LinearSegmentOptions::default())
        .unwrap();
    let data = builder
        .random_allocation(data_leaf, RandomSegmentOptions { pages_per_extent: 4 })
        .unwrap();
    let versioned = builder
        .shadow_paged(data, log_dev, RING, None, 0, PseudoUuid::generate())
        .unwrap();
    let v_ref: SegmentRef = versioned.clone();

    let page = {
        let mut guard = cache.allocate_page(&v_ref, PageOwnerId(1)).unwrap().unwrap();
        guard.writable_data().unwrap()[0] = 9;
        guard.page_id()
    };
    versioned.checkpoint(CheckpointType::FlushAll).unwrap();

    versioned.deallocate_page_range(Some(page), Some(page)).unwrap();
    assert!(!versioned.is_page_id_allocated(page));
    // The page's final contents were logged before it went away.
    assert_eq!(versioned.log_segment().allocated_size_in_pages(), 1);

    assert!(matches!(
        versioned.deallocate_page_range(None, None),
        Err(SegmentError::Unsupported(_))
    ));
}
