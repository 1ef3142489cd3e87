//! Ring reclamation scenarios: thresholds, exhaustion, alias death.

use std::sync::Arc;

use parking_lot::Mutex;

use ombra::{
    CheckpointProvider, CheckpointType, CircularSegment, LinearDeviceSegment,
    LinearSegmentOptions, PageCache, PageId, PageOwnerId, Segment, SegmentError,
};
use ombra::device::MemDevice;

struct CountingProvider {
    requests: Mutex<Vec<CheckpointType>>,
}

impl CountingProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
        })
    }
}

impl CheckpointProvider for CountingProvider {
    fn request_checkpoint(&self, checkpoint_type: CheckpointType) {
        self.requests.lock().push(checkpoint_type);
    }
}

fn ring_with_provider(
    n_pages: u64,
    t1: u64,
    t2: u64,
) -> (Arc<PageCache>, Arc<CircularSegment>, Arc<CountingProvider>) {
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
    let provider = CountingProvider::new();
    let ring = CircularSegment::with_thresholds(
        Arc::clone(&cache),
        leaf,
        n_pages,
        Some(provider.clone() as Arc<dyn CheckpointProvider>),
        t1,
        t2,
    )
    .unwrap();
    (cache, ring, provider)
}

#[test]
fn nine_page_ring_requests_checkpoints_at_three_and_six() {
    let (_cache, ring, provider) = ring_with_provider(9, 3, 6);

    for _ in 0..2 {
        ring.allocate_page_id(PageOwnerId::ANON).unwrap().unwrap();
    }
    assert!(provider.requests.lock().is_empty());

    ring.allocate_page_id(PageOwnerId::ANON).unwrap().unwrap();
    assert_eq!(provider.requests.lock().len(), 1);

    for _ in 3..6 {
        ring.allocate_page_id(PageOwnerId::ANON).unwrap().unwrap();
    }
    let requests = provider.requests.lock().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|&t| t == CheckpointType::FlushFuzzy));

    // Thresholds fire on crossing, not continuously.
    for _ in 6..9 {
        ring.allocate_page_id(PageOwnerId::ANON).unwrap().unwrap();
    }
    assert_eq!(provider.requests.lock().len(), 2);
    assert_eq!(ring.allocate_page_id(PageOwnerId::ANON).unwrap(), None);
}

#[test]
fn reclaiming_below_a_threshold_rearms_it() {
    let (_cache, ring, provider) = ring_with_provider(9, 3, 6);
    for _ in 0..3 {
        ring.allocate_page_id(PageOwnerId::ANON).unwrap().unwrap();
    }
    assert_eq!(provider.requests.lock().len(), 1);
    ring.deallocate_page_range(None, Some(PageId(0))).unwrap();
    // Occupancy drops to 2 and climbs back through 3.
    ring.allocate_page_id(PageOwnerId::ANON).unwrap().unwrap();
    assert_eq!(provider.requests.lock().len(), 2);
}

#[test]
fn dead_pages_stop_translating_once_their_block_is_reused() {
    let (_cache, ring, _provider) = ring_with_provider(4, 0, 0);
    for _ in 0..4 {
        ring.allocate_page_id(PageOwnerId::ANON).unwrap();
    }
    let dead_block = ring.translate_page_id(PageId(0)).unwrap();
    ring.deallocate_page_range(None, Some(PageId(0))).unwrap();

    // Block 0 has no live alias until logical page 4 claims it.
    assert!(matches!(
        ring.translate_block_id(dead_block),
        Err(SegmentError::ForeignBlock(_))
    ));
    assert_eq!(
        ring.allocate_page_id(PageOwnerId::ANON).unwrap(),
        Some(PageId(4))
    );
    assert_eq!(ring.translate_block_id(dead_block).unwrap(), PageId(4));
}

#[test]
fn page_contents_survive_a_wrap_of_other_slots() {
    let (cache, ring, _provider) = ring_with_provider(3, 0, 0);
    let ring_ref: ombra::SegmentRef = ring.clone();

    // Fill the ring with distinct payloads, flush, then cycle one slot
    // several times; the untouched slots keep their bytes.
    let mut blocks = Vec::new();
    for value in 0..3u8 {
        let mut guard = cache.allocate_page(&ring_ref, PageOwnerId::ANON).unwrap().unwrap();
        guard.writable_data().unwrap()[0] = value + 10;
        blocks.push(guard.block_id());
    }
    for &block in &blocks {
        cache.flush_page(block).unwrap();
    }
    for round in 0..4u64 {
        ring.deallocate_page_range(None, Some(PageId(ring.oldest_page_num())))
            .unwrap();
        let mut guard = cache.allocate_page(&ring_ref, PageOwnerId::ANON).unwrap().unwrap();
        guard.writable_data().unwrap()[0] = 100 + round as u8;
    }
    // Window is [4, 7): logical pages 4, 5, 6 map to blocks 1, 2, 0.
    let survivor = cache.lock_page(&ring_ref, PageId(4)).unwrap();
    assert_eq!(survivor.data()[0], 100 + 1);
}

#[test]
fn deallocation_outside_the_window_is_rejected() {
    let (_cache, ring, _provider) = ring_with_provider(4, 0, 0);
    for _ in 0..2 {
        ring.allocate_page_id(PageOwnerId::ANON).unwrap();
    }
    assert!(ring.deallocate_page_range(None, Some(PageId(5))).is_err());
    assert!(ring
        .deallocate_page_range(Some(PageId(0)), Some(PageId(1)))
        .is_err());
}
