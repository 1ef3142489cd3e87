use std::sync::Arc;

use crate::cache::PageCache;
use crate::error::Result;
use crate::segment::{
    CheckpointProvider, CircularSegment, DelegatingSegment, LinearDeviceSegment,
    LinearSegmentOptions, LinearViewSegment, RandomAllocationSegment, RandomSegmentOptions,
    SegmentRef, TracingSegment, VersionedSegment, WalSegment,
};
use crate::types::{DeviceId, PageId, PseudoUuid, SegVersionNum};

/// Factory for composing segment chains over one page cache.
///
/// Each method wraps the corresponding segment constructor; composition
/// rules (a circular ring needs a LINEAR delegate, the shadow log needs
/// the WAL tracker outermost) are enforced by the constructors themselves.
pub struct SegmentBuilder {
    cache: Arc<PageCache>,
}

impl SegmentBuilder {
    /// A builder composing segments over `cache`.
    pub fn new(cache: Arc<PageCache>) -> Self {
        Self { cache }
    }

    /// The cache every built segment will do its I/O through.
    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    /// Leaf segment over a registered device.
    pub fn linear_device(
        &self,
        device_id: DeviceId,
        options: LinearSegmentOptions,
    ) -> Result<Arc<LinearDeviceSegment>> {
        LinearDeviceSegment::new(Arc::clone(&self.cache), device_id, options)
    }

    /// Formats a fresh extent map over a linear delegate.
    pub fn random_allocation(
        &self,
        delegate: SegmentRef,
        options: RandomSegmentOptions,
    ) -> Result<Arc<RandomAllocationSegment>> {
        RandomAllocationSegment::format(Arc::clone(&self.cache), delegate, options)
    }

    /// Reopens an existing extent map over a linear delegate.
    pub fn open_random_allocation(
        &self,
        delegate: SegmentRef,
        options: RandomSegmentOptions,
    ) -> Result<Arc<RandomAllocationSegment>> {
        RandomAllocationSegment::open(Arc::clone(&self.cache), delegate, options)
    }

    /// Ring of `n_pages` slots over a linear delegate, with default
    /// checkpoint-request thresholds.
    pub fn circular(
        &self,
        delegate: SegmentRef,
        n_pages: u64,
        provider: Option<Arc<dyn CheckpointProvider>>,
    ) -> Result<Arc<CircularSegment>> {
        CircularSegment::new(Arc::clone(&self.cache), delegate, n_pages, provider)
    }

    /// Dirty-set tracker over a log segment.
    pub fn wal(&self, delegate: SegmentRef) -> Arc<WalSegment> {
        WalSegment::new(delegate)
    }

    /// Dense view over a persisted page chain.
    pub fn linear_view(
        &self,
        delegate: SegmentRef,
        first_page: Option<PageId>,
    ) -> Result<Arc<LinearViewSegment>> {
        LinearViewSegment::new(delegate, first_page)
    }

    /// Pure forwarding decorator.
    pub fn delegating(&self, delegate: SegmentRef) -> Arc<DelegatingSegment> {
        DelegatingSegment::new(delegate)
    }

    /// Trace-instrumented forwarding decorator.
    pub fn tracing(&self, label: &'static str, delegate: SegmentRef) -> Arc<TracingSegment> {
        TracingSegment::new(label, delegate)
    }

    /// Shadow-paging decorator over `data`, given a prebuilt log chain.
    pub fn versioned(
        &self,
        data: SegmentRef,
        wal: Arc<WalSegment>,
        version: SegVersionNum,
        online_uuid: PseudoUuid,
    ) -> Arc<VersionedSegment> {
        VersionedSegment::new(Arc::clone(&self.cache), data, wal, version, online_uuid)
    }

    /// Wires the full shadow-paging stack:
    /// `Versioned(data, Wal(Circular(LinearDevice(log_device))))`.
    pub fn shadow_paged(
        &self,
        data: SegmentRef,
        log_device: DeviceId,
        log_ring_pages: u64,
        provider: Option<Arc<dyn CheckpointProvider>>,
        version: SegVersionNum,
        online_uuid: PseudoUuid,
    ) -> Result<Arc<VersionedSegment>> {
        let log_leaf = self.linear_device(
            log_device,
            LinearSegmentOptions {
                n_pages_increment: 1,
                ..Default::default()
            },
        )?;
        let ring = self.circular(log_leaf, log_ring_pages, provider)?;
        let wal = self.wal(ring);
        Ok(self.versioned(data, wal, version, online_uuid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PageCache;
    use crate::device::MemDevice;
    use crate::segment::Segment;
    use crate::types::{CheckpointType, PageOwnerId};

    #[test]
    fn shadow_paged_stack_round_trips_an_edit() {
        let cache = PageCache::new(256);
        let data_dev = cache.register_device(Arc::new(MemDevice::new(256)));
        let log_dev = cache.register_device(Arc::new(MemDevice::new(256)));
        let builder = SegmentBuilder::new(Arc::clone(&cache));

        let data_leaf = builder
            .linear_device(data_dev, LinearSegmentOptions::default())
            .unwrap();
        let data = builder
            .random_allocation(data_leaf, RandomSegmentOptions { pages_per_extent: 4 })
            .unwrap();
        let versioned = builder
            .shadow_paged(data, log_dev, 8, None, 0, PseudoUuid::generate())
            .unwrap();

        let v_ref: SegmentRef = versioned.clone();
        let page = {
            let mut guard = cache.allocate_page(&v_ref, PageOwnerId(1)).unwrap().unwrap();
            guard.writable_data().unwrap()[..4].copy_from_slice(b"abcd");
            guard.page_id()
        };
        versioned.checkpoint(CheckpointType::FlushAll).unwrap();
        assert_eq!(versioned.version_number(), 1);

        let guard = cache.lock_page(&v_ref, page).unwrap();
        assert_eq!(&guard.data()[..4], b"abcd");
    }

    #[test]
    fn view_over_random_allocation() {
        let cache = PageCache::new(256);
        let device = cache.register_device(Arc::new(MemDevice::new(256)));
        let builder = SegmentBuilder::new(Arc::clone(&cache));
        let leaf = builder
            .linear_device(device, LinearSegmentOptions::default())
            .unwrap();
        let random = builder
            .random_allocation(leaf, RandomSegmentOptions { pages_per_extent: 4 })
            .unwrap();
        let view = builder.linear_view(random, None).unwrap();
        assert!(view.ensure_allocated_size(3).unwrap());
        assert_eq!(view.allocated_size_in_pages(), 3);
    }
}
