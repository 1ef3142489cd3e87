#![forbid(unsafe_code)]

//! Core identifier and enum types shared across the segment layer.

use std::fmt;

pub mod checksum;

pub use checksum::{body_checksum, Checksum, Crc32Fast};

/// Logical page address within one segment's page space.
///
/// For LINEAR segments this is a dense block offset; for RANDOM segments it
/// is an opaque slot number. "No page" is expressed as `Option<PageId>` in
/// memory and as [`PageId::NONE_REPR`] in persistent structures.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

impl PageId {
    /// On-disk sentinel for "no page".
    pub const NONE_REPR: u64 = u64::MAX;

    /// Encodes an optional page id into its persistent representation.
    pub fn encode_opt(page: Option<PageId>) -> u64 {
        page.map_or(Self::NONE_REPR, |p| p.0)
    }

    /// Decodes the persistent representation back into an optional page id.
    pub fn decode_opt(raw: u64) -> Option<PageId> {
        if raw == Self::NONE_REPR {
            None
        } else {
            Some(PageId(raw))
        }
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageId({})", self.0)
    }
}

/// Identifier of one registered block device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct DeviceId(pub u32);

/// Physical address of one block: a device plus a block offset on it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BlockId {
    /// Device holding the block.
    pub device: DeviceId,
    /// Zero-based block number within the device.
    pub block: u64,
}

impl BlockId {
    /// Convenience constructor.
    pub fn new(device: DeviceId, block: u64) -> Self {
        Self { device, block }
    }
}

/// Tag identifying the higher-level structure that owns an allocated page.
///
/// Used for validation and diagnostics only; never for addressing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PageOwnerId(pub u64);

impl PageOwnerId {
    /// Owner tag for pages not associated with any object.
    pub const ANON: PageOwnerId = PageOwnerId(u64::MAX - 1);
    /// Persistent marker for an unallocated page entry.
    pub const UNALLOCATED_REPR: u64 = u64::MAX;
}

/// Version number of a shadow-paged segment; bumped once per checkpoint.
pub type SegVersionNum = u64;

/// Identity of one online database instance, stamped into logged
/// before-images so recovery can reject log pages from a different run.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PseudoUuid(pub [u8; 16]);

impl PseudoUuid {
    /// The invalid uuid: all zeroes. Stamped on pages that carry no
    /// instance identity (current data-segment copies).
    pub const INVALID: PseudoUuid = PseudoUuid([0; 16]);

    /// Generates a fresh random instance identity.
    pub fn generate() -> Self {
        PseudoUuid(rand::random())
    }

    /// True for the all-zero invalid uuid.
    pub fn is_invalid(&self) -> bool {
        self.0 == [0; 16]
    }
}

/// How a segment hands out page ids.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocationOrder {
    /// Dense, device-mapped: page ids are successive block offsets.
    Linear,
    /// Monotonically increasing but possibly sparse.
    Ascending,
    /// Arbitrary reuse of freed pages; ordering carries no meaning.
    Random,
}

impl AllocationOrder {
    /// True if page ids are dense block offsets.
    pub fn is_linear(&self) -> bool {
        matches!(self, AllocationOrder::Linear)
    }
}

/// Kind of checkpoint flowing down a segment chain.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CheckpointType {
    /// Flush every dirty page belonging to the requesting segment.
    FlushAll,
    /// Flush only a predicate-chosen subset; trades a longer recovery log
    /// for lower checkpoint latency.
    FlushFuzzy,
    /// Drop dirty state without writing it back.
    Discard,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_id_opt_roundtrip() {
        assert_eq!(PageId::encode_opt(None), PageId::NONE_REPR);
        assert_eq!(PageId::decode_opt(PageId::NONE_REPR), None);
        assert_eq!(PageId::decode_opt(PageId::encode_opt(Some(PageId(42)))), Some(PageId(42)));
    }

    #[test]
    fn generated_uuid_is_valid() {
        let uuid = PseudoUuid::generate();
        assert!(!uuid.is_invalid());
        assert!(PseudoUuid::INVALID.is_invalid());
    }
}
