//! Core scalar types shared across the snapstore components.

/// Logical chunk address, either on the origin volume or in the
/// snapshot store.
pub type Chunk = u64;

/// 512-byte sector address on the snapshot store device.
pub type Sector = u64;

/// Log2 of the sector size.
pub const SECTOR_BITS: u32 = 9;

/// Sector size in bytes.
pub const SECTOR_SIZE: usize = 1 << SECTOR_BITS;

/// One bit per snapshot; bit n belongs to the snapshot holding slot n.
pub type ShareMask = u64;

/// Maximum number of simultaneous snapshots, bounded by the width of
/// the share mask.
pub const MAX_SNAPSHOTS: usize = 64;

/// The identity a client presents when it attaches to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// The origin block driver; its writes trigger copy-outs.
    Origin,
    /// A snapshot block driver, identified by its share-mask bit.
    Snapshot(u8),
}

impl Owner {
    #[must_use]
    pub fn is_origin(&self) -> bool {
        matches!(self, Self::Origin)
    }

    /// Share-mask bit for a snapshot identity, `None` for the origin.
    #[must_use]
    pub fn bit(&self) -> Option<u8> {
        match self {
            Self::Origin => None,
            Self::Snapshot(bit) => Some(*bit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_bit() {
        assert_eq!(Owner::Origin.bit(), None);
        assert_eq!(Owner::Snapshot(5).bit(), Some(5));
        assert!(Owner::Origin.is_origin());
        assert!(!Owner::Snapshot(0).is_origin());
    }
}
