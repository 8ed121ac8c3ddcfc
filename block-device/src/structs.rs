use core::{
    fmt,
    num::NonZeroU64,
    ops::{Add, AddAssign, Sub},
};

use static_assertions::const_assert_eq;

/// Logical Block Address
///
/// Each [LBA] addresses a single block on a [crate::BlockDevice].
/// `u64::MAX` is never a valid address.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LBA(u64);
const_assert_eq!(core::mem::size_of::<LBA>(), 8);

impl TryFrom<u64> for LBA {
    type Error = InvalidLBA;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        LBA::new(value).ok_or(InvalidLBA)
    }
}

/// Error for `u64::MAX` used as an [LBA]
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("u64::MAX is not a valid logical block address")]
pub struct InvalidLBA;

impl LBA {
    /// The first block of a device
    pub const ZERO: LBA = LBA(0);

    /// The largest representable block address
    pub const MAX: LBA = LBA(u64::MAX - 1);

    /// Creates a new [LBA], returns `None` for `u64::MAX`
    pub const fn new(addr: u64) -> Option<Self> {
        if addr == u64::MAX {
            None
        } else {
            Some(Self(addr))
        }
    }

    /// The [LBA] containing the byte at `offset`
    pub fn from_byte_offset(offset: u64, block_size: usize) -> Option<LBA> {
        LBA::new(offset / block_size as u64)
    }

    /// The byte offset of the start of this block
    pub fn to_byte_offset(self, block_size: usize) -> u64 {
        self.0 * block_size as u64
    }

    /// The raw block address
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Adds `rhs` blocks, returns `None` if the result is not a valid [LBA]
    pub fn checked_add(self, rhs: u64) -> Option<LBA> {
        self.0.checked_add(rhs).and_then(LBA::new)
    }
}

impl fmt::Display for LBA {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LBA({})", self.0)
    }
}

impl Add<u64> for LBA {
    type Output = LBA;

    #[track_caller]
    fn add(self, rhs: u64) -> Self::Output {
        self.checked_add(rhs).expect("LBA overflow")
    }
}

impl AddAssign<u64> for LBA {
    #[track_caller]
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

impl Sub<LBA> for LBA {
    type Output = u64;

    #[track_caller]
    fn sub(self, rhs: LBA) -> Self::Output {
        assert!(self >= rhs);
        self.0 - rhs.0
    }
}

/// A group of contigous logical blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockGroup {
    /// The fist block in the group
    pub start: LBA,
    count: NonZeroU64,
}

impl BlockGroup {
    /// Creates a group from `start` to `end`, both inclusive
    ///
    /// # Panics
    ///
    /// if `end` is before `start`
    #[track_caller]
    pub fn new(start: LBA, end: LBA) -> Self {
        assert!(end >= start, "end should not be before start");
        Self {
            start,
            count: NonZeroU64::MIN.saturating_add(end - start),
        }
    }

    /// Creates a group of `count` blocks starting at `start`
    pub fn with_count(start: LBA, count: NonZeroU64) -> Self {
        Self { start, count }
    }

    /// The last block in the group
    pub fn end(&self) -> LBA {
        self.start + (self.count() - 1)
    }

    /// The number of blocks in the group
    pub fn count(&self) -> u64 {
        self.count.get()
    }

    /// The size of the group in bytes
    pub fn bytes(&self, block_size: usize) -> u64 {
        self.count() * block_size as u64
    }

    /// returns `true` if `lba` is part of this group
    pub fn contains(&self, lba: LBA) -> bool {
        self.start <= lba && lba <= self.end()
    }

    /// Splits the group into consecutive groups of at most `max_blocks` each
    pub fn chunks(&self, max_blocks: NonZeroU64) -> impl Iterator<Item = BlockGroup> {
        let start = self.start;
        let count = self.count();
        let step = max_blocks.get();
        (0..count.div_ceil(step)).filter_map(move |index| {
            let offset = index * step;
            let len = NonZeroU64::new(step.min(count - offset))?;
            Some(BlockGroup::with_count(start + offset, len))
        })
    }
}
