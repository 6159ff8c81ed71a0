//! Guest RAM regions waiting to be added to a realm.

use crate::memory::{align_down, align_up, PAGE_SIZE};

/// One span of realm RAM.
///
/// `[start, file_end)` holds loaded content and is measured;
/// `[file_end, mem_end)` is zero-initialized and unmeasured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamRegion {
    pub start: u64,
    pub file_end: u64,
    pub mem_end: u64,
}

impl RamRegion {
    /// Build a page-aligned region from an unaligned load.
    ///
    /// A `mem_size` smaller than `file_size` is treated as `file_size`.
    pub fn new(start: u64, file_size: u64, mem_size: u64) -> Self {
        let file_end = align_up(start + file_size, PAGE_SIZE);
        let mem_end = align_up(start + mem_size, PAGE_SIZE).max(file_end);
        Self {
            start: align_down(start, PAGE_SIZE),
            file_end,
            mem_end,
        }
    }

    /// Size of the loaded (measured) part.
    pub fn file_size(&self) -> u64 {
        self.file_end - self.start
    }

    /// Size of the zero-filled tail.
    pub fn tail_size(&self) -> u64 {
        self.mem_end - self.file_end
    }
}

/// Insertion-ordered list of [`RamRegion`]s, consumed once.
#[derive(Debug, Default)]
pub struct RamLedger {
    regions: Vec<RamRegion>,
}

impl RamLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a region and return it as recorded.
    pub fn register(&mut self, start: u64, file_size: u64, mem_size: u64) -> RamRegion {
        let region = RamRegion::new(start, file_size, mem_size);
        self.regions.push(region);
        region
    }

    pub fn iter(&self) -> impl Iterator<Item = &RamRegion> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Remove every region, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = RamRegion> + '_ {
        self.regions.drain(..)
    }
}
