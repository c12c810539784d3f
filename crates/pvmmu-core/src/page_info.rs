use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::Pfn;

bitflags::bitflags! {
    /// Per-page state bits tracked by the MMU layer.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PageFlags: u32 {
        /// The page is part of a pinned page table and mapped read-only.
        const PINNED = 1 << 0;

        /// The root was pinned only to survive suspend and must be unpinned
        /// on resume.
        const SAVE_PINNED = 1 << 1;
    }
}

/// State of one guest page.
#[derive(Debug, Default)]
pub struct PageInfo {
    flags: AtomicU32,
    private: AtomicU64,
}

impl PageInfo {
    /// Returns the current flags.
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Checks if every bit of `flags` is set.
    pub fn contains(&self, flags: PageFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Sets `flags`, returning `true` if all of them were already set.
    pub fn test_and_set(&self, flags: PageFlags) -> bool {
        let old = self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
        PageFlags::from_bits_truncate(old).contains(flags)
    }

    /// Clears `flags`, returning `true` if all of them were set.
    pub fn test_and_clear(&self, flags: PageFlags) -> bool {
        let old = self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
        PageFlags::from_bits_truncate(old).contains(flags)
    }

    /// Sets `flags`.
    pub fn set(&self, flags: PageFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clears `flags`.
    pub fn clear(&self, flags: PageFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Returns the page attached to this one, e.g. the user root of a
    /// kernel root.
    pub fn private(&self) -> Option<Pfn> {
        let raw = self.private.load(Ordering::Acquire);
        (raw != 0).then_some(Pfn(raw))
    }

    /// Attaches a page to this one.
    pub fn set_private(&self, pfn: Option<Pfn>) {
        self.private
            .store(pfn.map_or(0, |pfn| pfn.0), Ordering::Release);
    }
}

/// The state of every guest page, indexed by frame number.
#[derive(Debug)]
pub struct PageInfoTable {
    pages: Box<[PageInfo]>,
}

impl PageInfoTable {
    /// Creates state for `nr_pages` pages, all clear.
    pub fn new(nr_pages: u64) -> Self {
        Self {
            pages: (0..nr_pages).map(|_| PageInfo::default()).collect(),
        }
    }

    /// Returns the state of a page, or `None` past the end of memory.
    pub fn get(&self, pfn: Pfn) -> Option<&PageInfo> {
        usize::try_from(pfn.0)
            .ok()
            .and_then(|index| self.pages.get(index))
    }

    /// Checks if the page is part of a pinned table.
    pub fn is_pinned(&self, pfn: Pfn) -> bool {
        self.get(pfn)
            .is_some_and(|page| page.contains(PageFlags::PINNED))
    }

    /// Returns the number of tracked pages.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Checks if no page is tracked.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_and_set_reports_previous_state() {
        let page = PageInfo::default();
        assert!(!page.test_and_set(PageFlags::PINNED));
        assert!(page.test_and_set(PageFlags::PINNED));
        assert!(page.test_and_clear(PageFlags::PINNED));
        assert!(!page.test_and_clear(PageFlags::PINNED));
    }

    #[test]
    fn private_page_round_trips() {
        let table = PageInfoTable::new(4);
        let page = table.get(Pfn(3)).unwrap();
        assert_eq!(page.private(), None);

        page.set_private(Some(Pfn(2)));
        assert_eq!(page.private(), Some(Pfn(2)));
        assert!(table.get(Pfn(4)).is_none());
    }
}
