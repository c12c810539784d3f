use std::fmt::Debug;

use crate::{Pfn, PinLevel, Va};

/// Defines an interface for the paging layout of a paravirtualized CPU
/// architecture.
///
/// The `Architecture` trait captures the parts of the paging hardware and of
/// the guest virtual address layout the MMU layer depends on: how many levels
/// the page table tree has, how addresses split into table indices, where the
/// kernel direct map lives and which part of the address space belongs to the
/// hypervisor.
pub trait Architecture: Send + Sync + 'static {
    /// The size of a memory page in bytes for the given architecture.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `0x1000` (4096 bytes)
    const PAGE_SIZE: u64;

    /// The number of bits to shift when converting between page numbers and
    /// addresses.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `12` (2^12 = 4096)
    const PAGE_SHIFT: u64;

    /// A bitmask used to isolate the page number from a full address.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `0xFFFFFFFFFFFFF000`
    const PAGE_MASK: u64;

    /// The number of entries in a single page table page.
    ///
    /// # Architecture-specific
    ///
    /// - **AMD64**: `512`
    const ENTRIES_PER_TABLE: usize;

    /// The first address above user space.
    ///
    /// Pin and unpin walks of process page tables stop here; everything above
    /// is shared with the kernel and pinned once at boot.
    const USER_LIMIT: Va;

    /// The base of the kernel direct map of physical memory.
    ///
    /// Root slots between [`USER_LIMIT`] and `PAGE_OFFSET` belong to the
    /// hypervisor and are never walked.
    ///
    /// [`USER_LIMIT`]: Self::USER_LIMIT
    const PAGE_OFFSET: Va;

    /// The top of the fixed-mapping area. Walk limits must stay below it.
    const FIXADDR_TOP: Va;

    /// The end of the legacy ISA hole.
    const ISA_END: u64;

    /// Entry flags of a writable kernel mapping.
    const PAGE_KERNEL: u64;

    /// Entry flags of a read-only kernel mapping.
    const PAGE_KERNEL_RO: u64;

    /// Entry flags of an entry pointing to a lower-level table.
    const PAGE_TABLE: u64;

    /// Software flag marking an entry whose frame is already a machine frame.
    const PAGE_IOMAP: u64;

    /// Software flag marking an entry with no backing `struct page`.
    const PAGE_SPECIAL: u64;

    /// An enumeration representing the levels of page tables in the
    /// architecture's paging structure.
    type PageTableLevel: Debug + Clone + Copy + PartialEq + Eq + Send + Sync + 'static;

    /// A single page table entry.
    type PageTableEntry: TableEntry;

    /// The level of the root table.
    const ROOT_LEVEL: Self::PageTableLevel;

    /// The level whose entries map data pages.
    const LEAF_LEVEL: Self::PageTableLevel;

    /// Returns the next lower level in the page table hierarchy.
    fn next_level(level: Self::PageTableLevel) -> Option<Self::PageTableLevel>;

    /// Returns the next higher level in the page table hierarchy.
    fn previous_level(level: Self::PageTableLevel) -> Option<Self::PageTableLevel>;

    /// Returns the hypervisor pin type for a table at the given level.
    fn pin_level(level: Self::PageTableLevel) -> PinLevel;

    /// Calculates the index into the specified level of the page table
    /// hierarchy for a given virtual address.
    fn va_index_for(va: Va, level: Self::PageTableLevel) -> u64;

    /// Returns the direct-map address of a physical frame.
    fn pfn_to_va(pfn: Pfn) -> Va {
        Va(Self::PAGE_OFFSET.0 + (pfn.0 << Self::PAGE_SHIFT))
    }

    /// Returns the physical frame behind a direct-map address.
    fn va_to_pfn(va: Va) -> Pfn {
        Pfn((va.0 - Self::PAGE_OFFSET.0) >> Self::PAGE_SHIFT)
    }

    /// Returns the offset of an address within its page.
    fn va_offset(va: Va) -> u64 {
        va.0 & !Self::PAGE_MASK
    }
}

/// A page table entry of some architecture.
///
/// The frame field holds a physical frame number while the entry is in its
/// "logical" form and a machine frame number once translated for the
/// hypervisor.
pub trait TableEntry: Debug + Clone + Copy + PartialEq + Eq + Send + Sync + 'static {
    /// The bits of the raw entry holding the frame address.
    const FRAME_MASK: u64;

    /// The shift from frame address to frame number.
    const FRAME_SHIFT: u64;

    /// Wraps a raw entry value.
    fn from_raw(raw: u64) -> Self;

    /// Returns the raw entry value.
    fn raw(self) -> u64;

    /// Checks if the entry is present.
    fn present(self) -> bool;

    /// Checks if the entry permits writes.
    fn writable(self) -> bool;

    /// Checks if the entry maps a large page instead of a lower table.
    fn large(self) -> bool;

    /// Checks if the entry carries the I/O mapping flag.
    fn iomap(self) -> bool;

    /// Builds an entry from a frame number and flag bits.
    fn from_parts(frame: u64, flags: u64) -> Self {
        Self::from_raw(((frame << Self::FRAME_SHIFT) & Self::FRAME_MASK) | (flags & !Self::FRAME_MASK))
    }

    /// Extracts the frame number.
    fn frame(self) -> u64 {
        (self.raw() & Self::FRAME_MASK) >> Self::FRAME_SHIFT
    }

    /// Extracts every non-frame bit.
    fn flags(self) -> u64 {
        self.raw() & !Self::FRAME_MASK
    }

    /// Checks if the entry is entirely empty.
    fn is_none(self) -> bool {
        self.raw() == 0
    }
}
