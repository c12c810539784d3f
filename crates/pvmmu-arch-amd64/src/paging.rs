use pvmmu_core::TableEntry;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// The levels in the page table hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PageTableLevel {
    /// Page Table (PT) - the lowest level, pointing directly to 4KB pages.
    Pt,

    /// Page Directory (PD) - can point to PTs or 2MB large pages.
    Pd,

    /// Page Directory Pointer Table (PDPT) - can point to PDs or 1GB large
    /// pages.
    Pdpt,

    /// Page Map Level 4 (PML4) - the highest level in 4-level paging.
    Pml4,
}

impl PageTableLevel {
    /// Returns the next lower level in the page table hierarchy.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Pt => None,
            Self::Pd => Some(Self::Pt),
            Self::Pdpt => Some(Self::Pd),
            Self::Pml4 => Some(Self::Pdpt),
        }
    }

    /// Returns the next higher level in the page table hierarchy.
    pub fn previous(self) -> Option<Self> {
        match self {
            Self::Pt => Some(Self::Pd),
            Self::Pd => Some(Self::Pdpt),
            Self::Pdpt => Some(Self::Pml4),
            Self::Pml4 => None,
        }
    }

    /// Returns the shift of the address bits indexing a table at this
    /// level.
    pub fn shift(self) -> u64 {
        match self {
            Self::Pt => 12,
            Self::Pd => 21,
            Self::Pdpt => 30,
            Self::Pml4 => 39,
        }
    }
}

bitflags::bitflags! {
    /// Flag bits of a page table entry.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EntryFlags: u64 {
        /// The entry is present.
        const PRESENT = 1 << 0;

        /// Writes are allowed.
        const WRITE = 1 << 1;

        /// User mode accesses are allowed.
        const USER = 1 << 2;

        /// Write-through caching.
        const PWT = 1 << 3;

        /// Caching disabled.
        const PCD = 1 << 4;

        /// Set by the CPU on access.
        const ACCESSED = 1 << 5;

        /// Set by the CPU on write.
        const DIRTY = 1 << 6;

        /// The entry maps a large page.
        const LARGE = 1 << 7;

        /// The translation survives address space switches.
        const GLOBAL = 1 << 8;

        /// Software: no backing page structure.
        const SPECIAL = 1 << 9;

        /// Software: the frame is a machine frame.
        const IOMAP = 1 << 10;

        /// Instruction fetches are not allowed.
        const NX = 1 << 63;
    }
}

impl EntryFlags {
    /// A writable kernel mapping.
    pub const PAGE_KERNEL: Self = Self::PRESENT
        .union(Self::WRITE)
        .union(Self::ACCESSED)
        .union(Self::DIRTY)
        .union(Self::NX);

    /// A read-only kernel mapping.
    pub const PAGE_KERNEL_RO: Self = Self::PRESENT
        .union(Self::ACCESSED)
        .union(Self::DIRTY)
        .union(Self::NX);

    /// An entry pointing to a lower-level table.
    pub const PAGE_TABLE: Self = Self::PRESENT
        .union(Self::WRITE)
        .union(Self::USER)
        .union(Self::ACCESSED)
        .union(Self::DIRTY);
}

/// A page table entry in the paging structures.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageTableEntry(pub u64);

impl PageTableEntry {
    /// Returns the flag bits of the entry.
    pub fn entry_flags(self) -> EntryFlags {
        EntryFlags::from_bits_retain(self.0 & !Self::FRAME_MASK)
    }

    /// Checks if the page is accessible in user mode.
    pub fn user(self) -> bool {
        self.entry_flags().contains(EntryFlags::USER)
    }

    /// Checks if the page has been accessed.
    pub fn accessed(self) -> bool {
        self.entry_flags().contains(EntryFlags::ACCESSED)
    }

    /// Checks if the page has been written to.
    pub fn dirty(self) -> bool {
        self.entry_flags().contains(EntryFlags::DIRTY)
    }

    /// Views a page of raw table memory as entries.
    ///
    /// Returns `None` if the buffer is not a whole number of entries.
    pub fn table(page: &[u8]) -> Option<&[Self]> {
        <[Self]>::ref_from_bytes(page).ok()
    }
}

impl TableEntry for PageTableEntry {
    const FRAME_MASK: u64 = 0x000f_ffff_ffff_f000;
    const FRAME_SHIFT: u64 = 12;

    fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    fn raw(self) -> u64 {
        self.0
    }

    fn present(self) -> bool {
        self.entry_flags().contains(EntryFlags::PRESENT)
    }

    fn writable(self) -> bool {
        self.entry_flags().contains(EntryFlags::WRITE)
    }

    fn large(self) -> bool {
        self.entry_flags().contains(EntryFlags::LARGE)
    }

    fn iomap(self) -> bool {
        self.entry_flags().contains(EntryFlags::IOMAP)
    }
}

impl std::fmt::Debug for PageTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("present", &self.present())
            .field("write", &self.writable())
            .field("user", &self.user())
            .field("accessed", &self.accessed())
            .field("dirty", &self.dirty())
            .field("large", &self.large())
            .field("iomap", &self.iomap())
            .field("frame", &format_args!("{:#x}", self.frame()))
            .finish()
    }
}
