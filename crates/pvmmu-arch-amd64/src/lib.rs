//! AMD64 paging layout of a paravirtualized guest.

mod paging;

use pvmmu_core::{Architecture, PinLevel, Va};

pub use self::paging::{EntryFlags, PageTableEntry, PageTableLevel};

/// AMD64 architecture.
#[derive(Debug)]
pub struct Amd64;

impl Amd64 {
    /// The first root slot reserved for the hypervisor.
    pub const HYPERVISOR_SLOT_START: usize = 256;

    /// One past the last root slot reserved for the hypervisor.
    pub const HYPERVISOR_SLOT_END: usize = 272;
}

impl Architecture for Amd64 {
    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_SHIFT: u64 = 12;
    const PAGE_MASK: u64 = 0xFFFFFFFFFFFFF000;

    const ENTRIES_PER_TABLE: usize = 512;

    const USER_LIMIT: Va = Va(0x0000_8000_0000_0000);
    const PAGE_OFFSET: Va = Va(0xffff_8800_0000_0000);
    const FIXADDR_TOP: Va = Va(0xffff_ffff_ff5f_f000);
    const ISA_END: u64 = 0x10_0000;

    const PAGE_KERNEL: u64 = EntryFlags::PAGE_KERNEL.bits();
    const PAGE_KERNEL_RO: u64 = EntryFlags::PAGE_KERNEL_RO.bits();
    const PAGE_TABLE: u64 = EntryFlags::PAGE_TABLE.bits();
    const PAGE_IOMAP: u64 = EntryFlags::IOMAP.bits();
    const PAGE_SPECIAL: u64 = EntryFlags::SPECIAL.bits();

    type PageTableLevel = PageTableLevel;
    type PageTableEntry = PageTableEntry;

    const ROOT_LEVEL: PageTableLevel = PageTableLevel::Pml4;
    const LEAF_LEVEL: PageTableLevel = PageTableLevel::Pt;

    fn next_level(level: PageTableLevel) -> Option<PageTableLevel> {
        level.next()
    }

    fn previous_level(level: PageTableLevel) -> Option<PageTableLevel> {
        level.previous()
    }

    fn pin_level(level: PageTableLevel) -> PinLevel {
        match level {
            PageTableLevel::Pt => PinLevel::L1,
            PageTableLevel::Pd => PinLevel::L2,
            PageTableLevel::Pdpt => PinLevel::L3,
            PageTableLevel::Pml4 => PinLevel::L4,
        }
    }

    fn va_index_for(va: Va, level: PageTableLevel) -> u64 {
        (va.0 >> level.shift()) & 0x1ff
    }
}
