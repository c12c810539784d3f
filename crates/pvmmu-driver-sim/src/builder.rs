use std::sync::Arc;

use pvmmu_arch_amd64::{Amd64, PageTableEntry, PageTableLevel};
use pvmmu_core::{
    Architecture as _, BumpAllocator, FramePool, Mfn, MmuInfo, Pfn, PinLevel, TableEntry as _,
};

use crate::{Error, SimDriver, machine::Machine, validation};

/// First machine frame backing guest memory.
const GUEST_MFN_BASE: u64 = 0x80000;

/// First free machine frame when the guest is not auto-translated.
const FREE_MFN_BASE: u64 = 0x1000;

/// Largest guest the single direct-map directory table can describe.
const MAX_PAGES: u64 = (Amd64::ENTRIES_PER_TABLE * Amd64::ENTRIES_PER_TABLE) as u64;

/// A freshly booted simulated guest.
pub struct SimGuest {
    /// The hypervisor driver.
    pub driver: SimDriver,

    /// Boot allocator for early frame translation pages.
    pub early: Arc<BumpAllocator>,

    /// Every guest page not used by the boot layout.
    pub pool: Arc<FramePool>,
}

/// Builds a simulated guest in its start-of-day state.
///
/// The guest layout is:
///
/// - pfn 0 is reserved,
/// - the boot frame list follows from pfn 1,
/// - then the kernel root, one third level, one directory and the leaf
///   tables of the direct map,
/// - then the boot allocator range,
/// - and every remaining page is free.
///
/// Guest frames are backed by machine frames in descending order, so no two
/// consecutive physical frames are machine-contiguous. The kernel root is
/// pinned and loaded on every vCPU, and every table page is mapped
/// read-only in the direct map.
#[derive(Debug, Clone)]
pub struct SimBuilder {
    nr_pages: u64,
    vcpus: u16,
    early_pages: u64,
    free_frames: u64,
    highmem_start: Option<Pfn>,
    auto_translated: bool,
}

impl SimBuilder {
    /// Creates a builder for a guest of `nr_pages` pages.
    pub fn new(nr_pages: u64) -> Self {
        Self {
            nr_pages,
            vcpus: 2,
            early_pages: 32,
            free_frames: 1024,
            highmem_start: None,
            auto_translated: false,
        }
    }

    /// Sets the number of vCPUs.
    pub fn with_vcpus(self, vcpus: u16) -> Self {
        Self { vcpus, ..self }
    }

    /// Sets the size of the boot allocator range.
    pub fn with_early_pages(self, early_pages: u64) -> Self {
        Self {
            early_pages,
            ..self
        }
    }

    /// Sets the number of free machine frames the host holds.
    pub fn with_free_frames(self, free_frames: u64) -> Self {
        Self {
            free_frames,
            ..self
        }
    }

    /// Exempts guest frames from `pfn` on from the table safety rule.
    pub fn with_highmem_start(self, highmem_start: impl Into<Option<Pfn>>) -> Self {
        Self {
            highmem_start: highmem_start.into(),
            ..self
        }
    }

    /// Makes the host translate frames itself.
    pub fn with_auto_translated(self, auto_translated: bool) -> Self {
        Self {
            auto_translated,
            ..self
        }
    }

    /// Builds the guest.
    pub fn build(self) -> Result<SimGuest, Error> {
        let nr = self.nr_pages;
        if nr == 0 || nr > MAX_PAGES {
            return Err(Error::Layout("guest size out of range"));
        }

        if self.vcpus == 0 || usize::from(self.vcpus) > pvmmu_core::CpuMask::CAPACITY {
            return Err(Error::Layout("vcpu count out of range"));
        }

        let per_table = Amd64::ENTRIES_PER_TABLE as u64;
        let nr_list = nr.div_ceil(per_table);
        let nr_l1 = nr.div_ceil(per_table);

        let mfn_list_frame = Pfn(1);
        let root = mfn_list_frame + nr_list;
        let l3 = root + 1;
        let l2 = root + 2;
        let l1_first = root + 3;
        let early_first = l1_first + nr_l1;
        let pool_first = early_first + self.early_pages;

        if pool_first.0 >= nr {
            return Err(Error::Layout("guest too small for its boot layout"));
        }

        let auto_translated = self.auto_translated;
        let mfn_of = |pfn: Pfn| match auto_translated {
            true => Mfn(pfn.0),
            false => Mfn(GUEST_MFN_BASE + (nr - 1 - pfn.0)),
        };

        let is_table = |pfn: Pfn| {
            pfn == root || pfn == l3 || pfn == l2 || (l1_first..l1_first + nr_l1).contains(&pfn)
        };

        let info = MmuInfo {
            page_size: Amd64::PAGE_SIZE,
            page_shift: Amd64::PAGE_SHIFT,
            nr_pages: nr,
            mfn_list: (0..nr).map(|pfn| mfn_of(Pfn(pfn))).collect(),
            mfn_list_frame,
            kernel_root: root,
            vcpus: self.vcpus,
            auto_translated,
            initial_domain: false,
        };

        let mut machine = Machine::new(info, mfn_of(root), self.highmem_start);

        for pfn in (0..nr).map(Pfn) {
            machine.m2p.insert(mfn_of(pfn), pfn);
        }

        let free_base = match auto_translated {
            true => GUEST_MFN_BASE,
            false => FREE_MFN_BASE,
        };
        machine
            .free
            .extend((free_base..free_base + self.free_frames).map(Mfn));

        let table = |pfn: Pfn| PageTableEntry::from_parts(mfn_of(pfn).0, Amd64::PAGE_TABLE).raw();

        let root_index = Amd64::va_index_for(Amd64::PAGE_OFFSET, PageTableLevel::Pml4) as usize;
        let l3_index = Amd64::va_index_for(Amd64::PAGE_OFFSET, PageTableLevel::Pdpt) as usize;
        machine.set_entry(mfn_of(root), root_index, table(l3));
        machine.set_entry(mfn_of(l3), l3_index, table(l2));

        for index in 0..nr_l1 {
            machine.set_entry(mfn_of(l2), index as usize, table(l1_first + index));
        }

        for pfn in (0..nr).map(Pfn) {
            let prot = match is_table(pfn) {
                true => Amd64::PAGE_KERNEL_RO,
                false => Amd64::PAGE_KERNEL,
            };

            let l1 = l1_first + pfn.0 / per_table;
            let entry = PageTableEntry::from_parts(mfn_of(pfn).0, prot);
            machine.set_entry(mfn_of(l1), (pfn.0 % per_table) as usize, entry.raw());
        }

        machine.pinned.insert(mfn_of(root), PinLevel::L4);
        validation::check(&machine)?;

        tracing::debug!(
            nr_pages = nr,
            vcpus = self.vcpus,
            %root,
            %pool_first,
            "simulated guest built"
        );

        Ok(SimGuest {
            driver: SimDriver::new(machine),
            early: Arc::new(BumpAllocator::new(early_first, self.early_pages)),
            pool: Arc::new(FramePool::new((pool_first.0..nr).map(Pfn))),
        })
    }
}
