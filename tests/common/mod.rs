#![allow(dead_code)]

use std::sync::Arc;

use pvmmu::{
    AddressSpace, Architecture as _, Mmu, MmuConfig, MmuError, Pfn, TableEntry as _, Va, VcpuId,
    arch::amd64::{Amd64, EntryFlags, PageTableEntry, PageTableLevel},
    driver::sim::{SimBuilder, SimDriver},
};
use tracing_subscriber::EnvFilter;

pub type SimMmu = Arc<Mmu<SimDriver>>;

pub const VCPU0: VcpuId = VcpuId(0);
pub const VCPU1: VcpuId = VcpuId(1);

/// A user address mapped by [`spawn_process`].
pub const USER_VA: Va = Va(0x0000_7f12_3440_0000);

/// Protection of user data pages.
pub const PAGE_USER: u64 = EntryFlags::PAGE_KERNEL.union(EntryFlags::USER).bits();

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Boots a 4096 page guest with two vCPUs.
pub fn boot(config: MmuConfig) -> Result<SimMmu, MmuError> {
    boot_with(SimDriver::builder(4096), config)
}

pub fn boot_with(builder: SimBuilder, config: MmuConfig) -> Result<SimMmu, MmuError> {
    init_tracing();

    let guest = builder.build()?;
    Mmu::new(guest.driver, guest.early, guest.pool, config)
}

/// Returns the direct-map address of the entry for `va` in `table`.
pub fn slot(table: Pfn, va: Va, level: PageTableLevel) -> Va {
    Amd64::pfn_to_va(table) + Amd64::va_index_for(va, level) * size_of::<u64>() as u64
}

/// Builds a physical-form table entry.
pub fn table_entry(pfn: Pfn) -> PageTableEntry {
    PageTableEntry::from_parts(pfn.0, Amd64::PAGE_TABLE)
}

/// A process address space with one user page mapped at [`USER_VA`].
pub struct Process {
    pub mm: Arc<AddressSpace>,

    /// Intermediate tables, leaf first.
    pub tables: Vec<(PageTableLevel, Pfn)>,

    pub data: Pfn,
}

impl Process {
    pub fn l1(&self) -> Pfn {
        self.tables[0].1
    }

    pub fn l2(&self) -> Pfn {
        self.tables[1].1
    }

    /// Every table page of the process, in the order a pin visits them.
    pub fn table_pages(&self) -> Vec<Pfn> {
        self.tables
            .iter()
            .map(|&(_, pfn)| pfn)
            .chain([self.mm.root()])
            .collect()
    }
}

/// Creates an unpinned address space mapping one data page at [`USER_VA`].
pub fn spawn_process(mmu: &SimMmu, vcpu: VcpuId) -> Result<Process, MmuError> {
    let mm = mmu.pgd_alloc()?;

    let l3 = mmu.alloc_page()?;
    let l2 = mmu.alloc_page()?;
    let l1 = mmu.alloc_page()?;
    let data = mmu.alloc_page()?;

    mmu.set_pgd(
        vcpu,
        slot(mm.root(), USER_VA, PageTableLevel::Pml4),
        mmu.make_pgd(table_entry(l3)),
    )?;
    mmu.set_pud(
        vcpu,
        slot(l3, USER_VA, PageTableLevel::Pdpt),
        mmu.make_pud(table_entry(l2)),
    )?;
    mmu.set_pmd(
        vcpu,
        slot(l2, USER_VA, PageTableLevel::Pd),
        mmu.make_pmd(table_entry(l1)),
    )?;
    mmu.set_pte(
        vcpu,
        slot(l1, USER_VA, PageTableLevel::Pt),
        mmu.make_pte(PageTableEntry::from_parts(data.0, PAGE_USER)),
    )?;

    Ok(Process {
        mm,
        tables: vec![
            (PageTableLevel::Pt, l1),
            (PageTableLevel::Pd, l2),
            (PageTableLevel::Pdpt, l3),
        ],
        data,
    })
}

/// Tears a process down and returns every page it used.
pub fn destroy_process(mmu: &SimMmu, vcpu: VcpuId, process: Process) -> Result<(), MmuError> {
    mmu.exit_mmap(vcpu, &process.mm)?;
    mmu.pgd_free(&process.mm)?;

    for (_, pfn) in process.tables {
        mmu.free_page(pfn);
    }
    mmu.free_page(process.data);

    Ok(())
}

/// Checks if the direct map of `pfn` is read-only.
pub fn is_read_only(mmu: &SimMmu, pfn: Pfn) -> Result<bool, MmuError> {
    let entry = PageTableEntry(mmu.driver().direct_map_entry(pfn)?);
    Ok(entry.present() && !entry.writable())
}
