use pvmmu::{
    Architecture as _, Mmu, MmuConfig, TableEntry as _, VcpuId,
    arch::amd64::{Amd64, PageTableEntry, PageTableLevel},
    driver::sim::SimDriver,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    // Boot a small guest on the in-memory hypervisor.
    let guest = SimDriver::builder(4096).with_vcpus(2).build()?;
    let mmu = Mmu::new(guest.driver, guest.early, guest.pool, MmuConfig::default())?;
    let vcpu = VcpuId(0);

    // Build a process address space mapping a single page.
    let va = pvmmu::Va(0x0000_7f00_0000_0000);
    let mm = mmu.pgd_alloc()?;

    let mut table = mm.root();
    let mut level = Amd64::ROOT_LEVEL;
    let mut tables = Vec::new();

    while let Some(next) = Amd64::next_level(level) {
        let lower = mmu.alloc_page()?;
        let slot = Amd64::pfn_to_va(table) + Amd64::va_index_for(va, level) * 8;
        let entry = PageTableEntry::from_parts(lower.0, Amd64::PAGE_TABLE);

        match level {
            PageTableLevel::Pml4 => mmu.set_pgd(vcpu, slot, mmu.make_pgd(entry))?,
            PageTableLevel::Pdpt => mmu.set_pud(vcpu, slot, mmu.make_pud(entry))?,
            _ => mmu.set_pmd(vcpu, slot, mmu.make_pmd(entry))?,
        }

        tables.push(lower);
        table = lower;
        level = next;
    }

    let data = mmu.alloc_page()?;
    let slot = Amd64::pfn_to_va(table) + Amd64::va_index_for(va, level) * 8;
    mmu.set_pte(
        vcpu,
        slot,
        mmu.make_pte(PageTableEntry::from_parts(data.0, Amd64::PAGE_KERNEL)),
    )?;

    // Run it. The first activation pins the tree.
    mmu.activate_mm(vcpu, &mm)?;
    println!("root {} pinned: {}", mm.root(), mmu.is_pinned(mm.root()));
    println!("entry: {:#?}", mmu.pte_val(mmu.read_entry(slot)?));

    // Hand a device a machine-contiguous buffer below 4 GiB.
    let first = mmu.alloc_page()?;
    for _ in 1..4 {
        mmu.alloc_page()?;
    }

    mmu.make_contiguous(vcpu, Amd64::pfn_to_va(first), 2, 32)?;
    println!("contiguous buffer at {}", mmu.pfn_to_mfn(first));
    mmu.destroy_contiguous(vcpu, Amd64::pfn_to_va(first), 2)?;

    // Tear the process down.
    mmu.exit_mmap(vcpu, &mm)?;
    mmu.pgd_free(&mm)?;
    for pfn in tables.into_iter().chain([data]) {
        mmu.free_page(pfn);
    }

    println!("{:#?}", mmu.stats().snapshot());
    println!("{:#?}", mmu.driver().counters());

    Ok(())
}
