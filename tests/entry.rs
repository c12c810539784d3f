mod common;

use pvmmu::{
    Architecture as _, DomId, Mfn, MmuConfig, MmuError, MmuExtOp, MulticallEntry, Pfn,
    TableEntry as _,
    arch::amd64::{Amd64, EntryFlags, PageTableEntry, PageTableLevel},
};

use self::common::*;

///////////////////////////////////////////////////////////////////////////////
// Translation
///////////////////////////////////////////////////////////////////////////////

#[test]
fn leaf_entries_round_trip() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;

    let entry = PageTableEntry::from_parts(200, PAGE_USER);
    let machine = mmu.make_pte(entry);

    assert_eq!(Mfn(machine.frame()), mmu.pfn_to_mfn(Pfn(200)));
    assert_eq!(machine.flags(), entry.flags());
    assert_eq!(mmu.pte_val(machine), entry);

    // Intermediate levels translate the same way.
    let table = table_entry(Pfn(300));
    assert_eq!(mmu.pmd_val(mmu.make_pmd(table)), table);
    assert_eq!(mmu.pud_val(mmu.make_pud(table)), table);
    assert_eq!(mmu.pgd_val(mmu.make_pgd(table)), table);
    Ok(())
}

#[test]
fn unbacked_frame_degrades_to_empty_entry() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;

    let entry = PageTableEntry::from_parts(0x10_0000, PAGE_USER);
    let machine = mmu.make_pte(entry);

    assert!(!machine.present());
    assert_eq!(machine.frame(), 0);
    assert_ne!(mmu.pte_val(machine), entry);
    Ok(())
}

#[test]
fn not_present_entries_pass_through() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;

    // A swap entry: not present, arbitrary payload.
    let entry = PageTableEntry(0x1234_5000 | EntryFlags::DIRTY.bits());
    assert_eq!(mmu.make_pte(entry), entry);
    assert_eq!(mmu.pte_val(entry), entry);
    Ok(())
}

#[test]
fn io_entries_name_machine_frames() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;
    let iomap = Amd64::PAGE_KERNEL | Amd64::PAGE_IOMAP;

    // Above the legacy ISA range the frame is taken as is.
    let mmio = PageTableEntry::from_parts(0xfee00, iomap);
    assert_eq!(mmu.make_pte(mmio), mmio);

    // Only the initial domain may map the ISA range directly.
    let isa = PageTableEntry::from_parts(0xa0, iomap);
    let machine = mmu.make_pte(isa);
    assert_eq!(Mfn(machine.frame()), mmu.pfn_to_mfn(Pfn(0xa0)));
    assert!(!machine.iomap());
    Ok(())
}

#[test]
fn machine_frames_of_other_domains_are_not_ours() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;

    let mfn = mmu.pfn_to_mfn(Pfn(42));
    assert_eq!(mmu.mfn_to_pfn(mfn), Pfn(42));
    assert_eq!(mmu.mfn_to_pfn(Mfn(0x9_0000)), Pfn::INVALID);

    // A machine frame whose physical frame is now backed by something else.
    assert!(mmu.set_phys_to_machine(Pfn(42), Mfn(0x9_0001)));
    assert_eq!(mmu.mfn_to_pfn(mfn), Pfn::INVALID);
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Updates
///////////////////////////////////////////////////////////////////////////////

#[test]
fn mapping_in_running_address_space_goes_by_address() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;
    let process = spawn_process(&mmu, VCPU0)?;
    mmu.activate_mm(VCPU0, &process.mm)?;

    let leaf = slot(process.l1(), USER_VA, PageTableLevel::Pt);
    let entry = mmu.make_pte(PageTableEntry::from_parts(process.data.0, Amd64::PAGE_KERNEL_RO));

    let before = mmu.driver().counters();
    mmu.set_pte_at(VCPU0, &process.mm, USER_VA, leaf, entry)?;
    let after = mmu.driver().counters();

    assert_eq!(after.va_updates, before.va_updates + 1);
    assert_eq!(after.mmu_updates, before.mmu_updates);
    assert_eq!(mmu.read_entry(leaf)?, entry);

    // Elsewhere the entry is located by machine address.
    mmu.set_pte_at(VCPU1, &process.mm, USER_VA, leaf, PageTableEntry(0))?;
    assert_eq!(mmu.driver().counters().mmu_updates, after.mmu_updates + 1);
    assert!(!mmu.read_entry(leaf)?.present());

    let stats = mmu.stats().snapshot();
    assert_eq!(stats.set_pte_at, 2);
    assert_eq!(stats.set_pte_at_current, 1);
    assert_eq!(stats.set_pte_at_pinned, 2);

    destroy_process(&mmu, VCPU0, process)
}

#[test]
fn protection_change_keeps_hardware_bits() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;
    let process = spawn_process(&mmu, VCPU0)?;
    mmu.activate_mm(VCPU0, &process.mm)?;

    let leaf = slot(process.l1(), USER_VA, PageTableLevel::Pt);
    let old = mmu.ptep_modify_prot_start(leaf)?;
    assert!(old.dirty() && old.accessed());

    let prot = EntryFlags::PRESENT | EntryFlags::USER | EntryFlags::NX;
    mmu.ptep_modify_prot_commit(VCPU0, leaf, PageTableEntry::from_parts(old.frame(), prot.bits()))?;

    let new = mmu.read_entry(leaf)?;
    assert!(new.dirty() && new.accessed());
    assert!(!new.writable());
    assert_eq!(new.frame(), old.frame());
    assert_eq!(mmu.stats().snapshot().prot_commit, 1);

    destroy_process(&mmu, VCPU0, process)
}

#[test]
fn lazy_mode_merges_updates_into_one_call() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;
    let process = spawn_process(&mmu, VCPU0)?;
    mmu.pin_table(VCPU0, &process.mm)?;

    let multicalls = mmu.driver().counters().multicalls;

    mmu.enter_lazy_mmu(VCPU0)?;
    for index in 0..8u64 {
        let va = USER_VA + (index << Amd64::PAGE_SHIFT);
        let entry = mmu.make_pte(PageTableEntry::from_parts(process.data.0, PAGE_USER));
        mmu.set_pte(VCPU0, slot(process.l1(), va, PageTableLevel::Pt), entry)?;
    }

    assert_eq!(mmu.driver().counters().multicalls, multicalls);
    assert_eq!(mmu.multicall().pending(VCPU0), 1);

    mmu.leave_lazy_mmu(VCPU0)?;
    assert_eq!(mmu.multicall().pending(VCPU0), 0);
    assert_eq!(mmu.driver().counters().multicalls, multicalls + 1);
    assert_eq!(mmu.driver().counters().mmu_updates, 8);

    let stats = mmu.stats().snapshot();
    assert_eq!(stats.pte.update_batched, 8);
    assert_eq!(stats.mmu_update_extended, 7);

    mmu.unpin_table(VCPU0, &process.mm)?;
    destroy_process(&mmu, VCPU0, process)
}

#[test]
fn root_entries_are_mirrored_into_user_root() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;
    let process = spawn_process(&mmu, VCPU0)?;
    let user_root = process.mm.user_root().ok_or(MmuError::Other("no user root"))?;
    mmu.activate_mm(VCPU0, &process.mm)?;

    let va = USER_VA + (1 << 39);
    let l3 = mmu.alloc_page()?;
    mmu.alloc_pud(VCPU0, &process.mm, l3)?;
    mmu.set_pgd(
        VCPU0,
        slot(process.mm.root(), va, PageTableLevel::Pml4),
        mmu.make_pgd(table_entry(l3)),
    )?;

    let mirrored = mmu.read_entry(slot(user_root, va, PageTableLevel::Pml4))?;
    assert_eq!(mmu.pgd_val(mirrored), table_entry(l3));

    // The kernel half is never mirrored.
    let kernel = slot(process.mm.root(), Amd64::PAGE_OFFSET, PageTableLevel::Pml4);
    let user_kernel = slot(user_root, Amd64::PAGE_OFFSET, PageTableLevel::Pml4);
    assert!(mmu.read_entry(kernel)?.present());
    assert!(!mmu.read_entry(user_kernel)?.present());

    mmu.set_pgd(
        VCPU0,
        slot(process.mm.root(), va, PageTableLevel::Pml4),
        PageTableEntry(0),
    )?;
    mmu.release_pud(VCPU0, l3)?;
    mmu.free_page(l3);

    destroy_process(&mmu, VCPU0, process)
}

#[test]
fn kernel_mapping_by_machine_frame() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;

    let pfn = mmu.alloc_page()?;
    let va = Amd64::pfn_to_va(pfn);
    let mfn = mmu.pfn_to_mfn(Pfn(100));

    mmu.set_pte_mfn(VCPU0, va, mfn, Amd64::PAGE_KERNEL_RO)?;

    let entry = PageTableEntry(mmu.driver().direct_map_entry(pfn)?);
    assert_eq!(Mfn(entry.frame()), mfn);
    assert!(!entry.writable());

    let leaf = mmu.create_lookup_pte_addr(mmu.kernel(), va)?;
    assert_eq!(leaf, mmu.va_to_machine(mmu.lookup_slot(mmu.info().kernel_root, va)?));
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Foreign frames
///////////////////////////////////////////////////////////////////////////////

#[test]
fn foreign_range_is_mapped_in_chunks() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default().with_remap_batch(4))?;
    let process = spawn_process(&mmu, VCPU0)?;
    mmu.activate_mm(VCPU0, &process.mm)?;
    mmu.driver().take_log();

    let domid = DomId(7);
    mmu.remap_domain_mfn_range(VCPU0, &process.mm, USER_VA, Mfn(0x9_0000), 10, PAGE_USER, domid)?;

    let log = mmu.driver().take_log();
    let chunks = log
        .iter()
        .flat_map(|(_, entries)| entries)
        .filter_map(|entry| match entry {
            MulticallEntry::MmuUpdate { updates, domid: owner } if *owner == domid => {
                Some(updates.len())
            }
            _ => None,
        })
        .collect::<Vec<_>>();

    assert_eq!(chunks, [4, 4, 2]);
    assert!(matches!(
        log.last().and_then(|(_, entries)| entries.last()),
        Some(MulticallEntry::MmuExtOp(MmuExtOp::TlbFlushAll))
    ));

    let last = mmu.read_entry(slot(process.l1(), USER_VA + (9 << 12), PageTableLevel::Pt))?;
    assert_eq!(Mfn(last.frame()), Mfn(0x9_0009));
    assert!(last.iomap());

    // Tables holding foreign frames stay pinned.
    assert!(process.mm.has_foreign_mappings());
    mmu.exit_mmap(VCPU0, &process.mm)?;
    assert!(mmu.is_pinned(process.mm.root()));
    assert!(matches!(
        mmu.pgd_free(&process.mm),
        Err(MmuError::StillPinned)
    ));
    Ok(())
}

#[test]
fn foreign_range_without_tables_still_flushes() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;
    let process = spawn_process(&mmu, VCPU0)?;
    let flushes = mmu.driver().counters().tlb_flushes;

    let unmapped = USER_VA + (1 << 30);
    assert!(matches!(
        mmu.remap_domain_mfn_range(VCPU0, &process.mm, unmapped, Mfn(0x9_0000), 1, PAGE_USER, DomId(7)),
        Err(MmuError::TableNotPresent(_))
    ));
    assert_eq!(mmu.driver().counters().tlb_flushes, flushes + 1);
    Ok(())
}

#[test]
fn domain_entry_is_tagged_with_owner() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;
    let process = spawn_process(&mmu, VCPU0)?;
    mmu.activate_mm(VCPU0, &process.mm)?;
    mmu.driver().take_log();

    let leaf = slot(process.l1(), USER_VA, PageTableLevel::Pt);
    mmu.set_domain_pte(VCPU0, leaf, PageTableEntry::from_parts(0x9_0000, PAGE_USER), DomId(3))?;

    let owners = mmu
        .driver()
        .take_log()
        .into_iter()
        .flat_map(|(_, entries)| entries)
        .filter_map(|entry| match entry {
            MulticallEntry::MmuUpdate { domid, .. } => Some(domid),
            _ => None,
        })
        .collect::<Vec<_>>();

    assert_eq!(owners, [DomId(3)]);
    assert_eq!(mmu.read_entry(leaf)?.frame(), 0x9_0000);

    destroy_process(&mmu, VCPU0, process)
}
