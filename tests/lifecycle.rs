mod common;

use pvmmu::{MAX_P2M_PFN, Mfn, MmuConfig, MmuError, P2M_PER_PAGE, PageFlags, Pfn};

use self::common::*;

fn save_pinned(mmu: &SimMmu, root: Pfn) -> bool {
    mmu.page_info(root)
        .is_some_and(|page| page.contains(PageFlags::SAVE_PINNED))
}

///////////////////////////////////////////////////////////////////////////////
// Save/restore
///////////////////////////////////////////////////////////////////////////////

#[test]
fn suspend_pins_every_address_space() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;
    let running = spawn_process(&mmu, VCPU0)?;
    let idle = spawn_process(&mmu, VCPU0)?;
    mmu.activate_mm(VCPU0, &running.mm)?;

    mmu.suspend(VCPU0)?;

    for pfn in running.table_pages().into_iter().chain(idle.table_pages()) {
        assert!(mmu.is_pinned(pfn));
    }
    assert!(save_pinned(&mmu, idle.mm.root()));
    assert!(!save_pinned(&mmu, running.mm.root()));

    mmu.resume(VCPU0)?;

    assert!(!mmu.is_pinned(idle.mm.root()));
    assert!(!save_pinned(&mmu, idle.mm.root()));
    assert!(mmu.is_pinned(running.mm.root()));

    let p2m = mmu.p2m();
    assert_eq!(
        mmu.driver().frame_list_list(),
        Some((p2m.frame_list_list(), p2m.max_pfn()))
    );

    destroy_process(&mmu, VCPU0, idle)?;
    destroy_process(&mmu, VCPU0, running)
}

#[test]
fn dropped_address_spaces_are_forgotten() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;
    let process = spawn_process(&mmu, VCPU0)?;
    let root = process.mm.root();
    destroy_process(&mmu, VCPU0, process)?;

    let pins = mmu.driver().counters().pins;
    mmu.suspend(VCPU0)?;

    assert_eq!(mmu.driver().counters().pins, pins);
    assert!(!mmu.is_pinned(root));

    mmu.resume(VCPU0)
}

#[test]
fn resume_refuses_lost_pin() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;
    let process = spawn_process(&mmu, VCPU0)?;

    mmu.suspend(VCPU0)?;
    mmu.unpin_table(VCPU0, &process.mm)?;

    assert!(matches!(mmu.resume(VCPU0), Err(MmuError::Other(_))));
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Frame translation table
///////////////////////////////////////////////////////////////////////////////

#[test]
fn translation_table_grows_on_demand() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;
    let far = Pfn(10_000_000);

    assert_eq!(mmu.pfn_to_mfn(far), Mfn::INVALID);
    assert_eq!(mmu.p2m().leaf_frame(far), None);

    assert!(mmu.set_phys_to_machine(Pfn(0), Mfn(100)));
    assert!(mmu.set_phys_to_machine(far, Mfn(5)));

    assert_eq!(mmu.pfn_to_mfn(Pfn(0)), Mfn(100));
    assert_eq!(mmu.pfn_to_mfn(far), Mfn(5));

    // Neighbours share the new leaf but stay unbacked.
    assert_eq!(mmu.pfn_to_mfn(far + 1), Mfn::INVALID);
    assert_eq!(mmu.pfn_to_mfn(Pfn(20_000_000)), Mfn::INVALID);

    // Beyond the three levels nothing can be stored.
    assert!(!mmu.set_phys_to_machine(Pfn(MAX_P2M_PFN), Mfn(1)));
    assert!(mmu.set_phys_to_machine(Pfn(MAX_P2M_PFN), Mfn::INVALID));
    assert_eq!(mmu.pfn_to_mfn(Pfn(MAX_P2M_PFN)), Mfn::INVALID);
    Ok(())
}

#[test]
fn machine_address_shadow_follows_the_table() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;
    let far = Pfn(10_000_000);

    assert!(mmu.set_phys_to_machine(far, Mfn(5)));
    mmu.suspend(VCPU0)?;
    mmu.resume(VCPU0)?;

    let p2m = mmu.p2m();
    for pfn in [Pfn(0), Pfn(P2M_PER_PAGE as u64 * 3 + 7), far] {
        let leaf = p2m.leaf_frame(pfn).ok_or(MmuError::Other("leaf missing"))?;
        assert_eq!(p2m.shadow_leaf_mfn(pfn), mmu.pfn_to_mfn(leaf));
    }

    assert_eq!(mmu.pfn_to_mfn(far), Mfn(5));
    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Configuration
///////////////////////////////////////////////////////////////////////////////

#[test]
fn boot_from_toml() -> Result<(), Box<dyn std::error::Error>> {
    let config: MmuConfig = toml::from_str(
        r#"
        remap_batch = 4
        split_ptlocks = false
        max_contig_order = 4
        "#,
    )?;

    assert_eq!(config.batch_entries, MmuConfig::default().batch_entries);

    let mmu = boot(config)?;
    assert_eq!(mmu.config().remap_batch, 4);
    assert!(!mmu.config().split_ptlocks);

    let process = spawn_process(&mmu, VCPU0)?;
    mmu.activate_mm(VCPU0, &process.mm)?;
    assert!(mmu.pte_lock(process.l1()).is_none());

    destroy_process(&mmu, VCPU0, process)?;
    Ok(())
}

#[test]
fn oversized_region_order_is_refused() -> Result<(), Box<dyn std::error::Error>> {
    let config: MmuConfig = toml::from_str("max_contig_order = 64")?;
    assert!(matches!(
        boot(config),
        Err(MmuError::OrderTooLarge { order: 64, max: 12 })
    ));

    // A region may span all of guest memory, but no more.
    assert!(boot(MmuConfig::default().with_max_contig_order(13)).is_err());
    boot(MmuConfig::default().with_max_contig_order(12))?;
    Ok(())
}
