mod common;

use pvmmu::{
    Architecture as _, Mfn, MmuConfig, MmuDriver as _, MmuError, Pfn, TableEntry as _, Va,
    arch::amd64::{Amd64, PageTableEntry},
    driver::sim::{ExchangeFault, SimDriver},
};

use self::common::*;

/// Allocates `2^order` consecutive pages and returns the first one.
fn alloc_region(mmu: &SimMmu, order: u32) -> Result<Pfn, MmuError> {
    let first = mmu.alloc_page()?;
    for index in 1..1u64 << order {
        let pfn = mmu.alloc_page()?;
        assert_eq!(pfn, first + index, "page pool is not handing out consecutive pages");
    }

    Ok(first)
}

/// Captures the translation and the direct-map entry of every page of a
/// region.
fn snapshot(mmu: &SimMmu, first: Pfn, order: u32) -> Result<Vec<(Mfn, u64)>, MmuError> {
    (0..1u64 << order)
        .map(|index| {
            let pfn = first + index;
            Ok((mmu.pfn_to_mfn(pfn), mmu.driver().direct_map_entry(pfn)?))
        })
        .collect()
}

fn is_contiguous(mmu: &SimMmu, first: Pfn, order: u32) -> bool {
    let base = mmu.pfn_to_mfn(first);
    (0..1u64 << order).all(|index| mmu.pfn_to_mfn(first + index) == base + index)
}

///////////////////////////////////////////////////////////////////////////////
// Exchange
///////////////////////////////////////////////////////////////////////////////

#[test]
fn make_and_destroy() -> Result<(), MmuError> {
    const ORDER: u32 = 2;

    let mmu = boot(MmuConfig::default())?;
    let first = alloc_region(&mmu, ORDER)?;
    let vstart = Amd64::pfn_to_va(first);
    let free = mmu.driver().free_frames();

    assert!(!is_contiguous(&mmu, first, ORDER));
    mmu.make_contiguous(VCPU0, vstart, ORDER, 32)?;
    assert!(is_contiguous(&mmu, first, ORDER));

    for index in 0..1u64 << ORDER {
        let pfn = first + index;
        let mfn = mmu.pfn_to_mfn(pfn);

        assert!(mfn.0 < 1 << (32 - Amd64::PAGE_SHIFT));
        assert_eq!(mmu.mfn_to_pfn(mfn), pfn);

        let entry = PageTableEntry(mmu.driver().direct_map_entry(pfn)?);
        assert_eq!(entry, PageTableEntry::from_parts(mfn.0, Amd64::PAGE_KERNEL));
    }

    // The region is usable and the frames traded away are back in the pool.
    mmu.driver().write_u64(vstart + 8, 0x5a5a)?;
    assert_eq!(mmu.driver().free_frames(), free);

    mmu.destroy_contiguous(VCPU0, vstart, ORDER)?;
    assert_eq!(mmu.driver().free_frames(), free);

    for index in 0..1u64 << ORDER {
        let pfn = first + index;
        let mfn = mmu.pfn_to_mfn(pfn);
        assert!(mfn.is_valid());
        assert_eq!(mmu.mfn_to_pfn(mfn), pfn);
        mmu.driver().write_u64(Amd64::pfn_to_va(pfn), 1)?;
    }

    Ok(())
}

#[test]
fn single_page() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;
    let pfn = mmu.alloc_page()?;
    let invlpgs = mmu.driver().counters().invlpgs;

    mmu.make_contiguous(VCPU0, Amd64::pfn_to_va(pfn), 0, 26)?;

    assert!(mmu.pfn_to_mfn(pfn).0 < 1 << (26 - Amd64::PAGE_SHIFT));
    assert_eq!(mmu.driver().counters().invlpgs, invlpgs + 1);
    Ok(())
}

#[test]
fn exchange_is_serialized() -> Result<(), MmuError> {
    const ORDER: u32 = 3;

    let mmu = boot(MmuConfig::default())?;
    let regions = (0..4)
        .map(|_| alloc_region(&mmu, ORDER))
        .collect::<Result<Vec<_>, _>>()?;

    let results = std::thread::scope(|scope| {
        let handles = regions
            .iter()
            .map(|&first| {
                let mmu = &mmu;
                scope.spawn(move || mmu.make_contiguous(VCPU0, Amd64::pfn_to_va(first), ORDER, 32))
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|handle| handle.join())
            .collect::<Vec<_>>()
    });

    for result in results {
        assert!(matches!(result, Ok(Ok(()))));
    }

    for first in regions {
        assert!(is_contiguous(&mmu, first, ORDER));
    }

    Ok(())
}

///////////////////////////////////////////////////////////////////////////////
// Failure and rollback
///////////////////////////////////////////////////////////////////////////////

#[test]
fn refused_exchange_restores_region() -> Result<(), MmuError> {
    const ORDER: u32 = 3;

    let mmu = boot(MmuConfig::default())?;
    let first = alloc_region(&mmu, ORDER)?;
    let before = snapshot(&mmu, first, ORDER)?;

    mmu.driver().inject_exchange_fault(ExchangeFault::Refuse);
    assert!(matches!(
        mmu.make_contiguous(VCPU0, Amd64::pfn_to_va(first), ORDER, 32),
        Err(MmuError::OutOfMemory)
    ));

    assert_eq!(snapshot(&mmu, first, ORDER)?, before);
    Ok(())
}

#[test]
fn unreachable_address_limit_restores_region() -> Result<(), MmuError> {
    const ORDER: u32 = 1;

    let mmu = boot(MmuConfig::default())?;
    let first = alloc_region(&mmu, ORDER)?;
    let before = snapshot(&mmu, first, ORDER)?;
    let free = mmu.driver().free_frames();

    // No free machine frame lies below 1 MiB.
    assert!(matches!(
        mmu.make_contiguous(VCPU0, Amd64::pfn_to_va(first), ORDER, 20),
        Err(MmuError::OutOfMemory)
    ));

    assert_eq!(snapshot(&mmu, first, ORDER)?, before);
    assert_eq!(mmu.driver().free_frames(), free);
    Ok(())
}

#[test]
fn refused_release_keeps_extent() -> Result<(), MmuError> {
    const ORDER: u32 = 2;

    let mmu = boot(MmuConfig::default())?;
    let first = alloc_region(&mmu, ORDER)?;
    let vstart = Amd64::pfn_to_va(first);

    mmu.make_contiguous(VCPU0, vstart, ORDER, 32)?;
    let before = snapshot(&mmu, first, ORDER)?;

    mmu.driver().inject_exchange_fault(ExchangeFault::Refuse);
    assert!(matches!(
        mmu.destroy_contiguous(VCPU0, vstart, ORDER),
        Err(MmuError::ExchangeFailed)
    ));

    assert_eq!(snapshot(&mmu, first, ORDER)?, before);
    assert!(is_contiguous(&mmu, first, ORDER));
    Ok(())
}

#[test]
fn order_above_limit_is_rejected() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default().with_max_contig_order(2))?;
    let first = alloc_region(&mmu, 3)?;
    let exchanges = mmu.driver().counters().exchanges;

    assert!(matches!(
        mmu.make_contiguous(VCPU0, Amd64::pfn_to_va(first), 3, 32),
        Err(MmuError::OrderTooLarge { order: 3, max: 2 })
    ));
    assert!(matches!(
        mmu.destroy_contiguous(VCPU0, Amd64::pfn_to_va(first), 3),
        Err(MmuError::OrderTooLarge { order: 3, max: 2 })
    ));

    assert_eq!(mmu.driver().counters().exchanges, exchanges);
    Ok(())
}

#[test]
#[should_panic(expected = "inconsistent memory exchange")]
fn partial_exchange_is_fatal() {
    let mmu = boot(MmuConfig::default()).expect("boot");
    let first = alloc_region(&mmu, 2).expect("region");

    mmu.driver().inject_exchange_fault(ExchangeFault::Partial);
    let _ = mmu.make_contiguous(VCPU0, Amd64::pfn_to_va(first), 2, 32);
}

#[test]
fn auto_translated_guest_needs_no_exchange() -> Result<(), MmuError> {
    let mmu = boot_with(
        SimDriver::builder(4096).with_auto_translated(true),
        MmuConfig::default(),
    )?;

    let first = alloc_region(&mmu, 2)?;
    mmu.make_contiguous(VCPU0, Amd64::pfn_to_va(first), 2, 32)?;
    mmu.destroy_contiguous(VCPU0, Amd64::pfn_to_va(first), 2)?;

    assert_eq!(mmu.driver().counters().exchanges, 0);
    assert_eq!(mmu.pfn_to_mfn(first), Mfn(first.0));
    Ok(())
}

#[test]
fn unmapped_region_fails_before_exchange() -> Result<(), MmuError> {
    let mmu = boot(MmuConfig::default())?;

    assert!(mmu.make_contiguous(VCPU0, Va(0x1000), 0, 32).is_err());
    assert_eq!(mmu.driver().counters().exchanges, 0);
    Ok(())
}
