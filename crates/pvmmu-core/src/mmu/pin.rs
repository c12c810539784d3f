//! Pinning of process page tables.
//!
//! While an address space may be loaded on a vCPU, every page of its page
//! table tree is mapped read-only and registered with the hypervisor, which
//! validates the tree once and from then on only accepts checked updates.
//! Pinning walks the tree bottom-up so the root, whose pin validates the
//! whole tree, is handled last.

use std::{mem, sync::Arc};

use super::{Level, Mmu};
use crate::{
    AddressSpace, Architecture as _, Batch, LazyMode, MmuDriver, MmuError, MmuExtOp, PageFlags,
    Pfn, UvmFlags, VcpuId, walk,
};

impl<Driver> Mmu<Driver>
where
    Driver: MmuDriver,
{
    /// Makes a table page read-only and, for leaf tables with split locks,
    /// pins it on its own.
    ///
    /// The split lock of a leaf table is held from the read-only remap until
    /// the batch carrying the pin has been submitted, so nobody attempts a
    /// plain write to a page that is read-only but not yet pinned.
    ///
    /// Returns `true` if the page has no permanent mapping, in which case
    /// stale temporary mappings of it must be flushed.
    fn pin_page(&self, batch: &mut Batch<'_, Driver>, level: Level<Driver>, pfn: Pfn) -> bool {
        let Some(page) = self.pages.get(pfn) else {
            tracing::warn!(%pfn, "table page outside of guest memory");
            return false;
        };

        if page.test_and_set(PageFlags::PINNED) {
            return false;
        }

        if self.is_highmem(pfn) {
            return true;
        }

        tracing::trace!(%pfn, ?level, "pin");

        let lock = match level == Driver::Architecture::LEAF_LEVEL {
            true => self.pte_lock(pfn),
            false => None,
        };

        if let Some(lock) = &lock {
            mem::forget(lock.lock());
        }

        let flags = match level == Driver::Architecture::ROOT_LEVEL {
            true => UvmFlags::TLB_FLUSH,
            false => UvmFlags::empty(),
        };
        batch.entry(self.remap_frame(pfn, Driver::Architecture::PAGE_KERNEL_RO, flags));

        if let Some(lock) = lock {
            Self::queue_op(
                batch,
                MmuExtOp::Pin {
                    level: Driver::Architecture::pin_level(level),
                    mfn: self.pfn_to_mfn(pfn),
                },
            );

            // SAFETY: the guard was forgotten above on this thread, and the
            // batch is flushed on this thread before the walk returns.
            batch.callback(move || unsafe { lock.force_unlock() });
        }

        false
    }

    /// Reverses [`pin_page`](Self::pin_page).
    fn unpin_page(&self, batch: &mut Batch<'_, Driver>, level: Level<Driver>, pfn: Pfn) -> bool {
        let Some(page) = self.pages.get(pfn) else {
            return false;
        };

        if !page.test_and_clear(PageFlags::PINNED) || self.is_highmem(pfn) {
            return false;
        }

        tracing::trace!(%pfn, ?level, "unpin");

        let lock = match level == Driver::Architecture::LEAF_LEVEL {
            true => self.pte_lock(pfn),
            false => None,
        };

        if let Some(lock) = &lock {
            mem::forget(lock.lock());
            Self::queue_op(
                batch,
                MmuExtOp::Unpin {
                    mfn: self.pfn_to_mfn(pfn),
                },
            );
        }

        let flags = match level == Driver::Architecture::ROOT_LEVEL {
            true => UvmFlags::TLB_FLUSH,
            false => UvmFlags::empty(),
        };
        batch.entry(self.remap_frame(pfn, Driver::Architecture::PAGE_KERNEL, flags));

        if let Some(lock) = lock {
            // SAFETY: see `pin_page`.
            batch.callback(move || unsafe { lock.force_unlock() });
        }

        false
    }

    /// Collects the table pages below the user limit, root last.
    ///
    /// Nothing is changed until the whole tree has been read, so a tree
    /// that cannot be walked is left as it was.
    fn table_pages(&self, root: Pfn) -> Result<Vec<(Level<Driver>, Pfn)>, MmuError> {
        let mut pages = Vec::new();

        walk(
            &self.driver,
            self,
            root,
            Driver::Architecture::USER_LIMIT,
            &mut |level: Level<Driver>, pfn: Pfn| -> Result<bool, MmuError> {
                pages.push((level, pfn));
                Ok(false)
            },
        )?;

        Ok(pages)
    }

    fn pgd_pin(&self, vcpu: VcpuId, root: Pfn) -> Result<(), MmuError> {
        let pages = self.table_pages(root)?;
        let mut batch = self.batch(vcpu)?;

        let mut flush = false;
        for (level, pfn) in pages {
            flush |= self.pin_page(&mut batch, level, pfn);
        }

        if flush {
            batch.issue(LazyMode::None);
            batch = self.batch(vcpu)?;
            Self::queue_op(&mut batch, MmuExtOp::TlbFlushAll);
        }

        let root_level = Driver::Architecture::pin_level(Driver::Architecture::ROOT_LEVEL);
        Self::queue_op(
            &mut batch,
            MmuExtOp::Pin {
                level: root_level,
                mfn: self.pfn_to_mfn(root),
            },
        );

        if let Some(user_root) = self.user_root_of(root) {
            self.pin_page(&mut batch, Driver::Architecture::ROOT_LEVEL, user_root);
            Self::queue_op(
                &mut batch,
                MmuExtOp::Pin {
                    level: root_level,
                    mfn: self.pfn_to_mfn(user_root),
                },
            );
        }

        batch.issue(LazyMode::None);

        tracing::debug!(%root, "pinned page table");
        Ok(())
    }

    fn pgd_unpin(&self, vcpu: VcpuId, root: Pfn) -> Result<(), MmuError> {
        let pages = self.table_pages(root)?;
        let mut batch = self.batch(vcpu)?;

        Self::queue_op(
            &mut batch,
            MmuExtOp::Unpin {
                mfn: self.pfn_to_mfn(root),
            },
        );

        if let Some(user_root) = self.user_root_of(root) {
            Self::queue_op(
                &mut batch,
                MmuExtOp::Unpin {
                    mfn: self.pfn_to_mfn(user_root),
                },
            );
            self.unpin_page(&mut batch, Driver::Architecture::ROOT_LEVEL, user_root);
        }

        for (level, pfn) in pages {
            self.unpin_page(&mut batch, level, pfn);
        }

        batch.issue(LazyMode::None);

        tracing::debug!(%root, "unpinned page table");
        Ok(())
    }

    /// Pins the page table tree of an address space.
    ///
    /// Every table page below the user limit is remapped read-only, leaf
    /// tables are pinned individually when split locks are in use, and
    /// finally the root (and the attached user root) is pinned, which makes
    /// the hypervisor validate the whole tree.
    pub fn pin_table(&self, vcpu: VcpuId, mm: &AddressSpace) -> Result<(), MmuError> {
        self.pgd_pin(vcpu, mm.root())
    }

    /// Unpins the page table tree of an address space, making every page of
    /// it writable again.
    pub fn unpin_table(&self, vcpu: VcpuId, mm: &AddressSpace) -> Result<(), MmuError> {
        self.pgd_unpin(vcpu, mm.root())
    }

    /// Unpins a table that is being freed, if it is still pinned.
    pub fn late_unpin_pgd(&self, vcpu: VcpuId, mm: &AddressSpace) -> Result<(), MmuError> {
        if self.is_pinned(mm.root()) {
            self.pgd_unpin(vcpu, mm.root())?;
        }

        Ok(())
    }

    /// Loads an address space on a vCPU, pinning it first if needed.
    pub fn activate_mm(&self, vcpu: VcpuId, next: &Arc<AddressSpace>) -> Result<(), MmuError> {
        {
            let _guard = next.lock();
            if !self.is_pinned(next.root()) {
                self.pgd_pin(vcpu, next.root())?;
            }
        }

        self.switch_mm(vcpu, next)
    }

    /// Pins a freshly duplicated address space.
    pub fn dup_mmap(&self, vcpu: VcpuId, mm: &AddressSpace) -> Result<(), MmuError> {
        let _guard = mm.lock();
        if !self.is_pinned(mm.root()) {
            self.pgd_pin(vcpu, mm.root())?;
        }

        Ok(())
    }

    /// Tears down an exiting address space.
    ///
    /// Every vCPU still referencing the tables is switched away first;
    /// then the tables are unpinned so the rest of the teardown can use
    /// plain writes. Tables holding foreign mappings stay pinned.
    pub fn exit_mmap(&self, vcpu: VcpuId, mm: &Arc<AddressSpace>) -> Result<(), MmuError> {
        self.drop_mm_ref(vcpu, mm)?;

        let _guard = mm.lock();
        if self.is_pinned(mm.root()) && !mm.has_foreign_mappings() {
            self.pgd_unpin(vcpu, mm.root())?;
        }

        Ok(())
    }

    /// Hooks a new table page into an address space.
    ///
    /// If the address space is pinned, the page must be pinned before it is
    /// linked in: it is remapped read-only, and pinned on its own if it is a
    /// leaf table and split locks are in use.
    pub fn alloc_ptpage(
        &self,
        vcpu: VcpuId,
        mm: &AddressSpace,
        pfn: Pfn,
        level: Level<Driver>,
    ) -> Result<(), MmuError> {
        self.vcpu(vcpu)?;

        if !self.is_pinned(mm.root()) {
            return Ok(());
        }

        let Some(page) = self.pages.get(pfn) else {
            return Ok(());
        };

        let mut batch = self.batch(vcpu)?;
        page.set(PageFlags::PINNED);

        if self.is_highmem(pfn) {
            // No permanent mapping to protect; drop any temporary ones.
            Self::queue_op(&mut batch, MmuExtOp::TlbFlushAll);
        }
        else {
            batch.entry(self.remap_frame(
                pfn,
                Driver::Architecture::PAGE_KERNEL_RO,
                UvmFlags::empty(),
            ));

            if level == Driver::Architecture::LEAF_LEVEL && self.config.split_ptlocks {
                Self::queue_op(
                    &mut batch,
                    MmuExtOp::Pin {
                        level: Driver::Architecture::pin_level(level),
                        mfn: self.pfn_to_mfn(pfn),
                    },
                );
            }
        }

        batch.issue(LazyMode::Mmu);
        Ok(())
    }

    /// Unhooks a table page, making it writable again.
    ///
    /// The split lock of the page is dropped along with it.
    pub fn release_ptpage(
        &self,
        vcpu: VcpuId,
        pfn: Pfn,
        level: Level<Driver>,
    ) -> Result<(), MmuError> {
        self.vcpu(vcpu)?;

        let Some(page) = self.pages.get(pfn) else {
            return Ok(());
        };

        if level == Driver::Architecture::LEAF_LEVEL {
            self.drop_pte_lock(pfn);
        }

        if !page.contains(PageFlags::PINNED) {
            return Ok(());
        }

        if !self.is_highmem(pfn) {
            let mut batch = self.batch(vcpu)?;

            if level == Driver::Architecture::LEAF_LEVEL && self.config.split_ptlocks {
                Self::queue_op(
                    &mut batch,
                    MmuExtOp::Unpin {
                        mfn: self.pfn_to_mfn(pfn),
                    },
                );
            }

            batch.entry(self.remap_frame(
                pfn,
                Driver::Architecture::PAGE_KERNEL,
                UvmFlags::empty(),
            ));
            batch.issue(LazyMode::Mmu);
        }

        page.clear(PageFlags::PINNED);
        Ok(())
    }

    /// Hooks a new leaf table into an address space.
    pub fn alloc_pte(&self, vcpu: VcpuId, mm: &AddressSpace, pfn: Pfn) -> Result<(), MmuError> {
        self.alloc_ptpage(vcpu, mm, pfn, Driver::Architecture::LEAF_LEVEL)
    }

    /// Hooks a new second level table into an address space.
    pub fn alloc_pmd(&self, vcpu: VcpuId, mm: &AddressSpace, pfn: Pfn) -> Result<(), MmuError> {
        self.alloc_ptpage(vcpu, mm, pfn, Self::pmd_level())
    }

    /// Hooks a new third level table into an address space.
    pub fn alloc_pud(&self, vcpu: VcpuId, mm: &AddressSpace, pfn: Pfn) -> Result<(), MmuError> {
        self.alloc_ptpage(vcpu, mm, pfn, Self::pud_level())
    }

    /// Unhooks a leaf table.
    pub fn release_pte(&self, vcpu: VcpuId, pfn: Pfn) -> Result<(), MmuError> {
        self.release_ptpage(vcpu, pfn, Driver::Architecture::LEAF_LEVEL)
    }

    /// Unhooks a second level table.
    pub fn release_pmd(&self, vcpu: VcpuId, pfn: Pfn) -> Result<(), MmuError> {
        self.release_ptpage(vcpu, pfn, Self::pmd_level())
    }

    /// Unhooks a third level table.
    pub fn release_pud(&self, vcpu: VcpuId, pfn: Pfn) -> Result<(), MmuError> {
        self.release_ptpage(vcpu, pfn, Self::pud_level())
    }

    fn pmd_level() -> Level<Driver> {
        Driver::Architecture::previous_level(Driver::Architecture::LEAF_LEVEL)
            .unwrap_or(Driver::Architecture::ROOT_LEVEL)
    }

    fn pud_level() -> Level<Driver> {
        Driver::Architecture::previous_level(Self::pmd_level())
            .unwrap_or(Driver::Architecture::ROOT_LEVEL)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Save/restore
    ///////////////////////////////////////////////////////////////////////////

    /// Pins every address space that is not pinned yet, so the hypervisor
    /// can rewrite all of them across a save/restore cycle.
    pub fn mm_pin_all(&self, vcpu: VcpuId) -> Result<(), MmuError> {
        for mm in self.address_spaces() {
            if self.is_pinned(mm.root()) {
                continue;
            }

            self.pgd_pin(vcpu, mm.root())?;
            if let Some(page) = self.pages.get(mm.root()) {
                page.set(PageFlags::SAVE_PINNED);
            }
        }

        Ok(())
    }

    /// Unpins every address space pinned by [`mm_pin_all`].
    ///
    /// [`mm_pin_all`]: Self::mm_pin_all
    pub fn mm_unpin_all(&self, vcpu: VcpuId) -> Result<(), MmuError> {
        for mm in self.address_spaces() {
            let Some(page) = self.pages.get(mm.root()) else {
                continue;
            };

            if !page.contains(PageFlags::SAVE_PINNED) {
                continue;
            }

            if !page.contains(PageFlags::PINNED) {
                tracing::error!(root = %mm.root(), "saved table lost its pin");
                return Err(MmuError::Other("saved page table is not pinned"));
            }

            self.pgd_unpin(vcpu, mm.root())?;
            page.clear(PageFlags::SAVE_PINNED);
        }

        Ok(())
    }

    /// Prepares the guest for being saved.
    pub fn suspend(&self, vcpu: VcpuId) -> Result<(), MmuError> {
        self.mm_pin_all(vcpu)
    }

    /// Restores guest paging after a save/restore cycle.
    ///
    /// Machine frames may have changed, so the machine-address tree is
    /// rebuilt and published again before the temporary pins are dropped.
    pub fn resume(&self, vcpu: VcpuId) -> Result<(), MmuError> {
        self.p2m.rebuild_machine_address_shadow();
        self.setup_mfn_list_list()?;
        self.mm_unpin_all(vcpu)
    }
}
