//! Page table entry construction and updates.
//!
//! Entries handed to the `set_*` functions are in machine form, i.e. built
//! with one of the `make_*` functions. A write into a table that is not
//! pinned is a plain memory write; a write into a pinned table goes through
//! the hypervisor as a checked update, batched on the calling vCPU.

use std::{slice, sync::Arc};

use parking_lot::ReentrantMutex;
use smallvec::SmallVec;

use super::{Entry, Mmu};
use crate::{
    AddressSpace, Architecture as _, Batch, DomId, LazyMode, Maddr, Mfn, MmuDriver, MmuError,
    MmuExtOp, MmuStats, MmuUpdate, MulticallEntry, Pfn, TableEntry as _, UvmFlags, Va, VcpuId,
    stats::LevelStats, translate,
};

impl<Driver> Mmu<Driver>
where
    Driver: MmuDriver,
{
    /// Converts a leaf entry naming a physical frame into machine form.
    ///
    /// Entries flagged as I/O mappings already name a machine frame and are
    /// kept as is, except that only the initial domain may map the legacy
    /// ISA range that way.
    pub fn make_pte(&self, entry: Entry<Driver>) -> Entry<Driver> {
        let addr = entry.frame() << Driver::Architecture::PAGE_SHIFT;

        if entry.iomap() && (self.info.initial_domain || addr >= Driver::Architecture::ISA_END) {
            return translate::iomap(entry);
        }

        let entry = Entry::<Driver>::from_raw(entry.raw() & !Driver::Architecture::PAGE_IOMAP);
        translate::logical_to_frame(self, entry)
    }

    /// Converts a leaf entry read from a table back into physical form.
    pub fn pte_val(&self, entry: Entry<Driver>) -> Entry<Driver> {
        if self.info.initial_domain && entry.iomap() {
            return entry;
        }

        translate::frame_to_logical(self, entry)
    }

    /// Converts a second level entry into machine form.
    pub fn make_pmd(&self, entry: Entry<Driver>) -> Entry<Driver> {
        translate::logical_to_frame(self, entry)
    }

    /// Converts a second level entry into physical form.
    pub fn pmd_val(&self, entry: Entry<Driver>) -> Entry<Driver> {
        translate::frame_to_logical(self, entry)
    }

    /// Converts a third level entry into machine form.
    pub fn make_pud(&self, entry: Entry<Driver>) -> Entry<Driver> {
        translate::logical_to_frame(self, entry)
    }

    /// Converts a third level entry into physical form.
    pub fn pud_val(&self, entry: Entry<Driver>) -> Entry<Driver> {
        translate::frame_to_logical(self, entry)
    }

    /// Converts a root entry into machine form.
    pub fn make_pgd(&self, entry: Entry<Driver>) -> Entry<Driver> {
        translate::logical_to_frame(self, entry)
    }

    /// Converts a root entry into physical form.
    pub fn pgd_val(&self, entry: Entry<Driver>) -> Entry<Driver> {
        translate::frame_to_logical(self, entry)
    }

    /// Reads the raw entry at a direct-map address.
    pub fn read_entry(&self, slot: Va) -> Result<Entry<Driver>, MmuError> {
        let page = self
            .driver
            .read_page(Va(slot.0 & Driver::Architecture::PAGE_MASK))?;

        let index = Driver::Architecture::va_offset(slot) as usize / size_of::<u64>();
        Ok(Entry::<Driver>::from_raw(page.entry(index)))
    }

    /// Writes a leaf entry.
    ///
    /// Updates are also routed through the hypervisor while the vCPU is in
    /// lazy MMU mode, so they stay ordered with the rest of the batch. The
    /// split lock of the table is held for the duration of the write.
    pub fn set_pte(&self, vcpu: VcpuId, slot: Va, entry: Entry<Driver>) -> Result<(), MmuError> {
        let batch = self.batch(vcpu)?;
        let lock = self.leaf_lock(slot);
        let _guard = lock.as_ref().map(|lock| lock.lock());

        let lazy = self.multicall.lazy_mode(vcpu) == LazyMode::Mmu;
        self.set_entry(batch, slot, entry, &self.stats.pte, lazy)
    }

    /// Writes a second level entry.
    pub fn set_pmd(&self, vcpu: VcpuId, slot: Va, entry: Entry<Driver>) -> Result<(), MmuError> {
        self.set_entry(self.batch(vcpu)?, slot, entry, &self.stats.pmd, false)
    }

    /// Writes a third level entry.
    pub fn set_pud(&self, vcpu: VcpuId, slot: Va, entry: Entry<Driver>) -> Result<(), MmuError> {
        self.set_entry(self.batch(vcpu)?, slot, entry, &self.stats.pud, false)
    }

    /// Writes a root entry.
    ///
    /// Entries in the user half are mirrored into the user root attached to
    /// the table, if any.
    pub fn set_pgd(&self, vcpu: VcpuId, slot: Va, entry: Entry<Driver>) -> Result<(), MmuError> {
        self.vcpu(vcpu)?;

        let user_slot = self.user_slot(slot);
        let pinned = self.is_pinned(Driver::Architecture::va_to_pfn(slot));
        let lazy = self.multicall.lazy_mode(vcpu) == LazyMode::Mmu;

        if !pinned {
            MmuStats::level_update(&self.stats.pgd, false, false);
            self.driver.write_u64(slot, entry.raw())?;

            if let Some(user_slot) = user_slot {
                if self.is_pinned(Driver::Architecture::va_to_pfn(user_slot)) {
                    tracing::warn!(%slot, %user_slot, "user root pinned under an unpinned root");
                }

                self.driver.write_u64(user_slot, entry.raw())?;
            }

            return Ok(());
        }

        MmuStats::level_update(&self.stats.pgd, true, lazy);

        let mut batch = self.batch(vcpu)?;
        self.extend_mmu_update(&mut batch, MmuUpdate::normal(self.va_to_machine(slot), entry.raw()));
        if let Some(user_slot) = user_slot {
            self.extend_mmu_update(
                &mut batch,
                MmuUpdate::normal(self.va_to_machine(user_slot), entry.raw()),
            );
        }
        batch.issue(LazyMode::Mmu);

        Ok(())
    }

    /// Installs a leaf entry mapping `va` in `mm`.
    ///
    /// Mappings in the running or the kernel address space are installed
    /// by virtual address, letting the hypervisor locate the entry.
    pub fn set_pte_at(
        &self,
        vcpu: VcpuId,
        mm: &AddressSpace,
        va: Va,
        slot: Va,
        entry: Entry<Driver>,
    ) -> Result<(), MmuError> {
        let mut batch = self.batch(vcpu)?;
        let lock = self.leaf_lock(slot);
        let _guard = lock.as_ref().map(|lock| lock.lock());

        let current = self.current_root(vcpu) == Some(mm.root());
        let kernel = mm.root() == self.kernel.root();
        let lazy = self.multicall.lazy_mode(vcpu) == LazyMode::Mmu;
        let pinned = self.is_pinned(Driver::Architecture::va_to_pfn(slot));

        self.stats
            .set_pte_at(current, kernel, (current || kernel) && lazy, pinned);

        if current || kernel {
            let update = MulticallEntry::UpdateVaMapping {
                va,
                val: entry.raw(),
                flags: UvmFlags::empty(),
            };

            if lazy {
                batch.entry(update);
                batch.issue(LazyMode::Mmu);
                return Ok(());
            }

            match self.hypercall(vcpu, update) {
                Ok(()) => {
                    batch.release();
                    return Ok(());
                }
                Err(err) => tracing::debug!(%va, %err, "mapping by address failed, writing entry"),
            }
        }

        self.set_entry(batch, slot, entry, &self.stats.pte, lazy)
    }

    /// Starts a protection change of a leaf entry.
    ///
    /// The accessed and dirty bits are preserved by the matching
    /// [`ptep_modify_prot_commit`], so the entry is returned as is.
    ///
    /// [`ptep_modify_prot_commit`]: Self::ptep_modify_prot_commit
    pub fn ptep_modify_prot_start(&self, slot: Va) -> Result<Entry<Driver>, MmuError> {
        self.read_entry(slot)
    }

    /// Commits a protection change of a leaf entry, keeping the accessed
    /// and dirty bits the hardware set in the meantime.
    pub fn ptep_modify_prot_commit(
        &self,
        vcpu: VcpuId,
        slot: Va,
        entry: Entry<Driver>,
    ) -> Result<(), MmuError> {
        let mut batch = self.batch(vcpu)?;
        let lock = self.leaf_lock(slot);
        let _guard = lock.as_ref().map(|lock| lock.lock());

        let lazy = self.multicall.lazy_mode(vcpu) == LazyMode::Mmu;
        self.stats.prot_commit(lazy);

        self.extend_mmu_update(
            &mut batch,
            MmuUpdate::preserve_ad(self.va_to_machine(slot), entry.raw()),
        );
        batch.issue(LazyMode::Mmu);
        Ok(())
    }

    /// Writes a leaf entry naming a frame owned by `domid`.
    pub fn set_domain_pte(
        &self,
        vcpu: VcpuId,
        slot: Va,
        entry: Entry<Driver>,
        domid: DomId,
    ) -> Result<(), MmuError> {
        let mut batch = self.batch(vcpu)?;
        let lock = self.leaf_lock(slot);
        let _guard = lock.as_ref().map(|lock| lock.lock());

        batch.entry(MulticallEntry::mmu_update(
            MmuUpdate::normal(self.va_to_machine(slot), entry.raw()),
            domid,
        ));
        batch.issue(LazyMode::Mmu);
        Ok(())
    }

    /// Finds the direct-map address of the leaf entry mapping `va` in the
    /// tree rooted at `root`.
    pub fn lookup_slot(&self, root: Pfn, va: Va) -> Result<Va, MmuError> {
        let mut table = root;
        let mut level = Driver::Architecture::ROOT_LEVEL;

        loop {
            let index = Driver::Architecture::va_index_for(va, level);
            let slot = Driver::Architecture::pfn_to_va(table) + index * size_of::<u64>() as u64;

            let Some(next_level) = Driver::Architecture::next_level(level) else {
                return Ok(slot);
            };

            let entry = self.read_entry(slot)?;
            if !entry.present() || entry.large() {
                return Err(MmuError::TableNotPresent(va));
            }

            table = self.mfn_to_pfn(Mfn(entry.frame()));
            if !table.is_valid() {
                return Err(MmuError::TableNotPresent(va));
            }

            level = next_level;
        }
    }

    /// Returns the machine address of the leaf entry mapping `va` in `mm`.
    pub fn create_lookup_pte_addr(&self, mm: &AddressSpace, va: Va) -> Result<Maddr, MmuError> {
        Ok(self.va_to_machine(self.lookup_slot(mm.root(), va)?))
    }

    /// Maps a machine frame at a kernel address and drops the stale
    /// translation.
    pub fn set_pte_mfn(&self, vcpu: VcpuId, va: Va, mfn: Mfn, prot: u64) -> Result<(), MmuError> {
        let slot = self.lookup_slot(self.kernel.root(), va)?;
        self.set_pte(vcpu, slot, Entry::<Driver>::from_parts(mfn.0, prot))?;
        self.flush_tlb_single(vcpu, va)
    }

    /// Maps `nr` consecutive machine frames of another domain at `va` in
    /// `mm`.
    ///
    /// The entries are written `remap_batch` at a time, each chunk in its
    /// own hypercall. The address space is marked as holding foreign
    /// mappings, and every TLB is flushed afterwards, even on failure.
    #[expect(clippy::too_many_arguments)]
    pub fn remap_domain_mfn_range(
        &self,
        vcpu: VcpuId,
        mm: &AddressSpace,
        va: Va,
        mfn: Mfn,
        nr: u64,
        prot: u64,
        domid: DomId,
    ) -> Result<(), MmuError> {
        self.vcpu(vcpu)?;
        mm.set_foreign_mappings();

        let prot = prot | Driver::Architecture::PAGE_IOMAP | Driver::Architecture::PAGE_SPECIAL;
        let result = self.remap_chunks(vcpu, mm, va, mfn, nr, prot, domid);

        let flushed = self.flush_tlb_all(vcpu);
        result.and(flushed)
    }

    #[expect(clippy::too_many_arguments)]
    fn remap_chunks(
        &self,
        vcpu: VcpuId,
        mm: &AddressSpace,
        va: Va,
        mfn: Mfn,
        nr: u64,
        prot: u64,
        domid: DomId,
    ) -> Result<(), MmuError> {
        let chunk = self.config.remap_batch.max(1) as u64;

        let mut done = 0;
        while done < nr {
            let count = chunk.min(nr - done);

            let updates = (done..done + count)
                .map(|index| {
                    let addr = va + (index << Driver::Architecture::PAGE_SHIFT);
                    let slot = self.lookup_slot(mm.root(), addr)?;
                    let entry = Entry::<Driver>::from_parts(mfn.0 + index, prot);
                    Ok(MmuUpdate::normal(self.va_to_machine(slot), entry.raw()))
                })
                .collect::<Result<SmallVec<_>, MmuError>>()?;

            self.hypercall(vcpu, MulticallEntry::MmuUpdate { updates, domid })?;
            done += count;
        }

        tracing::debug!(%va, %mfn, nr, %domid, "mapped foreign frames");
        Ok(())
    }

    /// Returns the user root slot mirroring a kernel root slot, if the slot
    /// is in the user half and the root has a user root attached.
    fn user_slot(&self, slot: Va) -> Option<Va> {
        let offset = Driver::Architecture::va_offset(slot);
        let index = offset / size_of::<u64>() as u64;
        let user_limit = Driver::Architecture::va_index_for(
            Driver::Architecture::USER_LIMIT,
            Driver::Architecture::ROOT_LEVEL,
        );

        if index >= user_limit {
            return None;
        }

        self.user_root_of(Driver::Architecture::va_to_pfn(slot))
            .map(|user_root| Driver::Architecture::pfn_to_va(user_root) + offset)
    }

    /// Returns the split lock of the leaf table holding `slot`.
    fn leaf_lock(&self, slot: Va) -> Option<Arc<ReentrantMutex<()>>> {
        self.pte_lock(Driver::Architecture::va_to_pfn(slot))
    }

    /// Writes an entry through `batch`, or directly if the table is not
    /// pinned and nothing is held back. Split locks are taken by the
    /// caller, after opening the batch.
    fn set_entry(
        &self,
        mut batch: Batch<'_, Driver>,
        slot: Va,
        entry: Entry<Driver>,
        stats: &LevelStats,
        lazy: bool,
    ) -> Result<(), MmuError> {
        let pinned = self.is_pinned(Driver::Architecture::va_to_pfn(slot));

        if !pinned && !lazy {
            MmuStats::level_update(stats, false, false);
            let result = self.driver.write_u64(slot, entry.raw());
            batch.release();
            return result;
        }

        MmuStats::level_update(stats, pinned, lazy);

        self.extend_mmu_update(&mut batch, MmuUpdate::normal(self.va_to_machine(slot), entry.raw()));
        batch.issue(LazyMode::Mmu);

        Ok(())
    }

    pub(crate) fn extend_mmu_update(&self, batch: &mut Batch<'_, Driver>, update: MmuUpdate) {
        let count = batch.extend_mmu_update(update);
        self.stats.mmu_update(count);
    }

    /// Submits a single operation right away, bypassing any pending batch.
    ///
    /// Unlike batched operations, a rejection is reported to the caller.
    pub(crate) fn hypercall(&self, vcpu: VcpuId, entry: MulticallEntry) -> Result<(), MmuError> {
        self.driver.multicall(vcpu, slice::from_ref(&entry))
    }

    /// Queues an extended operation on a batch.
    pub(crate) fn queue_op(batch: &mut Batch<'_, Driver>, op: MmuExtOp) {
        batch.entry(MulticallEntry::MmuExtOp(op));
    }

    /// Returns the kernel mapping of a frame with the given protection,
    /// for use with [`MulticallEntry::UpdateVaMapping`].
    pub(crate) fn remap_frame(&self, pfn: Pfn, prot: u64, flags: UvmFlags) -> MulticallEntry {
        MulticallEntry::UpdateVaMapping {
            va: Driver::Architecture::pfn_to_va(pfn),
            val: self.pfn_pte(pfn, prot).raw(),
            flags,
        }
    }
}
