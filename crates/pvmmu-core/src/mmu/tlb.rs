//! Base pointer switching and TLB maintenance.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use super::Mmu;
use crate::{
    AddressSpace, Architecture as _, CpuMask, LazyMode, MmuDriver, MmuError, MmuExtOp, Pfn, Va,
    VcpuId,
};

impl<Driver> Mmu<Driver>
where
    Driver: MmuDriver,
{
    /// Switches `vcpu` to the page table rooted at `root`.
    ///
    /// The user root attached to `root` is loaded as well, or cleared if
    /// there is none. The switch is batched; [`current_cr3`] reports the new
    /// root only once the hypervisor has applied it.
    ///
    /// [`current_cr3`]: Self::current_cr3
    pub fn write_cr3(&self, vcpu: VcpuId, root: Pfn) -> Result<(), MmuError> {
        let state = self.vcpu(vcpu)?;
        let mut batch = self.batch(vcpu)?;
        state.cr3.store(root.0, Ordering::Release);

        Self::queue_op(
            &mut batch,
            MmuExtOp::NewBaseptr {
                mfn: self.pfn_to_mfn(root),
            },
        );

        let current: Arc<AtomicU64> = state.current_cr3.clone();
        batch.callback(move || current.store(root.0, Ordering::Release));

        Self::queue_op(
            &mut batch,
            MmuExtOp::NewUserBaseptr {
                mfn: self.user_root_of(root).map(|user_root| self.pfn_to_mfn(user_root)),
            },
        );

        batch.issue(LazyMode::Cpu);

        tracing::trace!(%vcpu, %root, "cr3 written");
        Ok(())
    }

    /// Returns the root `vcpu` is logically running on.
    pub fn read_cr3(&self, vcpu: VcpuId) -> Result<Pfn, MmuError> {
        Ok(Pfn(self.vcpu(vcpu)?.cr3.load(Ordering::Acquire)))
    }

    /// Returns the root the hypervisor has loaded on `vcpu`.
    pub fn current_cr3(&self, vcpu: VcpuId) -> Result<Pfn, MmuError> {
        Ok(Pfn(self.vcpu(vcpu)?.current_cr3.load(Ordering::Acquire)))
    }

    /// Returns the address space whose tables `vcpu` may still reference.
    pub fn active_mm(&self, vcpu: VcpuId) -> Result<Option<Arc<AddressSpace>>, MmuError> {
        Ok(self.vcpu(vcpu)?.active_mm.lock().clone())
    }

    /// Flushes the TLB of `vcpu`.
    pub fn flush_tlb(&self, vcpu: VcpuId) -> Result<(), MmuError> {
        let mut batch = self.batch(vcpu)?;
        Self::queue_op(&mut batch, MmuExtOp::TlbFlushLocal);
        batch.issue(LazyMode::Mmu);
        Ok(())
    }

    /// Drops the translation of a single page from the TLB of `vcpu`.
    pub fn flush_tlb_single(&self, vcpu: VcpuId, va: Va) -> Result<(), MmuError> {
        let mut batch = self.batch(vcpu)?;
        Self::queue_op(
            &mut batch,
            MmuExtOp::InvlpgLocal {
                va: va & Driver::Architecture::PAGE_MASK,
            },
        );
        batch.issue(LazyMode::Mmu);
        Ok(())
    }

    /// Flushes the TLBs of other vCPUs.
    ///
    /// Flushes the whole TLB if `va` is `None`, otherwise only the
    /// translation of that page. `vcpu` itself and offline vCPUs are
    /// removed from `cpus`; nothing is queued if no target is left.
    pub fn flush_tlb_others(
        &self,
        vcpu: VcpuId,
        cpus: CpuMask,
        va: Option<Va>,
    ) -> Result<(), MmuError> {
        self.vcpu(vcpu)?;

        let mut cpus = cpus.intersection(self.online());
        cpus.remove(vcpu);

        if cpus.is_empty() {
            return Ok(());
        }

        let op = match va {
            Some(va) => MmuExtOp::InvlpgMulti {
                va: va & Driver::Architecture::PAGE_MASK,
                cpus,
            },
            None => MmuExtOp::TlbFlushMulti { cpus },
        };

        let mut batch = self.batch(vcpu)?;
        Self::queue_op(&mut batch, op);
        batch.issue(LazyMode::Mmu);
        Ok(())
    }

    /// Flushes every TLB right away.
    pub fn flush_tlb_all(&self, vcpu: VcpuId) -> Result<(), MmuError> {
        let mut batch = self.batch(vcpu)?;
        Self::queue_op(&mut batch, MmuExtOp::TlbFlushAll);
        batch.issue(LazyMode::None);
        Ok(())
    }

    /// Switches `vcpu` to the address space `next`.
    pub fn switch_mm(&self, vcpu: VcpuId, next: &Arc<AddressSpace>) -> Result<(), MmuError> {
        let state = self.vcpu(vcpu)?;

        next.mark_cpu(vcpu);
        *state.active_mm.lock() = Some(next.clone());
        state.lazy_tlb.store(false, Ordering::Release);

        self.write_cr3(vcpu, next.root())
    }

    /// Lets `vcpu` run kernel code on the tables of the previous address
    /// space without switching away from it.
    pub fn enter_lazy_tlb(&self, vcpu: VcpuId) -> Result<(), MmuError> {
        self.vcpu(vcpu)?.lazy_tlb.store(true, Ordering::Release);
        Ok(())
    }

    /// Moves `vcpu` off its active address space and onto the kernel
    /// tables.
    pub fn leave_mm(&self, vcpu: VcpuId) -> Result<(), MmuError> {
        let state = self.vcpu(vcpu)?;

        self.write_cr3(vcpu, self.kernel.root())?;

        let previous = state.active_mm.lock().replace(self.kernel.clone());
        if let Some(previous) = previous {
            previous.clear_cpu(vcpu);
        }

        state.lazy_tlb.store(false, Ordering::Release);
        Ok(())
    }
}
