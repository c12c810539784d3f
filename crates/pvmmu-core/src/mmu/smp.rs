//! Cross-vCPU invalidation of page table references.
//!
//! Before the tables of an exiting address space can be unpinned, no vCPU
//! may have them loaded, neither as its active address space nor as a base
//! pointer still held by the hypervisor. Every vCPU has a worker thread
//! that answers invalidation requests on its behalf.

use std::{
    sync::{
        Arc, Weak,
        atomic::Ordering,
        mpsc::{self, Receiver, Sender},
    },
    thread,
};

use super::Mmu;
use crate::{AddressSpace, MmuDriver, MmuError, Pfn, VcpuId};

/// A request delivered to the worker of a vCPU.
pub(super) enum Request {
    /// Stop referencing the tables rooted at `root`, then acknowledge.
    Invalidate { root: Pfn, ack: Sender<()> },
}

/// Starts the invalidation worker of `vcpu`.
///
/// The worker exits once the MMU is dropped.
pub(super) fn spawn_worker<Driver>(
    mmu: Weak<Mmu<Driver>>,
    vcpu: VcpuId,
    receiver: Receiver<Request>,
) -> Result<(), MmuError>
where
    Driver: MmuDriver,
{
    thread::Builder::new()
        .name(format!("pvmmu-vcpu{}", vcpu.0))
        .spawn(move || {
            while let Ok(request) = receiver.recv() {
                let Some(mmu) = mmu.upgrade() else {
                    break;
                };

                match request {
                    Request::Invalidate { root, ack } => {
                        if let Err(err) = mmu.drop_other_mm_ref(vcpu, root) {
                            tracing::warn!(%vcpu, %root, %err, "failed to drop table reference");
                        }

                        let _ = ack.send(());
                    }
                }
            }

            tracing::trace!(%vcpu, "invalidation worker stopped");
        })?;

    Ok(())
}

impl<Driver> Mmu<Driver>
where
    Driver: MmuDriver,
{
    /// Makes every vCPU stop referencing the tables of `mm`.
    ///
    /// The calling vCPU switches away locally. Every other vCPU that has
    /// `mm` loaded, or whose hypervisor base pointer still names its root,
    /// is asked to do the same, and the call returns once all of them have
    /// answered.
    pub fn drop_mm_ref(&self, vcpu: VcpuId, mm: &Arc<AddressSpace>) -> Result<(), MmuError> {
        let root = mm.root();

        if self.active_root(vcpu)? == Some(root) {
            if self.read_cr3(vcpu)? == root {
                self.write_cr3(vcpu, self.kernel.root())?;
            }
            else {
                self.leave_mm(vcpu)?;
            }
        }

        let mut mask = mm.cpumask();
        for (index, state) in self.vcpus.iter().enumerate() {
            if state.current_cr3.load(Ordering::Acquire) == root.0 {
                mask.insert(VcpuId(index as u16));
            }
        }

        mask.remove(vcpu);
        let mask = mask.intersection(self.online());

        if mask.is_empty() {
            return Ok(());
        }

        tracing::debug!(%vcpu, %root, ?mask, "dropping remote table references");

        let (ack, acks) = mpsc::channel();
        let mut pending = 0;

        for target in mask.iter() {
            let Some(mailbox) = self.mailboxes.get(target.index()) else {
                continue;
            };

            let request = Request::Invalidate {
                root,
                ack: ack.clone(),
            };

            match mailbox.send(request) {
                Ok(()) => pending += 1,
                Err(_) => tracing::warn!(%target, "invalidation worker is gone"),
            }
        }

        drop(ack);

        for _ in 0..pending {
            if acks.recv().is_err() {
                break;
            }
        }

        Ok(())
    }

    /// Drops the references `vcpu` holds on the tables rooted at `root`.
    pub(crate) fn drop_other_mm_ref(&self, vcpu: VcpuId, root: Pfn) -> Result<(), MmuError> {
        let state = self.vcpu(vcpu)?;

        if state.lazy_tlb.load(Ordering::Acquire) && self.active_root(vcpu)? == Some(root) {
            self.leave_mm(vcpu)?;
        }

        if state.current_cr3.load(Ordering::Acquire) == root.0 {
            self.write_cr3(vcpu, self.kernel.root())?;
        }

        // The requester waits on us; nothing may stay held back.
        self.batch(vcpu)?.flush();

        Ok(())
    }

    fn active_root(&self, vcpu: VcpuId) -> Result<Option<Pfn>, MmuError> {
        Ok(self
            .vcpu(vcpu)?
            .active_mm
            .lock()
            .as_ref()
            .map(|mm| mm.root()))
    }
}
