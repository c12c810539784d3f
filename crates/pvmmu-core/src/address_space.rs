use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::{CpuMask, Pfn, VcpuId};

/// A process address space: a root page table plus the state needed to pin
/// it and retire it safely.
#[derive(Debug)]
pub struct AddressSpace {
    root: Pfn,
    user_root: Option<Pfn>,
    page_table_lock: ReentrantMutex<()>,
    cpumask: AtomicU64,
    foreign: AtomicBool,
}

impl AddressSpace {
    /// Creates an address space for an existing root table.
    pub fn new(root: Pfn, user_root: Option<Pfn>) -> Self {
        Self {
            root,
            user_root,
            page_table_lock: ReentrantMutex::new(()),
            cpumask: AtomicU64::new(0),
            foreign: AtomicBool::new(false),
        }
    }

    /// Returns the kernel root table.
    pub fn root(&self) -> Pfn {
        self.root
    }

    /// Returns the user root table.
    pub fn user_root(&self) -> Option<Pfn> {
        self.user_root
    }

    /// Acquires the page table lock.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.page_table_lock.lock()
    }

    /// Returns the vCPUs that have this address space loaded.
    pub fn cpumask(&self) -> CpuMask {
        CpuMask(self.cpumask.load(Ordering::Acquire))
    }

    pub(crate) fn mark_cpu(&self, vcpu: VcpuId) {
        let mut mask = CpuMask::empty();
        mask.insert(vcpu);
        self.cpumask.fetch_or(mask.0, Ordering::AcqRel);
    }

    pub(crate) fn clear_cpu(&self, vcpu: VcpuId) {
        let mut mask = CpuMask::empty();
        mask.insert(vcpu);
        self.cpumask.fetch_and(!mask.0, Ordering::AcqRel);
    }

    /// Checks if frames of another domain have been mapped into the
    /// address space.
    ///
    /// Such tables cannot be unpinned before every foreign mapping has been
    /// torn down.
    pub fn has_foreign_mappings(&self) -> bool {
        self.foreign.load(Ordering::Acquire)
    }

    pub(crate) fn set_foreign_mappings(&self) {
        self.foreign.store(true, Ordering::Release);
    }
}
