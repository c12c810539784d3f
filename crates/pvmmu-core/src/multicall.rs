//! Batching of privileged operations.
//!
//! Each vCPU owns one pending multicall. A [`Batch`] is an exclusive,
//! reentrant handle on it: opening a batch on a vCPU blocks every other
//! thread from queueing on that vCPU until the handle is dropped, while the
//! owning thread may open nested batches that append to the same multicall.
//!
//! The multicall is submitted when it runs out of room, when
//! [`Batch::flush`] is called, or when the outermost handle is dropped
//! outside of a matching lazy mode. Callbacks registered with
//! [`Batch::callback`] run right after the multicall they were queued with
//! has been accepted by the hypervisor, in registration order.

use std::{cell::RefCell, mem};

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::{
    DomId, MmuConfig, MmuDriver, MmuError, MmuUpdate, MMU_UPDATE_SIZE, MulticallEntry, VcpuId,
};

/// Deferred work run after a multicall has been submitted.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Deferred-flush mode of a vCPU.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LazyMode {
    /// Every batch is submitted when its handle is dropped.
    #[default]
    None,

    /// Page table updates are held back until the mode is left.
    Mmu,

    /// Base pointer and TLB operations are held back until the mode is
    /// left.
    Cpu,
}

#[derive(Default)]
struct CpuBatch {
    entries: Vec<MulticallEntry>,
    args: usize,
    callbacks: Vec<Callback>,
    depth: usize,
    lazy: LazyMode,
    submitted: u64,
}

/// Limits of one multicall.
#[derive(Debug, Clone, Copy)]
struct Limits {
    entries: usize,
    args: usize,
    callbacks: usize,
}

/// The pending multicalls of every vCPU.
pub struct Multicall {
    cpus: Box<[ReentrantMutex<RefCell<CpuBatch>>]>,
    limits: Limits,
}

impl Multicall {
    /// Creates an empty multicall for each of `vcpus` vCPUs.
    pub fn new(vcpus: u16, config: &MmuConfig) -> Self {
        Self {
            cpus: (0..vcpus)
                .map(|_| ReentrantMutex::new(RefCell::new(CpuBatch::default())))
                .collect(),
            limits: Limits {
                entries: config.batch_entries.max(1),
                args: config.batch_args,
                callbacks: config.batch_callbacks.max(1),
            },
        }
    }

    fn cpu(&self, vcpu: VcpuId) -> Result<&ReentrantMutex<RefCell<CpuBatch>>, MmuError> {
        self.cpus.get(vcpu.index()).ok_or(MmuError::OutOfBounds)
    }

    /// Opens a batch on `vcpu`.
    ///
    /// Blocks while another thread holds a batch on the same vCPU. Fails
    /// with [`MmuError::OutOfBounds`] if the guest has no such vCPU.
    pub fn begin<'a, Driver>(
        &'a self,
        driver: &'a Driver,
        vcpu: VcpuId,
    ) -> Result<Batch<'a, Driver>, MmuError>
    where
        Driver: MmuDriver,
    {
        let guard = self.cpu(vcpu)?.lock();
        guard.borrow_mut().depth += 1;

        Ok(Batch {
            driver,
            vcpu,
            guard,
            limits: self.limits,
            mode: LazyMode::None,
        })
    }

    /// Enters a lazy mode on `vcpu`.
    ///
    /// Batches issued with the same mode stay queued until
    /// [`leave_lazy`](Self::leave_lazy).
    pub fn enter_lazy(&self, vcpu: VcpuId, mode: LazyMode) -> Result<(), MmuError> {
        let guard = self.cpu(vcpu)?.lock();
        let mut cpu = guard.borrow_mut();
        debug_assert_eq!(cpu.lazy, LazyMode::None, "nested lazy mode");
        cpu.lazy = mode;
        Ok(())
    }

    /// Leaves the lazy mode of `vcpu` and submits everything held back.
    pub fn leave_lazy<Driver>(&self, driver: &Driver, vcpu: VcpuId) -> Result<(), MmuError>
    where
        Driver: MmuDriver,
    {
        let batch = self.begin(driver, vcpu)?;
        batch.guard.borrow_mut().lazy = LazyMode::None;
        batch.flush();
        Ok(())
    }

    /// Returns the lazy mode of `vcpu`.
    pub fn lazy_mode(&self, vcpu: VcpuId) -> LazyMode {
        self.cpu(vcpu)
            .map(|cpu| cpu.lock().borrow().lazy)
            .unwrap_or_default()
    }

    /// Returns the number of operations queued on `vcpu`.
    pub fn pending(&self, vcpu: VcpuId) -> usize {
        self.cpu(vcpu)
            .map(|cpu| cpu.lock().borrow().entries.len())
            .unwrap_or_default()
    }

    /// Returns the number of multicalls submitted on behalf of `vcpu`.
    pub fn submitted(&self, vcpu: VcpuId) -> u64 {
        self.cpu(vcpu)
            .map(|cpu| cpu.lock().borrow().submitted)
            .unwrap_or_default()
    }
}

/// An open batch on one vCPU.
///
/// Dropping the outermost batch submits the pending multicall unless the
/// batch was [issued](Self::issue) in the vCPU's current lazy mode.
pub struct Batch<'a, Driver>
where
    Driver: MmuDriver,
{
    driver: &'a Driver,
    vcpu: VcpuId,
    guard: ReentrantMutexGuard<'a, RefCell<CpuBatch>>,
    limits: Limits,
    mode: LazyMode,
}

impl<Driver> Batch<'_, Driver>
where
    Driver: MmuDriver,
{
    /// Returns the vCPU the batch belongs to.
    pub fn vcpu(&self) -> VcpuId {
        self.vcpu
    }

    /// Returns the number of queued operations.
    pub fn len(&self) -> usize {
        self.guard.borrow().entries.len()
    }

    /// Checks if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues an operation, submitting the pending multicall first if the
    /// operation would not fit.
    pub fn entry(&mut self, entry: MulticallEntry) {
        let size = entry.args_size();

        let full = {
            let cpu = self.guard.borrow();
            cpu.entries.len() >= self.limits.entries || cpu.args + size > self.limits.args
        };

        if full {
            self.flush();
        }

        let mut cpu = self.guard.borrow_mut();
        cpu.args += size;
        cpu.entries.push(entry);
    }

    /// Queues a checked entry write, merging it into the last operation if
    /// that one is a write for the calling domain with room left.
    ///
    /// Returns the number of updates in the operation the write ended up
    /// in.
    pub fn extend_mmu_update(&mut self, update: MmuUpdate) -> usize {
        {
            let mut cpu = self.guard.borrow_mut();
            let fits = cpu.args + MMU_UPDATE_SIZE <= self.limits.args;

            if fits
                && let Some(MulticallEntry::MmuUpdate { updates, domid }) = cpu.entries.last_mut()
                && *domid == DomId::SELF
            {
                updates.push(update);
                let count = updates.len();
                cpu.args += MMU_UPDATE_SIZE;
                return count;
            }
        }

        self.entry(MulticallEntry::mmu_update(update, DomId::SELF));
        1
    }

    /// Registers work to run once the pending multicall has been submitted.
    pub fn callback(&mut self, callback: impl FnOnce() + Send + 'static) {
        let full = self.guard.borrow().callbacks.len() >= self.limits.callbacks;
        if full {
            self.flush();
        }

        self.guard.borrow_mut().callbacks.push(Box::new(callback));
    }

    /// Submits the pending multicall and runs its callbacks.
    ///
    /// # Panics
    ///
    /// Panics if the hypervisor rejects the multicall. Page tables may be
    /// in an unknown state at that point.
    pub fn flush(&self) {
        let (entries, callbacks) = {
            let mut cpu = self.guard.borrow_mut();
            cpu.args = 0;
            (
                mem::take(&mut cpu.entries),
                mem::take(&mut cpu.callbacks),
            )
        };

        if !entries.is_empty() {
            tracing::trace!(vcpu = %self.vcpu, entries = entries.len(), "submitting multicall");

            if let Err(err) = self.driver.multicall(self.vcpu, &entries) {
                tracing::error!(vcpu = %self.vcpu, ?entries, %err, "multicall rejected");
                panic!("multicall rejected on vcpu {}: {err}", self.vcpu);
            }

            self.guard.borrow_mut().submitted += 1;
        }

        for callback in callbacks {
            callback();
        }
    }

    /// Closes the batch, leaving it queued if `mode` is the vCPU's current
    /// lazy mode.
    pub fn issue(mut self, mode: LazyMode) {
        self.mode = mode;
    }

    /// Closes the batch without forcing out anything the vCPU's lazy mode
    /// holds back.
    pub fn release(mut self) {
        self.mode = self.guard.borrow().lazy;
    }
}

impl<Driver> Drop for Batch<'_, Driver>
where
    Driver: MmuDriver,
{
    fn drop(&mut self) {
        let (outermost, deferred) = {
            let mut cpu = self.guard.borrow_mut();
            cpu.depth -= 1;
            (
                cpu.depth == 0,
                self.mode != LazyMode::None && cpu.lazy == self.mode,
            )
        };

        if outermost && !deferred && !std::thread::panicking() {
            self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        Architecture, MappedPage, Maddr, MemoryExchange, Mfn, MmuError, MmuExtOp, MmuInfo, Pfn,
        PinLevel, TableEntry, Va,
    };

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Entry(u64);

    impl TableEntry for Entry {
        const FRAME_MASK: u64 = 0x000f_ffff_ffff_f000;
        const FRAME_SHIFT: u64 = 12;

        fn from_raw(raw: u64) -> Self {
            Self(raw)
        }

        fn raw(self) -> u64 {
            self.0
        }

        fn present(self) -> bool {
            self.0 & 1 != 0
        }

        fn writable(self) -> bool {
            self.0 & 2 != 0
        }

        fn large(self) -> bool {
            false
        }

        fn iomap(self) -> bool {
            false
        }
    }

    struct Flat;

    impl Architecture for Flat {
        const PAGE_SIZE: u64 = 0x1000;
        const PAGE_SHIFT: u64 = 12;
        const PAGE_MASK: u64 = !0xfff;
        const ENTRIES_PER_TABLE: usize = 512;
        const USER_LIMIT: Va = Va(0x8000_0000_0000);
        const PAGE_OFFSET: Va = Va(0xffff_8800_0000_0000);
        const FIXADDR_TOP: Va = Va(0xffff_ffff_ff5f_f000);
        const ISA_END: u64 = 0x10_0000;
        const PAGE_KERNEL: u64 = 3;
        const PAGE_KERNEL_RO: u64 = 1;
        const PAGE_TABLE: u64 = 3;
        const PAGE_IOMAP: u64 = 0;
        const PAGE_SPECIAL: u64 = 0;

        type PageTableLevel = u8;
        type PageTableEntry = Entry;

        const ROOT_LEVEL: u8 = 0;
        const LEAF_LEVEL: u8 = 0;

        fn next_level(_: u8) -> Option<u8> {
            None
        }

        fn previous_level(_: u8) -> Option<u8> {
            None
        }

        fn pin_level(_: u8) -> PinLevel {
            PinLevel::L1
        }

        fn va_index_for(va: Va, _: u8) -> u64 {
            (va.0 >> 12) & 0x1ff
        }
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Vec<MulticallEntry>>>,
    }

    impl MmuDriver for Recorder {
        type Architecture = Flat;

        fn info(&self) -> Result<MmuInfo, MmuError> {
            Err(MmuError::NotSupported)
        }

        fn read_page(&self, _: Va) -> Result<MappedPage, MmuError> {
            Err(MmuError::NotSupported)
        }

        fn write_u64(&self, _: Va, _: u64) -> Result<(), MmuError> {
            Err(MmuError::NotSupported)
        }

        fn clear_page(&self, _: Va) -> Result<(), MmuError> {
            Err(MmuError::NotSupported)
        }

        fn machine_to_phys(&self, _: Mfn) -> Pfn {
            Pfn::INVALID
        }

        fn multicall(&self, _: VcpuId, entries: &[MulticallEntry]) -> Result<(), MmuError> {
            if entries
                .iter()
                .any(|entry| matches!(entry, MulticallEntry::MmuExtOp(MmuExtOp::Unpin { .. })))
            {
                return Err(MmuError::Other("rejected"));
            }

            self.calls.lock().push(entries.to_vec());
            Ok(())
        }

        fn memory_exchange(&self, _: &mut MemoryExchange<'_>) -> Result<(), MmuError> {
            Err(MmuError::NotSupported)
        }

        fn set_frame_list_list(&self, _: Mfn, _: u64) -> Result<(), MmuError> {
            Ok(())
        }
    }

    const VCPU: VcpuId = VcpuId(0);

    fn flush_op() -> MulticallEntry {
        MulticallEntry::MmuExtOp(MmuExtOp::TlbFlushLocal)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Capacity
    ///////////////////////////////////////////////////////////////////////////

    #[test]
    fn overflow_flushes_exactly_once() {
        let driver = Recorder::default();
        let multicall = Multicall::new(1, &MmuConfig::default());

        let mut batch = multicall.begin(&driver, VCPU).unwrap();
        for _ in 0..MmuConfig::default().batch_entries + 1 {
            batch.entry(MulticallEntry::UpdateVaMapping {
                va: Va(0x1000),
                val: 0,
                flags: Default::default(),
            });
        }

        assert_eq!(multicall.submitted(VCPU), 1);
        assert_eq!(batch.len(), 1);
        assert_eq!(driver.calls.lock()[0].len(), 32);

        drop(batch);
        assert_eq!(multicall.submitted(VCPU), 2);
    }

    #[test]
    fn argument_space_limits_the_batch() {
        let driver = Recorder::default();
        let config = MmuConfig::default().with_batch_args(3 * 24);
        let multicall = Multicall::new(1, &config);

        let mut batch = multicall.begin(&driver, VCPU).unwrap();
        for _ in 0..4 {
            batch.entry(flush_op());
        }

        assert_eq!(multicall.submitted(VCPU), 1);
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn updates_for_self_are_merged() {
        let driver = Recorder::default();
        let multicall = Multicall::new(1, &MmuConfig::default());

        let mut batch = multicall.begin(&driver, VCPU).unwrap();
        assert_eq!(batch.extend_mmu_update(MmuUpdate::normal(Maddr(0x1000), 1)), 1);
        assert_eq!(batch.extend_mmu_update(MmuUpdate::normal(Maddr(0x1008), 2)), 2);
        batch.entry(flush_op());
        assert_eq!(batch.extend_mmu_update(MmuUpdate::normal(Maddr(0x1010), 3)), 1);
        assert_eq!(batch.len(), 3);

        batch.entry(MulticallEntry::mmu_update(
            MmuUpdate::normal(Maddr(0x2000), 4),
            DomId(3),
        ));
        assert_eq!(batch.extend_mmu_update(MmuUpdate::normal(Maddr(0x1018), 5)), 1);
        assert_eq!(batch.len(), 5);
    }

    ///////////////////////////////////////////////////////////////////////////
    // Nesting and lazy mode
    ///////////////////////////////////////////////////////////////////////////

    #[test]
    fn nested_batches_flush_once_at_the_outermost_drop() {
        let driver = Recorder::default();
        let multicall = Multicall::new(1, &MmuConfig::default());

        let mut outer = multicall.begin(&driver, VCPU).unwrap();
        outer.entry(flush_op());
        {
            let mut inner = multicall.begin(&driver, VCPU).unwrap();
            inner.entry(flush_op());
        }

        assert_eq!(multicall.submitted(VCPU), 0);
        drop(outer);

        assert_eq!(multicall.submitted(VCPU), 1);
        assert_eq!(driver.calls.lock()[0].len(), 2);
    }

    #[test]
    fn lazy_mode_defers_until_left() {
        let driver = Recorder::default();
        let multicall = Multicall::new(1, &MmuConfig::default());

        multicall.enter_lazy(VCPU, LazyMode::Mmu).unwrap();
        for _ in 0..3 {
            let mut batch = multicall.begin(&driver, VCPU).unwrap();
            batch.entry(flush_op());
            batch.issue(LazyMode::Mmu);
        }

        assert_eq!(multicall.pending(VCPU), 3);

        // A different mode is not held back.
        let mut batch = multicall.begin(&driver, VCPU).unwrap();
        batch.entry(flush_op());
        batch.issue(LazyMode::Cpu);
        assert_eq!(multicall.pending(VCPU), 0);
        assert_eq!(multicall.submitted(VCPU), 1);

        let mut batch = multicall.begin(&driver, VCPU).unwrap();
        batch.entry(flush_op());
        batch.issue(LazyMode::Mmu);
        multicall.leave_lazy(&driver, VCPU).unwrap();

        assert_eq!(multicall.lazy_mode(VCPU), LazyMode::None);
        assert_eq!(multicall.submitted(VCPU), 2);
    }

    #[test]
    fn unknown_vcpu_gets_no_batch() {
        let driver = Recorder::default();
        let multicall = Multicall::new(2, &MmuConfig::default());

        assert!(matches!(
            multicall.begin(&driver, VcpuId(7)),
            Err(MmuError::OutOfBounds)
        ));
        assert!(multicall.enter_lazy(VcpuId(2), LazyMode::Mmu).is_err());
        assert!(multicall.leave_lazy(&driver, VcpuId(2)).is_err());

        // The last vCPU is left alone.
        assert_eq!(multicall.lazy_mode(VcpuId(1)), LazyMode::None);
        assert_eq!(multicall.pending(VcpuId(7)), 0);
        assert!(driver.calls.lock().is_empty());
    }

    ///////////////////////////////////////////////////////////////////////////
    // Callbacks
    ///////////////////////////////////////////////////////////////////////////

    #[test]
    fn callbacks_run_after_submission_in_order() {
        let driver = Arc::new(Recorder::default());
        let multicall = Multicall::new(1, &MmuConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut batch = multicall.begin(&*driver, VCPU).unwrap();
        batch.entry(flush_op());
        for index in 0..3 {
            let order = order.clone();
            let driver = driver.clone();
            batch.callback(move || order.lock().push((index, driver.calls.lock().len())));
        }

        assert!(order.lock().is_empty());
        drop(batch);

        assert_eq!(*order.lock(), vec![(0, 1), (1, 1), (2, 1)]);
    }

    #[test]
    fn callback_overflow_flushes() {
        let driver = Recorder::default();
        let multicall = Multicall::new(1, &MmuConfig::default().with_batch_callbacks(2));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut batch = multicall.begin(&driver, VCPU).unwrap();
        for _ in 0..3 {
            let runs = runs.clone();
            batch.callback(move || {
                runs.fetch_add(1, Ordering::Relaxed);
            });
        }

        assert_eq!(runs.load(Ordering::Relaxed), 2);
        drop(batch);
        assert_eq!(runs.load(Ordering::Relaxed), 3);
    }

    #[test]
    #[should_panic(expected = "multicall rejected")]
    fn rejection_is_fatal() {
        let driver = Recorder::default();
        let multicall = Multicall::new(1, &MmuConfig::default());

        let mut batch = multicall.begin(&driver, VCPU).unwrap();
        batch.entry(MulticallEntry::MmuExtOp(MmuExtOp::Unpin { mfn: Mfn(1) }));
        batch.flush();
    }
}
