mod contiguous;
mod entry;
mod pin;
mod smp;
mod tlb;

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Sender},
    },
};

use parking_lot::{Mutex, ReentrantMutex};

use self::smp::Request;
use crate::{
    AddressSpace, Architecture, Batch, BumpAllocator, CpuMask, FrameMap, LazyMode, Maddr, Mfn,
    MmuConfig, MmuDriver, MmuError, MmuInfo, MmuStats, Multicall, P2m, PageAllocator, PageFlags,
    PageInfo, PageInfoTable, Pfn, TableEntry as _, Va, VcpuId, walk,
};

pub(crate) type Arch<Driver> = <Driver as MmuDriver>::Architecture;
pub(crate) type Entry<Driver> = <Arch<Driver> as Architecture>::PageTableEntry;
pub(crate) type Level<Driver> = <Arch<Driver> as Architecture>::PageTableLevel;

/// Paging state of one vCPU.
struct VcpuState {
    /// Root the vCPU is logically running on.
    cr3: AtomicU64,

    /// Root the hypervisor has actually been told about. Lags behind `cr3`
    /// while a base pointer switch sits in an unsubmitted batch.
    current_cr3: Arc<AtomicU64>,

    /// Address space whose tables the vCPU may still reference.
    active_mm: Mutex<Option<Arc<AddressSpace>>>,

    /// Switched to the kernel without dropping `active_mm`.
    lazy_tlb: AtomicBool,
}

impl VcpuState {
    fn new(kernel: &Arc<AddressSpace>) -> Self {
        Self {
            cr3: AtomicU64::new(kernel.root().0),
            current_cr3: Arc::new(AtomicU64::new(kernel.root().0)),
            active_mm: Mutex::new(Some(kernel.clone())),
            lazy_tlb: AtomicBool::new(false),
        }
    }
}

/// The paravirtualized MMU of one guest.
///
/// Owns the frame translation table, the per-page pin state, the pending
/// multicalls and the paging state of every vCPU. All guest page table
/// manipulation goes through it.
pub struct Mmu<Driver>
where
    Driver: MmuDriver,
{
    driver: Driver,
    config: MmuConfig,
    info: MmuInfo,
    p2m: P2m,
    multicall: Multicall,
    pages: PageInfoTable,
    ptlocks: Mutex<HashMap<Pfn, Arc<ReentrantMutex<()>>>>,
    vcpus: Box<[VcpuState]>,
    kernel: Arc<AddressSpace>,
    pgd_list: Mutex<Vec<Weak<AddressSpace>>>,
    reservation: Mutex<Vec<u64>>,
    stats: MmuStats,
    early: Arc<BumpAllocator>,
    pool: Arc<dyn PageAllocator>,
    mailboxes: Box<[Sender<Request>]>,
}

impl<Driver> Mmu<Driver>
where
    Driver: MmuDriver,
{
    /// Takes over the paging of a freshly booted guest.
    ///
    /// Grafts the boot frame list into the translation table, publishes the
    /// machine-address tree, records the boot page tables as pinned and
    /// starts one invalidation worker per vCPU. `early` is sealed on
    /// return; later table growth draws from `pool`.
    pub fn new(
        driver: Driver,
        early: Arc<BumpAllocator>,
        pool: Arc<dyn PageAllocator>,
        config: MmuConfig,
    ) -> Result<Arc<Self>, MmuError> {
        let info = driver.info()?;

        // The exchange scratch buffer holds one entry per page of the
        // largest region, which may not exceed guest memory.
        let max_order = info.nr_pages.checked_ilog2().unwrap_or(0);
        if config.max_contig_order > max_order {
            tracing::error!(
                order = config.max_contig_order,
                max = max_order,
                "contiguous region order exceeds guest memory"
            );
            return Err(MmuError::OrderTooLarge {
                order: config.max_contig_order,
                max: max_order,
            });
        }

        let p2m = P2m::new(&info, early.clone(), pool.clone())?;
        p2m.rebuild_machine_address_shadow();

        let kernel = Arc::new(AddressSpace::new(info.kernel_root, None));
        let vcpus = (0..info.vcpus)
            .map(|_| VcpuState::new(&kernel))
            .collect::<Box<[_]>>();

        let (mailboxes, receivers): (Vec<_>, Vec<_>) =
            (0..info.vcpus).map(|_| mpsc::channel()).unzip();

        let scratch = 1usize << config.max_contig_order;

        let mmu = Arc::new(Self {
            multicall: Multicall::new(info.vcpus, &config),
            pages: PageInfoTable::new(info.nr_pages),
            ptlocks: Mutex::new(HashMap::new()),
            vcpus,
            kernel,
            pgd_list: Mutex::new(Vec::new()),
            reservation: Mutex::new(vec![0; scratch]),
            stats: MmuStats::default(),
            early,
            pool,
            mailboxes: mailboxes.into_boxed_slice(),
            driver,
            config,
            info,
            p2m,
        });

        for (index, receiver) in receivers.into_iter().enumerate() {
            smp::spawn_worker(Arc::downgrade(&mmu), VcpuId(index as u16), receiver)?;
        }

        mmu.setup_mfn_list_list()?;
        mmu.mark_init_mm_pinned()?;
        mmu.early.seal();

        tracing::info!(
            nr_pages = mmu.info.nr_pages,
            vcpus = mmu.info.vcpus,
            kernel_root = %mmu.info.kernel_root,
            "mmu initialized"
        );

        Ok(mmu)
    }

    /// Returns the driver.
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Returns the configuration.
    pub fn config(&self) -> &MmuConfig {
        &self.config
    }

    /// Returns the start-of-day information.
    pub fn info(&self) -> &MmuInfo {
        &self.info
    }

    /// Returns the frame translation table.
    pub fn p2m(&self) -> &P2m {
        &self.p2m
    }

    /// Returns the operation counters.
    pub fn stats(&self) -> &MmuStats {
        &self.stats
    }

    /// Returns the pending multicalls.
    pub fn multicall(&self) -> &Multicall {
        &self.multicall
    }

    /// Returns the kernel address space.
    pub fn kernel(&self) -> &Arc<AddressSpace> {
        &self.kernel
    }

    /// Returns the state of a guest page.
    pub fn page_info(&self, pfn: Pfn) -> Option<&PageInfo> {
        self.pages.get(pfn)
    }

    /// Checks if the page is part of a pinned page table.
    pub fn is_pinned(&self, pfn: Pfn) -> bool {
        self.pages.is_pinned(pfn)
    }

    /// Returns the vCPUs the guest has.
    pub fn online(&self) -> CpuMask {
        CpuMask::first(self.vcpus.len())
    }

    /// Opens a batch on `vcpu`.
    pub fn batch(&self, vcpu: VcpuId) -> Result<Batch<'_, Driver>, MmuError> {
        self.multicall.begin(&self.driver, vcpu)
    }

    /// Starts holding back page table updates on `vcpu`.
    pub fn enter_lazy_mmu(&self, vcpu: VcpuId) -> Result<(), MmuError> {
        self.multicall.enter_lazy(vcpu, LazyMode::Mmu)
    }

    /// Submits every page table update held back on `vcpu`.
    pub fn leave_lazy_mmu(&self, vcpu: VcpuId) -> Result<(), MmuError> {
        self.multicall.leave_lazy(&self.driver, vcpu)
    }

    /// Starts holding back base pointer switches and TLB operations on
    /// `vcpu`.
    ///
    /// While the mode lasts, [`current_cr3`] keeps reporting the root the
    /// hypervisor still has loaded.
    ///
    /// [`current_cr3`]: Self::current_cr3
    pub fn enter_lazy_cpu(&self, vcpu: VcpuId) -> Result<(), MmuError> {
        self.multicall.enter_lazy(vcpu, LazyMode::Cpu)
    }

    /// Submits every base pointer switch held back on `vcpu`.
    pub fn leave_lazy_cpu(&self, vcpu: VcpuId) -> Result<(), MmuError> {
        self.multicall.leave_lazy(&self.driver, vcpu)
    }

    /// Returns the machine frame backing `pfn`, or [`Mfn::INVALID`].
    pub fn pfn_to_mfn(&self, pfn: Pfn) -> Mfn {
        self.p2m.lookup(pfn)
    }

    /// Returns the physical frame backed by `mfn`.
    ///
    /// Returns [`Pfn::INVALID`] for machine frames the guest does not own,
    /// including frames whose machine-to-physical entry points at a
    /// physical frame that is now backed by something else.
    pub fn mfn_to_pfn(&self, mfn: Mfn) -> Pfn {
        if self.info.auto_translated {
            return Pfn(mfn.0);
        }

        let pfn = self.driver.machine_to_phys(mfn);
        if !pfn.is_valid() || self.p2m.lookup(pfn) != mfn {
            return Pfn::INVALID;
        }

        pfn
    }

    /// Records that `pfn` is now backed by `mfn`.
    ///
    /// Returns `false` if the translation table could not grow.
    pub fn set_phys_to_machine(&self, pfn: Pfn, mfn: Mfn) -> bool {
        self.p2m.set(pfn, mfn)
    }

    /// Returns the machine frame behind a direct-map address.
    pub fn va_to_mfn(&self, va: Va) -> Mfn {
        self.pfn_to_mfn(Driver::Architecture::va_to_pfn(va))
    }

    /// Returns the machine address behind a direct-map address.
    pub fn va_to_machine(&self, va: Va) -> Maddr {
        let mfn = self.va_to_mfn(va);
        Maddr((mfn.0 << Driver::Architecture::PAGE_SHIFT) + Driver::Architecture::va_offset(va))
    }

    /// Publishes the machine-address tree to the hypervisor.
    pub fn setup_mfn_list_list(&self) -> Result<(), MmuError> {
        if self.info.auto_translated {
            return Ok(());
        }

        self.driver
            .set_frame_list_list(self.p2m.frame_list_list(), self.p2m.max_pfn())
    }

    /// Takes a zeroed page from the page pool.
    pub fn alloc_page(&self) -> Result<Pfn, MmuError> {
        let pfn = self.pool.alloc().ok_or(MmuError::OutOfMemory)?;

        if let Err(err) = self.driver.clear_page(Driver::Architecture::pfn_to_va(pfn)) {
            self.pool.free(pfn);
            return Err(err);
        }

        Ok(pfn)
    }

    /// Returns a page to the page pool.
    pub fn free_page(&self, pfn: Pfn) {
        self.drop_pte_lock(pfn);
        self.pool.free(pfn);
    }

    /// Creates a new process address space.
    ///
    /// The kernel half of the kernel root is shared into the new root, and
    /// an empty user root is attached to it. Neither is pinned until the
    /// address space is first activated.
    pub fn pgd_alloc(&self) -> Result<Arc<AddressSpace>, MmuError> {
        let root = self.alloc_page()?;
        let user_root = match self.alloc_page() {
            Ok(user_root) => user_root,
            Err(err) => {
                self.free_page(root);
                return Err(err);
            }
        };

        let kernel = self
            .driver
            .read_page(Driver::Architecture::pfn_to_va(self.kernel.root()))?;

        let root_va = Driver::Architecture::pfn_to_va(root);
        let first = Driver::Architecture::va_index_for(
            Driver::Architecture::PAGE_OFFSET,
            Driver::Architecture::ROOT_LEVEL,
        ) as usize;

        for index in first..Driver::Architecture::ENTRIES_PER_TABLE {
            let raw = kernel.entry(index);
            if raw != 0 {
                self.driver
                    .write_u64(root_va + (index * size_of::<u64>()) as u64, raw)?;
            }
        }

        if let Some(page) = self.pages.get(root) {
            page.set_private(Some(user_root));
        }

        let mm = Arc::new(AddressSpace::new(root, Some(user_root)));
        self.pgd_list.lock().push(Arc::downgrade(&mm));

        tracing::debug!(%root, %user_root, "address space created");
        Ok(mm)
    }

    /// Destroys an address space created by [`pgd_alloc`].
    ///
    /// The tables must have been unpinned first.
    ///
    /// [`pgd_alloc`]: Self::pgd_alloc
    pub fn pgd_free(&self, mm: &Arc<AddressSpace>) -> Result<(), MmuError> {
        if self.is_pinned(mm.root()) {
            return Err(MmuError::StillPinned);
        }

        self.pgd_list
            .lock()
            .retain(|entry| entry.upgrade().is_some_and(|entry| !Arc::ptr_eq(&entry, mm)));

        if let Some(page) = self.pages.get(mm.root()) {
            page.set_private(None);
        }

        if let Some(user_root) = mm.user_root() {
            self.free_page(user_root);
        }
        self.free_page(mm.root());

        tracing::debug!(root = %mm.root(), "address space destroyed");
        Ok(())
    }

    /// Returns the user root attached to a kernel root.
    pub(crate) fn user_root_of(&self, root: Pfn) -> Option<Pfn> {
        self.pages.get(root).and_then(PageInfo::private)
    }

    /// Returns the split lock of a leaf table page, if split locks are in
    /// use.
    pub fn pte_lock(&self, pfn: Pfn) -> Option<Arc<ReentrantMutex<()>>> {
        if !self.config.split_ptlocks {
            return None;
        }

        let lock = self
            .ptlocks
            .lock()
            .entry(pfn)
            .or_insert_with(|| Arc::new(ReentrantMutex::new(())))
            .clone();

        Some(lock)
    }

    /// Forgets the split lock of a page that no longer holds a table.
    pub(crate) fn drop_pte_lock(&self, pfn: Pfn) {
        self.ptlocks.lock().remove(&pfn);
    }

    /// Checks if the page has no permanent kernel mapping.
    pub(crate) fn is_highmem(&self, pfn: Pfn) -> bool {
        self.config.is_highmem(pfn)
    }

    /// Builds a kernel mapping of a physical frame, in machine form.
    pub(crate) fn pfn_pte(&self, pfn: Pfn, prot: u64) -> Entry<Driver> {
        self.make_pte(Entry::<Driver>::from_parts(pfn.0, prot))
    }

    /// Records the boot page tables as pinned. The hypervisor pinned them
    /// before the guest started.
    fn mark_init_mm_pinned(&self) -> Result<(), MmuError> {
        walk(
            &self.driver,
            self,
            self.kernel.root(),
            Driver::Architecture::FIXADDR_TOP,
            &mut |_: Level<Driver>, pfn: Pfn| -> Result<bool, MmuError> {
                if let Some(page) = self.pages.get(pfn) {
                    page.set(PageFlags::PINNED);
                }
                Ok(false)
            },
        )?;

        Ok(())
    }

    fn vcpu(&self, vcpu: VcpuId) -> Result<&VcpuState, MmuError> {
        self.vcpus.get(vcpu.index()).ok_or(MmuError::OutOfBounds)
    }

    /// Iterates over every live process address space.
    fn address_spaces(&self) -> Vec<Arc<AddressSpace>> {
        let mut list = self.pgd_list.lock();
        list.retain(|entry| entry.strong_count() > 0);
        list.iter().filter_map(Weak::upgrade).collect()
    }

    fn current_root(&self, vcpu: VcpuId) -> Option<Pfn> {
        self.vcpus
            .get(vcpu.index())
            .map(|state| Pfn(state.cr3.load(Ordering::Acquire)))
    }
}

impl<Driver> FrameMap for Mmu<Driver>
where
    Driver: MmuDriver,
{
    fn pfn_to_mfn(&self, pfn: Pfn) -> Mfn {
        Mmu::pfn_to_mfn(self, pfn)
    }

    fn mfn_to_pfn(&self, mfn: Mfn) -> Pfn {
        Mmu::mfn_to_pfn(self, mfn)
    }
}
