use std::collections::{BTreeSet, HashMap, VecDeque};

use indexmap::IndexMap;
use pvmmu_arch_amd64::{Amd64, EntryFlags, PageTableEntry, PageTableLevel};
use pvmmu_core::{
    Architecture as _, DomId, Maddr, MemoryExchange, Mfn, MmuExtOp, MmuInfo, MmuUpdate,
    MmuUpdateKind, MulticallEntry, Pfn, PinLevel, TableEntry as _, UvmFlags, Va, VcpuId,
};
use zerocopy::IntoBytes as _;

use crate::{Error, validation};

/// Number of multicalls kept in the log.
const LOG_LIMIT: usize = 1024;

const ENTRIES: usize = Amd64::ENTRIES_PER_TABLE;

/// Counters of the work the simulated hypervisor has done.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimCounters {
    /// Multicalls received.
    pub multicalls: u64,

    /// Operations received in multicalls.
    pub entries: u64,

    /// Checked entry writes applied.
    pub mmu_updates: u64,

    /// Virtual mapping updates applied.
    pub va_updates: u64,

    /// Tables pinned.
    pub pins: u64,

    /// Tables unpinned.
    pub unpins: u64,

    /// Base pointer switches.
    pub baseptr_switches: u64,

    /// Full TLB flushes.
    pub tlb_flushes: u64,

    /// Single page invalidations.
    pub invlpgs: u64,

    /// Memory exchanges requested.
    pub exchanges: u64,

    /// Plain guest writes.
    pub guest_writes: u64,
}

/// How the next memory exchange misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeFault {
    /// Refuse the exchange without trading anything.
    Refuse,

    /// Report success after trading only part of the input.
    Partial,
}

/// Machine state of the simulated host.
pub(crate) struct Machine {
    pub(crate) info: MmuInfo,
    pub(crate) kernel_root: Mfn,
    pub(crate) frames: HashMap<Mfn, Box<[u64]>>,
    pub(crate) m2p: HashMap<Mfn, Pfn>,
    pub(crate) free: BTreeSet<Mfn>,
    pub(crate) pinned: IndexMap<Mfn, PinLevel>,
    pub(crate) baseptr: Vec<Option<Mfn>>,
    pub(crate) user_baseptr: Vec<Option<Mfn>>,
    pub(crate) highmem_start: Option<Pfn>,
    pub(crate) frame_list_list: Option<(Mfn, u64)>,
    pub(crate) counters: SimCounters,
    pub(crate) log: VecDeque<(VcpuId, Vec<MulticallEntry>)>,
    pub(crate) fail_next_multicall: bool,
    pub(crate) exchange_fault: Option<ExchangeFault>,
}

impl Machine {
    pub(crate) fn new(info: MmuInfo, kernel_root: Mfn, highmem_start: Option<Pfn>) -> Self {
        let vcpus = usize::from(info.vcpus);

        Self {
            info,
            kernel_root,
            frames: HashMap::new(),
            m2p: HashMap::new(),
            free: BTreeSet::new(),
            pinned: IndexMap::new(),
            baseptr: vec![Some(kernel_root); vcpus],
            user_baseptr: vec![None; vcpus],
            highmem_start,
            frame_list_list: None,
            counters: SimCounters::default(),
            log: VecDeque::new(),
            fail_next_multicall: false,
            exchange_fault: None,
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Machine memory
    ///////////////////////////////////////////////////////////////////////////

    pub(crate) fn entry(&self, mfn: Mfn, index: usize) -> u64 {
        self.frames
            .get(&mfn)
            .and_then(|frame| frame.get(index))
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn set_entry(&mut self, mfn: Mfn, index: usize, value: u64) {
        let frame = self
            .frames
            .entry(mfn)
            .or_insert_with(|| vec![0; ENTRIES].into_boxed_slice());

        if let Some(slot) = frame.get_mut(index) {
            *slot = value;
        }
    }

    pub(crate) fn is_highmem(&self, mfn: Mfn) -> bool {
        match (self.highmem_start, self.m2p.get(&mfn)) {
            (Some(start), Some(&pfn)) => pfn >= start,
            _ => false,
        }
    }

    /// Finds the leaf entry mapping `va` in the tree rooted at `root`.
    fn leaf_slot(&self, root: Mfn, va: Va) -> Option<(Mfn, usize)> {
        let mut table = root;
        let mut level = PageTableLevel::Pml4;

        loop {
            let index = Amd64::va_index_for(va, level) as usize;
            let Some(next) = level.next() else {
                return Some((table, index));
            };

            let entry = PageTableEntry(self.entry(table, index));
            if !entry.present() || entry.large() {
                return None;
            }

            table = Mfn(entry.frame());
            level = next;
        }
    }

    /// Resolves a kernel address to the machine frame behind it and whether
    /// it may be written.
    fn translate(&self, va: Va) -> Result<(Mfn, bool), Error> {
        let (table, index) = self
            .leaf_slot(self.kernel_root, va)
            .ok_or(Error::PageNotPresent(va))?;

        let entry = PageTableEntry(self.entry(table, index));
        if !entry.present() {
            return Err(Error::PageNotPresent(va));
        }

        Ok((Mfn(entry.frame()), entry.writable()))
    }

    /// Returns the raw leaf entry mapping `va` in the kernel tables.
    pub(crate) fn kernel_entry(&self, va: Va) -> Result<u64, Error> {
        let (table, index) = self
            .leaf_slot(self.kernel_root, va)
            .ok_or(Error::TableNotPresent(va))?;

        Ok(self.entry(table, index))
    }

    ///////////////////////////////////////////////////////////////////////////
    // Guest accesses
    ///////////////////////////////////////////////////////////////////////////

    pub(crate) fn read_page(&self, va: Va) -> Result<Vec<u8>, Error> {
        let (mfn, _) = self.translate(va)?;

        Ok(match self.frames.get(&mfn) {
            Some(frame) => frame.as_bytes().to_vec(),
            None => vec![0; Amd64::PAGE_SIZE as usize],
        })
    }

    pub(crate) fn write_u64(&mut self, va: Va, value: u64) -> Result<(), Error> {
        let (mfn, writable) = self.translate(va)?;
        if !writable {
            return Err(Error::WriteProtected(va));
        }

        let index = Amd64::va_offset(va) as usize / size_of::<u64>();
        self.set_entry(mfn, index, value);
        self.counters.guest_writes += 1;
        Ok(())
    }

    pub(crate) fn clear_page(&mut self, va: Va) -> Result<(), Error> {
        let (mfn, writable) = self.translate(va)?;
        if !writable {
            return Err(Error::WriteProtected(va));
        }

        self.frames.remove(&mfn);
        self.counters.guest_writes += 1;
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////////
    // Multicalls
    ///////////////////////////////////////////////////////////////////////////

    /// Executes a multicall.
    ///
    /// Operations run in order. Execution stops at the first rejected
    /// operation; the operations before it stay applied.
    pub(crate) fn multicall(&mut self, vcpu: VcpuId, entries: &[MulticallEntry]) -> Result<(), Error> {
        if vcpu.index() >= self.baseptr.len() {
            return Err(Error::InvalidVcpu(vcpu));
        }

        self.counters.multicalls += 1;
        self.counters.entries += entries.len() as u64;

        if self.log.len() >= LOG_LIMIT {
            self.log.pop_front();
        }
        self.log.push_back((vcpu, entries.to_vec()));

        if std::mem::take(&mut self.fail_next_multicall) {
            return Err(Error::Injected);
        }

        for entry in entries {
            self.execute(vcpu, entry)?;
        }

        Ok(())
    }

    fn execute(&mut self, vcpu: VcpuId, entry: &MulticallEntry) -> Result<(), Error> {
        match entry {
            MulticallEntry::MmuUpdate { updates, domid } => {
                for update in updates {
                    self.mmu_update(update, *domid)?;
                }
                Ok(())
            }
            MulticallEntry::MmuExtOp(op) => self.ext_op(vcpu, op),
            MulticallEntry::UpdateVaMapping { va, val, flags } => {
                self.update_va_mapping(vcpu, *va, *val, *flags)
            }
        }
    }

    /// Applies a checked write of one entry, reverting it if it breaks a
    /// validated table.
    fn checked_write(&mut self, table: Mfn, index: usize, value: u64) -> Result<(), Error> {
        let old = self.entry(table, index);
        self.set_entry(table, index, value);

        if let Err(err) = validation::check(self) {
            self.set_entry(table, index, old);
            return Err(err);
        }

        Ok(())
    }

    fn mmu_update(&mut self, update: &MmuUpdate, domid: DomId) -> Result<(), Error> {
        let table = Mfn(update.ptr.0 >> Amd64::PAGE_SHIFT);
        if !self.m2p.contains_key(&table) {
            return Err(Error::NotOwned(update.ptr));
        }

        let index = (update.ptr.0 & !Amd64::PAGE_MASK) as usize / size_of::<u64>();
        let value = match update.kind {
            MmuUpdateKind::Normal => update.val,
            MmuUpdateKind::PreserveAd => {
                let ad = EntryFlags::ACCESSED | EntryFlags::DIRTY;
                update.val | (self.entry(table, index) & ad.bits())
            }
        };

        self.checked_write(table, index, value)?;

        if domid != DomId::SELF {
            tracing::trace!(%domid, ptr = %update.ptr, "foreign frame mapped");
        }

        self.counters.mmu_updates += 1;
        Ok(())
    }

    fn update_va_mapping(
        &mut self,
        vcpu: VcpuId,
        va: Va,
        value: u64,
        flags: UvmFlags,
    ) -> Result<(), Error> {
        let root = self.baseptr[vcpu.index()].unwrap_or(self.kernel_root);
        let (table, index) = self.leaf_slot(root, va).ok_or(Error::TableNotPresent(va))?;

        self.checked_write(table, index, value)?;

        if flags.contains(UvmFlags::TLB_FLUSH) {
            self.counters.tlb_flushes += 1;
        }
        if flags.contains(UvmFlags::INVLPG) {
            self.counters.invlpgs += 1;
        }

        self.counters.va_updates += 1;
        Ok(())
    }

    fn ext_op(&mut self, vcpu: VcpuId, op: &MmuExtOp) -> Result<(), Error> {
        match *op {
            MmuExtOp::Pin { level, mfn } => {
                if self.pinned.contains_key(&mfn) {
                    return Err(Error::AlreadyPinned(mfn));
                }

                if !self.m2p.contains_key(&mfn) {
                    return Err(Error::NotOwned(Maddr(mfn.0 << Amd64::PAGE_SHIFT)));
                }

                self.pinned.insert(mfn, level);
                if let Err(err) = validation::check(self) {
                    self.pinned.shift_remove(&mfn);
                    return Err(err);
                }

                self.counters.pins += 1;
            }
            MmuExtOp::Unpin { mfn } => {
                if self.pinned.shift_remove(&mfn).is_none() {
                    return Err(Error::NotPinned(mfn));
                }

                self.counters.unpins += 1;
            }
            MmuExtOp::NewBaseptr { mfn } => {
                self.require_root(mfn)?;
                self.baseptr[vcpu.index()] = Some(mfn);
                self.counters.baseptr_switches += 1;
            }
            MmuExtOp::NewUserBaseptr { mfn } => {
                if let Some(mfn) = mfn {
                    self.require_root(mfn)?;
                }
                self.user_baseptr[vcpu.index()] = mfn;
            }
            MmuExtOp::TlbFlushLocal
            | MmuExtOp::TlbFlushMulti { .. }
            | MmuExtOp::TlbFlushAll => {
                self.counters.tlb_flushes += 1;
            }
            MmuExtOp::InvlpgLocal { .. }
            | MmuExtOp::InvlpgMulti { .. }
            | MmuExtOp::InvlpgAll { .. } => {
                self.counters.invlpgs += 1;
            }
        }

        Ok(())
    }

    fn require_root(&self, mfn: Mfn) -> Result<(), Error> {
        match self.pinned.get(&mfn) {
            Some(PinLevel::L4) => Ok(()),
            _ => Err(Error::NotPinned(mfn)),
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Memory exchange
    ///////////////////////////////////////////////////////////////////////////

    pub(crate) fn memory_exchange(&mut self, exchange: &mut MemoryExchange<'_>) -> Result<(), Error> {
        exchange.nr_exchanged = 0;
        self.counters.exchanges += 1;

        match self.exchange_fault.take() {
            Some(ExchangeFault::Refuse) => return Err(Error::Injected),
            Some(ExchangeFault::Partial) => {
                exchange.nr_exchanged = (exchange.input.len() as u64).saturating_sub(1);
                return Ok(());
            }
            None => {}
        }

        if exchange.domid != DomId::SELF {
            return Err(Error::InvalidExchange("foreign domain"));
        }

        let in_size = 1u64 << exchange.input_order;
        let out_size = 1u64 << exchange.output_order;

        if exchange.input.len() as u64 * in_size != exchange.output.len() as u64 * out_size {
            return Err(Error::InvalidExchange("input and output sizes differ"));
        }

        let inputs = exchange
            .input
            .iter()
            .flat_map(|&first| (0..in_size).map(move |offset| Mfn(first + offset)))
            .collect::<Vec<_>>();

        let mapped = validation::analyze(self).mapped;
        for mfn in &inputs {
            if !self.m2p.contains_key(mfn) {
                return Err(Error::InvalidExchange("input frame not owned"));
            }

            if mapped.contains(mfn) {
                return Err(Error::InvalidExchange("input frame still mapped"));
            }
        }

        let mut extents = Vec::with_capacity(exchange.output.len());
        for _ in 0..exchange.output.len() {
            match self.take_extent(out_size, exchange.address_bits) {
                Some(first) => extents.push(first),
                None => {
                    for first in extents {
                        self.free.extend((0..out_size).map(|offset| first + offset));
                    }
                    return Err(Error::OutOfMemory);
                }
            }
        }

        for mfn in inputs {
            self.m2p.remove(&mfn);
            self.frames.remove(&mfn);
            self.free.insert(mfn);
        }

        for (slot, first) in exchange.output.iter_mut().zip(extents) {
            for offset in 0..out_size {
                self.m2p.insert(first + offset, Pfn(*slot + offset));
                self.frames.remove(&(first + offset));
            }
            *slot = first.0;
        }

        exchange.nr_exchanged = exchange.input.len() as u64;

        tracing::debug!(
            input = exchange.input.len(),
            input_order = exchange.input_order,
            output = exchange.output.len(),
            output_order = exchange.output_order,
            address_bits = exchange.address_bits,
            "memory exchanged"
        );

        Ok(())
    }

    /// Takes `size` free, aligned, consecutive machine frames that fit in
    /// `address_bits`.
    fn take_extent(&mut self, size: u64, address_bits: u32) -> Option<Mfn> {
        let limit = match address_bits {
            0 => u64::MAX,
            bits if bits <= Amd64::PAGE_SHIFT as u32 => 0,
            bits if bits >= 64 => u64::MAX,
            bits => 1u64 << (u64::from(bits) - Amd64::PAGE_SHIFT),
        };

        let first = self
            .free
            .iter()
            .copied()
            .take_while(|mfn| mfn.0.saturating_add(size) <= limit)
            .find(|mfn| {
                mfn.0 % size == 0
                    && (1..size).all(|offset| self.free.contains(&(*mfn + offset)))
            })?;

        for offset in 0..size {
            self.free.remove(&(first + offset));
        }

        Some(first)
    }
}
