//! In-memory hypervisor driver for the paravirtualized MMU.
//!
//! The simulated host owns machine memory, the machine-to-physical table,
//! the pin state of every table and the base pointers of every vCPU. It
//! enforces the rule a real hypervisor enforces on paravirtualized guests:
//! a frame used as a page table by a pinned or loaded table must not be
//! writable through any such table. Guest memory is accessed through the
//! guest's own direct map, so write protection applies to the guest as
//! well.

mod builder;
mod error;
mod machine;
mod validation;

use parking_lot::Mutex;
use pvmmu_arch_amd64::Amd64;
use pvmmu_core::{
    Architecture as _, MappedPage, MemoryExchange, Mfn, MmuDriver, MmuError, MmuInfo,
    MulticallEntry, Pfn, PinLevel, Va, VcpuId,
};

pub use self::{
    builder::{SimBuilder, SimGuest},
    error::Error,
    machine::{ExchangeFault, SimCounters},
};
use self::machine::Machine;

/// In-memory hypervisor driver.
pub struct SimDriver {
    machine: Mutex<Machine>,
}

impl SimDriver {
    fn new(machine: Machine) -> Self {
        Self {
            machine: Mutex::new(machine),
        }
    }

    /// Returns a builder for a simulated guest of `nr_pages` pages.
    pub fn builder(nr_pages: u64) -> SimBuilder {
        SimBuilder::new(nr_pages)
    }

    /// Checks if the machine frame is pinned.
    pub fn is_pinned(&self, mfn: Mfn) -> bool {
        self.machine.lock().pinned.contains_key(&mfn)
    }

    /// Returns the type a machine frame is pinned as.
    pub fn pin_level(&self, mfn: Mfn) -> Option<PinLevel> {
        self.machine.lock().pinned.get(&mfn).copied()
    }

    /// Returns every pinned frame, in pin order.
    pub fn pinned(&self) -> Vec<(Mfn, PinLevel)> {
        self.machine
            .lock()
            .pinned
            .iter()
            .map(|(&mfn, &level)| (mfn, level))
            .collect()
    }

    /// Returns the raw direct-map entry of a guest frame.
    pub fn direct_map_entry(&self, pfn: Pfn) -> Result<u64, MmuError> {
        Ok(self.machine.lock().kernel_entry(Amd64::pfn_to_va(pfn))?)
    }

    /// Returns the kernel base pointer loaded on a vCPU.
    pub fn baseptr(&self, vcpu: VcpuId) -> Option<Mfn> {
        self.machine.lock().baseptr.get(vcpu.index()).copied().flatten()
    }

    /// Returns the user base pointer loaded on a vCPU.
    pub fn user_baseptr(&self, vcpu: VcpuId) -> Option<Mfn> {
        self.machine
            .lock()
            .user_baseptr
            .get(vcpu.index())
            .copied()
            .flatten()
    }

    /// Returns the work counters.
    pub fn counters(&self) -> SimCounters {
        self.machine.lock().counters
    }

    /// Takes the log of recent multicalls, oldest first.
    pub fn take_log(&self) -> Vec<(VcpuId, Vec<MulticallEntry>)> {
        self.machine.lock().log.drain(..).collect()
    }

    /// Returns the published machine-address tree root and frame count.
    pub fn frame_list_list(&self) -> Option<(Mfn, u64)> {
        self.machine.lock().frame_list_list
    }

    /// Returns a copy of a machine frame.
    pub fn read_machine(&self, mfn: Mfn) -> Vec<u64> {
        let machine = self.machine.lock();
        (0..Amd64::ENTRIES_PER_TABLE)
            .map(|index| machine.entry(mfn, index))
            .collect()
    }

    /// Returns the number of free machine frames.
    pub fn free_frames(&self) -> usize {
        self.machine.lock().free.len()
    }

    /// Rejects the next multicall as a whole.
    pub fn fail_next_multicall(&self) {
        self.machine.lock().fail_next_multicall = true;
    }

    /// Makes the next memory exchange misbehave.
    pub fn inject_exchange_fault(&self, fault: ExchangeFault) {
        self.machine.lock().exchange_fault = Some(fault);
    }
}

impl MmuDriver for SimDriver {
    type Architecture = Amd64;

    fn info(&self) -> Result<MmuInfo, MmuError> {
        Ok(self.machine.lock().info.clone())
    }

    fn read_page(&self, va: Va) -> Result<MappedPage, MmuError> {
        Ok(MappedPage::new(self.machine.lock().read_page(va)?))
    }

    fn write_u64(&self, va: Va, value: u64) -> Result<(), MmuError> {
        Ok(self.machine.lock().write_u64(va, value)?)
    }

    fn clear_page(&self, va: Va) -> Result<(), MmuError> {
        Ok(self.machine.lock().clear_page(va)?)
    }

    fn machine_to_phys(&self, mfn: Mfn) -> Pfn {
        self.machine
            .lock()
            .m2p
            .get(&mfn)
            .copied()
            .unwrap_or(Pfn::INVALID)
    }

    fn multicall(&self, vcpu: VcpuId, entries: &[MulticallEntry]) -> Result<(), MmuError> {
        let result = self.machine.lock().multicall(vcpu, entries);

        match &result {
            Ok(()) => tracing::trace!(%vcpu, entries = entries.len(), "multicall executed"),
            Err(err) => tracing::warn!(%vcpu, %err, "multicall rejected"),
        }

        Ok(result?)
    }

    fn memory_exchange(&self, exchange: &mut MemoryExchange<'_>) -> Result<(), MmuError> {
        Ok(self.machine.lock().memory_exchange(exchange)?)
    }

    fn set_frame_list_list(&self, mfn: Mfn, max_pfn: u64) -> Result<(), MmuError> {
        self.machine.lock().frame_list_list = Some((mfn, max_pfn));
        Ok(())
    }
}
