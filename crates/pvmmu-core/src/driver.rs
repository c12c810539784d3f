use crate::{
    Architecture, MappedPage, MemoryExchange, Mfn, MmuError, MmuInfo, MulticallEntry, Pfn, Va,
    VcpuId,
};

/// A trait for implementing a hypervisor driver.
///
/// The driver is the guest's only window onto the hypervisor: it carries the
/// privileged update channel and performs ordinary memory accesses through the
/// guest's own kernel mappings, so read-only protection set up by the MMU
/// layer is enforced on those accesses as well.
pub trait MmuDriver: Send + Sync + 'static {
    /// The architecture supported by the driver.
    type Architecture: Architecture;

    /// Retrieves the start-of-day information about the guest.
    fn info(&self) -> Result<MmuInfo, MmuError>;

    /// Reads the page containing the given kernel virtual address.
    fn read_page(&self, va: Va) -> Result<MappedPage, MmuError>;

    /// Writes a 64-bit value at the given kernel virtual address.
    ///
    /// Fails with [`MmuError::WriteProtected`] if the address is mapped
    /// read-only.
    fn write_u64(&self, va: Va, value: u64) -> Result<(), MmuError>;

    /// Zeroes the page containing the given kernel virtual address.
    fn clear_page(&self, va: Va) -> Result<(), MmuError>;

    /// Looks up the hypervisor's machine-to-physical table.
    ///
    /// Returns [`Pfn::INVALID`] for frames the guest does not own.
    fn machine_to_phys(&self, mfn: Mfn) -> Pfn;

    /// Submits a batch of operations on behalf of a vCPU.
    ///
    /// The batch is executed in order. An error means at least one
    /// operation was rejected.
    fn multicall(&self, vcpu: VcpuId, entries: &[MulticallEntry]) -> Result<(), MmuError>;

    /// Trades machine extents.
    fn memory_exchange(&self, exchange: &mut MemoryExchange<'_>) -> Result<(), MmuError>;

    /// Publishes the root of the machine-address frame tree and the highest
    /// physical frame number it covers.
    fn set_frame_list_list(&self, mfn: Mfn, max_pfn: u64) -> Result<(), MmuError>;
}
