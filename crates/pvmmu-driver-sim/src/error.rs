use pvmmu_core::{Maddr, Mfn, MmuError, Va, VcpuId};

/// Error type for the simulated hypervisor.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The address is not mapped.
    #[error("page not present ({0})")]
    PageNotPresent(Va),

    /// The address is mapped read-only.
    #[error("page is write protected ({0})")]
    WriteProtected(Va),

    /// A table on the path to the address is missing.
    #[error("no page table maps {0}")]
    TableNotPresent(Va),

    /// The machine address does not belong to the guest.
    #[error("machine address {0} is not owned by the guest")]
    NotOwned(Maddr),

    /// The frame is already pinned.
    #[error("frame {0} is already pinned")]
    AlreadyPinned(Mfn),

    /// The frame is not pinned, or not pinned as a root table.
    #[error("frame {0} is not pinned")]
    NotPinned(Mfn),

    /// A page table frame would be writable through a validated table.
    #[error("writable mapping of page table frame {0}")]
    WritableTable(Mfn),

    /// The memory exchange request is malformed.
    #[error("invalid memory exchange: {0}")]
    InvalidExchange(&'static str),

    /// No machine frames satisfy the request.
    #[error("out of machine memory")]
    OutOfMemory,

    /// The vCPU does not exist.
    #[error("invalid vcpu {0}")]
    InvalidVcpu(VcpuId),

    /// The operation was failed on request.
    #[error("injected failure")]
    Injected,

    /// The requested guest layout cannot be built.
    #[error("invalid layout: {0}")]
    Layout(&'static str),
}

impl From<Error> for MmuError {
    fn from(value: Error) -> Self {
        match value {
            Error::PageNotPresent(va) => Self::PageNotPresent(va),
            Error::WriteProtected(va) => Self::WriteProtected(va),
            Error::TableNotPresent(va) => Self::TableNotPresent(va),
            Error::OutOfMemory => Self::OutOfMemory,
            Error::InvalidVcpu(_) => Self::OutOfBounds,
            value => Self::Driver(Box::new(value)),
        }
    }
}
