use crate::Va;

/// An error that can occur when managing guest page tables.
#[derive(thiserror::Error, Debug)]
pub enum MmuError {
    /// An error occurred in the hypervisor driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync>),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The address is not mapped.
    #[error("Page not present ({0})")]
    PageNotPresent(Va),

    /// The address is mapped read-only.
    #[error("Page is write protected ({0})")]
    WriteProtected(Va),

    /// A page table on the path to the address is missing.
    #[error("Page table not present for {0}")]
    TableNotPresent(Va),

    /// No free pages are left.
    #[error("Out of memory")]
    OutOfMemory,

    /// The requested region order exceeds the supported maximum.
    #[error("Order {order} exceeds the maximum of {max}")]
    OrderTooLarge {
        /// The requested order.
        order: u32,

        /// The maximum supported order.
        max: u32,
    },

    /// The hypervisor refused to exchange memory.
    #[error("Memory exchange failed")]
    ExchangeFailed,

    /// The address space is still pinned.
    #[error("Address space is still pinned")]
    StillPinned,

    /// Operation not supported.
    #[error("Operation not supported.")]
    NotSupported,

    /// Out of bounds.
    #[error("Out of bounds")]
    OutOfBounds,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}
