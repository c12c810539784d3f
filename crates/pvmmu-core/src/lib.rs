//! Core paravirtualized MMU functionality.
//!
//! A paravirtualized guest runs on page tables it cannot write directly:
//! once a table is in use, the hypervisor keeps it read-only and validates
//! every change. This crate keeps the guest side of that contract. It
//! translates between physical and machine frames, batches privileged
//! updates per vCPU, pins and unpins whole page table trees, and trades
//! memory for machine-contiguous regions.

mod address_space;
mod alloc;
pub mod arch;
mod config;
mod core;
mod driver;
mod error;
mod hypercall;
mod mmu;
mod multicall;
mod p2m;
mod page;
mod page_info;
pub mod stats;
pub mod translate;
mod walk;

pub use self::{
    address_space::AddressSpace,
    alloc::{BumpAllocator, FramePool, PageAllocator},
    arch::{Architecture, TableEntry},
    config::MmuConfig,
    core::{CpuMask, DomId, Maddr, Mfn, MmuInfo, Pfn, Va, VcpuId},
    driver::MmuDriver,
    error::MmuError,
    hypercall::{
        MMU_UPDATE_SIZE, MMUEXT_OP_SIZE, MemoryExchange, MmuExtOp, MmuUpdate, MmuUpdateKind,
        MulticallEntry, PinLevel, UvmFlags,
    },
    mmu::Mmu,
    multicall::{Batch, Callback, LazyMode, Multicall},
    p2m::{MAX_P2M_PFN, P2M_MID_PER_PAGE, P2M_PER_PAGE, P2M_TOP_PER_PAGE, P2m},
    page::MappedPage,
    page_info::{PageFlags, PageInfo, PageInfoTable},
    stats::{MmuStats, MmuStatsSnapshot},
    translate::FrameMap,
    walk::{PageTableVisitor, walk},
};
