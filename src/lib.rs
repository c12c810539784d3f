//! Paravirtualized memory management for Xen-style guests.
//!
//! A paravirtualized guest does not own its page tables outright. Every
//! table the hypervisor has validated is kept read-only, and the guest has
//! to go through the hypervisor to change it. This crate ties together the
//! pieces a guest kernel needs to live with that:
//!
//! - the frame translation table between guest-physical and machine
//!   frames, together with its machine-address shadow the hypervisor reads
//!   across save/restore ([`P2m`]),
//! - per-vCPU batching of privileged updates into multicalls
//!   ([`Multicall`], [`Batch`]),
//! - pinning and unpinning of whole page table trees
//!   ([`Mmu::pin_table`], [`Mmu::activate_mm`], [`Mmu::exit_mmap`]),
//! - translation of page table entries between physical and machine form
//!   ([`Mmu::make_pte`], [`Mmu::pte_val`]),
//! - and machine-contiguous regions for devices with addressing limits
//!   ([`Mmu::make_contiguous`]).
//!
//! The hypervisor itself is reached through an [`MmuDriver`]. The
//! `driver-sim` feature provides an in-memory one that enforces the same
//! page table safety rule a real hypervisor does.
//!
//! # Example
//!
//! ```no_run
//! use pvmmu::{MmuConfig, Mmu, MmuError, VcpuId, driver::sim::SimDriver};
//!
//! # fn main() -> Result<(), MmuError> {
//! let guest = SimDriver::builder(4096).build()?;
//! let mmu = Mmu::new(guest.driver, guest.early, guest.pool, MmuConfig::default())?;
//!
//! // Create a process address space and run it on the first vCPU.
//! let mm = mmu.pgd_alloc()?;
//! mmu.activate_mm(VcpuId(0), &mm)?;
//! assert!(mmu.is_pinned(mm.root()));
//! # Ok(())
//! # }
//! ```

pub use pvmmu_core::*;

/// Architecture-specific paging layouts.
pub mod arch {
    pub use pvmmu_core::arch::*;

    /// AMD64 paging layout.
    #[cfg(feature = "arch-amd64")]
    pub mod amd64 {
        pub use pvmmu_arch_amd64::*;
    }
}

/// Hypervisor drivers.
pub mod driver {
    /// In-memory hypervisor.
    #[cfg(feature = "driver-sim")]
    pub mod sim {
        pub use pvmmu_driver_sim::*;
    }
}
