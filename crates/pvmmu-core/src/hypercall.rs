//! Records exchanged with the hypervisor's privileged update channel.

use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};

use crate::{CpuMask, DomId, Maddr, Mfn, Va};

/// Argument space taken by a single [`MmuUpdate`].
pub const MMU_UPDATE_SIZE: usize = 16;

/// Argument space taken by a single [`MmuExtOp`].
pub const MMUEXT_OP_SIZE: usize = 24;

/// How the hypervisor applies an [`MmuUpdate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MmuUpdateKind {
    /// Plain checked write of a page table entry.
    Normal,

    /// Write that keeps the accessed and dirty bits of the old entry.
    PreserveAd,
}

/// A checked write of one page table entry, addressed by machine address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MmuUpdate {
    /// Machine address of the entry.
    pub ptr: Maddr,

    /// New raw entry value, already in machine form.
    pub val: u64,

    /// Update kind.
    pub kind: MmuUpdateKind,
}

impl MmuUpdate {
    /// Creates a plain update.
    pub fn normal(ptr: Maddr, val: u64) -> Self {
        Self {
            ptr,
            val,
            kind: MmuUpdateKind::Normal,
        }
    }

    /// Creates an update that preserves accessed and dirty bits.
    pub fn preserve_ad(ptr: Maddr, val: u64) -> Self {
        Self {
            ptr,
            val,
            kind: MmuUpdateKind::PreserveAd,
        }
    }
}

/// The table type requested when pinning a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinLevel {
    /// Leaf table.
    L1,

    /// Second level table.
    L2,

    /// Third level table.
    L3,

    /// Root table.
    L4,
}

/// An extended MMU operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MmuExtOp {
    /// Validates a table and registers it as pinned.
    Pin {
        /// Expected table type.
        level: PinLevel,

        /// Table frame.
        mfn: Mfn,
    },

    /// Drops the pin of a table.
    Unpin {
        /// Table frame.
        mfn: Mfn,
    },

    /// Switches the kernel root table of the calling vCPU.
    NewBaseptr {
        /// Root table frame.
        mfn: Mfn,
    },

    /// Switches the user root table of the calling vCPU.
    NewUserBaseptr {
        /// Root table frame, or `None` for no user table.
        mfn: Option<Mfn>,
    },

    /// Flushes the local TLB.
    TlbFlushLocal,

    /// Invalidates one local TLB entry.
    InvlpgLocal {
        /// Linear address to invalidate.
        va: Va,
    },

    /// Flushes the TLBs of a set of vCPUs.
    TlbFlushMulti {
        /// Target vCPUs.
        cpus: CpuMask,
    },

    /// Invalidates one TLB entry on a set of vCPUs.
    InvlpgMulti {
        /// Linear address to invalidate.
        va: Va,

        /// Target vCPUs.
        cpus: CpuMask,
    },

    /// Flushes the TLBs of every vCPU.
    TlbFlushAll,

    /// Invalidates one TLB entry on every vCPU.
    InvlpgAll {
        /// Linear address to invalidate.
        va: Va,
    },
}

bitflags::bitflags! {
    /// TLB maintenance requested together with a virtual mapping update.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct UvmFlags: u32 {
        /// Flush the whole TLB.
        const TLB_FLUSH = 1 << 0;

        /// Invalidate the updated address only.
        const INVLPG = 1 << 1;

        /// Apply the maintenance on every vCPU instead of locally.
        const ALL = 1 << 2;
    }
}

/// One operation of a multicall batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MulticallEntry {
    /// A run of entry writes that may keep growing while it is the last
    /// operation of the batch.
    MmuUpdate {
        /// Updates, applied in order.
        updates: SmallVec<[MmuUpdate; 8]>,

        /// Domain owning the frames written into the entries.
        domid: DomId,
    },

    /// An extended MMU operation.
    MmuExtOp(MmuExtOp),

    /// Rewrites the entry mapping a virtual address in the current address
    /// space.
    UpdateVaMapping {
        /// The virtual address.
        va: Va,

        /// New raw entry value, already in machine form.
        val: u64,

        /// TLB maintenance to perform afterwards.
        flags: UvmFlags,
    },
}

impl MulticallEntry {
    /// Creates a single-update entry.
    pub fn mmu_update(update: MmuUpdate, domid: DomId) -> Self {
        Self::MmuUpdate {
            updates: smallvec![update],
            domid,
        }
    }

    /// Returns the argument space this entry occupies in a batch.
    pub fn args_size(&self) -> usize {
        match self {
            Self::MmuUpdate { updates, .. } => updates.len() * MMU_UPDATE_SIZE,
            Self::MmuExtOp(_) => MMUEXT_OP_SIZE,
            Self::UpdateVaMapping { .. } => 0,
        }
    }
}

/// A request to trade one set of machine extents for another.
///
/// `input` lists the machine frames given up, each the start of an extent of
/// `input_order`. On entry, `output` lists the physical frames that receive
/// the new extents of `output_order`; on success the hypervisor overwrites
/// them with the machine frames it handed out.
#[derive(Debug)]
pub struct MemoryExchange<'a> {
    /// Machine frames released by the guest.
    pub input: &'a [u64],

    /// Order of each input extent.
    pub input_order: u32,

    /// Physical frames on entry, machine frames on return.
    pub output: &'a mut [u64],

    /// Order of each output extent.
    pub output_order: u32,

    /// Every returned machine address must fit in this many bits. Zero
    /// means no restriction.
    pub address_bits: u32,

    /// Domain performing the exchange.
    pub domid: DomId,

    /// Number of input extents the hypervisor exchanged.
    pub nr_exchanged: u64,
}
