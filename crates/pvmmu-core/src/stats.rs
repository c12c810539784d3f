//! Operation counters.
//!
//! Purely informational; nothing in the MMU layer reads them back.

use std::{
    array,
    sync::atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize};

/// Number of buckets in the multicall extension histogram.
pub const HISTO_BUCKETS: usize = 30;

/// Counters for writes at one table level.
#[derive(Debug, Default)]
pub struct LevelStats {
    update: AtomicU64,
    update_pinned: AtomicU64,
    update_batched: AtomicU64,
}

/// A point-in-time copy of [`LevelStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelSnapshot {
    /// Entry writes.
    pub update: u64,

    /// Entry writes into pinned tables.
    pub update_pinned: u64,

    /// Entry writes issued through a batch.
    pub update_batched: u64,
}

impl LevelStats {
    fn snapshot(&self) -> LevelSnapshot {
        LevelSnapshot {
            update: self.update.load(Ordering::Relaxed),
            update_pinned: self.update_pinned.load(Ordering::Relaxed),
            update_batched: self.update_batched.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.update.store(0, Ordering::Relaxed);
        self.update_pinned.store(0, Ordering::Relaxed);
        self.update_batched.store(0, Ordering::Relaxed);
    }
}

/// Operation counters of the MMU layer.
#[derive(Debug)]
pub struct MmuStats {
    pub(crate) pte: LevelStats,
    pub(crate) pmd: LevelStats,
    pub(crate) pud: LevelStats,
    pub(crate) pgd: LevelStats,

    mmu_update: AtomicU64,
    mmu_update_extended: AtomicU64,
    mmu_update_histo: [AtomicU64; HISTO_BUCKETS],

    prot_commit: AtomicU64,
    prot_commit_batched: AtomicU64,

    set_pte_at: AtomicU64,
    set_pte_at_batched: AtomicU64,
    set_pte_at_pinned: AtomicU64,
    set_pte_at_current: AtomicU64,
    set_pte_at_kernel: AtomicU64,
}

/// A point-in-time copy of [`MmuStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmuStatsSnapshot {
    /// Leaf entry writes.
    pub pte: LevelSnapshot,
    /// Second level entry writes.
    pub pmd: LevelSnapshot,
    /// Third level entry writes.
    pub pud: LevelSnapshot,
    /// Root entry writes.
    pub pgd: LevelSnapshot,

    /// Checked entry writes queued.
    pub mmu_update: u64,
    /// Checked entry writes merged into an existing operation.
    pub mmu_update_extended: u64,
    /// Size of merged operations, by number of updates.
    pub mmu_update_histo: Vec<u64>,

    /// Protection changes committed.
    pub prot_commit: u64,
    /// Protection changes committed through a batch.
    pub prot_commit_batched: u64,

    /// Mappings installed through `set_pte_at`.
    pub set_pte_at: u64,
    /// ... of which were batched.
    pub set_pte_at_batched: u64,
    /// ... of which went into a pinned table.
    pub set_pte_at_pinned: u64,
    /// ... of which targeted the current address space.
    pub set_pte_at_current: u64,
    /// ... of which targeted the kernel address space.
    pub set_pte_at_kernel: u64,
}

impl Default for MmuStats {
    fn default() -> Self {
        Self {
            pte: LevelStats::default(),
            pmd: LevelStats::default(),
            pud: LevelStats::default(),
            pgd: LevelStats::default(),
            mmu_update: AtomicU64::new(0),
            mmu_update_extended: AtomicU64::new(0),
            mmu_update_histo: array::from_fn(|_| AtomicU64::new(0)),
            prot_commit: AtomicU64::new(0),
            prot_commit_batched: AtomicU64::new(0),
            set_pte_at: AtomicU64::new(0),
            set_pte_at_batched: AtomicU64::new(0),
            set_pte_at_pinned: AtomicU64::new(0),
            set_pte_at_current: AtomicU64::new(0),
            set_pte_at_kernel: AtomicU64::new(0),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl MmuStats {
    pub(crate) fn level_update(level: &LevelStats, pinned: bool, batched: bool) {
        bump(&level.update);
        if pinned {
            bump(&level.update_pinned);
        }
        if batched {
            bump(&level.update_batched);
        }
    }

    /// Records a queued checked update; `count` is the size of the
    /// operation it ended up in.
    pub(crate) fn mmu_update(&self, count: usize) {
        bump(&self.mmu_update);
        if count > 1 {
            bump(&self.mmu_update_extended);
        }

        let bucket = count.min(HISTO_BUCKETS) - 1;
        bump(&self.mmu_update_histo[bucket]);
    }

    pub(crate) fn prot_commit(&self, batched: bool) {
        bump(&self.prot_commit);
        if batched {
            bump(&self.prot_commit_batched);
        }
    }

    pub(crate) fn set_pte_at(&self, current: bool, kernel: bool, batched: bool, pinned: bool) {
        bump(&self.set_pte_at);
        if current {
            bump(&self.set_pte_at_current);
        }
        if kernel {
            bump(&self.set_pte_at_kernel);
        }
        if batched {
            bump(&self.set_pte_at_batched);
        }
        if pinned {
            bump(&self.set_pte_at_pinned);
        }
    }

    /// Copies every counter.
    pub fn snapshot(&self) -> MmuStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        MmuStatsSnapshot {
            pte: self.pte.snapshot(),
            pmd: self.pmd.snapshot(),
            pud: self.pud.snapshot(),
            pgd: self.pgd.snapshot(),
            mmu_update: load(&self.mmu_update),
            mmu_update_extended: load(&self.mmu_update_extended),
            mmu_update_histo: self.mmu_update_histo.iter().map(load).collect(),
            prot_commit: load(&self.prot_commit),
            prot_commit_batched: load(&self.prot_commit_batched),
            set_pte_at: load(&self.set_pte_at),
            set_pte_at_batched: load(&self.set_pte_at_batched),
            set_pte_at_pinned: load(&self.set_pte_at_pinned),
            set_pte_at_current: load(&self.set_pte_at_current),
            set_pte_at_kernel: load(&self.set_pte_at_kernel),
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        self.pte.reset();
        self.pmd.reset();
        self.pud.reset();
        self.pgd.reset();

        for counter in [
            &self.mmu_update,
            &self.mmu_update_extended,
            &self.prot_commit,
            &self.prot_commit_batched,
            &self.set_pte_at,
            &self.set_pte_at_batched,
            &self.set_pte_at_pinned,
            &self.set_pte_at_current,
            &self.set_pte_at_kernel,
        ] {
            counter.store(0, Ordering::Relaxed);
        }

        for counter in &self.mmu_update_histo {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
