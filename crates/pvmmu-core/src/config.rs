use serde::{Deserialize, Serialize};

use crate::Pfn;

/// Tunables of the MMU layer.
///
/// The defaults match the limits of the hypervisor's multicall interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MmuConfig {
    /// Maximum number of operations in one multicall.
    pub batch_entries: usize,

    /// Argument space of one multicall, in bytes.
    pub batch_args: usize,

    /// Maximum number of callbacks waiting on one multicall.
    pub batch_callbacks: usize,

    /// Largest order accepted by the contiguous region allocator.
    pub max_contig_order: u32,

    /// Number of entries written per hypercall when mapping foreign frames.
    pub remap_batch: usize,

    /// Use one lock per page table page instead of the address space lock.
    pub split_ptlocks: bool,

    /// First frame without a permanent kernel mapping, if any.
    pub highmem_start: Option<Pfn>,
}

impl Default for MmuConfig {
    fn default() -> Self {
        Self {
            batch_entries: 32,
            batch_args: 512,
            batch_callbacks: 32,
            max_contig_order: 9,
            remap_batch: 16,
            split_ptlocks: true,
            highmem_start: None,
        }
    }
}

impl MmuConfig {
    /// Sets the maximum number of operations in one multicall.
    pub fn with_batch_entries(self, batch_entries: usize) -> Self {
        Self {
            batch_entries,
            ..self
        }
    }

    /// Sets the argument space of one multicall.
    pub fn with_batch_args(self, batch_args: usize) -> Self {
        Self { batch_args, ..self }
    }

    /// Sets the maximum number of callbacks waiting on one multicall.
    pub fn with_batch_callbacks(self, batch_callbacks: usize) -> Self {
        Self {
            batch_callbacks,
            ..self
        }
    }

    /// Sets the largest contiguous region order.
    pub fn with_max_contig_order(self, max_contig_order: u32) -> Self {
        Self {
            max_contig_order,
            ..self
        }
    }

    /// Sets the foreign mapping chunk size.
    pub fn with_remap_batch(self, remap_batch: usize) -> Self {
        Self {
            remap_batch,
            ..self
        }
    }

    /// Selects between per-page and per-address-space table locks.
    pub fn with_split_ptlocks(self, split_ptlocks: bool) -> Self {
        Self {
            split_ptlocks,
            ..self
        }
    }

    /// Sets the first high-memory frame.
    pub fn with_highmem_start(self, highmem_start: impl Into<Option<Pfn>>) -> Self {
        Self {
            highmem_start: highmem_start.into(),
            ..self
        }
    }

    /// Checks if the frame has no permanent kernel mapping.
    pub fn is_highmem(&self, pfn: Pfn) -> bool {
        self.highmem_start.is_some_and(|start| pfn >= start)
    }
}
