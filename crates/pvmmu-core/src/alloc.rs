//! Page allocators backing page tables and frame translation pages.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::Pfn;

/// A source of free guest pages.
pub trait PageAllocator: Send + Sync {
    /// Takes one page, or returns `None` if exhausted.
    fn alloc(&self) -> Option<Pfn>;

    /// Returns a page.
    fn free(&self, pfn: Pfn);
}

/// Boot-time allocator handing out a fixed range of pages without
/// reclamation.
///
/// Once [`sealed`](Self::seal), every allocation fails.
#[derive(Debug)]
pub struct BumpAllocator {
    next: AtomicU64,
    end: u64,
    sealed: AtomicBool,
}

impl BumpAllocator {
    /// Creates an allocator over `count` pages starting at `start`.
    pub fn new(start: Pfn, count: u64) -> Self {
        Self {
            next: AtomicU64::new(start.0),
            end: start.0 + count,
            sealed: AtomicBool::new(false),
        }
    }

    /// Ends the boot phase.
    pub fn seal(&self) {
        self.sealed.store(true, Ordering::Release);
    }

    /// Checks if the boot phase has ended.
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Returns the number of pages left.
    pub fn remaining(&self) -> u64 {
        self.end.saturating_sub(self.next.load(Ordering::Acquire))
    }
}

impl PageAllocator for BumpAllocator {
    fn alloc(&self) -> Option<Pfn> {
        if self.is_sealed() {
            return None;
        }

        self.next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                (next < self.end).then_some(next + 1)
            })
            .ok()
            .map(Pfn)
    }

    fn free(&self, pfn: Pfn) {
        tracing::trace!(%pfn, "early page released, not reclaimed");
    }
}

/// Free list of guest pages.
#[derive(Debug, Default)]
pub struct FramePool {
    free: Mutex<Vec<Pfn>>,
    allocated: AtomicUsize,
}

impl FramePool {
    /// Creates a pool owning the given pages.
    ///
    /// Pages are handed out lowest first.
    pub fn new(frames: impl IntoIterator<Item = Pfn>) -> Self {
        let mut free = frames.into_iter().collect::<Vec<_>>();
        free.sort_unstable_by(|a, b| b.cmp(a));

        Self {
            free: Mutex::new(free),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Returns the number of free pages.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Returns the number of pages currently handed out.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }
}

impl PageAllocator for FramePool {
    fn alloc(&self) -> Option<Pfn> {
        let pfn = self.free.lock().pop()?;
        self.allocated.fetch_add(1, Ordering::AcqRel);
        Some(pfn)
    }

    fn free(&self, pfn: Pfn) {
        self.free.lock().push(pfn);
        self.allocated.fetch_sub(1, Ordering::AcqRel);
    }
}
