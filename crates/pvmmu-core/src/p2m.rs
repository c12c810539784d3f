//! Physical-to-machine frame translation table.
//!
//! The table maps every guest physical frame number to the machine frame
//! backing it. It is a three level radix tree (top, mid, leaf) so a sparse
//! physical address space costs only the pages actually in use:
//!
//! ```text
//! top[pfn / (MID * LEAF)] -> mid[(pfn / LEAF) % MID] -> leaf[pfn % LEAF]
//! ```
//!
//! Unused slots never hold null. They point at shared "missing" pages: a mid
//! page whose slots all reference the missing leaf, and a leaf filled with
//! [`Mfn::INVALID`]. A lookup therefore always performs three loads and
//! never branches on emptiness, and a write under a missing page must first
//! materialize a private page with [`P2m::ensure_allocated`]. Materializing
//! uses compare-and-swap on the slot; losers free their page.
//!
//! A second tree of the same shape records the *machine* frame of every leaf
//! page. The hypervisor walks it when it has to rewrite the table itself,
//! e.g. across migration. Machine frames are meaningless after a
//! save/restore cycle, so [`P2m::rebuild_machine_address_shadow`] re-derives
//! the whole shadow from the primary tree.

use std::{
    array, ptr,
    sync::{
        Arc,
        atomic::{AtomicPtr, AtomicU64, Ordering},
    },
};

use crate::{Mfn, MmuError, MmuInfo, PageAllocator, Pfn};

/// Number of frame entries in a leaf page.
pub const P2M_PER_PAGE: usize = 512;

/// Number of leaf pointers in a mid page.
pub const P2M_MID_PER_PAGE: usize = 512;

/// Number of mid pointers in the top level.
pub const P2M_TOP_PER_PAGE: usize = 512;

/// The first physical frame number the table cannot describe.
pub const MAX_P2M_PFN: u64 = (P2M_TOP_PER_PAGE * P2M_MID_PER_PAGE * P2M_PER_PAGE) as u64;

struct LeafPage {
    entries: [AtomicU64; P2M_PER_PAGE],
    frame: Pfn,
}

impl LeafPage {
    fn new(frame: Pfn) -> Self {
        Self {
            entries: array::from_fn(|_| AtomicU64::new(Mfn::INVALID.0)),
            frame,
        }
    }
}

struct MidPage {
    leaves: [AtomicPtr<LeafPage>; P2M_MID_PER_PAGE],
    frame: Pfn,
}

impl MidPage {
    fn new(frame: Pfn, missing: *mut LeafPage) -> Self {
        Self {
            leaves: array::from_fn(|_| AtomicPtr::new(missing)),
            frame,
        }
    }
}

/// Machine frames of the leaves under one mid page.
struct MfnPage {
    entries: [AtomicU64; P2M_MID_PER_PAGE],
    frame: Pfn,
}

impl MfnPage {
    fn new(frame: Pfn, fill: Mfn) -> Self {
        Self {
            entries: array::from_fn(|_| AtomicU64::new(fill.0)),
            frame,
        }
    }
}

/// Splits a frame number into top, mid and leaf indices.
fn p2m_index(pfn: Pfn) -> (usize, usize, usize) {
    let pfn = pfn.0 as usize;
    (
        pfn / (P2M_MID_PER_PAGE * P2M_PER_PAGE),
        (pfn / P2M_PER_PAGE) % P2M_MID_PER_PAGE,
        pfn % P2M_PER_PAGE,
    )
}

/// The frame translation table.
///
/// Every page of the tree is backed by a guest frame taken from one of two
/// allocators, so the shadow tree can name it by machine frame. Early pages
/// come from the boot allocator; pages materialized later come from the
/// general page allocator.
pub struct P2m {
    top: Box<[AtomicPtr<MidPage>; P2M_TOP_PER_PAGE]>,
    top_mfn: Box<[AtomicU64; P2M_TOP_PER_PAGE]>,
    top_mfn_p: Box<[AtomicPtr<MfnPage>; P2M_TOP_PER_PAGE]>,
    top_mfn_frame: Pfn,

    missing_leaf: Box<LeafPage>,
    missing_mid: Box<MidPage>,
    missing_mfn: Box<MfnPage>,

    /// Leaves grafted from the boot frame list. Owned here, never freed
    /// individually.
    boot_leaves: Box<[LeafPage]>,

    max_pfn: u64,
    auto_translated: bool,
    early: Arc<dyn PageAllocator>,
    pages: Arc<dyn PageAllocator>,
}

impl P2m {
    /// Builds the table from the boot frame list.
    ///
    /// The list is grafted into the leaves as is, padded with
    /// [`Mfn::INVALID`] up to the end of the last leaf. The machine-address
    /// shadow starts out entirely missing; call
    /// [`rebuild_machine_address_shadow`] before publishing it.
    ///
    /// [`rebuild_machine_address_shadow`]: Self::rebuild_machine_address_shadow
    pub fn new(
        info: &MmuInfo,
        early: Arc<dyn PageAllocator>,
        pages: Arc<dyn PageAllocator>,
    ) -> Result<Self, MmuError> {
        if info.nr_pages > MAX_P2M_PFN {
            return Err(MmuError::OutOfBounds);
        }

        let alloc_early = || early.alloc().ok_or(MmuError::OutOfMemory);

        let missing_leaf = Box::new(LeafPage::new(alloc_early()?));
        let missing_leaf_ptr = ptr::from_ref(&*missing_leaf).cast_mut();
        let missing_mid = Box::new(MidPage::new(alloc_early()?, missing_leaf_ptr));
        let missing_mid_ptr = ptr::from_ref(&*missing_mid).cast_mut();
        let missing_mfn = Box::new(MfnPage::new(alloc_early()?, Mfn::INVALID));
        let missing_mfn_ptr = ptr::from_ref(&*missing_mfn).cast_mut();
        let top_mfn_frame = alloc_early()?;

        let nr_leaves = info.nr_pages.div_ceil(P2M_PER_PAGE as u64) as usize;
        let boot_leaves = (0..nr_leaves)
            .map(|leaf| LeafPage {
                entries: array::from_fn(|slot| {
                    let pfn = leaf * P2M_PER_PAGE + slot;
                    let mfn = match info.mfn_list.get(pfn) {
                        Some(&mfn) if (pfn as u64) < info.nr_pages => mfn,
                        _ => Mfn::INVALID,
                    };
                    AtomicU64::new(mfn.0)
                }),
                frame: info.mfn_list_frame + leaf as u64,
            })
            .collect::<Box<[_]>>();

        let p2m = Self {
            top: Box::new(array::from_fn(|_| AtomicPtr::new(missing_mid_ptr))),
            top_mfn: Box::new(array::from_fn(|_| AtomicU64::new(Mfn::INVALID.0))),
            top_mfn_p: Box::new(array::from_fn(|_| AtomicPtr::new(missing_mfn_ptr))),
            top_mfn_frame,
            missing_leaf,
            missing_mid,
            missing_mfn,
            boot_leaves,
            max_pfn: info.nr_pages,
            auto_translated: info.auto_translated,
            early,
            pages,
        };

        p2m.graft_boot_leaves()?;

        tracing::debug!(
            nr_pages = info.nr_pages,
            leaves = p2m.boot_leaves.len(),
            "frame translation table initialized"
        );

        Ok(p2m)
    }

    fn graft_boot_leaves(&self) -> Result<(), MmuError> {
        for (index, leaf) in self.boot_leaves.iter().enumerate() {
            let (topidx, mididx, _) = p2m_index(Pfn((index * P2M_PER_PAGE) as u64));

            let mut mid = self.top[topidx].load(Ordering::Acquire);
            if mid == self.missing_mid_ptr() {
                let frame = self.early.alloc().ok_or(MmuError::OutOfMemory)?;
                mid = Box::into_raw(Box::new(MidPage::new(frame, self.missing_leaf_ptr())));
                self.top[topidx].store(mid, Ordering::Release);
            }

            // SAFETY: `mid` is a live page owned by this table.
            let mid = unsafe { &*mid };
            mid.leaves[mididx].store(ptr::from_ref(leaf).cast_mut(), Ordering::Release);
        }

        Ok(())
    }

    fn missing_leaf_ptr(&self) -> *mut LeafPage {
        ptr::from_ref(&*self.missing_leaf).cast_mut()
    }

    fn missing_mid_ptr(&self) -> *mut MidPage {
        ptr::from_ref(&*self.missing_mid).cast_mut()
    }

    fn missing_mfn_ptr(&self) -> *mut MfnPage {
        ptr::from_ref(&*self.missing_mfn).cast_mut()
    }

    fn is_boot_leaf(&self, leaf: *mut LeafPage) -> bool {
        self.boot_leaves
            .as_ptr_range()
            .contains(&leaf.cast_const())
    }

    fn mid(&self, topidx: usize) -> &MidPage {
        // SAFETY: top slots only hold the missing mid or pages owned by this
        // table, and pages are only freed on drop.
        unsafe { &*self.top[topidx].load(Ordering::Acquire) }
    }

    fn leaf(&self, topidx: usize, mididx: usize) -> &LeafPage {
        // SAFETY: same as above, for leaf pages.
        unsafe { &*self.mid(topidx).leaves[mididx].load(Ordering::Acquire) }
    }

    /// Returns the number of frames the guest was started with.
    pub fn max_pfn(&self) -> u64 {
        self.max_pfn
    }

    /// Checks if the hypervisor translates frames itself.
    pub fn auto_translated(&self) -> bool {
        self.auto_translated
    }

    /// Looks up the machine frame backing `pfn`.
    ///
    /// Returns [`Mfn::INVALID`] for frames beyond the table or never
    /// written. Wait-free.
    pub fn lookup(&self, pfn: Pfn) -> Mfn {
        if self.auto_translated {
            return Mfn(pfn.0);
        }

        if pfn.0 >= MAX_P2M_PFN {
            return Mfn::INVALID;
        }

        let (topidx, mididx, idx) = p2m_index(pfn);
        Mfn(self.leaf(topidx, mididx).entries[idx].load(Ordering::Acquire))
    }

    /// Stores `mfn` if a private leaf page already covers `pfn`.
    ///
    /// Storing [`Mfn::INVALID`] under a missing leaf trivially succeeds.
    pub fn try_set(&self, pfn: Pfn, mfn: Mfn) -> bool {
        if pfn.0 >= MAX_P2M_PFN {
            return !mfn.is_valid();
        }

        let (topidx, mididx, idx) = p2m_index(pfn);
        let leaf = self.leaf(topidx, mididx);
        if ptr::eq(leaf, &*self.missing_leaf) {
            return !mfn.is_valid();
        }

        leaf.entries[idx].store(mfn.0, Ordering::Release);
        true
    }

    /// Materializes every level of the tree covering `pfn`.
    ///
    /// Performs up to three allocations: the mid page, the shadow page
    /// recording the machine frames of its leaves, and the leaf page. Each
    /// one is published with compare-and-swap; a caller that loses the race
    /// frees its page and continues with the winner's.
    ///
    /// Returns `false` if the page allocator is exhausted.
    pub fn ensure_allocated(&self, pfn: Pfn) -> bool {
        if pfn.0 >= MAX_P2M_PFN {
            return false;
        }

        let (topidx, mididx, _) = p2m_index(pfn);

        let mut mid = self.top[topidx].load(Ordering::Acquire);
        if mid == self.missing_mid_ptr() {
            let Some(frame) = self.pages.alloc() else {
                return false;
            };

            let fresh = Box::into_raw(Box::new(MidPage::new(frame, self.missing_leaf_ptr())));
            match self.top[topidx].compare_exchange(
                mid,
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::debug!(%pfn, topidx, %frame, "materialized mid page");
                    mid = fresh;
                }
                Err(winner) => {
                    // SAFETY: `fresh` was never published.
                    drop(unsafe { Box::from_raw(fresh) });
                    self.pages.free(frame);
                    mid = winner;
                }
            }
        }

        // SAFETY: `mid` is either the winner of the exchange above or a page
        // that was already published.
        let mid = unsafe { &*mid };

        let mid_mfn = self.top_mfn_p[topidx].load(Ordering::Acquire);
        if mid_mfn == self.missing_mfn_ptr() {
            let Some(frame) = self.pages.alloc() else {
                return false;
            };

            let fresh = Box::new(MfnPage::new(frame, Mfn::INVALID));
            for (slot, leaf) in fresh.entries.iter().zip(mid.leaves.iter()) {
                // SAFETY: leaf slots only hold live pages.
                let leaf = unsafe { &*leaf.load(Ordering::Acquire) };
                slot.store(self.lookup(leaf.frame).0, Ordering::Relaxed);
            }

            let fresh = Box::into_raw(fresh);
            match self.top_mfn_p[topidx].compare_exchange(
                mid_mfn,
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.top_mfn[topidx].store(self.lookup(frame).0, Ordering::Release);
                }
                Err(_) => {
                    // SAFETY: `fresh` was never published.
                    drop(unsafe { Box::from_raw(fresh) });
                    self.pages.free(frame);
                }
            }
        }

        let leaf = mid.leaves[mididx].load(Ordering::Acquire);
        if leaf == self.missing_leaf_ptr() {
            let Some(frame) = self.pages.alloc() else {
                return false;
            };

            let fresh = Box::into_raw(Box::new(LeafPage::new(frame)));
            match mid.leaves[mididx].compare_exchange(
                leaf,
                fresh,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::debug!(%pfn, topidx, mididx, %frame, "materialized leaf page");

                    // SAFETY: the shadow page was ensured above and is never
                    // replaced once published.
                    let mid_mfn = unsafe { &*self.top_mfn_p[topidx].load(Ordering::Acquire) };
                    mid_mfn.entries[mididx].store(self.lookup(frame).0, Ordering::Release);
                }
                Err(_) => {
                    // SAFETY: `fresh` was never published.
                    drop(unsafe { Box::from_raw(fresh) });
                    self.pages.free(frame);
                }
            }
        }

        true
    }

    /// Stores `mfn` for `pfn`, materializing the tree if needed.
    ///
    /// Returns `false` if a page could not be allocated; the table is left
    /// unchanged in that case.
    pub fn set(&self, pfn: Pfn, mfn: Mfn) -> bool {
        if self.auto_translated {
            return true;
        }

        if self.try_set(pfn, mfn) {
            return true;
        }

        if !self.ensure_allocated(pfn) {
            tracing::warn!(%pfn, %mfn, "no memory to extend the frame translation table");
            return false;
        }

        self.try_set(pfn, mfn)
    }

    /// Re-derives the machine-address shadow tree from the primary tree.
    ///
    /// At boot the shadow mid pages are allocated from the early allocator.
    /// Afterwards the shadow is expected to be complete; needing an
    /// allocation then means the table is corrupt, which is fatal.
    pub fn rebuild_machine_address_shadow(&self) {
        if self.auto_translated {
            return;
        }

        let missing_leaf_mfn = self.lookup(self.missing_leaf.frame);
        for slot in self.missing_mfn.entries.iter() {
            slot.store(missing_leaf_mfn.0, Ordering::Relaxed);
        }

        let missing_mfn_mfn = self.lookup(self.missing_mfn.frame);

        for topidx in 0..P2M_TOP_PER_PAGE {
            let mid = self.top[topidx].load(Ordering::Acquire);
            if mid == self.missing_mid_ptr() {
                self.top_mfn[topidx].store(missing_mfn_mfn.0, Ordering::Release);
                continue;
            }

            let mut mid_mfn = self.top_mfn_p[topidx].load(Ordering::Acquire);
            if mid_mfn == self.missing_mfn_ptr() {
                let Some(frame) = self.early.alloc() else {
                    tracing::error!(topidx, "machine address tree incomplete after boot");
                    panic!("machine address tree needs an allocation after boot (top {topidx})");
                };

                let fresh = Box::into_raw(Box::new(MfnPage::new(frame, missing_leaf_mfn)));
                match self.top_mfn_p[topidx].compare_exchange(
                    mid_mfn,
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => mid_mfn = fresh,
                    Err(winner) => {
                        // SAFETY: `fresh` was never published.
                        drop(unsafe { Box::from_raw(fresh) });
                        self.early.free(frame);
                        mid_mfn = winner;
                    }
                }
            }

            // SAFETY: both pointers reference live pages owned by this table.
            let (mid, mid_mfn) = unsafe { (&*mid, &*mid_mfn) };

            self.top_mfn[topidx].store(self.lookup(mid_mfn.frame).0, Ordering::Release);
            for (slot, leaf) in mid_mfn.entries.iter().zip(mid.leaves.iter()) {
                // SAFETY: leaf slots only hold live pages.
                let leaf = unsafe { &*leaf.load(Ordering::Acquire) };
                slot.store(self.lookup(leaf.frame).0, Ordering::Release);
            }
        }

        tracing::debug!(max_pfn = self.max_pfn, "rebuilt machine address shadow");
    }

    /// Returns the machine frame of the shadow tree root, as handed to the
    /// hypervisor.
    pub fn frame_list_list(&self) -> Mfn {
        self.lookup(self.top_mfn_frame)
    }

    /// Returns the machine frame of the shadow page covering `pfn`, as
    /// recorded in the shadow root.
    pub fn shadow_mid_mfn(&self, pfn: Pfn) -> Mfn {
        if pfn.0 >= MAX_P2M_PFN {
            return Mfn::INVALID;
        }

        let (topidx, _, _) = p2m_index(pfn);
        Mfn(self.top_mfn[topidx].load(Ordering::Acquire))
    }

    /// Returns the machine frame recorded in the shadow tree for the leaf
    /// page covering `pfn`.
    pub fn shadow_leaf_mfn(&self, pfn: Pfn) -> Mfn {
        if pfn.0 >= MAX_P2M_PFN {
            return Mfn::INVALID;
        }

        let (topidx, mididx, _) = p2m_index(pfn);

        // SAFETY: shadow slots only hold the missing page or owned pages.
        let mid_mfn = unsafe { &*self.top_mfn_p[topidx].load(Ordering::Acquire) };
        Mfn(mid_mfn.entries[mididx].load(Ordering::Acquire))
    }

    /// Returns the physical frame backing the leaf page covering `pfn`, or
    /// `None` while it is still the missing page.
    pub fn leaf_frame(&self, pfn: Pfn) -> Option<Pfn> {
        if pfn.0 >= MAX_P2M_PFN {
            return None;
        }

        let (topidx, mididx, _) = p2m_index(pfn);
        let leaf = self.leaf(topidx, mididx);
        (!ptr::eq(leaf, &*self.missing_leaf)).then_some(leaf.frame)
    }

    /// Returns the physical frame backing the mid page covering `pfn`, or
    /// `None` while it is still the missing page.
    pub fn mid_frame(&self, pfn: Pfn) -> Option<Pfn> {
        if pfn.0 >= MAX_P2M_PFN {
            return None;
        }

        let (topidx, _, _) = p2m_index(pfn);
        let mid = self.mid(topidx);
        (!ptr::eq(mid, &*self.missing_mid)).then_some(mid.frame)
    }
}

impl Drop for P2m {
    fn drop(&mut self) {
        let missing_mid = self.missing_mid_ptr();
        let missing_leaf = self.missing_leaf_ptr();
        let missing_mfn = self.missing_mfn_ptr();

        for slot in self.top.iter() {
            let mid = slot.load(Ordering::Acquire);
            if mid == missing_mid {
                continue;
            }

            // SAFETY: published mid pages were leaked from a box and are only
            // reclaimed here.
            let mid = unsafe { Box::from_raw(mid) };
            for slot in mid.leaves.iter() {
                let leaf = slot.load(Ordering::Acquire);
                if leaf != missing_leaf && !self.is_boot_leaf(leaf) {
                    // SAFETY: same as above, for leaf pages.
                    drop(unsafe { Box::from_raw(leaf) });
                }
            }
        }

        for slot in self.top_mfn_p.iter() {
            let mid_mfn = slot.load(Ordering::Acquire);
            if mid_mfn != missing_mfn {
                // SAFETY: same as above, for shadow pages.
                drop(unsafe { Box::from_raw(mid_mfn) });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Barrier},
        thread,
    };

    use super::*;
    use crate::{BumpAllocator, FramePool};

    /// Physical frames reserved for table pages in these tests. The boot
    /// list below backs them with machine frames too.
    const EARLY: Pfn = Pfn(16);
    const POOL: u64 = 64;

    fn info(nr_pages: u64) -> MmuInfo {
        MmuInfo {
            page_size: 4096,
            page_shift: 12,
            nr_pages,
            mfn_list: (0..nr_pages).map(|pfn| Mfn(0x1000 + pfn)).collect(),
            mfn_list_frame: Pfn(1),
            kernel_root: Pfn(0),
            vcpus: 1,
            auto_translated: false,
            initial_domain: false,
        }
    }

    fn table(nr_pages: u64) -> (P2m, Arc<BumpAllocator>, Arc<FramePool>) {
        let early = Arc::new(BumpAllocator::new(EARLY, 16));
        let pool = Arc::new(FramePool::new((32..32 + POOL).map(Pfn)));
        let p2m = P2m::new(&info(nr_pages), early.clone(), pool.clone()).unwrap();
        (p2m, early, pool)
    }

    #[test]
    fn never_written_frames_are_invalid() {
        let (p2m, _, _) = table(600);

        assert_eq!(p2m.lookup(Pfn(600)), Mfn::INVALID);
        assert_eq!(p2m.lookup(Pfn(1023)), Mfn::INVALID);
        assert_eq!(p2m.lookup(Pfn(1024)), Mfn::INVALID);
        assert_eq!(p2m.lookup(Pfn(77_777_777)), Mfn::INVALID);
        assert_eq!(p2m.lookup(Pfn(MAX_P2M_PFN)), Mfn::INVALID);
        assert_eq!(p2m.lookup(Pfn(u64::MAX)), Mfn::INVALID);
    }

    #[test]
    fn boot_list_is_grafted() {
        let (p2m, _, pool) = table(600);

        assert_eq!(p2m.lookup(Pfn(0)), Mfn(0x1000));
        assert_eq!(p2m.lookup(Pfn(599)), Mfn(0x1000 + 599));
        assert_eq!(p2m.leaf_frame(Pfn(0)), Some(Pfn(1)));
        assert_eq!(p2m.leaf_frame(Pfn(512)), Some(Pfn(2)));
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn try_set_refuses_missing_leaf() {
        let (p2m, _, pool) = table(512);

        assert!(!p2m.try_set(Pfn(4096), Mfn(5)));
        assert!(p2m.try_set(Pfn(4096), Mfn::INVALID));
        assert!(p2m.try_set(Pfn(MAX_P2M_PFN), Mfn::INVALID));
        assert!(!p2m.try_set(Pfn(MAX_P2M_PFN), Mfn(5)));
        assert_eq!(pool.allocated(), 0);
    }

    #[test]
    fn set_materializes_new_top_index() {
        let (p2m, _, pool) = table(512);

        assert!(p2m.set(Pfn(0), Mfn(100)));
        assert_eq!(p2m.lookup(Pfn(0)), Mfn(100));

        assert!(p2m.set(Pfn(10_000_000), Mfn(5)));
        assert_eq!(p2m.lookup(Pfn(10_000_000)), Mfn(5));
        assert_eq!(p2m.lookup(Pfn(0)), Mfn(100));
        assert_eq!(p2m.lookup(Pfn(10_000_001)), Mfn::INVALID);

        // mid, shadow mid and leaf
        assert_eq!(pool.allocated(), 3);
    }

    #[test]
    fn set_fails_cleanly_when_out_of_pages() {
        let early = Arc::new(BumpAllocator::new(EARLY, 16));
        let pool = Arc::new(FramePool::new([Pfn(32)]));
        let p2m = P2m::new(&info(512), early, pool.clone()).unwrap();

        assert!(!p2m.set(Pfn(10_000_000), Mfn(5)));
        assert_eq!(p2m.lookup(Pfn(10_000_000)), Mfn::INVALID);
    }

    #[test]
    fn concurrent_allocation_has_one_winner() {
        let (p2m, _, pool) = table(512);
        let p2m = Arc::new(p2m);
        let barrier = Arc::new(Barrier::new(4));
        let pfn = Pfn(3 * 512 * 512 + 7);

        let handles = (0..4)
            .map(|_| {
                let p2m = p2m.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    assert!(p2m.ensure_allocated(pfn));
                    p2m.leaf_frame(pfn)
                })
            })
            .collect::<Vec<_>>();

        let leaves = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>();

        assert!(leaves[0].is_some());
        assert!(leaves.iter().all(|leaf| *leaf == leaves[0]));
        assert_eq!(pool.allocated(), 3);
    }

    #[test]
    fn shadow_tracks_leaf_machine_frames() {
        let (p2m, _, _) = table(1024);
        p2m.rebuild_machine_address_shadow();

        assert_eq!(p2m.shadow_leaf_mfn(Pfn(0)), Mfn(0x1000 + 1));
        assert_eq!(p2m.shadow_leaf_mfn(Pfn(512)), Mfn(0x1000 + 2));
        assert!(p2m.shadow_mid_mfn(Pfn(0)).is_valid());
        assert!(p2m.frame_list_list().is_valid());

        // Leaves materialized after boot are recorded immediately.
        assert!(p2m.set(Pfn(600 * 1024), Mfn(9)));
        let leaf = p2m.leaf_frame(Pfn(600 * 1024)).unwrap();
        assert_eq!(p2m.shadow_leaf_mfn(Pfn(600 * 1024)), p2m.lookup(leaf));
    }

    #[test]
    fn rebuild_after_boot_needs_no_allocation() {
        let (p2m, early, _) = table(1024);
        p2m.rebuild_machine_address_shadow();
        early.seal();

        assert!(p2m.set(Pfn(5_000_000), Mfn(1)));
        p2m.rebuild_machine_address_shadow();
        assert_eq!(p2m.lookup(Pfn(5_000_000)), Mfn(1));
    }

    #[test]
    #[should_panic(expected = "machine address tree")]
    fn rebuild_needing_allocation_after_boot_is_fatal() {
        let (p2m, early, _) = table(1024);
        early.seal();
        p2m.rebuild_machine_address_shadow();
    }

    #[test]
    fn auto_translated_is_identity() {
        let early = Arc::new(BumpAllocator::new(EARLY, 16));
        let pool = Arc::new(FramePool::new([]));
        let mut info = info(16);
        info.auto_translated = true;
        let p2m = P2m::new(&info, early, pool).unwrap();

        assert!(p2m.set(Pfn(123), Mfn(123)));
        assert_eq!(p2m.lookup(Pfn(9_999)), Mfn(9_999));
    }
}
