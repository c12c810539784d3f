//! Depth-first traversal of a page table tree.

use std::marker::PhantomData;

use crate::{Architecture, FrameMap, Mfn, MmuDriver, MmuError, Pfn, TableEntry as _, Va};

/// An action applied to every table page found by [`walk`].
///
/// Returns `true` if a TLB flush is required once the walk is over.
pub trait PageTableVisitor<Arch>
where
    Arch: Architecture,
{
    /// Visits the table page `pfn` at `level`.
    fn visit(&mut self, level: Arch::PageTableLevel, pfn: Pfn) -> Result<bool, MmuError>;
}

impl<Arch, F> PageTableVisitor<Arch> for F
where
    Arch: Architecture,
    F: FnMut(Arch::PageTableLevel, Pfn) -> Result<bool, MmuError>,
{
    fn visit(&mut self, level: Arch::PageTableLevel, pfn: Pfn) -> Result<bool, MmuError> {
        self(level, pfn)
    }
}

struct Walker<'a, Arch, Driver, Frames, Visitor> {
    driver: &'a Driver,
    frames: &'a Frames,
    visitor: &'a mut Visitor,
    last: Va,
    _arch: PhantomData<Arch>,
}

impl<Arch, Driver, Frames, Visitor> Walker<'_, Arch, Driver, Frames, Visitor>
where
    Arch: Architecture,
    Driver: MmuDriver<Architecture = Arch>,
    Frames: FrameMap,
    Visitor: PageTableVisitor<Arch>,
{
    fn table(
        &mut self,
        level: Arch::PageTableLevel,
        pfn: Pfn,
        capped: bool,
    ) -> Result<bool, MmuError> {
        let mut flush = false;

        // Leaf tables are visited without being read.
        if let Some(child_level) = Arch::next_level(level) {
            flush |= self.children(level, child_level, pfn, capped)?;
        }

        flush |= self.visitor.visit(level, pfn)?;
        Ok(flush)
    }

    fn children(
        &mut self,
        level: Arch::PageTableLevel,
        child_level: Arch::PageTableLevel,
        pfn: Pfn,
        capped: bool,
    ) -> Result<bool, MmuError> {
        let page = self.driver.read_page(Arch::pfn_to_va(pfn))?;

        let end = match capped {
            true => Arch::va_index_for(self.last, level) as usize,
            false => Arch::ENTRIES_PER_TABLE - 1,
        };

        let hole = match level == Arch::ROOT_LEVEL {
            true => {
                Arch::va_index_for(Arch::USER_LIMIT, level) as usize
                    ..Arch::va_index_for(Arch::PAGE_OFFSET, level) as usize
            }
            false => 0..0,
        };

        let mut flush = false;
        for index in 0..=end {
            if hole.contains(&index) {
                continue;
            }

            let entry = Arch::PageTableEntry::from_raw(page.entry(index));
            if !entry.present() || entry.large() {
                continue;
            }

            let child = self.frames.mfn_to_pfn(Mfn(entry.frame()));
            if !child.is_valid() {
                tracing::warn!(%pfn, index, mfn = entry.frame(), "table entry names a foreign frame");
                continue;
            }

            flush |= self.table(child_level, child, capped && index == end)?;
        }

        Ok(flush)
    }
}

/// Walks the page table tree rooted at `root`, visiting each table page
/// that maps addresses below `limit`.
///
/// Pages are visited in post-order: every table is visited after all of
/// its children, so the root is always visited last. Leaf tables are
/// visited but never read. Entries mapping large pages are skipped, as is
/// the part of the root reserved for the hypervisor.
///
/// Returns `true` if any visit asked for a TLB flush.
pub fn walk<Arch, Driver, Visitor>(
    driver: &Driver,
    frames: &impl FrameMap,
    root: Pfn,
    limit: Va,
    visitor: &mut Visitor,
) -> Result<bool, MmuError>
where
    Arch: Architecture,
    Driver: MmuDriver<Architecture = Arch>,
    Visitor: PageTableVisitor<Arch>,
{
    let last = Va(limit.0.wrapping_sub(1));
    if last >= Arch::FIXADDR_TOP {
        return Err(MmuError::OutOfBounds);
    }

    let mut walker = Walker {
        driver,
        frames,
        visitor,
        last,
        _arch: PhantomData,
    };

    walker.table(Arch::ROOT_LEVEL, root, true)
}
