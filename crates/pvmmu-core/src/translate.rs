//! Conversion of page table entries between physical and machine form.
//!
//! The guest builds entries that name physical frames; the hypervisor only
//! accepts entries naming machine frames. Every entry passes through
//! [`logical_to_frame`] on its way into a table and through
//! [`frame_to_logical`] on its way out. Non-present entries carry no frame
//! and pass through both unchanged.

use crate::{Mfn, Pfn, TableEntry};

/// A bidirectional mapping between physical and machine frames.
pub trait FrameMap {
    /// Returns the machine frame backing `pfn`, or [`Mfn::INVALID`].
    fn pfn_to_mfn(&self, pfn: Pfn) -> Mfn;

    /// Returns the physical frame backed by `mfn`, or [`Pfn::INVALID`] if
    /// the frame does not belong to the guest.
    fn mfn_to_pfn(&self, mfn: Mfn) -> Pfn;
}

/// Converts an entry naming a machine frame into one naming the physical
/// frame.
pub fn frame_to_logical<Entry>(map: &impl FrameMap, entry: Entry) -> Entry
where
    Entry: TableEntry,
{
    if !entry.present() {
        return entry;
    }

    let pfn = map.mfn_to_pfn(Mfn(entry.frame()));
    Entry::from_parts(pfn.0, entry.flags())
}

/// Converts an entry naming a physical frame into one naming the machine
/// frame.
///
/// A physical frame with no machine frame behind it produces an empty
/// entry: frame and flags are both dropped, so the result is not present
/// and the original frame cannot be recovered from it.
pub fn logical_to_frame<Entry>(map: &impl FrameMap, entry: Entry) -> Entry
where
    Entry: TableEntry,
{
    if !entry.present() {
        return entry;
    }

    let pfn = Pfn(entry.frame());
    let mfn = map.pfn_to_mfn(pfn);
    if !mfn.is_valid() {
        tracing::warn!(%pfn, raw = entry.raw(), "no machine frame, entry dropped");
        return Entry::from_parts(0, 0);
    }

    Entry::from_parts(mfn.0, entry.flags())
}

/// Returns an entry whose frame is already a machine frame, unchanged.
pub fn iomap<Entry>(entry: Entry) -> Entry
where
    Entry: TableEntry,
{
    Entry::from_parts(entry.frame(), entry.flags())
}
