//! The page table safety rule the hypervisor enforces.
//!
//! A table is validated while it is pinned or loaded as a base pointer on
//! some vCPU. Every frame reachable as a table from a validated table must
//! not be mapped writable by any validated leaf entry. Frames above the
//! high memory boundary have no permanent guest mapping and are exempt.

use std::collections::HashSet;

use indexmap::IndexSet;
use pvmmu_arch_amd64::{Amd64, PageTableEntry, PageTableLevel};
use pvmmu_core::{Mfn, PinLevel, TableEntry as _};
use zerocopy::IntoBytes as _;

use crate::{Error, machine::Machine};

#[derive(Default)]
pub(crate) struct Analysis {
    /// Frames used as tables by validated tables.
    pub(crate) tables: IndexSet<Mfn>,

    /// Frames mapped writable by validated leaf entries.
    pub(crate) writable: HashSet<Mfn>,

    /// Frames mapped by validated leaf entries.
    pub(crate) mapped: HashSet<Mfn>,
}

fn table_level(level: PinLevel) -> PageTableLevel {
    match level {
        PinLevel::L1 => PageTableLevel::Pt,
        PinLevel::L2 => PageTableLevel::Pd,
        PinLevel::L3 => PageTableLevel::Pdpt,
        PinLevel::L4 => PageTableLevel::Pml4,
    }
}

pub(crate) fn analyze(machine: &Machine) -> Analysis {
    let pinned = machine
        .pinned
        .iter()
        .map(|(&mfn, &level)| (mfn, table_level(level)));

    let loaded = machine
        .baseptr
        .iter()
        .chain(machine.user_baseptr.iter())
        .flatten()
        .map(|&mfn| (mfn, PageTableLevel::Pml4));

    let mut analysis = Analysis::default();
    let mut visited = HashSet::new();

    for (mfn, level) in pinned.chain(loaded) {
        visit(machine, mfn, level, &mut analysis, &mut visited);
    }

    analysis
}

fn visit(
    machine: &Machine,
    mfn: Mfn,
    level: PageTableLevel,
    analysis: &mut Analysis,
    visited: &mut HashSet<(Mfn, PageTableLevel)>,
) {
    if !visited.insert((mfn, level)) {
        return;
    }

    analysis.tables.insert(mfn);

    let Some(table) = machine
        .frames
        .get(&mfn)
        .and_then(|frame| PageTableEntry::table(frame.as_bytes()))
    else {
        return;
    };

    let hole = match level {
        PageTableLevel::Pml4 => Amd64::HYPERVISOR_SLOT_START..Amd64::HYPERVISOR_SLOT_END,
        _ => 0..0,
    };

    for (index, entry) in table.iter().enumerate() {
        if hole.contains(&index) || !entry.present() {
            continue;
        }

        let target = Mfn(entry.frame());
        match level.next() {
            Some(next) if !entry.large() => visit(machine, target, next, analysis, visited),
            _ => {
                analysis.mapped.insert(target);
                if entry.writable() {
                    analysis.writable.insert(target);
                }
            }
        }
    }
}

/// Checks the safety rule over the whole machine.
pub(crate) fn check(machine: &Machine) -> Result<(), Error> {
    let analysis = analyze(machine);

    match analysis
        .tables
        .iter()
        .find(|mfn| analysis.writable.contains(*mfn) && !machine.is_highmem(**mfn))
    {
        Some(&mfn) => Err(Error::WritableTable(mfn)),
        None => Ok(()),
    }
}
