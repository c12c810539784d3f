use serde::{Deserialize, Serialize};

use crate::VcpuId;

/// A set of virtual CPUs.
///
/// Limited to 64 vCPUs, which matches the width of the vCPU bitmap the
/// hypervisor accepts in multi-CPU TLB operations.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CpuMask(pub u64);

impl CpuMask {
    /// The maximum number of vCPUs a mask can describe.
    pub const CAPACITY: usize = u64::BITS as usize;

    /// Creates an empty mask.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates a mask of the first `count` vCPUs.
    pub fn first(count: usize) -> Self {
        match count {
            0 => Self(0),
            count if count >= Self::CAPACITY => Self(!0),
            count => Self((1 << count) - 1),
        }
    }

    /// Checks if no vCPU is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Checks if the given vCPU is set.
    pub fn contains(self, vcpu: VcpuId) -> bool {
        vcpu.index() < Self::CAPACITY && self.0 & (1 << vcpu.index()) != 0
    }

    /// Adds a vCPU to the mask.
    pub fn insert(&mut self, vcpu: VcpuId) {
        if vcpu.index() < Self::CAPACITY {
            self.0 |= 1 << vcpu.index();
        }
    }

    /// Removes a vCPU from the mask.
    pub fn remove(&mut self, vcpu: VcpuId) {
        if vcpu.index() < Self::CAPACITY {
            self.0 &= !(1 << vcpu.index());
        }
    }

    /// Returns the intersection of two masks.
    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Iterates over the vCPUs in the mask.
    pub fn iter(self) -> impl Iterator<Item = VcpuId> {
        (0..Self::CAPACITY)
            .filter(move |index| self.0 & (1 << index) != 0)
            .map(|index| VcpuId(index as u16))
    }
}

impl FromIterator<VcpuId> for CpuMask {
    fn from_iter<T: IntoIterator<Item = VcpuId>>(iter: T) -> Self {
        let mut mask = Self::empty();
        for vcpu in iter {
            mask.insert(vcpu);
        }
        mask
    }
}

impl std::fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_set().entries(self.iter().map(|vcpu| vcpu.0)).finish()
    }
}
