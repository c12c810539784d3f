mod address;
mod cpumask;
mod info;
pub(crate) mod macros;

pub use self::{
    address::{DomId, Maddr, Mfn, Pfn, Va, VcpuId},
    cpumask::CpuMask,
    info::MmuInfo,
};
