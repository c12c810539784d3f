use serde::{Deserialize, Serialize};

use crate::{Mfn, Pfn};

/// Start-of-day information the hypervisor hands to the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MmuInfo {
    /// The size of a page in bytes.
    pub page_size: u64,

    /// The shift value to convert a page number to a page address.
    pub page_shift: u64,

    /// The number of pages initially given to the guest.
    pub nr_pages: u64,

    /// The boot frame list: machine frame of every initial physical frame.
    pub mfn_list: Vec<Mfn>,

    /// The first physical frame holding the boot frame list.
    pub mfn_list_frame: Pfn,

    /// The physical frame of the initial kernel root table.
    pub kernel_root: Pfn,

    /// The number of virtual CPUs.
    pub vcpus: u16,

    /// Whether the hypervisor translates physical frames itself.
    pub auto_translated: bool,

    /// Whether the guest is the privileged initial domain.
    pub initial_domain: bool,
}
