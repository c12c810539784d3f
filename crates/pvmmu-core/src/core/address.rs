use super::macros::newtype;

newtype! {
    /// A guest physical frame number.
    Pfn(u64), "{:#x}"
}

newtype! {
    /// A machine frame number.
    Mfn(u64), "{:#x}"
}

newtype! {
    /// A machine address.
    Maddr(u64), "{:#x}"
}

newtype! {
    /// A guest virtual address.
    Va(u64), "{:#x}"
}

newtype! {
    /// A virtual CPU identifier.
    VcpuId(u16), "{}"
}

newtype! {
    /// A domain identifier.
    DomId(u16), "{}"
}

impl Pfn {
    /// Sentinel for a physical frame with no known owner.
    pub const INVALID: Self = Self(!0);

    /// Checks if the frame number is not the [`INVALID`](Self::INVALID)
    /// sentinel.
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Mfn {
    /// Sentinel for "no machine frame backs this physical frame".
    pub const INVALID: Self = Self(!0);

    /// Checks if the frame number is not the [`INVALID`](Self::INVALID)
    /// sentinel.
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl Va {
    /// Checks if the virtual address is NULL.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl VcpuId {
    /// Returns the vCPU number as an index.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl DomId {
    /// The calling domain.
    pub const SELF: Self = Self(0x7ff0);
}
