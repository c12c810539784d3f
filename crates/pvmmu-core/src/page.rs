use std::{ops::Deref, sync::Arc};

use zerocopy::FromBytes as _;

/// A page of guest memory read through the driver.
#[derive(Clone)]
pub struct MappedPage(Arc<Box<dyn Deref<Target = [u8]> + Send + Sync>>);

impl MappedPage {
    /// Creates a new mapped page.
    pub fn new<T>(inner: T) -> Self
    where
        T: Deref<Target = [u8]> + Send + Sync + 'static,
    {
        Self(Arc::new(Box::new(inner)))
    }

    /// Reads the raw 64-bit entry at `index`.
    ///
    /// Indices past the end of the page read as an empty entry.
    pub fn entry(&self, index: usize) -> u64 {
        let offset = index * size_of::<u64>();
        self.get(offset..offset + size_of::<u64>())
            .and_then(|bytes| u64::read_from_bytes(bytes).ok())
            .unwrap_or(0)
    }
}

impl Deref for MappedPage {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for MappedPage {
    fn as_ref(&self) -> &[u8] {
        self.deref()
    }
}
