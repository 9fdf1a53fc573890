use core::ops::Deref;
use core::ops::DerefMut;

use crate::error::Result;
use crate::io::ReadData;
use crate::io::Reader;

/// A dense array of fixed-layout records, decoded in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table<T>(pub Vec<T>);

impl<T> Table<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }
}

impl<T: ReadData> Table<T> {
    pub fn new_linear(data_ptr: &mut &[u8], items_count: usize) -> Result<Self> {
        let mut items = Self::with_capacity(items_count);
        for _ in 0..items.capacity() {
            items.push(data_ptr.read()?);
        }
        Ok(items)
    }
}

impl<T> Deref for Table<T> {
    type Target = Vec<T>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> DerefMut for Table<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
