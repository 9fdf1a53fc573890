//! All multi-byte integers in a CRAB image are big-endian, and are moved
//! through these traits field by field; mapped memory is never
//! reinterpreted as a record.
pub mod stream;

use crate::error::{CrabError, Result};

pub trait Reader: Sized {
    fn read_slice(&mut self, size: usize) -> Result<&[u8]>;
    #[inline(always)]
    fn read<T: ReadData>(&mut self) -> Result<T> {
        T::read(self)
    }
}

pub trait Writer: Sized {
    fn write_slice(&mut self, data: &[u8]) -> Result<()>;
    #[inline(always)]
    fn write<T: WriteData>(&mut self, value: T) -> Result<()> {
        T::write_to(value, self)
    }
}

impl<'a> Reader for &'a [u8] {
    #[inline(always)]
    fn read_slice(&mut self, size: usize) -> Result<&'a [u8]> {
        if self.len() < size {
            return Err(CrabError::not_enough_data(size));
        }
        let (data, remaining) = self.split_at(size);
        *self = remaining;
        Ok(data)
    }
}

impl<'a> Writer for &'a mut [u8] {
    #[inline(always)]
    fn write_slice(&mut self, data: &[u8]) -> Result<()> {
        if self.len() < data.len() {
            return Err(CrabError::not_enough_space(data.len()));
        }
        let this = core::mem::take(self);
        let (write_buffer, remaining) = this.split_at_mut(data.len());
        *self = remaining;
        write_buffer.copy_from_slice(data);
        Ok(())
    }
}

impl Writer for Vec<u8> {
    #[inline(always)]
    fn write_slice(&mut self, data: &[u8]) -> Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

pub trait ReadData: Sized {
    fn read(reader: &mut impl Reader) -> Result<Self>;
}

pub trait WriteData {
    fn write_to(self, writer: &mut impl Writer) -> Result<()>;
}

impl<const N: usize> ReadData for [u8; N] {
    fn read(reader: &mut impl Reader) -> Result<Self> {
        reader
            .read_slice(N)?
            .try_into()
            .map_err(|_| CrabError::not_enough_data(N))
    }
}

impl<const N: usize> WriteData for [u8; N] {
    fn write_to(self, writer: &mut impl Writer) -> Result<()> {
        writer.write_slice(&self)
    }
}

impl ReadData for u8 {
    fn read(reader: &mut impl Reader) -> Result<Self> {
        reader.read_slice(1).map(|m| m[0])
    }
}

impl WriteData for u8 {
    fn write_to(self, writer: &mut impl Writer) -> Result<()> {
        writer.write_slice(&[self])
    }
}

macro_rules! impl_read_write_data {
    ($($t:ty),+) => {
        $(
            impl ReadData for $t {
                #[inline(always)]
                fn read(reader: &mut impl Reader) -> Result<$t> {
                    reader.read().map(<$t>::from_be_bytes)
                }
            }

            impl WriteData for $t {
                #[inline(always)]
                fn write_to(self, writer: &mut impl Writer) -> Result<()> {
                    writer.write(self.to_be_bytes())
                }
            }
         )*
    };
}

impl_read_write_data! {
    u16,
    u32,
    u64
}
