//! The fixed on-disk layout: a 24-byte file header, a dense table of
//! 16-byte section-info entries, then each section's payload zero-padded
//! to the next 8-byte boundary. The declared size in the header must
//! equal the physical file length.
use crate::error::{CrabError, Result};
use crate::io::{ReadData, Reader, WriteData, Writer};

/// `0x83 'C' 'R' 'B' CR LF ^Z LF`.
pub const MAGIC: [u8; 8] = *b"\x83CRB\r\n\x1a\n";

/// Every payload starts on this boundary and is zero-padded up to it.
pub const ALIGNMENT: u64 = 8;

/// Rounds `n` up to the next payload boundary.
#[inline(always)]
pub const fn pad_to_alignment(n: u64) -> u64 {
    (n + (ALIGNMENT - 1)) & !(ALIGNMENT - 1)
}

/// This is the structure at the beginning of every CRAB file. The
/// section-info table follows immediately; its end is already 8-aligned
/// because each entry is 16 bytes and the fixed part is 24.
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    /// Total file size in bytes, padding included.
    pub size: u64,
    /// Must be zero.
    pub reserved: u32,
    /// Number of section-info entries; at least 1.
    pub num_sections: u32,
}

impl FileHeader {
    /// Bytes before the first section-info entry.
    pub const SIZE: usize = 24;
}

impl ReadData for FileHeader {
    fn read(reader: &mut impl Reader) -> Result<Self> {
        let magic: [u8; 8] = reader.read()?;
        if magic != MAGIC {
            return Err(CrabError::bad_format("<file format>"));
        }
        Ok(Self {
            size: reader.read()?,
            reserved: reader.read()?,
            num_sections: reader.read()?,
        })
    }
}

impl WriteData for &FileHeader {
    fn write_to(self, writer: &mut impl Writer) -> Result<()> {
        writer.write(MAGIC)?;
        writer.write(self.size)?;
        writer.write(self.reserved)?;
        writer.write(self.num_sections)?;
        Ok(())
    }
}

/// One entry of the section-info table.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct SectionInfo {
    /// Payload offset from the start of the file; a multiple of 8.
    pub offset: u64,
    /// Payload size in bytes, padding excluded.
    pub size: u32,
    /// Index into the schema list of section 0.
    pub schema: u16,
    /// Purpose code within that schema.
    pub purpose: u16,
}

impl SectionInfo {
    pub const SIZE: usize = 16;
}

impl ReadData for SectionInfo {
    fn read(reader: &mut impl Reader) -> Result<Self> {
        Ok(Self {
            offset: reader.read()?,
            size: reader.read()?,
            schema: reader.read()?,
            purpose: reader.read()?,
        })
    }
}

impl WriteData for &SectionInfo {
    fn write_to(self, writer: &mut impl Writer) -> Result<()> {
        writer.write(self.offset)?;
        writer.write(self.size)?;
        writer.write(self.schema)?;
        writer.write(self.purpose)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_is_24_bytes() {
        let mut image = Vec::new();
        let header = FileHeader {
            size: 120,
            reserved: 0,
            num_sections: 2,
        };
        (&header).write_to(&mut image).unwrap();
        assert_eq!(image.len(), FileHeader::SIZE);

        let read_back = FileHeader::read(&mut image.as_slice()).unwrap();
        assert_eq!(read_back, header);
    }

    #[test]
    fn header_magic_is_bit_exact() {
        let mut image = Vec::new();
        (&FileHeader::default()).write_to(&mut image).unwrap();
        assert_eq!(&image[..8], &[0x83, b'C', b'R', b'B', 0x0d, 0x0a, 0x1a, 0x0a]);
    }

    #[test]
    fn bad_magic_is_a_format_error() {
        let mut image = Vec::new();
        (&FileHeader::default()).write_to(&mut image).unwrap();
        image[0] = b'X';
        let err = FileHeader::read(&mut image.as_slice()).unwrap_err();
        assert_eq!(err.tag(), "<file format>");
        assert_eq!(err.code(), libc::EINVAL);
    }

    #[test]
    fn section_info_is_16_bytes() {
        let info = SectionInfo {
            offset: 56,
            size: 40,
            schema: 0,
            purpose: 2,
        };
        let mut image = Vec::new();
        (&info).write_to(&mut image).unwrap();
        assert_eq!(image.len(), SectionInfo::SIZE);
        assert_eq!(SectionInfo::read(&mut image.as_slice()).unwrap(), info);
    }

    #[test]
    fn padding_rounds_up_to_eight() {
        assert_eq!(pad_to_alignment(0), 0);
        assert_eq!(pad_to_alignment(1), 8);
        assert_eq!(pad_to_alignment(8), 8);
        assert_eq!(pad_to_alignment(40), 40);
        assert_eq!(pad_to_alignment(41), 48);
    }
}
