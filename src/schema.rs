//! The self-description machinery: section 0 holds the schema list, and
//! a string section (named by section 0) holds the NUL-terminated UTF-8
//! schema URLs it references. Schemas are interned per file and
//! addressed by 16-bit local ids.
use crate::containers::Table;
use crate::error::{CrabError, Result};
use crate::io::{ReadData, Reader, WriteData, Writer};

/// The built-in schema describing the reserved purposes.
pub const CRAB_SCHEMA_URL: &str = "https://o11c.github.io/crab/schema.html";

/// Bit split of a [`SchemaRef`]: the low bits carry the string length,
/// the high bits its start offset.
pub const STRING_SIZE_BITS: u32 = 8;

/// A URL and its NUL must be shorter than this.
pub const MAX_STRING_BYTES: usize = 1 << STRING_SIZE_BITS;

/// A string section must stay smaller than this for its offsets to pack.
pub const MAX_STRING_SECTION: usize = 1 << (32 - STRING_SIZE_BITS);

/// Purpose codes reserved by the built-in schema. Every other value is
/// defined by whatever schema the section carries.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub enum Purpose {
    /// Usually absent from files, but left behind as a placeholder when
    /// a section is wiped, so relative offsets elsewhere stay valid.
    #[default]
    Error,
    /// A plain sequence of bytes.
    Raw,
    /// Data that should only be referred to from other sections.
    Supplementary,
    /// The schema list. Always used for section 0.
    Schema,
    /// Textual forms of "purpose" for a schema; see [`PurposeNames`].
    /// This need not exist, and there may be more than one (e.g. after
    /// merges).
    PurposeNames,
    /// Schema-defined purpose.
    Other(u16),
}

impl Purpose {
    pub fn from_u16(purpose: u16) -> Self {
        match purpose {
            0 => Self::Error,
            1 => Self::Raw,
            2 => Self::Supplementary,
            3 => Self::Schema,
            4 => Self::PurposeNames,
            n => Self::Other(n),
        }
    }

    pub fn to_u16(&self) -> u16 {
        match self {
            Self::Error => 0,
            Self::Raw => 1,
            Self::Supplementary => 2,
            Self::Schema => 3,
            Self::PurposeNames => 4,
            Self::Other(n) => *n,
        }
    }
}

/// Packed reference to a string-section byte range:
/// `start << STRING_SIZE_BITS | length`. The length does not count the
/// NUL terminator, which sits at [`SchemaRef::end`].
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct SchemaRef(pub u32);

impl SchemaRef {
    /// The caller has already bounds-checked `start` and `len` against
    /// [`MAX_STRING_SECTION`] and [`MAX_STRING_BYTES`].
    pub const fn pack(start: usize, len: usize) -> Self {
        Self(((start as u32) << STRING_SIZE_BITS) | len as u32)
    }

    pub const fn start(self) -> usize {
        (self.0 >> STRING_SIZE_BITS) as usize
    }

    pub const fn len(self) -> usize {
        (self.0 & ((1 << STRING_SIZE_BITS) - 1)) as usize
    }

    /// One past the last string byte; where the NUL lives.
    pub const fn end(self) -> usize {
        self.start() + self.len()
    }
}

impl ReadData for SchemaRef {
    fn read(reader: &mut impl Reader) -> Result<Self> {
        reader.read().map(Self)
    }
}

impl WriteData for SchemaRef {
    fn write_to(self, writer: &mut impl Writer) -> Result<()> {
        writer.write(self.0)
    }
}

/// One schema-list entry of section 0.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct SchemaEntry {
    pub url: SchemaRef,
    pub reserved: u32,
}

impl SchemaEntry {
    pub const SIZE: usize = 8;
}

impl ReadData for SchemaEntry {
    fn read(reader: &mut impl Reader) -> Result<Self> {
        Ok(Self {
            url: reader.read()?,
            reserved: reader.read()?,
        })
    }
}

impl WriteData for &SchemaEntry {
    fn write_to(self, writer: &mut impl Writer) -> Result<()> {
        writer.write(self.url)?;
        writer.write(self.reserved)?;
        Ok(())
    }
}

/// The payload of section 0 (purpose [`Purpose::Schema`]).
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct SchemaTable {
    /// Index of the string section, relative to section 0's own index.
    pub string_section: u32,
    pub reserved: u16,
    pub entries: Table<SchemaEntry>,
}

impl SchemaTable {
    /// Bytes before the first entry.
    pub const FIXED_SIZE: usize = 8;

    /// Decodes a schema-section payload. The payload size must agree
    /// exactly with the entry count it declares.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = bytes;
        let string_section = reader.read()?;
        let reserved = reader.read()?;
        let num_schemas: u16 = reader.read()?;
        if bytes.len() != Self::FIXED_SIZE + num_schemas as usize * SchemaEntry::SIZE {
            return Err(CrabError::bad_format("<file format>"));
        }
        let entries = Table::new_linear(&mut reader, num_schemas as usize)?;
        Ok(Self {
            string_section,
            reserved,
            entries,
        })
    }

    /// The encoded payload size.
    pub fn size(&self) -> usize {
        Self::FIXED_SIZE + self.entries.len() * SchemaEntry::SIZE
    }
}

impl WriteData for &SchemaTable {
    fn write_to(self, writer: &mut impl Writer) -> Result<()> {
        writer.write(self.string_section)?;
        writer.write(self.reserved)?;
        writer.write(self.entries.len() as u16)?;
        for entry in self.entries.iter() {
            writer.write(entry)?;
        }
        Ok(())
    }
}

/// The payload of a [`Purpose::PurposeNames`] section: textual names
/// for a schema's purpose codes. Deliberately free of schema indices,
/// so files can be merged without rewriting these sections.
#[derive(Default, Clone, Debug, PartialEq, Eq)]
pub struct PurposeNames {
    /// Index of the string section, relative to this section's index.
    pub string_section: u32,
    /// The schema these names belong to.
    pub schema_url: SchemaRef,
    pub num_supplements: u32,
    pub reserved: u16,
    pub entries: Table<PurposeNameEntry>,
}

/// One name entry: a packed string reference for the purpose's text.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub struct PurposeNameEntry {
    pub name: SchemaRef,
    pub reserved: u32,
}

impl PurposeNameEntry {
    pub const SIZE: usize = 8;
}

impl PurposeNames {
    pub const FIXED_SIZE: usize = 16;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = bytes;
        let string_section = reader.read()?;
        let schema_url = reader.read()?;
        let num_supplements = reader.read()?;
        let reserved = reader.read()?;
        let num_purposes: u16 = reader.read()?;
        if bytes.len() != Self::FIXED_SIZE + num_purposes as usize * PurposeNameEntry::SIZE {
            return Err(CrabError::bad_format("<file format>"));
        }
        let entries = Table::new_linear(&mut reader, num_purposes as usize)?;
        Ok(Self {
            string_section,
            schema_url,
            num_supplements,
            reserved,
            entries,
        })
    }
}

impl ReadData for PurposeNameEntry {
    fn read(reader: &mut impl Reader) -> Result<Self> {
        Ok(Self {
            name: reader.read()?,
            reserved: reader.read()?,
        })
    }
}

impl WriteData for &PurposeNames {
    fn write_to(self, writer: &mut impl Writer) -> Result<()> {
        writer.write(self.string_section)?;
        writer.write(self.schema_url)?;
        writer.write(self.num_supplements)?;
        writer.write(self.reserved)?;
        writer.write(self.entries.len() as u16)?;
        for entry in self.entries.iter() {
            writer.write(entry.name)?;
            writer.write(entry.reserved)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_purposes_round_trip() {
        for code in 0..6u16 {
            assert_eq!(Purpose::from_u16(code).to_u16(), code);
        }
        assert_eq!(Purpose::from_u16(3), Purpose::Schema);
        assert_eq!(Purpose::Other(700).to_u16(), 700);
    }

    #[test]
    fn schema_ref_packs_start_and_length() {
        let r = SchemaRef::pack(40, 21);
        assert_eq!(r.0, 40 << STRING_SIZE_BITS | 21);
        assert_eq!(r.start(), 40);
        assert_eq!(r.len(), 21);
        assert_eq!(r.end(), 61);
    }

    #[test]
    fn schema_table_round_trips() {
        let mut table = SchemaTable {
            string_section: 1,
            reserved: 0,
            entries: Table::default(),
        };
        table.entries.push(SchemaEntry {
            url: SchemaRef::pack(0, CRAB_SCHEMA_URL.len()),
            reserved: 0,
        });

        let mut payload = Vec::new();
        (&table).write_to(&mut payload).unwrap();
        assert_eq!(payload.len(), 16);
        assert_eq!(payload.len(), table.size());
        // string_section, reserved, num_schemas
        assert_eq!(&payload[..4], &1u32.to_be_bytes());
        assert_eq!(&payload[6..8], &1u16.to_be_bytes());

        assert_eq!(SchemaTable::parse(&payload).unwrap(), table);
    }

    #[test]
    fn schema_table_size_must_match_its_count() {
        let mut payload = Vec::new();
        let table = SchemaTable::default();
        (&table).write_to(&mut payload).unwrap();
        payload.extend_from_slice(&[0; 4]);

        let err = SchemaTable::parse(&payload).unwrap_err();
        assert_eq!(err.tag(), "<file format>");
    }

    #[test]
    fn purpose_names_round_trip() {
        let mut names = PurposeNames {
            string_section: 2,
            schema_url: SchemaRef::pack(0, 39),
            num_supplements: 0,
            reserved: 0,
            entries: Table::default(),
        };
        names.entries.push(PurposeNameEntry {
            name: SchemaRef::pack(40, 5),
            reserved: 0,
        });
        names.entries.push(PurposeNameEntry {
            name: SchemaRef::pack(46, 3),
            reserved: 0,
        });

        let mut payload = Vec::new();
        (&names).write_to(&mut payload).unwrap();
        assert_eq!(payload.len(), PurposeNames::FIXED_SIZE + 2 * 8);
        assert_eq!(PurposeNames::parse(&payload).unwrap(), names);
    }
}
