use std::ops::Range;
use std::sync::Arc;

use crate::schema::Purpose;

/// Backing storage for a section payload. Payloads of a freshly opened
/// file all borrow from the mapping; edits move the affected section to
/// owned storage, and a `REOPEN` save moves everything back.
#[derive(Debug, Clone, Default)]
pub enum SectionData {
    /// No payload.
    #[default]
    None,
    /// A byte range of the owning file's mapped image.
    Mapped(Range<usize>),
    /// Heap bytes owned by this section, released when replaced or
    /// dropped.
    Owned(Vec<u8>),
    /// Bytes shared with some other owner; never released through this
    /// handle.
    Shared(Arc<[u8]>),
}

impl SectionData {
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Mapped(range) => range.len(),
            Self::Owned(bytes) => bytes.len(),
            Self::Shared(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How `set_section_data` acquires the payload: the copy / own / borrow
/// assignment modes, as types rather than bit flags. An empty source
/// always collapses to [`SectionData::None`].
#[derive(Debug)]
pub enum DataSource<'a> {
    /// Allocate and copy out of the caller's buffer.
    Copied(&'a [u8]),
    /// Take ownership of the buffer.
    Owned(Vec<u8>),
    /// Share bytes that some other owner keeps alive; the engine never
    /// releases them.
    Shared(Arc<[u8]>),
}

/// Payload disposition for section copies.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq)]
pub enum CopyMode {
    /// Deep-copy the payload.
    #[default]
    Copy,
    /// Transfer the payload, leaving the source section empty.
    Own,
    /// Share the payload storage without transferring it.
    Borrow,
}

/// One section: a payload plus its schema id and purpose code. Handles
/// are read-only; mutations go through the owning
/// [`CrabFile`](crate::file::CrabFile), which keeps the schema table
/// consistent.
#[derive(Debug, Default)]
pub struct Section {
    pub(crate) number: u32,
    pub(crate) schema_id: u16,
    pub(crate) purpose: Purpose,
    pub(crate) schema: Option<Range<usize>>,
    pub(crate) data: SectionData,
}

impl Section {
    pub(crate) fn new(
        number: u32,
        schema_id: u16,
        purpose: Purpose,
        schema: Option<Range<usize>>,
        data: SectionData,
    ) -> Self {
        Self {
            number,
            schema_id,
            purpose,
            schema,
            data,
        }
    }

    /// The index of this section within its file. Fixed at creation;
    /// sections are never removed, only wiped.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// The file-local index into section 0's schema list.
    pub fn schema_id(&self) -> u16 {
        self.schema_id
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    /// Payload size in bytes, padding excluded.
    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    /// Where this section's schema URL lives inside the string section,
    /// once resolved. Two sections carrying the same schema resolve to
    /// the same range.
    pub fn schema_ref(&self) -> Option<Range<usize>> {
        self.schema.clone()
    }
}
