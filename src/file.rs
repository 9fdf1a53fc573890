//! The file lifecycle: open and validate an existing image, synthesise a
//! new one, save through a temporary file and an atomic rename, and
//! optionally re-map afterwards so payloads go back to borrowing from
//! the mapping.
use std::fs::{self, File, OpenOptions};
use std::io::BufWriter;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bitflags::bitflags;
use log::debug;
use memmap2::{Mmap, MmapMut, MmapOptions};

use crate::containers::Table;
use crate::error::{CrabError, Result};
use crate::format::{pad_to_alignment, FileHeader, SectionInfo, ALIGNMENT};
use crate::io::stream::StreamWriter;
use crate::io::{ReadData, WriteData, Writer};
use crate::schema::{
    Purpose, SchemaEntry, SchemaRef, SchemaTable, CRAB_SCHEMA_URL, MAX_STRING_BYTES,
    MAX_STRING_SECTION,
};
use crate::section::{CopyMode, DataSource, Section, SectionData};

bitflags! {
    /// Flags accepted by [`CrabFile::open`].
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileFlags: u32 {
        /// Map with writeability, so mapped payloads can be edited in
        /// place through [`CrabFile::section_data_mut`]. The mapping is
        /// private; edits reach disk only through `save`.
        const WRITE = 0x01;
        /// Create a new CRAB file with the given name instead of
        /// opening an existing one. Nothing is written until
        /// [`CrabFile::save`].
        const NEW = 0x02;
        /// Accepted for flag-word compatibility. A failed open reports
        /// its `{tag, code}` pair through `Err` with or without it.
        const ERROR = 0x04;
        /// For all operations on this file, log errors.
        const PERROR = 0x08;
    }
}

bitflags! {
    /// Flags accepted by [`CrabFile::save`].
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SaveFlags: u32 {
        /// After saving, re-map the freshly written file to save
        /// memory. Section indices stay stable, but payloads and
        /// resolved schemas move back into the mapping.
        const REOPEN = 0x01;
    }
}

#[derive(Debug)]
enum Image {
    Ro(Mmap),
    Rw(MmapMut),
}

impl Image {
    fn bytes(&self) -> &[u8] {
        match self {
            Self::Ro(map) => &map[..],
            Self::Rw(map) => &map[..],
        }
    }

    fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Self::Ro(_) => None,
            Self::Rw(map) => Some(&mut map[..]),
        }
    }
}

fn check_payload_size(len: usize) -> Result<()> {
    if len > u32::MAX as usize {
        return Err(CrabError::overflow("<section size>"));
    }
    Ok(())
}

/// An open CRAB container. Owns the section sequence and, for files
/// opened from disk, a `MAP_PRIVATE` mapping of the image that
/// unmodified payloads borrow from. Dropping the handle releases owned
/// payloads and the mapping without saving anything.
#[derive(Debug)]
pub struct CrabFile {
    filename: PathBuf,
    flags: FileFlags,
    image: Option<Image>,
    string_section: u32,
    sections: Vec<Section>,
}

impl CrabFile {
    /// Maps a CRAB file from disk, or synthesises a fresh one when
    /// `flags` contains [`FileFlags::NEW`].
    pub fn open<P: AsRef<Path>>(path: P, flags: FileFlags) -> Result<CrabFile> {
        let mut file = CrabFile {
            filename: path.as_ref().to_path_buf(),
            flags,
            image: None,
            string_section: 0,
            sections: Vec::new(),
        };
        match file.open_partial(true) {
            Ok(()) => Ok(file),
            Err(e) => Err(file.report(e)),
        }
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn flags(&self) -> FileFlags {
        self.flags
    }

    /// Current number of valid section indices.
    pub fn num_sections(&self) -> u32 {
        self.sections.len() as u32
    }

    /// Gets a section by index.
    pub fn section(&self, index: u32) -> Result<&Section> {
        match self.sections.get(index as usize) {
            Some(section) => Ok(section),
            None => Err(self.report(CrabError::bad_index(index, self.num_sections()))),
        }
    }

    /// The section's payload bytes.
    pub fn section_data(&self, index: u32) -> Result<&[u8]> {
        let i = self
            .check_index(index)
            .map_err(|e| self.report(e))?;
        Ok(self.payload(i))
    }

    /// Writable payload access: owned payloads always, mapped ones only
    /// when the file was opened with [`FileFlags::WRITE`].
    pub fn section_data_mut(&mut self, index: u32) -> Result<&mut [u8]> {
        let i = match self.check_index(index) {
            Ok(i) => i,
            Err(e) => return Err(self.report(e)),
        };
        let writable = matches!(self.image, Some(Image::Rw(_)));
        match &self.sections[i].data {
            SectionData::Mapped(_) if !writable => {
                return Err(self.report(CrabError::read_only(index)))
            }
            SectionData::Shared(_) => return Err(self.report(CrabError::read_only(index))),
            _ => {}
        }
        match &mut self.sections[i].data {
            SectionData::None => Ok(&mut []),
            SectionData::Owned(bytes) => Ok(bytes),
            SectionData::Mapped(range) => {
                let range = range.clone();
                let image = self.image.as_mut().expect("mapped payload without a mapping");
                Ok(&mut image.bytes_mut().expect("writable mapping")[range])
            }
            SectionData::Shared(_) => unreachable!(),
        }
    }

    /// The section's resolved schema URL.
    pub fn section_schema(&self, index: u32) -> Result<&str> {
        let i = self
            .check_index(index)
            .map_err(|e| self.report(e))?;
        self.section_schema_at(i).map_err(|e| self.report(e))
    }

    /// Adds a new, empty section carrying the built-in schema and
    /// purpose [`Purpose::Error`]. Returns its index.
    pub fn add_section(&mut self) -> Result<u32> {
        let result = self.add_section_inner();
        result.map_err(|e| self.report(e))
    }

    /// Sets the schema and purpose for a section, interning the URL in
    /// the file's schema table.
    pub fn set_schema_and_purpose(&mut self, index: u32, url: &str, purpose: Purpose) -> Result<()> {
        let result = self.set_schema_and_purpose_inner(index, url, purpose);
        result.map_err(|e| self.report(e))
    }

    /// Replaces a section's payload.
    pub fn set_section_data(&mut self, index: u32, source: DataSource<'_>) -> Result<()> {
        let result = self.set_section_data_inner(index, source);
        result.map_err(|e| self.report(e))
    }

    /// Copies schema, purpose, and payload from another section of this
    /// file, re-interning the schema URL for the destination.
    pub fn copy_section(&mut self, dst: u32, mode: CopyMode, src: u32) -> Result<()> {
        let result = self.copy_section_inner(dst, mode, src);
        result.map_err(|e| self.report(e))
    }

    /// Copies schema, purpose, and payload from a section of another
    /// file. The schema URL is re-interned in this file's table, which
    /// is what makes cross-file moves work.
    pub fn copy_section_from(
        &mut self,
        dst: u32,
        mode: CopyMode,
        other: &mut CrabFile,
        src: u32,
    ) -> Result<()> {
        let result = self.copy_section_from_inner(dst, mode, other, src);
        result.map_err(|e| self.report(e))
    }

    /// Writes the image to `<name>.new`, then renames it over the
    /// original. The rename is the atomicity point: any later opener
    /// sees either the old file or the new one, never a torn write.
    pub fn save(&mut self, flags: SaveFlags) -> Result<()> {
        let result = self.save_inner(flags);
        result.map_err(|e| self.report(e))
    }

    fn report(&self, err: CrabError) -> CrabError {
        if self.flags.contains(FileFlags::PERROR) {
            log::error!("{}", err);
        }
        err
    }

    fn check_index(&self, index: u32) -> Result<usize> {
        if (index as usize) < self.sections.len() {
            Ok(index as usize)
        } else {
            Err(CrabError::bad_index(index, self.num_sections()))
        }
    }

    fn payload(&self, index: usize) -> &[u8] {
        match &self.sections[index].data {
            SectionData::None => &[],
            SectionData::Mapped(range) => {
                let image = self.image.as_ref().expect("mapped payload without a mapping");
                &image.bytes()[range.clone()]
            }
            SectionData::Owned(bytes) => bytes,
            SectionData::Shared(bytes) => bytes,
        }
    }

    fn section_schema_at(&self, index: usize) -> Result<&str> {
        let range = self.sections[index]
            .schema
            .clone()
            .ok_or_else(|| CrabError::bad_format("<file format>"))?;
        let bytes = &self.payload(self.string_section as usize)[range];
        core::str::from_utf8(bytes).map_err(|_| CrabError::bad_format("<file format>"))
    }

    fn open_partial(&mut self, all: bool) -> Result<()> {
        if self.flags.contains(FileFlags::NEW) {
            assert!(all, "NEW flag during a reopen");
            self.flags.remove(FileFlags::NEW);

            let url = CRAB_SCHEMA_URL.as_bytes();
            let mut string_payload = Vec::with_capacity(url.len() + 1);
            string_payload.extend_from_slice(url);
            string_payload.push(0);

            let mut table = SchemaTable {
                string_section: 1,
                reserved: 0,
                entries: Table::default(),
            };
            table.entries.push(SchemaEntry {
                url: SchemaRef::pack(0, url.len()),
                reserved: 0,
            });
            let mut schema_payload = Vec::with_capacity(table.size());
            (&table).write_to(&mut schema_payload)?;

            self.string_section = 1;
            self.sections = vec![
                Section::new(
                    0,
                    0,
                    Purpose::Schema,
                    Some(0..url.len()),
                    SectionData::Owned(schema_payload),
                ),
                Section::new(
                    1,
                    0,
                    Purpose::Supplementary,
                    Some(0..url.len()),
                    SectionData::Owned(string_payload),
                ),
            ];
            debug!("synthesised a fresh image for {}", self.filename.display());
            return Ok(());
        }

        let fd = OpenOptions::new()
            .read(true)
            .write(self.flags.contains(FileFlags::WRITE))
            .open(&self.filename)
            .map_err(|e| CrabError::io("open", e))?;
        let metadata = fd.metadata().map_err(|e| CrabError::io("fstat", e))?;
        let file_size = metadata.len();
        usize::try_from(file_size).map_err(|_| CrabError::overflow("<file size>"))?;
        if file_size < (FileHeader::SIZE + SectionInfo::SIZE) as u64 {
            return Err(CrabError::bad_format("<file format>"));
        }

        let image = if self.flags.contains(FileFlags::WRITE) {
            let map = unsafe { MmapOptions::new().map_copy(&fd) }
                .map_err(|e| CrabError::io("mmap", e))?;
            Image::Rw(map)
        } else {
            let map = unsafe { MmapOptions::new().map_copy_read_only(&fd) }
                .map_err(|e| CrabError::io("mmap", e))?;
            Image::Ro(map)
        };

        let mut reader = image.bytes();
        let header = FileHeader::read(&mut reader)?;
        if header.size != file_size {
            return Err(CrabError::bad_format("<file format>"));
        }
        if header.num_sections < 1 {
            return Err(CrabError::bad_format("<file format>"));
        }
        let num_sections = header.num_sections;
        if file_size < FileHeader::SIZE as u64 + num_sections as u64 * SectionInfo::SIZE as u64 {
            return Err(CrabError::bad_format("<file format>"));
        }
        let infos = Table::<SectionInfo>::new_linear(&mut reader, num_sections as usize)?;

        if !all && self.sections.len() != num_sections as usize {
            panic!(
                "section count changed across a reopen: {} != {}",
                self.sections.len(),
                num_sections
            );
        }

        let mut sections = Vec::with_capacity(if all { num_sections as usize } else { 0 });
        for (i, info) in infos.iter().enumerate() {
            let end = info
                .offset
                .checked_add(info.size as u64)
                .ok_or_else(|| CrabError::bad_format("<file format>"))?;
            if end > file_size {
                return Err(CrabError::bad_format("<file format>"));
            }
            let data = SectionData::Mapped(info.offset as usize..end as usize);
            if all {
                sections.push(Section::new(
                    i as u32,
                    info.schema,
                    Purpose::from_u16(info.purpose),
                    None,
                    data,
                ));
            } else {
                let section = &mut self.sections[i];
                section.schema_id = info.schema;
                section.purpose = Purpose::from_u16(info.purpose);
                section.schema = None;
                section.data = data;
            }
        }
        if all {
            self.sections = sections;
        }
        self.image = Some(image);

        let table = SchemaTable::parse(self.payload(0))?;
        if table.string_section as u64 >= num_sections as u64 {
            return Err(CrabError::bad_format("<file format>"));
        }
        self.string_section = table.string_section;
        if !self.resolve_schemas() {
            return Err(CrabError::bad_format("<file format>"));
        }
        debug!(
            "mapped {} sections from {}",
            num_sections,
            self.filename.display()
        );
        Ok(())
    }

    /// Walks every section and records where its schema URL lives in
    /// the string section. Leaves the offenders (and everything after
    /// the first one) unresolved on any schema-table inconsistency.
    fn resolve_schemas(&mut self) -> bool {
        let table = match SchemaTable::parse(self.payload(0)) {
            Ok(table) => table,
            Err(_) => {
                for section in &mut self.sections {
                    section.schema = None;
                }
                return false;
            }
        };
        let mut okay = true;
        let mut resolved: Vec<Option<Range<usize>>> = Vec::with_capacity(self.sections.len());
        {
            let string_bytes = self.payload(self.string_section as usize);
            for section in &self.sections {
                if !okay {
                    resolved.push(None);
                    continue;
                }
                let entry = match table.entries.get(section.schema_id as usize) {
                    Some(entry) => *entry,
                    None => {
                        okay = false;
                        resolved.push(None);
                        continue;
                    }
                };
                let (start, end) = (entry.url.start(), entry.url.end());
                if end >= string_bytes.len()
                    || string_bytes[end] != 0
                    || core::str::from_utf8(&string_bytes[start..end]).is_err()
                {
                    okay = false;
                    resolved.push(None);
                    continue;
                }
                resolved.push(Some(start..end));
            }
        }
        for (section, schema) in self.sections.iter_mut().zip(resolved) {
            section.schema = schema;
        }
        okay
    }

    /// Interns a URL in the schema table, returning its local id and
    /// its byte range within the string section. All overflow checks
    /// run before anything is mutated, so a failed intern leaves the
    /// file untouched.
    fn add_schema(&mut self, url: &str) -> Result<(u16, Range<usize>)> {
        let table = SchemaTable::parse(self.payload(0))?;
        let string_index = self.string_section as usize;

        {
            let string_bytes = self.payload(string_index);
            for (id, entry) in table.entries.iter().enumerate() {
                let (start, end) = (entry.url.start(), entry.url.end());
                if string_bytes.get(start..end) == Some(url.as_bytes()) {
                    return Ok((id as u16, start..end));
                }
            }
        }

        let id = table.entries.len();
        if id == u16::MAX as usize {
            return Err(CrabError::overflow("<num schemas>"));
        }
        if url.as_bytes().contains(&0) {
            return Err(CrabError::bad_format("<string bytes>"));
        }
        let len1 = url.len() + 1;
        if len1 >= MAX_STRING_BYTES {
            return Err(CrabError::overflow("<string bytes>"));
        }
        let old_string_size = self.payload(string_index).len();
        if old_string_size + len1 >= MAX_STRING_SECTION {
            return Err(CrabError::overflow("<string bytes>"));
        }

        let string_payload = self.payload_to_owned(string_index);
        string_payload.extend_from_slice(url.as_bytes());
        string_payload.push(0);

        let mut table = table;
        table.entries.push(SchemaEntry {
            url: SchemaRef::pack(old_string_size, url.len()),
            reserved: 0,
        });
        let mut schema_payload = Vec::with_capacity(table.size());
        (&table).write_to(&mut schema_payload)?;
        *self.payload_to_owned(0) = schema_payload;

        let resolved = self.resolve_schemas();
        debug_assert!(resolved);
        debug!("interned schema {:?} as local id {}", url, id);
        Ok((id as u16, old_string_size..old_string_size + url.len()))
    }

    /// Own-or-copy: a mapped or shared payload is first copied to the
    /// heap so it can grow.
    fn payload_to_owned(&mut self, index: usize) -> &mut Vec<u8> {
        if !matches!(self.sections[index].data, SectionData::Owned(_)) {
            let copied = self.payload(index).to_vec();
            self.sections[index].data = SectionData::Owned(copied);
        }
        match &mut self.sections[index].data {
            SectionData::Owned(bytes) => bytes,
            _ => unreachable!(),
        }
    }

    fn add_section_inner(&mut self) -> Result<u32> {
        if self.sections.len() >= u32::MAX as usize {
            return Err(CrabError::overflow("<num sections>"));
        }
        let number = self.sections.len() as u32;
        let (schema_id, schema) = self.add_schema(CRAB_SCHEMA_URL)?;
        self.sections.push(Section::new(
            number,
            schema_id,
            Purpose::Error,
            Some(schema),
            SectionData::None,
        ));
        Ok(number)
    }

    fn set_schema_and_purpose_inner(
        &mut self,
        index: u32,
        url: &str,
        purpose: Purpose,
    ) -> Result<()> {
        let i = self.check_index(index)?;
        let (schema_id, schema) = self.add_schema(url)?;
        let section = &mut self.sections[i];
        section.schema_id = schema_id;
        section.schema = Some(schema);
        section.purpose = purpose;
        Ok(())
    }

    fn set_section_data_inner(&mut self, index: u32, source: DataSource<'_>) -> Result<()> {
        let i = self.check_index(index)?;
        let data = match source {
            DataSource::Copied(bytes) if bytes.is_empty() => SectionData::None,
            DataSource::Copied(bytes) => {
                check_payload_size(bytes.len())?;
                SectionData::Owned(bytes.to_vec())
            }
            DataSource::Owned(bytes) if bytes.is_empty() => SectionData::None,
            DataSource::Owned(bytes) => {
                check_payload_size(bytes.len())?;
                SectionData::Owned(bytes)
            }
            DataSource::Shared(bytes) if bytes.is_empty() => SectionData::None,
            DataSource::Shared(bytes) => {
                check_payload_size(bytes.len())?;
                SectionData::Shared(bytes)
            }
        };
        self.sections[i].data = data;
        Ok(())
    }

    fn copy_section_inner(&mut self, dst: u32, mode: CopyMode, src: u32) -> Result<()> {
        let dst_i = self.check_index(dst)?;
        let src_i = self.check_index(src)?;
        let url = self.section_schema_at(src_i)?.to_string();
        let purpose = self.sections[src_i].purpose;
        let (schema_id, schema) = self.add_schema(&url)?;
        let data = self.take_payload(src_i, mode);
        let section = &mut self.sections[dst_i];
        section.schema_id = schema_id;
        section.schema = Some(schema);
        section.purpose = purpose;
        section.data = data;
        Ok(())
    }

    fn copy_section_from_inner(
        &mut self,
        dst: u32,
        mode: CopyMode,
        other: &mut CrabFile,
        src: u32,
    ) -> Result<()> {
        let dst_i = self.check_index(dst)?;
        let src_i = other.check_index(src)?;
        let url = other.section_schema_at(src_i)?.to_string();
        let purpose = other.sections[src_i].purpose;
        let (schema_id, schema) = self.add_schema(&url)?;
        let data = match mode {
            CopyMode::Own => match std::mem::take(&mut other.sections[src_i].data) {
                // another file's mapping cannot be borrowed from here
                SectionData::Mapped(range) => {
                    let image = other.image.as_ref().expect("mapped payload without a mapping");
                    SectionData::Owned(image.bytes()[range].to_vec())
                }
                taken => taken,
            },
            CopyMode::Borrow => match &other.sections[src_i].data {
                SectionData::None => SectionData::None,
                SectionData::Shared(bytes) => SectionData::Shared(bytes.clone()),
                SectionData::Owned(_) | SectionData::Mapped(_) => {
                    let bytes: Arc<[u8]> = match std::mem::take(&mut other.sections[src_i].data) {
                        SectionData::Owned(vec) => Arc::from(vec),
                        SectionData::Mapped(range) => {
                            let image =
                                other.image.as_ref().expect("mapped payload without a mapping");
                            Arc::from(&image.bytes()[range])
                        }
                        _ => unreachable!(),
                    };
                    other.sections[src_i].data = SectionData::Shared(bytes.clone());
                    SectionData::Shared(bytes)
                }
            },
            CopyMode::Copy => {
                let bytes = other.payload(src_i);
                if bytes.is_empty() {
                    SectionData::None
                } else {
                    SectionData::Owned(bytes.to_vec())
                }
            }
        };
        let section = &mut self.sections[dst_i];
        section.schema_id = schema_id;
        section.schema = Some(schema);
        section.purpose = purpose;
        section.data = data;
        Ok(())
    }

    fn take_payload(&mut self, src: usize, mode: CopyMode) -> SectionData {
        match mode {
            CopyMode::Own => std::mem::take(&mut self.sections[src].data),
            CopyMode::Borrow => match &self.sections[src].data {
                SectionData::None => SectionData::None,
                SectionData::Mapped(range) => SectionData::Mapped(range.clone()),
                SectionData::Shared(bytes) => SectionData::Shared(bytes.clone()),
                SectionData::Owned(_) => {
                    // promote to shared storage so both sections can hold it
                    let bytes: Arc<[u8]> = match std::mem::take(&mut self.sections[src].data) {
                        SectionData::Owned(vec) => Arc::from(vec),
                        _ => unreachable!(),
                    };
                    self.sections[src].data = SectionData::Shared(bytes.clone());
                    SectionData::Shared(bytes)
                }
            },
            CopyMode::Copy => {
                let bytes = self.payload(src);
                if bytes.is_empty() {
                    SectionData::None
                } else {
                    SectionData::Owned(bytes.to_vec())
                }
            }
        }
    }

    fn save_inner(&mut self, flags: SaveFlags) -> Result<()> {
        let num_sections = self.sections.len() as u32;
        let mut file_size = (FileHeader::SIZE + num_sections as usize * SectionInfo::SIZE) as u64;
        let section_start = file_size;
        for section in &self.sections {
            assert_eq!(file_size % ALIGNMENT, 0, "misaligned section layout");
            file_size = pad_to_alignment(file_size + section.data.len() as u64);
        }
        let header = FileHeader {
            size: file_size,
            reserved: 0,
            num_sections,
        };

        let mut tmp = self.filename.clone().into_os_string();
        tmp.push(".new");
        let tmp = PathBuf::from(tmp);

        self.write_image(&tmp, &header, section_start)?;
        fs::rename(&tmp, &self.filename).map_err(|e| CrabError::io("rename", e))?;
        debug!(
            "saved {} ({} bytes, {} sections)",
            self.filename.display(),
            file_size,
            num_sections
        );

        if flags.contains(SaveFlags::REOPEN) {
            self.close_partial();
            self.open_partial(false)?;
        }
        Ok(())
    }

    fn write_image(&self, path: &Path, header: &FileHeader, section_start: u64) -> Result<()> {
        const ZEROS: [u8; ALIGNMENT as usize] = [0; ALIGNMENT as usize];

        let fp = File::create(path).map_err(|e| CrabError::io("fopen", e))?;
        let mut out = StreamWriter::new(BufWriter::new(fp));
        out.write(header)?;

        let mut offset = section_start;
        for section in &self.sections {
            assert_eq!(offset % ALIGNMENT, 0, "misaligned section offset");
            out.write(&SectionInfo {
                offset,
                size: section.data.len() as u32,
                schema: section.schema_id,
                purpose: section.purpose.to_u16(),
            })?;
            offset = pad_to_alignment(offset + section.data.len() as u64);
        }

        for i in 0..self.sections.len() {
            let payload = self.payload(i);
            out.write_slice(payload)?;
            let tail = payload.len() % ALIGNMENT as usize;
            if tail != 0 {
                out.write_slice(&ZEROS[..ALIGNMENT as usize - tail])?;
            }
        }
        out.flush()?;
        debug_assert_eq!(out.written(), header.size);
        Ok(())
    }

    /// Releases owned payloads and the mapping, keeping the section
    /// objects themselves so a reopen can refill them in place.
    fn close_partial(&mut self) {
        for section in &mut self.sections {
            section.data = SectionData::None;
            section.schema = None;
        }
        self.image = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::MAGIC;
    use tempfile::{tempdir, TempDir};

    const URL_LEN: usize = CRAB_SCHEMA_URL.len(); // 39; 40 with the NUL

    fn fresh(name: &str) -> (TempDir, PathBuf, CrabFile) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(name);
        let file = CrabFile::open(&path, FileFlags::NEW).unwrap();
        (dir, path, file)
    }

    fn saved(name: &str) -> (TempDir, PathBuf) {
        let (dir, path, mut file) = fresh(name);
        file.save(SaveFlags::empty()).unwrap();
        (dir, path)
    }

    #[test]
    fn fresh_file_image_is_112_bytes() {
        let (_dir, path) = saved("t.crab");
        let image = fs::read(&path).unwrap();

        // 24 header + 2 * 16 info + 16 schema payload + 40 string payload
        assert_eq!(image.len(), 112);
        assert_eq!(&image[..8], &MAGIC);
        assert_eq!(&image[8..16], &112u64.to_be_bytes());
        assert_eq!(&image[16..20], &0u32.to_be_bytes());
        assert_eq!(&image[20..24], &2u32.to_be_bytes());

        // section 0: offset 56, size 16, schema 0, purpose SCHEMA
        assert_eq!(&image[24..32], &56u64.to_be_bytes());
        assert_eq!(&image[32..36], &16u32.to_be_bytes());
        assert_eq!(&image[36..38], &0u16.to_be_bytes());
        assert_eq!(&image[38..40], &3u16.to_be_bytes());

        // section 1: offset 72, size 40, schema 0, purpose SUPPLEMENTARY
        assert_eq!(&image[40..48], &72u64.to_be_bytes());
        assert_eq!(&image[48..52], &40u32.to_be_bytes());
        assert_eq!(&image[52..54], &0u16.to_be_bytes());
        assert_eq!(&image[54..56], &2u16.to_be_bytes());

        // schema payload: string section 1, one schema at offset 0
        assert_eq!(&image[56..60], &1u32.to_be_bytes());
        assert_eq!(&image[62..64], &1u16.to_be_bytes());
        assert_eq!(&image[64..68], &(URL_LEN as u32).to_be_bytes());

        // string payload: the NUL-terminated builtin URL
        assert_eq!(&image[72..72 + URL_LEN], CRAB_SCHEMA_URL.as_bytes());
        assert_eq!(image[72 + URL_LEN], 0);
    }

    #[test]
    fn fresh_file_lists_the_builtin_sections() {
        let (_dir, path) = saved("t.crab");
        let file = CrabFile::open(&path, FileFlags::empty()).unwrap();

        assert_eq!(file.num_sections(), 2);
        assert_eq!(file.section(0).unwrap().purpose(), Purpose::Schema);
        assert_eq!(file.section(0).unwrap().data_size(), 16);
        assert_eq!(file.section_schema(0).unwrap(), CRAB_SCHEMA_URL);
        assert_eq!(file.section(1).unwrap().purpose(), Purpose::Supplementary);
        assert_eq!(file.section(1).unwrap().data_size(), URL_LEN + 1);
        assert_eq!(file.section_schema(1).unwrap(), CRAB_SCHEMA_URL);
    }

    #[test]
    fn adding_a_raw_blob_round_trips() {
        let (_dir, path) = saved("t.crab");

        let mut file = CrabFile::open(&path, FileFlags::empty()).unwrap();
        let index = file.add_section().unwrap();
        assert_eq!(index, 2);
        file.set_schema_and_purpose(index, CRAB_SCHEMA_URL, Purpose::Raw)
            .unwrap();
        file.set_section_data(index, DataSource::Copied(b"hello\0"))
            .unwrap();
        file.save(SaveFlags::empty()).unwrap();
        drop(file);

        let file = CrabFile::open(&path, FileFlags::empty()).unwrap();
        assert_eq!(file.num_sections(), 3);
        assert_eq!(file.section(2).unwrap().purpose(), Purpose::Raw);
        assert_eq!(file.section(2).unwrap().data_size(), 6);
        assert_eq!(file.section_data(2).unwrap(), b"hello\0");
        assert_eq!(file.section_schema(2).unwrap(), CRAB_SCHEMA_URL);

        // padding invariant: every offset a multiple of 8, size field honest
        let image = fs::read(&path).unwrap();
        assert_eq!(&image[8..16], &(image.len() as u64).to_be_bytes());
        for i in 0..3 {
            let at = 24 + i * 16;
            let offset = u64::from_be_bytes(image[at..at + 8].try_into().unwrap());
            let size = u32::from_be_bytes(image[at + 8..at + 12].try_into().unwrap());
            assert_eq!(offset % 8, 0);
            assert!(offset + size as u64 <= image.len() as u64);
        }
    }

    #[test]
    fn interning_a_new_schema_grows_both_tables() {
        let (_dir, _path, mut file) = fresh("t.crab");
        let index = file.add_section().unwrap();
        file.set_schema_and_purpose(index, "https://example.org/x", Purpose::Other(7))
            .unwrap();

        // one 8-byte schema entry, 21 URL bytes plus a NUL
        assert_eq!(file.section(0).unwrap().data_size(), 24);
        assert_eq!(file.section(1).unwrap().data_size(), URL_LEN + 1 + 22);
        assert_eq!(file.section(index).unwrap().schema_id(), 1);
        assert_eq!(file.section(index).unwrap().purpose(), Purpose::Other(7));
        assert_eq!(file.section_schema(index).unwrap(), "https://example.org/x");
    }

    #[test]
    fn interning_twice_reuses_the_entry() {
        let (_dir, _path, mut file) = fresh("t.crab");
        let a = file.add_section().unwrap();
        let b = file.add_section().unwrap();
        file.set_schema_and_purpose(a, "https://example.org/x", Purpose::Raw)
            .unwrap();
        let schema_size = file.section(0).unwrap().data_size();
        file.set_schema_and_purpose(b, "https://example.org/x", Purpose::Other(9))
            .unwrap();

        assert_eq!(file.section(0).unwrap().data_size(), schema_size);
        assert_eq!(
            file.section(a).unwrap().schema_id(),
            file.section(b).unwrap().schema_id()
        );
        // both resolve to the same bytes of the string section
        assert_eq!(
            file.section(a).unwrap().schema_ref(),
            file.section(b).unwrap().schema_ref()
        );
    }

    #[test]
    fn wiping_a_section() {
        let (_dir, path) = saved("t.crab");
        let mut file = CrabFile::open(&path, FileFlags::empty()).unwrap();
        let index = file.add_section().unwrap();
        file.set_schema_and_purpose(index, CRAB_SCHEMA_URL, Purpose::Raw)
            .unwrap();
        file.set_section_data(index, DataSource::Copied(b"hello\0"))
            .unwrap();
        file.save(SaveFlags::empty()).unwrap();

        file.set_section_data(index, DataSource::Copied(&[])).unwrap();
        file.set_schema_and_purpose(index, CRAB_SCHEMA_URL, Purpose::Error)
            .unwrap();
        file.save(SaveFlags::empty()).unwrap();
        drop(file);

        let file = CrabFile::open(&path, FileFlags::empty()).unwrap();
        assert_eq!(file.num_sections(), 3);
        assert_eq!(file.section(2).unwrap().data_size(), 0);
        assert_eq!(file.section(2).unwrap().purpose(), Purpose::Error);
        assert_eq!(file.section(0).unwrap().data_size(), 16);
        assert_eq!(file.section(1).unwrap().data_size(), URL_LEN + 1);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let (_dir, path) = saved("t.crab");
        let mut image = fs::read(&path).unwrap();
        image[0] = b'X';
        fs::write(&path, &image).unwrap();

        let err = CrabFile::open(&path, FileFlags::empty()).unwrap_err();
        assert_eq!(err.tag(), "<file format>");
        assert_eq!(err.code(), libc::EINVAL);

        let err = CrabFile::open(&path, FileFlags::ERROR).unwrap_err();
        assert_eq!(err.tag(), "<file format>");
    }

    #[test]
    fn corrupt_images_are_rejected() {
        let (_dir, path) = saved("t.crab");
        let image = fs::read(&path).unwrap();

        let open_patched = |patch: &dyn Fn(&mut Vec<u8>)| {
            let mut copy = image.clone();
            patch(&mut copy);
            fs::write(&path, &copy).unwrap();
            CrabFile::open(&path, FileFlags::empty()).unwrap_err()
        };

        // declared size disagrees with the physical size
        let err = open_patched(&|img| {
            img.truncate(104);
        });
        assert_eq!(err.tag(), "<file format>");

        // no sections at all
        let err = open_patched(&|img| img[20..24].copy_from_slice(&0u32.to_be_bytes()));
        assert_eq!(err.tag(), "<file format>");

        // section 1 runs past the end of the file
        let err = open_patched(&|img| img[48..52].copy_from_slice(&4096u32.to_be_bytes()));
        assert_eq!(err.tag(), "<file format>");

        // offset + size overflows 64 bits
        let err = open_patched(&|img| img[40..48].copy_from_slice(&u64::MAX.to_be_bytes()));
        assert_eq!(err.tag(), "<file format>");

        // schema section size disagrees with its entry count
        let err = open_patched(&|img| img[32..36].copy_from_slice(&8u32.to_be_bytes()));
        assert_eq!(err.tag(), "<file format>");

        // string-section index out of range
        let err = open_patched(&|img| img[56..60].copy_from_slice(&5u32.to_be_bytes()));
        assert_eq!(err.tag(), "<file format>");

        // section 1's schema id names a schema that does not exist
        let err = open_patched(&|img| img[52..54].copy_from_slice(&7u16.to_be_bytes()));
        assert_eq!(err.tag(), "<file format>");
    }

    #[test]
    fn failed_save_leaves_the_original_bytes() {
        let (_dir, path) = saved("t.crab");
        let before = fs::read(&path).unwrap();

        let mut file = CrabFile::open(&path, FileFlags::empty()).unwrap();
        let index = file.add_section().unwrap();
        file.set_section_data(index, DataSource::Copied(b"doomed"))
            .unwrap();

        // occupy <name>.new so the temporary cannot be created
        let mut blocker = path.clone().into_os_string();
        blocker.push(".new");
        fs::create_dir(PathBuf::from(blocker)).unwrap();

        let err = file.save(SaveFlags::empty()).unwrap_err();
        assert_eq!(err.tag(), "fopen");
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn reopen_borrows_payloads_from_the_mapping() {
        let (_dir, _path, mut file) = fresh("t.crab");
        let index = file.add_section().unwrap();
        file.set_schema_and_purpose(index, CRAB_SCHEMA_URL, Purpose::Raw)
            .unwrap();
        file.set_section_data(index, DataSource::Copied(b"payload"))
            .unwrap();
        file.save(SaveFlags::REOPEN).unwrap();

        for section in &file.sections {
            assert!(
                section.data.is_empty() || matches!(section.data, SectionData::Mapped(_)),
                "payload still on the heap after a reopen"
            );
        }
        assert_eq!(file.num_sections(), 3);
        assert_eq!(file.section_data(index).unwrap(), b"payload");
        assert_eq!(file.section_schema(index).unwrap(), CRAB_SCHEMA_URL);
        assert_eq!(file.section(index).unwrap().purpose(), Purpose::Raw);
    }

    #[test]
    fn copy_transfers_shares_and_duplicates() {
        let (_dir, _path, mut file) = fresh("t.crab");
        let src = file.add_section().unwrap();
        let dst = file.add_section().unwrap();
        file.set_schema_and_purpose(src, "https://example.org/x", Purpose::Other(7))
            .unwrap();
        file.set_section_data(src, DataSource::Owned(b"moved".to_vec()))
            .unwrap();

        file.copy_section(dst, CopyMode::Own, src).unwrap();
        assert_eq!(file.section(src).unwrap().data_size(), 0);
        assert_eq!(file.section_data(dst).unwrap(), b"moved");
        assert_eq!(file.section(dst).unwrap().purpose(), Purpose::Other(7));
        assert_eq!(file.section_schema(dst).unwrap(), "https://example.org/x");
        assert_eq!(
            file.section(dst).unwrap().schema_id(),
            file.section(src).unwrap().schema_id()
        );

        file.set_section_data(src, DataSource::Owned(b"shared".to_vec()))
            .unwrap();
        file.copy_section(dst, CopyMode::Borrow, src).unwrap();
        assert_eq!(file.section_data(src).unwrap(), b"shared");
        assert_eq!(file.section_data(dst).unwrap(), b"shared");
        assert!(matches!(
            file.sections[src as usize].data,
            SectionData::Shared(_)
        ));
        assert!(matches!(
            file.sections[dst as usize].data,
            SectionData::Shared(_)
        ));

        file.copy_section(dst, CopyMode::Copy, src).unwrap();
        assert!(matches!(
            file.sections[dst as usize].data,
            SectionData::Owned(_)
        ));
        assert_eq!(file.section_data(dst).unwrap(), b"shared");
    }

    #[test]
    fn cross_file_copy_reinterns_the_schema() {
        let (_dir, _path, mut donor) = fresh("a.crab");
        let src = donor.add_section().unwrap();
        donor
            .set_schema_and_purpose(src, "https://example.org/x", Purpose::Other(7))
            .unwrap();
        donor
            .set_section_data(src, DataSource::Copied(b"robbed"))
            .unwrap();

        let (_dir2, _path2, mut file) = fresh("b.crab");
        let dst = file.add_section().unwrap();
        file.copy_section_from(dst, CopyMode::Copy, &mut donor, src)
            .unwrap();

        assert_eq!(file.section_data(dst).unwrap(), b"robbed");
        assert_eq!(file.section_schema(dst).unwrap(), "https://example.org/x");
        assert_eq!(file.section(dst).unwrap().purpose(), Purpose::Other(7));
        // the destination's table interned the URL on its own
        assert_eq!(file.section(0).unwrap().data_size(), 24);
        assert_eq!(file.section(dst).unwrap().schema_id(), 1);

        // transfer mode empties the donor
        let dst2 = file.add_section().unwrap();
        file.copy_section_from(dst2, CopyMode::Own, &mut donor, src)
            .unwrap();
        assert_eq!(donor.section(src).unwrap().data_size(), 0);
        assert_eq!(file.section_data(dst2).unwrap(), b"robbed");
    }

    #[test]
    fn shared_payloads_are_never_released() {
        let (_dir, _path, mut file) = fresh("t.crab");
        let index = file.add_section().unwrap();

        let bytes: Arc<[u8]> = Arc::from(&b"caller keeps this"[..]);
        file.set_section_data(index, DataSource::Shared(bytes.clone()))
            .unwrap();
        assert_eq!(Arc::strong_count(&bytes), 2);
        assert_eq!(file.section_data(index).unwrap(), &bytes[..]);

        file.set_section_data(index, DataSource::Copied(b"replacement"))
            .unwrap();
        assert_eq!(Arc::strong_count(&bytes), 1);
        assert_eq!(&bytes[..], b"caller keeps this");
    }

    #[test]
    fn section_indices_are_stable() {
        let (_dir, _path, mut file) = fresh("t.crab");
        let a = file.add_section().unwrap();
        let b = file.add_section().unwrap();
        file.set_schema_and_purpose(a, "https://example.org/x", Purpose::Raw)
            .unwrap();
        file.set_section_data(b, DataSource::Copied(b"data")).unwrap();
        file.save(SaveFlags::REOPEN).unwrap();
        file.save(SaveFlags::empty()).unwrap();

        assert_eq!(file.num_sections(), 4);
        for i in 0..4 {
            assert_eq!(file.section(i).unwrap().number(), i);
        }
    }

    #[test]
    fn bad_index_reports_einval() {
        let (_dir, _path, file) = fresh("t.crab");
        let err = file.section(99).unwrap_err();
        assert_eq!(err.tag(), "<section index>");
        assert_eq!(err.code(), libc::EINVAL);
    }

    #[test]
    fn in_place_edits_require_the_write_flag() {
        let (_dir, path) = saved("t.crab");

        let mut file = CrabFile::open(&path, FileFlags::WRITE).unwrap();
        file.section_data_mut(1).unwrap()[0] = b'X';
        assert_eq!(file.section_data(1).unwrap()[0], b'X');
        drop(file);

        // the mapping is private; the disk image is untouched
        let file = CrabFile::open(&path, FileFlags::empty()).unwrap();
        assert_eq!(file.section_data(1).unwrap()[0], b'h');

        let mut file = CrabFile::open(&path, FileFlags::empty()).unwrap();
        let err = file.section_data_mut(1).unwrap_err();
        assert_eq!(err.tag(), "<read only>");
    }
}
