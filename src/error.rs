use std::error::Error;
use std::fmt;
use std::io;

pub type Result<T> = core::result::Result<T, CrabError>;

/// Every failure carries a short static tag and an errno-style numeric
/// code, surfaced through [`CrabError::tag`] and [`CrabError::code`].
#[derive(Debug)]
pub enum CrabError {
    NotEnoughData { attempted_read: usize },
    NotEnoughSpace { attempted_write: usize },
    /// The on-disk image violates the container format.
    BadFormat { tag: &'static str },
    /// A section index past the end of the section sequence.
    BadIndex { index: u32, count: u32 },
    /// A count or packed field would exceed its on-disk width.
    Overflow { tag: &'static str },
    /// In-place payload access on a mapping opened without `WRITE`.
    ReadOnly { index: u32 },
    /// A failed syscall, tagged with the operation that made it.
    Io { tag: &'static str, source: io::Error },
}

impl CrabError {
    #[cold]
    pub const fn not_enough_data(size: usize) -> Self {
        Self::NotEnoughData {
            attempted_read: size,
        }
    }
    #[cold]
    pub const fn not_enough_space(size: usize) -> Self {
        Self::NotEnoughSpace {
            attempted_write: size,
        }
    }
    #[cold]
    pub const fn bad_format(tag: &'static str) -> Self {
        Self::BadFormat { tag }
    }
    #[cold]
    pub const fn bad_index(index: u32, count: u32) -> Self {
        Self::BadIndex { index, count }
    }
    #[cold]
    pub const fn overflow(tag: &'static str) -> Self {
        Self::Overflow { tag }
    }
    #[cold]
    pub const fn read_only(index: u32) -> Self {
        Self::ReadOnly { index }
    }
    #[cold]
    pub fn io(tag: &'static str, source: io::Error) -> Self {
        Self::Io { tag, source }
    }

    /// The short static tag, e.g. `"<file format>"` or `"rename"`.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::NotEnoughData { .. } | Self::NotEnoughSpace { .. } => "<file format>",
            Self::BadFormat { tag } | Self::Overflow { tag } => tag,
            Self::BadIndex { .. } => "<section index>",
            Self::ReadOnly { .. } => "<read only>",
            Self::Io { tag, .. } => tag,
        }
    }

    /// The numeric code, following POSIX errno conventions.
    pub fn code(&self) -> i32 {
        match self {
            Self::NotEnoughData { .. }
            | Self::NotEnoughSpace { .. }
            | Self::BadFormat { .. }
            | Self::BadIndex { .. } => libc::EINVAL,
            Self::Overflow { .. } => libc::EOVERFLOW,
            Self::ReadOnly { .. } => libc::EACCES,
            Self::Io { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

impl fmt::Display for CrabError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { tag, source } => write!(f, "{}: {}", tag, source),
            _ => write!(
                f,
                "{}: {}",
                self.tag(),
                io::Error::from_raw_os_error(self.code())
            ),
        }
    }
}

impl Error for CrabError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}
