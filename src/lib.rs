pub mod containers;
pub mod error;
pub mod file;
pub mod format;
pub mod io;
pub mod schema;
pub mod section;

pub use error::{CrabError, Result};
pub use file::{CrabFile, FileFlags, SaveFlags};
pub use schema::{Purpose, CRAB_SCHEMA_URL};
pub use section::{CopyMode, DataSource, Section, SectionData};
