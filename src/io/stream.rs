use std::io;

use crate::error::{CrabError, Result};
use crate::io::Writer;

/// Streams an image to an [`io::Write`] sink during a save, mapping sink
/// failures to the `"fwrite"` / `"fflush"` error tags.
pub struct StreamWriter<W: io::Write> {
    inner: W,
    written: u64,
}

impl<W: io::Write> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    /// Total bytes pushed into the sink so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn flush(&mut self) -> Result<()> {
        self.inner.flush().map_err(|e| CrabError::io("fflush", e))
    }
}

impl<W: io::Write> Writer for StreamWriter<W> {
    fn write_slice(&mut self, data: &[u8]) -> Result<()> {
        self.inner
            .write_all(data)
            .map_err(|e| CrabError::io("fwrite", e))?;
        self.written += data.len() as u64;
        Ok(())
    }
}
