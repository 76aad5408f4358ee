//! In-memory capture of program output.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use crate::sync::lock;

/// Shared, append-only byte buffer.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, data: &[u8]) {
        lock(&self.bytes).extend_from_slice(data);
    }

    /// Append `line` followed by a newline.
    pub fn push_line(&self, line: &str) {
        let mut bytes = lock(&self.bytes);
        bytes.extend_from_slice(line.as_bytes());
        bytes.push(b'\n');
    }

    /// Captured text; invalid UTF-8 is replaced.
    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock(&self.bytes)).into_owned()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.bytes).is_empty()
    }
}

/// Writer that duplicates everything into an [`OutputBuffer`] and, when
/// echoing, into the process stdout.
#[derive(Debug, Clone)]
pub struct Tee {
    buffer: OutputBuffer,
    echo: bool,
}

impl Tee {
    #[must_use]
    pub fn new(buffer: OutputBuffer, echo: bool) -> Self {
        Self { buffer, echo }
    }
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.echo {
            io::stdout().lock().write_all(buf)?;
        }
        self.buffer.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.echo {
            io::stdout().lock().flush()?;
        }
        Ok(())
    }
}
