//! Destinations for the bytes a supervised process writes.

use std::{
    fs::{self, File},
    io::{self, Write},
    path::Path,
};

/// Log target used for lines mirrored from a supervised process.
pub const OUTPUT_TARGET: &str = "execfork::output";

/// Opens `path` for writing, creating missing parent directories first.
pub fn file_sink(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    debug!("Writing process output to {:?}", path);
    File::create(path)
}

/// A sink that forwards every complete line to the logger.
///
/// Bytes are buffered until a newline arrives; a trailing partial line is
/// emitted when the sink is dropped so nothing the process wrote is lost.
pub struct LogSink {
    name: String,
    line: Vec<u8>,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            line: Vec::new(),
        }
    }

    fn emit(&mut self) {
        if self.line.last() == Some(&b'\r') {
            self.line.pop();
        }

        info!(target: OUTPUT_TARGET, "[{}] {}", self.name, String::from_utf8_lossy(&self.line));
        self.line.clear();
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            if byte == b'\n' {
                self.emit();
            } else {
                self.line.push(byte);
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        if !self.line.is_empty() {
            self.emit();
        }
    }
}
