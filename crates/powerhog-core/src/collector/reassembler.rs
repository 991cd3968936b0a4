//! Record reassembly for the powermetrics plist stream.
//!
//! powermetrics writes one XML plist document per sample, separated by NUL
//! bytes, to a pipe that we read in arbitrary chunks. [`Reassembler`] buffers
//! the trailing partial line of every chunk and emits a record once its
//! closing `</plist>` line has been seen, so the output does not depend on
//! where the reads happened to split the stream.

use tracing::debug;

use crate::collector::parser::PRIVILEGE_MESSAGE;

/// First line of every record.
pub const RECORD_START: &str = "<?xml";
/// Last line of every record.
pub const RECORD_END: &str = "</plist>";

#[derive(Debug, Default)]
pub struct Reassembler {
    /// Bytes after the last newline of the previous chunk.
    partial: Vec<u8>,
    /// Lines of the record being accumulated.
    record: String,
    in_record: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes a chunk of raw output and returns every record it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.extend_from_slice(chunk);

        let mut records = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.partial[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let line = String::from_utf8_lossy(&self.partial[start..end]).into_owned();
            self.push_line(&line, &mut records);
            start = end + 1;
        }
        self.partial.drain(..start);

        records
    }

    /// Flushes an unterminated last line at end of stream.
    pub fn finish(&mut self) -> Vec<String> {
        let mut records = Vec::new();
        if !self.partial.is_empty() {
            let line = String::from_utf8_lossy(&self.partial).into_owned();
            self.partial.clear();
            self.push_line(&line, &mut records);
        }
        records
    }

    /// Whether a record or line is still incomplete.
    pub fn has_pending(&self) -> bool {
        self.in_record || !self.partial.is_empty()
    }

    fn push_line(&mut self, raw: &str, out: &mut Vec<String>) {
        let line = raw.trim_matches(|c: char| c.is_whitespace() || c == '\0');
        if line.is_empty() {
            return;
        }

        if line.starts_with(RECORD_START) {
            if self.in_record {
                // Previous record never closed; hand it over as-is so the parser rejects it.
                out.push(std::mem::take(&mut self.record));
            }
            self.in_record = true;
        } else if !self.in_record {
            if line.starts_with(PRIVILEGE_MESSAGE) {
                out.push(line.to_string());
            } else {
                debug!(line, "ignoring output outside of a record");
            }
            return;
        }

        // Process names may contain a bare '&', which is not valid XML.
        self.record.push_str(&line.replace('&', "&amp;"));
        self.record.push('\n');

        if line == RECORD_END {
            self.in_record = false;
            out.push(std::mem::take(&mut self.record));
        }
    }
}
