use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use super::{IngestRecord, IngestSource};

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Newline-delimited records from stdin or any async reader. Blank lines are skipped.
/// Lines are passed on as raw bytes; UTF-8 is checked when the record is decoded.
pub struct LineSource {
    reader: BufReader<BoxedReader>,
    buffer: Vec<u8>,
    records_pulled: u64,
}

impl LineSource {
    pub fn stdin() -> Self {
        Self::from_reader(tokio::io::stdin())
    }

    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let boxed: BoxedReader = Box::new(reader);
        Self {
            reader: BufReader::new(boxed),
            buffer: Vec::new(),
            records_pulled: 0,
        }
    }
}

#[async_trait::async_trait]
impl IngestSource for LineSource {
    async fn next_record(&mut self) -> Result<Option<IngestRecord>> {
        loop {
            self.buffer.clear();
            let read = self
                .reader
                .read_until(b'\n', &mut self.buffer)
                .await
                .context("Failed to read input line")?;
            if read == 0 {
                return Ok(None);
            }

            let line = trim_line_ending(&self.buffer);
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            self.records_pulled += 1;
            return Ok(Some(IngestRecord::new(line)));
        }
    }

    fn records_pulled(&self) -> u64 {
        self.records_pulled
    }

    fn name(&self) -> &'static str {
        "lines"
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
