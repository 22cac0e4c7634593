//! CSV encoding
//!
//! Batches text rows and serializes them into delimited byte chunks for the
//! compressor. A batch flushes when it reaches the configured row count or
//! when its estimated size crosses the buffer threshold, whichever happens
//! first; the terminal flush is marked `last` so downstream stages can
//! finalize the stream.

use bytes::Bytes;
use thiserror::Error;

/// Encoding errors
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("row has {got} columns, header has {expected}")]
    WidthMismatch { expected: usize, got: usize },

    #[error("CSV write error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A serialized batch of rows.
#[derive(Debug, Clone)]
pub struct CsvChunk {
    pub data: Bytes,
    pub last: bool,
}

/// Row batcher and CSV serializer.
pub struct CsvEncoder {
    delimiter: u8,
    width: usize,
    max_rows: usize,
    max_bytes: usize,
    batch: Vec<Vec<String>>,
    batch_bytes: usize,
}

impl CsvEncoder {
    pub fn new(delimiter: u8, width: usize, max_rows: usize, max_bytes: usize) -> Self {
        Self {
            delimiter,
            width,
            max_rows,
            max_bytes,
            batch: Vec::with_capacity(max_rows.min(8192)),
            batch_bytes: 0,
        }
    }

    /// Append a row to the pending batch, returning a serialized chunk when
    /// either flush trigger fires.
    ///
    /// Rows whose width does not match the header are rejected here; a user
    /// hook that changes row arity surfaces as this error.
    pub fn push(&mut self, row: Vec<String>) -> Result<Option<CsvChunk>, EncodeError> {
        if row.len() != self.width {
            return Err(EncodeError::WidthMismatch {
                expected: self.width,
                got: row.len(),
            });
        }

        // Delimiters plus terminator give a close-enough size estimate; the
        // byte trigger only needs to be deterministic, not exact.
        self.batch_bytes += row.iter().map(String::len).sum::<usize>() + row.len();
        self.batch.push(row);

        if self.batch.len() >= self.max_rows || self.batch_bytes >= self.max_bytes {
            return Ok(Some(CsvChunk {
                data: self.encode_batch()?,
                last: false,
            }));
        }
        Ok(None)
    }

    /// Serialize whatever remains and mark it as the final chunk.
    pub fn finish(&mut self) -> Result<CsvChunk, EncodeError> {
        Ok(CsvChunk {
            data: self.encode_batch()?,
            last: true,
        })
    }

    fn encode_batch(&mut self) -> Result<Bytes, EncodeError> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .from_writer(Vec::with_capacity(self.batch_bytes + 64));

        for row in self.batch.drain(..) {
            writer.write_record(&row)?;
        }
        self.batch_bytes = 0;

        let buf = writer
            .into_inner()
            .map_err(|e| EncodeError::Io(e.into_error()))?;
        Ok(Bytes::from(buf))
    }
}
