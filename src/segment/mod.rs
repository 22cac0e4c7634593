//! Part segmentation
//!
//! Cuts the continuous compressed stream into numbered upload parts that
//! satisfy the S3 multipart constraints without ever holding the whole
//! object: non-final parts must reach the 5 MiB protocol minimum, at most
//! 10000 parts may exist, and part numbers are contiguous from 1.
//!
//! The segmenter keeps a pending tail: the most recent cut is held back so
//! an undersized successor can merge into it and so the true last part can
//! always be emitted at stream end, where the protocol exempts it from the
//! minimum size.

use bytes::Bytes;
use thiserror::Error;

/// Smallest size S3 accepts for a non-final part (5 MiB).
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Largest part number S3 accepts.
pub const MAX_PARTS: i32 = 10_000;

/// Segmentation errors
#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("number of parts cannot exceed {MAX_PARTS}; increase the part size")]
    TooManyParts,
}

/// A numbered slice of the compressed object, ready for upload.
#[derive(Debug, Clone)]
pub struct CompressedPart {
    pub part_number: i32,
    pub data: Bytes,
}

/// What remains when the stream ends.
#[derive(Debug)]
pub enum FinishOutcome {
    /// Final part(s) to upload; the multipart session should be completed.
    Parts(Vec<CompressedPart>),
    /// The object never produced a single cut: upload it directly and
    /// abort the multipart session.
    Direct(Bytes),
}

/// Stateful stream-to-parts slicer. Exclusively owned by the compression
/// stage; never shared across tasks.
pub struct PartSegmenter {
    part_number: i32,
    pending: Vec<u8>,
}

impl PartSegmenter {
    pub fn new() -> Self {
        Self {
            part_number: 0,
            pending: Vec::new(),
        }
    }

    /// Parts numbered so far.
    pub fn parts_created(&self) -> i32 {
        self.part_number
    }

    /// Accept freshly accumulated compressed bytes at a cut point.
    ///
    /// Returns the previous pending tail as a finished part when the new
    /// bytes are large enough to stand on their own; otherwise the new
    /// bytes merge into the tail and no part number is consumed.
    pub fn push(&mut self, buf: Vec<u8>) -> Result<Option<CompressedPart>, SegmentError> {
        self.part_number += 1;

        if buf.len() >= MIN_PART_SIZE {
            if self.part_number > MAX_PARTS {
                return Err(SegmentError::TooManyParts);
            }
            let emitted = if self.part_number > 1 {
                let tail = std::mem::replace(&mut self.pending, buf);
                Some(CompressedPart {
                    part_number: self.part_number - 1,
                    data: Bytes::from(tail),
                })
            } else if self.pending.is_empty() {
                self.pending = buf;
                None
            } else {
                // Undersized bytes merged ahead of the first stand-alone
                // cut stay in front of it.
                self.pending.extend_from_slice(&buf);
                None
            };
            Ok(emitted)
        } else {
            // Undersized: collapse into the pending tail and give the
            // tentative number back.
            self.pending.extend_from_slice(&buf);
            self.part_number -= 1;
            Ok(None)
        }
    }

    /// End of stream: emit everything still held.
    ///
    /// The last part is exempt from the minimum-size rule. A stream that
    /// never reached a cut goes down the direct-upload path instead.
    pub fn finish(&mut self, buf: Vec<u8>) -> Result<FinishOutcome, SegmentError> {
        let mut parts = Vec::new();
        if let Some(part) = self.push(buf)? {
            parts.push(part);
        }

        if self.part_number == 0 {
            return Ok(FinishOutcome::Direct(Bytes::from(std::mem::take(
                &mut self.pending,
            ))));
        }

        parts.push(CompressedPart {
            part_number: self.part_number,
            data: Bytes::from(std::mem::take(&mut self.pending)),
        });
        Ok(FinishOutcome::Parts(parts))
    }
}

impl Default for PartSegmenter {
    fn default() -> Self {
        Self::new()
    }
}
