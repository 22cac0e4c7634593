//! Gzip compression
//!
//! Wraps the downstream byte sink with one of two gzip writers selected once
//! from configuration:
//!
//! - [`SerialGz`]: a single `flate2` stream, for small exports or
//!   single-core environments.
//! - [`ParallelGz`]: fixed worker threads compress independent fixed-size
//!   blocks into complete gzip members, reassembled in submission order.
//!   Concatenated members form one valid multi-member gzip stream (RFC 1952
//!   §2.2) that any standard decompressor reads end to end.
//!
//! Both flush after every chunk write so compressed output boundaries line
//! up with CSV chunk boundaries; the part segmenter relies on that for its
//! size accounting.

use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

/// Byte-compressing sink capability: write, flush, finish.
pub trait GzSink: Send {
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Make everything written so far available to the inner sink.
    fn flush(&mut self) -> io::Result<()>;

    /// Terminate the stream, writing any trailer bytes to the inner sink.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Pick the compression backend once, from configuration.
pub fn select_sink(
    inner: Box<dyn Write + Send>,
    level: u32,
    workers: usize,
    block_size: usize,
) -> Box<dyn GzSink> {
    if workers <= 1 {
        Box::new(SerialGz::new(inner, level))
    } else {
        Box::new(ParallelGz::new(inner, level, workers, block_size))
    }
}

/// Single-threaded gzip stream.
pub struct SerialGz {
    encoder: GzEncoder<Box<dyn Write + Send>>,
}

impl SerialGz {
    pub fn new(inner: Box<dyn Write + Send>, level: u32) -> Self {
        Self {
            encoder: GzEncoder::new(inner, Compression::new(level)),
        }
    }
}

impl GzSink for SerialGz {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        self.encoder.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush()
    }

    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut inner = self.encoder.finish()?;
        inner.flush()
    }
}

type Block = (u64, Vec<u8>);

/// Multi-core gzip: independent blocks, one member each, emitted in order.
pub struct ParallelGz {
    inner: Box<dyn Write + Send>,
    job_tx: Option<mpsc::Sender<Block>>,
    result_rx: mpsc::Receiver<(u64, io::Result<Vec<u8>>)>,
    workers: Vec<thread::JoinHandle<()>>,
    block_size: usize,
    level: u32,
    next_seq: u64,
    next_write: u64,
    reordered: BTreeMap<u64, Vec<u8>>,
}

impl ParallelGz {
    pub fn new(inner: Box<dyn Write + Send>, level: u32, workers: usize, block_size: usize) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<Block>();
        let (result_tx, result_rx) = mpsc::channel();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let handles = (0..workers)
            .map(|_| {
                let job_rx = Arc::clone(&job_rx);
                let result_tx = result_tx.clone();
                thread::spawn(move || loop {
                    let job = { job_rx.lock().expect("compressor worker poisoned").recv() };
                    match job {
                        Ok((seq, block)) => {
                            let member = compress_member(&block, level);
                            if result_tx.send((seq, member)).is_err() {
                                return;
                            }
                        }
                        Err(_) => return,
                    }
                })
            })
            .collect();

        Self {
            inner,
            job_tx: Some(job_tx),
            result_rx,
            workers: handles,
            block_size,
            level,
            next_seq: 0,
            next_write: 0,
            reordered: BTreeMap::new(),
        }
    }

    /// Write out every block dispatched so far, in sequence order.
    fn drain(&mut self) -> io::Result<()> {
        while self.next_write < self.next_seq {
            if let Some(member) = self.reordered.remove(&self.next_write) {
                self.inner.write_all(&member)?;
                self.next_write += 1;
                continue;
            }
            let (seq, result) = self
                .result_rx
                .recv()
                .map_err(|_| io::Error::other("compressor worker exited unexpectedly"))?;
            self.reordered.insert(seq, result?);
        }
        Ok(())
    }
}

impl GzSink for ParallelGz {
    fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let tx = self
            .job_tx
            .as_ref()
            .ok_or_else(|| io::Error::other("compressor already finished"))?;
        for block in buf.chunks(self.block_size) {
            tx.send((self.next_seq, block.to_vec()))
                .map_err(|_| io::Error::other("compressor worker exited unexpectedly"))?;
            self.next_seq += 1;
        }
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain()?;
        self.inner.flush()
    }

    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.drain()?;

        // A gzip file must contain at least one member, even when no bytes
        // were ever written.
        if self.next_seq == 0 {
            let empty = compress_member(&[], self.level)?;
            self.inner.write_all(&empty)?;
        }

        drop(self.job_tx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.inner.flush()
    }
}

fn compress_member(block: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(
        Vec::with_capacity(block.len() / 2 + 64),
        Compression::new(level),
    );
    encoder.write_all(block)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::MultiGzDecoder;
    use std::io::Read;

    fn decompress(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        MultiGzDecoder::new(data)
            .read_to_end(&mut out)
            .expect("valid gzip stream");
        out
    }

    #[test]
    fn test_serial_roundtrip() {
        let buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let handle = SharedVec(Arc::clone(&buf));

        let mut sink: Box<dyn GzSink> = Box::new(SerialGz::new(Box::new(handle), 6));
        sink.write(b"hello, ").unwrap();
        sink.flush().unwrap();
        sink.write(b"world").unwrap();
        sink.finish().unwrap();

        assert_eq!(decompress(&buf.lock().unwrap()), b"hello, world");
    }

    #[test]
    fn test_serial_flush_exposes_bytes() {
        let buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let handle = SharedVec(Arc::clone(&buf));

        let mut sink: Box<dyn GzSink> = Box::new(SerialGz::new(Box::new(handle), 6));
        sink.write(b"payload").unwrap();
        sink.flush().unwrap();

        // After a sync flush the compressed form of every written byte must
        // already be in the inner sink; only the trailer is outstanding.
        assert!(buf.lock().unwrap().len() > 10);
    }

    #[test]
    fn test_parallel_roundtrip_preserves_order() {
        let buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let handle = SharedVec(Arc::clone(&buf));

        let input: Vec<u8> = (0..1_000_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let mut sink: Box<dyn GzSink> = Box::new(ParallelGz::new(Box::new(handle), 6, 4, 64 * 1024));
        for half in input.chunks(input.len() / 2) {
            sink.write(half).unwrap();
            sink.flush().unwrap();
        }
        sink.finish().unwrap();

        assert_eq!(decompress(&buf.lock().unwrap()), input);
    }

    #[test]
    fn test_parallel_empty_stream_is_valid_gzip() {
        let buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let handle = SharedVec(Arc::clone(&buf));

        let sink: Box<dyn GzSink> = Box::new(ParallelGz::new(Box::new(handle), 6, 2, 64 * 1024));
        sink.finish().unwrap();

        assert_eq!(decompress(&buf.lock().unwrap()), b"");
    }

    #[test]
    fn test_serial_and_parallel_decode_identically() {
        let input = b"the quick brown fox jumps over the lazy dog".repeat(10_000);

        let serial_buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let mut sink: Box<dyn GzSink> =
            Box::new(SerialGz::new(Box::new(SharedVec(Arc::clone(&serial_buf))), 6));
        sink.write(&input).unwrap();
        sink.finish().unwrap();

        let parallel_buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let mut sink: Box<dyn GzSink> = Box::new(ParallelGz::new(
            Box::new(SharedVec(Arc::clone(&parallel_buf))),
            6,
            3,
            32 * 1024,
        ));
        sink.write(&input).unwrap();
        sink.finish().unwrap();

        assert_eq!(decompress(&serial_buf.lock().unwrap()), input);
        assert_eq!(decompress(&parallel_buf.lock().unwrap()), input);
    }

    struct SharedVec(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedVec {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
