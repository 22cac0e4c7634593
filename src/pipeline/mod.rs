//! Export pipeline controller
//!
//! [`Exporter`] wires the stages together: a blocking row-intake task feeds
//! a preprocessing task, which feeds the CSV encoder, which feeds the
//! compressor. In upload mode the compressed stream is segmented into parts
//! and drained by the upload worker pool; in local mode it goes straight to
//! the caller's writer. Every link is a bounded channel, so a slow stage
//! throttles its producers and resident memory stays a small multiple of
//! the batch and part sizes no matter how many rows flow through.
//!
//! A single cancellation token is shared by every stage. Any stage failure
//! cancels it; the row loop checks it between iterations, workers stop
//! taking parts, and the controller aborts an open multipart session before
//! returning the originating error.

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::compress::{self, GzSink};
use crate::config::{ConfigError, ExportConfig};
use crate::encode::{CsvChunk, CsvEncoder, EncodeError};
use crate::metrics;
use crate::remote::{MultipartSession, RemoteError, RemoteStore, RemoteTarget, S3RemoteStore};
use crate::segment::{CompressedPart, FinishOutcome, PartSegmenter, SegmentError};
use crate::source::{RowSource, SourceError};
use crate::upload::{self, UploadError};
use crate::value::{stringify_row, RowFilter};

/// Rows buffered between intake and encoding.
const ROW_QUEUE_DEPTH: usize = 1024;

/// CSV chunks buffered ahead of the compressor.
const CHUNK_QUEUE_DEPTH: usize = 4;

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("row source error: {0}")]
    Source(#[from] SourceError),

    #[error("encoding error: {0}")]
    Encode(#[from] EncodeError),

    #[error("compression error: {0}")]
    Compress(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Segment(#[from] SegmentError),

    #[error("upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("remote store error: {0}")]
    Remote(#[from] RemoteError),

    #[error("export cancelled")]
    Cancelled,

    #[error("internal pipeline error: {0}")]
    Internal(String),
}

/// Streaming exporter producing one artifact per invocation.
///
/// # Example
///
/// ```no_run
/// use suijin_exportr::config::ExportConfig;
/// use suijin_exportr::pipeline::Exporter;
/// use suijin_exportr::source::VecSource;
/// use suijin_exportr::value::Value;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = VecSource::new(
///     vec!["id".into(), "name".into()],
///     vec![vec![Value::Int(1), Value::Text("ada".into())]],
/// );
///
/// let exporter = Exporter::new(ExportConfig::default());
/// let rows = exporter.write_file(source, "out.csv.gz").await?;
/// println!("exported {rows} rows");
/// # Ok(())
/// # }
/// ```
pub struct Exporter {
    config: ExportConfig,
    filter: Option<RowFilter>,
    store: Option<Arc<dyn RemoteStore>>,
    token: CancellationToken,
}

impl Exporter {
    pub fn new(config: ExportConfig) -> Self {
        Self {
            config,
            filter: None,
            store: None,
            token: CancellationToken::new(),
        }
    }

    /// Install a row hook that can drop or rewrite rows before encoding.
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(Vec<String>, &[String]) -> (bool, Vec<String>) + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Use a pre-built remote store instead of one constructed from config.
    pub fn with_store(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// The token that cancels this export; hand it to a signal handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stream the source into `writer` as one gzipped CSV artifact.
    ///
    /// Returns the number of rows accepted after filtering.
    pub async fn write<S, W>(&self, source: S, writer: W) -> Result<u64, ExportError>
    where
        S: RowSource + 'static,
        W: Write + Send + 'static,
    {
        self.config.validate()?;
        let started = Instant::now();
        let token = self.token.clone();

        let front = self.spawn_front_stages(source, token.clone()).await?;

        let sink = compress::select_sink(
            Box::new(writer),
            self.config.compression_level,
            self.config.gzip_workers,
            self.config.gzip_block_size,
        );
        let back_token = token.clone();
        let mut chunk_rx = front.chunk_rx;
        let back = tokio::task::spawn_blocking(move || {
            run_compressor(&mut chunk_rx, sink, &back_token).inspect_err(|_| back_token.cancel())
        });

        let intake_result = join(front.intake).await?;
        let row_count = join(front.preprocess).await?;
        let encode_result = join(front.encode).await?;
        let back_result = join(back).await?;

        let failure = first_error([
            intake_result.err(),
            encode_result.err(),
            back_result.err(),
        ])
        .or_else(|| token.is_cancelled().then_some(ExportError::Cancelled));

        match failure {
            Some(err) => {
                metrics::record_export("write", "failed", started.elapsed().as_secs_f64());
                tracing::error!(rows = row_count, error = %err, "local export failed");
                Err(err)
            }
            None => {
                metrics::record_rows_exported(row_count);
                metrics::record_export("write", "completed", started.elapsed().as_secs_f64());
                tracing::info!(rows = row_count, "local export completed");
                Ok(row_count)
            }
        }
    }

    /// Export to a freshly created file.
    pub async fn write_file<S, P>(&self, source: S, path: P) -> Result<u64, ExportError>
    where
        S: RowSource + 'static,
        P: AsRef<std::path::Path>,
    {
        let file = std::fs::File::create(path)?;
        self.write(source, file).await
    }

    /// Export into memory. Only for small data sets.
    pub async fn write_buffer<S>(&self, source: S) -> Result<(Vec<u8>, u64), ExportError>
    where
        S: RowSource + 'static,
    {
        let buf = SharedBuf::new();
        let count = self.write(source, buf.clone()).await?;
        Ok((buf.take(), count))
    }

    /// Stream the source into the configured S3 destination.
    ///
    /// Opens exactly one multipart session; on any failure after the open,
    /// the session is aborted before the originating error is returned.
    /// Objects that never reach the part threshold are delivered with a
    /// single direct put instead.
    pub async fn upload<S>(&self, source: S) -> Result<u64, ExportError>
    where
        S: RowSource + 'static,
    {
        self.config.validate()?;
        let s3 = self
            .config
            .s3
            .as_ref()
            .ok_or_else(|| ConfigError::Validation("no S3 destination configured".into()))?;

        let store: Arc<dyn RemoteStore> = match &self.store {
            Some(store) => Arc::clone(store),
            None => Arc::new(S3RemoteStore::from_config(s3).await?),
        };
        let target = RemoteTarget::from_config(s3);

        let started = Instant::now();
        let session = store.create_multipart_upload(&target).await?;
        tracing::info!(
            bucket = %target.bucket,
            key = %target.key,
            upload_id = %session.upload_id,
            "opened multipart session"
        );

        match self.stream_to_store(source, &store, &target, &session).await {
            Ok((row_count, outcome)) => {
                metrics::record_rows_exported(row_count);
                metrics::record_export("upload", outcome, started.elapsed().as_secs_f64());
                tracing::info!(rows = row_count, outcome, "upload export finished");
                Ok(row_count)
            }
            Err(err) => {
                // Best-effort abort; never masks the originating error.
                if let Err(abort_err) = store.abort_multipart_upload(&session).await {
                    tracing::error!(
                        upload_id = %session.upload_id,
                        error = %abort_err,
                        "failed to abort multipart session"
                    );
                }
                let outcome = if matches!(err, ExportError::Cancelled) {
                    "aborted"
                } else {
                    "failed"
                };
                metrics::record_export("upload", outcome, started.elapsed().as_secs_f64());
                tracing::error!(error = %err, outcome, "upload export failed");
                Err(err)
            }
        }
    }

    /// Run the streaming phase against an open session and finalize it.
    async fn stream_to_store<S>(
        &self,
        source: S,
        store: &Arc<dyn RemoteStore>,
        target: &RemoteTarget,
        session: &MultipartSession,
    ) -> Result<(u64, &'static str), ExportError>
    where
        S: RowSource + 'static,
    {
        let token = self.token.clone();
        let front = self.spawn_front_stages(source, token.clone()).await?;

        let buf = SharedBuf::new();
        let sink = compress::select_sink(
            Box::new(buf.clone()),
            self.config.compression_level,
            self.config.gzip_workers,
            self.config.gzip_block_size,
        );

        let (part_tx, part_rx) = mpsc::channel(self.config.upload_workers);
        let completed: upload::CompletedParts = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let worker_handles = upload::spawn_workers(
            self.config.upload_workers,
            Arc::clone(store),
            session.clone(),
            part_rx,
            Arc::clone(&completed),
            token.clone(),
        );

        let part_size = self.config.part_size;
        let back_token = token.clone();
        let mut chunk_rx = front.chunk_rx;
        let back = tokio::task::spawn_blocking(move || {
            run_segmenting_compressor(&mut chunk_rx, sink, buf, part_size, part_tx, &back_token)
                .inspect_err(|_| back_token.cancel())
        });

        let intake_result = join(front.intake).await?;
        let row_count = join(front.preprocess).await?;
        let encode_result = join(front.encode).await?;
        let back_result = join(back).await?;

        let mut worker_error = None;
        for handle in worker_handles {
            if let Err(err) = join(handle).await? {
                worker_error.get_or_insert(ExportError::Upload(err));
            }
        }

        let mut back_error = None;
        let (direct, parts_created) = match back_result {
            Ok(outcome) => outcome,
            Err(err) => {
                back_error = Some(err);
                (None, 0)
            }
        };

        let failure = first_error([
            intake_result.err(),
            encode_result.err(),
            back_error,
            worker_error,
        ])
        .or_else(|| token.is_cancelled().then_some(ExportError::Cancelled));
        if let Some(err) = failure {
            return Err(err);
        }

        if let Some(body) = direct {
            // The stream never produced a part; the session is abandoned in
            // favor of one direct put.
            if let Err(abort_err) = store.abort_multipart_upload(session).await {
                tracing::error!(
                    upload_id = %session.upload_id,
                    error = %abort_err,
                    "failed to abort unused multipart session"
                );
            }
            tracing::info!(bytes = body.len(), "object below part threshold, using direct put");
            store.put_object(target, body).await?;
            return Ok((row_count, "direct_uploaded"));
        }

        let mut parts = std::mem::take(&mut *completed.lock());
        parts.sort_by_key(|p| p.part_number);
        if parts.len() as i32 != parts_created {
            return Err(ExportError::Internal(format!(
                "created {parts_created} parts but {} were acknowledged",
                parts.len()
            )));
        }

        store.complete_multipart_upload(session, &parts).await?;
        Ok((row_count, "completed"))
    }

    /// Spawn intake, preprocessing, and encoding; returns their handles and
    /// the chunk stream that feeds the compressor.
    async fn spawn_front_stages<S>(
        &self,
        source: S,
        token: CancellationToken,
    ) -> Result<FrontStages, ExportError>
    where
        S: RowSource + 'static,
    {
        // Column resolution is a blocking cursor call.
        let mut source = source;
        let (source_back, columns) = tokio::task::spawn_blocking(move || {
            let columns = source.columns();
            (source, columns)
        })
        .await
        .map_err(|e| ExportError::Internal(format!("column resolution panicked: {e}")))?;
        let mut source = source_back;
        let columns = columns?;

        let header = if self.config.headers.is_empty() {
            columns.clone()
        } else {
            self.config.headers.clone()
        };
        let width = header.len();

        let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<crate::value::Value>>(ROW_QUEUE_DEPTH);
        let (text_tx, mut text_rx) = mpsc::channel::<Vec<String>>(ROW_QUEUE_DEPTH);
        let (chunk_tx, chunk_rx) = mpsc::channel::<CsvChunk>(CHUNK_QUEUE_DEPTH);

        // Intake: pull the blocking cursor, observing cancellation between
        // rows.
        let intake_token = token.clone();
        let intake = tokio::task::spawn_blocking(move || -> Result<(), ExportError> {
            loop {
                if intake_token.is_cancelled() {
                    return Err(ExportError::Cancelled);
                }
                match source.next_row() {
                    Ok(Some(row)) => {
                        if raw_tx.blocking_send(row).is_err() {
                            // Downstream went away; its own error carries
                            // the cause.
                            return Ok(());
                        }
                    }
                    Ok(None) => return Ok(()),
                    Err(err) => {
                        intake_token.cancel();
                        return Err(err.into());
                    }
                }
            }
        });

        // Preprocess: stringify, apply the hook, count accepted rows.
        let filter = self.filter.clone();
        let time_format = self.config.time_format.clone();
        let hook_columns = columns;
        let preprocess = tokio::spawn(async move {
            let mut count = 0u64;
            while let Some(values) = raw_rx.recv().await {
                let row = stringify_row(&values, time_format.as_deref());
                let (keep, row) = match &filter {
                    Some(hook) => hook(row, &hook_columns),
                    None => (true, row),
                };
                if keep {
                    count += 1;
                    if text_tx.send(row).await.is_err() {
                        break;
                    }
                }
            }
            count
        });

        // Encode: batch rows into CSV chunks.
        let delimiter = self.config.delimiter_byte();
        let batch_rows = self.config.effective_row_batch_size(width);
        let max_bytes = self.config.csv_buffer_size;
        let write_headers = self.config.write_headers;
        let encode_token = token;
        let encode = tokio::spawn(async move {
            let mut encoder = CsvEncoder::new(delimiter, width, batch_rows, max_bytes);

            if write_headers {
                if let Some(chunk) = encoder.push(header).map_err(|err| {
                    encode_token.cancel();
                    ExportError::Encode(err)
                })? {
                    metrics::record_csv_chunk();
                    if chunk_tx.send(chunk).await.is_err() {
                        return Ok(());
                    }
                }
            }

            while let Some(row) = text_rx.recv().await {
                match encoder.push(row) {
                    Ok(Some(chunk)) => {
                        metrics::record_csv_chunk();
                        if chunk_tx.send(chunk).await.is_err() {
                            return Ok(());
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        encode_token.cancel();
                        return Err(ExportError::Encode(err));
                    }
                }
            }

            if encode_token.is_cancelled() {
                // A cancelled stream gets no terminal flush; the artifact
                // is going to be discarded.
                return Ok(());
            }

            let chunk = encoder.finish().map_err(|err| {
                encode_token.cancel();
                ExportError::Encode(err)
            })?;
            metrics::record_csv_chunk();
            let _ = chunk_tx.send(chunk).await;
            Ok(())
        });

        Ok(FrontStages {
            intake,
            preprocess,
            encode,
            chunk_rx,
        })
    }
}

struct FrontStages {
    intake: JoinHandle<Result<(), ExportError>>,
    preprocess: JoinHandle<u64>,
    encode: JoinHandle<Result<(), ExportError>>,
    chunk_rx: mpsc::Receiver<CsvChunk>,
}

/// Drain CSV chunks into the compressed sink (local mode).
fn run_compressor(
    chunk_rx: &mut mpsc::Receiver<CsvChunk>,
    mut sink: Box<dyn GzSink>,
    token: &CancellationToken,
) -> Result<(), ExportError> {
    while let Some(chunk) = chunk_rx.blocking_recv() {
        sink.write(&chunk.data).map_err(ExportError::Compress)?;
        sink.flush().map_err(ExportError::Compress)?;
        if chunk.last {
            sink.finish().map_err(ExportError::Compress)?;
            return Ok(());
        }
    }

    if token.is_cancelled() {
        return Ok(());
    }
    Err(ExportError::Internal(
        "csv stream ended without a terminal chunk".into(),
    ))
}

/// Drain CSV chunks into the compressed accumulator and cut parts off it
/// (upload mode).
///
/// Returns the direct-upload body when the stream never reached a cut, and
/// the number of parts created otherwise.
fn run_segmenting_compressor(
    chunk_rx: &mut mpsc::Receiver<CsvChunk>,
    mut sink: Box<dyn GzSink>,
    buf: SharedBuf,
    part_size: usize,
    part_tx: mpsc::Sender<CompressedPart>,
    token: &CancellationToken,
) -> Result<(Option<Bytes>, i32), ExportError> {
    let mut segmenter = PartSegmenter::new();

    while let Some(chunk) = chunk_rx.blocking_recv() {
        sink.write(&chunk.data).map_err(ExportError::Compress)?;
        sink.flush().map_err(ExportError::Compress)?;

        if chunk.last {
            // The gzip trailer has to land in the accumulator before the
            // final cut.
            sink.finish().map_err(ExportError::Compress)?;

            return match segmenter.finish(buf.take())? {
                FinishOutcome::Direct(body) => Ok((Some(body), 0)),
                FinishOutcome::Parts(parts) => {
                    for part in parts {
                        if part_tx.blocking_send(part).is_err() {
                            // Workers are gone; their join result carries
                            // the cause.
                            break;
                        }
                    }
                    Ok((None, segmenter.parts_created()))
                }
            };
        }

        if buf.len() >= part_size {
            if let Some(part) = segmenter.push(buf.take())? {
                if part_tx.blocking_send(part).is_err() {
                    return Ok((None, segmenter.parts_created()));
                }
            }
        }
    }

    if token.is_cancelled() {
        return Ok((None, segmenter.parts_created()));
    }
    Err(ExportError::Internal(
        "csv stream ended without a terminal chunk".into(),
    ))
}

/// Growable byte sink shared between the compressor and the segmenter.
#[derive(Clone)]
pub(crate) struct SharedBuf(Arc<parking_lot::Mutex<Vec<u8>>>);

impl SharedBuf {
    pub(crate) fn new() -> Self {
        Self(Arc::new(parking_lot::Mutex::new(Vec::new())))
    }

    fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub(crate) fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

async fn join<T>(handle: JoinHandle<T>) -> Result<T, ExportError> {
    handle
        .await
        .map_err(|e| ExportError::Internal(format!("pipeline stage panicked: {e}")))
}

fn first_error<const N: usize>(candidates: [Option<ExportError>; N]) -> Option<ExportError> {
    let mut cancelled = None;
    for candidate in candidates.into_iter().flatten() {
        if matches!(candidate, ExportError::Cancelled) {
            cancelled.get_or_insert(candidate);
        } else {
            return Some(candidate);
        }
    }
    cancelled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::VecSource;
    use crate::value::Value;
    use flate2::read::MultiGzDecoder;
    use std::io::Read;

    fn decompress(data: &[u8]) -> String {
        let mut out = String::new();
        MultiGzDecoder::new(data)
            .read_to_string(&mut out)
            .expect("valid gzip artifact");
        out
    }

    fn small_source() -> VecSource {
        VecSource::new(
            vec!["id".into(), "name".into()],
            vec![
                vec![Value::Int(1), Value::Text("ada".into())],
                vec![Value::Int(2), Value::Text("grace".into())],
            ],
        )
    }

    fn local_config() -> ExportConfig {
        ExportConfig {
            gzip_workers: 1,
            ..ExportConfig::default()
        }
    }

    #[tokio::test]
    async fn test_write_buffer_roundtrip() {
        let exporter = Exporter::new(local_config());
        let (artifact, rows) = exporter.write_buffer(small_source()).await.unwrap();

        assert_eq!(rows, 2);
        assert_eq!(decompress(&artifact), "id,name\n1,ada\n2,grace\n");
    }

    #[tokio::test]
    async fn test_header_override() {
        let config = ExportConfig {
            headers: vec!["a".into(), "b".into()],
            ..local_config()
        };
        let exporter = Exporter::new(config);
        let (artifact, _) = exporter.write_buffer(small_source()).await.unwrap();

        assert!(decompress(&artifact).starts_with("a,b\n"));
    }

    #[tokio::test]
    async fn test_headers_suppressed() {
        let config = ExportConfig {
            write_headers: false,
            ..local_config()
        };
        let exporter = Exporter::new(config);
        let (artifact, rows) = exporter.write_buffer(small_source()).await.unwrap();

        assert_eq!(rows, 2);
        assert_eq!(decompress(&artifact), "1,ada\n2,grace\n");
    }

    #[tokio::test]
    async fn test_filter_drops_rows_from_count() {
        let exporter = Exporter::new(local_config()).with_filter(|row, _cols| {
            let keep = row[0] != "1";
            (keep, row)
        });
        let (artifact, rows) = exporter.write_buffer(small_source()).await.unwrap();

        assert_eq!(rows, 1);
        assert_eq!(decompress(&artifact), "id,name\n2,grace\n");
    }

    #[tokio::test]
    async fn test_filter_rewrites_rows() {
        let exporter = Exporter::new(local_config()).with_filter(|mut row, _cols| {
            row[1] = row[1].to_uppercase();
            (true, row)
        });
        let (artifact, _) = exporter.write_buffer(small_source()).await.unwrap();

        assert_eq!(decompress(&artifact), "id,name\n1,ADA\n2,GRACE\n");
    }

    #[tokio::test]
    async fn test_width_changing_hook_fails_export() {
        let exporter = Exporter::new(local_config()).with_filter(|mut row, _cols| {
            row.push("extra".into());
            (true, row)
        });
        let err = exporter.write_buffer(small_source()).await.unwrap_err();
        assert!(matches!(
            err,
            ExportError::Encode(EncodeError::WidthMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_source_still_produces_header() {
        let source = VecSource::new(vec!["x".into()], vec![]);
        let exporter = Exporter::new(local_config());
        let (artifact, rows) = exporter.write_buffer(source).await.unwrap();

        assert_eq!(rows, 0);
        assert_eq!(decompress(&artifact), "x\n");
    }

    #[tokio::test]
    async fn test_pre_cancelled_export_fails() {
        let exporter = Exporter::new(local_config());
        exporter.cancellation_token().cancel();

        let err = exporter.write_buffer(small_source()).await.unwrap_err();
        assert!(matches!(err, ExportError::Cancelled));
    }

    #[tokio::test]
    async fn test_parallel_compression_same_content() {
        let serial = Exporter::new(local_config());
        let (serial_artifact, _) = serial.write_buffer(small_source()).await.unwrap();

        let parallel = Exporter::new(ExportConfig {
            gzip_workers: 3,
            ..ExportConfig::default()
        });
        let (parallel_artifact, _) = parallel.write_buffer(small_source()).await.unwrap();

        assert_eq!(decompress(&serial_artifact), decompress(&parallel_artifact));
    }
}
