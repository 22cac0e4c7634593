//! Shared test fixtures: an in-memory remote store with scriptable
//! failures and delays, plus config and source helpers.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use suijin_exportr::config::{ExportConfig, S3Config};
use suijin_exportr::remote::{
    CompletedPartInfo, MultipartSession, RemoteError, RemoteStore, RemoteTarget,
};
use suijin_exportr::source::{RowSource, SourceError, VecSource};
use suijin_exportr::value::Value;

/// Everything the fake store observed during a run.
#[derive(Default)]
pub struct FakeState {
    pub sessions_created: usize,
    pub aborts: usize,
    pub completed: Option<Vec<CompletedPartInfo>>,
    pub parts: HashMap<i32, Bytes>,
    pub arrival_order: Vec<i32>,
    pub direct: Option<Bytes>,
}

/// In-memory multipart store.
pub struct FakeStore {
    pub state: Mutex<FakeState>,
    fail_remaining: Mutex<HashMap<i32, usize>>,
    delays_ms: HashMap<i32, u64>,
}

impl FakeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            fail_remaining: Mutex::new(HashMap::new()),
            delays_ms: HashMap::new(),
        })
    }

    /// Fail `times` upload attempts for the given part before succeeding.
    pub fn failing(part_number: i32, times: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            fail_remaining: Mutex::new(HashMap::from([(part_number, times)])),
            delays_ms: HashMap::new(),
        })
    }

    /// Delay specific parts to force out-of-order completion.
    pub fn with_delays(delays_ms: HashMap<i32, u64>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState::default()),
            fail_remaining: Mutex::new(HashMap::new()),
            delays_ms,
        })
    }

    /// Reassemble the object from the parts named in the completion call,
    /// in the order they were submitted.
    pub fn assembled_object(&self) -> Vec<u8> {
        let state = self.state.lock();
        let completed = state.completed.as_ref().expect("no completion call");
        let mut out = Vec::new();
        for part in completed {
            out.extend_from_slice(&state.parts[&part.part_number]);
        }
        out
    }
}

#[async_trait]
impl RemoteStore for FakeStore {
    async fn create_multipart_upload(
        &self,
        target: &RemoteTarget,
    ) -> Result<MultipartSession, RemoteError> {
        let mut state = self.state.lock();
        state.sessions_created += 1;
        Ok(MultipartSession {
            bucket: target.bucket.clone(),
            key: target.key.clone(),
            upload_id: format!("fake-upload-{}", state.sessions_created),
        })
    }

    async fn upload_part(
        &self,
        _session: &MultipartSession,
        part_number: i32,
        body: Bytes,
    ) -> Result<String, RemoteError> {
        if let Some(ms) = self.delays_ms.get(&part_number) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }

        {
            let mut fails = self.fail_remaining.lock();
            if let Some(remaining) = fails.get_mut(&part_number) {
                if *remaining > 0 {
                    *remaining = remaining.saturating_sub(1);
                    return Err(RemoteError::Api {
                        op: "UploadPart",
                        message: format!("injected failure for part {part_number}"),
                    });
                }
            }
        }

        let mut state = self.state.lock();
        state.parts.insert(part_number, body);
        state.arrival_order.push(part_number);
        Ok(format!("\"etag-{part_number}\""))
    }

    async fn complete_multipart_upload(
        &self,
        _session: &MultipartSession,
        parts: &[CompletedPartInfo],
    ) -> Result<(), RemoteError> {
        self.state.lock().completed = Some(parts.to_vec());
        Ok(())
    }

    async fn abort_multipart_upload(&self, _session: &MultipartSession) -> Result<(), RemoteError> {
        self.state.lock().aborts += 1;
        Ok(())
    }

    async fn put_object(&self, _target: &RemoteTarget, body: Bytes) -> Result<(), RemoteError> {
        self.state.lock().direct = Some(body);
        Ok(())
    }
}

/// Upload-mode config against the fake store. Stored-block compression
/// keeps the compressed size within a hair of the raw size, so part-count
/// expectations stay deterministic.
pub fn upload_config(part_size: usize) -> ExportConfig {
    ExportConfig {
        compression_level: 0,
        gzip_workers: 1,
        row_batch_size: 1000,
        part_size,
        upload_workers: 2,
        s3: Some(S3Config {
            bucket: "test-bucket".into(),
            region: "us-east-1".into(),
            path: "exports/test.csv.gz".into(),
            acl: None,
            endpoint: None,
        }),
        ..ExportConfig::default()
    }
}

/// `rows` rows of two fixed 60-byte fields: 122 bytes of CSV per row.
pub fn wide_source(rows: usize) -> VecSource {
    let field = "x".repeat(60);
    let row = vec![
        Value::Text(field.clone()),
        Value::Text(field),
    ];
    VecSource::new(
        vec!["left".into(), "right".into()],
        std::iter::repeat_with(|| row.clone()).take(rows).collect(),
    )
}

/// Source that cancels the export token after a fixed number of rows and
/// counts how many rows the pipeline actually pulled.
pub struct CancellingSource {
    inner: VecSource,
    cancel_after: u64,
    pulled: Arc<std::sync::atomic::AtomicU64>,
    token: tokio_util::sync::CancellationToken,
}

impl CancellingSource {
    pub fn new(
        inner: VecSource,
        cancel_after: u64,
        token: tokio_util::sync::CancellationToken,
    ) -> (Self, Arc<std::sync::atomic::AtomicU64>) {
        let pulled = Arc::new(std::sync::atomic::AtomicU64::new(0));
        (
            Self {
                inner,
                cancel_after,
                pulled: Arc::clone(&pulled),
                token,
            },
            pulled,
        )
    }
}

impl RowSource for CancellingSource {
    fn columns(&mut self) -> Result<Vec<String>, SourceError> {
        self.inner.columns()
    }

    fn next_row(&mut self) -> Result<Option<Vec<Value>>, SourceError> {
        let n = self
            .pulled
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if n == self.cancel_after {
            self.token.cancel();
        }
        self.inner.next_row()
    }
}
