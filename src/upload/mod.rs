//! Upload queue and worker pool
//!
//! A fixed pool of workers drains the bounded part queue concurrently.
//! Each part gets up to three delivery attempts with immediate retry;
//! acknowledged parts land in the shared completed list under a lock.
//! Retry exhaustion raises the shared cancellation signal so the rest of
//! the pipeline unwinds and the controller aborts the session.
//!
//! Workers complete parts in whatever order the network allows; the
//! controller re-sorts by part number before issuing the completion call.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics;
use crate::remote::{CompletedPartInfo, MultipartSession, RemoteError, RemoteStore};
use crate::segment::CompressedPart;

/// Delivery attempts per part before the export is failed.
pub const MAX_RETRIES: usize = 3;

/// Upload errors
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("part {part_number} failed after {MAX_RETRIES} attempts: {source}")]
    RetriesExhausted {
        part_number: i32,
        source: RemoteError,
    },
}

/// Shared, lock-guarded collection of acknowledged parts.
pub type CompletedParts = Arc<parking_lot::Mutex<Vec<CompletedPartInfo>>>;

/// Spawn the worker pool over a shared part queue.
///
/// Workers exit cleanly when the queue closes or the token fires; a worker
/// that exhausts its retries cancels the token itself and returns the
/// error through its join handle.
pub fn spawn_workers(
    workers: usize,
    store: Arc<dyn RemoteStore>,
    session: MultipartSession,
    rx: mpsc::Receiver<CompressedPart>,
    completed: CompletedParts,
    token: CancellationToken,
) -> Vec<JoinHandle<Result<(), UploadError>>> {
    let rx = Arc::new(Mutex::new(rx));

    (0..workers)
        .map(|worker_id| {
            let store = Arc::clone(&store);
            let session = session.clone();
            let rx = Arc::clone(&rx);
            let completed = Arc::clone(&completed);
            let token = token.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, store, session, rx, completed, token).await
            })
        })
        .collect()
}

async fn worker_loop(
    worker_id: usize,
    store: Arc<dyn RemoteStore>,
    session: MultipartSession,
    rx: Arc<Mutex<mpsc::Receiver<CompressedPart>>>,
    completed: CompletedParts,
    token: CancellationToken,
) -> Result<(), UploadError> {
    loop {
        let part = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!(worker_id, "upload worker stopping on cancellation");
                    return Ok(());
                }
                part = rx.recv() => part,
            }
        };

        let Some(part) = part else {
            // Queue closed and drained.
            return Ok(());
        };

        let part_number = part.part_number;
        let size = part.data.len();

        match upload_with_retry(store.as_ref(), &session, part).await {
            Ok(etag) => {
                completed.lock().push(CompletedPartInfo { part_number, etag });
                metrics::record_part_uploaded(&session.bucket, size);
                tracing::info!(worker_id, part_number, bytes = size, "uploaded part");
            }
            Err(err) => {
                tracing::error!(worker_id, part_number, error = %err, "giving up on part");
                metrics::record_upload_failure(&session.bucket);
                token.cancel();
                return Err(err);
            }
        }
    }
}

async fn upload_with_retry(
    store: &dyn RemoteStore,
    session: &MultipartSession,
    part: CompressedPart,
) -> Result<String, UploadError> {
    let mut attempt = 1;
    loop {
        match store
            .upload_part(session, part.part_number, part.data.clone())
            .await
        {
            Ok(etag) => return Ok(etag),
            Err(err) if attempt < MAX_RETRIES => {
                tracing::warn!(
                    part_number = part.part_number,
                    attempt,
                    error = %err,
                    "retrying part upload"
                );
                metrics::record_upload_retry(&session.bucket);
                attempt += 1;
            }
            Err(err) => {
                return Err(UploadError::RetriesExhausted {
                    part_number: part.part_number,
                    source: err,
                })
            }
        }
    }
}
