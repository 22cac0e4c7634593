//! Metrics module
//!
//! Process-local Prometheus counters for the export pipeline.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Histogram, HistogramVec,
};

lazy_static! {
    // Row metrics
    pub static ref ROWS_EXPORTED_TOTAL: Counter = register_counter!(
        "suijin_rows_exported_total",
        "Rows accepted into the output after filtering"
    ).unwrap();

    pub static ref CSV_CHUNKS_TOTAL: Counter = register_counter!(
        "suijin_csv_chunks_total",
        "CSV batches flushed to the compressor"
    ).unwrap();

    // Upload metrics
    pub static ref PARTS_UPLOADED_TOTAL: CounterVec = register_counter_vec!(
        "suijin_parts_uploaded_total",
        "Parts acknowledged by the remote store",
        &["bucket"]
    ).unwrap();

    pub static ref PART_BYTES: Histogram = register_histogram!(
        "suijin_part_bytes",
        "Size of uploaded parts in bytes",
        prometheus::exponential_buckets(5_242_880.0, 2.0, 8).unwrap()
    ).unwrap();

    pub static ref UPLOAD_RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "suijin_upload_retries_total",
        "Part upload attempts that failed and were retried",
        &["bucket"]
    ).unwrap();

    pub static ref UPLOAD_FAILURES_TOTAL: CounterVec = register_counter_vec!(
        "suijin_upload_failures_total",
        "Parts abandoned after exhausting the retry cap",
        &["bucket"]
    ).unwrap();

    // Export outcomes
    pub static ref EXPORTS_TOTAL: CounterVec = register_counter_vec!(
        "suijin_exports_total",
        "Completed export invocations",
        &["mode", "outcome"]
    ).unwrap();

    pub static ref EXPORT_DURATION: HistogramVec = register_histogram_vec!(
        "suijin_export_duration_seconds",
        "End-to-end export duration in seconds",
        &["mode"],
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0]
    ).unwrap();
}

/// Record rows accepted into the output.
pub fn record_rows_exported(count: u64) {
    ROWS_EXPORTED_TOTAL.inc_by(count as f64);
}

/// Record a flushed CSV batch.
pub fn record_csv_chunk() {
    CSV_CHUNKS_TOTAL.inc();
}

/// Record an acknowledged part.
pub fn record_part_uploaded(bucket: &str, bytes: usize) {
    PARTS_UPLOADED_TOTAL.with_label_values(&[bucket]).inc();
    PART_BYTES.observe(bytes as f64);
}

/// Record a retried part attempt.
pub fn record_upload_retry(bucket: &str) {
    UPLOAD_RETRIES_TOTAL.with_label_values(&[bucket]).inc();
}

/// Record a part abandoned after the retry cap.
pub fn record_upload_failure(bucket: &str) {
    UPLOAD_FAILURES_TOTAL.with_label_values(&[bucket]).inc();
}

/// Record the terminal outcome of an export invocation.
pub fn record_export(mode: &str, outcome: &str, seconds: f64) {
    EXPORTS_TOTAL.with_label_values(&[mode, outcome]).inc();
    EXPORT_DURATION.with_label_values(&[mode]).observe(seconds);
}
