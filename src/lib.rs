//! Suijin Exportr Library
//!
//! Streams an ordered cursor of rows into a single gzipped CSV artifact,
//! written locally or delivered to S3 via multipart upload under bounded
//! memory.
//!
//! # Features
//!
//! - **Staged pipeline**: intake, preprocessing, CSV encoding, compression,
//!   and upload run concurrently, linked by bounded queues for backpressure
//! - **Multi-core gzip**: optional block-parallel compression that still
//!   emits one valid gzip stream
//! - **Multipart upload**: parts cut on the fly with merge-on-undersize,
//!   delivered by a retrying worker pool, completed in part-number order
//! - **Clean unwinding**: any failure or Ctrl-C aborts an open session
//!   before the error is returned
//!
//! # Example
//!
//! ```no_run
//! use suijin_exportr::config::ExportConfig;
//! use suijin_exportr::pipeline::Exporter;
//! use suijin_exportr::source::VecSource;
//! use suijin_exportr::value::Value;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let source = VecSource::new(
//!         vec!["id".into(), "name".into()],
//!         vec![vec![Value::Int(1), Value::Text("ada".into())]],
//!     );
//!
//!     let config = ExportConfig::load("config.yaml")?;
//!     let rows = Exporter::new(config).write_file(source, "out.csv.gz").await?;
//!     println!("exported {rows} rows");
//!     Ok(())
//! }
//! ```

pub mod compress;
pub mod config;
pub mod encode;
pub mod metrics;
pub mod pipeline;
pub mod remote;
pub mod segment;
pub mod source;
pub mod upload;
pub mod value;

// Re-export commonly used types
pub use config::ExportConfig;
pub use pipeline::{Exporter, ExportError};
pub use source::RowSource;
pub use value::Value;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
