//! Configuration module
//!
//! Export settings with YAML loading, environment variable expansion, and
//! validation. Every knob is a pass-through to one pipeline stage: CSV
//! shaping, compression, part segmentation, or the upload pool.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::segment::MIN_PART_SIZE;

mod loader;

pub use loader::ConfigLoader;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Export pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// CSV field delimiter. Must be a single ASCII character.
    #[serde(default = "default_delimiter")]
    pub delimiter: char,

    /// Emit the header row.
    #[serde(default = "default_write_headers")]
    pub write_headers: bool,

    /// Header override; column names from the row source when empty.
    #[serde(default)]
    pub headers: Vec<String>,

    /// chrono format string applied to timestamp values.
    #[serde(default)]
    pub time_format: Option<String>,

    /// gzip level, 0-9.
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// Rows per CSV batch. 0 picks an adaptive default.
    #[serde(default)]
    pub row_batch_size: usize,

    /// Byte threshold that flushes a CSV batch early.
    #[serde(default = "default_csv_buffer_size")]
    pub csv_buffer_size: usize,

    /// Compression worker threads. 1 selects the single-stream encoder.
    #[serde(default = "default_gzip_workers")]
    pub gzip_workers: usize,

    /// Bytes handed to each compression worker per block.
    #[serde(default = "default_gzip_block_size")]
    pub gzip_block_size: usize,

    /// Accumulated compressed bytes that trigger a part cut.
    #[serde(default = "default_part_size")]
    pub part_size: usize,

    /// Upload worker tasks; also the part queue capacity.
    #[serde(default = "default_upload_workers")]
    pub upload_workers: usize,

    /// Remote destination; local-only export when absent.
    #[serde(default)]
    pub s3: Option<S3Config>,
}

/// S3 destination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Object key for the exported artifact.
    pub path: String,
    #[serde(default)]
    pub acl: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            write_headers: default_write_headers(),
            headers: Vec::new(),
            time_format: None,
            compression_level: default_compression_level(),
            row_batch_size: 0,
            csv_buffer_size: default_csv_buffer_size(),
            gzip_workers: default_gzip_workers(),
            gzip_block_size: default_gzip_block_size(),
            part_size: default_part_size(),
            upload_workers: default_upload_workers(),
            s3: None,
        }
    }
}

impl ExportConfig {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration.
    ///
    /// Upload-specific constraints are only enforced when an S3 section is
    /// present; in particular a part size below the protocol minimum is
    /// rejected here, before any remote session is opened.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.delimiter.is_ascii() {
            return Err(ConfigError::Validation(format!(
                "delimiter '{}' is not a single ASCII character",
                self.delimiter
            )));
        }
        if self.compression_level > 9 {
            return Err(ConfigError::Validation(format!(
                "compression level {} out of range (0-9)",
                self.compression_level
            )));
        }
        if self.csv_buffer_size == 0 {
            return Err(ConfigError::Validation(
                "csv_buffer_size must be non-zero".into(),
            ));
        }
        if self.gzip_workers == 0 {
            return Err(ConfigError::Validation(
                "gzip_workers must be non-zero".into(),
            ));
        }
        if self.gzip_block_size == 0 {
            return Err(ConfigError::Validation(
                "gzip_block_size must be non-zero".into(),
            ));
        }

        if let Some(s3) = &self.s3 {
            if s3.bucket.is_empty() || s3.region.is_empty() {
                return Err(ConfigError::Validation(
                    "both bucket and region are needed to upload to S3".into(),
                ));
            }
            if s3.path.is_empty() {
                return Err(ConfigError::Validation("S3 object path is empty".into()));
            }
            if self.part_size < MIN_PART_SIZE {
                return Err(ConfigError::Validation(format!(
                    "part_size {} is below the {} byte multipart minimum",
                    self.part_size, MIN_PART_SIZE
                )));
            }
            if self.upload_workers == 0 {
                return Err(ConfigError::Validation(
                    "upload_workers must be non-zero".into(),
                ));
            }
        }

        Ok(())
    }

    /// The delimiter as the single byte the CSV writer wants.
    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter as u8
    }

    /// Rows per batch, resolved against the column count.
    ///
    /// When unset, starts from 4096 and, with multi-worker compression,
    /// doubles until a batch covers roughly one compression block
    /// (batch x columns > 65536), then once more for headroom.
    pub fn effective_row_batch_size(&self, columns: usize) -> usize {
        if self.row_batch_size != 0 {
            return self.row_batch_size;
        }

        let mut batch = 4096usize;
        if self.gzip_workers <= 1 {
            return batch;
        }

        while batch * columns.max(1) <= 65536 {
            batch *= 2;
        }
        batch * 2
    }
}

fn default_delimiter() -> char {
    ','
}

fn default_write_headers() -> bool {
    true
}

fn default_compression_level() -> u32 {
    6
}

fn default_csv_buffer_size() -> usize {
    10 * 1024 * 1024
}

fn default_gzip_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_gzip_block_size() -> usize {
    512 * 1024
}

fn default_part_size() -> usize {
    50 * 1024 * 1024
}

fn default_upload_workers() -> usize {
    4
}
