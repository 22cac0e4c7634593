//! Row sources
//!
//! A [`RowSource`] is the cursor the export pipeline pulls from: a column
//! list fixed at stream start and a blocking `next_row` that yields typed
//! values until exhaustion. Database adapters implement this trait outside
//! the crate; [`VecSource`] and [`CsvReaderSource`] cover tests and the CLI.

use crate::value::Value;
use std::io::Read;
use thiserror::Error;

/// Row source errors
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("cursor error: {0}")]
    Cursor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV input error: {0}")]
    Csv(#[from] csv::Error),
}

/// An ordered cursor of structured rows.
///
/// `next_row` is a blocking call; the pipeline drives it from a dedicated
/// blocking task so a slow cursor never stalls the async stages.
pub trait RowSource: Send {
    /// Column names, fixed for the lifetime of the stream.
    fn columns(&mut self) -> Result<Vec<String>, SourceError>;

    /// Fetch the next row, or `None` once the cursor is exhausted.
    fn next_row(&mut self) -> Result<Option<Vec<Value>>, SourceError>;
}

/// In-memory row source.
pub struct VecSource {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Vec<Value>>,
}

impl VecSource {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
        }
    }
}

impl RowSource for VecSource {
    fn columns(&mut self) -> Result<Vec<String>, SourceError> {
        Ok(self.columns.clone())
    }

    fn next_row(&mut self) -> Result<Option<Vec<Value>>, SourceError> {
        Ok(self.rows.next())
    }
}

/// Row source over delimited text input (files, stdin).
///
/// The first record is taken as the column names; every field is surfaced
/// as [`Value::Text`].
pub struct CsvReaderSource {
    reader: csv::Reader<Box<dyn Read + Send>>,
    record: csv::StringRecord,
}

impl CsvReaderSource {
    pub fn new(input: Box<dyn Read + Send>, delimiter: u8) -> Self {
        let reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_reader(input);
        Self {
            reader,
            record: csv::StringRecord::new(),
        }
    }
}

impl RowSource for CsvReaderSource {
    fn columns(&mut self) -> Result<Vec<String>, SourceError> {
        let headers = self.reader.headers()?;
        Ok(headers.iter().map(str::to_string).collect())
    }

    fn next_row(&mut self) -> Result<Option<Vec<Value>>, SourceError> {
        if !self.reader.read_record(&mut self.record)? {
            return Ok(None);
        }
        Ok(Some(
            self.record
                .iter()
                .map(|f| Value::Text(f.to_string()))
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_source_drains_in_order() {
        let mut source = VecSource::new(
            vec!["id".into(), "name".into()],
            vec![
                vec![Value::Int(1), Value::Text("a".into())],
                vec![Value::Int(2), Value::Text("b".into())],
            ],
        );

        assert_eq!(source.columns().unwrap(), vec!["id", "name"]);
        assert_eq!(
            source.next_row().unwrap(),
            Some(vec![Value::Int(1), Value::Text("a".into())])
        );
        assert_eq!(
            source.next_row().unwrap(),
            Some(vec![Value::Int(2), Value::Text("b".into())])
        );
        assert_eq!(source.next_row().unwrap(), None);
    }

    #[test]
    fn test_csv_reader_source() {
        let input = "id,name\n1,alice\n2,bob\n";
        let mut source =
            CsvReaderSource::new(Box::new(std::io::Cursor::new(input.to_string())), b',');

        assert_eq!(source.columns().unwrap(), vec!["id", "name"]);
        let row = source.next_row().unwrap().unwrap();
        assert_eq!(row, vec![Value::Text("1".into()), Value::Text("alice".into())]);
        let row = source.next_row().unwrap().unwrap();
        assert_eq!(row, vec![Value::Text("2".into()), Value::Text("bob".into())]);
        assert!(source.next_row().unwrap().is_none());
    }
}
