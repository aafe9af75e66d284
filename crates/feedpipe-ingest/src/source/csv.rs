//! CSV parser
//!
//! The first row holds column names. With a line limit, each call yields at
//! most that many records and resumes at the record offset in the pointer.

use serde_json::Value;
use std::collections::BTreeMap;

use super::{offset, FetchResult, Item, ParseResult, Parser};
use crate::error::{ImportError, ImportResult};
use crate::state::{progress, StageMessage};

#[derive(Debug, Clone)]
pub struct CsvParser {
    pub key_column: Option<String>,
    pub delimiter: u8,
    /// Records per batch; 0 parses everything at once
    pub line_limit: usize,
}

impl Default for CsvParser {
    fn default() -> Self {
        Self {
            key_column: None,
            delimiter: b',',
            line_limit: 0,
        }
    }
}

impl CsvParser {
    pub fn new(key_column: Option<String>, delimiter: u8, line_limit: usize) -> Self {
        Self {
            key_column,
            delimiter,
            line_limit,
        }
    }
}

impl Parser for CsvParser {
    fn parse(&self, fetched: &FetchResult, pointer: Option<&Value>) -> ImportResult<ParseResult> {
        let mut reader = ::csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .trim(::csv::Trim::All)
            .from_reader(fetched.payload.as_bytes());

        let headers = reader
            .headers()
            .map_err(|e| ImportError::recoverable(format!("Invalid CSV header: {}", e)))?
            .clone();

        let start = offset(pointer);
        let limit = if self.line_limit == 0 {
            usize::MAX
        } else {
            self.line_limit
        };

        let mut items = Vec::new();
        let mut messages = Vec::new();
        let mut total = 0usize;

        for (index, record) in reader.records().enumerate() {
            total += 1;
            if index < start || index - start >= limit {
                continue;
            }
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    messages.push(StageMessage::error(format!("Skipped CSV record {}: {}", index + 1, e)));
                    continue;
                },
            };

            let fields: BTreeMap<String, Value> = headers
                .iter()
                .zip(record.iter())
                .map(|(name, value)| (name.to_string(), Value::String(value.to_string())))
                .collect();
            items.push(Item::new(fields, self.key_column.as_deref())?);
        }

        let consumed = total.min(start.saturating_add(limit));
        Ok(ParseResult {
            items,
            progress: progress(total as u64, consumed as u64),
            pointer: Some(Value::from(consumed as u64)),
            messages,
        })
    }
}
