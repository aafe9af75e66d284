//! JSON lines parser: one object per non-blank line

use serde_json::Value;

use super::{offset, FetchResult, Item, ParseResult, Parser};
use crate::error::ImportResult;
use crate::state::{progress, StageMessage};

#[derive(Debug, Clone, Default)]
pub struct JsonLinesParser {
    pub key_field: Option<String>,
    /// Lines per batch; 0 parses everything at once
    pub line_limit: usize,
}

impl JsonLinesParser {
    pub fn new(key_field: Option<String>, line_limit: usize) -> Self {
        Self {
            key_field,
            line_limit,
        }
    }
}

impl Parser for JsonLinesParser {
    fn parse(&self, fetched: &FetchResult, pointer: Option<&Value>) -> ImportResult<ParseResult> {
        let lines: Vec<&str> = fetched
            .payload
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        let start = offset(pointer).min(lines.len());
        let end = if self.line_limit == 0 {
            lines.len()
        } else {
            start.saturating_add(self.line_limit).min(lines.len())
        };

        let mut items = Vec::new();
        let mut messages = Vec::new();
        for (index, line) in lines[start..end].iter().enumerate() {
            match serde_json::from_str::<Value>(line) {
                Ok(Value::Object(map)) => {
                    items.push(Item::new(map.into_iter().collect(), self.key_field.as_deref())?);
                },
                Ok(_) => messages.push(StageMessage::error(format!(
                    "Skipped line {}: not a JSON object",
                    start + index + 1
                ))),
                Err(e) => messages.push(StageMessage::error(format!(
                    "Skipped line {}: {}",
                    start + index + 1,
                    e
                ))),
            }
        }

        Ok(ParseResult {
            items,
            progress: progress(lines.len() as u64, end as u64),
            pointer: Some(Value::from(end as u64)),
            messages,
        })
    }
}
