//! Bookmark feed loading: a JSON array or newline-delimited JSON.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use markwise_shared::{MarkwiseError, RecordId, Result, SourceRecord};

#[derive(Debug, Deserialize)]
struct FeedEntry {
    #[serde(default)]
    id: Option<RecordId>,
    #[serde(default, alias = "title")]
    name: Option<String>,
    url: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl FeedEntry {
    fn into_record(self, position: usize) -> Result<SourceRecord> {
        let url = self.url.trim().to_string();
        if url.is_empty() {
            return Err(MarkwiseError::validation(format!(
                "record {position}: url is empty"
            )));
        }
        let mut record = SourceRecord::new(self.name.unwrap_or_default().trim(), url);
        if let Some(id) = self.id {
            record.id = id;
        }
        if let Some(created_at) = self.created_at {
            record.created_at = created_at;
        }
        Ok(record)
    }
}

/// Read records from `path`. A file whose first non-blank character is `[`
/// is a JSON array; anything else is read as one JSON object per line.
pub(crate) fn load_records(path: &Path) -> Result<Vec<SourceRecord>> {
    let text = std::fs::read_to_string(path).map_err(|e| MarkwiseError::io(path, e))?;
    parse_records(&text)
}

pub(crate) fn parse_records(text: &str) -> Result<Vec<SourceRecord>> {
    if text.trim_start().starts_with('[') {
        let entries: Vec<FeedEntry> = serde_json::from_str(text)
            .map_err(|e| MarkwiseError::validation(format!("invalid record array: {e}")))?;
        return entries
            .into_iter()
            .enumerate()
            .map(|(i, entry)| entry.into_record(i + 1))
            .collect();
    }

    let mut records = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let entry: FeedEntry = serde_json::from_str(line)
            .map_err(|e| MarkwiseError::validation(format!("line {}: {e}", i + 1)))?;
        records.push(entry.into_record(i + 1)?);
    }
    Ok(records)
}
