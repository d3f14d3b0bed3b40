//! Connector over a JSON export of the instrument list.
//!
//! Accepted documents: a top-level array of record objects, or an object
//! with a `records` array. The file is re-read for every page so each
//! `fetch_all` sequence sees the current export. Cursors are record offsets.

use super::{
    record_from_value, PageRequest, SourceConnector, SourceError, SourcePage, SourceResult,
};
use serde_json::Value;
use std::path::{Path, PathBuf};

pub struct JsonFileSource {
    path: PathBuf,
    source_id: String,
}

impl JsonFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let source_id = format!("json_file:{}", path.display());
        Self { path, source_id }
    }

    fn load_records(&self) -> SourceResult<Vec<Value>> {
        let text = std::fs::read_to_string(&self.path).map_err(|err| {
            SourceError::Unavailable(format!("cannot read `{}`: {err}", self.path.display()))
        })?;
        let document: Value = serde_json::from_str(&text)
            .map_err(|err| SourceError::Malformed(format!("invalid json: {err}")))?;

        match document {
            Value::Array(items) => Ok(items),
            Value::Object(mut object) => match object.remove("records") {
                Some(Value::Array(items)) => Ok(items),
                _ => Err(SourceError::Malformed(
                    "expected a `records` array".to_string(),
                )),
            },
            _ => Err(SourceError::Malformed(
                "expected an array of records".to_string(),
            )),
        }
    }
}

impl SourceConnector for JsonFileSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn fetch_page(&self, request: &PageRequest) -> SourceResult<SourcePage> {
        let items = self.load_records()?;
        let offset = match request.cursor.as_deref() {
            None => 0,
            Some(cursor) => cursor.parse::<usize>().map_err(|_| {
                SourceError::Malformed(format!("invalid cursor `{cursor}`"))
            })?,
        };
        let total = items.len();
        let page_size = usize::try_from(request.page_size.max(1)).unwrap_or(usize::MAX);
        let end = offset.saturating_add(page_size).min(total);

        let records = items
            .into_iter()
            .enumerate()
            .take(end)
            .skip(offset)
            .map(|(index, item)| record_from_value(index, item))
            .collect::<SourceResult<Vec<_>>>()?;

        let next_cursor = (end < total).then(|| end.to_string());
        Ok(SourcePage {
            records,
            next_cursor,
        })
    }
}
