//! Remote instrument source contracts and paging.
//!
//! # Responsibility
//! - Define the connector SPI used to pull raw records page by page.
//! - Provide a lazy, restartable page iterator over any connector.
//!
//! # Invariants
//! - `since` is advisory: connectors may return more than the delta.
//! - A failed page fetch never advances the cursor, so the next call retries
//!   the same page.
//! - Connectors must bound each request by `PageRequest::timeout` and report
//!   an expired budget as `SourceError::Timeout`. `Pages` also rejects a page
//!   that arrived late, but cannot interrupt a connector that ignores the
//!   budget.
//! - A page that takes longer than the configured timeout is reported as
//!   `SourceError::Timeout` and is not consumed.

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

mod http;
mod json_file;

pub use http::{HttpAuth, HttpListSource, HttpOptions};
pub use json_file::JsonFileSource;

pub type SourceResult<T> = Result<T, SourceError>;

/// Source-side failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Network or authentication failure; retryable.
    Unavailable(String),
    /// One page exceeded its time budget; retryable.
    Timeout { elapsed_ms: u64, limit_ms: u64 },
    /// A page violates the expected shape; fatal for the session.
    Malformed(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(message) => write!(f, "source unavailable: {message}"),
            Self::Timeout {
                elapsed_ms,
                limit_ms,
            } => write!(f, "page fetch took {elapsed_ms} ms (limit {limit_ms} ms)"),
            Self::Malformed(message) => write!(f, "source page malformed: {message}"),
        }
    }
}

impl Error for SourceError {}

/// One record exactly as delivered by the list service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord {
    fields: Map<String, Value>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Builder-style field insertion.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// First present, non-null value among `keys`, with the key that matched.
    pub fn first_of<'a>(&'a self, keys: &[&'a str]) -> Option<(&'a str, &'a Value)> {
        keys.iter().find_map(|key| match self.fields.get(*key) {
            Some(Value::Null) | None => None,
            Some(value) => Some((*key, value)),
        })
    }
}

/// Converts the `index`-th item of a page body into a record.
pub(crate) fn record_from_value(index: usize, item: Value) -> SourceResult<RawRecord> {
    match item {
        Value::Object(fields) => Ok(RawRecord::from_map(fields)),
        other => Err(SourceError::Malformed(format!(
            "record {index} is not an object: {other}"
        ))),
    }
}

/// Parameters of one page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub since: Option<i64>,
    /// Opaque cursor returned by the previous page; `None` for the first page.
    pub cursor: Option<String>,
    pub page_size: u32,
    /// Hard budget for this request. Connectors must abort once it is spent
    /// and return `SourceError::Timeout`; blocking past it stalls the session.
    pub timeout: Duration,
}

/// One page of raw records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourcePage {
    pub records: Vec<RawRecord>,
    /// `None` marks the last page.
    pub next_cursor: Option<String>,
}

/// Options shared by every page of one `fetch_all` sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    pub since: Option<i64>,
    pub page_size: u32,
    pub timeout: Duration,
}

/// Connector SPI for the remote list service.
pub trait SourceConnector {
    /// Stable identifier used in logs.
    fn source_id(&self) -> &str;

    /// Fetches one page.
    fn fetch_page(&self, request: &PageRequest) -> SourceResult<SourcePage>;

    /// Lazy page sequence starting at the first page.
    fn fetch_all(&self, options: FetchOptions) -> Pages<'_>
    where
        Self: Sized,
    {
        Pages::new(self, options)
    }
}

/// Lazy, restartable page iterator.
///
/// Iteration yields `Err` for a failed page without advancing; calling
/// `next` again re-requests the same page.
pub struct Pages<'a> {
    source: &'a dyn SourceConnector,
    options: FetchOptions,
    cursor: Option<String>,
    finished: bool,
    pages_fetched: u64,
}

impl<'a> Pages<'a> {
    pub fn new(source: &'a dyn SourceConnector, options: FetchOptions) -> Self {
        Self {
            source,
            options,
            cursor: None,
            finished: false,
            pages_fetched: 0,
        }
    }

    /// Fetches the next page, or `Ok(None)` after the last one.
    pub fn next_page(&mut self) -> SourceResult<Option<SourcePage>> {
        if self.finished {
            return Ok(None);
        }

        let request = PageRequest {
            since: self.options.since,
            cursor: self.cursor.clone(),
            page_size: self.options.page_size,
            timeout: self.options.timeout,
        };
        let started_at = Instant::now();
        let page = self.source.fetch_page(&request)?;
        let elapsed = started_at.elapsed();
        if elapsed > self.options.timeout {
            return Err(SourceError::Timeout {
                elapsed_ms: duration_ms(elapsed),
                limit_ms: duration_ms(self.options.timeout),
            });
        }

        match &page.next_cursor {
            Some(next) if self.cursor.as_ref() == Some(next) => {
                return Err(SourceError::Malformed(format!(
                    "cursor `{next}` did not advance"
                )));
            }
            Some(next) => self.cursor = Some(next.clone()),
            None => self.finished = true,
        }
        self.pages_fetched += 1;
        debug!(
            "event=source_page module=source status=ok source={} page={} records={} last={}",
            self.source.source_id(),
            self.pages_fetched,
            page.records.len(),
            self.finished
        );
        Ok(Some(page))
    }

    /// Rewinds to the first page.
    pub fn restart(&mut self) {
        self.cursor = None;
        self.finished = false;
        self.pages_fetched = 0;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }
}

impl Iterator for Pages<'_> {
    type Item = SourceResult<SourcePage>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_page().transpose()
    }
}

pub(crate) fn duration_ms(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}
