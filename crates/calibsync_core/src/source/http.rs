//! Connector for a paged JSON list service over HTTP.
//!
//! Request: `GET <url>?page_size=N[&cursor=C][&since=MS]`. A cursor that is an
//! absolute URL (an OData `@odata.nextLink`) is requested as is.
//!
//! Response: an array of records, or an object holding them under `records`,
//! `items` or `value`, with the next cursor under `next_cursor` or
//! `@odata.nextLink`.
//!
//! # Invariants
//! - Every request is bounded by `PageRequest::timeout` on the client.
//! - Transport failures, rejected credentials, throttling and server errors
//!   are `Unavailable` (retryable); a spent budget is `Timeout`; other client
//!   errors and unreadable bodies are `Malformed`.

use super::{
    duration_ms, record_from_value, PageRequest, SourceConnector, SourceError, SourcePage,
    SourceResult,
};
use log::debug;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde_json::{Map, Value};
use std::fmt::{Debug, Formatter};
use std::time::{Duration, Instant};

const RECORD_KEYS: [&str; 3] = ["records", "items", "value"];
const NEXT_CURSOR_KEYS: [&str; 2] = ["next_cursor", "@odata.nextLink"];

/// Credentials sent with every request.
#[derive(Clone, PartialEq, Eq)]
pub enum HttpAuth {
    None,
    Basic {
        username: String,
        password: Option<String>,
    },
    Bearer(String),
}

impl Debug for HttpAuth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Bearer(_) => f.write_str("Bearer(<redacted>)"),
        }
    }
}

/// Client settings that hold for every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpOptions {
    pub connect_timeout: Duration,
    /// Route requests through the proxy named by `HTTP_PROXY`/`HTTPS_PROXY`.
    pub use_system_proxy: bool,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            use_system_proxy: true,
        }
    }
}

pub struct HttpListSource {
    client: Client,
    url: String,
    auth: HttpAuth,
    source_id: String,
}

impl HttpListSource {
    pub fn new(url: impl Into<String>, auth: HttpAuth) -> SourceResult<Self> {
        Self::with_options(url, auth, HttpOptions::default())
    }

    pub fn with_options(
        url: impl Into<String>,
        auth: HttpAuth,
        options: HttpOptions,
    ) -> SourceResult<Self> {
        let url = url.into();
        let mut builder = Client::builder()
            .connect_timeout(options.connect_timeout)
            .user_agent(concat!("calibsync/", env!("CARGO_PKG_VERSION")));
        if !options.use_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder
            .build()
            .map_err(|err| SourceError::Unavailable(format!("cannot build http client: {err}")))?;
        Ok(Self {
            source_id: format!("http:{url}"),
            client,
            url,
            auth,
        })
    }

    fn build_request(&self, request: &PageRequest) -> RequestBuilder {
        let builder = match request.cursor.as_deref() {
            Some(next_link) if is_absolute_url(next_link) => self.client.get(next_link),
            cursor => {
                let mut query = vec![("page_size", request.page_size.to_string())];
                if let Some(cursor) = cursor {
                    query.push(("cursor", cursor.to_string()));
                }
                if let Some(since) = request.since {
                    query.push(("since", since.to_string()));
                }
                self.client.get(&self.url).query(&query)
            }
        };
        let builder = builder
            .timeout(request.timeout)
            .header(ACCEPT, "application/json");
        match &self.auth {
            HttpAuth::None => builder,
            HttpAuth::Basic { username, password } => {
                builder.basic_auth(username, password.as_deref())
            }
            HttpAuth::Bearer(token) => builder.bearer_auth(token),
        }
    }
}

impl SourceConnector for HttpListSource {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn fetch_page(&self, request: &PageRequest) -> SourceResult<SourcePage> {
        let started_at = Instant::now();
        let response = self
            .build_request(request)
            .send()
            .map_err(|err| transport_error(&err, started_at, request.timeout))?;

        let status = response.status();
        if !status.is_success() {
            debug!(
                "event=source_page module=source status=http_error source={} http_status={}",
                self.source_id,
                status.as_u16()
            );
            return Err(status_error(status));
        }

        let body = response
            .text()
            .map_err(|err| transport_error(&err, started_at, request.timeout))?;
        let document: Value = serde_json::from_str(&body)
            .map_err(|err| SourceError::Malformed(format!("invalid json: {err}")))?;
        parse_page(document)
    }
}

fn is_absolute_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn transport_error(err: &reqwest::Error, started_at: Instant, limit: Duration) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout {
            elapsed_ms: duration_ms(started_at.elapsed()),
            limit_ms: duration_ms(limit),
        }
    } else {
        SourceError::Unavailable(format!("request failed: {err}"))
    }
}

fn status_error(status: StatusCode) -> SourceError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SourceError::Unavailable(format!("credentials rejected ({status})"))
        }
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            SourceError::Unavailable(format!("service throttled ({status})"))
        }
        status if status.is_server_error() => {
            SourceError::Unavailable(format!("service error ({status})"))
        }
        status => SourceError::Malformed(format!("unexpected response status {status}")),
    }
}

fn parse_page(document: Value) -> SourceResult<SourcePage> {
    let (items, next_cursor) = match document {
        Value::Array(items) => (items, None),
        Value::Object(mut object) => {
            let items = match take_first(&mut object, &RECORD_KEYS) {
                Some(Value::Array(items)) => items,
                Some(other) => {
                    return Err(SourceError::Malformed(format!(
                        "record list is not an array: {other}"
                    )));
                }
                None => {
                    return Err(SourceError::Malformed(
                        "expected a `records`, `items` or `value` array".to_string(),
                    ));
                }
            };
            let next_cursor = match take_first(&mut object, &NEXT_CURSOR_KEYS) {
                None | Some(Value::Null) => None,
                Some(Value::String(cursor)) if cursor.is_empty() => None,
                Some(Value::String(cursor)) => Some(cursor),
                Some(Value::Number(cursor)) => Some(cursor.to_string()),
                Some(other) => {
                    return Err(SourceError::Malformed(format!(
                        "invalid next cursor: {other}"
                    )));
                }
            };
            (items, next_cursor)
        }
        other => {
            return Err(SourceError::Malformed(format!(
                "expected a json array or object, got {other}"
            )));
        }
    };

    let records = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| record_from_value(index, item))
        .collect::<SourceResult<Vec<_>>>()?;
    Ok(SourcePage {
        records,
        next_cursor,
    })
}

fn take_first(object: &mut Map<String, Value>, keys: &[&str]) -> Option<Value> {
    keys.iter().find_map(|key| object.remove(*key))
}

#[cfg(test)]
mod tests {
    use super::{parse_page, status_error, HttpAuth};
    use crate::source::SourceError;
    use reqwest::StatusCode;
    use serde_json::json;

    #[test]
    fn parses_odata_shape_with_next_link() {
        let page = parse_page(json!({
            "value": [{ "Title": "INS-1" }, { "Title": "INS-2" }],
            "@odata.nextLink": "https://lists.example/items?$skiptoken=2"
        }))
        .expect("odata page");
        assert_eq!(page.records.len(), 2);
        assert_eq!(
            page.next_cursor.as_deref(),
            Some("https://lists.example/items?$skiptoken=2")
        );
    }

    #[test]
    fn empty_or_null_cursor_ends_paging() {
        let page = parse_page(json!({ "records": [], "next_cursor": "" })).expect("page");
        assert!(page.next_cursor.is_none());
        let page = parse_page(json!({ "items": [], "next_cursor": null })).expect("page");
        assert!(page.next_cursor.is_none());
        let page = parse_page(json!([{ "external_id": "A" }])).expect("bare array");
        assert_eq!(page.records.len(), 1);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn unexpected_shapes_are_malformed() {
        for document in [
            json!({ "data": [] }),
            json!({ "records": {} }),
            json!({ "records": [], "next_cursor": [1] }),
            json!([1, 2]),
            json!("text"),
        ] {
            let err = parse_page(document).expect_err("shape should be rejected");
            assert!(matches!(err, SourceError::Malformed(_)), "{err}");
        }
    }

    #[test]
    fn status_codes_split_into_retryable_and_fatal() {
        for status in [
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(status_error(status).is_retryable(), "{status}");
        }
        for status in [StatusCode::BAD_REQUEST, StatusCode::NOT_FOUND] {
            assert!(
                matches!(status_error(status), SourceError::Malformed(_)),
                "{status}"
            );
        }
    }

    #[test]
    fn debug_output_hides_secrets() {
        let basic = HttpAuth::Basic {
            username: "svc-calib".to_string(),
            password: Some("hunter2".to_string()),
        };
        let rendered = format!("{basic:?} {:?}", HttpAuth::Bearer("tok-123".to_string()));
        assert!(rendered.contains("svc-calib"));
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("tok-123"));
    }
}
