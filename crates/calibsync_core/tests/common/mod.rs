#![allow(dead_code)]

use calibsync_core::diff::InstrumentUpdate;
use calibsync_core::model::audit::{AuditEntry, NewAuditEntry};
use calibsync_core::repo::{
    ApplyContext, LeaseHolder, LeaseOutcome, LockRepository, ReconciliationStore,
    SessionRepository, StoreResult,
};
use calibsync_core::source::{PageRequest, SourcePage};
use calibsync_core::{
    CalibrationRecord, ExternalId, Instrument, InstrumentId, InstrumentStatus, RawRecord,
    RetryPolicy, SessionId, SourceConnector, SourceError, SyncConfig, SyncSession,
};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn record(external_id: &str, tag: &str, due_date: &str) -> RawRecord {
    RawRecord::new()
        .with("external_id", external_id)
        .with("tag", tag)
        .with("category", "Thermometer")
        .with("location", "Lab 1")
        .with("due_date", due_date)
        .with("status", "active")
}

/// Default config with zero retry delays.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy::immediate(3),
        ..SyncConfig::default()
    }
}

/// Inserts an in-flight session so apply calls have a valid session reference.
pub fn begin_test_session<S: SessionRepository>(store: &S) -> ApplyContext {
    let session = SyncSession::new(0, None);
    store.begin_session(&session).unwrap();
    ApplyContext {
        session_id: session.id,
        today: date(2024, 6, 1),
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Unavailable,
    Malformed,
}

/// In-memory paged connector with fault injection.
///
/// Cursors are page indexes. Faults are consumed one per request of the
/// faulty page; slow pages sleep on every request.
pub struct MemorySource {
    pages: Vec<Vec<RawRecord>>,
    faults: Mutex<HashMap<usize, Vec<Fault>>>,
    slow_pages: HashMap<usize, Duration>,
    calls: AtomicUsize,
}

impl MemorySource {
    pub fn new(records: Vec<RawRecord>, page_size: usize) -> Self {
        let mut pages: Vec<Vec<RawRecord>> = records
            .chunks(page_size.max(1))
            .map(<[RawRecord]>::to_vec)
            .collect();
        if pages.is_empty() {
            pages.push(Vec::new());
        }
        Self {
            pages,
            faults: Mutex::new(HashMap::new()),
            slow_pages: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_page(self, page: usize, fault: Fault, times: usize) -> Self {
        self.faults
            .lock()
            .unwrap()
            .entry(page)
            .or_default()
            .extend(std::iter::repeat(fault).take(times));
        self
    }

    pub fn slow_page(mut self, page: usize, delay: Duration) -> Self {
        self.slow_pages.insert(page, delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SourceConnector for MemorySource {
    fn source_id(&self) -> &str {
        "memory"
    }

    fn fetch_page(&self, request: &PageRequest) -> Result<SourcePage, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let index: usize = request
            .cursor
            .as_deref()
            .map(|cursor| cursor.parse().unwrap())
            .unwrap_or(0);

        let fault = {
            let mut faults = self.faults.lock().unwrap();
            faults
                .get_mut(&index)
                .and_then(|queue| (!queue.is_empty()).then(|| queue.remove(0)))
        };
        match fault {
            Some(Fault::Unavailable) => {
                return Err(SourceError::Unavailable("connection reset".to_string()))
            }
            Some(Fault::Malformed) => {
                return Err(SourceError::Malformed("missing items array".to_string()))
            }
            None => {}
        }
        if let Some(delay) = self.slow_pages.get(&index) {
            std::thread::sleep(*delay);
        }

        let next_cursor = (index + 1 < self.pages.len()).then(|| (index + 1).to_string());
        Ok(SourcePage {
            records: self.pages[index].clone(),
            next_cursor,
        })
    }
}

/// Store wrapper that runs `hook` before every apply call.
pub struct HookedStore<'a, S> {
    pub inner: S,
    hook: Box<dyn Fn(&ExternalId) + 'a>,
}

impl<'a, S> HookedStore<'a, S> {
    pub fn new(inner: S, hook: impl Fn(&ExternalId) + 'a) -> Self {
        Self {
            inner,
            hook: Box::new(hook),
        }
    }
}

impl<S: ReconciliationStore> ReconciliationStore for HookedStore<'_, S> {
    fn snapshot(&self) -> StoreResult<Vec<Instrument>> {
        self.inner.snapshot()
    }

    fn get_instrument(&self, id: InstrumentId) -> StoreResult<Option<Instrument>> {
        self.inner.get_instrument(id)
    }

    fn find_live_instrument(&self, external_id: &ExternalId) -> StoreResult<Option<Instrument>> {
        self.inner.find_live_instrument(external_id)
    }

    fn calibration_history(&self, id: InstrumentId) -> StoreResult<Vec<CalibrationRecord>> {
        self.inner.calibration_history(id)
    }

    fn apply_create(
        &self,
        instrument: &Instrument,
        context: &ApplyContext,
    ) -> StoreResult<Instrument> {
        (self.hook)(&instrument.external_id);
        self.inner.apply_create(instrument, context)
    }

    fn apply_update(&self, update: &InstrumentUpdate, context: &ApplyContext) -> StoreResult<i64> {
        (self.hook)(&update.external_id);
        self.inner.apply_update(update, context)
    }

    fn apply_soft_delete(
        &self,
        id: InstrumentId,
        expected_revision: i64,
        context: &ApplyContext,
    ) -> StoreResult<i64> {
        if let Some(instrument) = self.inner.get_instrument(id)? {
            (self.hook)(&instrument.external_id);
        }
        self.inner.apply_soft_delete(id, expected_revision, context)
    }

    fn set_manual_status(&self, id: InstrumentId, status: InstrumentStatus) -> StoreResult<i64> {
        self.inner.set_manual_status(id, status)
    }

    fn record_audit(&self, entry: &NewAuditEntry) -> StoreResult<i64> {
        self.inner.record_audit(entry)
    }

    fn audit_for_instrument(&self, id: InstrumentId) -> StoreResult<Vec<AuditEntry>> {
        self.inner.audit_for_instrument(id)
    }

    fn audit_for_session(&self, id: SessionId) -> StoreResult<Vec<AuditEntry>> {
        self.inner.audit_for_session(id)
    }

    fn backup_to(&self, dest: &Path) -> StoreResult<()> {
        self.inner.backup_to(dest)
    }
}

impl<S: SessionRepository> SessionRepository for HookedStore<'_, S> {
    fn begin_session(&self, session: &SyncSession) -> StoreResult<()> {
        self.inner.begin_session(session)
    }

    fn save_session_progress(&self, session: &SyncSession) -> StoreResult<()> {
        self.inner.save_session_progress(session)
    }

    fn seal_session(&self, session: &SyncSession) -> StoreResult<()> {
        self.inner.seal_session(session)
    }

    fn get_session(&self, id: SessionId) -> StoreResult<Option<SyncSession>> {
        self.inner.get_session(id)
    }

    fn list_sessions(&self, limit: u32) -> StoreResult<Vec<SyncSession>> {
        self.inner.list_sessions(limit)
    }

    fn last_succeeded_session(&self) -> StoreResult<Option<SyncSession>> {
        self.inner.last_succeeded_session()
    }

    fn seal_abandoned_sessions(&self, finished_at: i64) -> StoreResult<Vec<SessionId>> {
        self.inner.seal_abandoned_sessions(finished_at)
    }
}

impl<S: LockRepository> LockRepository for HookedStore<'_, S> {
    fn try_acquire_lease(
        &self,
        owner: Uuid,
        operation: &str,
        now_ms: i64,
        stale_after_ms: i64,
    ) -> StoreResult<LeaseOutcome> {
        self.inner
            .try_acquire_lease(owner, operation, now_ms, stale_after_ms)
    }

    fn refresh_lease(&self, owner: Uuid, now_ms: i64) -> StoreResult<bool> {
        self.inner.refresh_lease(owner, now_ms)
    }

    fn release_lease(&self, owner: Uuid) -> StoreResult<()> {
        self.inner.release_lease(owner)
    }

    fn current_lease(&self) -> StoreResult<Option<LeaseHolder>> {
        self.inner.current_lease()
    }
}

/// Canned reply of [`MockListServer`].
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub body: String,
    pub delay: Duration,
}

impl MockResponse {
    pub fn json(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Request line and `Authorization` header seen by [`MockListServer`].
#[derive(Debug, Clone, Default)]
pub struct SeenRequest {
    pub target: String,
    pub authorization: Option<String>,
}

/// One-connection-per-request HTTP server on localhost that replays canned
/// responses in order, then stops accepting.
pub struct MockListServer {
    listener: TcpListener,
}

impl MockListServer {
    pub fn bind() -> Self {
        Self {
            listener: TcpListener::bind("127.0.0.1:0").unwrap(),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.listener.local_addr().unwrap())
    }

    pub fn url(&self) -> String {
        format!("{}/instruments", self.base_url())
    }

    pub fn serve(self, responses: Vec<MockResponse>) -> MockHandle {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let thread = thread::spawn(move || {
            for response in responses {
                let Ok((stream, _)) = self.listener.accept() else {
                    return;
                };
                let request = read_request(&stream);
                log.lock().unwrap().push(request);
                thread::sleep(response.delay);
                write_response(stream, &response);
            }
        });
        MockHandle { seen, thread }
    }
}

pub struct MockHandle {
    seen: Arc<Mutex<Vec<SeenRequest>>>,
    thread: JoinHandle<()>,
}

impl MockHandle {
    pub fn requests(&self) -> Vec<SeenRequest> {
        self.seen.lock().unwrap().clone()
    }

    /// Waits until every canned response was served.
    pub fn join(self) -> Vec<SeenRequest> {
        let MockHandle { seen, thread } = self;
        thread.join().unwrap();
        let requests = seen.lock().unwrap().clone();
        requests
    }
}

fn read_request(stream: &TcpStream) -> SeenRequest {
    let mut reader = BufReader::new(stream);
    let mut request = SeenRequest::default();
    let mut line = String::new();
    while reader.read_line(&mut line).unwrap_or(0) > 0 {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if request.target.is_empty() {
            request.target = trimmed.split(' ').nth(1).unwrap_or_default().to_string();
        } else if let Some((name, value)) = trimmed.split_once(':') {
            if name.eq_ignore_ascii_case("authorization") {
                request.authorization = Some(value.trim().to_string());
            }
        }
        line.clear();
    }
    request
}

fn write_response(mut stream: TcpStream, response: &MockResponse) {
    let head = format!(
        "HTTP/1.1 {} Mock\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        response.body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(response.body.as_bytes());
    let _ = stream.flush();
}
