//! Capability auditing.
//!
//! Every call mediated by the proxy leaves exactly one [`AuditRecord`]. The
//! log is append-only: records are assigned a sequence number and a
//! timestamp on entry and are never changed or removed afterwards.

mod store;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crankshaft_core::capability::{CapabilityKind, Scope};
use crankshaft_core::error::AuditError;
use crankshaft_core::id::ExtensionId;

pub use store::{AuditStore, JsonlAuditStore, MemoryAuditStore};

/// Default number of records held while the store is failing.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;

/// Default number of recent records kept in memory for queries.
pub const DEFAULT_MEMORY_WINDOW: usize = 10_000;

/// Result of one mediated call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditOutcome {
    Allowed,
    DeniedNoCapability,
    DeniedRevoked,
    DeniedUnknownExtension,
}

impl AuditOutcome {
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::DeniedNoCapability => "denied-no-capability",
            Self::DeniedRevoked => "denied-revoked",
            Self::DeniedUnknownExtension => "denied-unknown-extension",
        }
    }
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AuditOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allowed" => Ok(Self::Allowed),
            "denied-no-capability" => Ok(Self::DeniedNoCapability),
            "denied-revoked" => Ok(Self::DeniedRevoked),
            "denied-unknown-extension" => Ok(Self::DeniedUnknownExtension),
            other => Err(format!("unknown audit outcome: {other}")),
        }
    }
}

/// What the caller supplies when recording an access attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditEntry {
    pub owner: ExtensionId,
    pub kind: CapabilityKind,
    pub scope: Option<Scope>,
    pub operation: String,
    pub outcome: AuditOutcome,
    pub summary: Option<String>,
}

/// An immutable audit log record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position in the log, strictly increasing across the log's lifetime.
    pub sequence: u64,

    /// When the attempt was recorded; strictly increasing per owner.
    pub timestamp: DateTime<Utc>,

    pub owner: ExtensionId,
    pub kind: CapabilityKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,

    pub operation: String,
    pub outcome: AuditOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Filter for [`AuditLog::query`]. Results are newest first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditQuery {
    pub owner: Option<ExtensionId>,
    pub kind: Option<CapabilityKind>,
    pub outcome: Option<AuditOutcome>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(mut self, owner: ExtensionId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn kind(mut self, kind: CapabilityKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    /// Only records at or after `since`.
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Only records at or before `until`.
    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, record: &AuditRecord) -> bool {
        self.owner.map_or(true, |o| record.owner == o)
            && self.kind.map_or(true, |k| record.kind == k)
            && self.outcome.map_or(true, |o| record.outcome == o)
            && self.since.map_or(true, |t| record.timestamp >= t)
            && self.until.map_or(true, |t| record.timestamp <= t)
    }
}

struct AuditState {
    /// Most recent records, oldest first. Older ones live only in the store.
    records: VecDeque<AuditRecord>,

    /// Every record in the log, including those outside the window.
    total: usize,

    /// Accepted but not yet persisted.
    pending: VecDeque<AuditRecord>,

    next_sequence: u64,
    last_timestamp: HashMap<ExtensionId, DateTime<Utc>>,
    closed: bool,
}

impl AuditState {
    fn from_records(mut records: Vec<AuditRecord>, window: usize) -> Self {
        // A retried batch can leave the same record on disk twice.
        records.sort_by_key(|r| r.sequence);
        records.dedup_by_key(|r| r.sequence);

        let next_sequence = records.iter().map(|r| r.sequence + 1).max().unwrap_or(0);
        let mut last_timestamp: HashMap<ExtensionId, DateTime<Utc>> = HashMap::new();
        for record in &records {
            let last = last_timestamp.entry(record.owner).or_insert(record.timestamp);
            if record.timestamp > *last {
                *last = record.timestamp;
            }
        }
        let total = records.len();
        let records = records.split_off(total.saturating_sub(window));
        Self {
            records: records.into(),
            total,
            pending: VecDeque::new(),
            next_sequence,
            last_timestamp,
            closed: false,
        }
    }

    /// Now, nudged forward if needed so that `owner`'s timestamps never repeat.
    fn next_timestamp(&mut self, owner: ExtensionId) -> DateTime<Utc> {
        let now = Utc::now();
        let timestamp = match self.last_timestamp.get(&owner) {
            Some(last) if now <= *last => *last + Duration::microseconds(1),
            _ => now,
        };
        self.last_timestamp.insert(owner, timestamp);
        timestamp
    }

    fn push(&mut self, record: AuditRecord, window: usize) {
        self.total += 1;
        self.records.push_back(record.clone());
        while self.records.len() > window {
            self.records.pop_front();
        }
        self.pending.push_back(record);
    }

    /// Whether records older than the window exist.
    fn is_truncated(&self) -> bool {
        self.records.len() < self.total
    }

    /// Try to move pending records into the store.
    fn drain_pending(&mut self, store: &dyn AuditStore) -> Result<(), AuditError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch: Vec<AuditRecord> = self.pending.iter().cloned().collect();
        store.append(&batch)?;
        self.pending.clear();
        Ok(())
    }
}

/// Append-only audit log over a pluggable [`AuditStore`].
///
/// Records are persisted as they arrive. When the store fails, records wait
/// in a bounded buffer and are retried on the next write or flush; only when
/// that buffer is full does [`record`](Self::record) report a failure.
///
/// Only the most recent records stay in memory. Queries reaching past them
/// read the store.
pub struct AuditLog {
    state: Mutex<AuditState>,
    store: Arc<dyn AuditStore>,
    buffer_capacity: usize,
    memory_window: usize,
}

impl AuditLog {
    /// Open a log over `store`, restoring every record it already holds.
    ///
    /// # Arguments
    ///
    /// * `store` - Durable backing for the records.
    /// * `buffer_capacity` - Records held while the store is failing.
    pub fn open(store: Arc<dyn AuditStore>, buffer_capacity: usize) -> Result<Self, AuditError> {
        let records = store.load()?;
        info!(restored = records.len(), "Opened audit log");
        Ok(Self {
            state: Mutex::new(AuditState::from_records(records, DEFAULT_MEMORY_WINDOW)),
            store,
            buffer_capacity: buffer_capacity.max(1),
            memory_window: DEFAULT_MEMORY_WINDOW,
        })
    }

    /// Keep at most `window` recent records in memory.
    pub fn with_memory_window(mut self, window: usize) -> Self {
        self.memory_window = window.max(1);
        let state = self.state.get_mut();
        while state.records.len() > self.memory_window {
            state.records.pop_front();
        }
        self
    }

    /// A log backed by an in-memory store.
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(AuditState::from_records(Vec::new(), DEFAULT_MEMORY_WINDOW)),
            store: Arc::new(MemoryAuditStore::new()),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            memory_window: DEFAULT_MEMORY_WINDOW,
        }
    }

    /// Record one access attempt.
    ///
    /// # Returns
    ///
    /// * `Ok(AuditRecord)` - The record as accepted into the log.
    /// * `Err(AuditError::Closed)` - The log was shut down.
    /// * `Err(AuditError::WriteFailure)` - The store is failing and the
    ///   buffer is full; nothing was recorded.
    pub fn record(&self, entry: AuditEntry) -> Result<AuditRecord, AuditError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(AuditError::Closed);
        }

        if state.pending.len() >= self.buffer_capacity {
            if let Err(err) = state.drain_pending(self.store.as_ref()) {
                warn!(pending = state.pending.len(), error = %err, "Audit buffer exhausted");
                return Err(AuditError::WriteFailure(format!(
                    "{} records awaiting storage: {err}",
                    state.pending.len()
                )));
            }
        }

        let timestamp = state.next_timestamp(entry.owner);
        let record = AuditRecord {
            sequence: state.next_sequence,
            timestamp,
            owner: entry.owner,
            kind: entry.kind,
            scope: entry.scope,
            operation: entry.operation,
            outcome: entry.outcome,
            summary: entry.summary,
        };
        state.next_sequence += 1;
        state.push(record.clone(), self.memory_window);

        if let Err(err) = state.drain_pending(self.store.as_ref()) {
            debug!(pending = state.pending.len(), error = %err, "Audit store write deferred");
        }

        Ok(record)
    }

    /// Records matching `query`, newest first.
    ///
    /// Served from memory when the recent window suffices; otherwise older
    /// records are read back from the store. A store that cannot be read
    /// limits the result to the window.
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditRecord> {
        let limit = query.limit.unwrap_or(usize::MAX);
        let (mut found, oldest, pending) = {
            let state = self.state.lock();
            let found: Vec<AuditRecord> = state
                .records
                .iter()
                .rev()
                .filter(|record| query.matches(record))
                .take(limit)
                .cloned()
                .collect();
            if found.len() >= limit || !state.is_truncated() {
                return found;
            }
            let oldest = state.records.front().map_or(u64::MAX, |r| r.sequence);
            let pending: Vec<AuditRecord> = state.pending.iter().cloned().collect();
            (found, oldest, pending)
        };

        let mut older = match self.store.load() {
            Ok(records) => records,
            Err(err) => {
                warn!(error = %err, "Audit store unreadable; query limited to recent records");
                return found;
            }
        };
        older.extend(pending);
        older.retain(|r| r.sequence < oldest);
        older.sort_by_key(|r| r.sequence);
        older.dedup_by_key(|r| r.sequence);

        let remaining = limit - found.len();
        found.extend(
            older
                .into_iter()
                .rev()
                .filter(|record| query.matches(record))
                .take(remaining),
        );
        found
    }

    /// Total number of records in the log.
    pub fn len(&self) -> usize {
        self.state.lock().total
    }

    /// Records currently held in memory.
    pub fn window_len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records accepted but not yet persisted.
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Persist everything pending and flush the store.
    pub fn flush(&self) -> Result<(), AuditError> {
        let mut state = self.state.lock();
        state.drain_pending(self.store.as_ref())?;
        self.store.flush()
    }

    /// Flush and stop accepting records. Querying keeps working.
    pub fn shutdown(&self) -> Result<(), AuditError> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let result = state
            .drain_pending(self.store.as_ref())
            .and_then(|_| self.store.flush());
        match &result {
            Ok(()) => info!(records = state.total, "Audit log closed"),
            Err(err) => warn!(
                pending = state.pending.len(),
                error = %err,
                "Audit log closed with unpersisted records"
            ),
        }
        result
    }
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog")
            .field("buffer_capacity", &self.buffer_capacity)
            .field("memory_window", &self.memory_window)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(owner: ExtensionId, outcome: AuditOutcome) -> AuditEntry {
        AuditEntry {
            owner,
            kind: CapabilityKind::ReadSettings,
            scope: Some(Scope::new("ui.language").unwrap()),
            operation: "get".to_string(),
            outcome,
            summary: None,
        }
    }

    #[test]
    fn test_record_and_query() {
        let log = AuditLog::in_memory();
        let a = ExtensionId::new();
        let b = ExtensionId::new();

        log.record(entry(a, AuditOutcome::Allowed)).unwrap();
        log.record(entry(b, AuditOutcome::DeniedNoCapability)).unwrap();
        log.record(entry(a, AuditOutcome::DeniedRevoked)).unwrap();

        assert_eq!(log.len(), 3);

        let for_a = log.query(&AuditQuery::new().owner(a));
        assert_eq!(for_a.len(), 2);
        // Newest first
        assert_eq!(for_a[0].outcome, AuditOutcome::DeniedRevoked);
        assert!(for_a[0].sequence > for_a[1].sequence);

        let denied = log.query(&AuditQuery::new().outcome(AuditOutcome::DeniedNoCapability));
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].owner, b);

        assert_eq!(log.query(&AuditQuery::new().limit(1)).len(), 1);
        assert!(log
            .query(&AuditQuery::new().kind(CapabilityKind::Phone))
            .is_empty());
    }

    #[test]
    fn test_timestamps_strictly_increase_per_owner() {
        let log = AuditLog::in_memory();
        let owner = ExtensionId::new();

        for _ in 0..50 {
            log.record(entry(owner, AuditOutcome::Allowed)).unwrap();
        }

        let mut records = log.query(&AuditQuery::new().owner(owner));
        records.reverse();
        for pair in records.windows(2) {
            assert!(pair[1].timestamp > pair[0].timestamp);
        }
    }

    #[test]
    fn test_time_window_query() {
        let log = AuditLog::in_memory();
        let owner = ExtensionId::new();
        let first = log.record(entry(owner, AuditOutcome::Allowed)).unwrap();
        let second = log.record(entry(owner, AuditOutcome::Allowed)).unwrap();

        let after_first = log.query(&AuditQuery::new().since(second.timestamp));
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].sequence, second.sequence);

        let up_to_first = log.query(&AuditQuery::new().until(first.timestamp));
        assert_eq!(up_to_first.len(), 1);
        assert_eq!(up_to_first[0].sequence, first.sequence);
    }

    #[test]
    fn test_buffer_absorbs_transient_failures() {
        let store = Arc::new(MemoryAuditStore::new());
        let log = AuditLog::open(store.clone(), 2).unwrap();
        let owner = ExtensionId::new();

        store.set_failing(true);
        log.record(entry(owner, AuditOutcome::Allowed)).unwrap();
        log.record(entry(owner, AuditOutcome::Allowed)).unwrap();
        assert_eq!(log.pending_count(), 2);

        // Buffer full and the store is still down.
        assert!(matches!(
            log.record(entry(owner, AuditOutcome::Allowed)),
            Err(AuditError::WriteFailure(_))
        ));
        assert_eq!(log.len(), 2);

        store.set_failing(false);
        log.record(entry(owner, AuditOutcome::Allowed)).unwrap();
        assert_eq!(log.pending_count(), 0);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_old_records_are_read_from_store() {
        let store = Arc::new(MemoryAuditStore::new());
        let log = AuditLog::open(store.clone(), 4)
            .unwrap()
            .with_memory_window(3);
        let a = ExtensionId::new();
        let b = ExtensionId::new();

        let first = log.record(entry(a, AuditOutcome::Allowed)).unwrap();
        for _ in 0..5 {
            log.record(entry(b, AuditOutcome::Allowed)).unwrap();
        }
        assert_eq!(log.len(), 6);
        assert_eq!(log.window_len(), 3);

        let for_a = log.query(&AuditQuery::new().owner(a));
        assert_eq!(for_a, vec![first.clone()]);

        let all: Vec<u64> = log.query(&AuditQuery::new()).iter().map(|r| r.sequence).collect();
        assert_eq!(all, vec![5, 4, 3, 2, 1, 0]);
        assert_eq!(log.query(&AuditQuery::new().limit(4)).len(), 4);

        // Unpersisted records outside the window are still found.
        store.set_failing(true);
        for _ in 0..3 {
            log.record(entry(b, AuditOutcome::DeniedRevoked)).unwrap();
        }
        let revoked = log.query(&AuditQuery::new().outcome(AuditOutcome::DeniedRevoked));
        assert_eq!(revoked.len(), 3);
        assert_eq!(log.query(&AuditQuery::new()).len(), 9);
        assert_eq!(log.query(&AuditQuery::new().owner(a)), vec![first]);
    }

    #[test]
    fn test_restore_keeps_only_window_in_memory() {
        let store = Arc::new(MemoryAuditStore::new());
        let owner = ExtensionId::new();
        {
            let log = AuditLog::open(store.clone(), 4).unwrap();
            for _ in 0..5 {
                log.record(entry(owner, AuditOutcome::Allowed)).unwrap();
            }
        }

        let log = AuditLog::open(store, 4).unwrap().with_memory_window(2);
        assert_eq!(log.len(), 5);
        assert_eq!(log.window_len(), 2);
        assert_eq!(log.query(&AuditQuery::new()).len(), 5);
        let next = log.record(entry(owner, AuditOutcome::Allowed)).unwrap();
        assert_eq!(next.sequence, 5);
    }

    #[test]
    fn test_shutdown_rejects_records() {
        let log = AuditLog::in_memory();
        let owner = ExtensionId::new();
        log.record(entry(owner, AuditOutcome::Allowed)).unwrap();

        log.shutdown().unwrap();
        assert!(log.is_closed());
        assert!(matches!(
            log.record(entry(owner, AuditOutcome::Allowed)),
            Err(AuditError::Closed)
        ));
        assert_eq!(log.query(&AuditQuery::new()).len(), 1);
    }

    #[test]
    fn test_outcome_strings() {
        assert_eq!(
            serde_json::to_string(&AuditOutcome::DeniedUnknownExtension).unwrap(),
            "\"denied-unknown-extension\""
        );
        assert_eq!(
            "denied-revoked".parse::<AuditOutcome>().unwrap(),
            AuditOutcome::DeniedRevoked
        );
    }
}
