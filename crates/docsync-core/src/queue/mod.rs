//! Durable offline operation queue.
//!
//! Entries live in a keyed map (one document-level slot per document, one
//! slot per file operation and file name) mirrored to a [`QueueStore`]. Every
//! accepted enqueue is committed to the store before it returns.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::QueueStore;
use crate::error::{Error, Result};
use crate::models::{
    OperationId, OperationPayload, OperationType, QueueAnomaly, QueuedOperation, SyncId,
};
use crate::util::{lock_unpoisoned, unix_millis_now};

/// Default number of failed drain passes before an entry is dropped
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum QueueKey {
    Document(SyncId),
    File(SyncId, OperationType, String),
}

impl QueueKey {
    fn of(operation: &QueuedOperation) -> Self {
        match operation.payload.file_name() {
            Some(file_name) if !operation.op_type.is_document_level() => Self::File(
                operation.document_id.clone(),
                operation.op_type,
                file_name.to_string(),
            ),
            _ => Self::Document(operation.document_id.clone()),
        }
    }
}

/// What happened to an enqueue request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Stored as a new entry
    Added(OperationId),
    /// Folded into an existing entry with the same key
    Consolidated(OperationId),
    /// A delete that cancelled the document's other entries
    Superseded {
        id: OperationId,
        cancelled: usize,
    },
    /// The document has a pending delete; nothing was stored
    Rejected,
}

impl EnqueueOutcome {
    #[must_use]
    pub const fn id(&self) -> Option<OperationId> {
        match self {
            Self::Added(id) | Self::Consolidated(id) | Self::Superseded { id, .. } => Some(*id),
            Self::Rejected => None,
        }
    }
}

/// Result of dispatching one entry, as reported by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Remote accepted the operation; the entry is removed
    Completed,
    /// The document moved to conflict; the entry is removed
    Conflict,
    /// Transient failure; the entry stays queued with one more attempt counted
    Retry(String),
    /// Permanent failure; the entry is removed
    Failed(String),
    /// Authentication is required; the pass stops and nothing else is dispatched
    AuthRequired(String),
    /// Not dispatchable right now; the entry stays queued untouched
    Deferred,
}

/// Executes queued operations against the remote side
#[allow(async_fn_in_trait)]
pub trait OperationDispatcher {
    async fn dispatch(&self, operation: &QueuedOperation) -> DispatchOutcome;
}

/// Per-pass drain summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: Vec<QueuedOperation>,
    pub conflicts: Vec<QueuedOperation>,
    pub retried: Vec<QueuedOperation>,
    pub failed: Vec<QueuedOperation>,
    pub deferred: usize,
    /// Entries replaced or cancelled while the pass was running
    pub skipped: usize,
    /// Entries removed after exhausting their attempts
    pub dropped: Vec<QueuedOperation>,
    pub auth_required: bool,
}

impl DrainReport {
    #[must_use]
    pub fn dispatched(&self) -> usize {
        self.completed.len() + self.conflicts.len() + self.retried.len() + self.failed.len()
    }
}

/// Queue depth broken down by operation type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub total: usize,
    pub by_type: BTreeMap<OperationType, usize>,
}

impl QueueStatus {
    #[must_use]
    pub fn count(&self, op_type: OperationType) -> usize {
        self.by_type.get(&op_type).copied().unwrap_or(0)
    }
}

/// One persisted row that failed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowAnomaly {
    pub row_id: i64,
    pub id: Option<String>,
    pub anomaly: QueueAnomaly,
}

/// Structural health of the persisted queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueHealthReport {
    pub rows: usize,
    pub valid: usize,
    pub anomalies: Vec<RowAnomaly>,
    /// Valid rows that collapse into another entry under consolidation
    pub duplicates: usize,
}

impl QueueHealthReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.anomalies.is_empty() && self.duplicates == 0
    }
}

enum Plan {
    Insert {
        operation: QueuedOperation,
        cancelled: Vec<OperationId>,
    },
    Replace(QueuedOperation),
    Reject,
}

#[derive(Default)]
struct QueueState {
    initialized: bool,
    entries: HashMap<QueueKey, QueuedOperation>,
    next_seq: u64,
}

impl QueueState {
    fn plan(&self, incoming: QueuedOperation) -> Plan {
        let document_key = QueueKey::Document(incoming.document_id.clone());
        if let Some(existing) = self.entries.get(&document_key) {
            if existing.op_type == OperationType::Delete {
                return if incoming.op_type == OperationType::Delete {
                    Plan::Replace(merge(existing, incoming))
                } else {
                    Plan::Reject
                };
            }
        }

        if incoming.op_type == OperationType::Delete {
            let cancelled = self
                .entries
                .values()
                .filter(|entry| entry.document_id == incoming.document_id)
                .map(|entry| entry.id)
                .collect();
            return Plan::Insert {
                operation: incoming,
                cancelled,
            };
        }

        match self.entries.get(&QueueKey::of(&incoming)) {
            Some(existing) => Plan::Replace(merge(existing, incoming)),
            None => Plan::Insert {
                operation: incoming,
                cancelled: Vec::new(),
            },
        }
    }

    fn apply(&mut self, plan: &Plan) {
        match plan {
            Plan::Insert {
                operation,
                cancelled,
            } => {
                self.entries
                    .retain(|_, entry| !cancelled.contains(&entry.id));
                self.entries
                    .insert(QueueKey::of(operation), operation.clone());
            }
            Plan::Replace(operation) => {
                self.entries
                    .insert(QueueKey::of(operation), operation.clone());
            }
            Plan::Reject => {}
        }
    }

    fn take_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn is_current(&self, operation: &QueuedOperation) -> bool {
        self.entries
            .get(&QueueKey::of(operation))
            .is_some_and(|entry| entry.id == operation.id && entry.seq == operation.seq)
    }

    fn sorted(&self) -> Vec<QueuedOperation> {
        let mut operations: Vec<_> = self.entries.values().cloned().collect();
        operations.sort_by(drain_order);
        operations
    }
}

/// The incoming entry's content under the existing entry's identity
fn merge(existing: &QueuedOperation, incoming: QueuedOperation) -> QueuedOperation {
    QueuedOperation {
        id: existing.id,
        priority: existing.priority.max(incoming.priority),
        retry_count: 0,
        ..incoming
    }
}

fn drain_order(left: &QueuedOperation, right: &QueuedOperation) -> std::cmp::Ordering {
    right
        .priority
        .cmp(&left.priority)
        .then(left.enqueued_at.cmp(&right.enqueued_at))
        .then(left.seq.cmp(&right.seq))
}

/// Persisted queue of pending mutations with consolidation and priority drain
pub struct OfflineQueue<S> {
    store: S,
    max_attempts: u32,
    state: Mutex<QueueState>,
    drain_lock: tokio::sync::Mutex<()>,
}

impl<S: QueueStore> OfflineQueue<S> {
    pub fn new(store: S, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            state: Mutex::new(QueueState::default()),
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    pub fn is_initialized(&self) -> bool {
        lock_unpoisoned(&self.state).initialized
    }

    /// Reload persisted entries; enqueue is refused until this has run.
    ///
    /// Invalid rows are discarded and duplicates left behind by an
    /// interrupted write are folded back together.
    pub fn initialize(&self) -> Result<QueueHealthReport> {
        let report = self.reload(true)?;
        lock_unpoisoned(&self.state).initialized = true;
        info!(
            "Offline queue initialized with {} entries ({} anomalies discarded)",
            report.valid.saturating_sub(report.duplicates),
            report.anomalies.len()
        );
        Ok(report)
    }

    /// Discard structurally invalid rows and reload the rest
    pub fn recover_queue(&self) -> Result<QueueHealthReport> {
        self.reload(true)
    }

    /// Report structural problems without changing anything
    pub fn check_queue_health(&self) -> Result<QueueHealthReport> {
        self.reload(false)
    }

    fn reload(&self, repair: bool) -> Result<QueueHealthReport> {
        let rows = self.store.load_all()?;
        let mut report = QueueHealthReport {
            rows: rows.len(),
            ..QueueHealthReport::default()
        };

        let mut valid = Vec::new();
        for row in rows {
            let id = row.raw.id.clone();
            match QueuedOperation::try_from(row.raw) {
                Ok(operation) => valid.push(operation),
                Err(anomaly) => {
                    warn!(
                        "Queue row {} ({}) is invalid: {anomaly}",
                        row.row_id,
                        id.as_deref().unwrap_or("no id")
                    );
                    report.anomalies.push(RowAnomaly {
                        row_id: row.row_id,
                        id,
                        anomaly,
                    });
                }
            }
        }
        report.valid = valid.len();
        valid.sort_by_key(|operation| operation.seq);

        let mut rebuilt = QueueState::default();
        let mut remove = Vec::new();
        let mut save = Vec::new();
        for operation in valid {
            rebuilt.next_seq = rebuilt.next_seq.max(operation.seq);
            let incoming_id = operation.id;
            let plan = rebuilt.plan(operation);
            match &plan {
                Plan::Insert { cancelled, .. } => {
                    report.duplicates += cancelled.len();
                    remove.extend(cancelled.iter().copied());
                }
                Plan::Replace(merged) => {
                    report.duplicates += 1;
                    remove.push(incoming_id);
                    save.push(merged.clone());
                }
                Plan::Reject => {
                    report.duplicates += 1;
                    remove.push(incoming_id);
                }
            }
            rebuilt.apply(&plan);
        }

        if !repair {
            return Ok(report);
        }

        for anomaly in &report.anomalies {
            self.store.discard_row(anomaly.row_id)?;
        }
        save.retain(|operation| !remove.contains(&operation.id));
        self.store.commit(&remove, &save)?;

        let mut state = lock_unpoisoned(&self.state);
        rebuilt.initialized = state.initialized;
        *state = rebuilt;
        Ok(report)
    }

    /// Add an operation, consolidating with whatever is already queued for
    /// the same key.
    pub fn enqueue(
        &self,
        document_id: &SyncId,
        op_type: OperationType,
        payload: OperationPayload,
        priority: i32,
    ) -> Result<EnqueueOutcome> {
        if !payload.matches(op_type) {
            return Err(Error::InvalidInput(format!(
                "payload does not match operation type {op_type}"
            )));
        }
        if let OperationPayload::Document(document) = &payload {
            if &document.sync_id != document_id {
                return Err(Error::InvalidInput(format!(
                    "payload targets document {} but entry targets {document_id}",
                    document.sync_id
                )));
            }
        }

        let mut state = lock_unpoisoned(&self.state);
        if !state.initialized {
            return Err(Error::QueueNotInitialized);
        }

        let incoming = QueuedOperation {
            id: OperationId::new(),
            document_id: document_id.clone(),
            op_type,
            payload,
            priority,
            enqueued_at: unix_millis_now(),
            retry_count: 0,
            seq: state.next_seq + 1,
        };
        let plan = state.plan(incoming);
        let outcome = match &plan {
            Plan::Insert {
                operation,
                cancelled,
            } => {
                self.store
                    .commit(cancelled, std::slice::from_ref(operation))?;
                if cancelled.is_empty() {
                    EnqueueOutcome::Added(operation.id)
                } else {
                    EnqueueOutcome::Superseded {
                        id: operation.id,
                        cancelled: cancelled.len(),
                    }
                }
            }
            Plan::Replace(operation) => {
                self.store.save(operation)?;
                EnqueueOutcome::Consolidated(operation.id)
            }
            Plan::Reject => {
                warn!("Document {document_id} has a pending delete; dropping {op_type}");
                return Ok(EnqueueOutcome::Rejected);
            }
        };
        state.take_seq();
        state.apply(&plan);
        debug!("Enqueued {op_type} for {document_id}: {outcome:?}");
        Ok(outcome)
    }

    /// Dispatch a snapshot of the queue in drain order.
    ///
    /// Only one pass runs at a time; a second caller waits for the first.
    pub async fn process_queue<D: OperationDispatcher>(
        &self,
        dispatcher: &D,
    ) -> Result<DrainReport> {
        let _pass = self.drain_lock.lock().await;
        let snapshot = {
            let state = lock_unpoisoned(&self.state);
            if !state.initialized {
                return Err(Error::QueueNotInitialized);
            }
            state.sorted()
        };

        let mut report = DrainReport::default();
        for operation in snapshot {
            if !lock_unpoisoned(&self.state).is_current(&operation) {
                report.skipped += 1;
                continue;
            }

            let outcome = dispatcher.dispatch(&operation).await;
            if let DispatchOutcome::AuthRequired(reason) = &outcome {
                warn!("Queue drain stopped, authentication required: {reason}");
                report.auth_required = true;
                break;
            }
            self.settle(operation, outcome, &mut report)?;
        }

        if report.dispatched() > 0 || report.auth_required {
            info!(
                "Queue drain: {} completed, {} conflicts, {} retried, {} failed, {} dropped",
                report.completed.len(),
                report.conflicts.len(),
                report.retried.len(),
                report.failed.len(),
                report.dropped.len()
            );
        }
        Ok(report)
    }

    fn settle(
        &self,
        operation: QueuedOperation,
        outcome: DispatchOutcome,
        report: &mut DrainReport,
    ) -> Result<()> {
        let mut state = lock_unpoisoned(&self.state);
        let current = state.is_current(&operation);
        let key = QueueKey::of(&operation);

        match outcome {
            DispatchOutcome::Completed | DispatchOutcome::Conflict | DispatchOutcome::Failed(_)
                if current =>
            {
                self.store.delete(&operation.id)?;
                state.entries.remove(&key);
            }
            DispatchOutcome::Retry(ref reason) if current => {
                let attempts = operation.retry_count + 1;
                if attempts >= self.max_attempts {
                    warn!(
                        "Dropping {} for {} after {attempts} attempts: {reason}",
                        operation.op_type, operation.document_id
                    );
                    self.store.delete(&operation.id)?;
                    state.entries.remove(&key);
                    report.dropped.push(operation.clone());
                } else {
                    warn!(
                        "Retrying {} for {} later (attempt {attempts}): {reason}",
                        operation.op_type, operation.document_id
                    );
                    let retried = QueuedOperation {
                        retry_count: attempts,
                        ..operation.clone()
                    };
                    self.store.save(&retried)?;
                    state.entries.insert(key, retried);
                }
            }
            _ => {}
        }

        match outcome {
            DispatchOutcome::Completed => report.completed.push(operation),
            DispatchOutcome::Conflict => report.conflicts.push(operation),
            DispatchOutcome::Retry(_) => report.retried.push(operation),
            DispatchOutcome::Failed(reason) => {
                warn!(
                    "{} for {} failed permanently: {reason}",
                    operation.op_type, operation.document_id
                );
                report.failed.push(operation);
            }
            DispatchOutcome::Deferred => report.deferred += 1,
            DispatchOutcome::AuthRequired(_) => {}
        }
        Ok(())
    }

    /// Counts by operation type, without side effects
    pub fn get_queue_status(&self) -> QueueStatus {
        let state = lock_unpoisoned(&self.state);
        let mut status = QueueStatus {
            total: state.entries.len(),
            by_type: BTreeMap::new(),
        };
        for entry in state.entries.values() {
            *status.by_type.entry(entry.op_type).or_default() += 1;
        }
        status
    }

    /// Entries queued for one document, in drain order
    pub fn pending_for(&self, document_id: &SyncId) -> Vec<QueuedOperation> {
        lock_unpoisoned(&self.state)
            .sorted()
            .into_iter()
            .filter(|entry| &entry.document_id == document_id)
            .collect()
    }

    /// Every queued entry, in drain order
    pub fn snapshot(&self) -> Vec<QueuedOperation> {
        lock_unpoisoned(&self.state).sorted()
    }

    /// Drop every entry for a document, returning how many were removed
    pub fn remove_document(&self, document_id: &SyncId) -> Result<usize> {
        let mut state = lock_unpoisoned(&self.state);
        let removed = self.store.delete_for_document(document_id)?;
        state
            .entries
            .retain(|_, entry| &entry.document_id != document_id);
        Ok(removed)
    }

    /// Drop one document-level entry if it is still the one given
    pub fn discard(&self, operation: &QueuedOperation) -> Result<bool> {
        let mut state = lock_unpoisoned(&self.state);
        if !state.is_current(operation) {
            return Ok(false);
        }
        self.store.delete(&operation.id)?;
        state.entries.remove(&QueueKey::of(operation));
        Ok(true)
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
