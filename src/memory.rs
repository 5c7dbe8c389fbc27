//! In-memory transaction manager, for tests and embedding

use crate::errors::find_in_chain;
use crate::{ManagerError, Transaction, TransactionError, TransactionId, TransactionManager};
use serde::Serialize;
use std::collections::VecDeque;
use std::error::Error;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Retryable error raised by code running against the in-memory store
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("conflict on {resource}")]
pub struct ConflictError {
    /// Resource that saw the concurrent write
    pub resource: Box<str>,
}

impl ConflictError {
    /// Conflict on `resource`
    pub fn new(resource: &str) -> Self {
        Self {
            resource: resource.into(),
        }
    }
}

/// Lifecycle state of an in-memory transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TransactionState {
    /// Neither committed nor aborted yet
    Active,
    /// Committed successfully
    Committed,
    /// Aborted, by the loop or anyone else
    Aborted,
}

#[derive(Default)]
struct Faults {
    begin: VecDeque<ManagerError>,
    commit: VecDeque<TransactionError>,
    abort: VecDeque<TransactionError>,
}

struct Shared {
    current: Mutex<Option<InMemoryTransaction>>,
    history: Mutex<Vec<InMemoryTransaction>>,
    faults: Mutex<Faults>,
    explicit: AtomicBool,
    authoritative: AtomicBool,
    next_id: AtomicU64,
    begins: AtomicU64,
    commits: AtomicU64,
    aborts: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn release(&self, id: TransactionId) {
        let mut current = lock(&self.current);
        if current.as_ref().map(|tx| tx.id()) == Some(id) {
            *current = None;
        }
    }
}

struct TxInner {
    id: TransactionId,
    state: Mutex<TransactionState>,
    notes: Mutex<Vec<String>>,
    resources: Mutex<Vec<String>>,
    doomed: AtomicBool,
    shared: Weak<Shared>,
}

/// Handle to a transaction of an [`InMemoryManager`]
#[derive(Clone)]
pub struct InMemoryTransaction {
    inner: Arc<TxInner>,
}

impl InMemoryTransaction {
    /// Current lifecycle state
    pub fn state(&self) -> TransactionState {
        *lock(&self.inner.state)
    }

    /// Mark the transaction unsafe to commit
    pub fn doom(&self) {
        self.inner.doomed.store(true, Ordering::Relaxed);
    }

    /// Record that `resource` joined the transaction
    pub fn join(&self, resource: &str) {
        lock(&self.inner.resources).push(resource.to_string());
    }

    /// Notes attached so far
    pub fn notes(&self) -> Vec<String> {
        lock(&self.inner.notes).clone()
    }

    fn finish(&self, to: TransactionState) -> Result<(), TransactionError> {
        let mut state = lock(&self.inner.state);
        if *state != TransactionState::Active {
            return Err(TransactionError::InvalidState(
                format!("transaction {} is {:?}", self.inner.id, *state).into(),
            ));
        }
        *state = to;
        Ok(())
    }
}

impl Transaction for InMemoryTransaction {
    fn id(&self) -> TransactionId {
        self.inner.id
    }

    fn commit(&self) -> Result<(), TransactionError> {
        if self.is_doomed() {
            return Err(TransactionError::InvalidState(
                format!("transaction {} is doomed", self.inner.id).into(),
            ));
        }
        let shared = self.inner.shared.upgrade();
        if let Some(shared) = &shared {
            if let Some(error) = lock(&shared.faults).commit.pop_front() {
                return Err(error);
            }
        }
        self.finish(TransactionState::Committed)?;
        if let Some(shared) = shared {
            shared.commits.fetch_add(1, Ordering::Relaxed);
            shared.release(self.inner.id);
        }
        Ok(())
    }

    fn abort(&self) -> Result<(), TransactionError> {
        let shared = self.inner.shared.upgrade();
        if let Some(shared) = &shared {
            if let Some(error) = lock(&shared.faults).abort.pop_front() {
                return Err(error);
            }
        }
        self.finish(TransactionState::Aborted)?;
        if let Some(shared) = shared {
            shared.aborts.fetch_add(1, Ordering::Relaxed);
            shared.release(self.inner.id);
        }
        Ok(())
    }

    fn note(&self, text: &str) {
        lock(&self.inner.notes).push(text.to_string());
    }

    fn is_doomed(&self) -> bool {
        self.inner.doomed.load(Ordering::Relaxed)
    }

    fn joined_resources(&self) -> Vec<String> {
        lock(&self.inner.resources).clone()
    }

    fn is_retryable_error(&self, error: &(dyn Error + 'static)) -> Result<bool, ManagerError> {
        let authoritative = self
            .inner
            .shared
            .upgrade()
            .map(|s| s.authoritative.load(Ordering::Relaxed))
            .unwrap_or(false);
        if !authoritative {
            return Err(ManagerError::Unavailable("retryability unknown".into()));
        }
        Ok(find_in_chain::<ConflictError>(error).is_some()
            || matches!(
                find_in_chain::<TransactionError>(error),
                Some(TransactionError::Conflict(_))
            ))
    }
}

impl std::fmt::Debug for InMemoryTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransaction")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Transaction manager with a single "current transaction" slot.
///
/// Give each concurrent caller its own manager. Faults queued with the
/// `fail_next_*` methods are consumed in order by the next matching call.
pub struct InMemoryManager {
    shared: Arc<Shared>,
}

impl InMemoryManager {
    /// Manager with no current transaction, in implicit mode
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                current: Mutex::new(None),
                history: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
                explicit: AtomicBool::new(false),
                authoritative: AtomicBool::new(true),
                next_id: AtomicU64::new(1),
                begins: AtomicU64::new(0),
                commits: AtomicU64::new(0),
                aborts: AtomicU64::new(0),
            }),
        }
    }

    /// Make the next `begin` fail with `error`
    pub fn fail_next_begin(&self, error: ManagerError) {
        lock(&self.shared.faults).begin.push_back(error);
    }

    /// Make the next commit fail with `error`; the transaction stays active
    pub fn fail_next_commit(&self, error: TransactionError) {
        lock(&self.shared.faults).commit.push_back(error);
    }

    /// Make the next abort fail with `error`; the transaction stays active
    pub fn fail_next_abort(&self, error: TransactionError) {
        lock(&self.shared.faults).abort.push_back(error);
    }

    /// When `false`, transactions refuse to classify errors
    pub fn set_authoritative(&self, authoritative: bool) {
        self.shared.authoritative.store(authoritative, Ordering::Relaxed);
    }

    /// Is explicit mode on?
    pub fn is_explicit(&self) -> bool {
        self.shared.explicit.load(Ordering::Relaxed)
    }

    /// Transactions begun so far
    pub fn begins(&self) -> u64 {
        self.shared.begins.load(Ordering::Relaxed)
    }

    /// Transactions committed so far
    pub fn commits(&self) -> u64 {
        self.shared.commits.load(Ordering::Relaxed)
    }

    /// Transactions aborted so far
    pub fn aborts(&self) -> u64 {
        self.shared.aborts.load(Ordering::Relaxed)
    }

    /// Every transaction begun so far, oldest first
    pub fn history(&self) -> Vec<InMemoryTransaction> {
        lock(&self.shared.history).clone()
    }
}

impl Default for InMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager for InMemoryManager {
    type Transaction = InMemoryTransaction;

    fn begin(&self) -> Result<InMemoryTransaction, ManagerError> {
        if let Some(error) = lock(&self.shared.faults).begin.pop_front() {
            return Err(error);
        }

        let previous = lock(&self.shared.current).take();
        if let Some(previous) = previous {
            if self.is_explicit() {
                *lock(&self.shared.current) = Some(previous);
                return Err(ManagerError::AlreadyInTransaction);
            }
            // implicit mode: beginning discards whatever was in progress
            let _ = previous.abort();
        }

        let id = TransactionId::new(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let tx = InMemoryTransaction {
            inner: Arc::new(TxInner {
                id,
                state: Mutex::new(TransactionState::Active),
                notes: Mutex::new(Vec::new()),
                resources: Mutex::new(Vec::new()),
                doomed: AtomicBool::new(false),
                shared: Arc::downgrade(&self.shared),
            }),
        };
        self.shared.begins.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.history).push(tx.clone());
        *lock(&self.shared.current) = Some(tx.clone());
        Ok(tx)
    }

    fn current(&self) -> Result<InMemoryTransaction, ManagerError> {
        lock(&self.shared.current)
            .clone()
            .ok_or(ManagerError::NoTransaction)
    }

    fn abort_current(&self) -> Result<(), ManagerError> {
        let current = lock(&self.shared.current).clone();
        match current {
            Some(tx) => tx
                .abort()
                .map_err(|e| ManagerError::Unavailable(e.to_string().into())),
            None => Ok(()),
        }
    }

    fn clear_current(&self) {
        *lock(&self.shared.current) = None;
    }

    fn set_explicit(&self, explicit: bool) -> bool {
        self.shared.explicit.swap(explicit, Ordering::Relaxed)
    }
}
