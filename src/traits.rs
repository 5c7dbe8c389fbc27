//! Traits implemented by the backing transactional resource manager

use crate::{ManagerError, TransactionError, TransactionId};
use std::error::Error;
use std::sync::Arc;

/// One attempt's transaction handle.
///
/// Handles are cheap to clone; clones refer to the same transaction.
pub trait Transaction: Clone + Send + Sync + 'static {
    /// Identity, stable for the whole life of the transaction
    fn id(&self) -> TransactionId;

    /// Commit the transaction
    ///
    /// `InvalidArgument` means the call itself was malformed; `InvalidState`
    /// means the transaction was already finished and never got to commit.
    fn commit(&self) -> Result<(), TransactionError>;

    /// Abort the transaction. Best effort; may itself fail.
    fn abort(&self) -> Result<(), TransactionError>;

    /// Attach a human-readable note
    fn note(&self, text: &str);

    /// Has the transaction been marked unsafe to commit?
    fn is_doomed(&self) -> bool;

    /// Descriptions of the resources that joined this transaction
    fn joined_resources(&self) -> Vec<String>;

    /// Does the backing store consider `error` transient?
    ///
    /// `Err` means the store cannot answer authoritatively.
    fn is_retryable_error(&self, error: &(dyn Error + 'static)) -> Result<bool, ManagerError>;
}

/// The transactional resource manager.
///
/// Implementations must scope "the current transaction" to one caller's
/// thread of control: concurrent [`TransactionLoop::run`](crate::TransactionLoop::run)
/// calls must not observe each other's transactions.
pub trait TransactionManager: Send + Sync + 'static {
    /// Handle type produced by [`begin`](Self::begin)
    type Transaction: Transaction;

    /// Begin a new transaction and make it current
    fn begin(&self) -> Result<Self::Transaction, ManagerError>;

    /// The currently active transaction
    fn current(&self) -> Result<Self::Transaction, ManagerError>;

    /// Abort the current transaction, if any
    fn abort_current(&self) -> Result<(), ManagerError>;

    /// Forget the current transaction without touching it
    fn clear_current(&self);

    /// Switch explicit mode on or off, returning the previous mode
    fn set_explicit(&self, explicit: bool) -> bool;
}

impl<M: TransactionManager> TransactionManager for Arc<M> {
    type Transaction = M::Transaction;

    fn begin(&self) -> Result<Self::Transaction, ManagerError> {
        (**self).begin()
    }

    fn current(&self) -> Result<Self::Transaction, ManagerError> {
        (**self).current()
    }

    fn abort_current(&self) -> Result<(), ManagerError> {
        (**self).abort_current()
    }

    fn clear_current(&self) {
        (**self).clear_current()
    }

    fn set_explicit(&self, explicit: bool) -> bool {
        (**self).set_explicit(explicit)
    }
}
