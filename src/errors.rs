//! Error types for the transaction loop and its collaborators

use std::error::Error;

/// Error raised by a [`TransactionManager`](crate::TransactionManager)
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    /// No transaction is active (explicit mode)
    #[error("no transaction is in progress")]
    NoTransaction,
    /// `begin()` was called while a transaction was already active (explicit mode)
    #[error("a transaction is already in progress")]
    AlreadyInTransaction,
    /// `begin()` failed, typically because a synchronizer raised
    #[error("failed to begin transaction: {0}")]
    BeginFailed(Box<str>),
    /// The manager cannot answer the question asked of it
    #[error("transaction manager unavailable: {0}")]
    Unavailable(Box<str>),
}

/// Error raised by a single [`Transaction`](crate::Transaction) handle
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    /// The call received arguments of the wrong shape
    #[error("invalid argument: {0}")]
    InvalidArgument(Box<str>),
    /// The transaction cannot perform the operation in its current state
    #[error("invalid transaction state: {0}")]
    InvalidState(Box<str>),
    /// Concurrent modification detected by the backing store
    #[error("conflict: {0}")]
    Conflict(Box<str>),
    /// Any other backing-store failure
    #[error("storage error: {0}")]
    Storage(Box<str>),
}

/// Error from [`CommitExecutor::commit`](crate::CommitExecutor::commit)
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommitError {
    /// The commit call received malformed input
    #[error("commit failed: {message}")]
    Failed {
        /// Message of the underlying error
        message: Box<str>,
    },
    /// The commit was attempted and failed, or never had a chance to run
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

/// Error returned by [`TransactionLoop::run`](crate::TransactionLoop::run)
///
/// Retried errors are returned exactly as the last attempt raised them, so
/// callers can match on the handler's own error type.
#[derive(Debug, thiserror::Error)]
pub enum LoopError<E> {
    /// The handler (or one of its hooks) failed
    #[error(transparent)]
    Handler(E),
    /// The commit call received malformed input; never retried by itself
    #[error("commit failed: {message}")]
    CommitFailed {
        /// Message of the underlying error
        message: Box<str>,
    },
    /// Commit failed in the backing store
    #[error(transparent)]
    Transaction(TransactionError),
    /// Aborting the transaction failed while handling `original`
    #[error("failed to abort transaction while handling another error: {abort}")]
    AbortFailed {
        /// The abort failure
        #[source]
        abort: TransactionError,
        /// The error that was being handled when the abort failed
        original: Box<LoopError<E>>,
    },
    /// The handler committed the loop's transaction and began another one
    #[error(
        "transaction currently in progress is not the one the loop began; \
         handlers must not perform transaction lifecycle operations"
    )]
    ForeignTransaction,
    /// The handler ended the transaction without beginning another, or a
    /// side-effect-free transaction joined resources in strict mode
    #[error("transaction lifecycle violation: {0}")]
    Lifecycle(Box<str>),
    /// The transaction manager refused an operation issued by the loop
    #[error(transparent)]
    Manager(ManagerError),
}

impl<E> From<CommitError> for LoopError<E> {
    fn from(error: CommitError) -> Self {
        match error {
            CommitError::Failed { message } => Self::CommitFailed { message },
            CommitError::Transaction(error) => Self::Transaction(error),
        }
    }
}

impl<E> LoopError<E>
where
    E: Error + 'static,
{
    /// The underlying cause, as seen by retry classification
    pub fn as_error(&self) -> &(dyn Error + 'static) {
        match self {
            Self::Handler(error) => error,
            Self::Transaction(error) => error,
            Self::Manager(error) => error,
            other => other,
        }
    }

    /// Find a [`ManagerError`] raised directly or wrapped by the handler's error
    pub fn manager_error(&self) -> Option<&ManagerError> {
        find_in_chain::<ManagerError>(self.as_error())
    }

    /// Get the handler error, if that is what this is
    pub fn handler_error(&self) -> Option<&E> {
        match self {
            Self::Handler(error) => Some(error),
            _ => None,
        }
    }

    /// The error being handled when an abort failed
    pub fn original(&self) -> Option<&LoopError<E>> {
        match self {
            Self::AbortFailed { original, .. } => Some(original),
            _ => None,
        }
    }

    /// Check if this is one of the fatal lifecycle violations
    pub fn is_lifecycle_violation(&self) -> bool {
        matches!(self, Self::ForeignTransaction | Self::Lifecycle(_))
    }
}

/// Walk `error` and its `source()` chain looking for a `T`
pub fn find_in_chain<'a, T: Error + 'static>(error: &'a (dyn Error + 'static)) -> Option<&'a T> {
    let mut current = Some(error);
    while let Some(error) = current {
        if let Some(found) = error.downcast_ref::<T>() {
            return Some(found);
        }
        current = error.source();
    }
    None
}
