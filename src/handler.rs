//! The unit of work run by the loop, and its policy hooks

use crate::{ManagerError, TransactionId};
use std::future::Future;
use std::marker::PhantomData;

/// Work executed inside the loop's transaction.
///
/// Implementors must not begin, commit or abort the manager's transaction;
/// the loop detects it afterwards and fails the run. They may doom it, or
/// join resources to it.
///
/// # Example
///
/// ```rust,ignore
/// impl TransactionHandler for Transfer {
///     type Args = (AccountId, AccountId, u64);
///     type Output = Receipt;
///     type Error = TransferError;
///
///     async fn call(&self, (from, to, amount): Self::Args) -> Result<Receipt, TransferError> {
///         self.ledger.move_funds(from, to, amount).await
///     }
///
///     fn should_veto_commit(&self, receipt: &Receipt, _args: &Self::Args) -> bool {
///         receipt.is_dry_run()
///     }
/// }
/// ```
pub trait TransactionHandler: Send + Sync + 'static {
    /// Arguments, cloned for every attempt
    type Args: Clone + Send + Sync + 'static;
    /// Value returned by a successful attempt
    type Output: Send;
    /// Error raised by the work or its hooks
    type Error: std::error::Error + Send + Sync + 'static;

    /// Run the work once
    fn call(
        &self,
        args: Self::Args,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> + Send;

    // === Optional Hooks ===

    /// Name used in events and logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Note attached to every transaction of a run
    fn describe_transaction(&self, _args: &Self::Args) -> Option<String> {
        None
    }

    /// Called after each begin when the loop may make more than one attempt.
    /// Clean up whatever a previous attempt left behind.
    ///
    /// Returning [`Prep::AbortAndReturn`] aborts the fresh transaction and
    /// ends the run with that value, without calling the handler.
    fn prep_for_retry(
        &self,
        _attempts_remaining: u32,
        _transaction: TransactionId,
        _args: &Self::Args,
    ) -> Result<Prep<Self::Output>, Self::Error> {
        Ok(Prep::Continue)
    }

    /// `Some(true)` aborts a successful attempt instead of committing it.
    /// `None` defers to the loop's `side_effect_free` setting.
    fn is_side_effect_free(&self, _args: &Self::Args) -> Option<bool> {
        None
    }

    /// Withhold the commit of a successful attempt
    fn should_veto_commit(&self, _output: &Self::Output, _args: &Self::Args) -> bool {
        false
    }

    /// `begin()` failed with something other than `AlreadyInTransaction`.
    /// The manager is aborted right after this returns.
    fn on_begin_failed(&self, _error: &ManagerError, _args: &Self::Args) {}

    /// Called once before any attempt of a run
    fn set_up(&self) {}

    /// Called once when a run finishes, however it finishes
    fn tear_down(&self) {}
}

/// What [`TransactionHandler::prep_for_retry`] wants the loop to do next
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Prep<T> {
    /// Run the handler as usual
    Continue,
    /// Abort the transaction and return this value from the run
    AbortAndReturn(T),
}

/// Adapts an async closure into a [`TransactionHandler`]
pub struct FnHandler<F, A> {
    name: Box<str>,
    f: F,
    _args: PhantomData<fn(A)>,
}

impl<F, A> FnHandler<F, A> {
    /// Wrap `f`, reporting it as `name`
    pub fn new<Fut>(name: &str, f: F) -> Self
    where
        F: Fn(A) -> Fut,
    {
        Self {
            name: name.into(),
            f,
            _args: PhantomData,
        }
    }
}

impl<F, A, Fut, T, E> TransactionHandler for FnHandler<F, A>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send,
    A: Clone + Send + Sync + 'static,
    T: Send,
    E: std::error::Error + Send + Sync + 'static,
{
    type Args = A;
    type Output = T;
    type Error = E;

    fn call(&self, args: A) -> impl Future<Output = Result<T, E>> + Send {
        (self.f)(args)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
