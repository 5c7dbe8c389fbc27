//! Retryable-vs-fatal error classification

use crate::errors::find_in_chain;
use crate::Transaction;
use std::error::Error;
use std::sync::Arc;

type Matcher = dyn Fn(&(dyn Error + 'static)) -> Option<bool> + Send + Sync;

#[derive(Clone)]
struct RetryRule {
    type_name: &'static str,
    matcher: Arc<Matcher>,
}

/// Decides whether a failed attempt may be retried.
///
/// The transaction is asked first. When it does not certify the error, the
/// configured rules are checked in order: the first rule whose error type
/// appears in the error's `source()` chain decides. Anything else is fatal.
#[derive(Clone, Default)]
pub struct RetryClassifier {
    rules: Vec<RetryRule>,
}

impl RetryClassifier {
    /// Classifier with no rules: only the transaction can allow a retry
    pub fn new() -> Self {
        Self::default()
    }

    /// Always retry errors of type `E`
    pub fn retry_on<E>(self) -> Self
    where
        E: Error + 'static,
    {
        self.retry_on_if::<E, _>(|_| true)
    }

    /// Retry errors of type `E` for which `predicate` holds
    pub fn retry_on_if<E, P>(mut self, predicate: P) -> Self
    where
        E: Error + 'static,
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.rules.push(RetryRule {
            type_name: std::any::type_name::<E>(),
            matcher: Arc::new(move |error: &(dyn Error + 'static)| {
                find_in_chain::<E>(error).map(&predicate)
            }),
        });
        self
    }

    /// Are there no configured rules?
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Should the attempt that failed with `error` inside `transaction` be retried?
    pub fn decide<T: Transaction>(&self, transaction: &T, error: &(dyn Error + 'static)) -> bool {
        match transaction.is_retryable_error(error) {
            Ok(true) => return true,
            Ok(false) => {}
            Err(unknown) => {
                tracing::debug!(
                    transaction = %transaction.id(),
                    reason = %unknown,
                    "Transaction could not classify error; using configured rules"
                );
            }
        }
        self.matches(error).unwrap_or(false)
    }

    fn matches(&self, error: &(dyn Error + 'static)) -> Option<bool> {
        self.rules.iter().find_map(|rule| (rule.matcher)(error))
    }
}

impl std::fmt::Debug for RetryClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|r| r.type_name))
            .finish()
    }
}
