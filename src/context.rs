//! Transaction identity and invocation snapshot types

use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;

/// Stable identity of a transaction handle
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Create a new transaction ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TransactionId({})", self.0)
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot of one loop invocation, passed with every loop event.
///
/// The arguments are shared, never mutated; subscribers that know the
/// handler's argument type can recover them with [`Invocation::args`].
#[derive(Clone)]
pub struct Invocation {
    /// Name of the handler being run
    pub handler: Box<str>,
    /// Index of the current attempt (0 = first attempt)
    pub attempt_index: u32,
    args: Arc<dyn Any + Send + Sync>,
}

impl Invocation {
    /// Create the snapshot for the first attempt
    pub fn new<A>(handler: &str, args: A) -> Self
    where
        A: Any + Send + Sync,
    {
        Self {
            handler: handler.into(),
            attempt_index: 0,
            args: Arc::new(args),
        }
    }

    /// Create the snapshot for a later attempt, sharing the same arguments
    pub fn for_attempt(&self, attempt_index: u32) -> Self {
        Self {
            attempt_index,
            ..self.clone()
        }
    }

    /// The handler arguments, if they are an `A`
    pub fn args<A: Any>(&self) -> Option<&A> {
        self.args.downcast_ref::<A>()
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("handler", &self.handler)
            .field("attempt_index", &self.attempt_index)
            .finish()
    }
}
