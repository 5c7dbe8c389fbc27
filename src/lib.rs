//! Transactional Retry Loop
//!
//! Runs a unit of work inside a transaction of a pluggable transaction
//! manager, committing on success and retrying transient failures with
//! jittered exponential backoff. Handlers implement [`TransactionHandler`];
//! managers implement [`TransactionManager`] and [`Transaction`].
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // 1. Wrap the work as a handler
//! let handler = FnHandler::new("transfer", |(from, to, amount)| async move {
//!     ledger.move_funds(from, to, amount).await
//! });
//!
//! // 2. Build the loop around a manager
//! let tx_loop = TransactionLoop::builder(handler, manager)
//!     .attempts(5)
//!     .backoff_base(Duration::from_millis(20))
//!     .retry_on::<DeadlockError>()
//!     .stats(Arc::new(LoopStats::new()))
//!     .subscribe(Arc::new(TracingSubscriber))
//!     .build()?;
//!
//! // 3. Run it; retried errors come back as the handler raised them
//! let receipt = tx_loop.run((alice, bob, 100)).await?;
//! ```

#![warn(missing_docs)]

// === Core Types ===
mod attempt;
mod config;
mod context;
mod errors;
mod events;

// === Traits ===
mod handler;
mod runtime;
mod traits;

// === Policies ===
mod backoff;
mod classifier;
mod commit;

// === Storage ===
mod journal;
mod memory;

// === Observability ===
mod observer;
mod stats;

// === Loop ===
mod transaction_loop;

#[cfg(any(test, feature = "test-harness"))]
pub mod testing;

// === Re-exports ===

// Types
pub use attempt::{Attempt, AttemptPosition};
pub use config::{ConfigError, LoopConfig, DEFAULT_LONG_RUNNING_COMMIT};
pub use context::{Invocation, TransactionId};

// Events
pub use events::LoopEvent;

// Errors
pub use errors::{find_in_chain, CommitError, LoopError, ManagerError, TransactionError};

// Traits
pub use handler::{FnHandler, Prep, TransactionHandler};
pub use runtime::{Clock, SleepFuture, Sleeper, SystemClock, TokioSleeper};
pub use traits::{Transaction, TransactionManager};

// Policies
pub use backoff::{BackoffPolicy, CeilingRandom, RandomSource, SeededRandom, ThreadRandom};
pub use classifier::RetryClassifier;
pub use commit::{CommitExecutor, CommitReport};

// Storage
pub use journal::{EventJournal, JournalEntry};
pub use memory::{ConflictError, InMemoryManager, InMemoryTransaction, TransactionState};

// Observability
pub use observer::{EventPublisher, EventSubscriber, TracingSubscriber};
pub use stats::{names as stat_names, LoopStats, LoopStatsSnapshot, NullStats, StatsEmitter};

// Loop
pub use transaction_loop::{TransactionLoop, TransactionLoopBuilder};
