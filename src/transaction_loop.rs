//! The transaction retry loop
//!
//! Each call to [`TransactionLoop::run`] makes up to `attempts` attempts. An
//! attempt begins a transaction, runs the handler, checks that the handler
//! left the transaction alone, then either commits or aborts it. Errors are
//! classified; retryable ones abort, back off and go round again, anything
//! else is returned exactly as raised.

use crate::attempt::{Attempt, AttemptGuard, AttemptPosition};
use crate::backoff::{BackoffPolicy, RandomSource, ThreadRandom};
use crate::runtime::{Clock, Sleeper, SystemClock, TokioSleeper};
use crate::stats::{names, NullStats, StatsBuffer, StatsEmitter};
use crate::{
    CommitExecutor, ConfigError, EventPublisher, EventSubscriber, Invocation, LoopConfig,
    LoopError, LoopEvent, ManagerError, Prep, RetryClassifier, Transaction, TransactionHandler,
    TransactionManager,
};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// Why a successful attempt was aborted instead of committed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AbortReason {
    SideEffectFree,
    Doomed,
    Vetoed,
    Prepared,
}

impl AbortReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::SideEffectFree => "side-effect free",
            Self::Doomed => "doomed",
            Self::Vetoed => "vetoed",
            Self::Prepared => "abandoned while preparing",
        }
    }
}

enum Outcome<T> {
    Committed(T),
    Abort { value: T, reason: AbortReason },
}

/// Runs a [`TransactionHandler`] inside transactions of a [`TransactionManager`],
/// retrying transient failures.
///
/// The loop is immutable once built; concurrent `run` calls share only its
/// configuration and the manager.
pub struct TransactionLoop<H, M> {
    handler: H,
    manager: M,
    config: LoopConfig,
    classifier: RetryClassifier,
    backoff: BackoffPolicy,
    committer: CommitExecutor,
    stats: Arc<dyn StatsEmitter>,
    events: EventPublisher,
    sleeper: Arc<dyn Sleeper>,
    random: Arc<dyn RandomSource>,
}

impl<H, M> TransactionLoop<H, M>
where
    H: TransactionHandler,
    M: TransactionManager,
{
    /// Start configuring a loop around `handler` and `manager`
    pub fn builder(handler: H, manager: M) -> TransactionLoopBuilder<H, M> {
        TransactionLoopBuilder::new(handler, manager)
    }

    /// A loop with the default configuration
    pub fn new(handler: H, manager: M) -> Result<Self, ConfigError> {
        Self::builder(handler, manager).build()
    }

    /// Settings the loop was built with
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// The wrapped handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The transaction manager
    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Run the handler with `args` until it commits, is aborted on purpose,
    /// fails fatally, or runs out of attempts.
    ///
    /// The manager is held in explicit mode for the duration of the call.
    /// Dropping the returned future aborts the attempt in progress.
    pub async fn run(&self, args: H::Args) -> Result<H::Output, LoopError<H::Error>> {
        let note = self.handler.describe_transaction(&args);
        let stats = StatsBuffer::new(&*self.stats, &*self.random, self.config.sample_rate);
        let mut scope = RunScope::enter(&self.manager, &self.handler, stats);
        self.handler.set_up();

        let result = self.run_attempts(&args, note.as_deref(), &mut scope.stats).await;
        if result.is_err() {
            scope.stats.incr(names::FAILED, 1);
            scope
                .stats
                .incr(names::RETRY, u64::from(self.config.attempts - 1));
        }
        result
    }

    async fn run_attempts(
        &self,
        args: &H::Args,
        note: Option<&str>,
        stats: &mut StatsBuffer<'_>,
    ) -> Result<H::Output, LoopError<H::Error>> {
        let invocation = Invocation::new(self.handler.name(), args.clone());
        let mut attempt = Attempt::first(self.config.attempts);

        loop {
            let transaction = self.begin(args)?;
            let mut guard = AttemptGuard::new(&transaction);
            if let Some(note) = note {
                transaction.note(note);
            }
            let invocation = invocation.for_attempt(attempt.index);
            self.events.notify(&mut LoopEvent::AfterTransactionBegan {
                invocation: invocation.clone(),
                transaction: transaction.id(),
            });

            let outcome = self
                .attempt(&transaction, &attempt, &invocation, args, note, stats)
                .await;
            guard.disarm();

            let error = match outcome {
                Ok(Outcome::Committed(value)) => {
                    stats.incr(names::SUCCESSFUL, 1);
                    if attempt.index > 0 {
                        stats.incr(names::RETRY, u64::from(attempt.index));
                    }
                    return Ok(value);
                }
                Ok(Outcome::Abort { value, reason }) => {
                    if let Err(abort) = transaction.abort() {
                        self.forget(&transaction);
                        return Err(LoopError::Transaction(abort));
                    }
                    tracing::debug!(
                        transaction = %transaction.id(),
                        reason = reason.as_str(),
                        "Aborted transaction instead of committing"
                    );
                    return Ok(value);
                }
                Err(error) => error,
            };

            attempt = self.recover(&transaction, error, &attempt, &invocation).await?;
        }
    }

    fn begin(&self, args: &H::Args) -> Result<M::Transaction, LoopError<H::Error>> {
        match self.manager.begin() {
            Ok(transaction) => Ok(transaction),
            Err(error @ ManagerError::AlreadyInTransaction) => Err(LoopError::Manager(error)),
            Err(error) => {
                self.handler.on_begin_failed(&error, args);
                if let Err(abort) = self.manager.abort_current() {
                    tracing::error!(
                        error = %abort,
                        begin_error = %error,
                        "Failure when aborting transaction after failure to begin; \
                         the begin error is returned"
                    );
                }
                Err(LoopError::Manager(error))
            }
        }
    }

    async fn attempt(
        &self,
        transaction: &M::Transaction,
        attempt: &Attempt,
        invocation: &Invocation,
        args: &H::Args,
        note: Option<&str>,
        stats: &mut StatsBuffer<'_>,
    ) -> Result<Outcome<H::Output>, LoopError<H::Error>> {
        if self.config.attempts > 1 {
            let prep = self
                .handler
                .prep_for_retry(attempt.attempts_remaining, transaction.id(), args)
                .map_err(LoopError::Handler)?;
            if let Prep::AbortAndReturn(value) = prep {
                return Ok(Outcome::Abort {
                    value,
                    reason: AbortReason::Prepared,
                });
            }
        }

        let invocation = invocation.clone();
        let id = transaction.id();
        let index = attempt.index;
        self.events.notify(&mut match attempt.position() {
            AttemptPosition::First => LoopEvent::WillFirstAttempt {
                invocation,
                transaction: id,
                attempt: index,
            },
            AttemptPosition::Retry => LoopEvent::WillRetryAttempt {
                invocation,
                transaction: id,
                attempt: index,
            },
            AttemptPosition::Last => LoopEvent::WillLastAttempt {
                invocation,
                transaction: id,
                attempt: index,
            },
        });

        let value = self
            .handler
            .call(args.clone())
            .await
            .map_err(LoopError::Handler)?;

        self.validate_lifecycle(transaction)?;

        let side_effect_free = self
            .handler
            .is_side_effect_free(args)
            .unwrap_or(self.config.side_effect_free);
        if side_effect_free {
            stats.incr(names::SIDE_EFFECT_FREE, 1);
            self.check_side_effect_free(transaction, stats)?;
            return Ok(Outcome::Abort {
                value,
                reason: AbortReason::SideEffectFree,
            });
        }

        if transaction.is_doomed() {
            stats.incr(names::DOOMED, 1);
            return Ok(Outcome::Abort {
                value,
                reason: AbortReason::Doomed,
            });
        }

        if self.handler.should_veto_commit(&value, args) {
            stats.incr(names::VETOED, 1);
            return Ok(Outcome::Abort {
                value,
                reason: AbortReason::Vetoed,
            });
        }

        self.committer.commit(
            transaction,
            self.config.long_commit_threshold,
            attempt.index,
            attempt.accumulated_sleep,
            note,
        )?;
        Ok(Outcome::Committed(value))
    }

    /// The handler must leave the loop's transaction current
    fn validate_lifecycle(&self, transaction: &M::Transaction) -> Result<(), LoopError<H::Error>> {
        match self.manager.current() {
            Ok(current) if current.id() == transaction.id() => Ok(()),
            Ok(_) => Err(LoopError::ForeignTransaction),
            Err(ManagerError::NoTransaction) => Err(LoopError::Lifecycle(
                "the handler aborted or committed the transaction and did not begin \
                 another one; handlers must not perform transaction lifecycle operations"
                    .into(),
            )),
            Err(error) => Err(LoopError::Manager(error)),
        }
    }

    fn check_side_effect_free(
        &self,
        transaction: &M::Transaction,
        stats: &mut StatsBuffer<'_>,
    ) -> Result<(), LoopError<H::Error>> {
        let resources = transaction.joined_resources();
        if resources.is_empty() {
            return Ok(());
        }

        stats.incr(names::SIDE_EFFECT_FREE_VIOLATION, 1);
        let report = if resources.len() > self.config.side_effect_free_resource_limit {
            format!("(count={})", resources.len())
        } else {
            format!("{:?}", resources)
        };

        if !self.config.side_effect_free_strict {
            tracing::debug!(
                transaction = %transaction.id(),
                resources = %report,
                "Transaction nominally side-effect free has resource managers"
            );
            return Ok(());
        }

        tracing::error!(
            transaction = %transaction.id(),
            resources = %report,
            "Transaction nominally side-effect free has resource managers"
        );
        abort_quietly(transaction);
        Err(LoopError::Lifecycle(
            format!(
                "transaction that was supposed to be side-effect free had resource managers {}",
                report
            )
            .into(),
        ))
    }

    /// Handle a failed attempt: returns the next attempt, or the error to give up with
    async fn recover(
        &self,
        transaction: &M::Transaction,
        error: LoopError<H::Error>,
        attempt: &Attempt,
        invocation: &Invocation,
    ) -> Result<Attempt, LoopError<H::Error>> {
        if matches!(error, LoopError::ForeignTransaction) {
            // Ours is already finished; the stray one is in an unknown state.
            self.abort_current_quietly();
            return Err(error);
        }
        if matches!(error, LoopError::Lifecycle(_)) {
            return Err(error);
        }

        match error.manager_error().cloned() {
            Some(ManagerError::NoTransaction) => return Err(error),
            Some(ManagerError::AlreadyInTransaction) => {
                // The handler began again: up to two transactions to clean up.
                let current = self.manager.current().ok().map(|tx| tx.id());
                self.abort_current_quietly();
                if current != Some(transaction.id()) {
                    abort_quietly(transaction);
                }
                return Err(error);
            }
            _ => {}
        }

        // Classify before aborting: aborting may change what the manager knows.
        let retryable = self.classifier.decide(transaction, error.as_error());
        if let Err(abort) = transaction.abort() {
            tracing::error!(
                transaction = %transaction.id(),
                error = %error,
                abort_error = %abort,
                retryable,
                "Failed to abort transaction following error"
            );
            self.forget(transaction);
            return Err(LoopError::AbortFailed {
                abort,
                original: Box::new(error),
            });
        }
        tracing::debug!(
            transaction = %transaction.id(),
            error = %error,
            retryable,
            attempts_remaining = attempt.attempts_remaining,
            "Transaction aborted"
        );

        if !retryable || attempt.is_last() {
            return Err(error);
        }

        let slept = self.sleep_between_attempts(attempt, invocation).await;
        Ok(attempt.next(slept))
    }

    async fn sleep_between_attempts(&self, attempt: &Attempt, invocation: &Invocation) -> Duration {
        if !self.backoff.is_enabled() {
            return Duration::ZERO;
        }
        let delay = self.backoff.next_delay(attempt.index);
        let mut event = LoopEvent::WillSleepBetweenAttempts {
            invocation: invocation.clone(),
            sleep: delay,
        };
        self.events.notify(&mut event);
        let delay = event.sleep().unwrap_or(delay);
        self.sleeper.sleep(delay).await;
        delay
    }

    /// Drop a handle whose abort failed from the manager's current slot
    fn forget(&self, transaction: &M::Transaction) {
        if self.manager.current().ok().map(|tx| tx.id()) == Some(transaction.id()) {
            self.manager.clear_current();
        }
    }

    fn abort_current_quietly(&self) {
        if let Err(error) = self.manager.abort_current() {
            tracing::debug!(error = %error, "Ignoring failure to abort current transaction");
        }
        self.manager.clear_current();
    }
}

fn abort_quietly<T: Transaction>(transaction: &T) {
    if let Err(error) = transaction.abort() {
        tracing::debug!(transaction = %transaction.id(), error = %error, "Ignoring abort failure");
    }
}

impl<H, M> std::fmt::Debug for TransactionLoop<H, M>
where
    H: TransactionHandler,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLoop")
            .field("handler", &self.handler.name())
            .field("attempts", &self.config.attempts)
            .field("long_commit_threshold", &self.config.long_commit_threshold)
            .field("backoff", &self.backoff)
            .field("classifier", &self.classifier)
            .finish()
    }
}

/// Explicit mode, set-up/tear-down and stats flushing for one run.
///
/// Dropped on every exit path: mode restored, then `tear_down`, then the
/// stats buffer flushes.
struct RunScope<'a, H: TransactionHandler, M: TransactionManager> {
    manager: &'a M,
    handler: &'a H,
    was_explicit: bool,
    stats: StatsBuffer<'a>,
}

impl<'a, H: TransactionHandler, M: TransactionManager> RunScope<'a, H, M> {
    fn enter(manager: &'a M, handler: &'a H, stats: StatsBuffer<'a>) -> Self {
        let was_explicit = manager.set_explicit(true);
        Self {
            manager,
            handler,
            was_explicit,
            stats,
        }
    }
}

impl<H: TransactionHandler, M: TransactionManager> Drop for RunScope<'_, H, M> {
    fn drop(&mut self) {
        self.manager.set_explicit(self.was_explicit);
        self.handler.tear_down();
    }
}

/// Builder for [`TransactionLoop`]
pub struct TransactionLoopBuilder<H, M> {
    handler: H,
    manager: M,
    config: LoopConfig,
    classifier: RetryClassifier,
    stats: Arc<dyn StatsEmitter>,
    events: EventPublisher,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
}

impl<H, M> TransactionLoopBuilder<H, M>
where
    H: TransactionHandler,
    M: TransactionManager,
{
    /// Builder with the default configuration and no subscribers
    pub fn new(handler: H, manager: M) -> Self {
        Self {
            handler,
            manager,
            config: LoopConfig::default(),
            classifier: RetryClassifier::new(),
            stats: Arc::new(NullStats),
            events: EventPublisher::new(),
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(SystemClock),
            random: Arc::new(ThreadRandom),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    /// Total attempts, including the first
    pub fn attempts(mut self, attempts: u32) -> Self {
        self.config.attempts = attempts;
        self
    }

    /// Enable backoff between attempts with this base delay
    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.config.backoff_base = Some(base);
        self
    }

    /// Commits slower than this are logged at WARN
    pub fn long_commit_threshold(mut self, threshold: Duration) -> Self {
        self.config.long_commit_threshold = threshold;
        self
    }

    /// Probability that each stat increment is reported
    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.config.sample_rate = rate;
        self
    }

    /// Abort instead of commit when the handler does not say otherwise
    pub fn side_effect_free(mut self, side_effect_free: bool) -> Self {
        self.config.side_effect_free = side_effect_free;
        self
    }

    /// Fail runs whose side-effect-free transaction joined resources
    pub fn side_effect_free_strict(mut self, strict: bool) -> Self {
        self.config.side_effect_free_strict = strict;
        self
    }

    /// Replace the retry rules
    pub fn classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Retry errors of type `E` the transaction does not certify itself
    pub fn retry_on<E>(mut self) -> Self
    where
        E: Error + 'static,
    {
        self.classifier = self.classifier.retry_on::<E>();
        self
    }

    /// Retry errors of type `E` for which `predicate` holds
    pub fn retry_on_if<E, P>(mut self, predicate: P) -> Self
    where
        E: Error + 'static,
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.classifier = self.classifier.retry_on_if::<E, P>(predicate);
        self
    }

    /// Where stats are reported; discarded by default
    pub fn stats(mut self, stats: Arc<dyn StatsEmitter>) -> Self {
        self.stats = stats;
        self
    }

    /// Add an event subscriber
    pub fn subscribe(mut self, subscriber: Arc<dyn EventSubscriber>) -> Self {
        self.events.subscribe(subscriber);
        self
    }

    /// How the loop sleeps between attempts; tokio's timer by default
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Clock used to time commits
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Randomness for backoff jitter and stat sampling
    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Validate the configuration and build the loop
    pub fn build(self) -> Result<TransactionLoop<H, M>, ConfigError> {
        self.config.validate()?;
        Ok(TransactionLoop {
            backoff: BackoffPolicy::new(self.config.backoff_base, self.random.clone()),
            committer: CommitExecutor::new(self.clock),
            handler: self.handler,
            manager: self.manager,
            config: self.config,
            classifier: self.classifier,
            stats: self.stats,
            events: self.events,
            sleeper: self.sleeper,
            random: self.random,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{init_tracing, RecordingSleeper};
    use crate::{
        CeilingRandom, ConflictError, EventJournal, FnHandler, InMemoryManager, LoopStats,
        LoopStatsSnapshot, TransactionError, TransactionId, TransactionState,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("transient failure")]
        Transient,
        #[error("fatal failure")]
        Fatal,
        #[error("write conflict")]
        Conflict(#[from] ConflictError),
        #[error("manager refused")]
        Manager(#[from] ManagerError),
        #[error("transaction refused")]
        Transaction(#[from] TransactionError),
    }

    /// Ways a misbehaving handler touches the transaction lifecycle
    #[derive(Clone, Copy, Debug)]
    enum Meddle {
        Commit,
        CommitAndBegin,
        BeginNested,
        AbortThenQuery,
    }

    struct Harness {
        manager: Arc<InMemoryManager>,
        stats: Arc<LoopStats>,
        journal: Arc<EventJournal>,
        sleeper: Arc<RecordingSleeper>,
    }

    impl Harness {
        fn new() -> Self {
            init_tracing();
            Self {
                manager: Arc::new(InMemoryManager::new()),
                stats: Arc::new(LoopStats::new()),
                journal: Arc::new(EventJournal::new()),
                sleeper: Arc::new(RecordingSleeper::new()),
            }
        }

        fn builder<H: TransactionHandler>(
            &self,
            handler: H,
        ) -> TransactionLoopBuilder<H, Arc<InMemoryManager>> {
            TransactionLoop::builder(handler, self.manager.clone())
                .sample_rate(1.0)
                .stats(self.stats.clone())
                .subscribe(self.journal.clone())
                .sleeper(self.sleeper.clone())
                .random(Arc::new(CeilingRandom))
                .retry_on_if::<TestError, _>(|e| matches!(e, TestError::Transient))
        }

        fn snapshot(&self) -> LoopStatsSnapshot {
            self.stats.snapshot()
        }

        fn states(&self) -> Vec<TransactionState> {
            self.manager.history().iter().map(|tx| tx.state()).collect()
        }
    }

    struct Scripted {
        manager: Arc<InMemoryManager>,
        failures: u32,
        failure: fn() -> TestError,
        doom: bool,
        veto: bool,
        panic: bool,
        side_effect_free: Option<bool>,
        resources: Vec<&'static str>,
        meddle: Option<Meddle>,
        prep_result: Option<u32>,
        calls: AtomicU32,
        preps: Mutex<Vec<(u32, TransactionId)>>,
        begin_failures: AtomicU32,
        set_ups: AtomicU32,
        tear_downs: AtomicU32,
    }

    impl Scripted {
        fn new(harness: &Harness) -> Self {
            Self {
                manager: harness.manager.clone(),
                failures: 0,
                failure: || TestError::Transient,
                doom: false,
                veto: false,
                panic: false,
                side_effect_free: None,
                resources: Vec::new(),
                meddle: None,
                prep_result: None,
                calls: AtomicU32::new(0),
                preps: Mutex::new(Vec::new()),
                begin_failures: AtomicU32::new(0),
                set_ups: AtomicU32::new(0),
                tear_downs: AtomicU32::new(0),
            }
        }

        fn failing(harness: &Harness, failures: u32, failure: fn() -> TestError) -> Self {
            Self {
                failures,
                failure,
                ..Self::new(harness)
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn preps(&self) -> Vec<(u32, TransactionId)> {
            self.preps.lock().unwrap().clone()
        }
    }

    impl TransactionHandler for Scripted {
        type Args = String;
        type Output = u32;
        type Error = TestError;

        async fn call(&self, _account: String) -> Result<u32, TestError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic {
                panic!("handler exploded");
            }

            let current = self.manager.current()?;
            if self.doom {
                current.doom();
            }
            for resource in &self.resources {
                current.join(resource);
            }
            match self.meddle {
                Some(Meddle::Commit) => current.commit()?,
                Some(Meddle::CommitAndBegin) => {
                    current.commit()?;
                    self.manager.begin()?;
                }
                Some(Meddle::BeginNested) => {
                    self.manager.begin()?;
                }
                Some(Meddle::AbortThenQuery) => {
                    current.abort()?;
                    self.manager.current()?;
                }
                None => {}
            }

            if call <= self.failures {
                return Err((self.failure)());
            }
            Ok(call)
        }

        fn name(&self) -> &str {
            "scripted"
        }

        fn describe_transaction(&self, account: &Self::Args) -> Option<String> {
            Some(format!("credit {}", account))
        }

        fn prep_for_retry(
            &self,
            attempts_remaining: u32,
            transaction: TransactionId,
            _args: &Self::Args,
        ) -> Result<Prep<u32>, TestError> {
            self.preps.lock().unwrap().push((attempts_remaining, transaction));
            Ok(match self.prep_result {
                Some(value) => Prep::AbortAndReturn(value),
                None => Prep::Continue,
            })
        }

        fn is_side_effect_free(&self, _args: &Self::Args) -> Option<bool> {
            self.side_effect_free
        }

        fn should_veto_commit(&self, _output: &u32, _args: &Self::Args) -> bool {
            self.veto
        }

        fn on_begin_failed(&self, _error: &ManagerError, _args: &Self::Args) {
            self.begin_failures.fetch_add(1, Ordering::SeqCst);
        }

        fn set_up(&self) {
            self.set_ups.fetch_add(1, Ordering::SeqCst);
        }

        fn tear_down(&self) {
            self.tear_downs.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FixedSleep(Duration);

    impl EventSubscriber for FixedSleep {
        fn on_event(&self, event: &mut LoopEvent) {
            if let LoopEvent::WillSleepBetweenAttempts { sleep, .. } = event {
                *sleep = self.0;
            }
        }
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let harness = Harness::new();
        let tx_loop = harness
            .builder(Scripted::failing(&harness, 2, || TestError::Transient))
            .backoff_base(ms(10))
            .build()
            .unwrap();

        assert_eq!(tx_loop.run("alice".into()).await.unwrap(), 3);

        let manager = &harness.manager;
        assert_eq!((manager.begins(), manager.commits(), manager.aborts()), (3, 1, 2));
        assert_eq!(
            harness.states(),
            vec![
                TransactionState::Aborted,
                TransactionState::Aborted,
                TransactionState::Committed
            ]
        );
        assert_eq!(harness.sleeper.sleeps(), vec![ms(10), ms(30)]);

        let snapshot = harness.snapshot();
        assert_eq!(snapshot.successful, 1);
        assert_eq!(snapshot.retry, 2);
        assert_eq!(snapshot.failed, 0);
        assert_eq!(snapshot.flushes, 1);

        let handler = tx_loop.handler();
        let remaining: Vec<u32> = handler.preps().iter().map(|(r, _)| *r).collect();
        assert_eq!(remaining, vec![2, 1, 0]);
        assert_eq!(handler.set_ups.load(Ordering::SeqCst), 1);
        assert_eq!(handler.tear_downs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backoff_doubles_across_attempts() {
        let harness = Harness::new();
        let tx_loop = harness
            .builder(Scripted::failing(&harness, 5, || TestError::Transient))
            .attempts(6)
            .backoff_base(ms(100))
            .build()
            .unwrap();

        assert_eq!(tx_loop.run("alice".into()).await.unwrap(), 6);
        assert_eq!(harness.manager.begins(), 6);
        assert_eq!(
            harness.sleeper.sleeps(),
            vec![ms(100), ms(300), ms(700), ms(1500), ms(3100)]
        );
        assert_eq!(harness.journal.sleeps(), harness.sleeper.sleeps());
        assert_eq!(harness.snapshot().retry, 5);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_return_last_error() {
        let harness = Harness::new();
        let tx_loop = harness
            .builder(Scripted::failing(&harness, 10, || TestError::Transient))
            .backoff_base(ms(10))
            .build()
            .unwrap();

        let error = tx_loop.run("alice".into()).await.unwrap_err();
        assert!(matches!(error, LoopError::Handler(TestError::Transient)));

        let manager = &harness.manager;
        assert_eq!((manager.begins(), manager.commits(), manager.aborts()), (3, 0, 3));
        // no sleep after the last attempt
        assert_eq!(harness.sleeper.sleeps().len(), 2);

        let snapshot = harness.snapshot();
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.retry, 2);
        assert_eq!(snapshot.successful, 0);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let harness = Harness::new();
        let tx_loop = harness
            .builder(Scripted::failing(&harness, 5, || TestError::Fatal))
            .backoff_base(ms(10))
            .build()
            .unwrap();

        let error = tx_loop.run("alice".into()).await.unwrap_err();
        assert!(matches!(error, LoopError::Handler(TestError::Fatal)));
        assert_eq!(tx_loop.handler().calls(), 1);
        assert_eq!(harness.states(), vec![TransactionState::Aborted]);
        assert!(harness.sleeper.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_events_follow_attempts() {
        let harness = Harness::new();
        let tx_loop = harness
            .builder(Scripted::failing(&harness, 2, || TestError::Transient))
            .backoff_base(ms(10))
            .build()
            .unwrap();

        tx_loop.run("alice".into()).await.unwrap();

        assert_eq!(
            harness.journal.event_types(),
            vec![
                "after_transaction_began",
                "will_first_attempt",
                "will_sleep_between_attempts",
                "after_transaction_began",
                "will_retry_attempt",
                "will_sleep_between_attempts",
                "after_transaction_began",
                "will_last_attempt",
            ]
        );

        let entries = harness.journal.entries();
        let indexes: Vec<u32> = entries.iter().map(|e| e.attempt_index).collect();
        assert_eq!(indexes, vec![0, 0, 0, 1, 1, 1, 2, 2]);
        assert!(entries.iter().all(|e| &*e.handler == "scripted"));

        let ids: Vec<TransactionId> = harness.manager.history().iter().map(|tx| tx.id()).collect();
        assert_eq!(entries[0].transaction, Some(ids[0]));
        assert_eq!(entries[7].transaction, Some(ids[2]));
        assert_eq!(entries[2].sleep, Some(ms(10)));
    }

    #[tokio::test]
    async fn test_single_attempt_has_no_retry_hooks() {
        let harness = Harness::new();
        let tx_loop = harness
            .builder(Scripted::failing(&harness, 1, || TestError::Transient))
            .attempts(1)
            .backoff_base(ms(10))
            .build()
            .unwrap();

        let error = tx_loop.run("alice".into()).await.unwrap_err();
        assert!(matches!(error, LoopError::Handler(TestError::Transient)));
        assert!(tx_loop.handler().preps().is_empty());
        assert!(harness.sleeper.sleeps().is_empty());
        assert_eq!(
            harness.journal.event_types(),
            vec!["after_transaction_began", "will_first_attempt"]
        );
        assert_eq!(harness.snapshot().retry, 0);
    }

    #[tokio::test]
    async fn test_doomed_transaction_is_aborted() {
        let harness = Harness::new();
        let handler = Scripted {
            doom: true,
            ..Scripted::new(&harness)
        };
        let tx_loop = harness.builder(handler).build().unwrap();

        assert_eq!(tx_loop.run("alice".into()).await.unwrap(), 1);
        assert_eq!(harness.states(), vec![TransactionState::Aborted]);

        let snapshot = harness.snapshot();
        assert_eq!(snapshot.doomed, 1);
        assert_eq!(snapshot.successful, 0);
    }

    #[tokio::test]
    async fn test_vetoed_commit_is_aborted() {
        let harness = Harness::new();
        let handler = Scripted {
            veto: true,
            ..Scripted::new(&harness)
        };
        let tx_loop = harness.builder(handler).build().unwrap();

        assert_eq!(tx_loop.run("alice".into()).await.unwrap(), 1);
        assert_eq!(harness.manager.commits(), 0);
        assert_eq!(harness.states(), vec![TransactionState::Aborted]);
        assert_eq!(harness.snapshot().vetoed, 1);
    }

    #[tokio::test]
    async fn test_side_effect_free_result_is_aborted() {
        let harness = Harness::new();
        let handler = Scripted {
            side_effect_free: Some(true),
            ..Scripted::new(&harness)
        };
        let tx_loop = harness.builder(handler).build().unwrap();

        assert_eq!(tx_loop.run("alice".into()).await.unwrap(), 1);
        assert_eq!(harness.states(), vec![TransactionState::Aborted]);

        let snapshot = harness.snapshot();
        assert_eq!(snapshot.side_effect_free, 1);
        assert_eq!(snapshot.side_effect_free_violation, 0);
        assert_eq!(snapshot.successful, 0);
    }

    #[tokio::test]
    async fn test_handler_overrides_side_effect_free_setting() {
        let harness = Harness::new();
        let tx_loop = harness
            .builder(Scripted::new(&harness))
            .side_effect_free(true)
            .build()
            .unwrap();
        tx_loop.run("alice".into()).await.unwrap();

        let handler = Scripted {
            side_effect_free: Some(false),
            ..Scripted::new(&harness)
        };
        let tx_loop = harness.builder(handler).side_effect_free(true).build().unwrap();
        tx_loop.run("bob".into()).await.unwrap();

        assert_eq!(
            harness.states(),
            vec![TransactionState::Aborted, TransactionState::Committed]
        );
    }

    #[tokio::test]
    async fn test_side_effect_free_violation_is_counted() {
        let harness = Harness::new();
        let handler = Scripted {
            side_effect_free: Some(true),
            resources: vec!["accounts"],
            ..Scripted::new(&harness)
        };
        let tx_loop = harness.builder(handler).build().unwrap();

        assert_eq!(tx_loop.run("alice".into()).await.unwrap(), 1);
        assert_eq!(harness.states(), vec![TransactionState::Aborted]);
        assert_eq!(harness.snapshot().side_effect_free_violation, 1);
    }

    #[tokio::test]
    async fn test_strict_side_effect_free_violation_fails() {
        let harness = Harness::new();
        let handler = Scripted {
            side_effect_free: Some(true),
            resources: vec!["accounts"],
            ..Scripted::new(&harness)
        };
        let tx_loop = harness
            .builder(handler)
            .side_effect_free_strict(true)
            .build()
            .unwrap();

        let error = tx_loop.run("alice".into()).await.unwrap_err();
        assert!(error.is_lifecycle_violation());
        assert!(error.to_string().contains("accounts"));
        assert_eq!(tx_loop.handler().calls(), 1);
        assert_eq!(harness.states(), vec![TransactionState::Aborted]);
        assert_eq!(harness.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_many_resources_are_reported_as_count() {
        let harness = Harness::new();
        let handler = Scripted {
            side_effect_free: Some(true),
            resources: vec!["a", "b", "c", "d", "e", "f"],
            ..Scripted::new(&harness)
        };
        let tx_loop = harness
            .builder(handler)
            .side_effect_free_strict(true)
            .build()
            .unwrap();

        let error = tx_loop.run("alice".into()).await.unwrap_err();
        assert!(error.to_string().contains("(count=6)"), "{}", error);
    }

    #[tokio::test]
    async fn test_commit_conflict_is_retried() {
        let harness = Harness::new();
        harness
            .manager
            .fail_next_commit(TransactionError::Conflict("oid 9".into()));
        let tx_loop = harness.builder(Scripted::new(&harness)).build().unwrap();

        assert_eq!(tx_loop.run("alice".into()).await.unwrap(), 2);
        assert_eq!(
            harness.states(),
            vec![TransactionState::Aborted, TransactionState::Committed]
        );
        assert_eq!(harness.snapshot().retry, 1);
    }

    #[tokio::test]
    async fn test_malformed_commit_fails_without_retry() {
        let harness = Harness::new();
        harness
            .manager
            .fail_next_commit(TransactionError::InvalidArgument("bad shape".into()));
        let tx_loop = harness.builder(Scripted::new(&harness)).build().unwrap();

        let error = tx_loop.run("alice".into()).await.unwrap_err();
        assert!(matches!(error, LoopError::CommitFailed { ref message } if &**message == "bad shape"));
        assert_eq!(tx_loop.handler().calls(), 1);
        assert_eq!(harness.states(), vec![TransactionState::Aborted]);
    }

    #[tokio::test]
    async fn test_abort_failure_wraps_original_error() {
        let harness = Harness::new();
        harness
            .manager
            .fail_next_abort(TransactionError::Storage("disk".into()));
        let tx_loop = harness
            .builder(Scripted::failing(&harness, 1, || TestError::Transient))
            .build()
            .unwrap();

        let error = tx_loop.run("alice".into()).await.unwrap_err();
        match &error {
            LoopError::AbortFailed { abort, original } => {
                assert_eq!(abort, &TransactionError::Storage("disk".into()));
                assert!(matches!(**original, LoopError::Handler(TestError::Transient)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(tx_loop.handler().calls(), 1);
        assert_eq!(harness.manager.current().unwrap_err(), ManagerError::NoTransaction);

        // the manager is usable again
        assert_eq!(tx_loop.run("alice".into()).await.unwrap(), 2);
        assert_eq!(
            harness.states(),
            vec![TransactionState::Active, TransactionState::Committed]
        );
    }

    #[tokio::test]
    async fn test_failed_abort_of_doomed_attempt_releases_manager() {
        let harness = Harness::new();
        harness
            .manager
            .fail_next_abort(TransactionError::Storage("disk".into()));
        let handler = Scripted {
            doom: true,
            ..Scripted::new(&harness)
        };
        let tx_loop = harness.builder(handler).build().unwrap();

        let error = tx_loop.run("alice".into()).await.unwrap_err();
        assert!(matches!(error, LoopError::Transaction(TransactionError::Storage(_))));
        assert_eq!(harness.manager.current().unwrap_err(), ManagerError::NoTransaction);

        assert_eq!(tx_loop.run("alice".into()).await.unwrap(), 2);
        assert_eq!(
            harness.states(),
            vec![TransactionState::Active, TransactionState::Aborted]
        );
    }

    #[tokio::test]
    async fn test_prep_can_abort_and_return() {
        let harness = Harness::new();
        let handler = Scripted {
            prep_result: Some(42),
            ..Scripted::new(&harness)
        };
        let tx_loop = harness.builder(handler).build().unwrap();

        assert_eq!(tx_loop.run("alice".into()).await.unwrap(), 42);
        assert_eq!(tx_loop.handler().calls(), 0);
        assert_eq!(harness.manager.commits(), 0);
        assert_eq!(harness.states(), vec![TransactionState::Aborted]);
        assert_eq!(harness.journal.event_types(), vec!["after_transaction_began"]);

        let snapshot = harness.snapshot();
        assert_eq!(snapshot.successful, 0);
        assert_eq!(snapshot.failed, 0);
    }

    #[tokio::test]
    async fn test_foreign_transaction_is_fatal() {
        let harness = Harness::new();
        let handler = Scripted {
            meddle: Some(Meddle::CommitAndBegin),
            ..Scripted::new(&harness)
        };
        let tx_loop = harness.builder(handler).build().unwrap();

        let error = tx_loop.run("alice".into()).await.unwrap_err();
        assert!(matches!(error, LoopError::ForeignTransaction));
        assert_eq!(tx_loop.handler().calls(), 1);
        assert_eq!(
            harness.states(),
            vec![TransactionState::Committed, TransactionState::Aborted]
        );
        assert_eq!(harness.manager.current().unwrap_err(), ManagerError::NoTransaction);
    }

    #[tokio::test]
    async fn test_ending_transaction_in_handler_is_fatal() {
        let harness = Harness::new();
        let handler = Scripted {
            meddle: Some(Meddle::Commit),
            ..Scripted::new(&harness)
        };
        let tx_loop = harness.builder(handler).build().unwrap();

        let error = tx_loop.run("alice".into()).await.unwrap_err();
        assert!(matches!(error, LoopError::Lifecycle(_)));
        assert_eq!(tx_loop.handler().calls(), 1);
        assert_eq!(harness.states(), vec![TransactionState::Committed]);
    }

    #[tokio::test]
    async fn test_nested_begin_aborts_and_propagates() {
        let harness = Harness::new();
        let handler = Scripted {
            meddle: Some(Meddle::BeginNested),
            ..Scripted::new(&harness)
        };
        let tx_loop = harness.builder(handler).build().unwrap();

        let error = tx_loop.run("alice".into()).await.unwrap_err();
        assert!(matches!(
            error,
            LoopError::Handler(TestError::Manager(ManagerError::AlreadyInTransaction))
        ));
        assert_eq!(tx_loop.handler().calls(), 1);
        assert_eq!(harness.states(), vec![TransactionState::Aborted]);
        assert!(harness.manager.current().is_err());
    }

    #[tokio::test]
    async fn test_missing_transaction_propagates_without_abort() {
        let harness = Harness::new();
        let handler = Scripted {
            meddle: Some(Meddle::AbortThenQuery),
            ..Scripted::new(&harness)
        };
        let tx_loop = harness.builder(handler).build().unwrap();

        let error = tx_loop.run("alice".into()).await.unwrap_err();
        assert_eq!(error.manager_error(), Some(&ManagerError::NoTransaction));
        assert_eq!(tx_loop.handler().calls(), 1);
        // only the handler's own abort
        assert_eq!(harness.manager.aborts(), 1);
    }

    #[tokio::test]
    async fn test_begin_failure_notifies_handler() {
        let harness = Harness::new();
        harness
            .manager
            .fail_next_begin(ManagerError::BeginFailed("synchronizer".into()));
        let tx_loop = harness.builder(Scripted::new(&harness)).build().unwrap();

        let error = tx_loop.run("alice".into()).await.unwrap_err();
        assert!(matches!(error, LoopError::Manager(ManagerError::BeginFailed(_))));

        let handler = tx_loop.handler();
        assert_eq!(handler.calls(), 0);
        assert_eq!(handler.begin_failures.load(Ordering::SeqCst), 1);
        assert_eq!(handler.tear_downs.load(Ordering::SeqCst), 1);
        assert_eq!(harness.snapshot().failed, 1);
    }

    #[tokio::test]
    async fn test_begin_inside_outer_transaction_is_refused() {
        let harness = Harness::new();
        let outer = harness.manager.begin().unwrap();
        let tx_loop = harness.builder(Scripted::new(&harness)).build().unwrap();

        let error = tx_loop.run("alice".into()).await.unwrap_err();
        assert!(matches!(error, LoopError::Manager(ManagerError::AlreadyInTransaction)));
        assert_eq!(tx_loop.handler().begin_failures.load(Ordering::SeqCst), 0);
        assert_eq!(outer.state(), TransactionState::Active);
    }

    #[tokio::test]
    async fn test_explicit_mode_is_restored() {
        let harness = Harness::new();
        let tx_loop = harness
            .builder(Scripted::failing(&harness, 9, || TestError::Fatal))
            .build()
            .unwrap();

        assert!(tx_loop.run("alice".into()).await.is_err());
        assert!(!harness.manager.is_explicit());

        harness.manager.set_explicit(true);
        assert!(tx_loop.run("alice".into()).await.is_err());
        assert!(harness.manager.is_explicit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_aborts_attempt() {
        let harness = Harness::new();
        let stalled = FnHandler::new("stalled", |_: u32| async {
            std::future::pending::<Result<u32, TestError>>().await
        });
        let tx_loop = harness.builder(stalled).build().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), tx_loop.run(1)).await;
        assert!(result.is_err());

        assert_eq!(harness.states(), vec![TransactionState::Aborted]);
        assert!(!harness.manager.is_explicit());
        let snapshot = harness.snapshot();
        assert_eq!(snapshot.flushes, 1);
        assert_eq!(snapshot.failed, 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_aborts_attempt() {
        let harness = Harness::new();
        let handler = Scripted {
            panic: true,
            ..Scripted::new(&harness)
        };
        let tx_loop = Arc::new(harness.builder(handler).build().unwrap());

        let task = {
            let tx_loop = tx_loop.clone();
            tokio::spawn(async move { tx_loop.run("alice".into()).await })
        };
        assert!(task.await.unwrap_err().is_panic());

        assert_eq!(harness.states(), vec![TransactionState::Aborted]);
        assert!(!harness.manager.is_explicit());
        assert_eq!(tx_loop.handler().tear_downs.load(Ordering::SeqCst), 1);
        assert_eq!(harness.snapshot().flushes, 1);
    }

    #[tokio::test]
    async fn test_subscriber_overrides_sleep() {
        let harness = Harness::new();
        let tx_loop = harness
            .builder(Scripted::failing(&harness, 1, || TestError::Transient))
            .backoff_base(ms(10))
            .subscribe(Arc::new(FixedSleep(ms(250))))
            .build()
            .unwrap();

        tx_loop.run("alice".into()).await.unwrap();

        assert_eq!(harness.sleeper.sleeps(), vec![ms(250)]);
        // the journal was subscribed first and saw the computed delay
        assert_eq!(harness.journal.sleeps(), vec![ms(10)]);
    }

    #[tokio::test]
    async fn test_no_backoff_base_means_no_sleep() {
        let harness = Harness::new();
        let tx_loop = harness
            .builder(Scripted::failing(&harness, 2, || TestError::Transient))
            .build()
            .unwrap();

        assert_eq!(tx_loop.run("alice".into()).await.unwrap(), 3);
        assert!(harness.sleeper.sleeps().is_empty());
        assert!(!harness
            .journal
            .event_types()
            .contains(&"will_sleep_between_attempts"));
    }

    #[tokio::test]
    async fn test_note_attached_to_every_attempt() {
        let harness = Harness::new();
        let tx_loop = harness
            .builder(Scripted::failing(&harness, 1, || TestError::Transient))
            .build()
            .unwrap();

        tx_loop.run("alice".into()).await.unwrap();

        let history = harness.manager.history();
        assert_eq!(history.len(), 2);
        for tx in &history {
            assert_eq!(tx.notes(), vec!["credit alice".to_string()]);
        }
        let prepped: Vec<TransactionId> = tx_loop.handler().preps().iter().map(|(_, id)| *id).collect();
        assert_eq!(prepped, history.iter().map(|tx| tx.id()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_rules_apply_when_store_cannot_classify() {
        let harness = Harness::new();
        let conflict = || TestError::Conflict(ConflictError::new("accounts/7"));

        let tx_loop = harness
            .builder(Scripted::failing(&harness, 1, conflict))
            .build()
            .unwrap();
        assert_eq!(tx_loop.run("alice".into()).await.unwrap(), 2);

        harness.manager.set_authoritative(false);
        let tx_loop = harness
            .builder(Scripted::failing(&harness, 1, conflict))
            .build()
            .unwrap();
        let error = tx_loop.run("alice".into()).await.unwrap_err();
        assert!(matches!(error, LoopError::Handler(TestError::Conflict(_))));

        let tx_loop = harness
            .builder(Scripted::failing(&harness, 1, conflict))
            .classifier(RetryClassifier::new().retry_on::<ConflictError>())
            .build()
            .unwrap();
        assert_eq!(tx_loop.run("alice".into()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unsampled_stats_still_flush() {
        let harness = Harness::new();
        let tx_loop = harness
            .builder(Scripted::new(&harness))
            .sample_rate(0.0)
            .build()
            .unwrap();

        tx_loop.run("alice".into()).await.unwrap();

        let snapshot = harness.snapshot();
        assert_eq!(snapshot.successful, 0);
        assert_eq!(snapshot.flushes, 1);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let harness = Harness::new();
        let result = harness.builder(Scripted::new(&harness)).attempts(0).build();
        assert!(matches!(result, Err(ConfigError::ZeroAttempts)));

        let result = harness
            .builder(Scripted::new(&harness))
            .config(LoopConfig::from_retries(0))
            .sample_rate(2.0)
            .build();
        assert!(matches!(result, Err(ConfigError::SampleRate(_))));

        let tx_loop = harness
            .builder(Scripted::new(&harness))
            .config(LoopConfig::from_retries(0))
            .build()
            .unwrap();
        assert_eq!(tx_loop.config().attempts, 1);
        assert!(format!("{:?}", tx_loop).contains("scripted"));
    }

    #[tokio::test]
    async fn test_default_loop_runs_closure() {
        let echo = FnHandler::new("echo", |n: u32| async move { Ok::<_, TestError>(n) });
        let tx_loop = TransactionLoop::new(echo, InMemoryManager::new()).unwrap();

        assert_eq!(tx_loop.run(7).await.unwrap(), 7);
        assert_eq!(tx_loop.manager().commits(), 1);
        assert!(!tx_loop.manager().is_explicit());
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_independent() {
        let first = Harness::new();
        let second = Harness::new();
        let a = first
            .builder(Scripted::failing(&first, 2, || TestError::Transient))
            .build()
            .unwrap();
        let b = second.builder(Scripted::new(&second)).build().unwrap();

        let (ra, rb) = tokio::join!(a.run("alice".into()), b.run("bob".into()));
        assert_eq!(ra.unwrap(), 3);
        assert_eq!(rb.unwrap(), 1);
        assert_eq!(first.manager.begins(), 3);
        assert_eq!(second.manager.begins(), 1);
    }
}
