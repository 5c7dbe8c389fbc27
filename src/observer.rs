//! Event subscribers and the publisher that drives them

use super::LoopEvent;
use std::sync::Arc;

/// Receives loop events.
///
/// Called synchronously on the loop's task. Subscribers have no way to fail
/// the loop; one that panics unwinds through it, and the attempt in progress
/// is aborted on the way out.
pub trait EventSubscriber: Send + Sync + 'static {
    /// Handle `event`; `WillSleepBetweenAttempts` may have its sleep changed
    fn on_event(&self, event: &mut LoopEvent);
}

/// Ordered list of subscribers
#[derive(Clone, Default)]
pub struct EventPublisher {
    subscribers: Vec<Arc<dyn EventSubscriber>>,
}

impl EventPublisher {
    /// Publisher with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a subscriber; it runs after those already registered
    pub fn subscribe(&mut self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.push(subscriber);
    }

    /// Number of subscribers
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Are there no subscribers?
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Deliver `event` to every subscriber, in registration order
    pub fn notify(&self, event: &mut LoopEvent) {
        for subscriber in &self.subscribers {
            subscriber.on_event(event);
        }
    }
}

/// Tracing-based subscriber
pub struct TracingSubscriber;

impl EventSubscriber for TracingSubscriber {
    fn on_event(&self, event: &mut LoopEvent) {
        let handler = &event.invocation().handler;
        match &*event {
            LoopEvent::AfterTransactionBegan { transaction, .. } => {
                tracing::debug!(handler = %handler, transaction = %transaction, "Transaction began");
            }
            LoopEvent::WillFirstAttempt { transaction, .. } => {
                tracing::debug!(handler = %handler, transaction = %transaction, "First attempt");
            }
            LoopEvent::WillRetryAttempt { transaction, attempt, .. } => {
                tracing::info!(handler = %handler, transaction = %transaction, attempt = *attempt, "Retrying");
            }
            LoopEvent::WillLastAttempt { transaction, attempt, .. } => {
                tracing::info!(handler = %handler, transaction = %transaction, attempt = *attempt, "Last attempt");
            }
            LoopEvent::WillSleepBetweenAttempts { sleep, .. } => {
                tracing::info!(handler = %handler, sleep_ms = sleep.as_millis() as u64, "Sleeping before retry");
            }
        }
    }
}
