//! Subscription types.

use crate::error::Result;
use crate::log::EventEnvelope;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Configuration for a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Envelopes buffered between reader and dispatcher.
    /// Default: 16
    pub queue_capacity: usize,

    /// First wait for an event that is not yet available (milliseconds).
    /// Default: 5
    pub poll_interval_ms: u64,

    /// Cap for the exponential wait backoff (milliseconds).
    /// Default: 100
    pub max_poll_interval_ms: u64,

    /// Consecutive transient read failures tolerated before giving up.
    /// Default: 8
    pub max_transient_retries: u32,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            poll_interval_ms: 5,
            max_poll_interval_ms: 100,
            max_transient_retries: 8,
        }
    }
}

impl SubscriptionConfig {
    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub(crate) fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms.max(self.poll_interval_ms).max(1))
    }
}

/// Lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Threads spawned, delivery loop not yet running.
    Starting,
    /// Delivering events.
    Live,
    /// Closed explicitly or by a fatal error. Terminal.
    Closed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Consumer of delivered events.
///
/// Invoked on the subscription's dispatcher thread, one event at a time in
/// sequence order. Returning an error closes the subscription and records
/// the error as its failure.
pub trait EventHandler: Send + 'static {
    fn handle(&mut self, event: EventEnvelope) -> Result<()>;
}

impl<F> EventHandler for F
where
    F: FnMut(EventEnvelope) -> Result<()> + Send + 'static,
{
    fn handle(&mut self, event: EventEnvelope) -> Result<()> {
        self(event)
    }
}
