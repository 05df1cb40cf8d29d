//! Event log over a channel store.

use super::envelope::EventEnvelope;
use crate::channels::{check_channel_name, AppendOutcome, ChannelStore};
use crate::document::Document;
use crate::error::{EngineError, Result};
use crate::subscriptions::{EventHandler, Subscription, SubscriptionConfig, SubscriptionId};
use crate::types::{Checksum, Sequence, StartPolicy, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Event log configuration.
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Appends tried before a publish gives up on conflicts.
    pub max_publish_attempts: u32,

    /// Check payload checksums on every read.
    pub verify_checksums: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_publish_attempts: 16,
            verify_checksums: false,
        }
    }
}

/// Result of a channel integrity audit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub channel: String,
    /// Number of sequence numbers examined.
    pub checked: u64,
    /// Envelopes whose payload no longer matches its checksum.
    pub mismatched: Vec<Sequence>,
    /// Envelopes that could not be decoded, or sit in the wrong slot.
    pub undecodable: Vec<Sequence>,
    /// Numbers below the highest one with nothing stored.
    pub missing: Vec<Sequence>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.mismatched.is_empty() && self.undecodable.is_empty() && self.missing.is_empty()
    }
}

/// Assigns sequence numbers, stores envelopes and opens subscriptions.
pub struct EventLog {
    store: Arc<dyn ChannelStore>,
    config: LogConfig,
    /// Publish path per channel; appends to one channel are serialised.
    publish_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    next_subscription_id: AtomicU64,
}

impl EventLog {
    pub fn new(store: Arc<dyn ChannelStore>, config: LogConfig) -> Self {
        Self {
            store,
            config,
            publish_locks: Mutex::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ChannelStore> {
        &self.store
    }

    fn publish_lock(&self, channel: &str) -> Arc<Mutex<()>> {
        let mut locks = self.publish_locks.lock();
        Arc::clone(locks.entry(channel.to_string()).or_default())
    }

    /// Append `payload` to `channel`, returning its assigned sequence number.
    ///
    /// The number is one past the highest stored number (0 for a fresh
    /// channel). Within this process appends to a channel are serialised;
    /// against other writers the store's keyed append rejects a taken number
    /// and the next one is tried.
    pub fn publish(&self, channel: &str, payload: Document) -> Result<Sequence> {
        check_channel_name(channel)?;
        let payload_bytes = payload.to_bytes()?;
        let checksum = Checksum::of(&payload_bytes);

        let lock = self.publish_lock(channel);
        let _guard = lock.lock();

        let attempts = self.config.max_publish_attempts.max(1);
        for attempt in 1..=attempts {
            let sequence = self
                .store
                .highest_sequence(channel)?
                .map_or(Sequence(0), Sequence::next);
            let timestamp = Timestamp::now();
            let bytes = EventEnvelope::encode_raw(sequence, timestamp, checksum, &payload_bytes)?;

            match self.store.append_at(channel, sequence, timestamp, &bytes)? {
                AppendOutcome::Appended => {
                    tracing::debug!(channel, sequence = sequence.0, "published event");
                    return Ok(sequence);
                }
                AppendOutcome::Conflict => {
                    tracing::debug!(
                        channel,
                        sequence = sequence.0,
                        attempt,
                        "sequence number taken, retrying"
                    );
                }
            }
        }

        Err(EngineError::StoreUnavailable(format!(
            "channel {}: no free sequence number after {} attempts",
            channel, attempts
        )))
    }

    /// Resolve a start policy to the first sequence number to deliver.
    ///
    /// Store failures surface as `StoreUnavailable`.
    pub fn resolve_start(&self, channel: &str, policy: StartPolicy) -> Result<Sequence> {
        check_channel_name(channel)?;
        self.resolve(channel, policy)
            .map_err(EngineError::unavailable)
    }

    fn resolve(&self, channel: &str, policy: StartPolicy) -> Result<Sequence> {
        let store = &self.store;
        let start = match policy {
            StartPolicy::FromStart => store.lowest_sequence(channel)?.unwrap_or(Sequence(0)),
            StartPolicy::FromNow => store
                .highest_sequence(channel)?
                .map_or(Sequence(0), Sequence::next),
            StartPolicy::FromMostRecent => {
                store.highest_sequence(channel)?.unwrap_or(Sequence(0))
            }
            StartPolicy::FromNumber(n) => Sequence(n.max(0) as u64),
            StartPolicy::FromInstant(instant) => {
                // Timestamps need not be monotonic across publishers.
                let first = store
                    .scan_timestamps(channel)?
                    .into_iter()
                    .filter(|(_, timestamp)| *timestamp >= instant)
                    .map(|(sequence, _)| sequence)
                    .min();
                match first {
                    Some(sequence) => sequence,
                    None => return self.resolve(channel, StartPolicy::FromNow),
                }
            }
        };
        Ok(start)
    }

    /// Read one event.
    pub fn read(&self, channel: &str, sequence: Sequence) -> Result<Option<EventEnvelope>> {
        let Some(bytes) = self.store.read(channel, sequence)? else {
            return Ok(None);
        };
        let envelope = if self.config.verify_checksums {
            EventEnvelope::decode_verified(&bytes)?
        } else {
            EventEnvelope::decode(&bytes)?
        };
        Ok(Some(envelope))
    }

    /// Highest assigned sequence number, `None` for an empty channel.
    pub fn highest_sequence(&self, channel: &str) -> Result<Option<Sequence>> {
        self.store.highest_sequence(channel)
    }

    /// Names of channels holding at least one event.
    pub fn channels(&self) -> Result<Vec<String>> {
        self.store.channels()
    }

    /// Start delivering `channel` to `handler` from the resolved policy.
    ///
    /// No subscription is created if the start point cannot be resolved.
    pub fn subscribe(
        &self,
        channel: &str,
        policy: StartPolicy,
        handler: impl EventHandler,
        config: SubscriptionConfig,
    ) -> Result<Subscription> {
        self.subscribe_boxed(channel, policy, Box::new(handler), config)
    }

    pub(crate) fn subscribe_boxed(
        &self,
        channel: &str,
        policy: StartPolicy,
        handler: Box<dyn EventHandler>,
        config: SubscriptionConfig,
    ) -> Result<Subscription> {
        let start = self.resolve_start(channel, policy)?;
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::SeqCst));
        tracing::debug!(channel, ?policy, start = start.0, "resolved subscription start");

        Subscription::start(
            id,
            Arc::clone(&self.store),
            channel,
            start,
            handler,
            config,
            self.config.verify_checksums,
        )
    }

    /// Check every stored envelope of `channel` against its checksum.
    pub fn verify_channel(&self, channel: &str) -> Result<VerifyReport> {
        check_channel_name(channel)?;
        let mut report = VerifyReport {
            channel: channel.to_string(),
            ..Default::default()
        };

        let Some(highest) = self.store.highest_sequence(channel)? else {
            return Ok(report);
        };
        let lowest = self.store.lowest_sequence(channel)?.unwrap_or(Sequence(0));

        for n in lowest.0..=highest.0 {
            let sequence = Sequence(n);
            report.checked += 1;

            let Some(bytes) = self.store.read(channel, sequence)? else {
                report.missing.push(sequence);
                continue;
            };
            match EventEnvelope::decode_verified(&bytes) {
                Ok(envelope) if envelope.sequence == sequence => {}
                Ok(_) => report.undecodable.push(sequence),
                Err(EngineError::ChecksumMismatch { .. }) => report.mismatched.push(sequence),
                Err(_) => report.undecodable.push(sequence),
            }
        }

        if report.is_clean() {
            tracing::info!(channel, checked = report.checked, "channel verified");
        } else {
            tracing::warn!(
                channel,
                checked = report.checked,
                mismatched = report.mismatched.len(),
                undecodable = report.undecodable.len(),
                missing = report.missing.len(),
                "channel failed verification"
            );
        }
        Ok(report)
    }
}
