//! Durable ordered storage for channel events.
//!
//! A channel store keeps the encoded envelopes of every channel, addressed
//! by 0-based sequence number. It is the collaborator the event log writes
//! through and subscriptions read from:
//!
//! - `append_at` is a create-if-absent write keyed by sequence number, so
//!   concurrent publishers can never share or skip a number
//! - `wait_for` blocks until a sequence number is readable, which lets
//!   backends with change notification avoid polling
//!
//! Two backends ship with the crate: [`MemoryChannelStore`] and the
//! append-only file layout in [`FileChannelStore`].

mod file;
mod memory;

pub use file::FileChannelStore;
pub use memory::MemoryChannelStore;

use crate::error::Result;
use crate::types::{Sequence, Timestamp};
use std::time::{Duration, Instant};

/// Outcome of a keyed append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The envelope was stored under the requested number.
    Appended,
    /// Another writer already holds the requested number.
    Conflict,
}

/// First wait used by the default polling `wait_for`.
const POLL_START: Duration = Duration::from_millis(1);

/// Longest single sleep of the default polling `wait_for`.
const POLL_CAP: Duration = Duration::from_millis(50);

/// Storage backend for channel events.
pub trait ChannelStore: Send + Sync {
    /// Store `bytes` under `sequence` if that number is the next free one.
    ///
    /// Returns `Conflict` if the number is already taken. A number beyond
    /// the next free one is rejected with `InvalidSequence`.
    fn append_at(
        &self,
        channel: &str,
        sequence: Sequence,
        timestamp: Timestamp,
        bytes: &[u8],
    ) -> Result<AppendOutcome>;

    /// Read the envelope stored under `sequence`, if any.
    fn read(&self, channel: &str, sequence: Sequence) -> Result<Option<Vec<u8>>>;

    /// Highest stored sequence number (`None` for an empty channel).
    fn highest_sequence(&self, channel: &str) -> Result<Option<Sequence>>;

    /// Lowest stored sequence number (`None` for an empty channel).
    fn lowest_sequence(&self, channel: &str) -> Result<Option<Sequence>> {
        Ok(self.highest_sequence(channel)?.map(|_| Sequence(0)))
    }

    /// Every stored (sequence, timestamp) pair in sequence order.
    fn scan_timestamps(&self, channel: &str) -> Result<Vec<(Sequence, Timestamp)>>;

    /// Names of all channels holding at least one event.
    fn channels(&self) -> Result<Vec<String>>;

    /// Block until `sequence` is readable or `timeout` elapses.
    ///
    /// Returns whether the event is available. The default polls
    /// `highest_sequence` with exponential backoff.
    fn wait_for(&self, channel: &str, sequence: Sequence, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut pause = POLL_START;
        loop {
            if self
                .highest_sequence(channel)?
                .is_some_and(|highest| highest >= sequence)
            {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(pause.min(deadline - now));
            pause = (pause * 2).min(POLL_CAP);
        }
    }
}

/// Validate a channel name before it reaches a backend.
pub(crate) fn check_channel_name(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(crate::error::EngineError::InvalidOperation(
            "channel name must not be empty".into(),
        ));
    }
    Ok(())
}
