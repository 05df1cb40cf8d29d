//! In-memory channel store with push notification.

use super::{check_channel_name, AppendOutcome, ChannelStore};
use crate::error::{EngineError, Result};
use crate::types::{Sequence, Timestamp};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One stored envelope.
struct Entry {
    timestamp: Timestamp,
    bytes: Arc<Vec<u8>>,
}

/// Channel store kept entirely in memory.
///
/// Appends wake every `wait_for` caller, so readers never poll.
#[derive(Default)]
pub struct MemoryChannelStore {
    channels: Mutex<HashMap<String, Vec<Entry>>>,
    appended: Condvar,
}

impl MemoryChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events stored in `channel`.
    pub fn len(&self, channel: &str) -> usize {
        self.channels.lock().get(channel).map_or(0, Vec::len)
    }
}

impl ChannelStore for MemoryChannelStore {
    fn append_at(
        &self,
        channel: &str,
        sequence: Sequence,
        timestamp: Timestamp,
        bytes: &[u8],
    ) -> Result<AppendOutcome> {
        check_channel_name(channel)?;
        let mut channels = self.channels.lock();
        let entries = channels.entry(channel.to_string()).or_default();
        let next = Sequence(entries.len() as u64);

        if sequence < next {
            return Ok(AppendOutcome::Conflict);
        }
        if sequence > next {
            return Err(EngineError::InvalidSequence(sequence, next));
        }

        entries.push(Entry {
            timestamp,
            bytes: Arc::new(bytes.to_vec()),
        });
        drop(channels);
        self.appended.notify_all();

        Ok(AppendOutcome::Appended)
    }

    fn read(&self, channel: &str, sequence: Sequence) -> Result<Option<Vec<u8>>> {
        let channels = self.channels.lock();
        Ok(channels
            .get(channel)
            .and_then(|entries| entries.get(sequence.0 as usize))
            .map(|entry| entry.bytes.as_ref().clone()))
    }

    fn highest_sequence(&self, channel: &str) -> Result<Option<Sequence>> {
        let len = self.len(channel);
        Ok(len.checked_sub(1).map(|last| Sequence(last as u64)))
    }

    fn scan_timestamps(&self, channel: &str) -> Result<Vec<(Sequence, Timestamp)>> {
        let channels = self.channels.lock();
        Ok(channels
            .get(channel)
            .map(|entries| {
                entries
                    .iter()
                    .enumerate()
                    .map(|(i, entry)| (Sequence(i as u64), entry.timestamp))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn channels(&self) -> Result<Vec<String>> {
        let mut names: Vec<_> = self
            .channels
            .lock()
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    fn wait_for(&self, channel: &str, sequence: Sequence, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut channels = self.channels.lock();
        loop {
            let len = channels.get(channel).map_or(0, Vec::len) as u64;
            if sequence.0 < len {
                return Ok(true);
            }
            if self.appended.wait_until(&mut channels, deadline).timed_out() {
                let len = channels.get(channel).map_or(0, Vec::len) as u64;
                return Ok(sequence.0 < len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_append_is_keyed_and_gap_free() {
        let store = MemoryChannelStore::new();

        assert_eq!(
            store.append_at("orders", Sequence(0), Timestamp(1), b"a").unwrap(),
            AppendOutcome::Appended
        );
        assert_eq!(
            store.append_at("orders", Sequence(0), Timestamp(2), b"b").unwrap(),
            AppendOutcome::Conflict
        );
        assert!(matches!(
            store.append_at("orders", Sequence(5), Timestamp(3), b"c"),
            Err(EngineError::InvalidSequence(Sequence(5), Sequence(1)))
        ));

        assert_eq!(store.read("orders", Sequence(0)).unwrap(), Some(b"a".to_vec()));
        assert_eq!(store.highest_sequence("orders").unwrap(), Some(Sequence(0)));
        assert_eq!(store.highest_sequence("empty").unwrap(), None);
    }

    #[test]
    fn test_scan_timestamps_in_order() {
        let store = MemoryChannelStore::new();
        for i in 0..3 {
            store
                .append_at("c", Sequence(i), Timestamp(100 + i as i64), b"x")
                .unwrap();
        }

        let scanned = store.scan_timestamps("c").unwrap();
        assert_eq!(
            scanned,
            vec![
                (Sequence(0), Timestamp(100)),
                (Sequence(1), Timestamp(101)),
                (Sequence(2), Timestamp(102)),
            ]
        );
        assert_eq!(store.channels().unwrap(), vec!["c".to_string()]);
    }

    #[test]
    fn test_wait_for_wakes_on_append() {
        let store = Arc::new(MemoryChannelStore::new());
        let writer = Arc::clone(&store);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer
                .append_at("live", Sequence(0), Timestamp::now(), b"hello")
                .unwrap();
        });

        assert!(store
            .wait_for("live", Sequence(0), Duration::from_secs(5))
            .unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_for_times_out() {
        let store = MemoryChannelStore::new();
        let started = Instant::now();
        assert!(!store
            .wait_for("quiet", Sequence(0), Duration::from_millis(30))
            .unwrap());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_empty_channel_name_rejected() {
        let store = MemoryChannelStore::new();
        assert!(matches!(
            store.append_at("", Sequence(0), Timestamp(0), b"x"),
            Err(EngineError::InvalidOperation(_))
        ));
    }
}
