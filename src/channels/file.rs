//! Append-only file channel store.
//!
//! Each channel lives in its own log file under `<root>/channels/`, named by
//! the hex encoding of the channel name. Frames are self-checking:
//!
//! ```text
//! magic(4) version(1) sequence(8) timestamp(8) len(4) payload(len) crc32(4)
//! ```
//!
//! Opening a channel scans its file once to rebuild the sequence -> offset
//! index. A torn frame at the tail (crash mid-append) is truncated away.

use super::{check_channel_name, AppendOutcome, ChannelStore};
use crate::error::{EngineError, Result};
use crate::lock::acquire_lock;
use crate::types::{Sequence, Timestamp};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes for channel frames.
const FRAME_MAGIC: &[u8; 4] = b"EVL\0";

/// Current frame format version.
const FRAME_VERSION: u8 = 1;

/// Fixed frame overhead: magic + version + sequence + timestamp + len + crc.
const FRAME_OVERHEAD: u64 = 4 + 1 + 8 + 8 + 4 + 4;

/// Frames larger than this are treated as corruption.
const MAX_FRAME_PAYLOAD: usize = 64 * 1024 * 1024;

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"EVC\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// A decoded frame.
struct Frame {
    sequence: Sequence,
    timestamp: Timestamp,
    payload: Vec<u8>,
}

/// Open file and index of one channel.
struct ChannelFile {
    file: File,
    /// Offset of each frame, indexed by sequence number.
    offsets: Vec<u64>,
    /// Timestamp of each frame, indexed by sequence number.
    timestamps: Vec<Timestamp>,
    /// Current file size (for appending).
    size: u64,
    /// Number of writes since last sync.
    writes_since_sync: u64,
}

impl ChannelFile {
    /// Write `frame` at the end of the file and index it.
    ///
    /// The frame becomes readable only once it is written and, when a sync
    /// is due, synced. On failure the file is cut back to its previous size
    /// and the index is untouched.
    fn append_frame<S>(
        &mut self,
        timestamp: Timestamp,
        frame: &[u8],
        sync_interval: u64,
        sync: S,
    ) -> Result<()>
    where
        S: FnOnce(&File) -> io::Result<()>,
    {
        let offset = self.size;
        let sync_due = self.writes_since_sync + 1 >= sync_interval;

        if let Err(e) = write_frame(&mut self.file, offset, frame, sync_due, sync) {
            if let Err(truncate) = self.file.set_len(offset) {
                tracing::warn!(offset, error = %truncate, "could not drop failed channel frame");
            }
            return Err(e.into());
        }

        self.size = offset + frame.len() as u64;
        self.offsets.push(offset);
        self.timestamps.push(timestamp);
        self.writes_since_sync = if sync_due { 0 } else { self.writes_since_sync + 1 };
        Ok(())
    }
}

fn write_frame<S>(file: &mut File, offset: u64, frame: &[u8], sync_due: bool, sync: S) -> io::Result<()>
where
    S: FnOnce(&File) -> io::Result<()>,
{
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(frame)?;
    if sync_due {
        sync(&*file)?;
    }
    Ok(())
}

/// Channel store backed by one append-only file per channel.
pub struct FileChannelStore {
    root: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Opened channels by name.
    channels: RwLock<HashMap<String, Arc<Mutex<ChannelFile>>>>,

    /// Sync every N writes (1 = every write).
    sync_interval: u64,
}

impl FileChannelStore {
    /// Default sync interval - fsync every append.
    pub const DEFAULT_SYNC_INTERVAL: u64 = 1;

    /// Open or create a store at `root`, syncing every append.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(root, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a store with a custom sync interval.
    /// - sync_interval = 0 or 1: sync every append (safest, slowest)
    /// - sync_interval = 100: sync every 100 appends
    pub fn open_with_sync_interval(root: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("channels"))?;

        let manifest = root.join("MANIFEST");
        if manifest.exists() {
            verify_manifest(&manifest)?;
        } else {
            write_manifest(&manifest)?;
        }

        let lock_file = acquire_lock(&root)?;

        tracing::debug!(root = %root.display(), sync_interval, "opened file channel store");

        Ok(Self {
            root,
            _lock_file: lock_file,
            channels: RwLock::new(HashMap::new()),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Root directory of the store.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Force sync all open channel files to disk.
    pub fn sync(&self) -> Result<()> {
        let channels: Vec<_> = self.channels.read().values().cloned().collect();
        for channel in channels {
            let mut channel = channel.lock();
            channel.file.sync_all()?;
            channel.writes_since_sync = 0;
        }
        Ok(())
    }

    fn channel_path(&self, channel: &str) -> PathBuf {
        self.root
            .join("channels")
            .join(format!("{}.log", hex::encode(channel.as_bytes())))
    }

    /// Look up an opened channel, opening its file on first use.
    ///
    /// With `create == false` a channel without a file yields `None`.
    fn channel(&self, channel: &str, create: bool) -> Result<Option<Arc<Mutex<ChannelFile>>>> {
        if let Some(existing) = self.channels.read().get(channel) {
            return Ok(Some(Arc::clone(existing)));
        }

        let mut channels = self.channels.write();
        if let Some(existing) = channels.get(channel) {
            return Ok(Some(Arc::clone(existing)));
        }

        let path = self.channel_path(channel);
        if !create && !path.exists() {
            return Ok(None);
        }

        let opened = Arc::new(Mutex::new(open_channel_file(&path)?));
        channels.insert(channel.to_string(), Arc::clone(&opened));
        Ok(Some(opened))
    }
}

impl ChannelStore for FileChannelStore {
    fn append_at(
        &self,
        channel: &str,
        sequence: Sequence,
        timestamp: Timestamp,
        bytes: &[u8],
    ) -> Result<AppendOutcome> {
        check_channel_name(channel)?;
        if bytes.len() > MAX_FRAME_PAYLOAD {
            return Err(EngineError::InvalidOperation(format!(
                "envelope of {} bytes exceeds the {} byte frame limit",
                bytes.len(),
                MAX_FRAME_PAYLOAD
            )));
        }

        let Some(handle) = self.channel(channel, true)? else {
            return Err(EngineError::StoreUnavailable(format!(
                "channel {channel} could not be opened"
            )));
        };
        let mut state = handle.lock();

        let next = Sequence(state.offsets.len() as u64);
        if sequence < next {
            return Ok(AppendOutcome::Conflict);
        }
        if sequence > next {
            return Err(EngineError::InvalidSequence(sequence, next));
        }

        let frame = encode_frame(sequence, timestamp, bytes);
        state.append_frame(timestamp, &frame, self.sync_interval, File::sync_data)?;

        Ok(AppendOutcome::Appended)
    }

    fn read(&self, channel: &str, sequence: Sequence) -> Result<Option<Vec<u8>>> {
        let Some(handle) = self.channel(channel, false)? else {
            return Ok(None);
        };
        let mut state = handle.lock();

        let Some(&offset) = state.offsets.get(sequence.0 as usize) else {
            return Ok(None);
        };

        state.file.seek(SeekFrom::Start(offset))?;
        let frame = read_frame(&mut state.file)?;
        if frame.sequence != sequence {
            return Err(EngineError::Corruption(format!(
                "channel {channel}: frame at offset {offset} holds {:?}, expected {:?}",
                frame.sequence, sequence
            )));
        }

        Ok(Some(frame.payload))
    }

    fn highest_sequence(&self, channel: &str) -> Result<Option<Sequence>> {
        let Some(handle) = self.channel(channel, false)? else {
            return Ok(None);
        };
        let len = handle.lock().offsets.len();
        Ok(len.checked_sub(1).map(|last| Sequence(last as u64)))
    }

    fn scan_timestamps(&self, channel: &str) -> Result<Vec<(Sequence, Timestamp)>> {
        let Some(handle) = self.channel(channel, false)? else {
            return Ok(Vec::new());
        };
        let state = handle.lock();
        Ok(state
            .timestamps
            .iter()
            .enumerate()
            .map(|(i, ts)| (Sequence(i as u64), *ts))
            .collect())
    }

    fn channels(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(self.root.join("channels"))? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            if entry.metadata()?.len() == 0 {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match hex::decode(stem).ok().and_then(|raw| String::from_utf8(raw).ok()) {
                Some(name) => names.push(name),
                None => tracing::warn!(path = %path.display(), "skipping unrecognised channel file"),
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Open a channel file and rebuild its index.
fn open_channel_file(path: &Path) -> Result<ChannelFile> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)?;

    let file_size = file.metadata()?.len();
    let mut offsets = Vec::new();
    let mut timestamps = Vec::new();

    let mut reader = BufReader::new(file.try_clone()?);
    reader.seek(SeekFrom::Start(0))?;
    let mut offset = 0u64;

    while offset < file_size {
        match read_frame(&mut reader) {
            Ok(frame) => {
                let expected = Sequence(offsets.len() as u64);
                if frame.sequence != expected {
                    return Err(EngineError::Corruption(format!(
                        "{}: frame at offset {offset} holds {:?}, expected {:?}",
                        path.display(),
                        frame.sequence,
                        expected
                    )));
                }
                offsets.push(offset);
                timestamps.push(frame.timestamp);
                offset += FRAME_OVERHEAD + frame.payload.len() as u64;
            }
            Err(e) if is_torn_tail(&e) => {
                tracing::warn!(
                    path = %path.display(),
                    offset,
                    dropped_bytes = file_size - offset,
                    "truncating torn frame at end of channel log"
                );
                file.set_len(offset)?;
                file.sync_all()?;
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(ChannelFile {
        file,
        offsets,
        timestamps,
        size: offset,
        writes_since_sync: 0,
    })
}

/// Whether a scan error means the last frame was only partially written.
fn is_torn_tail(error: &EngineError) -> bool {
    matches!(error, EngineError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
}

fn encode_frame(sequence: Sequence, timestamp: Timestamp, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_OVERHEAD as usize + payload.len());
    frame.extend_from_slice(FRAME_MAGIC);
    frame.push(FRAME_VERSION);
    frame.extend_from_slice(&sequence.0.to_le_bytes());
    frame.extend_from_slice(&timestamp.0.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    frame
}

fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
    // Magic
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != FRAME_MAGIC {
        return Err(EngineError::InvalidFormat("Invalid channel frame magic".into()));
    }

    // Version
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;
    if version[0] != FRAME_VERSION {
        return Err(EngineError::InvalidFormat(format!(
            "Unsupported channel frame version: {}",
            version[0]
        )));
    }

    // Sequence
    let mut seq_bytes = [0u8; 8];
    reader.read_exact(&mut seq_bytes)?;
    let sequence = Sequence(u64::from_le_bytes(seq_bytes));

    // Timestamp
    let mut ts_bytes = [0u8; 8];
    reader.read_exact(&mut ts_bytes)?;
    let timestamp = Timestamp(i64::from_le_bytes(ts_bytes));

    // Payload
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_PAYLOAD {
        return Err(EngineError::Corruption(format!(
            "channel frame of {len} bytes exceeds limit"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    // Checksum
    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = crc32fast::hash(&payload);
    if stored != computed {
        return Err(EngineError::ChecksumMismatch {
            sequence,
            expected: u64::from(stored),
            got: u64::from(computed),
        });
    }

    Ok(Frame {
        sequence,
        timestamp,
        payload,
    })
}

fn write_manifest(path: &Path) -> Result<()> {
    let mut file = File::create(path)?;
    file.write_all(STORE_MAGIC)?;
    file.write_all(&[STORE_VERSION])?;
    file.sync_all()?;
    Ok(())
}

fn verify_manifest(path: &Path) -> Result<()> {
    let mut file = File::open(path)?;

    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != STORE_MAGIC {
        return Err(EngineError::InvalidFormat("Invalid channel store magic".into()));
    }

    let mut version = [0u8; 1];
    file.read_exact(&mut version)?;
    if version[0] != STORE_VERSION {
        return Err(EngineError::InvalidFormat(format!(
            "Unsupported channel store version: {}",
            version[0]
        )));
    }

    Ok(())
}
