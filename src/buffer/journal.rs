//! Disk tier: an append-only journal of task frames split into partition files.
//!
//! Every mutation is a frame appended to the active partition and synced
//! before the call returns:
//!
//! ```text
//! kind u8 | flags u8 | id u64 LE | len u32 LE | crc u32 LE | payload[len]
//! ```
//!
//! `Task` frames carry a serialized task, `Update` frames replace the task
//! with the same id (used when a retry bumps its attempt count) and `Ack`
//! frames remove it. On open, partitions are replayed in order; a frame with
//! a short read or a bad checksum marks a torn tail and is cut off.
//! Partitions at the head of the journal are deleted as soon as none of their
//! frames holds the latest version of a pending task.

use super::queue::{QueueStats, TaskHandle};
use crate::domain::{DataSubmissionTask, DomainError, HandlerKey};
use bytes::{Buf, BufMut, BytesMut};
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::Crc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

pub const FRAME_HEADER_LEN: usize = 18;
const CHECKSUMMED_HEADER_LEN: usize = 14;
const PARTITION_EXTENSION: &str = "journal";
const FLAG_GZIP: u8 = 0b0000_0001;

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt frame in {path} at offset {offset}")]
    Corrupt { path: PathBuf, offset: u64 },
    #[error("Task error: {0}")]
    Task(#[from] DomainError),
}

#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub directory: PathBuf,
    pub partition_size: u64,
    pub compression: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/var/spool/telemetry-proxy/buffer"),
            partition_size: 128 * 1024 * 1024,
            compression: true,
        }
    }
}

impl JournalConfig {
    /// Directory holding the partitions of one shard.
    pub fn queue_dir(&self, key: &HandlerKey, shard: usize) -> PathBuf {
        let handle: String = key
            .handle()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.directory
            .join(key.entity_type().as_str())
            .join(handle)
            .join(format!("shard-{shard}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Task = 1,
    Ack = 2,
    Update = 3,
}

impl FrameKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameKind::Task),
            2 => Some(FrameKind::Ack),
            3 => Some(FrameKind::Update),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Location {
    partition: u64,
    payload_offset: u64,
    len: u32,
    flags: u8,
}

#[derive(Debug, Clone)]
struct Entry {
    location: Location,
    items: usize,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug)]
struct RawFrame {
    kind: FrameKind,
    flags: u8,
    id: u64,
    payload_offset: usize,
    len: u32,
}

#[derive(Debug)]
struct Scan {
    frames: Vec<RawFrame>,
    valid_len: usize,
    torn: bool,
}

#[derive(Debug)]
struct ActivePartition {
    seq: u64,
    file: File,
    size: u64,
}

#[derive(Debug)]
struct JournalState {
    active: Option<ActivePartition>,
    next_partition: u64,
    next_id: u64,
    partitions: BTreeSet<u64>,
    live: BTreeMap<u64, usize>,
    pending: BTreeMap<u64, Entry>,
}

/// Durable task queue of one shard. All writes go through a single mutex, so
/// the journal has exactly one writer per process.
#[derive(Debug)]
pub struct DiskTaskQueue {
    dir: PathBuf,
    partition_size: u64,
    compression: bool,
    state: Mutex<JournalState>,
}

impl DiskTaskQueue {
    pub async fn open(dir: impl AsRef<Path>, config: &JournalConfig) -> Result<Self, JournalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        let sequences = list_partitions(&dir).await?;
        let mut state = JournalState {
            active: None,
            next_partition: sequences.last().map(|s| s + 1).unwrap_or(0),
            next_id: 0,
            partitions: BTreeSet::new(),
            live: BTreeMap::new(),
            pending: BTreeMap::new(),
        };
        let mut latest: BTreeMap<u64, u64> = BTreeMap::new();
        let mut last_valid_len = 0u64;

        for (index, &seq) in sequences.iter().enumerate() {
            let path = partition_path(&dir, seq);
            let data = fs::read(&path).await?;
            let scan = scan_frames(&data);
            let is_last = index + 1 == sequences.len();

            if scan.torn {
                if is_last {
                    tracing::warn!(
                        path = %path.display(),
                        valid_len = scan.valid_len,
                        file_len = data.len(),
                        "Truncating torn journal tail"
                    );
                    let file = OpenOptions::new().write(true).open(&path).await?;
                    file.set_len(scan.valid_len as u64).await?;
                    file.sync_all().await?;
                } else {
                    tracing::error!(
                        path = %path.display(),
                        offset = scan.valid_len,
                        "Corrupt frame inside journal partition, skipping remainder"
                    );
                }
            }

            for frame in &scan.frames {
                state.next_id = state.next_id.max(frame.id + 1);
                match frame.kind {
                    FrameKind::Task | FrameKind::Update => {
                        let end = frame.payload_offset + frame.len as usize;
                        let task = decode_payload(&data[frame.payload_offset..end], frame.flags)?;
                        if let Some(previous) = latest.insert(frame.id, seq) {
                            decrement(&mut state.live, previous);
                        }
                        *state.live.entry(seq).or_default() += 1;
                        state.pending.insert(
                            frame.id,
                            Entry {
                                location: Location {
                                    partition: seq,
                                    payload_offset: frame.payload_offset as u64,
                                    len: frame.len,
                                    flags: frame.flags,
                                },
                                items: task.len(),
                                enqueued_at: task.enqueued_at(),
                            },
                        );
                    }
                    FrameKind::Ack => {
                        if let Some(previous) = latest.remove(&frame.id) {
                            decrement(&mut state.live, previous);
                        }
                        state.pending.remove(&frame.id);
                    }
                }
            }

            state.partitions.insert(seq);
            if is_last {
                last_valid_len = scan.valid_len as u64;
            }
        }

        if let Some(&seq) = sequences.last() {
            let file = OpenOptions::new()
                .append(true)
                .open(partition_path(&dir, seq))
                .await?;
            state.active = Some(ActivePartition {
                seq,
                file,
                size: last_valid_len,
            });
        }

        let queue = Self {
            dir,
            partition_size: config.partition_size.max(FRAME_HEADER_LEN as u64),
            compression: config.compression,
            state: Mutex::new(state),
        };

        {
            let mut state = queue.state.lock().await;
            queue.compact(&mut state).await?;
            if !state.pending.is_empty() {
                tracing::info!(
                    dir = %queue.dir.display(),
                    tasks = state.pending.len(),
                    "Recovered pending tasks from journal"
                );
            }
        }

        Ok(queue)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn append(&self, task: DataSubmissionTask) -> Result<TaskHandle, JournalError> {
        let payload = task.to_bytes()?;
        let mut state = self.state.lock().await;
        let id = state.next_id;

        let location = self
            .write_frame(&mut state, FrameKind::Task, id, &payload)
            .await?;
        state.next_id += 1;
        *state.live.entry(location.partition).or_default() += 1;
        state.pending.insert(
            id,
            Entry {
                location,
                items: task.len(),
                enqueued_at: task.enqueued_at(),
            },
        );

        Ok(TaskHandle(id))
    }

    pub async fn size(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn peek(&self) -> Result<Option<(TaskHandle, DataSubmissionTask)>, JournalError> {
        let state = self.state.lock().await;
        let Some((&id, entry)) = state.pending.first_key_value() else {
            return Ok(None);
        };
        let task = self.read_task(entry.location).await?;
        Ok(Some((TaskHandle(id), task)))
    }

    pub async fn iterate(&self) -> Result<Vec<(TaskHandle, DataSubmissionTask)>, JournalError> {
        let state = self.state.lock().await;
        let mut tasks = Vec::with_capacity(state.pending.len());
        for (&id, entry) in &state.pending {
            tasks.push((TaskHandle(id), self.read_task(entry.location).await?));
        }
        Ok(tasks)
    }

    /// Acknowledges a task. Unknown handles are ignored.
    pub async fn remove(&self, handle: TaskHandle) -> Result<(), JournalError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.pending.get(&handle.0).cloned() else {
            return Ok(());
        };

        self.write_frame(&mut state, FrameKind::Ack, handle.0, &[])
            .await?;
        state.pending.remove(&handle.0);
        decrement(&mut state.live, entry.location.partition);
        self.compact(&mut state).await
    }

    /// Replaces a pending task in place; returns false for unknown handles.
    pub async fn requeue(
        &self,
        handle: TaskHandle,
        task: DataSubmissionTask,
    ) -> Result<bool, JournalError> {
        let payload = task.to_bytes()?;
        let mut state = self.state.lock().await;
        let Some(previous) = state.pending.get(&handle.0).map(|e| e.location.partition) else {
            return Ok(false);
        };

        let location = self
            .write_frame(&mut state, FrameKind::Update, handle.0, &payload)
            .await?;
        decrement(&mut state.live, previous);
        *state.live.entry(location.partition).or_default() += 1;
        state.pending.insert(
            handle.0,
            Entry {
                location,
                items: task.len(),
                enqueued_at: task.enqueued_at(),
            },
        );
        self.compact(&mut state).await?;
        Ok(true)
    }

    /// Deletes every partition; returns the number of discarded tasks.
    pub async fn clear(&self) -> Result<usize, JournalError> {
        let mut state = self.state.lock().await;
        let cleared = state.pending.len();

        state.active = None;
        let partitions: Vec<u64> = state.partitions.iter().copied().collect();
        for seq in partitions {
            remove_if_exists(&partition_path(&self.dir, seq)).await?;
        }
        state.partitions.clear();
        state.live.clear();
        state.pending.clear();

        Ok(cleared)
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        QueueStats {
            tasks: state.pending.len(),
            items: state.pending.values().map(|e| e.items).sum(),
            oldest: state.pending.values().map(|e| e.enqueued_at).min(),
        }
    }

    pub async fn partition_count(&self) -> usize {
        self.state.lock().await.partitions.len()
    }

    async fn write_frame(
        &self,
        state: &mut JournalState,
        kind: FrameKind,
        id: u64,
        payload: &[u8],
    ) -> Result<Location, JournalError> {
        let (frame, flags) = encode_frame(kind, id, payload, self.compression)?;
        let frame_len = frame.len() as u64;

        let needs_rotation = match &state.active {
            None => true,
            Some(active) => active.size > 0 && active.size + frame_len > self.partition_size,
        };
        if needs_rotation {
            let seq = state.next_partition;
            let path = partition_path(&self.dir, seq);
            let file = OpenOptions::new()
                .create_new(true)
                .append(true)
                .open(&path)
                .await?;
            state.next_partition += 1;
            state.partitions.insert(seq);
            state.active = Some(ActivePartition { seq, file, size: 0 });
            tracing::debug!(path = %path.display(), "Opened journal partition");
        }

        let Some(active) = state.active.as_mut() else {
            return Err(JournalError::Io(std::io::Error::other(
                "no active journal partition",
            )));
        };
        let on_disk = active.file.metadata().await?.len();
        if on_disk != active.size {
            tracing::warn!(
                partition = active.seq,
                expected = active.size,
                found = on_disk,
                "Discarding partial frame at journal tail"
            );
            active.file.set_len(active.size).await?;
        }

        let written = async {
            active.file.write_all(&frame).await?;
            active.file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            if active.file.set_len(active.size).await.is_err() {
                // Tail state unknown; the next frame starts a new partition.
                state.active = None;
            }
            return Err(e.into());
        }

        let location = Location {
            partition: active.seq,
            payload_offset: active.size + FRAME_HEADER_LEN as u64,
            len: (frame.len() - FRAME_HEADER_LEN) as u32,
            flags,
        };
        active.size += frame_len;
        Ok(location)
    }

    async fn read_task(&self, location: Location) -> Result<DataSubmissionTask, JournalError> {
        let path = partition_path(&self.dir, location.partition);
        let mut file = File::open(&path).await?;
        file.seek(SeekFrom::Start(location.payload_offset)).await?;

        let mut payload = vec![0u8; location.len as usize];
        file.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                JournalError::Corrupt {
                    path: path.clone(),
                    offset: location.payload_offset,
                }
            } else {
                JournalError::Io(e)
            }
        })?;

        decode_payload(&payload, location.flags)
    }

    async fn compact(&self, state: &mut JournalState) -> Result<(), JournalError> {
        let active = state.active.as_ref().map(|a| a.seq);
        while let Some(&oldest) = state.partitions.first() {
            if Some(oldest) == active || state.live.get(&oldest).copied().unwrap_or(0) > 0 {
                break;
            }
            let path = partition_path(&self.dir, oldest);
            remove_if_exists(&path).await?;
            state.partitions.remove(&oldest);
            state.live.remove(&oldest);
            tracing::debug!(path = %path.display(), "Deleted fully acknowledged journal partition");
        }
        Ok(())
    }
}

fn decrement(live: &mut BTreeMap<u64, usize>, partition: u64) {
    if let Some(count) = live.get_mut(&partition) {
        *count = count.saturating_sub(1);
    }
}

fn partition_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("{seq:010}.{PARTITION_EXTENSION}"))
}

async fn list_partitions(dir: &Path) -> Result<Vec<u64>, JournalError> {
    let mut sequences = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(PARTITION_EXTENSION) {
            continue;
        }
        if let Some(seq) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            sequences.push(seq);
        }
    }
    sequences.sort_unstable();
    Ok(sequences)
}

async fn remove_if_exists(path: &Path) -> Result<(), JournalError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(JournalError::Io(e)),
    }
}

fn encode_frame(
    kind: FrameKind,
    id: u64,
    payload: &[u8],
    compress: bool,
) -> Result<(BytesMut, u8), std::io::Error> {
    let (body, flags) = if compress && !payload.is_empty() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(payload)?;
        (encoder.finish()?, FLAG_GZIP)
    } else {
        (payload.to_vec(), 0)
    };

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.put_u8(kind as u8);
    frame.put_u8(flags);
    frame.put_u64_le(id);
    frame.put_u32_le(body.len() as u32);

    let mut crc = Crc::new();
    crc.update(&frame[..CHECKSUMMED_HEADER_LEN]);
    crc.update(&body);
    frame.put_u32_le(crc.sum());
    frame.put_slice(&body);

    Ok((frame, flags))
}

fn scan_frames(data: &[u8]) -> Scan {
    let mut frames = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        if data.len() - offset < FRAME_HEADER_LEN {
            return Scan {
                frames,
                valid_len: offset,
                torn: true,
            };
        }

        let mut header = &data[offset..offset + FRAME_HEADER_LEN];
        let kind = header.get_u8();
        let flags = header.get_u8();
        let id = header.get_u64_le();
        let len = header.get_u32_le();
        let expected_crc = header.get_u32_le();

        let payload_offset = offset + FRAME_HEADER_LEN;
        let end = payload_offset.saturating_add(len as usize);
        let kind = match FrameKind::from_u8(kind) {
            Some(kind) if end <= data.len() => kind,
            _ => {
                return Scan {
                    frames,
                    valid_len: offset,
                    torn: true,
                };
            }
        };

        let mut crc = Crc::new();
        crc.update(&data[offset..offset + CHECKSUMMED_HEADER_LEN]);
        crc.update(&data[payload_offset..end]);
        if crc.sum() != expected_crc {
            return Scan {
                frames,
                valid_len: offset,
                torn: true,
            };
        }

        frames.push(RawFrame {
            kind,
            flags,
            id,
            payload_offset,
            len,
        });
        offset = end;
    }

    Scan {
        frames,
        valid_len: offset,
        torn: false,
    }
}

fn decode_payload(payload: &[u8], flags: u8) -> Result<DataSubmissionTask, JournalError> {
    if flags & FLAG_GZIP != 0 {
        let mut decoder = GzDecoder::new(payload);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(DataSubmissionTask::from_bytes(&decompressed)?)
    } else {
        Ok(DataSubmissionTask::from_bytes(payload)?)
    }
}
