//! Snapshot file management.
//!
//! A snapshot lives in its own directory named `snapshot-XXXXXXXXXXXXXXXX`
//! (hex of the snapshot index). It is first materialized under a
//! `.generating` suffix and renamed into place once the payload and the
//! metadata record are flushed, so a crash never leaves a partially
//! written snapshot that looks complete.

use std::fs;
use std::fs::File;
use std::io;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::membership::Membership;
use crate::types::GroupId;

#[cfg(test)]
mod snapshot_test;

const GENERATING_SUFFIX: &str = ".generating";
const PAYLOAD_FILENAME: &str = "snapshot.payload";
const META_FILENAME: &str = "snapshot.meta";

/// Metadata of a snapshot, both as a durable record in the log store and
/// as the wire form carried by InstallSnapshot messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[derive(Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub shard_id: u64,
    pub replica_id: u64,

    /// The snapshot represents state at and including this index.
    pub index: u64,
    pub term: u64,

    pub membership: Membership,

    pub file_path: String,
    pub file_size: u64,
    pub checksum: u64,

    /// Produced by a witness replica; carries no payload.
    pub witness: bool,

    /// A payload-free snapshot generated purely to allow compaction.
    pub dummy: bool,
}

impl SnapshotMeta {
    pub fn is_empty(&self) -> bool {
        self.index == 0
    }
}

/// Options for a user-requested snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct SnapshotOptions {
    /// Exported snapshots are written for external consumption and do not
    /// trigger log compaction.
    pub exported: bool,

    /// Overrides `Config::compaction_overhead` for this snapshot only.
    /// Zero keeps the configured value.
    pub override_compaction_overhead: u64,
}

/// The atomically-written on-disk record: snapshot metadata plus the
/// serialized client session table captured at the snapshot index.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileMeta {
    meta: SnapshotMeta,
    sessions: Vec<u8>,
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

fn fnv1a(seed: u64, data: &[u8]) -> u64 {
    let mut h = seed;
    for b in data {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x100_0000_01b3);
    }
    h
}

/// Owns the snapshot directory tree of one replica.
#[derive(Debug, Clone)]
pub struct Snapshotter {
    root: PathBuf,
    group: GroupId,
}

impl Snapshotter {
    pub fn new(root: impl Into<PathBuf>, group: GroupId) -> Self {
        Snapshotter { root: root.into(), group }
    }

    fn replica_dir(&self) -> PathBuf {
        self.root.join(format!("snapshots-{}-{}", self.group.shard_id, self.group.replica_id))
    }

    fn final_dir(&self, index: u64) -> PathBuf {
        self.replica_dir().join(format!("snapshot-{:016X}", index))
    }

    fn generating_dir(&self, index: u64) -> PathBuf {
        self.replica_dir().join(format!("snapshot-{:016X}{}", index, GENERATING_SUFFIX))
    }

    /// Start writing a snapshot at `index`. Any leftover of an earlier
    /// aborted attempt at the same index is discarded.
    pub fn new_writer(&self, index: u64) -> io::Result<SnapshotWriter> {
        let dir = self.generating_dir(index);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        let payload = File::create(dir.join(PAYLOAD_FILENAME))?;
        Ok(SnapshotWriter {
            final_dir: self.final_dir(index),
            dir,
            payload: BufWriter::new(payload),
            written: 0,
            checksum: FNV_OFFSET_BASIS,
        })
    }

    /// Open the payload of a completed snapshot for recovery.
    pub fn open_reader(&self, meta: &SnapshotMeta) -> io::Result<SnapshotReader> {
        let file = File::open(Path::new(&meta.file_path).join(PAYLOAD_FILENAME))?;
        Ok(SnapshotReader {
            payload: BufReader::new(file),
            remaining: meta.file_size,
        })
    }

    /// The most recent completed snapshot, with its serialized sessions.
    pub fn load_latest(&self) -> io::Result<Option<(SnapshotMeta, Vec<u8>)>> {
        let dir = self.replica_dir();
        if !dir.exists() {
            return Ok(None);
        }

        let mut best: Option<(u64, PathBuf)> = None;
        for ent in fs::read_dir(&dir)? {
            let ent = ent?;
            let name = ent.file_name();
            let name = name.to_string_lossy();
            let Some(hex) = name.strip_prefix("snapshot-") else {
                continue;
            };
            if hex.ends_with(GENERATING_SUFFIX) {
                continue;
            }
            let Ok(index) = u64::from_str_radix(hex, 16) else {
                continue;
            };
            if best.as_ref().map(|(i, _)| index > *i).unwrap_or(true) {
                best = Some((index, ent.path()));
            }
        }

        let Some((_, path)) = best else {
            return Ok(None);
        };
        let raw = fs::read(path.join(META_FILENAME))?;
        let fm: FileMeta =
            serde_json::from_slice(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some((fm.meta, fm.sessions)))
    }

    /// Read back the session table recorded with the snapshot at `meta`.
    pub fn load_sessions(&self, meta: &SnapshotMeta) -> io::Result<Vec<u8>> {
        let raw = fs::read(Path::new(&meta.file_path).join(META_FILENAME))?;
        let fm: FileMeta =
            serde_json::from_slice(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(fm.sessions)
    }

    /// Remove completed snapshots older than `index`, keeping the latest.
    pub fn remove_older_than(&self, index: u64) -> io::Result<()> {
        let dir = self.replica_dir();
        if !dir.exists() {
            return Ok(());
        }
        for ent in fs::read_dir(&dir)? {
            let ent = ent?;
            let name = ent.file_name();
            let name = name.to_string_lossy();
            let Some(hex) = name.strip_prefix("snapshot-") else {
                continue;
            };
            if hex.ends_with(GENERATING_SUFFIX) {
                continue;
            }
            if let Ok(i) = u64::from_str_radix(hex, 16) {
                if i < index {
                    fs::remove_dir_all(ent.path())?;
                }
            }
        }
        Ok(())
    }
}

/// Streams a snapshot payload to disk, tracking size and checksum.
///
/// Nothing is visible to [`Snapshotter::load_latest`] until
/// [`SnapshotWriter::finalize`] completes the stable rename.
pub struct SnapshotWriter {
    dir: PathBuf,
    final_dir: PathBuf,
    payload: BufWriter<File>,
    written: u64,
    checksum: u64,
}

impl SnapshotWriter {
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Flush payload and metadata, then rename the directory into place.
    pub fn finalize(mut self, mut meta: SnapshotMeta, sessions: Vec<u8>) -> io::Result<SnapshotMeta> {
        self.payload.flush()?;
        self.payload.get_ref().sync_all()?;

        meta.file_path = self.final_dir.to_string_lossy().into_owned();
        meta.file_size = self.written;
        meta.checksum = self.checksum;

        let fm = FileMeta {
            meta: meta.clone(),
            sessions,
        };
        let raw = serde_json::to_vec(&fm).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let meta_path = self.dir.join(META_FILENAME);
        let mut f = File::create(&meta_path)?;
        f.write_all(&raw)?;
        f.sync_all()?;

        fs::rename(&self.dir, &self.final_dir)?;
        Ok(meta)
    }

    /// Abandon the attempt and remove the partial directory.
    pub fn discard(self) -> io::Result<()> {
        drop(self.payload);
        fs::remove_dir_all(&self.dir)
    }
}

impl Write for SnapshotWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.payload.write(buf)?;
        self.written += n as u64;
        self.checksum = fnv1a(self.checksum, &buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.payload.flush()
    }
}

/// Reads a completed snapshot payload during recovery.
pub struct SnapshotReader {
    payload: BufReader<File>,
    remaining: u64,
}

impl Read for SnapshotReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.payload.read(buf)?;
        self.remaining = self.remaining.saturating_sub(n as u64);
        Ok(n)
    }
}
