//! Persistent allocation records guarded by a host-wide file lock.
//!
//! Layout under `<data dir>/<network>/`:
//! - `lock`: `flock(2)` target; holds the pid of the current holder
//! - `<container id>.json`: one allocation record per container
//!
//! Every mutation is written to a temporary file, synced, renamed into place
//! and followed by a sync of the directory, so a reader sees either the old
//! or the new record and never a torn one. The kernel drops a `flock` when
//! its holder exits, so a crashed invocation never wedges the store.

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default root for allocation state
pub const DEFAULT_DATA_DIR: &str = "/var/lib/cni/vpcnet";

const LOCK_FILE: &str = "lock";
const RECORD_EXT: &str = "json";
const TMP_PREFIX: &str = ".tmp-";
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt allocation record {path}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("container id {0:?} cannot be used as a store key")]
    InvalidContainerId(String),

    #[error("timed out after {waited:?} waiting for store lock {path} (held by pid {holder:?})")]
    LockTimeout {
        path: PathBuf,
        waited: Duration,
        holder: Option<i32>,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Outstanding assignment of one pod address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub container_id: String,
    pub address: Ipv4Addr,
    /// Host interface of the owning ENI
    pub eni_interface: String,
    /// Attachment index of the owning ENI, used to find its route table
    pub eni_index: u32,
    pub host_ifname: String,
    pub container_ifname: String,
    pub created_at: DateTime<Utc>,
    /// Attach invocation that last claimed this record. A failed attach may
    /// only undo its work while the claim is still its own.
    #[serde(default)]
    pub attach_id: Uuid,
}

/// On-disk record store for one network.
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    /// Open (creating if needed) the store for `network` below `data_dir`
    pub fn open(data_dir: &Path, network: &str) -> Result<Self, StoreError> {
        let dir = data_dir.join(network);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Take the store-wide exclusive lock, waiting at most `timeout`.
    ///
    /// The lock is released when the returned guard is dropped, or by the
    /// kernel if the process dies while holding it.
    pub fn lock(&self, timeout: Duration) -> Result<StoreGuard<'_>, StoreError> {
        let path = self.dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;

        let started = Instant::now();
        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => break,
                Err(Errno::EINTR) => continue,
                Err(errno) if errno == Errno::EWOULDBLOCK => {
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(StoreError::LockTimeout {
                            holder: read_holder(&mut file),
                            path,
                            waited,
                        });
                    }
                    thread::sleep(LOCK_POLL_INTERVAL.min(timeout - waited));
                }
                Err(errno) => return Err(StoreError::io(&path, io::Error::from(errno))),
            }
        }

        write_holder(&mut file).map_err(|e| StoreError::io(&path, e))?;
        debug!(lock = %path.display(), waited = ?started.elapsed(), "acquired store lock");

        let guard = StoreGuard {
            store: self,
            _lock: file,
        };
        guard.sweep_temporaries()?;
        Ok(guard)
    }

    fn record_path(&self, container_id: &str) -> Result<PathBuf, StoreError> {
        if !valid_container_id(container_id) {
            return Err(StoreError::InvalidContainerId(container_id.to_string()));
        }
        Ok(self.dir.join(format!("{}.{}", container_id, RECORD_EXT)))
    }
}

/// Exclusive access to the store. Records can only be read or changed
/// through a guard.
#[derive(Debug)]
pub struct StoreGuard<'a> {
    store: &'a Store,
    _lock: File,
}

impl StoreGuard<'_> {
    pub fn get(&self, container_id: &str) -> Result<Option<AllocationRecord>, StoreError> {
        let path = self.store.record_path(container_id)?;
        match fs::read(&path) {
            Ok(data) => decode(&path, &data).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Insert or replace the record for `record.container_id`. The record is
    /// durable once this returns.
    pub fn put(&self, record: &AllocationRecord) -> Result<(), StoreError> {
        let path = self.store.record_path(&record.container_id)?;
        let data = serde_json::to_vec_pretty(record).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_atomic(&self.store.dir, &path, &data)
    }

    /// Remove the record for `container_id`; returns whether one existed.
    pub fn delete(&self, container_id: &str) -> Result<bool, StoreError> {
        let path = self.store.record_path(container_id)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                sync_dir(&self.store.dir)?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// All records, ordered by container id
    pub fn list(&self) -> Result<Vec<AllocationRecord>, StoreError> {
        let dir = &self.store.dir;
        let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(dir, e))?;
            let path = entry.path();
            if !is_record_file(&path) {
                continue;
            }
            let data = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
            records.push(decode(&path, &data)?);
        }
        records.sort_by(|a, b| a.container_id.cmp(&b.container_id));
        Ok(records)
    }

    /// Remove temporary files left behind by writers that died mid-write.
    fn sweep_temporaries(&self) -> Result<(), StoreError> {
        let dir = &self.store.dir;
        let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(dir, e))?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(TMP_PREFIX) {
                warn!(file = %entry.path().display(), "removing leftover temporary record");
                fs::remove_file(entry.path()).map_err(|e| StoreError::io(&entry.path(), e))?;
            }
        }
        Ok(())
    }
}

/// Container ids become file names, so keep them to a conservative charset.
fn valid_container_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn is_record_file(path: &Path) -> bool {
    let hidden = path
        .file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(true);
    !hidden && path.extension().map(|ext| ext == RECORD_EXT).unwrap_or(false)
}

fn decode(path: &Path, data: &[u8]) -> Result<AllocationRecord, StoreError> {
    serde_json::from_slice(data).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

fn write_atomic(dir: &Path, path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let tmp = dir.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));

    let written = (|| {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::io(path, e));
    }

    sync_dir(dir)
}

fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| StoreError::io(dir, e))
}

fn write_holder(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{}", std::process::id())?;
    file.sync_data()
}

fn read_holder(file: &mut File) -> Option<i32> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}
