//! TTL-bounded leases over named resources.
//!
//! The only cross-process primitive used here is "create this file unless it
//! already exists". A lease record is written to a private temp file first and
//! then hard-linked into place, so the lease file is either absent or complete.
//! Expiry, heartbeats and ownership are derived from that primitive plus the
//! wall clock.
//!
//! Deleting an expired lease and recreating it is two steps, so reclaim,
//! release and heartbeat take a short per-resource guard lock. Reclaim only
//! *tries* the guard: when another process holds it, acquisition reports
//! contention instead of waiting.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::layout::{self, Layout};

pub const DEFAULT_TTL_SECS: u64 = 300;
pub const DEFAULT_HEARTBEAT_SECS: u64 = 10;

/// Ownership record for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    #[serde(rename = "task_id")]
    pub resource_id: String,
    #[serde(rename = "worker_id")]
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    #[serde(rename = "ttl")]
    pub ttl_seconds: u64,
}

impl Lease {
    pub fn new(resource_id: &str, holder_id: &str, ttl_seconds: u64, now: DateTime<Utc>) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            holder_id: holder_id.to_string(),
            acquired_at: now,
            heartbeat_at: now,
            ttl_seconds,
        }
    }
}

/// A lease is expired once more than `ttl` has passed since its last heartbeat.
pub fn is_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let ttl = TimeDelta::seconds(i64::from(u32::try_from(lease.ttl_seconds).unwrap_or(u32::MAX)));
    now.signed_duration_since(lease.heartbeat_at) > ttl
}

/// Lease operations the dispatcher and workers depend on.
///
/// Every method reports contention or a lost race through its return value;
/// none of them block waiting for another holder.
pub trait LeaseStore: Send + Sync {
    /// Take the lease, or confirm it is already ours. Never waits.
    fn acquire(&self, resource_id: &str, holder_id: &str, ttl_seconds: u64) -> bool;

    /// Like `acquire`, but an existing live lease fails the call even when
    /// `holder_id` already owns it.
    fn claim(&self, resource_id: &str, holder_id: &str, ttl_seconds: u64) -> bool;

    /// Drop the lease if `holder_id` owns it.
    fn release(&self, resource_id: &str, holder_id: &str) -> bool;

    /// Refresh `heartbeat_at` if `holder_id` owns the lease.
    fn heartbeat(&self, resource_id: &str, holder_id: &str) -> bool;

    /// Current lease record, live or not. Corrupt records read as absent.
    fn read(&self, resource_id: &str) -> Option<Lease>;

    /// Every lease that has not expired.
    fn live_leases(&self) -> Vec<Lease>;

    /// Whether `holder_id` owns a live lease on `resource_id`.
    fn holds(&self, resource_id: &str, holder_id: &str) -> bool {
        self.read(resource_id)
            .is_some_and(|l| l.holder_id == holder_id && !is_expired(&l, Utc::now()))
    }
}

/// Leases stored as one JSON file per resource under `locks/`.
#[derive(Debug, Clone)]
pub struct FileLeaseStore {
    layout: Layout,
}

/// Advisory guard lock, released on drop.
struct Guard(File);

impl Drop for Guard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

impl FileLeaseStore {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    fn open_guard(&self, resource_id: &str) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(self.layout.lease_guard_file(resource_id))
    }

    /// Block until the guard is held. A guard file unlinked by a release while
    /// we waited is stale; reopen and lock the current one.
    fn lock_guard(&self, resource_id: &str) -> io::Result<Guard> {
        loop {
            let file = self.open_guard(resource_id)?;
            file.lock_exclusive()?;
            if self.guard_is_current(resource_id, &file)? {
                return Ok(Guard(file));
            }
        }
    }

    fn try_lock_guard(&self, resource_id: &str) -> io::Result<Option<Guard>> {
        loop {
            let file = self.open_guard(resource_id)?;
            match file.try_lock_exclusive() {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
            if self.guard_is_current(resource_id, &file)? {
                return Ok(Some(Guard(file)));
            }
        }
    }

    /// Whether `file` is still the guard at its path.
    #[cfg(unix)]
    fn guard_is_current(&self, resource_id: &str, file: &File) -> io::Result<bool> {
        use std::os::unix::fs::MetadataExt;

        let held = file.metadata()?;
        match fs::metadata(self.layout.lease_guard_file(resource_id)) {
            Ok(on_disk) => Ok(on_disk.dev() == held.dev() && on_disk.ino() == held.ino()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[cfg(not(unix))]
    fn guard_is_current(&self, _resource_id: &str, _file: &File) -> io::Result<bool> {
        Ok(true)
    }

    /// Unlink the guard while it is still held. Waiters on the old file notice
    /// in `guard_is_current` and retry. Without inode identity the guard stays.
    fn remove_guard(&self, resource_id: &str, _guard: &Guard) {
        if !cfg!(unix) {
            return;
        }
        if let Err(e) = fs::remove_file(self.layout.lease_guard_file(resource_id))
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::debug!(resource_id, error = %e, "cannot remove lease guard");
        }
    }

    /// Atomic create-if-absent. `Ok(false)` means a lease file already exists.
    fn try_create(&self, lease: &Lease) -> io::Result<bool> {
        let path = self.layout.lease_file(&lease.resource_id);
        let body = serde_json::to_vec_pretty(lease)?;
        let tmp = layout::temp_sibling(&path);
        fs::write(&tmp, body)?;
        let created = match fs::hard_link(&tmp, &path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        };
        let _ = fs::remove_file(&tmp);
        created
    }

    /// Replace an expired, corrupt or vanished lease. Runs under the guard.
    fn reclaim(&self, resource_id: &str, holder_id: &str, ttl_seconds: u64, reentrant: bool) -> bool {
        let _guard = match self.try_lock_guard(resource_id) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                tracing::debug!(resource_id, holder_id, "lease reclaim in progress elsewhere");
                return false;
            }
            Err(e) => {
                tracing::warn!(resource_id, error = %e, "cannot open lease guard");
                return false;
            }
        };

        let now = Utc::now();
        if let Some(current) = self.read(resource_id)
            && !is_expired(&current, now)
        {
            // Someone else reclaimed it between our first look and the guard.
            return reentrant && current.holder_id == holder_id;
        }

        let path = self.layout.lease_file(resource_id);
        if let Err(e) = fs::remove_file(&path)
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(resource_id, error = %e, "cannot remove stale lease");
            return false;
        }

        match self.try_create(&Lease::new(resource_id, holder_id, ttl_seconds, now)) {
            Ok(true) => {
                tracing::info!(resource_id, holder_id, "reclaimed expired lease");
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(resource_id, error = %e, "cannot write lease");
                false
            }
        }
    }
}

fn read_lease_file(path: &Path) -> Option<Lease> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::debug!(path = %path.display(), error = %e, "lease unreadable, treating as absent");
            }
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(lease) => Some(lease),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt lease, treating as absent");
            None
        }
    }
}

impl FileLeaseStore {
    fn take(&self, resource_id: &str, holder_id: &str, ttl_seconds: u64, reentrant: bool) -> bool {
        let now = Utc::now();
        match self.try_create(&Lease::new(resource_id, holder_id, ttl_seconds, now)) {
            Ok(true) => {
                tracing::debug!(resource_id, holder_id, ttl_seconds, "lease acquired");
                return true;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(resource_id, error = %e, "cannot write lease");
                return false;
            }
        }

        match self.read(resource_id) {
            Some(existing) if !is_expired(&existing, now) => reentrant && existing.holder_id == holder_id,
            _ => self.reclaim(resource_id, holder_id, ttl_seconds, reentrant),
        }
    }
}

impl LeaseStore for FileLeaseStore {
    fn acquire(&self, resource_id: &str, holder_id: &str, ttl_seconds: u64) -> bool {
        self.take(resource_id, holder_id, ttl_seconds, true)
    }

    fn claim(&self, resource_id: &str, holder_id: &str, ttl_seconds: u64) -> bool {
        self.take(resource_id, holder_id, ttl_seconds, false)
    }

    fn release(&self, resource_id: &str, holder_id: &str) -> bool {
        let guard = match self.lock_guard(resource_id) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(resource_id, error = %e, "cannot open lease guard");
                return false;
            }
        };
        match self.read(resource_id) {
            Some(lease) if lease.holder_id == holder_id => {
                match fs::remove_file(self.layout.lease_file(resource_id)) {
                    Ok(()) => {
                        self.remove_guard(resource_id, &guard);
                        tracing::debug!(resource_id, holder_id, "lease released");
                        true
                    }
                    Err(e) => {
                        tracing::warn!(resource_id, error = %e, "cannot remove lease");
                        false
                    }
                }
            }
            Some(lease) => {
                tracing::debug!(resource_id, holder_id, owner = %lease.holder_id, "release by non-owner refused");
                false
            }
            None => {
                self.remove_guard(resource_id, &guard);
                false
            }
        }
    }

    fn heartbeat(&self, resource_id: &str, holder_id: &str) -> bool {
        let guard = match self.lock_guard(resource_id) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(resource_id, error = %e, "cannot open lease guard");
                return false;
            }
        };
        let Some(mut lease) = self.read(resource_id) else {
            self.remove_guard(resource_id, &guard);
            return false;
        };
        if lease.holder_id != holder_id {
            return false;
        }
        lease.heartbeat_at = Utc::now();
        let written = serde_json::to_vec_pretty(&lease)
            .map_err(io::Error::from)
            .and_then(|body| layout::atomic_write(&self.layout.lease_file(resource_id), &body));
        match written {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(resource_id, error = %e, "heartbeat write failed");
                false
            }
        }
    }

    fn read(&self, resource_id: &str) -> Option<Lease> {
        read_lease_file(&self.layout.lease_file(resource_id))
    }

    fn live_leases(&self) -> Vec<Lease> {
        let Ok(entries) = fs::read_dir(self.layout.locks_dir()) else {
            return Vec::new();
        };
        let now = Utc::now();
        let mut leases: Vec<Lease> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.extension().and_then(|e| e.to_str()) == Some("json")
                    && !p
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with('.'))
            })
            .filter_map(|p| read_lease_file(&p))
            .filter(|l| !is_expired(l, now))
            .collect();
        leases.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        leases
    }
}
