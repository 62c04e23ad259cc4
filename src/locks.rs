//! Named advisory locks.
//!
//! A [`LockRegistry`] is a cheap-to-clone handle shared by the sync pipeline
//! and the command layer. Acquisition never waits: a held lock reports who
//! holds it and the caller turns that into a `Busy` outcome.
//!
//! A registry built with [`LockRegistry::with_lock_dir`] also claims a lock
//! file per name, holding the pid and acquisition time of the owner. Claims
//! whose process is gone or that have outlived `LOCK_STALE_SECONDS` are
//! archived next to the lock and taken over.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{TlError, TlResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockName {
    /// At most one synchronization of any account at a time per store.
    Sync,
    Leaderboard,
    Average,
    Match,
    Line,
    Tens,
    Skip,
    /// Full-history scans and other unbounded reads.
    LargeQuery,
}

impl LockName {
    pub const ALL: [Self; 8] = [
        Self::Sync,
        Self::Leaderboard,
        Self::Average,
        Self::Match,
        Self::Line,
        Self::Tens,
        Self::Skip,
        Self::LargeQuery,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Leaderboard => "leaderboard",
            Self::Average => "average",
            Self::Match => "match",
            Self::Line => "line",
            Self::Tens => "tens",
            Self::Skip => "skip",
            Self::LargeQuery => "large_query",
        }
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub lock: LockName,
    /// Free-form description of the work, e.g. `keegant/play`.
    pub holder: String,
    pub pid: u32,
    pub acquired_at_rfc3339: String,
}

impl LockHolder {
    #[must_use]
    pub fn into_busy(self) -> TlError {
        TlError::busy(self.lock.as_str(), Some(&self.holder))
    }
}

#[derive(Debug)]
pub enum Acquisition {
    Held(LockGuard),
    Busy(LockHolder),
}

impl Acquisition {
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }

    /// Collapse into a `Result`, mapping contention to [`TlError::Busy`].
    pub fn into_result(self) -> Result<LockGuard, TlError> {
        match self {
            Self::Held(guard) => Ok(guard),
            Self::Busy(holder) => Err(holder.into_busy()),
        }
    }
}

type Table = HashMap<LockName, LockHolder>;

/// Lock files older than this are taken over even when their pid is alive.
const LOCK_STALE_SECONDS: i64 = 3_600;

#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    held: Arc<Mutex<Table>>,
    /// When set, every lock is also a `<name>.lock` file in this directory so
    /// separate processes sharing a store exclude each other.
    lock_dir: Option<Arc<PathBuf>>,
}

impl LockRegistry {
    /// Registry scoped to this process.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose locks are shared by every process using `lock_dir`.
    #[must_use]
    pub fn with_lock_dir(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            held: Arc::default(),
            lock_dir: Some(Arc::new(lock_dir.into())),
        }
    }

    /// Take `name` if it is free. Never waits.
    pub fn try_acquire(&self, name: LockName, holder: &str) -> TlResult<Acquisition> {
        let mut table = self.table();
        if let Some(current) = table.get(&name) {
            tracing::debug!(lock = %name, holder = %current.holder, "lock busy");
            return Ok(Acquisition::Busy(current.clone()));
        }

        let claim = LockHolder {
            lock: name,
            holder: holder.to_owned(),
            pid: std::process::id(),
            acquired_at_rfc3339: Utc::now().to_rfc3339(),
        };
        let file = match self.lock_dir.as_deref() {
            Some(dir) => match claim_lock_file(dir, &claim)? {
                Ok(path) => Some(path),
                Err(current) => {
                    tracing::debug!(
                        lock = %name,
                        holder = %current.holder,
                        pid = current.pid,
                        "lock busy in another process"
                    );
                    return Ok(Acquisition::Busy(current));
                }
            },
            None => None,
        };

        table.insert(name, claim);
        tracing::debug!(lock = %name, holder, "lock acquired");
        Ok(Acquisition::Held(LockGuard {
            registry: self.clone(),
            name,
            file,
            released: false,
        }))
    }

    /// Contend for `name` only when `condition` holds, as for queries that
    /// are cheap below some size. `None` means nothing was taken.
    pub fn try_acquire_if(
        &self,
        name: LockName,
        condition: bool,
        holder: &str,
    ) -> TlResult<Option<Acquisition>> {
        condition
            .then(|| self.try_acquire(name, holder))
            .transpose()
    }

    /// Holder of `name` within this process.
    #[must_use]
    pub fn holder(&self, name: LockName) -> Option<LockHolder> {
        self.table().get(&name).cloned()
    }

    #[must_use]
    pub fn is_held(&self, name: LockName) -> bool {
        self.table().contains_key(&name)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<LockHolder> {
        let mut holders: Vec<LockHolder> = self.table().values().cloned().collect();
        holders.sort_by_key(|holder| holder.lock.as_str());
        holders
    }

    fn release(&self, name: LockName) {
        if self.table().remove(&name).is_some() {
            tracing::debug!(lock = %name, "lock released");
        }
    }

    /// The table stays consistent across a panic in a holder, so a poisoned
    /// mutex is recovered rather than propagated.
    fn table(&self) -> MutexGuard<'_, Table> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create `<dir>/<lock>.lock` exclusively. A live claim by someone else comes
/// back as `Err(holder)`; stale and corrupt claims are archived and retried.
fn claim_lock_file(dir: &Path, claim: &LockHolder) -> TlResult<Result<PathBuf, LockHolder>> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.lock", claim.lock));

    for _ in 0..2 {
        match OpenOptions::new().create_new(true).write(true).open(&path) {
            Ok(mut file) => {
                file.write_all(serde_json::to_string_pretty(claim)?.as_bytes())?;
                file.sync_all()?;
                return Ok(Ok(path));
            }
            Err(error) if error.kind() == io::ErrorKind::AlreadyExists => {}
            Err(error) => {
                return Err(TlError::Storage(format!(
                    "failed to create lock file {}: {error}",
                    path.display()
                )));
            }
        }

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            // Released between our create and read.
            Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
            Err(error) => return Err(error.into()),
        };
        if contents.trim().is_empty() && !file_is_old(&path) {
            // Claimed, holder details not written yet.
            return Ok(Err(LockHolder {
                lock: claim.lock,
                holder: "unknown".to_owned(),
                pid: 0,
                acquired_at_rfc3339: Utc::now().to_rfc3339(),
            }));
        }
        match serde_json::from_str::<LockHolder>(&contents) {
            Ok(current) if !is_lock_stale(&current) => return Ok(Err(current)),
            Ok(current) => {
                tracing::warn!(
                    lock = %claim.lock,
                    holder = %current.holder,
                    pid = current.pid,
                    "taking over stale lock"
                );
                archive_lock_file(&path, claim.lock, "stale")?;
            }
            Err(_) => archive_lock_file(&path, claim.lock, "corrupt")?,
        }
    }

    Err(TlError::Storage(format!(
        "lock file {} keeps reappearing",
        path.display()
    )))
}

fn is_lock_stale(holder: &LockHolder) -> bool {
    if !pid_is_alive(holder.pid) {
        return true;
    }
    chrono::DateTime::parse_from_rfc3339(&holder.acquired_at_rfc3339)
        .map(|acquired| Utc::now().signed_duration_since(acquired).num_seconds() > LOCK_STALE_SECONDS)
        .unwrap_or(true)
}

fn file_is_old(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age.as_secs() > LOCK_STALE_SECONDS as u64)
}

fn archive_lock_file(path: &Path, name: LockName, reason: &str) -> TlResult<()> {
    let timestamp = Utc::now().timestamp_millis();
    let archived = path.with_file_name(format!("{name}.lock.{reason}.{timestamp}.json"));
    match fs::rename(path, archived) {
        Ok(()) => Ok(()),
        // Someone else archived or released it first.
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

#[cfg(target_os = "linux")]
fn pid_is_alive(pid: u32) -> bool {
    pid != 0 && Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_is_alive(pid: u32) -> bool {
    pid != 0
}

/// Releases its lock when dropped.
#[derive(Debug)]
pub struct LockGuard {
    registry: LockRegistry,
    name: LockName,
    file: Option<PathBuf>,
    released: bool,
}

impl LockGuard {
    #[must_use]
    pub const fn name(&self) -> LockName {
        self.name
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        if let Some(path) = &self.file
            && let Err(error) = fs::remove_file(path)
            && error.kind() != io::ErrorKind::NotFound
        {
            tracing::warn!(path = %path.display(), error = %error, "failed to remove lock file");
        }
        self.registry.release(self.name);
        self.released = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquire(registry: &LockRegistry, name: LockName, holder: &str) -> Acquisition {
        registry.try_acquire(name, holder).expect("acquire should not fail")
    }

    #[test]
    fn second_acquire_reports_holder() {
        let registry = LockRegistry::new();
        let Acquisition::Held(_guard) = acquire(&registry, LockName::Sync, "keegant/play") else {
            panic!("first acquire should succeed");
        };

        match acquire(&registry, LockName::Sync, "someone/else") {
            Acquisition::Busy(holder) => {
                assert_eq!(holder.holder, "keegant/play");
                assert_eq!(holder.lock, LockName::Sync);
                assert_eq!(holder.pid, std::process::id());
            }
            other => panic!("expected busy, got {other:?}"),
        }
    }

    #[test]
    fn dropping_guard_releases() {
        let registry = LockRegistry::new();
        {
            let acquisition = acquire(&registry, LockName::Match, "match");
            assert!(matches!(acquisition, Acquisition::Held(_)));
            assert!(registry.is_held(LockName::Match));
        }
        assert!(!registry.is_held(LockName::Match));
        assert!(matches!(
            acquire(&registry, LockName::Match, "match"),
            Acquisition::Held(_)
        ));
    }

    #[test]
    fn locks_are_independent() {
        let registry = LockRegistry::new();
        let _sync = acquire(&registry, LockName::Sync, "a/play");
        assert!(matches!(
            acquire(&registry, LockName::LargeQuery, "history"),
            Acquisition::Held(_)
        ));
    }

    #[test]
    fn clones_share_state() {
        let registry = LockRegistry::new();
        let other = registry.clone();
        let _guard = acquire(&registry, LockName::Leaderboard, "board");
        assert!(acquire(&other, LockName::Leaderboard, "board").is_busy());
    }

    #[test]
    fn conditional_acquire_skips_when_not_needed() {
        let registry = LockRegistry::new();
        let _held = acquire(&registry, LockName::LargeQuery, "big scan");

        let small = registry
            .try_acquire_if(LockName::LargeQuery, false, "small scan")
            .expect("no io");
        assert!(small.is_none());

        let large = registry
            .try_acquire_if(LockName::LargeQuery, true, "other scan")
            .expect("no io")
            .expect("condition holds");
        let error = large.into_result().expect_err("should be busy");
        assert_eq!(error.error_code(), "TL-BUSY");
        assert_eq!(error.to_string(), "lock `large_query` is held by big scan");
    }

    #[test]
    fn explicit_release_is_idempotent_with_drop() {
        let registry = LockRegistry::new();
        let Acquisition::Held(guard) = acquire(&registry, LockName::Tens, "tens") else {
            panic!("should acquire");
        };
        assert_eq!(guard.name(), LockName::Tens);
        guard.release();
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn snapshot_lists_every_holder() {
        let registry = LockRegistry::new();
        let _a = acquire(&registry, LockName::Skip, "skip");
        let _b = acquire(&registry, LockName::Average, "average");
        let names: Vec<LockName> = registry.snapshot().iter().map(|h| h.lock).collect();
        assert_eq!(names, vec![LockName::Average, LockName::Skip]);
        assert_eq!(LockName::ALL.len(), 8);
    }

    #[test]
    fn registries_sharing_a_lock_dir_exclude_each_other() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = LockRegistry::with_lock_dir(dir.path().join("locks"));
        let second = LockRegistry::with_lock_dir(dir.path().join("locks"));

        let Acquisition::Held(guard) = acquire(&first, LockName::Sync, "keegant/play") else {
            panic!("first registry should acquire");
        };
        let lock_file = dir.path().join("locks").join("sync.lock");
        assert!(lock_file.exists());

        match acquire(&second, LockName::Sync, "other/play") {
            Acquisition::Busy(holder) => {
                assert_eq!(holder.holder, "keegant/play");
                assert_eq!(holder.pid, std::process::id());
            }
            other => panic!("expected busy, got {other:?}"),
        }
        assert!(!second.is_held(LockName::Sync));

        guard.release();
        assert!(!lock_file.exists());
        assert!(matches!(
            acquire(&second, LockName::Sync, "other/play"),
            Acquisition::Held(_)
        ));
    }

    #[test]
    fn stale_lock_file_is_archived_and_taken_over() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stale = LockHolder {
            lock: LockName::Sync,
            holder: "crashed/play".to_owned(),
            pid: std::process::id(),
            acquired_at_rfc3339: "2001-01-01T00:00:00+00:00".to_owned(),
        };
        fs::write(
            dir.path().join("sync.lock"),
            serde_json::to_string(&stale).expect("json"),
        )
        .expect("write stale lock");

        let registry = LockRegistry::with_lock_dir(dir.path());
        assert!(matches!(
            acquire(&registry, LockName::Sync, "keegant/play"),
            Acquisition::Held(_)
        ));

        let archived: Vec<String> = fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("sync.lock.stale."))
            .collect();
        assert_eq!(archived.len(), 1);
    }

    #[test]
    fn corrupt_lock_file_is_archived() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("large_query.lock"), "{ not json").expect("write");

        let registry = LockRegistry::with_lock_dir(dir.path());
        let Acquisition::Held(_guard) = acquire(&registry, LockName::LargeQuery, "history") else {
            panic!("corrupt claim should be taken over");
        };
        let contents =
            fs::read_to_string(dir.path().join("large_query.lock")).expect("fresh lock file");
        let holder: LockHolder = serde_json::from_str(&contents).expect("holder json");
        assert_eq!(holder.holder, "history");
    }

    #[test]
    fn dead_pid_marks_lock_stale() {
        let holder = LockHolder {
            lock: LockName::Sync,
            holder: "gone".to_owned(),
            pid: 0,
            acquired_at_rfc3339: Utc::now().to_rfc3339(),
        };
        assert!(is_lock_stale(&holder));

        let live = LockHolder {
            pid: std::process::id(),
            ..holder
        };
        assert!(!is_lock_stale(&live));
    }
}
