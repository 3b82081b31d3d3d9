/// Per-resource lock markers
///
/// One marker file `<lock_dir>/<key>.lock` per in-flight render. Acquisition
/// is a single exclusive create (`O_CREAT | O_EXCL`), so two contenders can
/// never both observe "absent" and both create. Each marker records owner
/// pid, coordinator instance, a per-acquisition token and an optional lease
/// expiry. A separate `flock`ed instance file pins the namespace to one
/// long-running coordinator at a time; one-shot processes hold it shared
/// and may run side by side.
use crate::config::types::{LockError, LockInfo, LockResult, ResourceKey};
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

const MARKER_EXTENSION: &str = "lock";
const INSTANCE_FILE: &str = "coordinator.instance";

/// Markers younger than this are never judged unreadable-and-stale; their
/// owner may still be writing the record.
const UNREADABLE_MARKER_GRACE: Duration = Duration::from_secs(5);

/// Lock counters
#[derive(Debug, Default)]
struct LockCounters {
    acquisitions: AtomicU64,
    releases: AtomicU64,
    contentions: AtomicU64,
    swept: AtomicU64,
}

/// Snapshot of lock counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockStats {
    pub acquisitions: u64,
    pub releases: u64,
    pub contentions: u64,
    pub swept: u64,
}

pub struct LockManager {
    lock_dir: PathBuf,
    instance_id: String,
    lease_ttl: Option<Duration>,
    counters: Arc<LockCounters>,
}

/// Held lock for one resource key. Dropping the guard releases the lock,
/// including during panic unwinding.
#[derive(Debug)]
pub struct LockGuard {
    key: ResourceKey,
    marker: PathBuf,
    token: String,
    counters: Arc<LockCounters>,
    released: bool,
}

/// Claim on the lock namespace for this coordinator process
#[derive(Debug)]
pub struct InstanceGuard {
    _file: File,
    path: PathBuf,
    shared: bool,
}

impl LockManager {
    /// Create lock manager rooted at `lock_dir`
    pub fn new(lock_dir: impl Into<PathBuf>, lease_ttl: Option<Duration>) -> LockResult<Self> {
        let lock_dir = lock_dir.into();
        Self::create_lock_directory_with_retry(&lock_dir)?;

        let manager = Self {
            lock_dir,
            instance_id: Uuid::new_v4().to_string(),
            lease_ttl,
            counters: Arc::new(LockCounters::default()),
        };

        info!(
            "Initialized lock manager at {} (instance {})",
            manager.lock_dir.display(),
            manager.instance_id
        );
        Ok(manager)
    }

    /// Create lock directory, tolerating concurrent creation
    fn create_lock_directory_with_retry(lock_dir: &Path) -> LockResult<()> {
        let mut attempt = 0;
        loop {
            match std::fs::create_dir_all(lock_dir) {
                Ok(()) if lock_dir.is_dir() => return Ok(()),
                Ok(()) => {
                    return Err(LockError::Io(std::io::Error::new(
                        ErrorKind::Other,
                        format!("lock path {} is not a directory", lock_dir.display()),
                    )))
                }
                Err(e) if attempt < 2 && e.kind() != ErrorKind::PermissionDenied => {
                    warn!(
                        "Failed to create lock directory on attempt {}: {}. Retrying...",
                        attempt + 1,
                        e
                    );
                    thread::sleep(Duration::from_millis(10 + attempt * 10));
                    attempt += 1;
                }
                Err(e) => return Err(LockError::Io(e)),
            }
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn marker_path(&self, key: &ResourceKey) -> PathBuf {
        self.lock_dir
            .join(format!("{}.{}", key.as_str(), MARKER_EXTENSION))
    }

    /// Claim the namespace for this process. Fails if any other
    /// coordinator, exclusive or shared, holds it. The claim lasts until
    /// the guard is dropped.
    pub fn claim_instance(&self) -> LockResult<InstanceGuard> {
        let (mut file, path) = self.flock_instance(libc::LOCK_EX)?;

        file.set_len(0)?;
        writeln!(file, "{} {}", std::process::id(), self.instance_id)?;
        file.sync_all()?;

        debug!("Claimed lock namespace via {}", path.display());
        Ok(InstanceGuard {
            _file: file,
            path,
            shared: false,
        })
    }

    /// Join the namespace alongside other shared holders. Fails only while
    /// an exclusive claim is held.
    pub fn join_instance(&self) -> LockResult<InstanceGuard> {
        let (file, path) = self.flock_instance(libc::LOCK_SH)?;
        debug!("Joined lock namespace via {}", path.display());
        Ok(InstanceGuard {
            _file: file,
            path,
            shared: true,
        })
    }

    fn flock_instance(&self, mode: libc::c_int) -> LockResult<(File, PathBuf)> {
        let path = self.lock_dir.join(INSTANCE_FILE);
        // Never truncate before holding the flock; never unlink (inode reuse).
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), mode | libc::LOCK_NB) };
        if rc != 0 {
            let errno = std::io::Error::last_os_error();
            return match errno.raw_os_error() {
                Some(libc::EWOULDBLOCK) => Err(LockError::InstanceActive { path }),
                _ => Err(LockError::Io(errno)),
            };
        }
        Ok((file, path))
    }

    /// Try to take the lock for `key`. Never blocks: an existing marker
    /// yields `LockError::Busy` immediately.
    pub fn acquire(&self, key: &ResourceKey) -> LockResult<LockGuard> {
        let marker = self.marker_path(key);

        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                self.counters.contentions.fetch_add(1, Ordering::Relaxed);
                let owner_pid = read_lock_info(&marker).ok().map(|info| info.pid);
                debug!("Lock for {} is busy (owner pid {:?})", key, owner_pid);
                return Err(LockError::Busy {
                    key: key.clone(),
                    owner_pid,
                });
            }
            Err(e) => return Err(LockError::Io(e)),
        };

        let now = chrono::Utc::now();
        let info = LockInfo {
            key: key.clone(),
            pid: std::process::id(),
            instance_id: self.instance_id.clone(),
            token: Uuid::new_v4().to_string(),
            acquired_at: now,
            expires_at: self
                .lease_ttl
                .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                .map(|ttl| now + ttl),
            renderbox_version: env!("CARGO_PKG_VERSION").to_string(),
        };

        let written = serde_json::to_vec(&info)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))
            .and_then(|mut json| {
                json.push(b'\n');
                file.write_all(&json)?;
                file.sync_all()
            });
        if let Err(e) = written {
            // The marker is ours; do not leave a half-written one behind.
            let _ = std::fs::remove_file(&marker);
            return Err(LockError::Io(e));
        }

        self.counters.acquisitions.fetch_add(1, Ordering::Relaxed);
        debug!("Acquired lock for {}", key);

        Ok(LockGuard {
            key: key.clone(),
            marker,
            token: info.token,
            counters: Arc::clone(&self.counters),
            released: false,
        })
    }

    /// Remove the marker for `key`. Idempotent: a missing marker is not an error.
    pub fn release(&self, key: &ResourceKey) -> LockResult<()> {
        match std::fs::remove_file(self.marker_path(key)) {
            Ok(()) => {
                self.counters.releases.fetch_add(1, Ordering::Relaxed);
                debug!("Released lock for {}", key);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::Io(e)),
        }
    }

    pub fn is_locked(&self, key: &ResourceKey) -> bool {
        self.marker_path(key).exists()
    }

    /// Lock record of the current holder, if any
    pub fn owner(&self, key: &ResourceKey) -> Option<LockInfo> {
        read_lock_info(&self.marker_path(key)).ok()
    }

    /// Keys with a marker present, sorted
    pub fn held_keys(&self) -> LockResult<Vec<ResourceKey>> {
        let mut keys: Vec<ResourceKey> = self
            .markers()?
            .into_iter()
            .filter_map(|path| {
                let stem = path.file_stem()?.to_str()?;
                ResourceKey::parse(stem).ok()
            })
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Remove every marker under the namespace. Assumes no other
    /// coordinator is alive.
    pub fn sweep_stale(&self) -> LockResult<usize> {
        let mut removed = 0;
        for marker in self.markers()? {
            match std::fs::remove_file(&marker) {
                Ok(()) => {
                    debug!("Swept lock marker {}", marker.display());
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(LockError::Io(e)),
            }
        }
        self.counters
            .swept
            .fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    /// Remove only markers whose lease expired or whose owner is gone
    pub fn sweep_expired(&self) -> LockResult<usize> {
        let now = chrono::Utc::now();
        let mut removed = 0;

        for marker in self.markers()? {
            let stale = match read_lock_info(&marker) {
                Ok(info) => self.is_lock_stale(&info, now),
                Err(e) => {
                    let old_enough = marker_age(&marker)
                        .map(|age| age > UNREADABLE_MARKER_GRACE)
                        .unwrap_or(false);
                    if old_enough {
                        warn!("Unreadable lock marker {}: {}", marker.display(), e);
                    }
                    old_enough
                }
            };

            if !stale {
                continue;
            }
            match std::fs::remove_file(&marker) {
                Ok(()) => {
                    info!("Reclaimed stale lock marker {}", marker.display());
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(LockError::Io(e)),
            }
        }

        self.counters
            .swept
            .fetch_add(removed as u64, Ordering::Relaxed);
        Ok(removed)
    }

    fn is_lock_stale(&self, info: &LockInfo, now: chrono::DateTime<chrono::Utc>) -> bool {
        if info.expires_at.is_some_and(|expiry| expiry <= now) {
            return true;
        }
        if info.pid == std::process::id() {
            // Same pid, different instance: a previous run in a recycled pid
            // (pid 1 in containers).
            return info.instance_id != self.instance_id;
        }
        !is_process_alive(info.pid)
    }

    fn markers(&self) -> LockResult<Vec<PathBuf>> {
        let mut markers = Vec::new();
        for entry in std::fs::read_dir(&self.lock_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some(MARKER_EXTENSION)
                && path.is_file()
            {
                markers.push(path);
            }
        }
        Ok(markers)
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            acquisitions: self.counters.acquisitions.load(Ordering::Relaxed),
            releases: self.counters.releases.load(Ordering::Relaxed),
            contentions: self.counters.contentions.load(Ordering::Relaxed),
            swept: self.counters.swept.load(Ordering::Relaxed),
        }
    }
}

impl LockGuard {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Release explicitly, surfacing filesystem errors
    pub fn release(mut self) -> LockResult<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> LockResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        match read_lock_info(&self.marker) {
            Ok(info) if info.token != self.token => {
                // Swept and re-acquired by someone else meanwhile.
                warn!(
                    "Lock marker for {} now belongs to pid {}; leaving it in place",
                    self.key, info.pid
                );
                return Ok(());
            }
            Err(LockError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                warn!("Lock marker for {} vanished before release", self.key);
                return Ok(());
            }
            _ => {}
        }

        match std::fs::remove_file(&self.marker) {
            Ok(()) => {
                self.counters.releases.fetch_add(1, Ordering::Relaxed);
                debug!("Released lock for {}", self.key);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LockError::Io(e)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!("Failed to release lock for {}: {}", self.key, e);
        }
    }
}

impl InstanceGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }
}

fn read_lock_info(marker: &Path) -> LockResult<LockInfo> {
    let content = std::fs::read_to_string(marker)?;
    serde_json::from_str(content.lines().next().unwrap_or("")).map_err(|e| {
        LockError::CorruptedLock {
            path: marker.to_path_buf(),
            details: e.to_string(),
        }
    })
}

fn marker_age(marker: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(marker).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}

fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn key(raw: &str) -> ResourceKey {
        ResourceKey::parse(raw).unwrap()
    }

    fn manager(dir: &Path) -> LockManager {
        LockManager::new(dir.join("locks"), Some(Duration::from_secs(60))).unwrap()
    }

    #[test]
    fn second_acquire_is_busy_until_release() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());

        let guard = locks.acquire(&key("scene")).unwrap();
        assert!(locks.is_locked(&key("scene")));

        match locks.acquire(&key("scene")) {
            Err(LockError::Busy { key: k, owner_pid }) => {
                assert_eq!(k, key("scene"));
                assert_eq!(owner_pid, Some(std::process::id()));
            }
            other => panic!("expected Busy, got {:?}", other),
        }

        drop(guard);
        assert!(!locks.is_locked(&key("scene")));
        assert!(locks.acquire(&key("scene")).is_ok());
    }

    #[test]
    fn distinct_keys_do_not_contend() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());

        let _a = locks.acquire(&key("a")).unwrap();
        let _b = locks.acquire(&key("b")).unwrap();
        assert_eq!(locks.held_keys().unwrap(), vec![key("a"), key("b")]);
    }

    #[test]
    fn release_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());

        locks.release(&key("never-locked")).unwrap();
        let guard = locks.acquire(&key("scene")).unwrap();
        std::mem::forget(guard);
        locks.release(&key("scene")).unwrap();
        locks.release(&key("scene")).unwrap();
        assert!(!locks.is_locked(&key("scene")));
    }

    #[test]
    fn marker_records_owner_and_lease() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());

        let _guard = locks.acquire(&key("scene")).unwrap();
        let info = locks.owner(&key("scene")).unwrap();
        assert_eq!(info.pid, std::process::id());
        assert_eq!(info.instance_id, locks.instance_id());
        assert!(info.expires_at.unwrap() > info.acquired_at);
    }

    #[test]
    fn guard_releases_on_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = locks.acquire(&key("scene")).unwrap();
            panic!("render blew up");
        }));
        assert!(result.is_err());
        assert!(!locks.is_locked(&key("scene")));

        let stats = locks.stats();
        assert_eq!(stats.acquisitions, 1);
        assert_eq!(stats.releases, 1);
    }

    #[test]
    fn stale_guard_does_not_remove_new_owners_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());

        let old = locks.acquire(&key("scene")).unwrap();
        assert_eq!(locks.sweep_stale().unwrap(), 1);
        let _new = locks.acquire(&key("scene")).unwrap();

        drop(old);
        assert!(locks.is_locked(&key("scene")));
        assert_eq!(locks.stats().releases, 0);
    }

    #[test]
    fn vanished_marker_is_not_counted_as_released() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());

        let guard = locks.acquire(&key("scene")).unwrap();
        assert_eq!(locks.sweep_stale().unwrap(), 1);
        guard.release().unwrap();

        let stats = locks.stats();
        assert_eq!(stats.acquisitions, 1);
        assert_eq!(stats.releases, 0);
        assert_eq!(stats.swept, 1);
    }

    #[test]
    fn concurrent_acquire_has_exactly_one_winner() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = Arc::new(manager(tmp.path()));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    locks.acquire(&key("scene")).map(std::mem::forget).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn sweep_removes_all_markers_and_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());

        for name in ["a", "b", "c"] {
            std::mem::forget(locks.acquire(&key(name)).unwrap());
        }
        std::fs::write(locks.lock_dir().join("notes.txt"), b"keep").unwrap();

        assert_eq!(locks.sweep_stale().unwrap(), 3);
        assert!(locks.held_keys().unwrap().is_empty());
        assert_eq!(locks.sweep_stale().unwrap(), 0);
        assert!(locks.lock_dir().join("notes.txt").exists());
    }

    #[test]
    fn expired_sweep_spares_live_leases() {
        let tmp = tempfile::tempdir().unwrap();
        let locks = manager(tmp.path());
        std::mem::forget(locks.acquire(&key("live")).unwrap());

        let expired = LockInfo {
            key: key("expired"),
            pid: std::process::id(),
            instance_id: locks.instance_id().to_string(),
            token: "t".to_string(),
            acquired_at: chrono::Utc::now() - chrono::Duration::hours(2),
            expires_at: Some(chrono::Utc::now() - chrono::Duration::hours(1)),
            renderbox_version: "0".to_string(),
        };
        std::fs::write(
            locks.lock_dir().join("expired.lock"),
            serde_json::to_string(&expired).unwrap(),
        )
        .unwrap();

        let previous_run = LockInfo {
            key: key("previous"),
            instance_id: "previous-instance".to_string(),
            expires_at: None,
            ..expired.clone()
        };
        std::fs::write(
            locks.lock_dir().join("previous.lock"),
            serde_json::to_string(&previous_run).unwrap(),
        )
        .unwrap();

        assert_eq!(locks.sweep_expired().unwrap(), 2);
        assert_eq!(locks.held_keys().unwrap(), vec![key("live")]);
    }

    #[test]
    fn second_instance_claim_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let first = manager(tmp.path());
        let second = manager(tmp.path());

        let claim = first.claim_instance().unwrap();
        assert!(matches!(
            second.claim_instance(),
            Err(LockError::InstanceActive { .. })
        ));

        drop(claim);
        assert!(second.claim_instance().is_ok());
    }

    #[test]
    fn shared_claims_coexist_but_exclude_an_exclusive_one() {
        let tmp = tempfile::tempdir().unwrap();
        let one_shot = manager(tmp.path());
        let other_one_shot = manager(tmp.path());
        let server = manager(tmp.path());

        let a = one_shot.join_instance().unwrap();
        let b = other_one_shot.join_instance().unwrap();
        assert!(a.is_shared() && b.is_shared());
        assert!(matches!(
            server.claim_instance(),
            Err(LockError::InstanceActive { .. })
        ));

        drop(a);
        drop(b);
        let exclusive = server.claim_instance().unwrap();
        assert!(!exclusive.is_shared());
        assert!(matches!(
            one_shot.join_instance(),
            Err(LockError::InstanceActive { .. })
        ));
    }
}
