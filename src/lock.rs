//! Scoped file locks for the cache directory
//!
//! Several independent processes may read and write the same cache root, so
//! every file access goes through a lock:
//!
//! - Writers create a sidecar `<file>.lck` with create-new semantics. Exactly
//!   one writer can hold it; the lock file records the owner's pid and start
//!   time, and a lock whose owner has exited is reclaimed.
//! - Readers are non-exclusive. They only check for a writer's lock file and
//!   either fail immediately (`LockMode::NoWait`) or poll until it disappears
//!   (`LockMode::Wait`).
//!
//! A `FileLock` removes its lock file when dropped. Outstanding lock files are
//! also tracked in a `LockRegistry` so process shutdown can clean up locks
//! held by in-flight work.

use crate::cache::CacheError;
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

/// Extension appended to a file name to form its lock file.
pub const LOCK_EXTENSION: &str = "lck";

/// Interval between polls while waiting for a lock.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// How to behave when the lock is held by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Fail immediately.
    NoWait,
    /// Poll until the lock frees or the wait budget runs out.
    Wait,
}

/// What the lock holder intends to do with the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Shared read; creates no lock file.
    ReadOnly,
    /// Exclusive create of a file that does not exist yet.
    WriteCreate,
}

/// Caller-supplied hook receiving the lock files still outstanding at shutdown.
pub type QuitHook<'a> = &'a dyn Fn(&[PathBuf]);

/// Set of lock files currently held by this process.
#[derive(Debug, Clone, Default)]
pub struct LockRegistry {
    held: Arc<Mutex<BTreeSet<PathBuf>>>,
}

impl LockRegistry {
    /// Create an empty, private registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<LockRegistry> = OnceLock::new();
        GLOBAL.get_or_init(LockRegistry::new).clone()
    }

    fn held(&self) -> MutexGuard<'_, BTreeSet<PathBuf>> {
        // A poisoned set is still a valid set of paths.
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, lock_file: &Path) {
        self.held().insert(lock_file.to_path_buf());
    }

    fn unregister(&self, lock_file: &Path) {
        self.held().remove(lock_file);
    }

    /// Lock files currently held.
    pub fn outstanding(&self) -> Vec<PathBuf> {
        self.held().iter().cloned().collect()
    }

    /// Remove every outstanding lock file.
    ///
    /// Returns the number of lock files removed.
    pub fn cleanup(&self) -> usize {
        let paths: Vec<PathBuf> = std::mem::take(&mut *self.held()).into_iter().collect();
        let mut removed = 0;
        for path in &paths {
            match fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove lock file"),
            }
        }
        removed
    }

    /// Shutdown path: hand outstanding locks to `hook` if given, otherwise
    /// remove them.
    pub fn shutdown(&self, hook: Option<QuitHook<'_>>) {
        match hook {
            Some(hook) => {
                let paths = self.outstanding();
                hook(&paths);
            }
            None => {
                let removed = self.cleanup();
                if removed > 0 {
                    info!(removed, "cleaned up outstanding lock files");
                }
            }
        }
    }
}

/// Lock file path for a data file.
pub fn lock_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".");
    name.push(LOCK_EXTENSION);
    PathBuf::from(name)
}

/// A held lock. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    target: PathBuf,
    lock_file: Option<PathBuf>,
    registry: LockRegistry,
}

impl FileLock {
    /// Acquire a lock on `target`, blocking the thread while waiting.
    ///
    /// `wait` bounds how long `LockMode::Wait` polls before giving up.
    pub fn acquire(
        target: &Path,
        access: Access,
        mode: LockMode,
        wait: Duration,
        registry: &LockRegistry,
    ) -> Result<Self, CacheError> {
        let deadline = Instant::now() + wait;
        loop {
            match Self::attempt(target, access, registry)? {
                Ok(lock) => return Ok(lock),
                Err(reason) => check_retry(target, mode, wait, deadline, reason)?,
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Acquire a lock on `target`, waiting up to `wait` without blocking the
    /// async runtime.
    pub async fn acquire_waiting(
        target: &Path,
        access: Access,
        wait: Duration,
        registry: &LockRegistry,
    ) -> Result<Self, CacheError> {
        let deadline = Instant::now() + wait;
        loop {
            match Self::attempt(target, access, registry)? {
                Ok(lock) => return Ok(lock),
                Err(reason) => check_retry(target, LockMode::Wait, wait, deadline, reason)?,
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// One try. The outer `Result` is a hard I/O failure, the inner one is
    /// contention.
    fn attempt(
        target: &Path,
        access: Access,
        registry: &LockRegistry,
    ) -> Result<Result<Self, String>, CacheError> {
        let lock_file = lock_path(target);
        let created = match access {
            Access::ReadOnly => match holder(&lock_file) {
                Holding::Free => None,
                Holding::Held(reason) => return Ok(Err(reason)),
            },
            Access::WriteCreate => match try_create(&lock_file, target)? {
                Ok(created) => Some(created),
                Err(reason) => return Ok(Err(reason)),
            },
        };

        if let Some(created) = &created {
            registry.register(created);
            debug!(path = %target.display(), "acquired write lock");
        }
        Ok(Ok(Self {
            target: target.to_path_buf(),
            lock_file: created,
            registry: registry.clone(),
        }))
    }

    /// The locked data file.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Whether this is an exclusive (writer) lock.
    pub fn is_exclusive(&self) -> bool {
        self.lock_file.is_some()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(lock_file) = self.lock_file.take() {
            if let Err(e) = fs::remove_file(&lock_file) {
                if e.kind() != ErrorKind::NotFound {
                    warn!(path = %lock_file.display(), error = %e, "failed to release lock");
                }
            }
            self.registry.unregister(&lock_file);
        }
    }
}

/// Turn contention into an error unless another poll is allowed.
fn check_retry(
    target: &Path,
    mode: LockMode,
    wait: Duration,
    deadline: Instant,
    reason: String,
) -> Result<(), CacheError> {
    if mode == LockMode::NoWait {
        return Err(CacheError::LockUnavailable {
            path: target.to_path_buf(),
            reason,
        });
    }
    if Instant::now() >= deadline {
        return Err(CacheError::LockUnavailable {
            path: target.to_path_buf(),
            reason: format!("timed out after {:?}: {}", wait, reason),
        });
    }
    Ok(())
}

/// Create the lock file. A lock file left by a dead process is removed and
/// creation retried once.
fn try_create(lock_file: &Path, target: &Path) -> Result<Result<PathBuf, String>, CacheError> {
    for _ in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(lock_file) {
            Ok(mut file) => {
                // Owner identity is informational; a failed write still holds the lock.
                let owner = ProcessId::own();
                let _ = write!(file, "{}\n{}\n", owner.pid, owner.start_time);
                return Ok(Ok(lock_file.to_path_buf()));
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => match holder(lock_file) {
                Holding::Free => continue,
                Holding::Held(reason) => return Ok(Err(reason)),
            },
            Err(source) => {
                return Err(CacheError::Io {
                    path: target.to_path_buf(),
                    source,
                })
            }
        }
    }
    Ok(Err(format!("lock file contended ({})", lock_file.display())))
}

enum Holding {
    Free,
    Held(String),
}

/// Who holds `lock_file`. A lock whose owner process is gone is stale and is
/// removed on the spot.
fn holder(lock_file: &Path) -> Holding {
    let contents = match fs::read_to_string(lock_file) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Holding::Free,
        Err(_) => return Holding::Held(format!("lock file present ({})", lock_file.display())),
    };

    // An empty file is a writer between create and pid write
    let Some(owner) = ProcessId::parse(&contents) else {
        return Holding::Held(format!("lock file present ({})", lock_file.display()));
    };
    if owner.is_active() {
        return Holding::Held(format!(
            "locked by process {} ({})",
            owner.pid,
            lock_file.display()
        ));
    }

    warn!(path = %lock_file.display(), pid = owner.pid, "removing stale lock of exited process");
    match fs::remove_file(lock_file) {
        Ok(()) => Holding::Free,
        Err(e) if e.kind() == ErrorKind::NotFound => Holding::Free,
        Err(e) => Holding::Held(format!("stale lock could not be removed: {}", e)),
    }
}

/// Process identity recorded in a lock file. The start time tells a live
/// owner apart from a later process that reused its pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcessId {
    pid: u32,
    /// Zero when unknown
    start_time: u64,
}

impl ProcessId {
    fn own() -> Self {
        static OWN: OnceLock<ProcessId> = OnceLock::new();
        *OWN.get_or_init(|| {
            let pid = std::process::id();
            Self {
                pid,
                start_time: process_start_time(pid).unwrap_or(0),
            }
        })
    }

    fn parse(contents: &str) -> Option<Self> {
        let mut lines = contents.lines().map(str::trim);
        let pid = lines.next()?.parse().ok()?;
        let start_time = lines.next().and_then(|l| l.parse().ok()).unwrap_or(0);
        Some(Self { pid, start_time })
    }

    fn is_active(&self) -> bool {
        if self.pid == std::process::id() {
            return true;
        }
        match process_start_time(self.pid) {
            Some(started) => self.start_time == 0 || started == self.start_time,
            None => false,
        }
    }
}

fn process_start_time(pid: u32) -> Option<u64> {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::Some(&[pid]), ProcessRefreshKind::new());
    system.process(pid).map(|p| p.start_time())
}
