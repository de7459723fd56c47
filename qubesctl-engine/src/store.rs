//! Registry persistence and the exclusive lock around it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::registry::Registry;

/// Default time to wait for the registry lock.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 10_000;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Where the registry lives and how it is locked.
pub trait RegistryStore {
    /// Take the exclusive registry lock. Released when the guard drops.
    fn lock_exclusive(&self) -> Result<RegistryLock, RegistryError>;

    /// Read the registry. A missing registry is empty.
    fn load(&self) -> Result<Registry, RegistryError>;

    /// Persist the registry.
    fn save(&self, registry: &Registry) -> Result<(), RegistryError>;
}

/// Guard for the exclusive registry lock.
#[derive(Debug)]
pub struct RegistryLock {
    inner: LockInner,
}

#[derive(Debug)]
enum LockInner {
    File { file: File, path: PathBuf },
    Flag(Arc<AtomicBool>),
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        match &self.inner {
            LockInner::File { file, path } => {
                // Release the flock; the lock file itself stays for the next holder.
                unsafe {
                    libc::flock(file.as_raw_fd(), libc::LOCK_UN);
                }
                debug!(path = %path.display(), "Registry lock released");
            }
            LockInner::Flag(flag) => flag.store(false, Ordering::Release),
        }
    }
}

// =============================================================================
// FILE STORE
// =============================================================================

/// Registry kept as a JSON file, locked through a `.lock` file beside it.
pub struct FileRegistryStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl FileRegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn io_error(path: &Path, source: std::io::Error) -> RegistryError {
        RegistryError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn ensure_parent(&self) -> Result<(), RegistryError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| Self::io_error(parent, e))?;
            }
        }
        Ok(())
    }
}

impl RegistryStore for FileRegistryStore {
    fn lock_exclusive(&self) -> Result<RegistryLock, RegistryError> {
        self.ensure_parent()?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| Self::io_error(&self.lock_path, e))?;

        let fd = file.as_raw_fd();
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            let ret = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if ret == 0 {
                debug!(path = %self.lock_path.display(), "Registry lock acquired");
                return Ok(RegistryLock {
                    inner: LockInner::File {
                        file,
                        path: self.lock_path.clone(),
                    },
                });
            }

            if Instant::now() >= deadline {
                warn!(path = %self.lock_path.display(), "Registry lock timeout");
                return Err(RegistryError::LockTimeout {
                    path: self.lock_path.clone(),
                    timeout_ms: self.lock_timeout.as_millis() as u64,
                });
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    fn load(&self) -> Result<Registry, RegistryError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No registry file yet, starting empty");
                return Ok(Registry::new());
            }
            Err(e) => return Err(Self::io_error(&self.path, e)),
        };

        let registry: Registry =
            serde_json::from_slice(&bytes).map_err(|source| RegistryError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        debug!(path = %self.path.display(), vms = registry.len(), "Registry loaded");
        Ok(registry)
    }

    fn save(&self, registry: &Registry) -> Result<(), RegistryError> {
        self.ensure_parent()?;

        let json = serde_json::to_vec_pretty(registry).map_err(|source| RegistryError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        // Write beside the target and rename over it so readers never see a partial file.
        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut file = File::create(&tmp_path).map_err(|e| Self::io_error(&tmp_path, e))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| Self::io_error(&tmp_path, e))?;
        std::fs::rename(&tmp_path, &self.path).map_err(|e| Self::io_error(&self.path, e))?;

        info!(path = %self.path.display(), vms = registry.len(), "Registry saved");
        Ok(())
    }
}

// =============================================================================
// MEMORY STORE
// =============================================================================

/// Registry kept in memory.
///
/// The lock is a flag: taking it twice without dropping the first guard
/// fails immediately with [`RegistryError::LockTimeout`].
#[derive(Default)]
pub struct MemoryRegistryStore {
    registry: Mutex<Registry>,
    locked: Arc<AtomicBool>,
    saves: Mutex<usize>,
}

impl MemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry: Mutex::new(registry),
            ..Self::default()
        }
    }

    /// Current persisted registry.
    pub fn snapshot(&self) -> Registry {
        self.registry
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Number of successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.lock().map(|s| *s).unwrap_or(0)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    fn poisoned() -> RegistryError {
        RegistryError::Io {
            path: PathBuf::from("<memory>"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "lock poisoned"),
        }
    }
}

impl RegistryStore for MemoryRegistryStore {
    fn lock_exclusive(&self) -> Result<RegistryLock, RegistryError> {
        if self.locked.swap(true, Ordering::AcqRel) {
            return Err(RegistryError::LockTimeout {
                path: PathBuf::from("<memory>"),
                timeout_ms: 0,
            });
        }
        Ok(RegistryLock {
            inner: LockInner::Flag(Arc::clone(&self.locked)),
        })
    }

    fn load(&self) -> Result<Registry, RegistryError> {
        self.registry
            .lock()
            .map(|r| r.clone())
            .map_err(|_| Self::poisoned())
    }

    fn save(&self, registry: &Registry) -> Result<(), RegistryError> {
        let mut stored = self.registry.lock().map_err(|_| Self::poisoned())?;
        *stored = registry.clone();
        let mut saves = self.saves.lock().map_err(|_| Self::poisoned())?;
        *saves += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::record;
    use qubesctl_hypervisor::VmKind;

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRegistryStore::new(dir.path().join("qubes.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRegistryStore::new(dir.path().join("state").join("qubes.json"));

        let mut registry = Registry::new();
        registry.insert(record(1, "fedora-23", VmKind::TemplateVm)).unwrap();
        registry.set_default_template(Some(1)).unwrap();
        store.save(&registry).unwrap();

        assert_eq!(store.load().unwrap(), registry);
        assert!(!dir.path().join("state").join("qubes.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qubes.json");
        std::fs::write(&path, b"{not json").unwrap();

        let err = FileRegistryStore::new(&path).load().unwrap_err();
        assert!(matches!(err, RegistryError::Corrupt { .. }));
    }

    #[test]
    fn test_file_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("qubes.json");
        let store = FileRegistryStore::new(&path).with_lock_timeout(Duration::from_millis(120));
        // A second store opens its own descriptor, like a second process would.
        let other = FileRegistryStore::new(&path).with_lock_timeout(Duration::from_millis(120));

        let guard = store.lock_exclusive().unwrap();
        let err = other.lock_exclusive().unwrap_err();
        assert!(matches!(err, RegistryError::LockTimeout { .. }));

        drop(guard);
        other.lock_exclusive().unwrap();
    }

    #[test]
    fn test_memory_store_lock_and_saves() {
        let store = MemoryRegistryStore::new();
        {
            let _guard = store.lock_exclusive().unwrap();
            assert!(store.is_locked());
            assert!(store.lock_exclusive().is_err());
        }
        assert!(!store.is_locked());

        let mut registry = store.load().unwrap();
        registry.insert(record(1, "work", VmKind::AppVm)).unwrap();
        store.save(&registry).unwrap();
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.snapshot().len(), 1);
    }
}
