//! Process-wide registry of temporary paths created for a session.
//!
//! Proxy directories and secrets intermediates register themselves here when
//! created and unregister once they have removed themselves. Whatever is left
//! at exit, or when a signal interrupts the run, is removed by [`purge`].
//!
//! [`purge`]: TempResourceRegistry::purge

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use once_cell::sync::Lazy;

static GLOBAL: Lazy<TempResourceRegistry> = Lazy::new(TempResourceRegistry::new);

/// Append-only list of temp paths, protected by a mutex.
#[derive(Debug, Default)]
pub struct TempResourceRegistry {
    paths: Mutex<Vec<PathBuf>>,
}

impl TempResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process.
    pub fn global() -> &'static TempResourceRegistry {
        &GLOBAL
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        // A panic while holding the lock cannot leave the list inconsistent.
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a path for cleanup.
    pub fn register(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        debug!("Registered temp resource {:?}", path);
        let mut paths = self.lock();
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    /// Stop tracking a path that its owner already removed.
    pub fn unregister(&self, path: &Path) -> bool {
        let mut paths = self.lock();
        let before = paths.len();
        paths.retain(|p| p != path);
        paths.len() != before
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().iter().any(|p| p == path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove every tracked path. Failures are logged and never escalate.
    ///
    /// Returns the number of paths that were removed (or were already gone).
    pub fn purge(&self) -> usize {
        let paths = std::mem::take(&mut *self.lock());
        let mut removed = 0;

        // Newest first, so files registered inside a registered directory go
        // before the directory itself.
        for path in paths.iter().rev() {
            match remove_path(path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove temp resource {:?}: {}", path, e),
            }
        }

        if removed > 0 {
            debug!("Purged {} temp resource(s)", removed);
        }
        removed
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };

    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_deduplicated() {
        let registry = TempResourceRegistry::new();
        registry.register("/tmp/agentpod-a");
        registry.register("/tmp/agentpod-a");
        registry.register("/tmp/agentpod-b");
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(Path::new("/tmp/agentpod-b")));
    }

    #[test]
    fn test_unregister() {
        let registry = TempResourceRegistry::new();
        registry.register("/tmp/agentpod-a");
        assert!(registry.unregister(Path::new("/tmp/agentpod-a")));
        assert!(!registry.unregister(Path::new("/tmp/agentpod-a")));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_purge_removes_files_and_dirs() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("proxy");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("agent.sock"), b"").unwrap();
        let file = root.path().join("secrets");
        std::fs::write(&file, b"x").unwrap();

        let registry = TempResourceRegistry::new();
        registry.register(&dir);
        registry.register(&file);
        registry.register(root.path().join("already-gone"));

        assert_eq!(registry.purge(), 3);
        assert!(!dir.exists());
        assert!(!file.exists());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_purge_twice_is_harmless() {
        let registry = TempResourceRegistry::new();
        assert_eq!(registry.purge(), 0);
        assert_eq!(registry.purge(), 0);
    }
}
