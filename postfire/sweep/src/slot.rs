//! The engine's fixed output location as a single-writer resource.

use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::sync::{Mutex, MutexGuard};

/// A location only one invocation may write at a time.
#[derive(Debug)]
pub struct OutputSlot {
    path: PathBuf,
    lock: Mutex<()>,
}

impl OutputSlot {
    /// Creates a slot for `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Guarded location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for exclusive use of the slot. The slot is released when the
    /// guard drops.
    pub async fn acquire(&self) -> SlotGuard<'_> {
        SlotGuard {
            path: &self.path,
            _lock: self.lock.lock().await,
        }
    }
}

/// Exclusive access to an [`OutputSlot`] for one clear/invoke/relocate cycle.
pub struct SlotGuard<'a> {
    path: &'a Path,
    _lock: MutexGuard<'a, ()>,
}

impl SlotGuard<'_> {
    /// Guarded location.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.path
    }

    /// Removes output left behind by an earlier invocation.
    pub fn clear_stale(&self) -> io::Result<bool> {
        match std::fs::remove_file(self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Moves the slot content to `destination`. Returns `false` when the slot
    /// is empty.
    pub fn relocate_to(&self, destination: &Path) -> io::Result<bool> {
        if !self.path.is_file() {
            return Ok(false);
        }
        relocate(self.path, destination)?;
        Ok(true)
    }
}

/// Moves `source` to `destination`, creating parent directories and replacing
/// an existing file. Falls back to copy and remove when a rename is refused
/// (different filesystems).
pub fn relocate(source: &Path, destination: &Path) -> io::Result<()> {
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if std::fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    std::fs::copy(source, destination)?;
    std::fs::remove_file(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};
    use tempfile::tempdir;

    #[test]
    fn guard_clears_and_relocates() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let dir = tempdir().unwrap();
        let slot = OutputSlot::new(dir.path().join("engine/output.csv"));
        rt.block_on(async {
            let guard = slot.acquire().await;
            assert!(!guard.clear_stale().unwrap());
            assert!(!guard.relocate_to(&dir.path().join("results/a.csv")).unwrap());

            std::fs::create_dir_all(dir.path().join("engine")).unwrap();
            std::fs::write(guard.path(), "step\n0\n").unwrap();
            assert!(guard.relocate_to(&dir.path().join("results/a.csv")).unwrap());
        });
        assert!(!slot.path().exists());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("results/a.csv")).unwrap(),
            "step\n0\n"
        );
    }

    #[test]
    fn relocate_replaces_existing_destination() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("out.csv");
        let destination = dir.path().join("results/a.csv");
        std::fs::create_dir_all(destination.parent().unwrap()).unwrap();
        std::fs::write(&destination, "old").unwrap();
        std::fs::write(&source, "new").unwrap();
        relocate(&source, &destination).unwrap();
        assert_eq!(std::fs::read_to_string(&destination).unwrap(), "new");
        assert!(!source.exists());
    }

    #[test]
    fn slot_admits_one_holder_at_a_time() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let slot = Arc::new(OutputSlot::new("unused.csv"));
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        rt.block_on(async {
            let tasks: Vec<_> = (0..4)
                .map(|_| {
                    let slot = Arc::clone(&slot);
                    let active = Arc::clone(&active);
                    let peak = Arc::clone(&peak);
                    tokio::spawn(async move {
                        let _guard = slot.acquire().await;
                        let now = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                        peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    })
                })
                .collect();
            for task in tasks {
                task.await.unwrap();
            }
        });
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
