//! Cross-process mutual exclusion for model access.
//!
//! Each orchestrator run owns a lock directory. Both task processes open
//! the same directory and take an exclusive advisory lock on a per-model
//! file before touching that model, so an inference never reads weights a
//! download is replacing. Locks are released by the OS if the holder dies.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use sha1::{Digest, Sha1};

/// Handle to one run's lock directory. Cheap to recreate in another
/// process with [`ModelMutex::open`].
#[derive(Debug, Clone)]
pub struct ModelMutex {
    dir: PathBuf,
}

/// Held lock on one model. Released on drop.
#[derive(Debug)]
pub struct ModelGuard {
    file: File,
    model_id: String,
}

impl ModelMutex {
    /// Create a fresh, uniquely named lock directory under `parent`.
    pub fn create(parent: &Path) -> io::Result<Self> {
        let dir = parent.join(format!(
            "run-{}-{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&dir)?;
        log::debug!("[MUTEX] Created lock directory {}", dir.display());
        Ok(Self { dir })
    }

    /// Attach to a directory created by another process.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        if !dir.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("lock directory {} does not exist", dir.display()),
            ));
        }
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Block until this process holds the lock for `model_id`.
    pub fn acquire(&self, model_id: &str) -> io::Result<ModelGuard> {
        let path = self.dir.join(lock_file_name(model_id));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        FileExt::lock_exclusive(&file)?;
        log::debug!("[MUTEX] Acquired lock for model {model_id}");
        Ok(ModelGuard {
            file,
            model_id: model_id.to_string(),
        })
    }

    /// Delete the lock directory. Only the creating process should call this,
    /// after every task process has exited.
    pub fn remove(self) -> io::Result<()> {
        match std::fs::remove_dir_all(&self.dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

impl ModelGuard {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ModelGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            log::warn!("[MUTEX] Failed to unlock model {}: {e}", self.model_id);
        }
    }
}

// Model ids contain `/` and other characters that are not file-name safe.
fn lock_file_name(model_id: &str) -> String {
    let digest = Sha1::digest(model_id.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{hex}.lock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_lock_file_name_is_stable_and_safe() {
        let name = lock_file_name("stabilityai/sdxl-turbo");
        assert_eq!(name, lock_file_name("stabilityai/sdxl-turbo"));
        assert_ne!(name, lock_file_name("stabilityai/sdxl"));
        assert!(!name.contains('/'));
        assert_eq!(name.len(), 40 + ".lock".len());
    }

    #[test]
    fn test_holders_never_overlap() {
        let parent = tempfile::tempdir().unwrap();
        let mutex = ModelMutex::create(parent.path()).unwrap();
        let holders = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                // A separate open per thread, like a separate process would have.
                let mutex = ModelMutex::open(mutex.dir()).unwrap();
                let holders = holders.clone();
                let max_seen = max_seen.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        let guard = mutex.acquire("gpt2").unwrap();
                        let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(1));
                        holders.fetch_sub(1, Ordering::SeqCst);
                        guard.release();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        let dir = mutex.dir().to_path_buf();
        mutex.remove().unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn test_second_acquire_waits_for_release() {
        let parent = tempfile::tempdir().unwrap();
        let mutex = ModelMutex::create(parent.path()).unwrap();
        let guard = mutex.acquire("m").unwrap();

        let other = ModelMutex::open(mutex.dir()).unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let waiter = thread::spawn(move || {
            let guard = other.acquire("m").unwrap();
            tx.send(()).unwrap();
            drop(guard);
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(guard);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        waiter.join().unwrap();

        mutex.remove().unwrap();
    }

    #[test]
    fn test_different_models_do_not_block() {
        let parent = tempfile::tempdir().unwrap();
        let mutex = ModelMutex::create(parent.path()).unwrap();
        let a = mutex.acquire("model-a").unwrap();
        let other = ModelMutex::open(mutex.dir()).unwrap();
        let b = thread::spawn(move || other.acquire("model-b").map(|g| g.model_id().to_string()));
        assert_eq!(b.join().unwrap().unwrap(), "model-b");
        drop(a);
        mutex.remove().unwrap();
    }

    #[test]
    fn test_open_missing_dir_fails() {
        assert!(ModelMutex::open("/nonexistent/node-worker-locks").is_err());
    }
}
