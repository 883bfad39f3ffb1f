use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    Stopped = 0,
    Running = 1,
    Cancelled = 2,
}

impl WorkerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => WorkerStatus::Running,
            2 => WorkerStatus::Cancelled,
            _ => WorkerStatus::Stopped,
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Running => "running",
            WorkerStatus::Cancelled => "cancelled",
        })
    }
}

/// Shared, lock-free view of a task worker's status.
///
/// Clones observe the same state. [`StatusHandle::cancel`] only touches an
/// atomic, so it is safe to call from signal listeners and other threads
/// while a run is in progress.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    state: Arc<AtomicU8>,
}

impl Default for StatusHandle {
    fn default() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(WorkerStatus::Stopped as u8)),
        }
    }
}

impl StatusHandle {
    pub fn get(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.get() == WorkerStatus::Running
    }

    /// Move `running` to `cancelled`. Returns whether this call did so;
    /// any other state is left untouched.
    pub fn cancel(&self) -> bool {
        self.state
            .compare_exchange(
                WorkerStatus::Running as u8,
                WorkerStatus::Cancelled as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub(crate) fn set(&self, status: WorkerStatus) {
        self.state.store(status as u8, Ordering::SeqCst);
    }
}

/// Resets the status to `stopped` when dropped, including during unwinding.
pub(crate) struct StopOnDrop<'a>(pub(crate) &'a StatusHandle);

impl Drop for StopOnDrop<'_> {
    fn drop(&mut self) {
        self.0.set(WorkerStatus::Stopped);
    }
}
