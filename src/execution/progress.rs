//! Progress reporting and cooperative cancellation for tasks.

use crate::core::types::BackendKind;
use crate::execution::task::TaskId;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared cancellation flag.
///
/// Clones observe the same flag. Workers check it before a queued task
/// starts and between stripes.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Create an unsignalled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A progress update event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// The task was accepted by a backend queue.
    Queued {
        /// Task concerned.
        task_id: TaskId,
        /// Queue it joined.
        backend: BackendKind,
    },
    /// A worker picked the task up.
    Started {
        /// Task concerned.
        task_id: TaskId,
        /// Backend running it.
        backend: BackendKind,
        /// Status line for display.
        message: String,
    },
    /// A stripe finished.
    Stripe {
        /// Task concerned.
        task_id: TaskId,
        /// Stripes done so far.
        completed: usize,
        /// Stripes in the plan.
        total: usize,
    },
    /// The accelerated attempt failed and the task moved to the general path.
    Fallback {
        /// Task concerned.
        task_id: TaskId,
        /// Status line for display.
        message: String,
    },
    /// The task produced an output.
    Completed {
        /// Task concerned.
        task_id: TaskId,
        /// Wall time since start.
        duration_ms: u64,
    },
    /// The task failed.
    Failed {
        /// Task concerned.
        task_id: TaskId,
        /// Error text.
        message: String,
    },
    /// The task was cancelled.
    Cancelled {
        /// Task concerned.
        task_id: TaskId,
    },
}

/// Callback type for progress updates.
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Human-readable status line for a backend starting work.
pub fn status_message(backend: BackendKind) -> &'static str {
    match backend {
        BackendKind::General => "Processing on CPU...",
        BackendKind::Accelerated => "Processing on GPU...",
    }
}

/// Status line shown when a task falls back to the general path.
pub const FALLBACK_MESSAGE: &str = "Fallback to CPU processing...";

/// Tracks one task's progress and forwards updates to its callback.
pub struct ProgressTracker {
    task_id: TaskId,
    callback: Option<ProgressCallback>,
    start_time: Mutex<Option<Instant>>,
    stripes: Mutex<(usize, usize)>,
}

impl ProgressTracker {
    /// Create a tracker for a task.
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            callback: None,
            start_time: Mutex::new(None),
            stripes: Mutex::new((0, 0)),
        }
    }

    /// Set a callback for progress updates.
    pub fn with_callback(mut self, callback: Option<ProgressCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// The task being tracked.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Report acceptance by a queue.
    pub fn queued(&self, backend: BackendKind) {
        self.send_update(ProgressUpdate::Queued {
            task_id: self.task_id,
            backend,
        });
    }

    /// Report that a worker started the task.
    pub fn started(&self, backend: BackendKind) {
        self.start_time.lock().get_or_insert_with(Instant::now);
        *self.stripes.lock() = (0, 0);
        self.send_update(ProgressUpdate::Started {
            task_id: self.task_id,
            backend,
            message: status_message(backend).to_string(),
        });
    }

    /// Report a finished stripe.
    pub fn stripe_done(&self, completed: usize, total: usize) {
        *self.stripes.lock() = (completed, total);
        self.send_update(ProgressUpdate::Stripe {
            task_id: self.task_id,
            completed,
            total,
        });
    }

    /// Report a fallback to the general path.
    pub fn fallback(&self) {
        self.send_update(ProgressUpdate::Fallback {
            task_id: self.task_id,
            message: FALLBACK_MESSAGE.to_string(),
        });
    }

    /// Report successful completion.
    pub fn completed(&self) {
        self.send_update(ProgressUpdate::Completed {
            task_id: self.task_id,
            duration_ms: self.elapsed_ms(),
        });
    }

    /// Report a failure.
    pub fn failed(&self, message: String) {
        self.send_update(ProgressUpdate::Failed {
            task_id: self.task_id,
            message,
        });
    }

    /// Report cancellation.
    pub fn cancelled(&self) {
        self.send_update(ProgressUpdate::Cancelled {
            task_id: self.task_id,
        });
    }

    /// Get current progress percentage of the running attempt.
    pub fn progress_percent(&self) -> f32 {
        let (completed, total) = *self.stripes.lock();
        if total == 0 {
            return 0.0;
        }
        completed as f32 / total as f32 * 100.0
    }

    /// Milliseconds since the task first started.
    pub fn elapsed_ms(&self) -> u64 {
        self.start_time
            .lock()
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    fn send_update(&self, update: ProgressUpdate) {
        if let Some(ref callback) = self.callback {
            callback(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_token_is_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_progress_calculation() {
        let tracker = ProgressTracker::new(TaskId::new());
        assert_eq!(tracker.progress_percent(), 0.0);
        tracker.started(BackendKind::General);
        tracker.stripe_done(1, 4);
        assert_eq!(tracker.progress_percent(), 25.0);
        tracker.stripe_done(4, 4);
        assert_eq!(tracker.progress_percent(), 100.0);
    }

    #[test]
    fn test_callback_receives_updates_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = TaskId::new();
        let tracker = ProgressTracker::new(id).with_callback(Some(Arc::new(move |u| sink.lock().push(u))));

        tracker.queued(BackendKind::Accelerated);
        tracker.started(BackendKind::Accelerated);
        tracker.fallback();
        tracker.started(BackendKind::General);
        tracker.completed();

        let seen = seen.lock();
        assert_eq!(seen.len(), 5);
        assert_eq!(
            seen[1],
            ProgressUpdate::Started {
                task_id: id,
                backend: BackendKind::Accelerated,
                message: "Processing on GPU...".to_string()
            }
        );
        assert_eq!(
            seen[2],
            ProgressUpdate::Fallback {
                task_id: id,
                message: "Fallback to CPU processing...".to_string()
            }
        );
        assert!(matches!(seen[4], ProgressUpdate::Completed { .. }));
    }
}
