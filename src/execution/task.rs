//! Task identity, lifecycle state and completion handles.

use crate::core::error::{EngineError, EngineResult};
use crate::core::types::{BackendKind, DitherKind, ProcessingParams, ProcessorPreference};
use crate::execution::progress::{ProgressCallback, ProgressUpdate};
use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use image::RgbaImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Fold the id into a 32-bit noise seed.
    pub fn seed(&self) -> u32 {
        let v = self.0.as_u128();
        (v ^ (v >> 32) ^ (v >> 64) ^ (v >> 96)) as u32
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted by the engine, not yet routed.
    Submitted,
    /// Waiting in a backend queue.
    Queued,
    /// A worker is processing it.
    Running,
    /// Finished with an output.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before or during processing.
    Cancelled,
}

impl TaskState {
    /// Check if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }

    fn allows(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Submitted, Queued) => true,
            (Queued, Running) => true,
            (Running, Queued) => true,
            (Running, Completed) | (Running, Failed) => true,
            (Submitted, Failed) | (Queued, Failed) => true,
            (s, Cancelled) => !s.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Submitted => "submitted",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Shared state cell observed by the handle and updated by workers.
#[derive(Debug)]
pub struct TaskStatus {
    state: Mutex<TaskState>,
    fallback_used: Mutex<bool>,
}

impl TaskStatus {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TaskState::Submitted),
            fallback_used: Mutex::new(false),
        }
    }

    /// Current state.
    pub fn get(&self) -> TaskState {
        *self.state.lock()
    }

    /// Check if the task was moved to the general path after a failure.
    pub fn fell_back(&self) -> bool {
        *self.fallback_used.lock()
    }

    /// Move to `next` if the transition is legal. Returns whether it happened.
    pub(crate) fn advance(&self, next: TaskState) -> bool {
        let mut state = self.state.lock();
        if !state.allows(next) {
            return false;
        }
        if *state == TaskState::Running && next == TaskState::Queued {
            let mut used = self.fallback_used.lock();
            if *used {
                return false;
            }
            *used = true;
        }
        *state = next;
        true
    }
}

/// A successful task result.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    /// Task that produced this output.
    pub id: TaskId,
    /// Mapped image.
    pub image: RgbaImage,
    /// Backend that produced the image.
    pub backend: BackendKind,
    /// Number of stripes the image was processed in.
    pub stripes: usize,
    /// Dither actually applied.
    pub effective_dither: DitherKind,
    /// Whether an accelerated failure moved the task to the general path.
    pub fell_back: bool,
    /// Wall time from first start to completion.
    pub duration: Duration,
}

/// Callback invoked once with the final result, before the handle receives it.
pub type CompletionCallback = Arc<dyn Fn(TaskId, &EngineResult<TaskOutput>) + Send + Sync>;

/// Everything needed to run one image through the engine.
#[derive(Clone)]
pub struct TaskRequest {
    /// Identifier assigned at construction.
    pub id: TaskId,
    /// Source image.
    pub image: Arc<RgbaImage>,
    /// Mapping parameters.
    pub params: ProcessingParams,
    /// Backend preference overriding the engine default.
    pub preferred: Option<ProcessorPreference>,
    /// Noise seed for random dither and grain. Derived from the id when unset.
    pub seed: Option<u32>,
    /// Progress sink.
    pub on_progress: Option<ProgressCallback>,
    /// Completion sink.
    pub on_complete: Option<CompletionCallback>,
}

impl TaskRequest {
    /// Create a request with default routing.
    pub fn new(image: impl Into<Arc<RgbaImage>>, params: ProcessingParams) -> Self {
        Self {
            id: TaskId::new(),
            image: image.into(),
            params,
            preferred: None,
            seed: None,
            on_progress: None,
            on_complete: None,
        }
    }

    /// Route to a specific backend preference.
    pub fn with_preference(mut self, preferred: ProcessorPreference) -> Self {
        self.preferred = Some(preferred);
        self
    }

    /// Fix the noise seed.
    pub fn with_seed(mut self, seed: u32) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Receive progress updates.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    /// Receive the final result through a callback.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(TaskId, &EngineResult<TaskOutput>) + Send + Sync + 'static,
    {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    /// Seed used for noise.
    pub fn effective_seed(&self) -> u32 {
        self.seed.unwrap_or_else(|| self.id.seed())
    }
}

impl fmt::Debug for TaskRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRequest")
            .field("id", &self.id)
            .field("dimensions", &self.image.dimensions())
            .field("params", &self.params)
            .field("preferred", &self.preferred)
            .field("seed", &self.seed)
            .field("on_progress", &self.on_progress.as_ref().map(|_| "<callback>"))
            .field("on_complete", &self.on_complete.as_ref().map(|_| "<callback>"))
            .finish()
    }
}

/// Non-blocking handle to a submitted task.
pub struct TaskHandle {
    id: TaskId,
    status: Arc<TaskStatus>,
    receiver: Receiver<EngineResult<TaskOutput>>,
}

impl TaskHandle {
    pub(crate) fn new(
        id: TaskId,
        status: Arc<TaskStatus>,
        receiver: Receiver<EngineResult<TaskOutput>>,
    ) -> Self {
        Self { id, status, receiver }
    }

    /// The task's id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.status.get()
    }

    /// Check if the task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.status.get().is_terminal()
    }

    /// Block until the result is available.
    pub fn wait(self) -> EngineResult<TaskOutput> {
        self.receiver.recv().unwrap_or(Err(EngineError::ShutDown))
    }

    /// Take the result if it is ready.
    pub fn try_result(&self) -> Option<EngineResult<TaskOutput>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(EngineError::ShutDown)),
        }
    }

    /// Wait up to `timeout` for the result.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<EngineResult<TaskOutput>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(EngineError::ShutDown)),
        }
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;

    #[test]
    fn test_task_id_unique() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 36);
    }

    #[test]
    fn test_state_happy_path() {
        let status = TaskStatus::new();
        assert!(status.advance(TaskState::Queued));
        assert!(status.advance(TaskState::Running));
        assert!(status.advance(TaskState::Completed));
        assert!(!status.advance(TaskState::Cancelled));
        assert_eq!(status.get(), TaskState::Completed);
    }

    #[test]
    fn test_requeue_allowed_once() {
        let status = TaskStatus::new();
        status.advance(TaskState::Queued);
        status.advance(TaskState::Running);
        assert!(status.advance(TaskState::Queued));
        assert!(status.fell_back());
        status.advance(TaskState::Running);
        assert!(!status.advance(TaskState::Queued));
        assert!(status.advance(TaskState::Failed));
    }

    #[test]
    fn test_illegal_skip() {
        let status = TaskStatus::new();
        assert!(!status.advance(TaskState::Running));
        assert!(!status.advance(TaskState::Completed));
        assert!(status.advance(TaskState::Cancelled));
    }

    #[test]
    fn test_handle_reports_shutdown_when_sender_dropped() {
        let (tx, rx) = bounded::<EngineResult<TaskOutput>>(1);
        let handle = TaskHandle::new(TaskId::new(), Arc::new(TaskStatus::new()), rx);
        assert!(handle.try_result().is_none());
        drop(tx);
        assert!(matches!(handle.wait(), Err(EngineError::ShutDown)));
    }

    #[test]
    fn test_wait_timeout_elapses() {
        let (_tx, rx) = bounded::<EngineResult<TaskOutput>>(1);
        let handle = TaskHandle::new(TaskId::new(), Arc::new(TaskStatus::new()), rx);
        assert!(handle.wait_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_request_seed_defaults_to_id() {
        let request = TaskRequest::new(RgbaImage::new(1, 1), ProcessingParams::default());
        assert_eq!(request.effective_seed(), request.id.seed());
        assert_eq!(request.clone().with_seed(9).effective_seed(), 9);
    }
}
