//! Task execution: scheduling, memory admission and output handling.
//!
//! [`Engine`] is the entry point. It routes each submitted task to the
//! general worker pool or the serial accelerated queue, admits it against
//! the memory budget and hands the result back through a [`TaskHandle`].

pub mod engine;
pub mod memory;
pub mod output;
pub mod progress;
pub mod scheduler;
pub mod task;

pub use engine::{BackendInfo, Engine, EngineStats};
pub use memory::{BufferPool, MemoryGuard, MemoryMonitor, MemoryReservation, MemoryState, MemoryStats};
pub use output::{fit_to_ceiling, write_output, OutputResize};
pub use progress::{CancellationToken, ProgressCallback, ProgressTracker, ProgressUpdate};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
pub use task::{CompletionCallback, TaskHandle, TaskId, TaskOutput, TaskRequest, TaskState};
