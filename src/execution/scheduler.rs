//! Two-domain task scheduler.
//!
//! The general domain is a fixed pool of worker threads draining one
//! unbounded queue, so at most `max_general_concurrency` tasks run at once.
//! The accelerated domain is a single worker draining a FIFO; a task that
//! fails there is requeued once on the general domain.

use crate::backend::{Backend, ProcessContext};
use crate::core::error::{EngineError, EngineResult};
use crate::core::types::{BackendKind, ProcessorPreference};
use crate::execution::memory::{estimate_task_bytes, BufferPool, MemoryGuard, MemoryReservation};
use crate::execution::progress::{CancellationToken, ProgressTracker};
use crate::execution::task::{TaskHandle, TaskId, TaskOutput, TaskRequest, TaskState, TaskStatus};
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Scheduler tuning taken from the engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// General worker count.
    pub general_workers: usize,
    /// Stripe threshold for the general backend.
    pub general_stripe_pixels: u64,
    /// Stripe threshold for the accelerated backend.
    pub accelerated_stripe_pixels: u64,
}

/// Scheduler counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Tasks accepted.
    pub submitted: u64,
    /// Tasks finished with an output.
    pub completed: u64,
    /// Tasks finished with an error.
    pub failed: u64,
    /// Tasks cancelled.
    pub cancelled: u64,
    /// Accelerated failures moved to the general domain.
    pub fallbacks: u64,
    /// Tasks currently registered.
    pub active: usize,
    /// General tasks running right now.
    pub general_running: usize,
    /// Most general tasks ever running at once.
    pub general_peak: usize,
}

struct Job {
    request: TaskRequest,
    status: Arc<TaskStatus>,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
    reservation: Option<MemoryReservation>,
    result_tx: Sender<EngineResult<TaskOutput>>,
}

struct ActiveTask {
    cancel: CancellationToken,
    status: Arc<TaskStatus>,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    fallbacks: AtomicU64,
    general_running: AtomicUsize,
    general_peak: AtomicUsize,
}

struct Shared {
    general: Arc<Backend>,
    accelerated: Arc<Backend>,
    guard: Arc<MemoryGuard>,
    pool: Arc<BufferPool>,
    config: SchedulerConfig,
    registry: Mutex<HashMap<TaskId, ActiveTask>>,
    general_tx: Mutex<Option<Sender<Job>>>,
    accelerated_tx: Mutex<Option<Sender<Job>>>,
    counters: Counters,
}

/// Routes tasks to the general pool or the accelerated queue.
pub struct Scheduler {
    shared: Arc<Shared>,
    accelerated_worker: Mutex<Option<JoinHandle<()>>>,
    general_workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the worker threads.
    pub fn start(
        general: Arc<Backend>,
        accelerated: Arc<Backend>,
        guard: Arc<MemoryGuard>,
        pool: Arc<BufferPool>,
        config: SchedulerConfig,
    ) -> EngineResult<Self> {
        if config.general_workers == 0 {
            return Err(EngineError::Config(
                "at least one general worker is required".to_string(),
            ));
        }
        let (general_tx, general_rx) = channel::unbounded::<Job>();
        let (accelerated_tx, accelerated_rx) = channel::unbounded::<Job>();

        let shared = Arc::new(Shared {
            general,
            accelerated,
            guard,
            pool,
            config,
            registry: Mutex::new(HashMap::new()),
            general_tx: Mutex::new(Some(general_tx)),
            accelerated_tx: Mutex::new(Some(accelerated_tx)),
            counters: Counters::default(),
        });

        let mut general_workers = Vec::with_capacity(config.general_workers);
        for i in 0..config.general_workers {
            let shared = Arc::clone(&shared);
            let rx = general_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("lutforge-general-{}", i))
                .spawn(move || worker_loop(shared, rx, BackendKind::General))?;
            general_workers.push(handle);
        }

        let accelerated_worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("lutforge-accelerated".into())
                .spawn(move || worker_loop(shared, accelerated_rx, BackendKind::Accelerated))?
        };

        info!(
            "Scheduler started: {} general worker(s), 1 accelerated worker",
            config.general_workers
        );

        Ok(Self {
            shared,
            accelerated_worker: Mutex::new(Some(accelerated_worker)),
            general_workers: Mutex::new(general_workers),
        })
    }

    /// Pick the backend for a preference.
    ///
    /// `Gpu` without an accelerator degrades to the general backend.
    pub fn resolve(&self, preference: ProcessorPreference) -> BackendKind {
        match preference {
            ProcessorPreference::Cpu => BackendKind::General,
            ProcessorPreference::Auto => {
                if self.shared.accelerated.is_available() {
                    BackendKind::Accelerated
                } else {
                    BackendKind::General
                }
            }
            ProcessorPreference::Gpu => {
                if self.shared.accelerated.ensure_available() {
                    BackendKind::Accelerated
                } else {
                    warn!("GPU requested but unavailable, using CPU");
                    BackendKind::General
                }
            }
        }
    }

    /// Queue a request without blocking.
    pub fn submit(&self, request: TaskRequest, preference: ProcessorPreference) -> EngineResult<TaskHandle> {
        let kind = self.resolve(preference);
        let id = request.id;
        let status = Arc::new(TaskStatus::new());
        let tracker = Arc::new(ProgressTracker::new(id).with_callback(request.on_progress.clone()));
        let cancel = CancellationToken::new();
        let (result_tx, result_rx) = channel::bounded(1);

        let sender = match kind {
            BackendKind::General => self.shared.general_tx.lock().clone(),
            BackendKind::Accelerated => self.shared.accelerated_tx.lock().clone(),
        }
        .ok_or(EngineError::ShutDown)?;

        self.shared.registry.lock().insert(
            id,
            ActiveTask {
                cancel: cancel.clone(),
                status: Arc::clone(&status),
            },
        );
        status.advance(TaskState::Queued);
        tracker.queued(kind);

        let job = Job {
            request,
            status: Arc::clone(&status),
            tracker,
            cancel,
            reservation: None,
            result_tx,
        };
        if sender.send(job).is_err() {
            self.shared.registry.lock().remove(&id);
            return Err(EngineError::ShutDown);
        }

        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
        debug!("Task {} queued on {}", id, kind);
        Ok(TaskHandle::new(id, status, result_rx))
    }

    /// Cancel one task. Returns false when it is unknown or already finished.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.shared.registry.lock().remove(&id) {
            Some(task) => {
                task.cancel.cancel();
                task.status.advance(TaskState::Cancelled);
                info!("Task {} cancelled", id);
                true
            }
            None => false,
        }
    }

    /// Cancel every registered task and return how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.shared.registry.lock().drain().collect();
        for (_, task) in &drained {
            task.cancel.cancel();
            task.status.advance(TaskState::Cancelled);
        }
        if !drained.is_empty() {
            info!("Cancelled {} task(s)", drained.len());
        }
        drained.len()
    }

    /// Number of tasks not yet finished.
    pub fn active_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SchedulerStats {
        let c = &self.shared.counters;
        SchedulerStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
            active: self.active_count(),
            general_running: c.general_running.load(Ordering::SeqCst),
            general_peak: c.general_peak.load(Ordering::SeqCst),
        }
    }

    /// Whether new submissions are still accepted.
    pub fn is_running(&self) -> bool {
        self.shared.general_tx.lock().is_some()
    }

    /// Cancel outstanding work, close both queues and join the workers.
    pub fn shutdown(&self) {
        if !self.is_running() {
            return;
        }
        let cancelled = self.cancel_all();
        debug!("Scheduler shutting down, {} task(s) cancelled", cancelled);

        // the accelerated worker may still requeue onto the general queue
        self.shared.accelerated_tx.lock().take();
        if let Some(handle) = self.accelerated_worker.lock().take() {
            if handle.join().is_err() {
                error!("Accelerated worker panicked");
            }
        }
        self.shared.general_tx.lock().take();
        for handle in self.general_workers.lock().drain(..) {
            if handle.join().is_err() {
                error!("General worker panicked");
            }
        }
        info!("Scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, rx: Receiver<Job>, kind: BackendKind) {
    for job in rx.iter() {
        run_job(&shared, job, kind);
    }
    debug!("{} worker exiting", kind);
}

fn run_job(shared: &Shared, mut job: Job, kind: BackendKind) {
    if job.cancel.is_cancelled() {
        finish(shared, job, Err(EngineError::Cancelled));
        return;
    }

    job.status.advance(TaskState::Running);
    job.tracker.started(kind);

    let base_threshold = match kind {
        BackendKind::General => shared.config.general_stripe_pixels,
        BackendKind::Accelerated => shared.config.accelerated_stripe_pixels,
    };

    if job.reservation.is_none() {
        let (width, height) = job.request.image.dimensions();
        match shared.guard.admit(estimate_task_bytes(width, height, base_threshold)) {
            Ok(reservation) => job.reservation = Some(reservation),
            Err(e) => {
                finish(shared, job, Err(e));
                return;
            }
        }
    }

    let pool = shared
        .guard
        .budget()
        .pooling_enabled
        .then(|| Arc::clone(&shared.pool));
    let ctx = ProcessContext::new(
        Arc::clone(&job.tracker),
        shared.guard.effective_stripe_threshold(base_threshold),
        job.request.effective_seed(),
    )
    .with_cancel(job.cancel.clone())
    .with_pool(pool);

    let backend = match kind {
        BackendKind::General => &shared.general,
        BackendKind::Accelerated => &shared.accelerated,
    };

    let result = if kind == BackendKind::General {
        let running = shared.counters.general_running.fetch_add(1, Ordering::SeqCst) + 1;
        shared.counters.general_peak.fetch_max(running, Ordering::SeqCst);
        let result = backend.process(&job.request.image, &job.request.params, &ctx);
        shared.counters.general_running.fetch_sub(1, Ordering::SeqCst);
        result
    } else {
        backend.process(&job.request.image, &job.request.params, &ctx)
    };

    match result {
        Ok(outcome) => {
            let output = TaskOutput {
                id: job.request.id,
                image: outcome.image,
                backend: kind,
                stripes: outcome.stripes,
                effective_dither: outcome.effective_dither,
                fell_back: job.status.fell_back(),
                duration: Duration::from_millis(job.tracker.elapsed_ms()),
            };
            finish(shared, job, Ok(output));
        }
        Err(e) if kind == BackendKind::Accelerated && e.triggers_fallback() && !job.cancel.is_cancelled() => {
            fall_back(shared, job, e);
        }
        Err(e) => finish(shared, job, Err(e)),
    }
}

fn fall_back(shared: &Shared, job: Job, cause: EngineError) {
    if !job.status.advance(TaskState::Queued) {
        finish(shared, job, Err(cause));
        return;
    }
    warn!("Task {} failed on GPU ({}), retrying on CPU", job.request.id, cause);
    shared.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
    job.tracker.fallback();
    job.tracker.queued(BackendKind::General);

    let sender = shared.general_tx.lock().clone();
    match sender {
        Some(tx) => {
            if let Err(rejected) = tx.send(job) {
                finish(shared, rejected.into_inner(), Err(EngineError::ShutDown));
            }
        }
        None => finish(shared, job, Err(EngineError::ShutDown)),
    }
}

fn finish(shared: &Shared, mut job: Job, result: EngineResult<TaskOutput>) {
    let id = job.request.id;
    shared.registry.lock().remove(&id);
    job.reservation.take();

    match &result {
        Ok(output) => {
            job.status.advance(TaskState::Completed);
            job.tracker.completed();
            shared.counters.completed.fetch_add(1, Ordering::Relaxed);
            info!(
                "Task {} completed on {} in {:?} ({} stripe(s))",
                id, output.backend, output.duration, output.stripes
            );
        }
        Err(EngineError::Cancelled) => {
            job.status.advance(TaskState::Cancelled);
            job.tracker.cancelled();
            shared.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!("Task {} stopped after cancellation", id);
        }
        Err(e) => {
            job.status.advance(TaskState::Failed);
            job.tracker.failed(e.to_string());
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            error!("Task {} failed: {}", id, e);
        }
    }

    if let Some(callback) = &job.request.on_complete {
        callback(id, &result);
    }
    let _ = job.result_tx.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::{gradient, invert_table};
    use crate::backend::{AcceleratedBackend, GeneralBackend};
    use crate::core::config::MemoryBudget;
    use crate::core::types::ProcessingParams;
    use crate::execution::progress::ProgressUpdate;
    use crate::lut::TableSlot;

    fn scheduler(accelerated: AcceleratedBackend, limit: usize) -> Scheduler {
        let general = Backend::General(GeneralBackend::new());
        let accelerated = Backend::Accelerated(accelerated);
        general.set_table(TableSlot::Primary, invert_table());
        accelerated.set_table(TableSlot::Primary, invert_table());
        let guard = Arc::new(MemoryGuard::new(
            MemoryBudget::new(limit),
            Duration::from_secs(2),
            Duration::ZERO,
        ));
        Scheduler::start(
            Arc::new(general),
            Arc::new(accelerated),
            guard,
            Arc::new(BufferPool::default()),
            SchedulerConfig {
                general_workers: 5,
                general_stripe_pixels: 1_000_000,
                accelerated_stripe_pixels: 4_000_000,
            },
        )
        .unwrap()
    }

    fn request(size: u32) -> TaskRequest {
        TaskRequest::new(gradient(size, size), ProcessingParams::default())
    }

    #[test]
    fn test_general_concurrency_bounded() {
        let scheduler = scheduler(AcceleratedBackend::disabled(), usize::MAX / 2);
        let handles: Vec<_> = (0..24)
            .map(|_| scheduler.submit(request(300), ProcessorPreference::Cpu).unwrap())
            .collect();
        for handle in handles {
            let output = handle.wait().unwrap();
            assert_eq!(output.backend, BackendKind::General);
        }
        let stats = scheduler.stats();
        assert_eq!(stats.completed, 24);
        assert!(stats.general_peak >= 1 && stats.general_peak <= 5, "peak {}", stats.general_peak);
        assert_eq!(stats.general_running, 0);
    }

    #[test]
    fn test_accelerated_completes_in_submission_order() {
        let scheduler = scheduler(AcceleratedBackend::emulated(), usize::MAX / 2);
        let finished = Arc::new(Mutex::new(Vec::new()));
        let mut expected = Vec::new();
        let mut handles = Vec::new();
        for i in 0..10 {
            let sink = Arc::clone(&finished);
            let req = request(200 + i * 7).on_complete(move |id, _| sink.lock().push((id, BackendKind::Accelerated)));
            expected.push(req.id);
            handles.push(scheduler.submit(req, ProcessorPreference::Gpu).unwrap());

            let sink = Arc::clone(&finished);
            let small = request(4).on_complete(move |id, _| sink.lock().push((id, BackendKind::General)));
            handles.push(scheduler.submit(small, ProcessorPreference::Cpu).unwrap());
        }
        for handle in handles {
            assert!(handle.wait().is_ok());
        }

        let finished = finished.lock();
        let accelerated: Vec<_> = finished
            .iter()
            .filter(|(_, kind)| *kind == BackendKind::Accelerated)
            .map(|(id, _)| *id)
            .collect();
        assert_eq!(accelerated, expected);

        // general tasks submitted later overtook queued accelerated ones
        let last_accelerated = finished
            .iter()
            .rposition(|(_, kind)| *kind == BackendKind::Accelerated)
            .unwrap();
        let first_general = finished
            .iter()
            .position(|(_, kind)| *kind == BackendKind::General)
            .unwrap();
        assert!(first_general < last_accelerated);
    }

    #[test]
    fn test_gpu_preference_degrades_without_accelerator() {
        let scheduler = scheduler(AcceleratedBackend::disabled(), usize::MAX / 2);
        assert_eq!(scheduler.resolve(ProcessorPreference::Gpu), BackendKind::General);
        assert_eq!(scheduler.resolve(ProcessorPreference::Auto), BackendKind::General);
        let out = scheduler
            .submit(request(8), ProcessorPreference::Gpu)
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(out.backend, BackendKind::General);
    }

    #[test]
    fn test_fallback_once_to_general() {
        let accelerated = AcceleratedBackend::emulated();
        accelerated.inject_faults(1);
        let scheduler = scheduler(accelerated, usize::MAX / 2);
        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&updates);
        let req = request(16).with_progress(move |u| sink.lock().push(u));
        let handle = scheduler.submit(req, ProcessorPreference::Gpu).unwrap();
        let output = handle.wait().unwrap();
        assert!(output.fell_back);
        assert_eq!(output.backend, BackendKind::General);
        assert_eq!(scheduler.stats().fallbacks, 1);
        assert!(updates
            .lock()
            .iter()
            .any(|u| matches!(u, ProgressUpdate::Fallback { message, .. } if message == "Fallback to CPU processing...")));
    }

    #[test]
    fn test_memory_rejection_reaches_handle() {
        let scheduler = scheduler(AcceleratedBackend::disabled(), 1000);
        let handle = scheduler.submit(request(64), ProcessorPreference::Cpu).unwrap();
        let id = handle.id();
        assert!(matches!(handle.wait(), Err(EngineError::MemoryLimitExceeded { .. })));
        assert_eq!(scheduler.stats().failed, 1);
        assert!(!scheduler.cancel(id));
    }

    #[test]
    fn test_cancel_queued_task() {
        let scheduler = scheduler(AcceleratedBackend::emulated(), usize::MAX / 2);
        // keep the single accelerated worker busy
        let busy = scheduler.submit(request(1500), ProcessorPreference::Gpu).unwrap();
        let queued = scheduler.submit(request(8), ProcessorPreference::Gpu).unwrap();
        assert!(scheduler.cancel(queued.id()));
        assert_eq!(queued.state(), TaskState::Cancelled);
        assert!(matches!(queued.wait(), Err(EngineError::Cancelled)));
        assert!(busy.wait().is_ok());
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let scheduler = scheduler(AcceleratedBackend::disabled(), usize::MAX / 2);
        scheduler.shutdown();
        assert!(!scheduler.is_running());
        assert!(matches!(
            scheduler.submit(request(4), ProcessorPreference::Cpu),
            Err(EngineError::ShutDown)
        ));
        scheduler.shutdown();
    }
}
