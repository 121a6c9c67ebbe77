//! Memory admission, reclamation and pressure monitoring.
//!
//! Usage is the sum of outstanding task reservations and of every
//! registered usage probe (resident LUT cache, pooled buffers). A task is
//! admitted when its estimate fits below the critical line; otherwise one
//! rate-limited reclamation pass runs and admission is re-checked.

use crate::core::config::MemoryBudget;
use crate::core::error::{EngineError, EngineResult};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Bytes per pixel of the float RGB stream.
const FLOAT_STREAM_BYTES: usize = 12;

/// Pressure level derived from the usage ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryState {
    /// Below the warning line.
    Normal,
    /// At or above the warning line.
    Warning,
    /// At or above the critical line.
    Critical,
}

impl MemoryState {
    /// Classify a usage level against a budget.
    pub fn classify(usage: usize, budget: &MemoryBudget) -> Self {
        if usage >= budget.critical_bytes() {
            MemoryState::Critical
        } else if usage >= budget.warning_bytes() {
            MemoryState::Warning
        } else {
            MemoryState::Normal
        }
    }
}

impl fmt::Display for MemoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryState::Normal => write!(f, "normal"),
            MemoryState::Warning => write!(f, "warning"),
            MemoryState::Critical => write!(f, "critical"),
        }
    }
}

/// Snapshot of guard counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Reserved plus probed bytes.
    pub current: usize,
    /// High-water mark of `current`.
    pub peak: usize,
    /// Configured limit.
    pub limit: usize,
    /// `current / limit`.
    pub usage_ratio: f64,
    /// Outstanding reservations.
    pub reservations: usize,
    /// Completed reclamation passes.
    pub reclamations: u64,
    /// Rejected admissions.
    pub rejections: u64,
    /// Current pressure level.
    pub state: MemoryState,
}

/// Estimated working set of one task.
///
/// Counts the source and output RGBA buffers plus one float stripe.
pub fn estimate_task_bytes(width: u32, height: u32, stripe_threshold: u64) -> usize {
    let pixels = width as usize * height as usize;
    let stripe_pixels = pixels.min(stripe_threshold as usize);
    pixels * 4 * 2 + stripe_pixels * FLOAT_STREAM_BYTES
}

type Reclaimer = Box<dyn Fn() -> usize + Send + Sync>;
type UsageProbe = Box<dyn Fn() -> usize + Send + Sync>;

/// Tracks reserved memory against a [`MemoryBudget`].
pub struct MemoryGuard {
    budget: RwLock<MemoryBudget>,
    reserved: AtomicUsize,
    reservations: AtomicUsize,
    peak: AtomicUsize,
    reclamations: AtomicU64,
    rejections: AtomicU64,
    reclaim_interval: Duration,
    reclaim_settle: Duration,
    last_reclaim: Mutex<Option<Instant>>,
    reclaimers: RwLock<Vec<(String, Reclaimer)>>,
    probes: RwLock<Vec<UsageProbe>>,
    state: Mutex<MemoryState>,
    subscribers: Mutex<Vec<Sender<MemoryState>>>,
}

impl MemoryGuard {
    /// Create a guard with the given budget and reclamation timing.
    pub fn new(budget: MemoryBudget, reclaim_interval: Duration, reclaim_settle: Duration) -> Self {
        Self {
            budget: RwLock::new(budget),
            reserved: AtomicUsize::new(0),
            reservations: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            reclamations: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            reclaim_interval,
            reclaim_settle,
            last_reclaim: Mutex::new(None),
            reclaimers: RwLock::new(Vec::new()),
            probes: RwLock::new(Vec::new()),
            state: Mutex::new(MemoryState::Normal),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Current budget.
    pub fn budget(&self) -> MemoryBudget {
        self.budget.read().clone()
    }

    /// Replace the budget. Outstanding reservations are kept.
    pub fn set_budget(&self, budget: MemoryBudget) -> EngineResult<()> {
        budget.validate()?;
        info!(
            "Memory budget set to {} bytes ({:.0}% warning, {:.0}% critical)",
            budget.limit_bytes,
            budget.warning_ratio * 100.0,
            budget.critical_ratio * 100.0
        );
        *self.budget.write() = budget;
        self.sample();
        Ok(())
    }

    /// Register a reclamation step returning the bytes it freed.
    pub fn add_reclaimer<F>(&self, name: impl Into<String>, reclaimer: F)
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        self.reclaimers.write().push((name.into(), Box::new(reclaimer)));
    }

    /// Register resident memory that counts toward usage.
    pub fn add_usage_probe<F>(&self, probe: F)
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        self.probes.write().push(Box::new(probe));
    }

    /// Reserved plus probed bytes.
    pub fn usage(&self) -> usize {
        let resident: usize = self.probes.read().iter().map(|p| p()).sum();
        self.reserved.load(Ordering::SeqCst) + resident
    }

    /// Admit a task needing `estimate` bytes.
    ///
    /// Runs at most one reclamation pass before rejecting.
    pub fn admit(self: &Arc<Self>, estimate: usize) -> EngineResult<MemoryReservation> {
        if let Some(reservation) = self.try_reserve(estimate) {
            return Ok(reservation);
        }

        debug!("Admission of {} bytes over critical line, reclaiming", estimate);
        self.reclaim();

        if let Some(reservation) = self.try_reserve(estimate) {
            return Ok(reservation);
        }

        self.rejections.fetch_add(1, Ordering::Relaxed);
        let budget = self.budget();
        let available = budget.critical_bytes().saturating_sub(self.usage());
        warn!(
            "Rejecting task: needs {} bytes, {} available under limit {}",
            estimate, available, budget.limit_bytes
        );
        Err(EngineError::MemoryLimitExceeded {
            required: estimate,
            available,
            limit: budget.limit_bytes,
        })
    }

    fn try_reserve(self: &Arc<Self>, bytes: usize) -> Option<MemoryReservation> {
        let ceiling = self.budget.read().critical_bytes();
        let resident: usize = self.probes.read().iter().map(|p| p()).sum();
        let mut current = self.reserved.load(Ordering::Relaxed);
        loop {
            if current + resident + bytes > ceiling {
                return None;
            }
            match self.reserved.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(current + resident + bytes, Ordering::SeqCst);
                    self.reservations.fetch_add(1, Ordering::SeqCst);
                    self.sample();
                    return Some(MemoryReservation {
                        guard: Arc::clone(self),
                        bytes,
                    });
                }
                Err(c) => current = c,
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.reserved.fetch_sub(bytes, Ordering::SeqCst);
        self.reservations.fetch_sub(1, Ordering::SeqCst);
    }

    /// Run every reclaimer unless a pass ran within the rate-limit window.
    ///
    /// Returns whether a pass ran.
    pub fn reclaim(&self) -> bool {
        {
            let mut last = self.last_reclaim.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.reclaim_interval {
                    debug!("Reclamation skipped, last pass {:?} ago", at.elapsed());
                    return false;
                }
            }
            *last = Some(Instant::now());
        }

        let before = self.usage();
        let mut freed = 0;
        for (name, reclaimer) in self.reclaimers.read().iter() {
            let bytes = reclaimer();
            debug!("Reclaimer '{}' freed {} bytes", name, bytes);
            freed += bytes;
        }
        if !self.reclaim_settle.is_zero() {
            std::thread::sleep(self.reclaim_settle);
        }
        self.reclamations.fetch_add(1, Ordering::Relaxed);
        info!(
            "Memory reclamation freed {} bytes ({} -> {})",
            freed,
            before,
            self.usage()
        );
        self.sample();
        true
    }

    /// Stripe threshold to use for newly planned images.
    ///
    /// Halved while under pressure when compression is enabled.
    pub fn effective_stripe_threshold(&self, base: u64) -> u64 {
        let compress = self.budget.read().compression_enabled;
        if compress && self.state() != MemoryState::Normal {
            (base / 2).max(1)
        } else {
            base
        }
    }

    /// Last classified pressure level.
    pub fn state(&self) -> MemoryState {
        *self.state.lock()
    }

    /// Receive every state transition.
    pub fn subscribe(&self) -> Receiver<MemoryState> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Re-classify usage and broadcast a transition if one happened.
    pub fn sample(&self) -> MemoryState {
        let usage = self.usage();
        self.peak.fetch_max(usage, Ordering::SeqCst);
        let next = MemoryState::classify(usage, &self.budget.read());
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous != next {
            match next {
                MemoryState::Normal => info!("Memory pressure back to normal ({} bytes)", usage),
                _ => warn!("Memory pressure {} -> {} ({} bytes)", previous, next, usage),
            }
            self.subscribers.lock().retain(|tx| tx.send(next).is_ok());
        }
        next
    }

    /// Counter snapshot.
    pub fn stats(&self) -> MemoryStats {
        let current = self.usage();
        let limit = self.budget.read().limit_bytes;
        MemoryStats {
            current,
            peak: self.peak.load(Ordering::SeqCst).max(current),
            limit,
            usage_ratio: if limit == 0 { 0.0 } else { current as f64 / limit as f64 },
            reservations: self.reservations.load(Ordering::SeqCst),
            reclamations: self.reclamations.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            state: self.state(),
        }
    }
}

impl fmt::Debug for MemoryGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryGuard")
            .field("stats", &self.stats())
            .field("reclaimers", &self.reclaimers.read().len())
            .finish()
    }
}

/// Bytes held by an admitted task, returned to the guard on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    guard: Arc<MemoryGuard>,
    bytes: usize,
}

impl MemoryReservation {
    /// Reserved size.
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.guard.release(self.bytes);
    }
}

/// Background sampler of a [`MemoryGuard`].
///
/// Samples at the normal interval, switching to the fast interval while
/// under pressure. Stops when dropped.
pub struct MemoryMonitor {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MemoryMonitor {
    /// Start sampling on a dedicated thread.
    pub fn spawn(guard: Arc<MemoryGuard>, normal: Duration, fast: Duration) -> EngineResult<Self> {
        let (tx, rx) = channel::bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("lutforge-memory".into())
            .spawn(move || loop {
                let interval = match guard.sample() {
                    MemoryState::Normal => normal,
                    MemoryState::Warning | MemoryState::Critical => fast,
                };
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            })?;
        debug!("Memory monitor started ({:?} / {:?})", normal, fast);
        Ok(Self {
            shutdown: Some(tx),
            handle: Some(handle),
        })
    }

    /// Stop the sampler and wait for it.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MemoryMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reusable float stripe buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<f32>>>,
    max_buffers: usize,
}

impl BufferPool {
    /// Create a pool keeping at most `max_buffers` idle buffers.
    pub fn new(max_buffers: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max_buffers,
        }
    }

    /// Take a zeroed buffer of `len` floats.
    pub fn take(&self, len: usize) -> Vec<f32> {
        let mut buffers = self.buffers.lock();
        let reusable = buffers.iter().position(|b| b.capacity() >= len);
        match reusable {
            Some(i) => {
                let mut buffer = buffers.swap_remove(i);
                buffer.clear();
                buffer.resize(len, 0.0);
                buffer
            }
            None => vec![0.0; len],
        }
    }

    /// Return a buffer for reuse.
    pub fn give(&self, buffer: Vec<f32>) {
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_buffers {
            buffers.push(buffer);
        }
    }

    /// Bytes held by idle buffers.
    pub fn idle_bytes(&self) -> usize {
        self.buffers
            .lock()
            .iter()
            .map(|b| b.capacity() * std::mem::size_of::<f32>())
            .sum()
    }

    /// Drop every idle buffer and return the bytes released.
    pub fn trim(&self) -> usize {
        let freed = self.idle_bytes();
        self.buffers.lock().clear();
        freed
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(limit: usize) -> Arc<MemoryGuard> {
        Arc::new(MemoryGuard::new(
            MemoryBudget::new(limit),
            Duration::from_secs(2),
            Duration::ZERO,
        ))
    }

    #[test]
    fn test_reservation_released_on_drop() {
        let guard = guard(1000);
        let r = guard.admit(400).unwrap();
        assert_eq!(r.bytes(), 400);
        assert_eq!(guard.usage(), 400);
        assert_eq!(guard.stats().reservations, 1);
        drop(r);
        assert_eq!(guard.usage(), 0);
        assert_eq!(guard.stats().peak, 400);
    }

    #[test]
    fn test_rejects_after_exactly_one_reclamation() {
        let guard = guard(1000);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        guard.add_reclaimer("count", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            0
        });

        let err = guard.admit(2000).unwrap_err();
        assert!(matches!(err, EngineError::MemoryLimitExceeded { required: 2000, limit: 1000, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(guard.stats().reclamations, 1);

        // rate-limited: a second rejection does not reclaim again
        assert!(guard.admit(2000).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(guard.stats().rejections, 2);
    }

    #[test]
    fn test_reclamation_makes_room() {
        let guard = guard(1000);
        let resident = Arc::new(AtomicUsize::new(800));
        let probe = Arc::clone(&resident);
        guard.add_usage_probe(move || probe.load(Ordering::SeqCst));
        let freeable = Arc::clone(&resident);
        guard.add_reclaimer("cache", move || freeable.swap(0, Ordering::SeqCst));

        let r = guard.admit(500).unwrap();
        assert_eq!(guard.stats().reclamations, 1);
        assert_eq!(guard.usage(), 500);
        drop(r);
    }

    #[test]
    fn test_state_transitions_broadcast() {
        let guard = guard(1000);
        let rx = guard.subscribe();
        let a = guard.admit(800).unwrap();
        assert_eq!(guard.state(), MemoryState::Warning);
        assert_eq!(rx.try_recv().unwrap(), MemoryState::Warning);
        drop(a);
        guard.sample();
        assert_eq!(rx.try_recv().unwrap(), MemoryState::Normal);
    }

    #[test]
    fn test_threshold_halved_under_pressure() {
        let guard = guard(1000);
        assert_eq!(guard.effective_stripe_threshold(1_000_000), 1_000_000);
        let _r = guard.admit(800).unwrap();
        assert_eq!(guard.effective_stripe_threshold(1_000_000), 500_000);
        guard
            .set_budget(MemoryBudget::new(1000).with_compression(false))
            .unwrap();
        assert_eq!(guard.effective_stripe_threshold(1_000_000), 1_000_000);
    }

    #[test]
    fn test_classify() {
        let budget = MemoryBudget::new(1000);
        assert_eq!(MemoryState::classify(0, &budget), MemoryState::Normal);
        assert_eq!(MemoryState::classify(750, &budget), MemoryState::Warning);
        assert_eq!(MemoryState::classify(900, &budget), MemoryState::Critical);
    }

    #[test]
    fn test_monitor_stops() {
        let guard = guard(1000);
        let mut monitor = MemoryMonitor::spawn(
            Arc::clone(&guard),
            Duration::from_millis(5),
            Duration::from_millis(1),
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        monitor.stop();
        assert!(monitor.handle.is_none());
    }

    #[test]
    fn test_buffer_pool_reuse_and_trim() {
        let pool = BufferPool::new(2);
        let mut a = pool.take(100);
        a[0] = 5.0;
        pool.give(a);
        assert!(pool.idle_bytes() >= 400);
        let b = pool.take(50);
        assert_eq!(b.len(), 50);
        assert_eq!(b[0], 0.0);
        pool.give(b);
        assert!(pool.trim() > 0);
        assert_eq!(pool.idle_bytes(), 0);
    }

    #[test]
    fn test_estimate_counts_stripe_only() {
        assert_eq!(estimate_task_bytes(10, 10, 1_000_000), 100 * 8 + 100 * 12);
        assert_eq!(estimate_task_bytes(100, 100, 1000), 10_000 * 8 + 1000 * 12);
    }
}
