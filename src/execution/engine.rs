//! Engine facade.
//!
//! The engine owns the LUT cache, both backends, the memory guard and the
//! scheduler. It is started with [`Engine::start`] and stopped with
//! [`Engine::shutdown`] (also run on drop).

use crate::backend::{AcceleratedBackend, Backend, GeneralBackend};
use crate::core::config::{EngineConfig, MemoryBudget};
use crate::core::error::{EngineError, EngineResult};
use crate::core::types::{BackendKind, ImageValue, ProcessingParams, ProcessorPreference};
use crate::execution::memory::{BufferPool, MemoryGuard, MemoryMonitor, MemoryState, MemoryStats};
use crate::execution::output::{fit_to_ceiling, write_output, OutputResize};
use crate::execution::scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
use crate::execution::task::{TaskHandle, TaskId, TaskOutput, TaskRequest};
use crate::lut::{CacheStats, LookupTable, LutCache, TableSlot};
use crossbeam::channel::Receiver;
use image::RgbaImage;
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Description of both backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    /// General backend description.
    pub general_info: String,
    /// Accelerated backend description or the reason it is missing.
    pub accelerated_info: String,
    /// Backend new tasks go to under the current preference.
    pub preferred: BackendKind,
    /// Whether the accelerator is ready.
    pub accelerated_available: bool,
}

/// Combined counters.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Task counters.
    pub scheduler: SchedulerStats,
    /// Memory counters.
    pub memory: MemoryStats,
    /// LUT cache counters.
    pub cache: CacheStats,
}

/// LUT processing engine.
pub struct Engine {
    config: RwLock<EngineConfig>,
    cache: Arc<LutCache>,
    general: Arc<Backend>,
    accelerated: Arc<Backend>,
    guard: Arc<MemoryGuard>,
    scheduler: Scheduler,
    monitor: Mutex<Option<MemoryMonitor>>,
}

impl Engine {
    /// Start an engine, probing for an accelerator when enabled.
    pub fn start(config: EngineConfig) -> EngineResult<Self> {
        let accelerated = if config.enable_accelerator {
            AcceleratedBackend::new()
        } else {
            AcceleratedBackend::disabled()
        };
        Self::with_accelerator(config, accelerated)
    }

    /// Start an engine around a prepared accelerated backend.
    pub fn with_accelerator(config: EngineConfig, accelerated: AcceleratedBackend) -> EngineResult<Self> {
        config.validate()?;
        accelerated.probe();

        let cache = Arc::new(LutCache::new(config.lut_cache_capacity));
        let pool = Arc::new(BufferPool::default());
        let guard = Arc::new(MemoryGuard::new(
            config.memory.clone(),
            Duration::from_millis(config.reclaim_interval_ms),
            Duration::from_millis(config.reclaim_settle_ms),
        ));

        {
            let cache = Arc::clone(&cache);
            guard.add_usage_probe(move || cache.memory_usage());
        }
        {
            let pool = Arc::clone(&pool);
            guard.add_usage_probe(move || pool.idle_bytes());
        }
        {
            let cache = Arc::clone(&cache);
            guard.add_reclaimer("lut-cache", move || {
                let freed = cache.memory_usage();
                cache.clear();
                freed
            });
        }
        {
            let pool = Arc::clone(&pool);
            guard.add_reclaimer("buffer-pool", move || pool.trim());
        }

        let monitor = if config.enable_monitor {
            Some(MemoryMonitor::spawn(
                Arc::clone(&guard),
                config.monitor_interval(),
                config.monitor_fast_interval(),
            )?)
        } else {
            None
        };

        let general = Arc::new(Backend::General(GeneralBackend::new()));
        let accelerated = Arc::new(Backend::Accelerated(accelerated));
        let scheduler = Scheduler::start(
            Arc::clone(&general),
            Arc::clone(&accelerated),
            Arc::clone(&guard),
            pool,
            SchedulerConfig {
                general_workers: config.max_general_concurrency,
                general_stripe_pixels: config.stripe_pixel_threshold,
                accelerated_stripe_pixels: config.accelerated_stripe_pixel_threshold,
            },
        )?;

        info!(
            "Engine started: {} | {} | preference {}",
            general.info(),
            accelerated.info(),
            config.processor
        );

        Ok(Self {
            config: RwLock::new(config),
            cache,
            general,
            accelerated,
            guard,
            scheduler,
            monitor: Mutex::new(monitor),
        })
    }

    fn ensure_running(&self) -> EngineResult<()> {
        if self.scheduler.is_running() {
            Ok(())
        } else {
            Err(EngineError::ShutDown)
        }
    }

    /// Current configuration.
    pub fn config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    /// Queue an image for processing.
    ///
    /// `preferred` overrides the engine-wide processor preference.
    pub fn submit(
        &self,
        image: impl Into<Arc<RgbaImage>>,
        params: ProcessingParams,
        preferred: Option<ProcessorPreference>,
    ) -> EngineResult<TaskHandle> {
        let mut request = TaskRequest::new(image, params);
        request.preferred = preferred;
        self.submit_with(request)
    }

    /// Queue a loaded [`ImageValue`].
    pub fn submit_value(
        &self,
        image: &ImageValue,
        params: ProcessingParams,
        preferred: Option<ProcessorPreference>,
    ) -> EngineResult<TaskHandle> {
        self.submit(image.require()?, params, preferred)
    }

    /// Queue a fully specified request.
    pub fn submit_with(&self, request: TaskRequest) -> EngineResult<TaskHandle> {
        self.ensure_running()?;
        request.params.validate()?;
        let (width, height) = request.image.dimensions();
        if width == 0 || height == 0 {
            return Err(EngineError::InvalidInput(format!(
                "cannot process an empty {}x{} image",
                width, height
            )));
        }
        if self.general.table(TableSlot::Primary).is_none() {
            return Err(EngineError::NoTableLoaded);
        }
        let preference = request
            .preferred
            .unwrap_or_else(|| self.config.read().processor);
        self.scheduler.submit(request, preference)
    }

    /// Submit and block until the task finishes.
    pub fn process(
        &self,
        image: impl Into<Arc<RgbaImage>>,
        params: ProcessingParams,
    ) -> EngineResult<TaskOutput> {
        self.submit(image, params, None)?.wait()
    }

    /// Cancel one task.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.scheduler.cancel(id)
    }

    /// Cancel every outstanding task.
    pub fn cancel_all(&self) -> usize {
        self.scheduler.cancel_all()
    }

    /// Describe both backends.
    pub fn backend_info(&self) -> BackendInfo {
        let accelerated_available = self.accelerated.is_available();
        let preferred = match self.config.read().processor {
            ProcessorPreference::Cpu => BackendKind::General,
            ProcessorPreference::Auto | ProcessorPreference::Gpu if accelerated_available => {
                BackendKind::Accelerated
            }
            _ => BackendKind::General,
        };
        BackendInfo {
            general_info: self.general.info(),
            accelerated_info: self.accelerated.info(),
            preferred,
            accelerated_available,
        }
    }

    fn install(&self, slot: TableSlot, table: Arc<LookupTable>) {
        self.general.set_table(slot, Arc::clone(&table));
        self.accelerated.set_table(slot, table);
    }

    /// Parse `.cube` bytes into a slot on both backends.
    ///
    /// A parse error leaves the slot unchanged.
    pub fn load_table(&self, slot: TableSlot, bytes: &[u8]) -> EngineResult<Arc<LookupTable>> {
        self.ensure_running()?;
        let table = self.general.load_table(slot, bytes)?;
        self.accelerated.set_table(slot, Arc::clone(&table));
        Ok(table)
    }

    /// Load a slot from a file, reusing a cached parse when available.
    pub fn load_table_from_path(&self, slot: TableSlot, path: impl AsRef<Path>) -> EngineResult<Arc<LookupTable>> {
        self.ensure_running()?;
        let table = self
            .general
            .load_table_from_path(slot, path.as_ref(), &self.cache)?;
        self.accelerated.set_table(slot, Arc::clone(&table));
        Ok(table)
    }

    /// Install an already parsed table.
    pub fn set_table(&self, slot: TableSlot, table: Arc<LookupTable>) {
        self.install(slot, table);
    }

    /// Parse `.cube` bytes into the primary slot.
    pub fn load_primary(&self, bytes: &[u8]) -> EngineResult<Arc<LookupTable>> {
        self.load_table(TableSlot::Primary, bytes)
    }

    /// Parse `.cube` bytes into the secondary slot.
    pub fn load_secondary(&self, bytes: &[u8]) -> EngineResult<Arc<LookupTable>> {
        self.load_table(TableSlot::Secondary, bytes)
    }

    /// Load the primary slot from a file.
    pub fn load_primary_path(&self, path: impl AsRef<Path>) -> EngineResult<Arc<LookupTable>> {
        self.load_table_from_path(TableSlot::Primary, path)
    }

    /// Load the secondary slot from a file.
    pub fn load_secondary_path(&self, path: impl AsRef<Path>) -> EngineResult<Arc<LookupTable>> {
        self.load_table_from_path(TableSlot::Secondary, path)
    }

    /// Empty the primary slot.
    pub fn clear_primary(&self) {
        self.general.clear_table(TableSlot::Primary);
        self.accelerated.clear_table(TableSlot::Primary);
    }

    /// Empty the secondary slot.
    pub fn clear_secondary(&self) {
        self.general.clear_table(TableSlot::Secondary);
        self.accelerated.clear_table(TableSlot::Secondary);
    }

    /// Current table in a slot.
    pub fn table(&self, slot: TableSlot) -> Option<Arc<LookupTable>> {
        self.general.table(slot)
    }

    /// Replace the memory budget used for future admissions.
    pub fn set_memory_budget(&self, budget: MemoryBudget) -> EngineResult<()> {
        self.guard.set_budget(budget.clone())?;
        self.config.write().memory = budget;
        Ok(())
    }

    /// Current memory budget.
    pub fn memory_budget(&self) -> MemoryBudget {
        self.guard.budget()
    }

    /// Memory counters.
    pub fn memory_stats(&self) -> MemoryStats {
        self.guard.stats()
    }

    /// Receive memory pressure transitions.
    pub fn subscribe_memory(&self) -> Receiver<MemoryState> {
        self.guard.subscribe()
    }

    /// Run a reclamation pass now, subject to the rate limit.
    pub fn reclaim_memory(&self) -> bool {
        self.guard.reclaim()
    }

    /// Change the default backend preference for future submissions.
    pub fn set_processor_preference(&self, preference: ProcessorPreference) {
        if preference == ProcessorPreference::Gpu && !self.accelerated.ensure_available() {
            info!("GPU preference set without an accelerator; tasks will run on CPU");
        }
        self.config.write().processor = preference;
    }

    /// Default backend preference.
    pub fn processor_preference(&self) -> ProcessorPreference {
        self.config.read().processor
    }

    /// Downscale an output above the configured pixel ceiling.
    pub fn fit_output(&self, image: RgbaImage) -> (RgbaImage, Option<OutputResize>) {
        fit_to_ceiling(image, self.config.read().output_pixel_ceiling)
    }

    /// Persist an output, downscaling it first when above the ceiling.
    pub fn save_output(
        &self,
        image: RgbaImage,
        path: impl AsRef<Path>,
        quality: u8,
    ) -> EngineResult<Option<OutputResize>> {
        let (image, resize) = self.fit_output(image);
        write_output(&image, path.as_ref(), quality)?;
        Ok(resize)
    }

    /// All counters.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            scheduler: self.scheduler.stats(),
            memory: self.guard.stats(),
            cache: self.cache.stats(),
        }
    }

    /// Whether the engine still accepts work.
    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Cancel outstanding work, stop all threads and release resources.
    ///
    /// Calling it more than once is harmless.
    pub fn shutdown(&self) {
        if !self.scheduler.is_running() {
            return;
        }
        self.scheduler.shutdown();
        if let Some(mut monitor) = self.monitor.lock().take() {
            monitor.stop();
        }
        self.general.release();
        self.accelerated.release();
        let evicted = self.cache.clear();
        debug!("Released backends and {} cached table(s)", evicted);
        info!("Engine shut down");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
