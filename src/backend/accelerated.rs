//! wgpu compute backend.
//!
//! The device is probed lazily and the result cached. A failed probe is
//! not fatal: the backend reports itself unavailable and can be re-probed
//! later with [`AcceleratedBackend::ensure_available`].

use super::{run_pipeline, ProcessContext, ProcessOutcome};
use crate::color::ColorMapper;
use crate::core::error::{EngineError, EngineResult};
use crate::core::gpu::GpuDevice;
use crate::core::types::{BackendKind, ProcessingParams};
use crate::lut::LutStore;
use image::RgbaImage;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone)]
enum Driver {
    Unprobed,
    Device(Arc<GpuDevice>),
    Unavailable(String),
    Disabled,
    Emulated,
}

/// Maps pixels with a compute shader; grain and dither run on the host.
pub struct AcceleratedBackend {
    store: LutStore,
    driver: Mutex<Driver>,
    injected_faults: AtomicUsize,
}

impl AcceleratedBackend {
    /// Backend that probes for a GPU on first use.
    pub fn new() -> Self {
        Self::with_driver(Driver::Unprobed)
    }

    /// Backend that never becomes available.
    pub fn disabled() -> Self {
        Self::with_driver(Driver::Disabled)
    }

    /// Backend that keeps the accelerated queue semantics but maps on the host.
    ///
    /// Useful on machines without an adapter when the serial path itself is
    /// under test.
    pub fn emulated() -> Self {
        Self::with_driver(Driver::Emulated)
    }

    fn with_driver(driver: Driver) -> Self {
        Self {
            store: LutStore::new(),
            driver: Mutex::new(driver),
            injected_faults: AtomicUsize::new(0),
        }
    }

    /// Table slots.
    pub fn store(&self) -> &LutStore {
        &self.store
    }

    /// Whether a device (or the host emulation) is ready.
    pub fn is_available(&self) -> bool {
        matches!(*self.driver.lock(), Driver::Device(_) | Driver::Emulated)
    }

    /// Initialize the device if this has not been tried yet.
    pub fn probe(&self) -> bool {
        let mut driver = self.driver.lock();
        if matches!(*driver, Driver::Unprobed) {
            *driver = Self::open_device();
        }
        matches!(*driver, Driver::Device(_) | Driver::Emulated)
    }

    /// Probe again if an earlier attempt failed.
    pub fn ensure_available(&self) -> bool {
        let mut driver = self.driver.lock();
        if matches!(*driver, Driver::Unprobed | Driver::Unavailable(_)) {
            *driver = Self::open_device();
        }
        matches!(*driver, Driver::Device(_) | Driver::Emulated)
    }

    fn open_device() -> Driver {
        match GpuDevice::new() {
            Ok(device) => {
                info!("Accelerated backend ready: {}", device.describe());
                Driver::Device(Arc::new(device))
            }
            Err(e) => {
                warn!("Accelerated backend unavailable: {}", e);
                Driver::Unavailable(e.to_string())
            }
        }
    }

    /// Make the next `count` runs fail as if the device had faulted.
    #[cfg(test)]
    pub(crate) fn inject_faults(&self, count: usize) {
        self.injected_faults.store(count, Ordering::SeqCst);
    }

    fn take_fault(&self) -> bool {
        self.injected_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn unavailable() -> EngineError {
        EngineError::BackendUnavailable {
            backend: BackendKind::Accelerated,
        }
    }

    /// Process `image` with the current tables.
    pub fn process(
        &self,
        image: &RgbaImage,
        params: &ProcessingParams,
        ctx: &ProcessContext,
    ) -> EngineResult<ProcessOutcome> {
        let driver = self.driver.lock().clone();
        if self.take_fault() {
            return Err(EngineError::ProcessingFailed {
                backend: BackendKind::Accelerated,
                cause: "device lost".to_string(),
            });
        }
        let mapper = ColorMapper::from_snapshot(&self.store.snapshot(), params)?;

        match driver {
            Driver::Device(gpu) => {
                let threshold = ctx
                    .stripe_threshold
                    .min(gpu.max_pixels_per_dispatch() as u64)
                    .max(1);
                let ctx = ProcessContext {
                    stripe_threshold: threshold,
                    ..ctx.clone()
                };
                let tables = gpu.upload_tables(
                    mapper.primary(),
                    mapper.active_secondary().map(|t| t.as_ref()),
                );
                run_pipeline(BackendKind::Accelerated, image, params, &ctx, |src, dst| {
                    gpu.map_pixels(
                        &tables,
                        mapper.strength(),
                        mapper.secondary_strength(),
                        src,
                        dst,
                    )
                    .map_err(|e| EngineError::ProcessingFailed {
                        backend: BackendKind::Accelerated,
                        cause: e.to_string(),
                    })
                })
            }
            Driver::Emulated => {
                debug!("Accelerated path emulated on host");
                run_pipeline(BackendKind::Accelerated, image, params, ctx, |src, dst| {
                    mapper.map_rgba8_into(src, dst);
                    Ok(())
                })
            }
            Driver::Unprobed | Driver::Unavailable(_) | Driver::Disabled => Err(Self::unavailable()),
        }
    }

    /// Drop tables and the device. A later probe reopens it.
    pub fn release(&self) {
        self.store.clear_all();
        let mut driver = self.driver.lock();
        if matches!(*driver, Driver::Device(_)) {
            *driver = Driver::Unprobed;
        }
    }

    /// Device description or the reason it is missing.
    pub fn info(&self) -> String {
        match &*self.driver.lock() {
            Driver::Device(gpu) => format!("GPU: {}", gpu.describe()),
            Driver::Unavailable(reason) => format!("GPU unavailable: {}", reason),
            Driver::Unprobed => "GPU not probed".to_string(),
            Driver::Disabled => "GPU disabled".to_string(),
            Driver::Emulated => "GPU emulated on host".to_string(),
        }
    }
}

impl Default for AcceleratedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AcceleratedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceleratedBackend")
            .field("info", &self.info())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::backend::GeneralBackend;
    use crate::lut::TableSlot;

    #[test]
    fn test_disabled_is_unavailable() {
        let backend = AcceleratedBackend::disabled();
        assert!(!backend.is_available());
        assert!(!backend.probe());
        assert_eq!(backend.info(), "GPU disabled");
        backend.store().set(TableSlot::Primary, Some(invert_table()));
        let err = backend
            .process(&gradient(4, 4), &ProcessingParams::default(), &context(100))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::BackendUnavailable {
                backend: BackendKind::Accelerated
            }
        ));
        assert!(err.triggers_fallback());
    }

    #[test]
    fn test_emulated_matches_general() {
        let accelerated = AcceleratedBackend::emulated();
        let general = GeneralBackend::new();
        accelerated.store().set(TableSlot::Primary, Some(invert_table()));
        general.store().set(TableSlot::Primary, Some(invert_table()));
        let image = gradient(23, 19);
        let params = ProcessingParams::default().with_strength(0.8);
        let a = accelerated.process(&image, &params, &context(1000)).unwrap();
        let b = general.process(&image, &params, &context(1000)).unwrap();
        assert_eq!(a.image, b.image);
    }

    #[test]
    fn test_injected_faults_are_consumed() {
        let backend = AcceleratedBackend::emulated();
        backend.store().set(TableSlot::Primary, Some(invert_table()));
        backend.inject_faults(1);
        let image = gradient(4, 4);
        let params = ProcessingParams::default();
        let first = backend.process(&image, &params, &context(100));
        assert!(matches!(first, Err(EngineError::ProcessingFailed { .. })));
        assert!(backend.process(&image, &params, &context(100)).is_ok());
    }

    #[test]
    fn test_probe_never_panics() {
        // real hardware may or may not be present
        let backend = AcceleratedBackend::new();
        let available = backend.probe();
        assert_eq!(available, backend.is_available());
        backend.release();
        assert!(!backend.info().is_empty());
    }
}
