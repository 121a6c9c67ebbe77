//! Processing backends.
//!
//! Both backends share one stripe pipeline: map the stripe to a float RGB
//! stream, add grain, then quantize. They differ only in how the mapping
//! step runs.

pub mod accelerated;
pub mod general;

pub use accelerated::AcceleratedBackend;
pub use general::GeneralBackend;

use crate::color::{apply_grain, quantize, GrainFrame, NoiseField};
use crate::core::chunked::{process_striped, StripePlan};
use crate::core::error::{EngineError, EngineResult};
use crate::core::types::{BackendKind, DitherKind, ProcessingParams};
use crate::execution::memory::BufferPool;
use crate::execution::progress::{CancellationToken, ProgressTracker};
use crate::lut::{LookupTable, LutCache, TableSlot};
use image::RgbaImage;
use log::debug;
use std::path::Path;
use std::sync::Arc;

/// Per-task inputs a backend needs besides the image and parameters.
#[derive(Clone)]
pub struct ProcessContext {
    /// Checked before each stripe.
    pub cancel: CancellationToken,
    /// Receives stripe progress.
    pub tracker: Arc<ProgressTracker>,
    /// Maximum pixels per stripe.
    pub stripe_threshold: u64,
    /// Noise seed for random dither and grain.
    pub seed: u32,
    /// Shared stripe buffers, when pooling is enabled.
    pub pool: Option<Arc<BufferPool>>,
}

impl ProcessContext {
    /// Context with a fresh token and no pooling.
    pub fn new(tracker: Arc<ProgressTracker>, stripe_threshold: u64, seed: u32) -> Self {
        Self {
            cancel: CancellationToken::new(),
            tracker,
            stripe_threshold,
            seed,
            pool: None,
        }
    }

    /// Use `cancel` as the cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Draw stripe buffers from `pool`.
    pub fn with_pool(mut self, pool: Option<Arc<BufferPool>>) -> Self {
        self.pool = pool;
        self
    }
}

/// Result of running one image through a backend.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// Quantized output.
    pub image: RgbaImage,
    /// Stripes used.
    pub stripes: usize,
    /// Dither actually applied.
    pub effective_dither: DitherKind,
}

/// A processing backend.
pub enum Backend {
    /// Host CPU with rayon.
    General(GeneralBackend),
    /// wgpu compute.
    Accelerated(AcceleratedBackend),
}

impl Backend {
    /// Which backend this is.
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::General(_) => BackendKind::General,
            Backend::Accelerated(_) => BackendKind::Accelerated,
        }
    }

    /// Whether the backend can take work right now.
    pub fn is_available(&self) -> bool {
        match self {
            Backend::General(b) => b.is_available(),
            Backend::Accelerated(b) => b.is_available(),
        }
    }

    /// Like [`is_available`](Self::is_available), re-probing a failed accelerator.
    pub fn ensure_available(&self) -> bool {
        match self {
            Backend::General(b) => b.is_available(),
            Backend::Accelerated(b) => b.ensure_available(),
        }
    }

    /// Parse `.cube` bytes into a slot.
    pub fn load_table(&self, slot: TableSlot, bytes: &[u8]) -> EngineResult<Arc<LookupTable>> {
        match self {
            Backend::General(b) => b.store().load(slot, bytes),
            Backend::Accelerated(b) => b.store().load(slot, bytes),
        }
    }

    /// Load a slot from a file through `cache`.
    pub fn load_table_from_path(
        &self,
        slot: TableSlot,
        path: &Path,
        cache: &LutCache,
    ) -> EngineResult<Arc<LookupTable>> {
        match self {
            Backend::General(b) => b.store().load_from_path(slot, path, cache),
            Backend::Accelerated(b) => b.store().load_from_path(slot, path, cache),
        }
    }

    /// Install an already parsed table.
    pub fn set_table(&self, slot: TableSlot, table: Arc<LookupTable>) {
        match self {
            Backend::General(b) => b.store().set(slot, Some(table)),
            Backend::Accelerated(b) => b.store().set(slot, Some(table)),
        }
    }

    /// Current table in a slot.
    pub fn table(&self, slot: TableSlot) -> Option<Arc<LookupTable>> {
        match self {
            Backend::General(b) => b.store().get(slot),
            Backend::Accelerated(b) => b.store().get(slot),
        }
    }

    /// Empty a slot.
    pub fn clear_table(&self, slot: TableSlot) {
        match self {
            Backend::General(b) => b.store().clear(slot),
            Backend::Accelerated(b) => b.store().clear(slot),
        }
    }

    /// Map, grain and quantize `image`.
    pub fn process(
        &self,
        image: &RgbaImage,
        params: &ProcessingParams,
        ctx: &ProcessContext,
    ) -> EngineResult<ProcessOutcome> {
        match self {
            Backend::General(b) => b.process(image, params, ctx),
            Backend::Accelerated(b) => b.process(image, params, ctx),
        }
    }

    /// Drop tables and device resources.
    pub fn release(&self) {
        match self {
            Backend::General(b) => b.release(),
            Backend::Accelerated(b) => b.release(),
        }
    }

    /// One-line description.
    pub fn info(&self) -> String {
        match self {
            Backend::General(b) => b.info(),
            Backend::Accelerated(b) => b.info(),
        }
    }
}

/// Run the stripe pipeline with `map_stripe` as the mapping step.
///
/// `map_stripe` receives the stripe's RGBA8 bytes and a float RGB buffer of
/// matching length to fill.
pub(crate) fn run_pipeline<M>(
    backend: BackendKind,
    image: &RgbaImage,
    params: &ProcessingParams,
    ctx: &ProcessContext,
    mut map_stripe: M,
) -> EngineResult<ProcessOutcome>
where
    M: FnMut(&[u8], &mut [f32]) -> EngineResult<()>,
{
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(EngineError::InvalidInput(format!(
            "cannot process an empty {}x{} image",
            width, height
        )));
    }

    let plan = StripePlan::new(width, height, ctx.stripe_threshold);
    let stripes = plan.stripe_count();
    let dither = params.dither.effective_for(stripes);
    if dither != params.dither {
        debug!(
            "Task {}: {} stripes, {} dither runs as {}",
            ctx.tracker.task_id(),
            stripes,
            params.dither,
            dither
        );
    }
    debug!(
        "Task {} on {}: {}x{} in {} stripe(s) of {} rows",
        ctx.tracker.task_id(),
        backend,
        width,
        height,
        stripes,
        plan.stripe_height()
    );

    let grain = params.grain.as_ref().filter(|g| g.is_active());
    let capacity = plan.stripe_height() as usize * width as usize * 3;
    let mut rgb = match &ctx.pool {
        Some(pool) => pool.take(capacity),
        None => vec![0.0f32; capacity],
    };

    let result = process_striped(
        image,
        &plan,
        &ctx.cancel,
        |done, total| ctx.tracker.stripe_done(done, total),
        |region, src, dst| {
            let floats = &mut rgb[..region.pixel_count() * 3];
            map_stripe(src, floats)?;
            if let Some(config) = grain {
                let frame = GrainFrame {
                    image_width: width,
                    image_height: height,
                    row_offset: region.y,
                };
                apply_grain(floats, frame, ctx.seed, config);
            }
            quantize(
                dither,
                floats,
                src,
                width as usize,
                dst,
                NoiseField::new(ctx.seed, region.y),
            );
            Ok(())
        },
    );

    if let Some(pool) = &ctx.pool {
        pool.give(rgb);
    }

    Ok(ProcessOutcome {
        image: result?,
        stripes,
        effective_dither: dither,
    })
}
