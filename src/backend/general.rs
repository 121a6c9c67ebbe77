//! Host CPU backend.

use super::{run_pipeline, ProcessContext, ProcessOutcome};
use crate::color::ColorMapper;
use crate::core::error::EngineResult;
use crate::core::types::{BackendKind, ProcessingParams};
use crate::lut::LutStore;
use image::RgbaImage;

/// Maps pixels on the CPU with rayon inside each stripe. Always available.
#[derive(Debug, Default)]
pub struct GeneralBackend {
    store: LutStore,
}

impl GeneralBackend {
    /// Create a backend with empty table slots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table slots.
    pub fn store(&self) -> &LutStore {
        &self.store
    }

    /// Always true.
    pub fn is_available(&self) -> bool {
        true
    }

    /// Process `image` with the current tables.
    pub fn process(
        &self,
        image: &RgbaImage,
        params: &ProcessingParams,
        ctx: &ProcessContext,
    ) -> EngineResult<ProcessOutcome> {
        let mapper = ColorMapper::from_snapshot(&self.store.snapshot(), params)?;
        run_pipeline(BackendKind::General, image, params, ctx, |src, dst| {
            mapper.map_rgba8_into(src, dst);
            Ok(())
        })
    }

    /// Drop loaded tables.
    pub fn release(&self) {
        self.store.clear_all();
    }

    /// Description with the worker thread count.
    pub fn info(&self) -> String {
        format!("CPU ({} threads)", rayon::current_num_threads())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::color::mapper::unpack;
    use crate::core::types::DitherKind;
    use crate::lut::{LookupTable, TableSlot};
    use std::sync::Arc;

    #[test]
    fn test_zero_strength_is_identity() {
        let backend = GeneralBackend::new();
        backend.store().set(TableSlot::Primary, Some(invert_table()));
        let image = gradient(31, 17);
        let params = ProcessingParams::default().with_strength(0.0);
        let out = backend.process(&image, &params, &context(1_000_000)).unwrap();
        assert_eq!(out.image, image);
    }

    #[test]
    fn test_full_strength_matches_lookup() {
        let backend = GeneralBackend::new();
        let table = invert_table();
        backend.store().set(TableSlot::Primary, Some(Arc::clone(&table)));
        let image = gradient(16, 16);
        let out = backend
            .process(&image, &ProcessingParams::default(), &context(1_000_000))
            .unwrap();
        for (src, dst) in image.pixels().zip(out.image.pixels()) {
            let expected = table.sample(unpack(&src.0));
            for c in 0..3 {
                assert_eq!(dst[c], (expected[c].clamp(0.0, 1.0) * 255.0).round() as u8);
            }
            assert_eq!(dst[3], src[3]);
        }
    }

    #[test]
    fn test_striped_output_matches_single_pass_without_dither() {
        let backend = GeneralBackend::new();
        backend.store().set(TableSlot::Primary, Some(invert_table()));
        let image = gradient(40, 37);
        let params = ProcessingParams::default().with_strength(0.6);
        let whole = backend.process(&image, &params, &context(1_000_000)).unwrap();
        let striped = backend.process(&image, &params, &context(100)).unwrap();
        assert_eq!(whole.stripes, 1);
        assert!(striped.stripes > 1);
        assert_eq!(whole.image, striped.image);
    }

    #[test]
    fn test_four_megapixel_floyd_steinberg_downgrades() {
        let backend = GeneralBackend::new();
        backend
            .store()
            .set(TableSlot::Primary, Some(Arc::new(LookupTable::identity(2))));
        let image = RgbaImage::from_pixel(2000, 2000, image::Rgba([100, 150, 200, 255]));
        let params = ProcessingParams::default().with_dither(DitherKind::FloydSteinberg);
        let out = backend.process(&image, &params, &context(1_000_000)).unwrap();
        assert_eq!(out.stripes, 4);
        assert_eq!(out.effective_dither, DitherKind::Random);
    }

    #[test]
    fn test_single_stripe_keeps_floyd_steinberg() {
        let backend = GeneralBackend::new();
        backend.store().set(TableSlot::Primary, Some(invert_table()));
        let image = gradient(64, 64);
        let params = ProcessingParams::default().with_dither(DitherKind::FloydSteinberg);
        let out = backend.process(&image, &params, &context(1_000_000)).unwrap();
        assert_eq!(out.effective_dither, DitherKind::FloydSteinberg);
    }

    #[test]
    fn test_secondary_applied_on_top() {
        let backend = GeneralBackend::new();
        backend.store().set(TableSlot::Primary, Some(invert_table()));
        backend.store().set(TableSlot::Secondary, Some(invert_table()));
        let image = gradient(10, 10);
        let params = ProcessingParams::default().with_secondary_strength(1.0);
        let out = backend.process(&image, &params, &context(1_000_000)).unwrap();
        // inverting twice lands back on the source, up to rounding
        for (src, dst) in image.pixels().zip(out.image.pixels()) {
            assert!((src[0] as i32 - dst[0] as i32).abs() <= 1);
        }
    }

    #[test]
    fn test_release_clears_tables() {
        let backend = GeneralBackend::new();
        backend.store().set(TableSlot::Primary, Some(invert_table()));
        backend.release();
        assert!(backend.store().primary().is_none());
        assert!(backend.info().starts_with("CPU"));
    }
}
