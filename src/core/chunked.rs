//! Striped processing for large images.
//!
//! Images above a pixel threshold are split into full-width horizontal
//! stripes that are processed one at a time and written back in spatial
//! order. Between stripes the worker yields and checks for cancellation.
//!
//! # Example
//!
//! ```ignore
//! let plan = StripePlan::new(image.width(), image.height(), 1_000_000);
//! let out = process_striped(&image, &plan, &cancel, |_, _| {}, |region, src, dst| {
//!     dst.copy_from_slice(src);
//!     Ok(())
//! })?;
//! ```

use crate::core::error::{EngineError, EngineResult};
use crate::execution::progress::CancellationToken;
use image::RgbaImage;

/// Bytes per RGBA8 pixel.
pub const BYTES_PER_PIXEL: usize = 4;

/// A horizontal band of full-width rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripeRegion {
    /// Zero-based stripe number
    pub index: usize,
    /// First image row
    pub y: u32,
    /// Row count
    pub height: u32,
    /// Row length in pixels
    pub width: u32,
}

impl StripeRegion {
    /// Get the bottom edge row (exclusive).
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    /// Number of pixels in this stripe.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Byte range of this stripe inside a packed RGBA8 buffer.
    pub fn byte_range(&self) -> std::ops::Range<usize> {
        let row = self.width as usize * BYTES_PER_PIXEL;
        self.y as usize * row..self.bottom() as usize * row
    }
}

/// How an image will be divided into stripes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripePlan {
    width: u32,
    height: u32,
    stripe_height: u32,
}

impl StripePlan {
    /// Plan stripes so that each holds at most `threshold` pixels (minimum one row).
    pub fn new(width: u32, height: u32, threshold: u64) -> Self {
        let pixels = width as u64 * height as u64;
        let stripe_height = if pixels <= threshold || width == 0 {
            height
        } else {
            (threshold / width as u64).clamp(1, height as u64) as u32
        };
        Self {
            width,
            height,
            stripe_height: stripe_height.max(1),
        }
    }

    /// Rows per stripe (the last stripe may be shorter).
    pub fn stripe_height(&self) -> u32 {
        self.stripe_height
    }

    /// Total number of stripes.
    pub fn stripe_count(&self) -> usize {
        if self.height == 0 {
            return 0;
        }
        self.height.div_ceil(self.stripe_height) as usize
    }

    /// Check if the image is split at all.
    pub fn is_multi(&self) -> bool {
        self.stripe_count() > 1
    }

    /// Iterate over the stripes top to bottom.
    pub fn stripes(&self) -> StripeIterator {
        StripeIterator {
            plan: *self,
            next_y: 0,
            index: 0,
        }
    }
}

/// Iterator over stripes in an image.
pub struct StripeIterator {
    plan: StripePlan,
    next_y: u32,
    index: usize,
}

impl Iterator for StripeIterator {
    type Item = StripeRegion;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_y >= self.plan.height {
            return None;
        }
        let y = self.next_y;
        let height = self.plan.stripe_height.min(self.plan.height - y);
        let region = StripeRegion {
            index: self.index,
            y,
            height,
            width: self.plan.width,
        };
        self.next_y += height;
        self.index += 1;
        Some(region)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.plan.stripe_count().saturating_sub(self.index);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for StripeIterator {}

/// Run `process_stripe` over every stripe and assemble the output image.
///
/// `process_stripe` receives the stripe, its source bytes and the matching
/// slice of the output buffer. `on_stripe_done` is called with
/// `(completed, total)` after each stripe.
pub fn process_striped<F, P>(
    image: &RgbaImage,
    plan: &StripePlan,
    cancel: &CancellationToken,
    mut on_stripe_done: P,
    mut process_stripe: F,
) -> EngineResult<RgbaImage>
where
    F: FnMut(&StripeRegion, &[u8], &mut [u8]) -> EngineResult<()>,
    P: FnMut(usize, usize),
{
    let (width, height) = image.dimensions();
    let src = image.as_raw();
    let mut out = vec![0u8; src.len()];
    let total = plan.stripe_count();

    for region in plan.stripes() {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let range = region.byte_range();
        process_stripe(&region, &src[range.clone()], &mut out[range])?;
        on_stripe_done(region.index + 1, total);
        if region.index + 1 < total {
            std::thread::yield_now();
        }
    }

    RgbaImage::from_raw(width, height, out).ok_or_else(|| {
        EngineError::InvalidInput(format!("output buffer does not match {}x{}", width, height))
    })
}
