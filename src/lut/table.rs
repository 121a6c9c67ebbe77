//! Dense cubic lookup table and trilinear sampling.

use crate::core::error::{LutParseError, LutResult};
use std::io::BufRead;
use std::path::Path;

/// Smallest usable cube side.
pub const MIN_LUT_SIZE: usize = 2;

/// Largest cube side accepted from a file.
pub const MAX_LUT_SIZE: usize = 256;

/// Full-scale values recognized when normalizing integer-coded tables.
const INTEGER_FULL_SCALES: [f32; 5] = [1.0, 255.0, 1023.0, 4095.0, 65535.0];

/// Distance from a grid node, in index units, treated as lying on the node.
const GRID_SNAP: f32 = 1e-4;

/// A 3D color lookup table of side `N`.
///
/// Cells are stored in canonical `.cube` order with red varying fastest,
/// so cell `(r, g, b)` lives at `r + g*N + b*N*N`. Values are kept as read,
/// without clamping.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupTable {
    size: usize,
    data: Vec<[f32; 3]>,
    title: Option<String>,
}

impl LookupTable {
    /// Build a table from cells in canonical order.
    pub fn from_data(size: usize, data: Vec<[f32; 3]>, title: Option<String>) -> LutResult<Self> {
        if size < MIN_LUT_SIZE {
            return Err(LutParseError::InvalidSize(size.to_string()));
        }
        let expected = size * size * size;
        if data.len() != expected {
            return Err(LutParseError::LutIncomplete {
                expected,
                found: data.len(),
            });
        }
        let finite = data
            .iter()
            .filter(|cell| cell.iter().all(|v| v.is_finite()))
            .count();
        if finite != expected {
            return Err(LutParseError::LutIncomplete {
                expected,
                found: finite,
            });
        }
        Ok(Self { size, data, title })
    }

    /// Build a table by evaluating `f` at every grid node.
    pub fn from_fn(size: usize, f: impl Fn([f32; 3]) -> [f32; 3]) -> Self {
        let size = size.max(MIN_LUT_SIZE);
        let scale = (size - 1) as f32;
        let mut data = Vec::with_capacity(size * size * size);
        for b in 0..size {
            for g in 0..size {
                for r in 0..size {
                    data.push(f([r as f32 / scale, g as f32 / scale, b as f32 / scale]));
                }
            }
        }
        Self {
            size,
            data,
            title: None,
        }
    }

    /// The identity transform.
    pub fn identity(size: usize) -> Self {
        Self::from_fn(size, |rgb| rgb)
    }

    /// Parse `.cube` text.
    pub fn parse_cube(text: &str) -> LutResult<Self> {
        super::parser::parse_cube(text)
    }

    /// Parse `.cube` text from a reader.
    pub fn from_reader(reader: impl BufRead) -> LutResult<Self> {
        super::parser::parse_cube_reader(reader)
    }

    /// Read and parse a `.cube` file.
    pub fn open(path: impl AsRef<Path>) -> LutResult<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    /// Cube side `N`.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Optional `TITLE` from the source file.
    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    /// Replace the title.
    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title;
        self
    }

    /// Cells in canonical order.
    pub fn data(&self) -> &[[f32; 3]] {
        &self.data
    }

    /// Number of cells (`N^3`).
    pub fn cell_count(&self) -> usize {
        self.data.len()
    }

    /// Approximate heap size in bytes.
    pub fn memory_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<[f32; 3]>()
    }

    #[inline]
    fn index(&self, r: usize, g: usize, b: usize) -> usize {
        r + g * self.size + b * self.size * self.size
    }

    /// Stored cell at integer grid coordinates.
    #[inline]
    pub fn get(&self, r: usize, g: usize, b: usize) -> [f32; 3] {
        self.data[self.index(r, g, b)]
    }

    /// Trilinear lookup of a color in `[0, 1]`.
    ///
    /// Inputs outside the unit cube are clamped to the nearest edge cell.
    /// Inputs lying on a grid node return the stored cell exactly.
    pub fn sample(&self, rgb: [f32; 3]) -> [f32; 3] {
        let max_index = self.size - 1;
        let scale = max_index as f32;

        let (r0, r1, fr) = axis(rgb[0], scale, max_index);
        let (g0, g1, fg) = axis(rgb[1], scale, max_index);
        let (b0, b1, fb) = axis(rgb[2], scale, max_index);

        let c000 = self.get(r0, g0, b0);
        let c100 = self.get(r1, g0, b0);
        let c010 = self.get(r0, g1, b0);
        let c110 = self.get(r1, g1, b0);
        let c001 = self.get(r0, g0, b1);
        let c101 = self.get(r1, g0, b1);
        let c011 = self.get(r0, g1, b1);
        let c111 = self.get(r1, g1, b1);

        let mut out = [0.0f32; 3];
        for c in 0..3 {
            // R, then G, then B
            let c00 = lerp(c000[c], c100[c], fr);
            let c10 = lerp(c010[c], c110[c], fr);
            let c01 = lerp(c001[c], c101[c], fr);
            let c11 = lerp(c011[c], c111[c], fr);
            let c0 = lerp(c00, c10, fg);
            let c1 = lerp(c01, c11, fg);
            out[c] = lerp(c0, c1, fb);
        }
        out
    }

    /// Smallest and largest stored component.
    pub fn value_range(&self) -> (f32, f32) {
        self.data
            .iter()
            .flat_map(|cell| cell.iter().copied())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(v), hi.max(v))
            })
    }

    /// Full scale of an integer-coded table, or `None` if already in `[0, 1]`.
    ///
    /// Tables whose maximum exceeds 1.1 are assumed to be integer-coded; the
    /// smallest common bit-depth full scale covering the maximum is used.
    pub fn detected_full_scale(&self) -> Option<f32> {
        let (_, max) = self.value_range();
        if max.is_nan() || max <= 1.1 {
            return None;
        }
        Some(
            INTEGER_FULL_SCALES
                .iter()
                .copied()
                .find(|scale| max <= *scale)
                .unwrap_or(max),
        )
    }

    /// Copy of this table rescaled into `[0, 1]` when it is integer-coded.
    pub fn normalized(&self) -> Self {
        match self.detected_full_scale() {
            Some(scale) => Self {
                size: self.size,
                data: self
                    .data
                    .iter()
                    .map(|cell| cell.map(|v| (v / scale).clamp(0.0, 1.0)))
                    .collect(),
                title: self.title.clone(),
            },
            None => self.clone(),
        }
    }

    /// Cells padded to four floats for GPU storage buffers.
    pub fn to_rgba_f32(&self) -> Vec<f32> {
        self.data
            .iter()
            .flat_map(|cell| [cell[0], cell[1], cell[2], 0.0])
            .collect()
    }
}

/// Lower index, upper index and fraction along one axis.
#[inline]
fn axis(value: f32, scale: f32, max_index: usize) -> (usize, usize, f32) {
    let mut scaled = value.clamp(0.0, 1.0) * scale;
    let nearest = scaled.round();
    if (scaled - nearest).abs() < GRID_SNAP {
        scaled = nearest;
    }
    let lower = (scaled.floor() as usize).min(max_index);
    let upper = (lower + 1).min(max_index);
    (lower, upper, scaled - lower as f32)
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a * (1.0 - t) + b * t
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn warm() -> LookupTable {
        LookupTable::from_fn(17, |[r, g, b]| [r * 0.9 + 0.1, g * g, (b + 0.05).min(1.0)])
    }

    #[test]
    fn test_from_data_validates_count() {
        let err = LookupTable::from_data(4, vec![[0.0; 3]; 60], None).unwrap_err();
        assert_eq!(
            err,
            LutParseError::LutIncomplete {
                expected: 64,
                found: 60
            }
        );
        assert!(LookupTable::from_data(1, vec![[0.0; 3]], None).is_err());
    }

    #[test]
    fn test_from_data_rejects_non_finite_cells() {
        let mut data = vec![[0.5; 3]; 8];
        data[7] = [f32::NAN, f32::INFINITY, f32::NEG_INFINITY];
        assert_eq!(
            LookupTable::from_data(2, data, None).unwrap_err(),
            LutParseError::LutIncomplete {
                expected: 8,
                found: 7
            }
        );
    }

    #[test]
    fn test_canonical_order_red_fastest() {
        let table = LookupTable::identity(3);
        assert_eq!(table.data()[1], [0.5, 0.0, 0.0]);
        assert_eq!(table.data()[3], [0.0, 0.5, 0.0]);
        assert_eq!(table.data()[9], [0.0, 0.0, 0.5]);
        assert_eq!(table.get(2, 1, 0), [1.0, 0.5, 0.0]);
    }

    #[test]
    fn test_grid_aligned_inputs_are_exact() {
        for size in [2usize, 17, 33, 64] {
            let table = LookupTable::from_fn(size, |[r, g, b]| [r * r, 1.0 - g, (r + b) * 0.5]);
            let scale = (size - 1) as f32;
            for &(r, g, b) in &[(0, 0, 0), (1, 0, size - 1), (size - 1, size / 2, 1), (size / 3, size - 2, size / 2)] {
                let input = [r as f32 / scale, g as f32 / scale, b as f32 / scale];
                assert_eq!(table.sample(input), table.get(r, g, b), "size {} at {:?}", size, (r, g, b));
            }
        }
    }

    #[test]
    fn test_out_of_range_inputs_clamp_to_edge() {
        let table = warm();
        assert_eq!(table.sample([-0.5, -1.0, -2.0]), table.get(0, 0, 0));
        assert_eq!(table.sample([1.5, 2.0, 9.0]), table.get(16, 16, 16));
    }

    #[test]
    fn test_midpoint_interpolates() {
        let table = LookupTable::from_data(
            2,
            vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
                [1.0, 0.0, 1.0],
                [0.0, 1.0, 1.0],
                [1.0, 1.0, 1.0],
            ],
            None,
        )
        .unwrap();
        let out = table.sample([0.25, 0.5, 0.75]);
        for (o, e) in out.iter().zip([0.25, 0.5, 0.75]) {
            assert!((o - e).abs() < 1e-6);
        }
    }

    #[test]
    fn test_normalization_detects_bit_depth() {
        let ten_bit = LookupTable::from_fn(2, |[r, g, b]| [r * 1000.0, g * 1023.0, b * 512.0]);
        assert_eq!(ten_bit.detected_full_scale(), Some(1023.0));
        let normalized = ten_bit.normalized();
        assert_eq!(normalized.get(0, 1, 0)[1], 1.0);
        assert!(normalized.value_range().1 <= 1.0);

        let unit = LookupTable::identity(2);
        assert_eq!(unit.detected_full_scale(), None);
        assert_eq!(unit.normalized(), unit);

        let odd = LookupTable::from_fn(2, |[r, _, _]| [r * 70000.0, 0.0, 0.0]);
        assert_eq!(odd.detected_full_scale(), Some(70000.0));
    }

    #[test]
    fn test_rgba_padding() {
        let table = LookupTable::identity(2);
        let flat = table.to_rgba_f32();
        assert_eq!(flat.len(), 8 * 4);
        assert_eq!(&flat[4..8], &[1.0, 0.0, 0.0, 0.0]);
    }

    proptest! {
        #[test]
        fn prop_identity_table_is_identity(r in 0.0f32..=1.0, g in 0.0f32..=1.0, b in 0.0f32..=1.0) {
            let table = LookupTable::identity(33);
            let out = table.sample([r, g, b]);
            for (o, i) in out.iter().zip([r, g, b]) {
                prop_assert!((o - i).abs() < 1e-3);
            }
        }

        #[test]
        fn prop_sample_stays_within_cell_bounds(r in 0.0f32..=1.0, g in 0.0f32..=1.0, b in 0.0f32..=1.0) {
            let table = LookupTable::from_fn(9, |[r, g, b]| [r * g, (g + b) * 0.5, 1.0 - r]);
            let (lo, hi) = table.value_range();
            for v in table.sample([r, g, b]) {
                prop_assert!(v >= lo - 1e-6 && v <= hi + 1e-6);
            }
        }
    }
}
