//! `.cube` writer with fixed-size resampling.

use crate::lut::table::LookupTable;
use std::fmt::Write as _;
use std::path::Path;

/// Cube side of exported tables.
pub const EXPORT_SIZE: usize = 33;

/// Resample a table to side `size` by trilinear lookup at each new grid node.
pub fn resample(table: &LookupTable, size: usize) -> LookupTable {
    LookupTable::from_fn(size, |rgb| table.sample(rgb)).with_title(table.title().map(String::from))
}

/// Render a table as `.cube` text at [`EXPORT_SIZE`].
///
/// Integer-coded tables are normalized first. `title` overrides the table's
/// own title when given.
pub fn export_cube(table: &LookupTable, title: Option<&str>) -> String {
    let normalized = table.normalized();
    let resampled = resample(&normalized, EXPORT_SIZE);
    let title = title.or(table.title());
    format_cube(&resampled, table.size(), title)
}

/// Write [`export_cube`] output to a file.
pub fn write_cube(table: &LookupTable, title: Option<&str>, path: impl AsRef<Path>) -> std::io::Result<()> {
    std::fs::write(path, export_cube(table, title))
}

fn format_cube(table: &LookupTable, source_size: usize, title: Option<&str>) -> String {
    let n = table.size();
    // roughly 30 bytes per row
    let mut out = String::with_capacity(table.cell_count() * 30 + 256);
    let _ = writeln!(
        out,
        "# Converted from {0}x{0}x{0} to {1}x{1}x{1}",
        source_size, n
    );
    if let Some(title) = title {
        let _ = writeln!(out, "TITLE \"{}\"", title);
    }
    let _ = writeln!(out, "LUT_3D_SIZE {}", n);
    out.push_str("DOMAIN_MIN 0.0 0.0 0.0\n");
    out.push_str("DOMAIN_MAX 1.0 1.0 1.0\n");
    out.push('\n');
    for [r, g, b] in table.data() {
        let _ = writeln!(out, "{} {} {}", r, g, b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lut::parser::parse_cube;

    fn sample_table() -> LookupTable {
        LookupTable::from_fn(17, |[r, g, b]| [(r * 1.1).min(1.0), g * 0.8 + 0.1, b * b])
            .with_title(Some("Teal".into()))
    }

    #[test]
    fn test_header_layout() {
        let text = export_cube(&sample_table(), None);
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("# Converted from 17x17x17 to 33x33x33"));
        assert_eq!(lines.next(), Some("TITLE \"Teal\""));
        assert_eq!(lines.next(), Some("LUT_3D_SIZE 33"));
        assert_eq!(lines.next(), Some("DOMAIN_MIN 0.0 0.0 0.0"));
        assert_eq!(lines.next(), Some("DOMAIN_MAX 1.0 1.0 1.0"));
        assert_eq!(lines.next(), Some(""));
        assert_eq!(text.lines().count(), 6 + 33 * 33 * 33);
    }

    #[test]
    fn test_title_override_and_absence() {
        let text = export_cube(&sample_table(), Some("Night"));
        assert!(text.contains("TITLE \"Night\""));
        let untitled = LookupTable::identity(5);
        assert!(!export_cube(&untitled, None).contains("TITLE"));
    }

    #[test]
    fn test_export_reparse_is_idempotent() {
        let exported = parse_cube(&export_cube(&sample_table(), None)).unwrap();
        assert_eq!(exported.size(), EXPORT_SIZE);

        let again = parse_cube(&export_cube(&exported, None)).unwrap();
        assert_eq!(again, exported);
    }

    #[test]
    fn test_resample_preserves_shared_grid_nodes() {
        // 17-grid nodes are every other 33-grid node
        let table = sample_table();
        let resampled = resample(&table, 33);
        for &(r, g, b) in &[(0, 0, 0), (3, 7, 11), (16, 16, 16), (8, 0, 15)] {
            assert_eq!(resampled.get(r * 2, g * 2, b * 2), table.get(r, g, b));
        }
    }

    #[test]
    fn test_integer_tables_are_normalized_on_export() {
        let table = LookupTable::from_fn(2, |[r, g, b]| [r * 255.0, g * 255.0, b * 255.0]);
        let exported = parse_cube(&export_cube(&table, None)).unwrap();
        assert_eq!(exported.value_range(), (0.0, 1.0));
    }

    #[test]
    fn test_write_cube() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.cube");
        write_cube(&LookupTable::identity(3), Some("Id"), &path).unwrap();
        let table = LookupTable::open(&path).unwrap();
        assert_eq!(table.title(), Some("Id"));
        assert_eq!(table.size(), 33);
    }
}
