//! `.cube` text parser.
//!
//! Each data row is tried twice: first with a strict grammar (exactly three
//! plain decimal numbers), then with a loose split on whitespace and commas
//! that takes the first three tokens. Rows failing both are discarded with a
//! warning, and the table is rejected if the discards leave it incomplete.

use crate::core::error::{LutParseError, LutResult};
use crate::lut::table::{LookupTable, MAX_LUT_SIZE, MIN_LUT_SIZE};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;

/// Container format of a LUT file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LutFormat {
    /// Adobe/Resolve `.cube`.
    Cube,
    /// `.vlt` with a cube-style body.
    Vlt,
}

impl LutFormat {
    /// Guess the format from a file name; anything unrecognized is `.cube`.
    pub fn from_file_name(name: &str) -> Self {
        let ext = Path::new(name)
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match ext.as_str() {
            "vlt" => LutFormat::Vlt,
            _ => LutFormat::Cube,
        }
    }
}

/// Header summary read without parsing the data rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LutInfo {
    /// Declared grid side.
    pub size: usize,
    /// Format guessed from the file name.
    pub format: LutFormat,
    /// `TITLE` line, if any.
    pub title: Option<String>,
}

/// Parser state shared by the string and reader entry points.
#[derive(Default)]
struct CubeParser {
    size: Option<usize>,
    title: Option<String>,
    data: Vec<[f32; 3]>,
    discarded: usize,
    loose_rows: usize,
}

enum Line<'a> {
    Skip,
    Keyword(&'a str, &'a str),
    Row(&'a str),
}

fn classify(raw: &str) -> Line<'_> {
    let line = raw.trim().trim_start_matches('\u{feff}');
    if line.is_empty() || line.starts_with('#') {
        return Line::Skip;
    }
    let (head, rest) = match line.find(char::is_whitespace) {
        Some(pos) => (&line[..pos], line[pos..].trim()),
        None => (line, ""),
    };
    let is_keyword = head.starts_with(|c: char| c.is_ascii_uppercase())
        && head
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
    if is_keyword {
        Line::Keyword(head, rest)
    } else {
        Line::Row(line)
    }
}

fn unquote(value: &str) -> String {
    value.trim().trim_matches('"').to_string()
}

impl CubeParser {
    fn expected(&self) -> Option<usize> {
        self.size.map(|n| n * n * n)
    }

    fn is_full(&self) -> bool {
        self.expected().map_or(false, |e| self.data.len() >= e)
    }

    fn feed(&mut self, line_no: usize, raw: &str) -> LutResult<()> {
        match classify(raw) {
            Line::Skip => {}
            Line::Keyword("LUT_3D_SIZE", value) => {
                let size: usize = value
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| LutParseError::InvalidSize(value.to_string()))?;
                if !(MIN_LUT_SIZE..=MAX_LUT_SIZE).contains(&size) {
                    return Err(LutParseError::InvalidSize(size.to_string()));
                }
                self.size = Some(size);
                self.data.reserve(size * size * size);
            }
            Line::Keyword("TITLE", value) => self.title = Some(unquote(value)),
            Line::Keyword(keyword, _) => {
                debug!("Skipping LUT keyword {} on line {}", keyword, line_no);
            }
            Line::Row(row) => {
                if self.size.is_none() {
                    warn!("Ignoring LUT row {} before LUT_3D_SIZE", line_no);
                    return Ok(());
                }
                if self.is_full() {
                    return Ok(());
                }
                if let Some(rgb) = parse_strict(row) {
                    self.data.push(rgb);
                } else if let Some(rgb) = parse_loose(row) {
                    self.loose_rows += 1;
                    self.data.push(rgb);
                } else {
                    self.discarded += 1;
                    warn!("Discarding malformed LUT row {}: {:?}", line_no, row);
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> LutResult<LookupTable> {
        let size = self.size.ok_or(LutParseError::MissingSize)?;
        let expected = size * size * size;
        if self.data.len() != expected {
            return Err(LutParseError::LutIncomplete {
                expected,
                found: self.data.len(),
            });
        }
        if self.loose_rows > 0 || self.discarded > 0 {
            debug!(
                "Parsed {}^3 LUT with {} loosely-parsed and {} discarded rows",
                size, self.loose_rows, self.discarded
            );
        }
        LookupTable::from_data(size, self.data, self.title)
    }
}

/// Parse `.cube` text.
pub fn parse_cube(text: &str) -> LutResult<LookupTable> {
    let mut parser = CubeParser::default();
    for (i, line) in text.lines().enumerate() {
        parser.feed(i + 1, line)?;
    }
    parser.finish()
}

/// Parse `.cube` text from a reader, tolerating invalid UTF-8.
pub fn parse_cube_reader(mut reader: impl BufRead) -> LutResult<LookupTable> {
    let mut parser = CubeParser::default();
    let mut buf = Vec::new();
    let mut line_no = 0;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_no += 1;
        parser.feed(line_no, &String::from_utf8_lossy(&buf))?;
    }
    parser.finish()
}

/// Parse raw `.cube` bytes.
pub fn parse_cube_bytes(bytes: &[u8]) -> LutResult<LookupTable> {
    parse_cube_reader(bytes)
}

/// Read the size and title of a table without parsing its rows.
///
/// Returns `None` when no valid `LUT_3D_SIZE` line precedes the data.
pub fn detect_info(text: &str, file_name: &str) -> Option<LutInfo> {
    let mut title = None;
    for line in text.lines() {
        match classify(line) {
            Line::Keyword("TITLE", value) => title = Some(unquote(value)),
            Line::Keyword("LUT_3D_SIZE", value) => {
                let size = value.split_whitespace().next()?.parse().ok()?;
                return Some(LutInfo {
                    size,
                    format: LutFormat::from_file_name(file_name),
                    title,
                });
            }
            Line::Row(_) => return None,
            _ => {}
        }
    }
    None
}

fn is_plain_number(token: &str) -> bool {
    let body = token.strip_prefix(['+', '-']).unwrap_or(token);
    let (mantissa, exponent) = match body.find(['e', 'E']) {
        Some(pos) => (&body[..pos], Some(&body[pos + 1..])),
        None => (body, None),
    };
    let mut digits = 0;
    let mut dots = 0;
    for c in mantissa.chars() {
        match c {
            '0'..='9' => digits += 1,
            '.' => dots += 1,
            _ => return false,
        }
    }
    if digits == 0 || dots > 1 {
        return false;
    }
    match exponent {
        None => true,
        Some(exp) => {
            let exp = exp.strip_prefix(['+', '-']).unwrap_or(exp);
            !exp.is_empty() && exp.chars().all(|c| c.is_ascii_digit())
        }
    }
}

fn parse_strict(row: &str) -> Option<[f32; 3]> {
    let mut tokens = row.split_whitespace();
    let mut out = [0.0f32; 3];
    for slot in out.iter_mut() {
        let token = tokens.next()?;
        if !is_plain_number(token) {
            return None;
        }
        *slot = token.parse().ok()?;
    }
    if tokens.next().is_some() {
        return None;
    }
    Some(out)
}

fn parse_loose(row: &str) -> Option<[f32; 3]> {
    let mut tokens = row
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter(|t| !t.is_empty());
    let mut out = [0.0f32; 3];
    for slot in out.iter_mut() {
        let value: f32 = tokens.next()?.parse().ok()?;
        if !value.is_finite() {
            return None;
        }
        *slot = value;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_text(size: usize, rows: usize) -> String {
        let mut text = format!("TITLE \"Test\"\nLUT_3D_SIZE {}\nDOMAIN_MIN 0.0 0.0 0.0\nDOMAIN_MAX 1.0 1.0 1.0\n", size);
        let scale = (size - 1) as f32;
        for k in 0..rows {
            let r = k % size;
            let g = (k / size) % size;
            let b = k / (size * size);
            text.push_str(&format!("{} {} {}\n", r as f32 / scale, g as f32 / scale, b as f32 / scale));
        }
        text
    }

    #[test]
    fn test_parse_identity() {
        let table = parse_cube(&cube_text(3, 27)).unwrap();
        assert_eq!(table.size(), 3);
        assert_eq!(table.title(), Some("Test"));
        assert_eq!(table, LookupTable::identity(3).with_title(Some("Test".into())));
    }

    #[test]
    fn test_row_order_maps_red_fastest() {
        let text = "LUT_3D_SIZE 2\n0 0 0\n0.1 0 0\n0 0.2 0\n0 0 0\n0 0 0\n0 0 0\n0 0 0\n0.3 0.3 0.3\n";
        let table = parse_cube(text).unwrap();
        assert_eq!(table.get(1, 0, 0), [0.1, 0.0, 0.0]);
        assert_eq!(table.get(0, 1, 0), [0.0, 0.2, 0.0]);
        assert_eq!(table.get(1, 1, 1), [0.3, 0.3, 0.3]);
    }

    #[test]
    fn test_incomplete_table_rejected() {
        let err = parse_cube(&cube_text(4, 60)).unwrap_err();
        assert_eq!(
            err,
            LutParseError::LutIncomplete {
                expected: 64,
                found: 60
            }
        );
    }

    #[test]
    fn test_missing_and_invalid_size() {
        assert_eq!(parse_cube("0 0 0\n1 1 1\n").unwrap_err(), LutParseError::MissingSize);
        assert!(matches!(
            parse_cube("LUT_3D_SIZE abc\n").unwrap_err(),
            LutParseError::InvalidSize(_)
        ));
        assert!(matches!(
            parse_cube("LUT_3D_SIZE 1\n0 0 0\n").unwrap_err(),
            LutParseError::InvalidSize(_)
        ));
    }

    #[test]
    fn test_comments_blank_lines_and_extra_rows() {
        let mut text = String::from("# header comment\n\nLUT_3D_SIZE 2\n");
        for k in 0..8 {
            text.push_str(&format!("# row {}\n\n{} {} {}\n", k, k % 2, (k / 2) % 2, k / 4));
        }
        text.push_str("0.5 0.5 0.5\n");
        let table = parse_cube(&text).unwrap();
        assert_eq!(table, LookupTable::identity(2));
    }

    #[test]
    fn test_loose_rows_are_recovered() {
        let text = "LUT_3D_SIZE 2\n0 0 0\n1,0,0\n0 1 0 # trailing\n1 1 0\n0\t0\t1\n1 0 1 extra\n0 1 1\n1. 1. 1.\n";
        let table = parse_cube(text).unwrap();
        assert_eq!(table, LookupTable::identity(2));
    }

    #[test]
    fn test_malformed_row_discarded_makes_table_incomplete() {
        let text = "LUT_3D_SIZE 2\n0 0 0\n1 0 0\nbad row here\n0 1 0\n1 1 0\n0 0 1\n1 0 1\n0 1 1\n";
        assert_eq!(
            parse_cube(text).unwrap_err(),
            LutParseError::LutIncomplete {
                expected: 8,
                found: 7
            }
        );
    }

    #[test]
    fn test_non_finite_row_discarded() {
        let text = "LUT_3D_SIZE 2\n0 0 0\n1 0 0\n0 1 0\n1 1 0\n0 0 1\n1 0 1\n0 1 1\nnan 0 0\n";
        assert_eq!(
            parse_cube(text).unwrap_err(),
            LutParseError::LutIncomplete {
                expected: 8,
                found: 7
            }
        );
        assert_eq!(parse_loose("nan inf -inf"), None);
        assert_eq!(parse_loose("0, inf, 1"), None);
    }

    #[test]
    fn test_values_not_clamped() {
        let mut text = String::from("LUT_3D_SIZE 2\n");
        for _ in 0..8 {
            text.push_str("255 -0.5 1e1\n");
        }
        let table = parse_cube(&text).unwrap();
        assert_eq!(table.get(0, 0, 0), [255.0, -0.5, 10.0]);
    }

    #[test]
    fn test_reader_matches_str() {
        let text = cube_text(5, 125);
        assert_eq!(
            parse_cube_bytes(text.as_bytes()).unwrap(),
            parse_cube(&text).unwrap()
        );
    }

    #[test]
    fn test_strict_grammar() {
        assert!(is_plain_number("0.5"));
        assert!(is_plain_number("-1e-3"));
        assert!(is_plain_number(".25"));
        assert!(!is_plain_number("nan"));
        assert!(!is_plain_number("1.2.3"));
        assert!(!is_plain_number("1e"));
        assert!(parse_strict("0 0 0 0").is_none());
        assert_eq!(parse_loose("0 0 0 0"), Some([0.0, 0.0, 0.0]));
    }

    #[test]
    fn test_detect_info() {
        let info = detect_info(&cube_text(17, 0), "film.CUBE").unwrap();
        assert_eq!(info.size, 17);
        assert_eq!(info.format, LutFormat::Cube);
        assert_eq!(info.title.as_deref(), Some("Test"));

        let info = detect_info("LUT_3D_SIZE 33\n", "grade.vlt").unwrap();
        assert_eq!(info.format, LutFormat::Vlt);
        assert_eq!(info.title, None);

        assert!(detect_info("0 0 0\n", "x.cube").is_none());
    }
}
