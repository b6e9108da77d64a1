//! Tabulated focus positions per filter and temperature
//! (`FocusTemp.dat`).
//!
//! Rows are `<filter-char> <temp °C> <position µm>`, `#` comments
//! allowed. Lookup interpolates linearly between the two bracketing
//! temperatures for the filter; outside the measured range the nearest
//! row is used, as long as it lies within the configured interpolation
//! reach.

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FocusTableError {
    #[error("focus table I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("focus table line {0}: expected `<filter> <temp> <position>`")]
    BadLine(usize),
}

#[derive(Debug, Clone, Copy)]
struct Row {
    filter: char,
    temp: f64,
    pos_um: f64,
}

/// The loaded table. An empty table never resolves a position, pushing
/// callers to the two-point `filter.cfg` fallback.
#[derive(Debug, Clone, Default)]
pub struct FocusTable {
    rows: Vec<Row>,
}

impl FocusTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the table; a missing file yields the empty table.
    pub fn load(path: &Path) -> Result<Self, FocusTableError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::empty());
            }
            Err(e) => return Err(e.into()),
        };

        let mut rows = Vec::new();
        for (i, line) in content.lines().enumerate() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let mut it = line.split_whitespace();
            let filter = it
                .next()
                .and_then(|t| t.chars().next())
                .ok_or(FocusTableError::BadLine(i + 1))?;
            let temp: f64 = it
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or(FocusTableError::BadLine(i + 1))?;
            let pos_um: f64 = it
                .next()
                .and_then(|t| t.parse().ok())
                .ok_or(FocusTableError::BadLine(i + 1))?;
            rows.push(Row {
                filter: filter.to_ascii_uppercase(),
                temp,
                pos_um,
            });
        }
        Ok(Self { rows })
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Interpolated position for `filter` at `temp`.
    ///
    /// `max_interp <= 0` means unlimited reach beyond the measured range.
    pub fn find(&self, filter: char, temp: f64, max_interp: i32) -> Option<f64> {
        let want = filter.to_ascii_uppercase();
        let mut rows: Vec<&Row> = self.rows.iter().filter(|r| r.filter == want).collect();
        if rows.is_empty() {
            return None;
        }
        rows.sort_by(|a, b| a.temp.total_cmp(&b.temp));

        let reach_ok = |dist: f64| max_interp <= 0 || dist <= f64::from(max_interp);

        let first = rows[0];
        let last = rows[rows.len() - 1];
        if temp <= first.temp {
            return reach_ok(first.temp - temp).then_some(first.pos_um);
        }
        if temp >= last.temp {
            return reach_ok(temp - last.temp).then_some(last.pos_um);
        }

        for pair in rows.windows(2) {
            let (lo, hi) = (pair[0], pair[1]);
            if temp >= lo.temp && temp <= hi.temp {
                if hi.temp == lo.temp {
                    return Some(lo.pos_um);
                }
                let frac = (temp - lo.temp) / (hi.temp - lo.temp);
                return Some(lo.pos_um + frac * (hi.pos_um - lo.pos_um));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn table() -> FocusTable {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# filter temp position").unwrap();
        writeln!(f, "C -10.0 1400.0").unwrap();
        writeln!(f, "C  10.0 1500.0").unwrap();
        writeln!(f, "C  30.0 1560.0").unwrap();
        writeln!(f, "B   0.0 1450.0").unwrap();
        f.flush().unwrap();
        FocusTable::load(f.path()).unwrap()
    }

    #[test]
    fn interpolates_between_rows() {
        let t = table();
        assert_eq!(t.find('C', 0.0, 0), Some(1450.0));
        assert_eq!(t.find('C', 20.0, 0), Some(1530.0));
        // Case-insensitive filter lookup.
        assert_eq!(t.find('c', 10.0, 0), Some(1500.0));
    }

    #[test]
    fn clamps_outside_range_within_reach() {
        let t = table();
        assert_eq!(t.find('C', -12.0, 5), Some(1400.0));
        assert_eq!(t.find('C', -30.0, 5), None); // 20 degrees past the end
        assert_eq!(t.find('C', -30.0, 0), Some(1400.0)); // unlimited reach
    }

    #[test]
    fn unknown_filter_is_none() {
        let t = table();
        assert_eq!(t.find('X', 10.0, 0), None);
    }

    #[test]
    fn missing_file_is_empty() {
        let t = FocusTable::load(Path::new("/nonexistent/FocusTemp.dat")).unwrap();
        assert!(t.is_empty());
        assert_eq!(t.find('C', 10.0, 0), None);
    }

    #[test]
    fn bad_rows_are_rejected() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "C ten 1400.0").unwrap();
        f.flush().unwrap();
        assert!(matches!(
            FocusTable::load(f.path()),
            Err(FocusTableError::BadLine(1))
        ));
    }
}
