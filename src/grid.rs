// Sheet grid - vendor spreadsheets as rows x columns of cells
// Vendors export their sheets as CSV; everything downstream works on the
// in-memory grid, so parsers never touch files or the csv crate directly.

use anyhow::{Context, Result};
use csv::ReaderBuilder;
use std::io::Read;
use std::path::Path;

/// A raw spreadsheet: rows of cells, no header interpretation.
/// Rows may have different lengths; out-of-range access reads as an
/// empty cell, which is how real sheets behave once trailing blanks are
/// trimmed.
#[derive(Debug, Clone, Default)]
pub struct SheetGrid {
    rows: Vec<Vec<String>>,
}

impl SheetGrid {
    pub fn new(rows: Vec<Vec<String>>) -> Self {
        SheetGrid { rows }
    }

    /// Build a grid from string slices. Test and fixture helper.
    pub fn from_rows(rows: &[&[&str]]) -> Self {
        SheetGrid {
            rows: rows
                .iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        }
    }

    pub fn read_csv_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open sheet: {}", path.display()))?;
        Self::read_csv(file)
    }

    /// Read a CSV export into a grid. Headers are NOT treated specially -
    /// header detection is the parsers' job, per vendor.
    pub fn read_csv<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);

        let mut rows = Vec::new();
        for (line_num, result) in rdr.records().enumerate() {
            let record = result.with_context(|| format!("Failed to read CSV line {}", line_num + 1))?;
            rows.push(record.iter().map(|c| c.to_string()).collect());
        }

        Ok(SheetGrid { rows })
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Widest row in the grid.
    pub fn col_count(&self) -> usize {
        self.rows.iter().map(|r| r.len()).max().unwrap_or(0)
    }

    /// Trimmed cell content; empty string for anything out of range.
    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(|c| c.trim())
            .unwrap_or("")
    }

    pub fn row(&self, row: usize) -> &[String] {
        self.rows.get(row).map(|r| r.as_slice()).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Normalize a header cell for token matching: lowercase, whitespace and
/// punctuation collapsed away. "Box No." and "BOX NO" both become "boxno".
pub fn header_token(cell: &str) -> String {
    cell.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_csv_flexible_rows() {
        let data = "a,b,c\nd,e\nf,g,h,i\n";
        let grid = SheetGrid::read_csv(data.as_bytes()).unwrap();

        assert_eq!(grid.row_count(), 3);
        assert_eq!(grid.col_count(), 4);
        assert_eq!(grid.cell(0, 0), "a");
        assert_eq!(grid.cell(1, 2), "");
        assert_eq!(grid.cell(2, 3), "i");
    }

    #[test]
    fn test_cell_out_of_range_is_empty() {
        let grid = SheetGrid::from_rows(&[&["x"]]);
        assert_eq!(grid.cell(0, 5), "");
        assert_eq!(grid.cell(9, 0), "");
    }

    #[test]
    fn test_cell_is_trimmed() {
        let grid = SheetGrid::from_rows(&[&["  FMC920  ", "\tbox no\t"]]);
        assert_eq!(grid.cell(0, 0), "FMC920");
        assert_eq!(grid.cell(0, 1), "box no");
    }

    #[test]
    fn test_header_token_normalization() {
        assert_eq!(header_token("Box No."), "boxno");
        assert_eq!(header_token("IMEI / Serial"), "imeiserial");
        assert_eq!(header_token("  BOX-NO  "), "boxno");
    }
}
