// Vendor sheet parsers
// One adapter per vendor layout, all sharing the same primitives: header
// detection, serial validation, box-code extraction, device resolution.
// A parse either yields the full label set or fails whole - an unresolved
// device means at least one label's target is unknown.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::catalog::DeviceCatalog;
use crate::error::{StockError, StockResult};
use crate::grid::{header_token, SheetGrid};
use crate::resolver;

// ============================================================================
// CORE TYPES
// ============================================================================

/// VendorLayout - which parsing strategy a vendor's sheets need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VendorLayout {
    /// Repeating horizontal sections, each with its own box/serial column
    /// pair and a device name above the header.
    Block,

    /// One serial column and one carton column; box code and device are
    /// both derived from the carton text.
    Carton,

    /// Dedicated named columns for device, serial and box. No inference.
    Explicit,

    /// No reliable box identifier anywhere; one synthetic box per file,
    /// device forced by the vendor profile.
    SingleBox,
}

impl VendorLayout {
    pub fn name(&self) -> &'static str {
        match self {
            VendorLayout::Block => "block",
            VendorLayout::Carton => "carton",
            VendorLayout::Explicit => "explicit",
            VendorLayout::SingleBox => "single-box",
        }
    }
}

/// Per-vendor parsing configuration. Vendors are finite and enumerated;
/// a profile is how one of them is wired to a layout strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VendorProfile {
    /// Vendor tag recorded on import batches.
    pub name: String,

    pub layout: VendorLayout,

    /// Strict vendors ship exactly 15-digit serials; everyone else gets
    /// the 14-17 digit window.
    pub strict_serials: bool,

    /// Device forced for the whole file (single-box layout only).
    pub forced_device: Option<String>,

    /// Width of the numeric carton suffix used as box code (carton
    /// layout only).
    pub carton_suffix_len: usize,
}

impl VendorProfile {
    pub fn block(name: &str) -> Self {
        VendorProfile {
            name: name.to_string(),
            layout: VendorLayout::Block,
            strict_serials: false,
            forced_device: None,
            carton_suffix_len: 0,
        }
    }

    pub fn carton(name: &str) -> Self {
        VendorProfile {
            name: name.to_string(),
            layout: VendorLayout::Carton,
            strict_serials: false,
            forced_device: None,
            carton_suffix_len: 5,
        }
    }

    pub fn explicit(name: &str) -> Self {
        VendorProfile {
            name: name.to_string(),
            layout: VendorLayout::Explicit,
            strict_serials: false,
            forced_device: None,
            carton_suffix_len: 0,
        }
    }

    pub fn single_box(name: &str, forced_device: &str) -> Self {
        VendorProfile {
            name: name.to_string(),
            layout: VendorLayout::SingleBox,
            strict_serials: false,
            forced_device: Some(forced_device.to_string()),
            carton_suffix_len: 0,
        }
    }

    /// Builder: require exactly 15-digit serials.
    pub fn with_strict_serials(mut self) -> Self {
        self.strict_serials = true;
        self
    }

    /// Builder: override the carton suffix width.
    pub fn with_carton_suffix_len(mut self, len: usize) -> Self {
        self.carton_suffix_len = len;
        self
    }
}

/// One parsed label: a device, a box code, and the unique serials that
/// go into that box. `qty` is unique serials x the device's
/// units-per-serial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedLabel {
    /// Catalog display name (already resolved).
    pub device: String,

    pub box_code: String,

    /// Optional storage location; parsers leave this empty, manual entry
    /// fills it in.
    pub location: Option<String>,

    /// Unique serials in first-seen order.
    pub serials: Vec<String>,

    pub qty: i64,
}

// ============================================================================
// SHARED PRIMITIVES
// ============================================================================

/// Rows scanned while looking for a header.
const HEADER_SCAN_ROWS: usize = 60;

/// How far right of a box column the matching serial column may sit.
const BLOCK_SERIAL_SPAN: usize = 20;

/// Blocks whose box column lands within this distance of an existing
/// block are near-duplicates (merged header cells) and are skipped.
const BLOCK_MIN_GAP: usize = 2;

/// Validate and normalize a serial: strip non-digits, then require 14-17
/// digits (exactly 15 for strict vendors).
pub fn clean_serial(raw: &str, strict: bool) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let valid = if strict {
        digits.len() == 15
    } else {
        (14..=17).contains(&digits.len())
    };
    valid.then_some(digits)
}

/// Extract a box code from a dash-separated cell.
///
/// "FMC9202MAUWU-041-2" -> "041-2" (>= 3 segments, lettered first segment:
/// join segments 2+3), "BOX-17" -> "17" (2 segments: second), anything
/// else -> last segment. Pure over the cell value, so the same cell
/// yields the same code no matter which block read it.
pub fn extract_box_code(cell: &str) -> String {
    let cell = cell.trim();
    let segments: Vec<&str> = cell.split('-').map(str::trim).collect();

    match segments.as_slice() {
        [first, second, third, ..]
            if first.chars().any(|c| c.is_ascii_alphabetic()) =>
        {
            format!("{}-{}", second, third)
        }
        [_, second] => second.to_string(),
        _ => segments.last().map(|s| s.to_string()).unwrap_or_default(),
    }
}

/// The device prefix a box cell may carry before its first dash:
/// "FMC9202MAUWU-041-2" -> Some("FMC9202MAUWU"). Only cells with at
/// least 3 segments and a lettered first segment qualify.
fn box_cell_device_prefix(cell: &str) -> Option<&str> {
    let segments: Vec<&str> = cell.split('-').collect();
    if segments.len() >= 3 && segments[0].chars().any(|c| c.is_ascii_alphabetic()) {
        Some(segments[0].trim())
    } else {
        None
    }
}

fn is_box_token(token: &str) -> bool {
    token.contains("box")
}

fn is_serial_token(token: &str) -> bool {
    token.contains("imei") || token.contains("serial") || token == "sn"
}

/// A header column that starts a block: "box no", "box-no", bare "box".
fn is_box_column_token(token: &str) -> bool {
    token.contains("boxno") || token == "box"
}

/// Find the header row: the first row in the scan window containing both
/// a box-labeled cell and an imei/serial-labeled cell.
fn find_header_row(grid: &SheetGrid) -> Option<usize> {
    for row in 0..grid.row_count().min(HEADER_SCAN_ROWS) {
        let tokens: Vec<String> = grid.row(row).iter().map(|c| header_token(c)).collect();
        let has_box = tokens.iter().any(|t| is_box_token(t));
        let has_serial = tokens.iter().any(|t| is_serial_token(t));
        if has_box && has_serial {
            return Some(row);
        }
    }
    None
}

/// Raw (device, box_code, serial) triple before resolution/grouping.
#[derive(Debug, Clone)]
struct RawTriple {
    device_raw: String,
    box_code: String,
    serial: String,
}

/// Resolve every distinct raw device string and group the triples into
/// labels keyed by (display name, box code).
///
/// Any unresolved device fails the whole parse with the full list -
/// partial success is not permitted.
fn group_labels(triples: Vec<RawTriple>, catalog: &DeviceCatalog) -> StockResult<Vec<ParsedLabel>> {
    // Resolve each distinct raw string once
    let mut resolved: HashMap<String, Option<String>> = HashMap::new();
    for triple in &triples {
        resolved
            .entry(triple.device_raw.clone())
            .or_insert_with(|| resolver::resolve_display(&triple.device_raw, catalog));
    }

    let mut unresolved: Vec<String> = resolved
        .iter()
        .filter(|(_, display)| display.is_none())
        .map(|(raw, _)| raw.clone())
        .collect();
    if !unresolved.is_empty() {
        unresolved.sort();
        unresolved.dedup();
        return Err(StockError::UnresolvedDevices(unresolved));
    }

    // Group by (device, box_code), keeping first-seen order of both the
    // labels and the serials inside each label.
    let mut order: Vec<(String, String)> = Vec::new();
    let mut grouped: HashMap<(String, String), Vec<String>> = HashMap::new();

    for triple in triples {
        let display = resolved[&triple.device_raw]
            .clone()
            .expect("unresolved devices already rejected");
        let key = (display, triple.box_code);
        if !grouped.contains_key(&key) {
            order.push(key.clone());
        }
        let serials = grouped.entry(key).or_default();
        if !serials.contains(&triple.serial) {
            serials.push(triple.serial);
        }
    }

    let labels = order
        .into_iter()
        .map(|key| {
            let serials = grouped.remove(&key).unwrap_or_default();
            let (device, box_code) = key;
            let units = catalog
                .by_display_name(&device)
                .map(|d| d.units_per_serial)
                .unwrap_or(1);
            ParsedLabel {
                qty: serials.len() as i64 * units,
                device,
                box_code,
                location: None,
                serials,
            }
        })
        .collect();

    Ok(labels)
}

// ============================================================================
// PARSER TRAIT + FACTORY
// ============================================================================

/// One adapter per vendor layout.
///
/// `source` is a tag for the file being parsed (filename stem); only the
/// single-box layout uses it, to derive its synthetic box code.
pub trait SheetParser {
    fn parse(
        &self,
        grid: &SheetGrid,
        catalog: &DeviceCatalog,
        profile: &VendorProfile,
        source: &str,
    ) -> StockResult<Vec<ParsedLabel>>;

    fn layout(&self) -> VendorLayout;
}

pub fn parser_for(layout: VendorLayout) -> Box<dyn SheetParser> {
    match layout {
        VendorLayout::Block => Box::new(BlockParser),
        VendorLayout::Carton => Box::new(CartonParser),
        VendorLayout::Explicit => Box::new(ExplicitParser),
        VendorLayout::SingleBox => Box::new(SingleBoxParser),
    }
}

/// Parse a sheet with the profile's layout adapter.
pub fn parse_sheet(
    grid: &SheetGrid,
    catalog: &DeviceCatalog,
    profile: &VendorProfile,
    source: &str,
) -> StockResult<Vec<ParsedLabel>> {
    let parser = parser_for(profile.layout);
    let labels = parser.parse(grid, catalog, profile, source)?;
    debug!(
        vendor = %profile.name,
        layout = %profile.layout.name(),
        labels = labels.len(),
        "sheet parsed"
    );
    Ok(labels)
}

// ============================================================================
// BLOCK LAYOUT
// ============================================================================

/// Repeating horizontal sections: each block is a (box column, serial
/// column) pair found on the header row, with the device name in the
/// cell above the box column.
pub struct BlockParser;

/// One detected block on the header row.
#[derive(Debug, Clone, Copy)]
struct Block {
    box_col: usize,
    serial_col: usize,
}

impl BlockParser {
    /// Pair each "box no" header column with the nearest imei/serial
    /// column to its right, skipping near-duplicates.
    fn detect_blocks(grid: &SheetGrid, header_row: usize) -> Vec<Block> {
        let mut blocks: Vec<Block> = Vec::new();
        let width = grid.row(header_row).len();

        for col in 0..width {
            let token = header_token(grid.cell(header_row, col));
            if !is_box_column_token(&token) {
                continue;
            }
            if blocks
                .iter()
                .any(|b| col.abs_diff(b.box_col) <= BLOCK_MIN_GAP)
            {
                continue;
            }

            let serial_col = (col + 1..=col + BLOCK_SERIAL_SPAN)
                .find(|&j| is_serial_token(&header_token(grid.cell(header_row, j))));
            if let Some(serial_col) = serial_col {
                blocks.push(Block { box_col: col, serial_col });
            }
        }

        blocks
    }
}

impl SheetParser for BlockParser {
    fn parse(
        &self,
        grid: &SheetGrid,
        catalog: &DeviceCatalog,
        profile: &VendorProfile,
        _source: &str,
    ) -> StockResult<Vec<ParsedLabel>> {
        let header_row = find_header_row(grid).ok_or_else(|| StockError::MalformedSheet {
            reason: "no header row with box and serial columns found".to_string(),
        })?;

        let blocks = Self::detect_blocks(grid, header_row);
        if blocks.is_empty() {
            return Err(StockError::MalformedSheet {
                reason: "header row found but no box/serial column pairs".to_string(),
            });
        }

        let mut triples = Vec::new();

        for block in &blocks {
            // Device for the block: the cell immediately above the header
            // in the block's column. May be empty; box cells can override
            // it mid-block via their device prefix.
            let mut device_raw = if header_row > 0 {
                grid.cell(header_row - 1, block.box_col).to_string()
            } else {
                String::new()
            };
            let mut box_code = String::new();

            for row in header_row + 1..grid.row_count() {
                let mut box_cell = grid.cell(row, block.box_col);
                if box_cell.is_empty() && block.box_col + 1 != block.serial_col {
                    // Merged/blank primary cell: adjacent column carries
                    // it, unless what sits there is itself a serial
                    let adjacent = grid.cell(row, block.box_col + 1);
                    if clean_serial(adjacent, false).is_none() {
                        box_cell = adjacent;
                    }
                }

                if !box_cell.is_empty() {
                    if let Some(prefix) = box_cell_device_prefix(box_cell) {
                        device_raw = prefix.to_string();
                    }
                    box_code = extract_box_code(box_cell);
                }

                let Some(serial) =
                    clean_serial(grid.cell(row, block.serial_col), profile.strict_serials)
                else {
                    continue;
                };

                if device_raw.is_empty() || box_code.is_empty() {
                    debug!(row, col = block.box_col, "serial without device/box context, skipped");
                    continue;
                }

                triples.push(RawTriple {
                    device_raw: device_raw.clone(),
                    box_code: box_code.clone(),
                    serial,
                });
            }
        }

        group_labels(triples, catalog)
    }

    fn layout(&self) -> VendorLayout {
        VendorLayout::Block
    }
}

// ============================================================================
// CARTON LAYOUT
// ============================================================================

/// One serial column plus one carton column. The box code is the numeric
/// suffix of the carton text; the device is guessed by frequency of the
/// letter+digit code pattern across all carton cells, then resolved.
pub struct CartonParser;

impl CartonParser {
    /// Carton device codes look like two letters followed by three
    /// digits: "CNHYCV200XEU202501" -> "CV200".
    fn device_code_pattern() -> Regex {
        Regex::new(r"[A-Z]{2}[0-9]{3}").expect("static pattern")
    }

    fn box_code_from_carton(carton: &str, suffix_len: usize) -> Option<String> {
        let digits: String = carton.chars().filter(|c| c.is_ascii_digit()).collect();
        if suffix_len == 0 || digits.len() < suffix_len {
            return None;
        }
        Some(digits[digits.len() - suffix_len..].to_string())
    }

    fn find_columns(grid: &SheetGrid, header_row: usize) -> Option<(usize, usize)> {
        let tokens: Vec<String> = grid.row(header_row).iter().map(|c| header_token(c)).collect();
        let serial_col = tokens.iter().position(|t| is_serial_token(t))?;
        let carton_col = tokens
            .iter()
            .position(|t| t.contains("carton") || t.contains("ctn") || is_box_token(t))?;
        Some((serial_col, carton_col))
    }
}

impl SheetParser for CartonParser {
    fn parse(
        &self,
        grid: &SheetGrid,
        catalog: &DeviceCatalog,
        profile: &VendorProfile,
        _source: &str,
    ) -> StockResult<Vec<ParsedLabel>> {
        let header_row = (0..grid.row_count().min(HEADER_SCAN_ROWS))
            .find(|&row| Self::find_columns(grid, row).is_some())
            .ok_or_else(|| StockError::MalformedSheet {
                reason: "no header row with serial and carton columns found".to_string(),
            })?;
        let (serial_col, carton_col) =
            Self::find_columns(grid, header_row).expect("header row just matched");

        // Pass 1: guess the device code by frequency across carton cells
        let pattern = Self::device_code_pattern();
        let mut code_counts: HashMap<String, usize> = HashMap::new();
        for row in header_row + 1..grid.row_count() {
            let carton = grid.cell(row, carton_col).to_uppercase();
            for m in pattern.find_iter(&carton) {
                *code_counts.entry(m.as_str().to_string()).or_insert(0) += 1;
            }
        }

        // Candidates that resolve against the catalog beat ones that do
        // not; then highest frequency; ties break lexicographically so
        // the guess is reproducible. An unresolvable winner still flows
        // through group_labels, which fails the parse listing it.
        let device_guess = code_counts
            .into_iter()
            .max_by_key(|(code, count)| {
                (
                    resolver::resolve_display(code, catalog).is_some(),
                    *count,
                    std::cmp::Reverse(code.clone()),
                )
            })
            .map(|(code, _)| code)
            .ok_or_else(|| StockError::MalformedSheet {
                reason: "no device code pattern found in carton column".to_string(),
            })?;

        // Pass 2: collect serials per carton suffix
        let mut triples = Vec::new();
        for row in header_row + 1..grid.row_count() {
            let Some(serial) = clean_serial(grid.cell(row, serial_col), profile.strict_serials)
            else {
                continue;
            };
            let Some(box_code) =
                Self::box_code_from_carton(grid.cell(row, carton_col), profile.carton_suffix_len)
            else {
                continue;
            };

            triples.push(RawTriple {
                device_raw: device_guess.clone(),
                box_code,
                serial,
            });
        }

        group_labels(triples, catalog)
    }

    fn layout(&self) -> VendorLayout {
        VendorLayout::Carton
    }
}

// ============================================================================
// EXPLICIT LAYOUT
// ============================================================================

/// Dedicated named columns for device, serial and box code. The polite
/// vendor - nothing to infer.
pub struct ExplicitParser;

impl ExplicitParser {
    fn find_columns(grid: &SheetGrid, header_row: usize) -> Option<(usize, usize, usize)> {
        let tokens: Vec<String> = grid.row(header_row).iter().map(|c| header_token(c)).collect();
        let device_col = tokens
            .iter()
            .position(|t| t.contains("device") || t.contains("model"))?;
        let serial_col = tokens.iter().position(|t| is_serial_token(t))?;
        let box_col = tokens.iter().position(|t| is_box_token(t))?;
        Some((device_col, serial_col, box_col))
    }
}

impl SheetParser for ExplicitParser {
    fn parse(
        &self,
        grid: &SheetGrid,
        catalog: &DeviceCatalog,
        profile: &VendorProfile,
        _source: &str,
    ) -> StockResult<Vec<ParsedLabel>> {
        let header_row = (0..grid.row_count().min(HEADER_SCAN_ROWS))
            .find(|&row| Self::find_columns(grid, row).is_some())
            .ok_or_else(|| StockError::MalformedSheet {
                reason: "no header row with device, serial and box columns found".to_string(),
            })?;
        let (device_col, serial_col, box_col) =
            Self::find_columns(grid, header_row).expect("header row just matched");

        let mut triples = Vec::new();
        for row in header_row + 1..grid.row_count() {
            let Some(serial) = clean_serial(grid.cell(row, serial_col), profile.strict_serials)
            else {
                continue;
            };

            let device_raw = grid.cell(row, device_col);
            let box_code = grid.cell(row, box_col);
            if device_raw.is_empty() || box_code.is_empty() {
                continue;
            }

            triples.push(RawTriple {
                device_raw: device_raw.to_string(),
                box_code: box_code.to_string(),
                serial,
            });
        }

        group_labels(triples, catalog)
    }

    fn layout(&self) -> VendorLayout {
        VendorLayout::Explicit
    }
}

// ============================================================================
// SINGLE-BOX LAYOUT
// ============================================================================

/// No reliable box identifier in the source: every valid serial in the
/// file lands in one synthetic box, and the device comes from the vendor
/// profile rather than the sheet.
pub struct SingleBoxParser;

impl SingleBoxParser {
    /// Synthetic box code from the source tag: uppercased, alphanumeric,
    /// trailing datestamp digits dropped so a re-export of the same file
    /// maps to the same box.
    fn synthetic_box_code(source: &str) -> String {
        let mut code: String = source
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        let trailing_digits = code
            .chars()
            .rev()
            .take_while(|c| c.is_ascii_digit())
            .count();
        if trailing_digits >= 6 && trailing_digits < code.len() {
            code.truncate(code.len() - trailing_digits);
        }

        if code.is_empty() {
            "BULK".to_string()
        } else {
            code
        }
    }
}

impl SheetParser for SingleBoxParser {
    fn parse(
        &self,
        grid: &SheetGrid,
        catalog: &DeviceCatalog,
        profile: &VendorProfile,
        source: &str,
    ) -> StockResult<Vec<ParsedLabel>> {
        let device_raw = profile.forced_device.clone().ok_or_else(|| {
            StockError::MalformedSheet {
                reason: format!("vendor profile '{}' has no forced device", profile.name),
            }
        })?;

        let box_code = Self::synthetic_box_code(source);

        // No structure to trust: scan every cell for valid serials
        let mut triples = Vec::new();
        for row in 0..grid.row_count() {
            for cell in grid.row(row) {
                if let Some(serial) = clean_serial(cell, profile.strict_serials) {
                    triples.push(RawTriple {
                        device_raw: device_raw.clone(),
                        box_code: box_code.clone(),
                        serial,
                    });
                }
            }
        }

        if triples.is_empty() {
            return Err(StockError::MalformedSheet {
                reason: "no valid serials found in sheet".to_string(),
            });
        }

        group_labels(triples, catalog)
    }

    fn layout(&self) -> VendorLayout {
        VendorLayout::SingleBox
    }
}

// ============================================================================
// TESTS
// ============================================================================
