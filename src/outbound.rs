// Outbound engine
// Resolves a scan payload (single serial, box token, or bulk text) to
// the items it targets, supports a read-only preview and a transactional
// commit. Commit re-fetches item status before mutating - preview counts
// are advisory, the re-check is what the mutation trusts.

use regex::Regex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::catalog::DeviceCatalog;
use crate::db::{self, Item, StockStatus};
use crate::error::{StockError, StockResult};
use crate::parser::clean_serial;
use crate::resolver;

// ============================================================================
// SCAN PAYLOAD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Serial,
    Box,
    Bulk,
}

impl ScanMode {
    pub fn name(&self) -> &'static str {
        match self {
            ScanMode::Serial => "serial",
            ScanMode::Box => "box",
            ScanMode::Bulk => "bulk",
        }
    }
}

/// Parsed scan payload, one of the three §outbound modes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScanPayload {
    /// Bare 14-17 digit string.
    Serial(String),

    /// Structured KEY:VALUE token naming a box.
    Box {
        box_code: String,
        device: Option<String>,
        master_box_no: Option<String>,
        qty: Option<i64>,
    },

    /// Free text with multiple embedded serial runs, deduplicated.
    Bulk(Vec<String>),
}

impl ScanPayload {
    pub fn mode(&self) -> ScanMode {
        match self {
            ScanPayload::Serial(_) => ScanMode::Serial,
            ScanPayload::Box { .. } => ScanMode::Box,
            ScanPayload::Bulk(_) => ScanMode::Bulk,
        }
    }
}

fn serial_run_pattern() -> Regex {
    Regex::new(r"[0-9]{14,17}").expect("static pattern")
}

/// Parse raw scan text into a payload.
///
/// Structured payloads are KEY:VALUE pairs joined by `|` (keys BOX, DEV,
/// MASTER, QTY, legacy IMEI comma list). Anything else is scanned for
/// embedded serial runs: one run is a single-serial scan, several are a
/// bulk scan.
pub fn parse_scan_payload(raw: &str) -> StockResult<ScanPayload> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(StockError::EmptyScan);
    }

    if raw.contains(':') {
        let mut fields: HashMap<String, String> = HashMap::new();
        for pair in raw.split('|') {
            if let Some((key, value)) = pair.split_once(':') {
                fields.insert(key.trim().to_uppercase(), value.trim().to_string());
            }
        }

        // Legacy IMEI list payloads are bulk scans in disguise
        if let Some(list) = fields.get("IMEI") {
            let serials = dedup_serials(list.split(',').filter_map(|s| clean_serial(s, false)));
            if serials.is_empty() {
                return Err(StockError::EmptyScan);
            }
            return Ok(ScanPayload::Bulk(serials));
        }

        if let Some(box_code) = fields.get("BOX") {
            return Ok(ScanPayload::Box {
                box_code: box_code.clone(),
                device: fields.get("DEV").cloned(),
                master_box_no: fields.get("MASTER").cloned(),
                qty: fields.get("QTY").and_then(|q| q.parse().ok()),
            });
        }

        return Err(StockError::EmptyScan);
    }

    let runs = dedup_serials(
        serial_run_pattern()
            .find_iter(raw)
            .map(|m| m.as_str().to_string()),
    );

    match runs.len() {
        0 => {
            // Separators may have broken the digit run apart; a bare
            // serial with dashes still counts once stripped whole
            match clean_serial(raw, false) {
                Some(serial) => Ok(ScanPayload::Serial(serial)),
                None => Err(StockError::EmptyScan),
            }
        }
        1 => Ok(ScanPayload::Serial(runs.into_iter().next().expect("one run"))),
        _ => Ok(ScanPayload::Bulk(runs)),
    }
}

fn dedup_serials(serials: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for serial in serials {
        if !out.contains(&serial) {
            out.push(serial);
        }
    }
    out
}

// ============================================================================
// TARGET RESOLUTION
// ============================================================================

/// What a payload points at, as of one read of the ledger.
#[derive(Debug)]
struct TargetSet {
    mode: ScanMode,

    /// Items still IN - the commit set.
    targeted: Vec<Item>,

    /// Items that exist but are already OUT.
    already_out: Vec<Item>,

    /// Serials the payload named that have no item.
    missing: Vec<String>,
}

fn resolve_targets(conn: &Connection, payload: &ScanPayload) -> StockResult<TargetSet> {
    let mode = payload.mode();
    let mut targeted = Vec::new();
    let mut already_out = Vec::new();
    let mut missing = Vec::new();

    match payload {
        ScanPayload::Serial(serial) => match db::find_item(conn, serial)? {
            Some(item) if item.status == StockStatus::In => targeted.push(item),
            Some(item) => already_out.push(item),
            None => missing.push(serial.clone()),
        },
        ScanPayload::Bulk(serials) => {
            for serial in serials {
                match db::find_item(conn, serial)? {
                    Some(item) if item.status == StockStatus::In => targeted.push(item),
                    Some(item) => already_out.push(item),
                    None => missing.push(serial.clone()),
                }
            }
        }
        ScanPayload::Box {
            box_code,
            device,
            master_box_no,
            qty,
        } => {
            let catalog = DeviceCatalog::load(conn)?;
            let device_id = match device {
                Some(raw) => {
                    let display = resolver::resolve_display(raw, &catalog)
                        .ok_or_else(|| StockError::UnknownDevice(raw.clone()))?;
                    catalog.by_display_name(&display).map(|d| d.id)
                }
                None => None,
            };

            let stock_box = match db::find_box_by_code(conn, box_code, device_id)? {
                Some(found) => found,
                None => {
                    // Some vendors label the outer master box instead
                    let fallback = master_box_no
                        .as_ref()
                        .map(|master| db::find_box_by_code(conn, master, device_id))
                        .transpose()?
                        .flatten();
                    fallback.ok_or_else(|| StockError::UnknownBox(box_code.clone()))?
                }
            };

            for item in db::items_in_box(conn, stock_box.id, false)? {
                if item.status == StockStatus::In {
                    targeted.push(item);
                } else {
                    already_out.push(item);
                }
            }

            if let Some(expected) = qty {
                let current_in = targeted.len() as i64;
                if *expected != current_in {
                    warn!(
                        box_code = %stock_box.box_code,
                        expected, current_in,
                        "box token qty does not match current stock"
                    );
                }
            }
        }
    }

    Ok(TargetSet {
        mode,
        targeted,
        already_out,
        missing,
    })
}

// ============================================================================
// PREVIEW
// ============================================================================

/// Per-box slice of a preview or commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxBreakdown {
    pub box_code: String,
    pub current_in: i64,
    pub will_remove: i64,
    pub will_remain: i64,
    pub will_be_emptied: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundPreview {
    pub mode: ScanMode,

    /// Serials the commit would transition, in resolution order.
    pub targeted_serials: Vec<String>,

    pub imei_found: i64,
    pub imei_missing: i64,
    pub already_out: i64,
    pub missing_serials: Vec<String>,
    pub boxes: Vec<BoxBreakdown>,
}

fn box_breakdowns(conn: &Connection, targeted: &[Item]) -> StockResult<Vec<BoxBreakdown>> {
    let mut order: Vec<i64> = Vec::new();
    let mut removing: HashMap<i64, i64> = HashMap::new();
    for item in targeted {
        if !removing.contains_key(&item.box_id) {
            order.push(item.box_id);
        }
        *removing.entry(item.box_id).or_insert(0) += 1;
    }

    let mut breakdowns = Vec::new();
    for box_id in order {
        let stock_box =
            db::get_box(conn, box_id)?.ok_or_else(|| StockError::UnknownBox(box_id.to_string()))?;
        let current_in = db::count_items_in_box(conn, box_id, StockStatus::In)?;
        let will_remove = removing[&box_id];
        let will_remain = current_in - will_remove;
        breakdowns.push(BoxBreakdown {
            box_code: stock_box.box_code,
            current_in,
            will_remove,
            will_remain,
            will_be_emptied: will_remain == 0,
        });
    }

    Ok(breakdowns)
}

/// Read-only preview: what a commit of this payload would do right now.
pub fn preview(conn: &Connection, payload: &ScanPayload) -> StockResult<OutboundPreview> {
    let targets = resolve_targets(conn, payload)?;
    let boxes = match targets.mode {
        ScanMode::Serial => Vec::new(),
        ScanMode::Box | ScanMode::Bulk => box_breakdowns(conn, &targets.targeted)?,
    };

    Ok(OutboundPreview {
        mode: targets.mode,
        targeted_serials: targets.targeted.iter().map(|i| i.serial.clone()).collect(),
        imei_found: (targets.targeted.len() + targets.already_out.len()) as i64,
        imei_missing: targets.missing.len() as i64,
        already_out: targets.already_out.len() as i64,
        missing_serials: targets.missing,
        boxes,
    })
}

// ============================================================================
// COMMIT
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundCommit {
    pub batch_id: String,
    pub mode: ScanMode,

    /// Items transitioned IN -> OUT by this call.
    pub committed: i64,

    /// Targets that were no longer IN at the commit-time re-check -
    /// includes items another operation moved out between preview and
    /// commit.
    pub already_out: i64,

    pub not_found: i64,

    /// Conditional updates that matched no row: the race lost after the
    /// re-check, inside this very call.
    pub blocked: i64,

    /// Codes of boxes whose derived status flipped to OUT.
    pub boxes_emptied: Vec<String>,
}

/// Commit an outbound scan: one transaction covering the re-check, the
/// conditional status flips, the box recomputes and the audit rows.
///
/// If the re-check leaves nothing to transition the commit fails whole
/// with `NothingToCommit` - committing zero items is an error, not a
/// silent success.
pub fn commit(
    conn: &mut Connection,
    payload: &ScanPayload,
    actor: &str,
) -> StockResult<OutboundCommit> {
    let tx = conn.transaction()?;

    // Required re-check: resolve against current state, not the preview's
    let targets = resolve_targets(&tx, payload)?;
    if targets.targeted.is_empty() {
        return Err(StockError::NothingToCommit);
    }

    let batch_id = db::new_batch_id();
    let mut committed = 0i64;
    let mut blocked = 0i64;
    let mut affected_boxes: Vec<i64> = Vec::new();

    for item in &targets.targeted {
        if db::mark_item_out(&tx, &item.serial)? {
            db::insert_movement(
                &tx,
                StockStatus::Out,
                &item.serial,
                item.box_id,
                &batch_id,
                actor,
            )?;
            committed += 1;
            if !affected_boxes.contains(&item.box_id) {
                affected_boxes.push(item.box_id);
            }
        } else {
            blocked += 1;
        }
    }

    if committed == 0 {
        // Every conditional update lost - treat like an empty commit set
        return Err(StockError::NothingToCommit);
    }

    let mut boxes_emptied = Vec::new();
    for box_id in affected_boxes {
        if db::recompute_box_status(&tx, box_id)? == StockStatus::Out {
            if let Some(stock_box) = db::get_box(&tx, box_id)? {
                boxes_emptied.push(stock_box.box_code);
            }
        }
    }

    let report = OutboundCommit {
        batch_id: batch_id.clone(),
        mode: targets.mode,
        committed,
        already_out: targets.already_out.len() as i64,
        not_found: targets.missing.len() as i64,
        blocked,
        boxes_emptied,
    };

    let totals = serde_json::to_value(&report).expect("report serialize");
    db::insert_batch(
        &tx,
        &batch_id,
        db::BatchKind::Outbound,
        actor,
        None,
        None,
        None,
        &totals,
    )?;

    tx.commit()?;

    info!(
        batch_id = %report.batch_id,
        mode = %report.mode.name(),
        committed = report.committed,
        already_out = report.already_out,
        not_found = report.not_found,
        blocked = report.blocked,
        "outbound committed"
    );

    Ok(report)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::seed_device;
    use crate::db::setup_database;
    use crate::inbound::{InboundContext, InboundReconciler};
    use crate::parser::ParsedLabel;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn serial(n: u64) -> String {
        format!("35693803564{:04}", n)
    }

    fn import(conn: &mut Connection, device: &str, box_code: &str, serials: &[String]) {
        seed_device(conn, device, 1).unwrap();
        let label = ParsedLabel {
            device: device.to_string(),
            box_code: box_code.to_string(),
            location: None,
            serials: serials.to_vec(),
            qty: serials.len() as i64,
        };
        InboundReconciler::new()
            .reconcile(conn, &[label], &InboundContext::new("tester"))
            .unwrap();
    }

    // ------------------------------------------------------------------
    // Payload parsing
    // ------------------------------------------------------------------

    #[test]
    fn test_parse_bare_serial() {
        let payload = parse_scan_payload("356938035643809").unwrap();
        assert_eq!(payload, ScanPayload::Serial("356938035643809".to_string()));
    }

    #[test]
    fn test_parse_serial_with_separators() {
        let payload = parse_scan_payload("35-6938-0356-43809").unwrap();
        assert_eq!(payload, ScanPayload::Serial("356938035643809".to_string()));
    }

    #[test]
    fn test_parse_box_token() {
        let payload = parse_scan_payload("BOX:041-2|DEV:FMC920|MASTER:M77|QTY:5").unwrap();
        assert_eq!(
            payload,
            ScanPayload::Box {
                box_code: "041-2".to_string(),
                device: Some("FMC920".to_string()),
                master_box_no: Some("M77".to_string()),
                qty: Some(5),
            }
        );
    }

    #[test]
    fn test_parse_legacy_imei_list() {
        let payload =
            parse_scan_payload("IMEI:356938035640001,356938035640002,356938035640001").unwrap();
        assert_eq!(
            payload,
            ScanPayload::Bulk(vec![
                "356938035640001".to_string(),
                "356938035640002".to_string(),
            ])
        );
    }

    #[test]
    fn test_parse_bulk_free_text() {
        let text = "scanned 356938035640001 then\n356938035640002;356938035640001 done";
        let payload = parse_scan_payload(text).unwrap();
        assert_eq!(
            payload,
            ScanPayload::Bulk(vec![
                "356938035640001".to_string(),
                "356938035640002".to_string(),
            ])
        );
    }

    #[test]
    fn test_parse_empty_scan_rejected() {
        assert!(matches!(
            parse_scan_payload("   "),
            Err(StockError::EmptyScan)
        ));
        assert!(matches!(
            parse_scan_payload("no digits here"),
            Err(StockError::EmptyScan)
        ));
        assert!(matches!(
            parse_scan_payload("KEY:VALUE"),
            Err(StockError::EmptyScan)
        ));
    }

    // ------------------------------------------------------------------
    // Preview
    // ------------------------------------------------------------------

    #[test]
    fn test_preview_single_serial() {
        let mut conn = test_conn();
        import(&mut conn, "FMC920", "041-2", &[serial(1)]);

        let payload = parse_scan_payload(&serial(1)).unwrap();
        let report = preview(&conn, &payload).unwrap();

        assert_eq!(report.mode, ScanMode::Serial);
        assert_eq!(report.imei_found, 1);
        assert_eq!(report.imei_missing, 0);
        assert_eq!(report.targeted_serials, vec![serial(1)]);
    }

    #[test]
    fn test_preview_box_breakdown() {
        let mut conn = test_conn();
        let serials: Vec<String> = (0..5).map(serial).collect();
        import(&mut conn, "FMC920", "041-2", &serials);

        let payload = parse_scan_payload("BOX:041-2|DEV:FMC920").unwrap();
        let report = preview(&conn, &payload).unwrap();

        assert_eq!(report.mode, ScanMode::Box);
        assert_eq!(report.boxes.len(), 1);
        let breakdown = &report.boxes[0];
        assert_eq!(breakdown.current_in, 5);
        assert_eq!(breakdown.will_remove, 5);
        assert_eq!(breakdown.will_remain, 0);
        assert!(breakdown.will_be_emptied);
    }

    #[test]
    fn test_preview_bulk_across_boxes_with_missing() {
        let mut conn = test_conn();
        import(&mut conn, "FMC920", "041-1", &[serial(1)]);
        let label = ParsedLabel {
            device: "FMC920".to_string(),
            box_code: "041-2".to_string(),
            location: None,
            serials: vec![serial(2)],
            qty: 1,
        };
        InboundReconciler::new()
            .reconcile(&mut conn, &[label], &InboundContext::new("tester"))
            .unwrap();

        // 3 serials: 2 resolve across 2 boxes, 1 unknown
        let text = format!("{} {} {}", serial(1), serial(2), serial(99));
        let payload = parse_scan_payload(&text).unwrap();
        let report = preview(&conn, &payload).unwrap();

        assert_eq!(report.mode, ScanMode::Bulk);
        assert_eq!(report.imei_found, 2);
        assert_eq!(report.imei_missing, 1);
        assert_eq!(report.missing_serials, vec![serial(99)]);
        assert_eq!(report.boxes.len(), 2);
    }

    #[test]
    fn test_preview_unknown_box_fails() {
        let conn = test_conn();
        let payload = parse_scan_payload("BOX:NOPE").unwrap();
        assert!(matches!(
            preview(&conn, &payload),
            Err(StockError::UnknownBox(_))
        ));
    }

    #[test]
    fn test_preview_is_read_only() {
        let mut conn = test_conn();
        import(&mut conn, "FMC920", "041-2", &[serial(1)]);

        let payload = parse_scan_payload("BOX:041-2").unwrap();
        preview(&conn, &payload).unwrap();

        let item = db::find_item(&conn, &serial(1)).unwrap().unwrap();
        assert_eq!(item.status, StockStatus::In);
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    #[test]
    fn test_commit_box_empties_it() {
        let mut conn = test_conn();
        let serials: Vec<String> = (0..5).map(serial).collect();
        import(&mut conn, "FMC920", "041-2", &serials);

        let payload = parse_scan_payload("BOX:041-2|DEV:FMC920").unwrap();
        let report = commit(&mut conn, &payload, "tester").unwrap();

        assert_eq!(report.committed, 5);
        assert_eq!(report.blocked, 0);
        assert_eq!(report.boxes_emptied, vec!["041-2".to_string()]);

        let stock_box = db::find_box_by_code(&conn, "041-2", None).unwrap().unwrap();
        assert_eq!(stock_box.status, StockStatus::Out);

        // One OUT movement per serial, on top of the inbound one
        for s in &serials {
            assert_eq!(db::count_movements_for_serial(&conn, s).unwrap(), 2);
        }
        let movements = db::movements_for_batch(&conn, &report.batch_id).unwrap();
        assert_eq!(movements.len(), 5);
        assert!(movements
            .iter()
            .all(|m| m.movement_type == StockStatus::Out));

        let batch = db::get_batch(&conn, &report.batch_id).unwrap().unwrap();
        assert_eq!(batch.kind, db::BatchKind::Outbound);
        assert_eq!(batch.totals["committed"], 5);
    }

    #[test]
    fn test_commit_reports_item_raced_out_between_preview_and_commit() {
        let mut conn = test_conn();
        let serials: Vec<String> = (0..5).map(serial).collect();
        import(&mut conn, "FMC920", "041-2", &serials);

        let payload = parse_scan_payload("BOX:041-2").unwrap();
        let before = preview(&conn, &payload).unwrap();
        assert_eq!(before.targeted_serials.len(), 5);

        // Another operation moves one item out in between
        let single = parse_scan_payload(&serials[0]).unwrap();
        commit(&mut conn, &single, "someone-else").unwrap();

        let report = commit(&mut conn, &payload, "tester").unwrap();
        assert_eq!(report.committed, 4);
        // The raced item is caught by the re-check and reported, not
        // silently dropped
        assert_eq!(report.already_out, 1);
    }

    #[test]
    fn test_commit_with_nothing_left_fails() {
        let mut conn = test_conn();
        import(&mut conn, "FMC920", "041-2", &[serial(1)]);

        let payload = parse_scan_payload("BOX:041-2").unwrap();
        commit(&mut conn, &payload, "tester").unwrap();

        // Box is now empty of IN items: second commit has nothing to do
        let err = commit(&mut conn, &payload, "tester").unwrap_err();
        assert!(matches!(err, StockError::NothingToCommit));
    }

    #[test]
    fn test_commit_single_serial_is_terminal() {
        let mut conn = test_conn();
        import(&mut conn, "FMC920", "041-2", &[serial(1)]);

        let payload = parse_scan_payload(&serial(1)).unwrap();
        commit(&mut conn, &payload, "tester").unwrap();

        let err = commit(&mut conn, &payload, "tester").unwrap_err();
        assert!(matches!(err, StockError::NothingToCommit));

        let item = db::find_item(&conn, &serial(1)).unwrap().unwrap();
        assert_eq!(item.status, StockStatus::Out);
    }

    #[test]
    fn test_commit_bulk_counts_not_found() {
        let mut conn = test_conn();
        import(&mut conn, "FMC920", "041-2", &[serial(1), serial(2)]);

        let text = format!("{} {}", serial(1), serial(99));
        let payload = parse_scan_payload(&text).unwrap();
        let report = commit(&mut conn, &payload, "tester").unwrap();

        assert_eq!(report.committed, 1);
        assert_eq!(report.not_found, 1);
        // The untouched serial stays IN, so the box does too
        let stock_box = db::find_box_by_code(&conn, "041-2", None).unwrap().unwrap();
        assert_eq!(stock_box.status, StockStatus::In);
    }

    #[test]
    fn test_round_trip_inbound_then_outbound() {
        // Import N serials, remove them all: box and items end OUT with
        // complete audit coverage.
        let mut conn = test_conn();
        let serials: Vec<String> = (0..10).map(serial).collect();
        import(&mut conn, "FMC920", "041-2", &serials);

        let payload = parse_scan_payload("BOX:041-2|DEV:FMC920").unwrap();
        let report = commit(&mut conn, &payload, "tester").unwrap();
        assert_eq!(report.committed, 10);

        let stock_box = db::find_box_by_code(&conn, "041-2", None).unwrap().unwrap();
        assert_eq!(stock_box.status, StockStatus::Out);
        for s in &serials {
            let item = db::find_item(&conn, s).unwrap().unwrap();
            assert_eq!(item.status, StockStatus::Out);
            assert_eq!(db::count_movements_for_serial(&conn, s).unwrap(), 2);
        }
    }

    #[test]
    fn test_commit_master_box_fallback() {
        let mut conn = test_conn();
        import(&mut conn, "FMC920", "M77", &[serial(1)]);

        // The scanned box code is unknown but the master box resolves
        let payload = parse_scan_payload("BOX:UNKNOWN|MASTER:M77").unwrap();
        let report = commit(&mut conn, &payload, "tester").unwrap();
        assert_eq!(report.committed, 1);
    }
}
