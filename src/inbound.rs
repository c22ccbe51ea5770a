// Inbound reconciler
// Takes parsed labels and folds them into the ledger: re-validates
// devices against the current catalog, deduplicates serials (in-file and
// against existing items), finds or creates boxes, inserts items and the
// movement/batch audit rows. The whole call is one transaction - either
// everything lands or nothing does.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::catalog::DeviceCatalog;
use crate::db;
use crate::error::{SerialConflict, StockError, StockResult};
use crate::parser::{clean_serial, ParsedLabel};
use crate::resolver;

// ============================================================================
// DUPLICATE POLICY
// ============================================================================

/// What a duplicate serial does to the request. The asymmetry between
/// entry points is intentional business policy: bulk vendor sheets
/// routinely overlap previous shipments, manual entry never should.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicatePolicy {
    /// Bulk vendor import: duplicates are excluded from insertion and
    /// counted, the rest of the batch proceeds.
    SkipAndCount,

    /// Strict manual entry: any duplicate rejects the whole request,
    /// reporting every conflicting serial with its current location.
    RejectBatch,
}

// ============================================================================
// REQUEST / REPORT TYPES
// ============================================================================

/// Caller identity and provenance for one reconciliation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundContext {
    pub actor: String,
    pub vendor: Option<String>,
    pub source: Option<String>,
    pub source_checksum: Option<String>,
}

impl InboundContext {
    pub fn new(actor: &str) -> Self {
        InboundContext {
            actor: actor.to_string(),
            vendor: None,
            source: None,
            source_checksum: None,
        }
    }

    pub fn with_vendor(mut self, vendor: &str) -> Self {
        self.vendor = Some(vendor.to_string());
        self
    }

    pub fn with_source(mut self, source: &str, checksum: Option<String>) -> Self {
        self.source = Some(source.to_string());
        self.source_checksum = checksum;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundTotals {
    pub inserted: i64,
    pub skipped_existing: i64,
    pub skipped_duplicate_in_file: i64,
    pub boxes_created: i64,
    pub boxes_reused: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundReport {
    pub batch_id: String,
    pub totals: InboundTotals,
}

/// Serials already spoken for at this point of the reconciliation:
/// everything in the ledger snapshot check plus everything seen earlier
/// in the same request. Passed through each step explicitly instead of
/// living as ambient mutable state.
#[derive(Debug, Default)]
struct SeenSerials {
    in_file: HashSet<String>,
}

impl SeenSerials {
    fn check_and_record(&mut self, serial: &str) -> bool {
        self.in_file.insert(serial.to_string())
    }
}

// ============================================================================
// RECONCILER
// ============================================================================

#[derive(Debug, Clone)]
pub struct InboundReconciler {
    pub policy: DuplicatePolicy,
}

impl InboundReconciler {
    /// Bulk vendor import reconciler.
    pub fn new() -> Self {
        InboundReconciler {
            policy: DuplicatePolicy::SkipAndCount,
        }
    }

    pub fn with_policy(policy: DuplicatePolicy) -> Self {
        InboundReconciler { policy }
    }

    /// Reconcile parsed labels into the ledger.
    ///
    /// Runs as one transaction. Unknown devices reject the call before
    /// any mutation; duplicates behave per the configured policy; any
    /// write failure rolls the whole operation back.
    pub fn reconcile(
        &self,
        conn: &mut Connection,
        labels: &[ParsedLabel],
        ctx: &InboundContext,
    ) -> StockResult<InboundReport> {
        let tx = conn.transaction()?;

        // Step 1: re-validate devices against the catalog as it is NOW -
        // it may have changed since the sheet was parsed.
        let catalog = DeviceCatalog::load(&tx)?;
        let device_ids = revalidate_devices(labels, &catalog)?;

        // Step 2: walk labels, carrying the seen-serial accumulator, and
        // collect conflicts for the strict policy before inserting.
        let mut seen = SeenSerials::default();
        let mut totals = InboundTotals::default();
        let mut conflicts: Vec<SerialConflict> = Vec::new();
        let batch_id = db::new_batch_id();

        for label in labels {
            let device_id = device_ids[&label.device];

            // Step 3: find or create the box for (device, box_code)
            let stock_box = match db::find_box(&tx, device_id, &label.box_code)? {
                Some(existing) => {
                    if let Some(location) = &label.location {
                        if existing.location.as_deref() != Some(location.as_str()) {
                            db::update_box_location(&tx, existing.id, location)?;
                        }
                    }
                    totals.boxes_reused += 1;
                    existing
                }
                None => {
                    totals.boxes_created += 1;
                    db::insert_box(&tx, device_id, &label.box_code, label.location.as_deref())?
                }
            };

            // Step 4: insert non-duplicate items plus their movements
            for serial in &label.serials {
                if !seen.check_and_record(serial) {
                    match self.policy {
                        DuplicatePolicy::SkipAndCount => {
                            totals.skipped_duplicate_in_file += 1;
                            continue;
                        }
                        DuplicatePolicy::RejectBatch => {
                            conflicts.push(SerialConflict {
                                serial: serial.clone(),
                                device: String::new(),
                                box_code: String::new(),
                            });
                            continue;
                        }
                    }
                }

                if let Some(existing) = db::find_item(&tx, serial)? {
                    match self.policy {
                        DuplicatePolicy::SkipAndCount => {
                            totals.skipped_existing += 1;
                            debug!(serial = %serial, "serial already in ledger, skipped");
                            continue;
                        }
                        DuplicatePolicy::RejectBatch => {
                            conflicts.push(conflict_for(&tx, &catalog, &existing));
                            continue;
                        }
                    }
                }

                // The UNIQUE constraint is the final arbiter; a concurrent
                // import that won the race surfaces here.
                match db::insert_item(&tx, serial, device_id, stock_box.id) {
                    Ok(_) => {
                        db::insert_movement(
                            &tx,
                            db::StockStatus::In,
                            serial,
                            stock_box.id,
                            &batch_id,
                            &ctx.actor,
                        )?;
                        totals.inserted += 1;
                    }
                    Err(rusqlite::Error::SqliteFailure(e, _))
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        match self.policy {
                            DuplicatePolicy::SkipAndCount => totals.skipped_existing += 1,
                            DuplicatePolicy::RejectBatch => {
                                conflicts.push(SerialConflict {
                                    serial: serial.clone(),
                                    device: label.device.clone(),
                                    box_code: String::new(),
                                });
                            }
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            // Box status stays derived even when every serial was skipped
            db::recompute_box_status(&tx, stock_box.id)?;
        }

        if !conflicts.is_empty() {
            // Transaction dropped without commit - nothing was mutated
            return Err(StockError::DuplicateSerials(conflicts));
        }

        let totals_json = serde_json::to_value(&totals).expect("totals serialize");
        db::insert_batch(
            &tx,
            &batch_id,
            db::BatchKind::Inbound,
            &ctx.actor,
            ctx.vendor.as_deref(),
            ctx.source.as_deref(),
            ctx.source_checksum.as_deref(),
            &totals_json,
        )?;

        tx.commit()?;

        info!(
            batch_id = %batch_id,
            inserted = totals.inserted,
            skipped_existing = totals.skipped_existing,
            skipped_duplicate_in_file = totals.skipped_duplicate_in_file,
            "inbound reconciled"
        );

        Ok(InboundReport { batch_id, totals })
    }

    /// Strict single-box manual entry: one label, hard block on any
    /// duplicate, serials validated up front.
    pub fn manual_entry(
        conn: &mut Connection,
        device: &str,
        box_code: &str,
        location: Option<&str>,
        serials: &[String],
        actor: &str,
    ) -> StockResult<InboundReport> {
        let mut cleaned = Vec::new();
        for raw in serials {
            let serial = clean_serial(raw, false)
                .ok_or_else(|| StockError::InvalidSerial(raw.clone()))?;
            if !cleaned.contains(&serial) {
                cleaned.push(serial);
            }
        }

        let label = ParsedLabel {
            device: device.to_string(),
            box_code: box_code.to_string(),
            location: location.map(str::to_string),
            qty: cleaned.len() as i64,
            serials: cleaned,
        };

        let reconciler = InboundReconciler::with_policy(DuplicatePolicy::RejectBatch);
        reconciler.reconcile(conn, &[label], &InboundContext::new(actor))
    }
}

impl Default for InboundReconciler {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve every label device against the current catalog, all-or-
/// nothing: the full unresolved list comes back in one error.
fn revalidate_devices(
    labels: &[ParsedLabel],
    catalog: &DeviceCatalog,
) -> StockResult<HashMap<String, i64>> {
    let mut device_ids = HashMap::new();
    let mut unresolved = Vec::new();

    for label in labels {
        if device_ids.contains_key(&label.device) {
            continue;
        }
        let resolved = resolver::resolve_display(&label.device, catalog)
            .and_then(|display| catalog.by_display_name(&display).map(|d| d.id));
        match resolved {
            Some(id) => {
                device_ids.insert(label.device.clone(), id);
            }
            None => unresolved.push(label.device.clone()),
        }
    }

    if !unresolved.is_empty() {
        unresolved.sort();
        unresolved.dedup();
        return Err(StockError::UnresolvedDevices(unresolved));
    }

    Ok(device_ids)
}

/// Build the conflict report for an item that already exists, with its
/// current device and box location.
fn conflict_for(conn: &Connection, catalog: &DeviceCatalog, existing: &db::Item) -> SerialConflict {
    let device = catalog
        .by_id(existing.device_id)
        .map(|d| d.display_name.clone())
        .unwrap_or_default();
    let box_code = db::get_box(conn, existing.box_id)
        .ok()
        .flatten()
        .map(|b| b.box_code)
        .unwrap_or_default();

    SerialConflict {
        serial: existing.serial.clone(),
        device,
        box_code,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::seed_device;
    use crate::db::{setup_database, StockStatus};

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    fn label(device: &str, box_code: &str, serials: &[&str]) -> ParsedLabel {
        ParsedLabel {
            device: device.to_string(),
            box_code: box_code.to_string(),
            location: None,
            serials: serials.iter().map(|s| s.to_string()).collect(),
            qty: serials.len() as i64,
        }
    }

    fn serial(n: u64) -> String {
        format!("35693803564{:04}", n)
    }

    #[test]
    fn test_reconcile_inserts_items_and_audit() {
        let mut conn = test_conn();
        seed_device(&conn, "FMC920", 1).unwrap();

        let serials: Vec<String> = (0..3).map(serial).collect();
        let serial_refs: Vec<&str> = serials.iter().map(String::as_str).collect();
        let labels = [label("FMC920", "041-2", &serial_refs)];

        let report = InboundReconciler::new()
            .reconcile(&mut conn, &labels, &InboundContext::new("tester"))
            .unwrap();

        assert_eq!(report.totals.inserted, 3);
        assert_eq!(report.totals.boxes_created, 1);
        assert_eq!(report.totals.boxes_reused, 0);

        for s in &serials {
            let item = db::find_item(&conn, s).unwrap().unwrap();
            assert_eq!(item.status, StockStatus::In);
            assert_eq!(db::count_movements_for_serial(&conn, s).unwrap(), 1);
        }

        let movements = db::movements_for_batch(&conn, &report.batch_id).unwrap();
        assert_eq!(movements.len(), 3);

        let batch = db::get_batch(&conn, &report.batch_id).unwrap().unwrap();
        assert_eq!(batch.kind, db::BatchKind::Inbound);
        assert_eq!(batch.actor, "tester");
        assert_eq!(batch.totals["inserted"], 3);
    }

    #[test]
    fn test_skip_policy_counts_existing_and_in_file_duplicates() {
        let mut conn = test_conn();
        seed_device(&conn, "FMC920", 1).unwrap();

        // Pre-existing: 2 of the 10 serials
        let first = [label("FMC920", "041-1", &[&serial(0), &serial(1)])];
        InboundReconciler::new()
            .reconcile(&mut conn, &first, &InboundContext::new("tester"))
            .unwrap();

        // 10 serials, 2 already in the ledger, 1 repeated within the file
        let serials: Vec<String> = (0..10).map(serial).collect();
        let mut serial_refs: Vec<&str> = serials.iter().map(String::as_str).collect();
        serial_refs.push(&serials[5]); // duplicate-in-file
        let labels = [label("FMC920", "041-2", &serial_refs)];

        let report = InboundReconciler::new()
            .reconcile(&mut conn, &labels, &InboundContext::new("tester"))
            .unwrap();

        assert_eq!(report.totals.inserted, 8);
        assert_eq!(report.totals.skipped_existing, 2);
        assert_eq!(report.totals.skipped_duplicate_in_file, 1);
        assert_eq!(report.totals.boxes_created, 1);

        // One movement per inserted item, none for skipped ones
        let movements = db::movements_for_batch(&conn, &report.batch_id).unwrap();
        assert_eq!(movements.len(), 8);

        // Skipped serials stay where they were
        let kept = db::find_item(&conn, &serial(0)).unwrap().unwrap();
        let first_box = db::find_box(
            &conn,
            kept.device_id,
            "041-1",
        )
        .unwrap()
        .unwrap();
        assert_eq!(kept.box_id, first_box.id);
    }

    #[test]
    fn test_reject_policy_blocks_whole_request_with_locations() {
        let mut conn = test_conn();
        seed_device(&conn, "FMC920", 1).unwrap();

        let first = [label("FMC920", "041-1", &[&serial(0)])];
        InboundReconciler::new()
            .reconcile(&mut conn, &first, &InboundContext::new("tester"))
            .unwrap();

        let labels = [label("FMC920", "041-2", &[&serial(0), &serial(1)])];
        let err = InboundReconciler::with_policy(DuplicatePolicy::RejectBatch)
            .reconcile(&mut conn, &labels, &InboundContext::new("tester"))
            .unwrap_err();

        match err {
            StockError::DuplicateSerials(conflicts) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].serial, serial(0));
                assert_eq!(conflicts[0].device, "FMC920");
                assert_eq!(conflicts[0].box_code, "041-1");
            }
            other => panic!("expected DuplicateSerials, got {other:?}"),
        }

        // Rolled back: the non-duplicate serial was not inserted either
        assert!(db::find_item(&conn, &serial(1)).unwrap().is_none());
        assert!(db::find_box_by_code(&conn, "041-2", None).unwrap().is_none());
    }

    #[test]
    fn test_unknown_device_rejects_before_mutation() {
        let mut conn = test_conn();
        seed_device(&conn, "FMC920", 1).unwrap();

        let labels = [
            label("FMC920", "041-2", &[&serial(0)]),
            label("GHOST9000", "077", &[&serial(1)]),
        ];
        let err = InboundReconciler::new()
            .reconcile(&mut conn, &labels, &InboundContext::new("tester"))
            .unwrap_err();

        match err {
            StockError::UnresolvedDevices(names) => {
                assert_eq!(names, vec!["GHOST9000".to_string()]);
            }
            other => panic!("expected UnresolvedDevices, got {other:?}"),
        }

        // Nothing from the request landed, including the valid label
        assert!(db::find_item(&conn, &serial(0)).unwrap().is_none());
    }

    #[test]
    fn test_inactive_device_blocks_import() {
        let mut conn = test_conn();
        seed_device(&conn, "FMC920", 1).unwrap();
        crate::catalog::deactivate_device(&conn, "FMC920").unwrap();

        let labels = [label("FMC920", "041-2", &[&serial(0)])];
        let err = InboundReconciler::new()
            .reconcile(&mut conn, &labels, &InboundContext::new("tester"))
            .unwrap_err();

        assert!(matches!(err, StockError::UnresolvedDevices(_)));
    }

    #[test]
    fn test_box_reuse_updates_location() {
        let mut conn = test_conn();
        seed_device(&conn, "FMC920", 1).unwrap();

        let mut first = label("FMC920", "041-2", &[&serial(0)]);
        first.location = Some("shelf-A".to_string());
        InboundReconciler::new()
            .reconcile(&mut conn, &[first], &InboundContext::new("tester"))
            .unwrap();

        let mut second = label("FMC920", "041-2", &[&serial(1)]);
        second.location = Some("shelf-B".to_string());
        let report = InboundReconciler::new()
            .reconcile(&mut conn, &[second], &InboundContext::new("tester"))
            .unwrap();

        assert_eq!(report.totals.boxes_created, 0);
        assert_eq!(report.totals.boxes_reused, 1);

        let device = crate::catalog::DeviceCatalog::load(&conn)
            .unwrap()
            .by_display_name("FMC920")
            .cloned()
            .unwrap();
        let stock_box = db::find_box(&conn, device.id, "041-2").unwrap().unwrap();
        assert_eq!(stock_box.location.as_deref(), Some("shelf-B"));
        assert_eq!(
            db::count_items_in_box(&conn, stock_box.id, StockStatus::In).unwrap(),
            2
        );
    }

    #[test]
    fn test_manual_entry_validates_serials() {
        let mut conn = test_conn();
        seed_device(&conn, "FMC920", 1).unwrap();

        let err = InboundReconciler::manual_entry(
            &mut conn,
            "FMC920",
            "041-2",
            None,
            &["not-a-serial".to_string()],
            "tester",
        )
        .unwrap_err();

        assert!(matches!(err, StockError::InvalidSerial(_)));
    }

    #[test]
    fn test_manual_entry_blocks_on_existing_serial() {
        let mut conn = test_conn();
        seed_device(&conn, "FMC920", 1).unwrap();

        InboundReconciler::manual_entry(
            &mut conn,
            "FMC920",
            "041-1",
            None,
            &[serial(0)],
            "tester",
        )
        .unwrap();

        let err = InboundReconciler::manual_entry(
            &mut conn,
            "FMC920",
            "041-2",
            Some("shelf-A"),
            &[serial(0), serial(1)],
            "tester",
        )
        .unwrap_err();

        assert!(matches!(err, StockError::DuplicateSerials(_)));
        assert!(db::find_item(&conn, &serial(1)).unwrap().is_none());
    }

    #[test]
    fn test_serial_never_duplicated_through_any_path() {
        let mut conn = test_conn();
        seed_device(&conn, "FMC920", 1).unwrap();

        let labels = [label("FMC920", "041-1", &[&serial(0)])];
        InboundReconciler::new()
            .reconcile(&mut conn, &labels, &InboundContext::new("tester"))
            .unwrap();

        // Re-import the same serial under a different box: skipped
        let again = [label("FMC920", "041-2", &[&serial(0)])];
        let report = InboundReconciler::new()
            .reconcile(&mut conn, &again, &InboundContext::new("tester"))
            .unwrap();
        assert_eq!(report.totals.inserted, 0);
        assert_eq!(report.totals.skipped_existing, 1);

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM items WHERE serial = ?1",
                [serial(0)],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
