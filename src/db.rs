// Stock ledger - boxes, items, movements, import batches
// Shared data model for the inbound and outbound engines. Invariants
// live here: serial uniqueness (UNIQUE constraint), derived box status
// (recomputed inside the mutating transaction), one movement per item
// transition, one batch row per confirm/commit call.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// STATUS
// ============================================================================

/// Stock state shared by items and boxes. An item goes IN exactly once
/// and OUT at most once; a box's status is derived from its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockStatus {
    In,
    Out,
}

impl StockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockStatus::In => "IN",
            StockStatus::Out => "OUT",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "IN" => Some(StockStatus::In),
            "OUT" => Some(StockStatus::Out),
            _ => None,
        }
    }
}

fn status_from_row(s: String) -> Result<StockStatus, rusqlite::Error> {
    StockStatus::from_str(&s).ok_or(rusqlite::Error::InvalidQuery)
}

fn datetime_from_row(s: String) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::InvalidQuery)
}

// ============================================================================
// ROW TYPES
// ============================================================================

/// Physical box holding serials of one device type. Created by the
/// inbound reconciler on first encounter of (device, box_code), reused
/// afterwards. `status` is derived, never set directly by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockBox {
    pub id: i64,
    pub device_id: i64,
    pub box_code: String,
    pub location: Option<String>,
    pub status: StockStatus,
    pub created_at: DateTime<Utc>,
}

/// One serialized unit. `serial` is globally unique across all items
/// ever created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub serial: String,
    pub device_id: i64,
    pub box_id: i64,
    pub status: StockStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit record: one row per item transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Movement {
    pub id: i64,
    pub movement_type: StockStatus,
    pub serial: String,
    pub box_id: i64,
    pub batch_id: String,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchKind {
    Inbound,
    Outbound,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Inbound => "INBOUND",
            BatchKind::Outbound => "OUTBOUND",
        }
    }
}

/// Grouping record for one inbound confirm or outbound commit call.
/// `totals` is the operation's summary counters as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportBatch {
    pub id: String,
    pub kind: BatchKind,
    pub actor: String,
    pub vendor: Option<String>,
    pub source: Option<String>,
    pub source_checksum: Option<String>,
    pub totals: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// SHA-256 of raw source bytes, recorded on inbound batches for
/// provenance.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> anyhow::Result<()> {
    // WAL for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS devices (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            canonical_name TEXT UNIQUE NOT NULL,
            display_name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            units_per_serial INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS boxes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id INTEGER NOT NULL REFERENCES devices(id),
            box_code TEXT NOT NULL,
            location TEXT,
            status TEXT NOT NULL CHECK (status IN ('IN','OUT')),
            created_at TEXT NOT NULL,
            UNIQUE (device_id, box_code)
        )",
        [],
    )?;

    // UNIQUE(serial) is the system-wide uniqueness invariant; every
    // inbound path relies on it as the final arbiter.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            serial TEXT UNIQUE NOT NULL,
            device_id INTEGER NOT NULL REFERENCES devices(id),
            box_id INTEGER NOT NULL REFERENCES boxes(id),
            status TEXT NOT NULL CHECK (status IN ('IN','OUT')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS movements (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            movement_type TEXT NOT NULL CHECK (movement_type IN ('IN','OUT')),
            serial TEXT NOT NULL,
            box_id INTEGER NOT NULL REFERENCES boxes(id),
            batch_id TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_batches (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL CHECK (kind IN ('INBOUND','OUTBOUND')),
            actor TEXT NOT NULL,
            vendor TEXT,
            source TEXT,
            source_checksum TEXT,
            totals TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_items_box ON items(box_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_items_status ON items(status)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_movements_serial ON movements(serial)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_movements_batch ON movements(batch_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_boxes_code ON boxes(box_code)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// BOX OPERATIONS
// ============================================================================

fn box_from_row(row: &rusqlite::Row<'_>) -> Result<StockBox, rusqlite::Error> {
    Ok(StockBox {
        id: row.get(0)?,
        device_id: row.get(1)?,
        box_code: row.get(2)?,
        location: row.get(3)?,
        status: status_from_row(row.get(4)?)?,
        created_at: datetime_from_row(row.get(5)?)?,
    })
}

const BOX_COLUMNS: &str = "id, device_id, box_code, location, status, created_at";

pub fn find_box(
    conn: &Connection,
    device_id: i64,
    box_code: &str,
) -> Result<Option<StockBox>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {BOX_COLUMNS} FROM boxes WHERE device_id = ?1 AND box_code = ?2"),
        params![device_id, box_code],
        box_from_row,
    )
    .optional()
}

pub fn get_box(conn: &Connection, box_id: i64) -> Result<Option<StockBox>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {BOX_COLUMNS} FROM boxes WHERE id = ?1"),
        params![box_id],
        box_from_row,
    )
    .optional()
}

/// Find a box by code across devices; when `device_id` is given the
/// match is narrowed to that device (box tokens carry the device).
pub fn find_box_by_code(
    conn: &Connection,
    box_code: &str,
    device_id: Option<i64>,
) -> Result<Option<StockBox>, rusqlite::Error> {
    match device_id {
        Some(device_id) => find_box(conn, device_id, box_code),
        None => conn
            .query_row(
                &format!("SELECT {BOX_COLUMNS} FROM boxes WHERE box_code = ?1"),
                params![box_code],
                box_from_row,
            )
            .optional(),
    }
}

pub fn insert_box(
    conn: &Connection,
    device_id: i64,
    box_code: &str,
    location: Option<&str>,
) -> Result<StockBox, rusqlite::Error> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO boxes (device_id, box_code, location, status, created_at)
         VALUES (?1, ?2, ?3, 'IN', ?4)",
        params![device_id, box_code, location, now.to_rfc3339()],
    )?;

    Ok(StockBox {
        id: conn.last_insert_rowid(),
        device_id,
        box_code: box_code.to_string(),
        location: location.map(str::to_string),
        status: StockStatus::In,
        created_at: now,
    })
}

pub fn update_box_location(
    conn: &Connection,
    box_id: i64,
    location: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE boxes SET location = ?2 WHERE id = ?1",
        params![box_id, location],
    )?;
    Ok(())
}

/// Recompute a box's derived status: IN iff at least one item in the box
/// is IN. Must run inside the same transaction as the item mutation that
/// made it stale.
pub fn recompute_box_status(conn: &Connection, box_id: i64) -> Result<StockStatus, rusqlite::Error> {
    conn.execute(
        "UPDATE boxes SET status = CASE
             WHEN EXISTS (SELECT 1 FROM items WHERE box_id = ?1 AND status = 'IN')
             THEN 'IN' ELSE 'OUT'
         END
         WHERE id = ?1",
        params![box_id],
    )?;

    let status: String = conn.query_row(
        "SELECT status FROM boxes WHERE id = ?1",
        params![box_id],
        |row| row.get(0),
    )?;
    status_from_row(status)
}

// ============================================================================
// ITEM OPERATIONS
// ============================================================================

fn item_from_row(row: &rusqlite::Row<'_>) -> Result<Item, rusqlite::Error> {
    Ok(Item {
        id: row.get(0)?,
        serial: row.get(1)?,
        device_id: row.get(2)?,
        box_id: row.get(3)?,
        status: status_from_row(row.get(4)?)?,
        created_at: datetime_from_row(row.get(5)?)?,
        updated_at: datetime_from_row(row.get(6)?)?,
    })
}

const ITEM_COLUMNS: &str = "id, serial, device_id, box_id, status, created_at, updated_at";

pub fn find_item(conn: &Connection, serial: &str) -> Result<Option<Item>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {ITEM_COLUMNS} FROM items WHERE serial = ?1"),
        params![serial],
        item_from_row,
    )
    .optional()
}

pub fn insert_item(
    conn: &Connection,
    serial: &str,
    device_id: i64,
    box_id: i64,
) -> Result<Item, rusqlite::Error> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO items (serial, device_id, box_id, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'IN', ?4, ?4)",
        params![serial, device_id, box_id, now.to_rfc3339()],
    )?;

    Ok(Item {
        id: conn.last_insert_rowid(),
        serial: serial.to_string(),
        device_id,
        box_id,
        status: StockStatus::In,
        created_at: now,
        updated_at: now,
    })
}

/// Conditional IN -> OUT transition. Returns false when the item was no
/// longer IN - the caller lost a race and must count it, not fail.
pub fn mark_item_out(conn: &Connection, serial: &str) -> Result<bool, rusqlite::Error> {
    let now = Utc::now();
    let changed = conn.execute(
        "UPDATE items SET status = 'OUT', updated_at = ?2
         WHERE serial = ?1 AND status = 'IN'",
        params![serial, now.to_rfc3339()],
    )?;
    Ok(changed == 1)
}

pub fn items_in_box(
    conn: &Connection,
    box_id: i64,
    only_in: bool,
) -> Result<Vec<Item>, rusqlite::Error> {
    let sql = if only_in {
        format!("SELECT {ITEM_COLUMNS} FROM items WHERE box_id = ?1 AND status = 'IN' ORDER BY id")
    } else {
        format!("SELECT {ITEM_COLUMNS} FROM items WHERE box_id = ?1 ORDER BY id")
    };

    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params![box_id], item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn count_items_in_box(
    conn: &Connection,
    box_id: i64,
    status: StockStatus,
) -> Result<i64, rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*) FROM items WHERE box_id = ?1 AND status = ?2",
        params![box_id, status.as_str()],
        |row| row.get(0),
    )
}

// ============================================================================
// AUDIT: MOVEMENTS + BATCHES
// ============================================================================

pub fn insert_movement(
    conn: &Connection,
    movement_type: StockStatus,
    serial: &str,
    box_id: i64,
    batch_id: &str,
    actor: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO movements (movement_type, serial, box_id, batch_id, actor, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            movement_type.as_str(),
            serial,
            box_id,
            batch_id,
            actor,
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

/// Fresh batch id. Generated before the movements so they can reference
/// it; the batch row itself is written last, once totals are known.
pub fn new_batch_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Insert a batch row under a pre-generated id.
pub fn insert_batch(
    conn: &Connection,
    id: &str,
    kind: BatchKind,
    actor: &str,
    vendor: Option<&str>,
    source: Option<&str>,
    source_checksum: Option<&str>,
    totals: &serde_json::Value,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO import_batches
             (id, kind, actor, vendor, source, source_checksum, totals, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id,
            kind.as_str(),
            actor,
            vendor,
            source,
            source_checksum,
            totals.to_string(),
            Utc::now().to_rfc3339()
        ],
    )?;
    Ok(())
}

pub fn get_batch(conn: &Connection, id: &str) -> Result<Option<ImportBatch>, rusqlite::Error> {
    conn.query_row(
        "SELECT id, kind, actor, vendor, source, source_checksum, totals, created_at
         FROM import_batches WHERE id = ?1",
        params![id],
        |row| {
            let kind: String = row.get(1)?;
            let kind = match kind.as_str() {
                "INBOUND" => BatchKind::Inbound,
                "OUTBOUND" => BatchKind::Outbound,
                _ => return Err(rusqlite::Error::InvalidQuery),
            };
            let totals: String = row.get(6)?;
            Ok(ImportBatch {
                id: row.get(0)?,
                kind,
                actor: row.get(2)?,
                vendor: row.get(3)?,
                source: row.get(4)?,
                source_checksum: row.get(5)?,
                totals: serde_json::from_str(&totals)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?,
                created_at: datetime_from_row(row.get(7)?)?,
            })
        },
    )
    .optional()
}

pub fn movements_for_batch(
    conn: &Connection,
    batch_id: &str,
) -> Result<Vec<Movement>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, movement_type, serial, box_id, batch_id, actor, created_at
         FROM movements
         WHERE batch_id = ?1
         ORDER BY id",
    )?;

    let movements = stmt
        .query_map(params![batch_id], |row| {
            Ok(Movement {
                id: row.get(0)?,
                movement_type: status_from_row(row.get(1)?)?,
                serial: row.get(2)?,
                box_id: row.get(3)?,
                batch_id: row.get(4)?,
                actor: row.get(5)?,
                created_at: datetime_from_row(row.get(6)?)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(movements)
}

pub fn count_movements_for_serial(
    conn: &Connection,
    serial: &str,
) -> Result<i64, rusqlite::Error> {
    conn.query_row(
        "SELECT COUNT(*) FROM movements WHERE serial = ?1",
        params![serial],
        |row| row.get(0),
    )
}

// ============================================================================
// STOCK OVERVIEW (read side)
// ============================================================================

/// Per-device stock summary: how many items and boxes are currently IN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceStock {
    pub device: String,
    pub items_in: i64,
    pub boxes_in: i64,
}

pub fn stock_overview(conn: &Connection) -> Result<Vec<DeviceStock>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT
            d.display_name,
            COALESCE(SUM(CASE WHEN i.status = 'IN' THEN 1 ELSE 0 END), 0) AS items_in,
            COUNT(DISTINCT CASE WHEN b.status = 'IN' THEN b.id END) AS boxes_in
         FROM devices d
         LEFT JOIN boxes b ON b.device_id = d.id
         LEFT JOIN items i ON i.box_id = b.id
         GROUP BY d.id
         ORDER BY d.display_name",
    )?;

    let rows = stmt
        .query_map([], |row| {
            Ok(DeviceStock {
                device: row.get(0)?,
                items_in: row.get(1)?,
                boxes_in: row.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ============================================================================
// TESTS
// ============================================================================
