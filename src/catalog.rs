// Device catalog - read-only collaborator
// The core never edits catalog entries; it reads a snapshot and matches
// vendor strings against it. A seed helper exists for the CLI and tests.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

/// One catalog entry identifying a product type.
///
/// `canonical_name` is the normalized (uppercase, alphanumeric-only) form
/// used for matching; `display_name` is what operators see on labels and
/// reports. `units_per_serial` covers devices packed as multi-unit kits
/// under a single serial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    pub canonical_name: String,
    pub display_name: String,
    pub active: bool,
    pub units_per_serial: i64,
}

/// Normalize a raw device string to canonical form: uppercase,
/// alphanumeric characters only.
///
/// Every matching path goes through this, so "fmc-920", "FMC 920" and
/// "FMC920" all compare equal.
pub fn canonicalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Immutable snapshot of the device catalog.
///
/// Engines take a snapshot once per operation; the resolver is pure over
/// it, which is what makes parse results reproducible.
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    devices: Vec<Device>,
}

impl DeviceCatalog {
    pub fn new(devices: Vec<Device>) -> Self {
        DeviceCatalog { devices }
    }

    /// Load the current catalog from the database, active and inactive.
    /// Matching only ever considers active entries; inactive ones are kept
    /// so lookups by id still succeed for historical rows.
    pub fn load(conn: &Connection) -> Result<Self, rusqlite::Error> {
        let mut stmt = conn.prepare(
            "SELECT id, canonical_name, display_name, active, units_per_serial
             FROM devices
             ORDER BY canonical_name",
        )?;

        let devices = stmt
            .query_map([], |row| {
                Ok(Device {
                    id: row.get(0)?,
                    canonical_name: row.get(1)?,
                    display_name: row.get(2)?,
                    active: row.get::<_, i64>(3)? != 0,
                    units_per_serial: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DeviceCatalog { devices })
    }

    /// Active entries only - the matching population for the resolver.
    pub fn active(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().filter(|d| d.active)
    }

    pub fn all(&self) -> &[Device] {
        &self.devices
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Look up an active entry by display name (exact, case-sensitive -
    /// display names are what the resolver hands back).
    pub fn by_display_name(&self, display_name: &str) -> Option<&Device> {
        self.devices
            .iter()
            .find(|d| d.active && d.display_name == display_name)
    }

    /// Look up an active entry by canonical form of an arbitrary string.
    pub fn by_canonical(&self, raw: &str) -> Option<&Device> {
        let canon = canonicalize(raw);
        self.devices
            .iter()
            .find(|d| d.active && d.canonical_name == canon)
    }

    pub fn by_id(&self, id: i64) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }
}

/// Register a device in the catalog. Collaborator-side operation, exposed
/// for seeding and tests; the core engines never call it.
pub fn seed_device(
    conn: &Connection,
    display_name: &str,
    units_per_serial: i64,
) -> Result<Device, rusqlite::Error> {
    let canonical = canonicalize(display_name);

    conn.execute(
        "INSERT INTO devices (canonical_name, display_name, active, units_per_serial)
         VALUES (?1, ?2, 1, ?3)
         ON CONFLICT(canonical_name) DO UPDATE SET
             display_name = excluded.display_name,
             units_per_serial = excluded.units_per_serial",
        params![canonical, display_name, units_per_serial],
    )?;

    let device = conn.query_row(
        "SELECT id, canonical_name, display_name, active, units_per_serial
         FROM devices WHERE canonical_name = ?1",
        params![canonical],
        |row| {
            Ok(Device {
                id: row.get(0)?,
                canonical_name: row.get(1)?,
                display_name: row.get(2)?,
                active: row.get::<_, i64>(3)? != 0,
                units_per_serial: row.get(4)?,
            })
        },
    )?;

    Ok(device)
}

/// Deactivate a catalog entry. Items already in the ledger keep their
/// device reference; only new inbound creation is blocked.
pub fn deactivate_device(conn: &Connection, display_name: &str) -> Result<bool, rusqlite::Error> {
    let canonical = canonicalize(display_name);
    let changed = conn.execute(
        "UPDATE devices SET active = 0 WHERE canonical_name = ?1",
        params![canonical],
    )?;
    Ok(changed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::setup_database;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        conn
    }

    #[test]
    fn test_canonicalize_strips_and_uppercases() {
        assert_eq!(canonicalize("fmc-920"), "FMC920");
        assert_eq!(canonicalize("FMC 920"), "FMC920");
        assert_eq!(canonicalize("  cv200/xeu "), "CV200XEU");
        assert_eq!(canonicalize(""), "");
    }

    #[test]
    fn test_seed_and_load_snapshot() {
        let conn = test_conn();
        seed_device(&conn, "FMC920", 1).unwrap();
        seed_device(&conn, "CV200", 1).unwrap();

        let catalog = DeviceCatalog::load(&conn).unwrap();
        assert_eq!(catalog.all().len(), 2);
        assert!(catalog.by_canonical("fmc 920").is_some());
        assert_eq!(
            catalog.by_display_name("CV200").unwrap().canonical_name,
            "CV200"
        );
    }

    #[test]
    fn test_seed_is_idempotent_on_canonical_name() {
        let conn = test_conn();
        let first = seed_device(&conn, "FMC920", 1).unwrap();
        let second = seed_device(&conn, "FMC920", 2).unwrap();

        // Same row updated, not a second row
        assert_eq!(first.id, second.id);
        assert_eq!(second.units_per_serial, 2);

        let catalog = DeviceCatalog::load(&conn).unwrap();
        assert_eq!(catalog.all().len(), 1);
    }

    #[test]
    fn test_deactivated_device_excluded_from_matching() {
        let conn = test_conn();
        seed_device(&conn, "FMC920", 1).unwrap();
        deactivate_device(&conn, "FMC920").unwrap();

        let catalog = DeviceCatalog::load(&conn).unwrap();
        assert!(catalog.by_canonical("FMC920").is_none());
        assert_eq!(catalog.active().count(), 0);
        // Still present for id lookups
        assert_eq!(catalog.all().len(), 1);
    }
}
