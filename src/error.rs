// Error taxonomy for the stock core
// Every expected failure class carries enough structure for the caller
// to correct its input and retry.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A serial that collides with an item already in the ledger (or earlier
/// in the same request), together with its current location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConflict {
    pub serial: String,

    /// Display name of the device the existing item belongs to.
    pub device: String,

    /// Box code the existing item currently sits in. Empty for
    /// duplicates within the same request (no ledger row yet).
    pub box_code: String,
}

impl std::fmt::Display for SerialConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.box_code.is_empty() {
            write!(f, "{} (duplicate in request)", self.serial)
        } else {
            write!(f, "{} ({} / box {})", self.serial, self.device, self.box_code)
        }
    }
}

/// Domain errors for parsing, reconciliation and outbound commits.
#[derive(Debug, Error)]
pub enum StockError {
    /// No parseable header/block found in the sheet. Nothing partial is
    /// returned for a sheet we could not orient ourselves in.
    #[error("malformed sheet: {reason}")]
    MalformedSheet { reason: String },

    /// One or more raw device strings did not resolve against the
    /// catalog. The whole parse/import fails; the caller registers the
    /// listed names and retries.
    #[error("unresolved devices: {}", .0.join(", "))]
    UnresolvedDevices(Vec<String>),

    /// Strict inbound entry found serials that already exist. The whole
    /// request is rejected and every conflict is reported.
    #[error("{} duplicate serial(s), first: {}", .0.len(), .0.first().map(|c| c.to_string()).unwrap_or_default())]
    DuplicateSerials(Vec<SerialConflict>),

    /// The scan payload contained nothing that looks like a serial or a
    /// box token.
    #[error("scan payload contains no serials or box token")]
    EmptyScan,

    /// A manually entered serial fails validation (14-17 digits after
    /// stripping separators).
    #[error("invalid serial: {0}")]
    InvalidSerial(String),

    /// After the commit-time re-check, zero targeted items were still IN.
    /// Committing nothing is an error, not a silent success.
    #[error("nothing to commit: no targeted item is still IN")]
    NothingToCommit,

    #[error("device not found in catalog: {0}")]
    UnknownDevice(String),

    #[error("box not found: {0}")]
    UnknownBox(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

pub type StockResult<T> = Result<T, StockError>;
