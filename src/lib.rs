// Serialstock - Serialized Inventory Core
// Exposes all modules for use in the CLI, API server, and tests

pub mod catalog;
pub mod db;
pub mod error;
pub mod grid;
pub mod inbound;
pub mod outbound;
pub mod parser;
pub mod resolver;

// Re-export commonly used types
pub use catalog::{canonicalize, deactivate_device, seed_device, Device, DeviceCatalog};
pub use db::{
    setup_database, sha256_hex, stock_overview, BatchKind, DeviceStock, ImportBatch, Item,
    Movement, StockBox, StockStatus,
};
pub use error::{SerialConflict, StockError, StockResult};
pub use grid::{header_token, SheetGrid};
pub use inbound::{
    DuplicatePolicy, InboundContext, InboundReconciler, InboundReport, InboundTotals,
};
pub use outbound::{
    commit as outbound_commit, parse_scan_payload, preview as outbound_preview, BoxBreakdown,
    OutboundCommit, OutboundPreview, ScanMode, ScanPayload,
};
pub use parser::{
    clean_serial, extract_box_code, parse_sheet, parser_for, ParsedLabel, SheetParser,
    VendorLayout, VendorProfile,
};
pub use resolver::{resolve, resolve_display, MatchStrategy, Resolution};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
