use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use std::env;
use std::path::{Path, PathBuf};

use serialstock::inbound::{InboundContext, InboundReconciler};
use serialstock::{
    outbound_commit, outbound_preview, parse_scan_payload, parse_sheet, seed_device,
    setup_database, sha256_hex, stock_overview, DeviceCatalog, SheetGrid, VendorProfile,
};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str).unwrap_or("help");

    match command {
        "seed" => run_seed(&args[2..]),
        "import" => run_import(&args[2..]),
        "preview" => run_preview(&args[2..]),
        "commit" => run_commit(&args[2..]),
        "status" => run_status(),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("serialstock {}", serialstock::VERSION);
    println!();
    println!("Usage:");
    println!("  serialstock seed <device> [units-per-serial]");
    println!("  serialstock import <vendor> <sheet.csv> <actor> [forced-device]");
    println!("      vendor: block | carton | explicit | single-box");
    println!("  serialstock preview <scan-payload>");
    println!("  serialstock commit <actor> <scan-payload>");
    println!("  serialstock status");
    println!();
    println!("Database path comes from SERIALSTOCK_DB (default: serialstock.db)");
}

fn db_path() -> PathBuf {
    env::var("SERIALSTOCK_DB")
        .unwrap_or_else(|_| "serialstock.db".to_string())
        .into()
}

fn open_db() -> Result<Connection> {
    let path = db_path();
    let conn = Connection::open(&path)
        .with_context(|| format!("Failed to open database: {}", path.display()))?;
    setup_database(&conn)?;
    Ok(conn)
}

fn run_seed(args: &[String]) -> Result<()> {
    let Some(device) = args.first() else {
        bail!("seed requires a device display name");
    };
    let units: i64 = args.get(1).map(|u| u.parse()).transpose()?.unwrap_or(1);

    let conn = open_db()?;
    let device = seed_device(&conn, device, units)?;
    println!(
        "Registered {} (canonical {}, {} unit(s) per serial)",
        device.display_name, device.canonical_name, device.units_per_serial
    );
    Ok(())
}

fn profile_for(vendor: &str, forced_device: Option<&str>) -> Result<VendorProfile> {
    let profile = match vendor {
        "block" => VendorProfile::block(vendor),
        "carton" => VendorProfile::carton(vendor),
        "explicit" => VendorProfile::explicit(vendor),
        "single-box" => {
            let device = forced_device
                .context("single-box vendor needs a forced device as the last argument")?;
            VendorProfile::single_box(vendor, device)
        }
        other => bail!("unknown vendor '{other}' (expected block|carton|explicit|single-box)"),
    };
    Ok(profile)
}

fn run_import(args: &[String]) -> Result<()> {
    let [vendor, sheet, actor, rest @ ..] = args else {
        bail!("import requires: <vendor> <sheet.csv> <actor> [forced-device]");
    };
    let profile = profile_for(vendor, rest.first().map(String::as_str))?;

    let sheet_path = Path::new(sheet);
    let source = sheet_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("sheet");
    let bytes = std::fs::read(sheet_path)
        .with_context(|| format!("Failed to read sheet: {}", sheet_path.display()))?;
    let grid = SheetGrid::read_csv(bytes.as_slice())?;

    let mut conn = open_db()?;
    let catalog = DeviceCatalog::load(&conn)?;
    let labels = parse_sheet(&grid, &catalog, &profile, source)?;

    println!("Parsed {} label(s) from {}", labels.len(), sheet);
    for label in &labels {
        println!(
            "  {} / box {} - {} serial(s), qty {}",
            label.device,
            label.box_code,
            label.serials.len(),
            label.qty
        );
    }

    let ctx = InboundContext::new(actor)
        .with_vendor(&profile.name)
        .with_source(source, Some(sha256_hex(&bytes)));
    let report = InboundReconciler::new().reconcile(&mut conn, &labels, &ctx)?;

    println!();
    println!("Batch {}", report.batch_id);
    println!(
        "  inserted {} | skipped existing {} | duplicate in file {} | boxes created {} / reused {}",
        report.totals.inserted,
        report.totals.skipped_existing,
        report.totals.skipped_duplicate_in_file,
        report.totals.boxes_created,
        report.totals.boxes_reused
    );
    Ok(())
}

fn run_preview(args: &[String]) -> Result<()> {
    let scan = args.join(" ");
    let payload = parse_scan_payload(&scan)?;

    let conn = open_db()?;
    let report = outbound_preview(&conn, &payload)?;

    println!(
        "Mode {} - found {} | missing {} | already out {}",
        report.mode.name(),
        report.imei_found,
        report.imei_missing,
        report.already_out
    );
    for b in &report.boxes {
        println!(
            "  box {}: in {} | remove {} | remain {}{}",
            b.box_code,
            b.current_in,
            b.will_remove,
            b.will_remain,
            if b.will_be_emptied { " (will be emptied)" } else { "" }
        );
    }
    for serial in &report.missing_serials {
        println!("  missing: {serial}");
    }
    Ok(())
}

fn run_commit(args: &[String]) -> Result<()> {
    let [actor, scan @ ..] = args else {
        bail!("commit requires: <actor> <scan-payload>");
    };
    if scan.is_empty() {
        bail!("commit requires a scan payload");
    }
    let payload = parse_scan_payload(&scan.join(" "))?;

    let mut conn = open_db()?;
    let report = outbound_commit(&mut conn, &payload, actor)?;

    println!("Batch {}", report.batch_id);
    println!(
        "  committed {} | already out {} | not found {} | blocked {}",
        report.committed, report.already_out, report.not_found, report.blocked
    );
    if !report.boxes_emptied.is_empty() {
        println!("  boxes emptied: {}", report.boxes_emptied.join(", "));
    }
    Ok(())
}

fn run_status() -> Result<()> {
    let conn = open_db()?;
    let overview = stock_overview(&conn)?;

    if overview.is_empty() {
        println!("No devices registered");
        return Ok(());
    }

    println!("{:<24} {:>10} {:>10}", "Device", "Items IN", "Boxes IN");
    for row in overview {
        println!("{:<24} {:>10} {:>10}", row.device, row.items_in, row.boxes_in);
    }
    Ok(())
}
