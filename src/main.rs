use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use std::env;
use std::path::Path;

use gear_watch::logging::init_tracing;
use gear_watch::{
    clear_out_of_stock, import_entries, load_catalog, load_csv, mark_out_of_stock,
    sweep_retention, AlertEmitter, Config, FetcherSet, LogAlertEmitter, Monitor,
    MonitorSettings, SqliteCatalog, Vendor, VendorLink, WebhookAlertEmitter,
};

const USAGE: &str = "\
usage: gear-watch [command]

  run                                   monitor forever (default)
  once                                  run a single cycle
  import <csv>                          load catalog rows from CSV
  status                                show prices and link health
  mark-out-of-stock <entry_id> <vendor> operator override
  clear-out-of-stock <entry_id> <vendor>
  purge                                 run only the retention sweep";

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let cfg = Config::from_env();
    init_tracing(&cfg.log_level, cfg.log_json);

    match args.get(1).map(String::as_str) {
        None | Some("run") => run_forever(&cfg)?,
        Some("once") => run_once(&cfg)?,
        Some("import") => {
            let csv = args.get(2).ok_or_else(|| anyhow!("import needs a CSV path\n\n{USAGE}"))?;
            run_import(&cfg, Path::new(csv))?;
        }
        Some("status") => show_status(&cfg)?,
        Some(cmd @ ("mark-out-of-stock" | "clear-out-of-stock")) => {
            let (entry_id, vendor) = parse_link_args(&args[2..])?;
            run_override(&cfg, cmd, entry_id, vendor)?;
        }
        Some("purge") => run_purge(&cfg),
        Some("-h" | "--help" | "help") => println!("{USAGE}"),
        Some(other) => bail!("unknown command: {other}\n\n{USAGE}"),
    }

    Ok(())
}

fn build_monitor(cfg: &Config) -> Result<Monitor<SqliteCatalog>> {
    let store = SqliteCatalog::open(&cfg.database_path)?;
    let fetchers = FetcherSet::http(cfg.fetch_timeout)?;

    let alerts: Box<dyn AlertEmitter> = match &cfg.alert_webhook {
        Some(url) => Box::new(WebhookAlertEmitter::new(url, cfg.fetch_timeout)?),
        None => Box::new(LogAlertEmitter),
    };

    let settings = MonitorSettings {
        media_root: cfg.media_root.clone(),
        retention_days: cfg.retention_days,
        fetch_timeout: cfg.fetch_timeout,
    };

    Ok(Monitor::new(store, fetchers, alerts, settings))
}

fn run_forever(cfg: &Config) -> Result<()> {
    let mut monitor = build_monitor(cfg)?;
    monitor.run_forever(cfg.interval)
}

fn run_once(cfg: &Config) -> Result<()> {
    let mut monitor = build_monitor(cfg)?;
    let report = monitor.run_cycle(Utc::now());

    println!("🔁 Cycle complete");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    match &report.sweep {
        Some(sweep) => {
            println!("✓ Entries visited:   {}", sweep.entries_visited);
            println!("✓ Links checked:     {}", sweep.links_checked);
            println!("✓ Prices updated:    {}", sweep.prices_updated);
            println!("✓ Links recovered:   {}", sweep.recovered);
            println!("⚠ Fetch failures:    {}", sweep.fetch_failures);
            println!("⚠ New dead links:    {}", sweep.went_dead.len());
            for dead in &sweep.went_dead {
                println!("    #{} {} [{}] {}", dead.entry_id, dead.entry_name, dead.vendor, dead.url);
            }
            if sweep.persist_failures > 0 {
                println!("❌ Entries not saved: {}", sweep.persist_failures);
            }
            if sweep.superseded > 0 {
                println!("↷ Changed mid-sweep: {}", sweep.superseded);
            }
        }
        None => println!("❌ Catalog sweep failed (see log)"),
    }
    println!("✓ Alert sent:        {}", if report.alerted { "yes" } else { "no" });
    println!("✓ Media batches purged: {}", report.retention.removed.len());

    Ok(())
}

fn run_import(cfg: &Config, csv_path: &Path) -> Result<()> {
    println!("📂 Loading catalog CSV...");
    let entries = load_csv(csv_path)?;
    println!("✓ Loaded {} entries from {}", entries.len(), csv_path.display());

    let store = SqliteCatalog::open(&cfg.database_path)?;
    let summary = import_entries(store.connection(), &entries)?;

    println!("✓ Upserted {} entries, {} vendor links", summary.entries, summary.links);
    Ok(())
}

fn show_status(cfg: &Config) -> Result<()> {
    let store = SqliteCatalog::open(&cfg.database_path)?;
    let catalog = load_catalog(store.connection())?;

    println!("📊 {} catalog entries", catalog.len());
    for entry in &catalog {
        println!("\n#{} {} ({})", entry.id, entry.name, entry.category);
        for vendor in Vendor::ALL {
            match entry.link(vendor) {
                Some(link) => println!("  {:<12} {}", vendor.name(), describe_link(link)),
                None => println!("  {:<12} -", vendor.name()),
            }
        }
    }

    Ok(())
}

fn describe_link(link: &VendorLink) -> String {
    if !link.is_tracked() {
        return format!("{} (not tracked)", display_price(&link.last_known_price));
    }
    format!(
        "{:<14} {:<12} {}",
        display_price(&link.last_known_price),
        link.health.code(),
        link.url
    )
}

fn display_price(price: &str) -> &str {
    if price.is_empty() {
        "-"
    } else {
        price
    }
}

fn parse_link_args(args: &[String]) -> Result<(i64, Vendor)> {
    let [entry_id, vendor] = args else {
        bail!("expected <entry_id> <vendor>\n\n{USAGE}");
    };

    let entry_id = entry_id
        .parse::<i64>()
        .with_context(|| format!("invalid entry id: {entry_id}"))?;
    let vendor = Vendor::from_code(vendor).ok_or_else(|| {
        anyhow!(
            "unknown vendor: {vendor} (expected one of {})",
            Vendor::ALL.map(|v| v.code()).join(", ")
        )
    })?;

    Ok((entry_id, vendor))
}

fn run_override(cfg: &Config, cmd: &str, entry_id: i64, vendor: Vendor) -> Result<()> {
    let store = SqliteCatalog::open(&cfg.database_path)?;

    let link = if cmd == "mark-out-of-stock" {
        mark_out_of_stock(store.connection(), entry_id, vendor)?
    } else {
        clear_out_of_stock(store.connection(), entry_id, vendor)?
    };

    println!("✓ #{} {}: {}", entry_id, vendor.name(), describe_link(&link));
    Ok(())
}

fn run_purge(cfg: &Config) {
    let report = sweep_retention(&cfg.media_root, cfg.retention_days, Utc::now());

    println!("🗑️  Retention sweep of {}", cfg.media_root.display());
    println!("✓ Scanned:  {}", report.scanned);
    println!("✓ Removed:  {}", report.removed.len());
    println!("✓ Retained: {}", report.retained);
    if report.failures > 0 {
        println!("❌ Failures: {} (see log)", report.failures);
    }
}
