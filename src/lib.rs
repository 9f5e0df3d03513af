// Gear Watch - Core Library
// Price / link-health monitor for reviewed gear plus the submitted-media
// retention sweep. Used by the CLI monitor, the operator API and tests.

pub mod alert;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod logging;
pub mod retention;
pub mod scheduler;
pub mod sweep;
pub mod vendor;

// Re-export commonly used types
pub use alert::{AlertEmitter, CycleAlert, LogAlertEmitter, WebhookAlertEmitter};
pub use config::Config;
pub use db::{
    CatalogStore, Event, ImportSummary, LinkUpdate, SqliteCatalog,
    setup_database, load_catalog, get_entry, save_link_updates,
    mark_out_of_stock, clear_out_of_stock,
    insert_event, get_events_for_entity, link_entity_id,
    load_csv, import_entries,
};
pub use error::{FetchError, LinkNotFound};
pub use health::{
    CatalogEntry, FetchOutcome, LinkHealth, Transition, VendorLink, OUT_OF_STOCK_PRICE,
};
pub use retention::{age_in_days, sweep_retention, RetentionDirectory, RetentionReport};
pub use scheduler::{CycleReport, Monitor, MonitorSettings};
pub use sweep::{sweep_catalog, DeadLink, SweepSummary};
pub use vendor::{FetcherSet, HttpPriceFetcher, PriceFetcher, Vendor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
