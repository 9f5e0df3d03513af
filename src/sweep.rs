// 🔁 Catalog Sweep
// Re-checks every tracked vendor link once and commits each entry on its own

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::db::{CatalogStore, Event, LinkUpdate};
use crate::error::FetchError;
use crate::health::{CatalogEntry, FetchOutcome, Transition};
use crate::vendor::{FetcherSet, Vendor};

const ACTOR: &str = "catalog_sweep";

// ============================================================================
// RESULTS
// ============================================================================

/// A link that went from Alive to Dead this cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLink {
    pub entry_id: i64,
    pub entry_name: String,
    pub vendor: Vendor,
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub entries_visited: usize,
    pub links_checked: usize,
    pub fetch_failures: usize,
    pub prices_updated: usize,
    pub recovered: usize,
    pub went_dead: Vec<DeadLink>,
    pub persist_failures: usize,
    /// Changes dropped because the link was overridden or re-imported
    /// while its fetch was in flight
    pub superseded: usize,
}

impl SweepSummary {
    /// Whether the alert emitter should run for this cycle
    pub fn any_went_dead(&self) -> bool {
        !self.went_dead.is_empty()
    }
}

/// One link's change, kept until the entry is committed
struct LinkChange {
    update: LinkUpdate,
    transition: Transition,
    error: Option<String>,
}

// ============================================================================
// SWEEP
// ============================================================================

/// Visit every catalog entry and every tracked vendor link once
///
/// Only a failure to read the catalog fails the sweep. A failed commit loses
/// that entry's update for this cycle and the sweep moves on; its
/// transitions are re-detected next cycle. A link whose stored row changed
/// after the catalog was read keeps the stored row.
pub fn sweep_catalog<S: CatalogStore + ?Sized>(
    store: &mut S,
    fetchers: &FetcherSet,
    fetch_timeout: Duration,
) -> Result<SweepSummary> {
    let catalog = store.load_catalog().context("Failed to load catalog")?;
    let mut summary = SweepSummary::default();

    info!(entries = catalog.len(), "catalog sweep started");

    for entry in catalog {
        summary.entries_visited += 1;
        sweep_entry(store, fetchers, fetch_timeout, entry, &mut summary);
    }

    info!(
        entries = summary.entries_visited,
        links = summary.links_checked,
        failures = summary.fetch_failures,
        updated = summary.prices_updated,
        recovered = summary.recovered,
        went_dead = summary.went_dead.len(),
        persist_failures = summary.persist_failures,
        superseded = summary.superseded,
        "catalog sweep finished"
    );

    Ok(summary)
}

fn sweep_entry<S: CatalogStore + ?Sized>(
    store: &mut S,
    fetchers: &FetcherSet,
    fetch_timeout: Duration,
    mut entry: CatalogEntry,
    summary: &mut SweepSummary,
) {
    let mut outcomes = fetch_entry(&entry, fetchers, fetch_timeout);
    let mut changes = Vec::new();

    for link in entry.links.iter_mut().filter(|l| l.is_tracked()) {
        let outcome = outcomes
            .remove(&link.vendor)
            .unwrap_or(Err(FetchError::Timeout(fetch_timeout)));

        summary.links_checked += 1;

        let error = match &outcome {
            Ok(price) => {
                debug!(entry_id = entry.id, vendor = link.vendor.code(), price = %price, "price fetched");
                None
            }
            Err(e) => {
                summary.fetch_failures += 1;
                warn!(
                    entry_id = entry.id,
                    vendor = link.vendor.code(),
                    url = %link.url,
                    kind = e.kind(),
                    error = %e,
                    "price fetch failed"
                );
                Some(e.to_string())
            }
        };

        let before = link.clone();
        let transition = link.apply_fetch(&outcome);
        if transition.is_change() {
            changes.push(LinkChange {
                update: LinkUpdate {
                    before,
                    after: link.clone(),
                },
                transition,
                error,
            });
        }
    }

    if changes.is_empty() {
        return;
    }

    let updates: Vec<LinkUpdate> = changes.iter().map(|c| c.update.clone()).collect();
    let written = match store.save_links(entry.id, &updates) {
        Ok(written) => written,
        Err(e) => {
            summary.persist_failures += 1;
            error!(entry_id = entry.id, error = %e, "failed to persist catalog entry");
            return;
        }
    };

    for change in changes {
        let link = &change.update.after;
        if !written.contains(&link.vendor) {
            summary.superseded += 1;
            info!(entry_id = entry.id, vendor = link.vendor.code(), "link changed during sweep, keeping stored state");
            continue;
        }

        let event = match &change.transition {
            Transition::WentDead => {
                summary.went_dead.push(DeadLink {
                    entry_id: entry.id,
                    entry_name: entry.name.clone(),
                    vendor: link.vendor,
                    url: link.url.clone(),
                });
                warn!(entry_id = entry.id, vendor = link.vendor.code(), url = %link.url, "link went dead");

                Event::for_link(
                    "link_dead",
                    entry.id,
                    link.vendor,
                    serde_json::json!({
                        "url": link.url,
                        "last_known_price": link.last_known_price,
                        "error": change.error,
                    }),
                    ACTOR,
                )
            }
            Transition::Recovered { previous_price } => {
                summary.recovered += 1;
                info!(entry_id = entry.id, vendor = link.vendor.code(), "dead link recovered");

                Event::for_link(
                    "link_recovered",
                    entry.id,
                    link.vendor,
                    serde_json::json!({
                        "previous_price": previous_price,
                        "price": link.last_known_price,
                    }),
                    ACTOR,
                )
            }
            Transition::PriceUpdated { previous } => {
                summary.prices_updated += 1;

                Event::for_link(
                    "price_changed",
                    entry.id,
                    link.vendor,
                    serde_json::json!({
                        "previous_price": previous,
                        "price": link.last_known_price,
                    }),
                    ACTOR,
                )
            }
            Transition::Unchanged => continue,
        };

        if let Err(e) = store.record_event(&event) {
            warn!(entry_id = entry.id, event = %event.event_type, error = %e, "failed to record audit event");
        }
    }
}

/// Fetch every tracked link of one entry concurrently
///
/// Each fetch runs on its own thread and reports back over a channel. The
/// whole entry shares one deadline; a fetch still running when it passes is
/// abandoned and counted as a timeout. No link state is touched here.
fn fetch_entry(
    entry: &CatalogEntry,
    fetchers: &FetcherSet,
    fetch_timeout: Duration,
) -> HashMap<Vendor, FetchOutcome> {
    let (tx, rx) = mpsc::channel::<(Vendor, FetchOutcome)>();
    let mut outcomes = HashMap::new();
    let mut pending = 0usize;

    for link in entry.tracked_links() {
        let vendor = link.vendor;

        let Some(fetcher) = fetchers.get(vendor) else {
            outcomes.insert(
                vendor,
                Err(FetchError::Network(format!("no fetcher registered for {vendor}"))),
            );
            continue;
        };

        let tx = tx.clone();
        let url = link.url.clone();
        let spawned = thread::Builder::new()
            .name(format!("fetch-{}-{}", entry.id, vendor.code()))
            .spawn(move || {
                let outcome = fetcher.fetch_price(&url);
                // Receiver is gone once the deadline passed
                let _ = tx.send((vendor, outcome));
            });

        match spawned {
            Ok(_) => pending += 1,
            Err(e) => {
                outcomes.insert(
                    vendor,
                    Err(FetchError::Network(format!("could not start fetch: {e}"))),
                );
            }
        }
    }
    drop(tx);

    let deadline = Instant::now() + fetch_timeout;
    let mut worker_lost = false;

    while pending > 0 {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok((vendor, outcome)) => {
                outcomes.insert(vendor, outcome);
                pending -= 1;
            }
            Err(RecvTimeoutError::Timeout) => break,
            Err(RecvTimeoutError::Disconnected) => {
                worker_lost = true;
                break;
            }
        }
    }

    for link in entry.tracked_links() {
        outcomes.entry(link.vendor).or_insert_with(|| {
            if worker_lost {
                Err(FetchError::Network("fetch worker stopped without a result".to_string()))
            } else {
                Err(FetchError::Timeout(fetch_timeout))
            }
        });
    }

    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{count_events, get_entry, import_entries, SqliteCatalog};
    use crate::health::{LinkHealth, VendorLink, OUT_OF_STOCK_PRICE};
    use crate::vendor::PriceFetcher;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Answers from a url → outcome table; unknown urls fail extraction
    struct StubFetcher {
        vendor: Vendor,
        responses: Mutex<HashMap<String, FetchOutcome>>,
        calls: AtomicUsize,
    }

    impl StubFetcher {
        fn new(vendor: Vendor) -> Arc<Self> {
            Arc::new(StubFetcher {
                vendor,
                responses: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            })
        }

        fn respond(&self, url: &str, outcome: FetchOutcome) {
            self.responses.lock().unwrap().insert(url.to_string(), outcome);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PriceFetcher for StubFetcher {
        fn vendor(&self) -> Vendor {
            self.vendor
        }

        fn fetch_price(&self, url: &str) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .get(url)
                .cloned()
                .unwrap_or_else(|| Err(FetchError::extraction(self.vendor, "price element missing")))
        }
    }

    struct HangingFetcher;

    impl PriceFetcher for HangingFetcher {
        fn vendor(&self) -> Vendor {
            Vendor::Backcountry
        }

        fn fetch_price(&self, _url: &str) -> Result<String, FetchError> {
            thread::sleep(Duration::from_secs(2));
            Ok("$1.00".to_string())
        }
    }

    /// Sqlite store whose commits fail for chosen entries
    struct FlakyStore {
        inner: SqliteCatalog,
        fail_ids: HashSet<i64>,
    }

    impl CatalogStore for FlakyStore {
        fn load_catalog(&self) -> Result<Vec<CatalogEntry>> {
            self.inner.load_catalog()
        }

        fn save_links(&mut self, entry_id: i64, updates: &[LinkUpdate]) -> Result<Vec<Vendor>> {
            if self.fail_ids.contains(&entry_id) {
                anyhow::bail!("disk I/O error");
            }
            self.inner.save_links(entry_id, updates)
        }

        fn record_event(&mut self, event: &Event) -> Result<()> {
            self.inner.record_event(event)
        }
    }

    fn store_with(entries: &[CatalogEntry]) -> SqliteCatalog {
        let store = SqliteCatalog::in_memory().unwrap();
        import_entries(store.connection(), entries).unwrap();
        store
    }

    /// Operator flags one vendor link right after the sweep reads the catalog
    struct OperatorMidSweep {
        inner: SqliteCatalog,
        flag: Vendor,
    }

    impl CatalogStore for OperatorMidSweep {
        fn load_catalog(&self) -> Result<Vec<CatalogEntry>> {
            let catalog = self.inner.load_catalog()?;
            crate::db::mark_out_of_stock(self.inner.connection(), 1, self.flag)?;
            Ok(catalog)
        }

        fn save_links(&mut self, entry_id: i64, updates: &[LinkUpdate]) -> Result<Vec<Vendor>> {
            self.inner.save_links(entry_id, updates)
        }

        fn record_event(&mut self, event: &Event) -> Result<()> {
            self.inner.record_event(event)
        }
    }

    fn single_link_entry(health: LinkHealth, price: &str) -> CatalogEntry {
        CatalogEntry::new(1, "Ultralight Pack", "Packs").with_link(
            VendorLink::new(Vendor::Moosejaw, "http://v1/x")
                .with_price(price)
                .with_health(health),
        )
    }

    fn stored_link(store: &SqliteCatalog, id: i64, vendor: Vendor) -> VendorLink {
        get_entry(store.connection(), id)
            .unwrap()
            .unwrap()
            .link(vendor)
            .cloned()
            .unwrap()
    }

    // ========================================================================
    // Scenarios
    // ========================================================================

    #[test]
    fn test_dead_then_recovered_scenario() {
        let mut store = store_with(&[single_link_entry(LinkHealth::Alive, "$10")]);
        let mj = StubFetcher::new(Vendor::Moosejaw);
        let fetchers = FetcherSet::new().with(mj.clone());

        // Cycle 1: the price element is gone
        let summary = sweep_catalog(&mut store, &fetchers, TIMEOUT).unwrap();
        let link = stored_link(&store, 1, Vendor::Moosejaw);

        assert!(summary.any_went_dead());
        assert_eq!(summary.went_dead[0].url, "http://v1/x");
        assert_eq!(link.health, LinkHealth::Dead);
        assert_eq!(link.last_known_price, "$10");

        // Cycle 2: the page is back with a new price
        mj.respond("http://v1/x", Ok("$12".to_string()));
        let summary = sweep_catalog(&mut store, &fetchers, TIMEOUT).unwrap();
        let link = stored_link(&store, 1, Vendor::Moosejaw);

        assert!(!summary.any_went_dead());
        assert_eq!(summary.recovered, 1);
        assert_eq!(link.health, LinkHealth::Alive);
        assert_eq!(link.last_known_price, "$12");
    }

    #[test]
    fn test_second_failure_raises_no_event() {
        let mut store = store_with(&[single_link_entry(LinkHealth::Alive, "$10")]);
        let fetchers = FetcherSet::new().with(StubFetcher::new(Vendor::Moosejaw));

        let first = sweep_catalog(&mut store, &fetchers, TIMEOUT).unwrap();
        let second = sweep_catalog(&mut store, &fetchers, TIMEOUT).unwrap();

        assert_eq!(first.went_dead.len(), 1);
        assert!(second.went_dead.is_empty());
        assert_eq!(second.fetch_failures, 1);
    }

    #[test]
    fn test_operator_out_of_stock_survives_sweep() {
        let mut store = store_with(&[single_link_entry(LinkHealth::Alive, "$10")]);
        crate::db::mark_out_of_stock(store.connection(), 1, Vendor::Moosejaw).unwrap();

        let mj = StubFetcher::new(Vendor::Moosejaw);
        mj.respond("http://v1/x", Ok("$15".to_string()));
        let fetchers = FetcherSet::new().with(mj.clone());

        sweep_catalog(&mut store, &fetchers, TIMEOUT).unwrap();
        let link = stored_link(&store, 1, Vendor::Moosejaw);

        assert_eq!(mj.calls(), 1);
        assert_eq!(link.health, LinkHealth::OutOfStock);
        assert_eq!(link.last_known_price, OUT_OF_STOCK_PRICE);
    }

    fn pack_and_fetchers() -> (SqliteCatalog, FetcherSet) {
        let entry = CatalogEntry::new(1, "Ultralight Pack", "Packs")
            .with_link(VendorLink::new(Vendor::Moosejaw, "http://mj/pack").with_price("$10"))
            .with_link(VendorLink::new(Vendor::Rei, "http://rei/pack").with_price("$10"));

        let rei = StubFetcher::new(Vendor::Rei);
        rei.respond("http://rei/pack", Ok("$15".to_string()));
        let fetchers = FetcherSet::new()
            .with(StubFetcher::new(Vendor::Moosejaw))
            .with(rei);

        (store_with(&[entry]), fetchers)
    }

    #[test]
    fn test_flag_set_during_sweep_survives_failed_fetch() {
        let (inner, fetchers) = pack_and_fetchers();
        let mut store = OperatorMidSweep { inner, flag: Vendor::Moosejaw };

        let summary = sweep_catalog(&mut store, &fetchers, TIMEOUT).unwrap();
        let mj = stored_link(&store.inner, 1, Vendor::Moosejaw);
        let rei = stored_link(&store.inner, 1, Vendor::Rei);

        assert!(summary.went_dead.is_empty());
        assert_eq!(summary.superseded, 1);
        assert_eq!(mj.health, LinkHealth::OutOfStock);
        assert_eq!(mj.last_known_price, OUT_OF_STOCK_PRICE);
        // The sibling link still takes its new price
        assert_eq!(rei.health, LinkHealth::Alive);
        assert_eq!(rei.last_known_price, "$15");
    }

    #[test]
    fn test_flag_set_during_sweep_survives_new_price() {
        let (inner, fetchers) = pack_and_fetchers();
        let mut store = OperatorMidSweep { inner, flag: Vendor::Rei };

        let summary = sweep_catalog(&mut store, &fetchers, TIMEOUT).unwrap();
        let mj = stored_link(&store.inner, 1, Vendor::Moosejaw);
        let rei = stored_link(&store.inner, 1, Vendor::Rei);

        assert_eq!(summary.prices_updated, 0);
        assert_eq!(summary.superseded, 1);
        assert_eq!(rei.health, LinkHealth::OutOfStock);
        assert_eq!(rei.last_known_price, OUT_OF_STOCK_PRICE);
        assert_eq!(summary.went_dead.len(), 1);
        assert_eq!(summary.went_dead[0].vendor, Vendor::Moosejaw);
        assert_eq!(mj.health, LinkHealth::Dead);

        let events = crate::db::get_events_for_entity(
            store.inner.connection(),
            crate::db::LINK_ENTITY,
            "1:rei",
        )
        .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "marked_out_of_stock");
    }

    #[test]
    fn test_untracked_links_are_not_visited() {
        let entry = CatalogEntry::new(1, "Stove", "Cooking")
            .with_link(VendorLink::new(Vendor::Rei, "").with_price("$40"))
            .with_link(VendorLink::new(Vendor::Backcountry, "http://bc/stove").with_price("$42"));
        let mut store = store_with(&[entry]);

        let rei = StubFetcher::new(Vendor::Rei);
        let bc = StubFetcher::new(Vendor::Backcountry);
        bc.respond("http://bc/stove", Ok("$39".to_string()));
        let fetchers = FetcherSet::new().with(rei.clone()).with(bc.clone());

        let summary = sweep_catalog(&mut store, &fetchers, TIMEOUT).unwrap();

        assert_eq!(rei.calls(), 0);
        assert_eq!(bc.calls(), 1);
        assert_eq!(summary.links_checked, 1);
        assert_eq!(stored_link(&store, 1, Vendor::Rei).last_known_price, "$40");
        assert_eq!(stored_link(&store, 1, Vendor::Backcountry).last_known_price, "$39");
    }

    #[test]
    fn test_all_vendors_share_failure_rules() {
        let entry = CatalogEntry::new(1, "Rain Shell", "Apparel")
            .with_link(VendorLink::new(Vendor::Moosejaw, "http://mj/shell").with_price("$1"))
            .with_link(VendorLink::new(Vendor::Rei, "http://rei/shell").with_price("$2"))
            .with_link(VendorLink::new(Vendor::Backcountry, "http://bc/shell").with_price("$3"));
        let mut store = store_with(&[entry]);

        let fetchers = FetcherSet::new()
            .with(StubFetcher::new(Vendor::Moosejaw))
            .with(StubFetcher::new(Vendor::Rei))
            .with(StubFetcher::new(Vendor::Backcountry));

        let summary = sweep_catalog(&mut store, &fetchers, TIMEOUT).unwrap();

        assert_eq!(summary.went_dead.len(), 3);
        for vendor in Vendor::ALL {
            assert_eq!(stored_link(&store, 1, vendor).health, LinkHealth::Dead);
        }
    }

    // ========================================================================
    // Properties
    // ========================================================================

    #[test]
    fn test_sweep_is_idempotent() {
        let entries = [
            single_link_entry(LinkHealth::Alive, "$10"),
            CatalogEntry::new(2, "Water Filter", "Water")
                .with_link(VendorLink::new(Vendor::Rei, "http://rei/filter").with_price("$30")),
        ];
        let mut store = store_with(&entries);

        let rei = StubFetcher::new(Vendor::Rei);
        rei.respond("http://rei/filter", Ok("$34.95".to_string()));
        let fetchers = FetcherSet::new()
            .with(StubFetcher::new(Vendor::Moosejaw))
            .with(rei);

        sweep_catalog(&mut store, &fetchers, TIMEOUT).unwrap();
        let after_first = store.load_catalog().unwrap();
        let events_first = count_events(store.connection()).unwrap();

        sweep_catalog(&mut store, &fetchers, TIMEOUT).unwrap();
        let after_second = store.load_catalog().unwrap();

        assert_eq!(after_first, after_second);
        assert_eq!(events_first, 2);
        assert_eq!(count_events(store.connection()).unwrap(), events_first);
    }

    #[test]
    fn test_persist_failure_is_isolated() {
        let entries = [
            CatalogEntry::new(1, "Entry A", "Test")
                .with_link(VendorLink::new(Vendor::Rei, "http://rei/a").with_price("$1")),
            CatalogEntry::new(2, "Entry B", "Test")
                .with_link(VendorLink::new(Vendor::Rei, "http://rei/b").with_price("$1")),
        ];
        let mut store = FlakyStore {
            inner: store_with(&entries),
            fail_ids: HashSet::from([1]),
        };

        let rei = StubFetcher::new(Vendor::Rei);
        rei.respond("http://rei/b", Ok("$2".to_string()));
        // Entry A's link fails, so its would-be dead event is never committed
        let fetchers = FetcherSet::new().with(rei);

        let summary = sweep_catalog(&mut store, &fetchers, TIMEOUT).unwrap();

        assert_eq!(summary.persist_failures, 1);
        assert_eq!(summary.prices_updated, 1);
        assert!(summary.went_dead.is_empty());

        let a = stored_link(&store.inner, 1, Vendor::Rei);
        let b = stored_link(&store.inner, 2, Vendor::Rei);
        assert_eq!(a.health, LinkHealth::Alive);
        assert_eq!(b.last_known_price, "$2");
    }

    #[test]
    fn test_hanging_fetch_times_out() {
        let entry = CatalogEntry::new(1, "Sleeping Bag", "Sleep")
            .with_link(VendorLink::new(Vendor::Moosejaw, "http://mj/bag").with_price("$300"))
            .with_link(VendorLink::new(Vendor::Backcountry, "http://bc/bag").with_price("$310"));
        let mut store = store_with(&[entry]);

        let mj = StubFetcher::new(Vendor::Moosejaw);
        mj.respond("http://mj/bag", Ok("$280".to_string()));
        let fetchers = FetcherSet::new().with(mj).with(Arc::new(HangingFetcher));

        let started = Instant::now();
        let summary = sweep_catalog(&mut store, &fetchers, Duration::from_millis(100)).unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(summary.went_dead.len(), 1);
        assert_eq!(summary.went_dead[0].vendor, Vendor::Backcountry);
        assert_eq!(stored_link(&store, 1, Vendor::Moosejaw).last_known_price, "$280");
    }

    #[test]
    fn test_missing_fetcher_counts_as_failure() {
        let mut store = store_with(&[single_link_entry(LinkHealth::Alive, "$10")]);

        let summary = sweep_catalog(&mut store, &FetcherSet::new(), TIMEOUT).unwrap();

        assert_eq!(summary.went_dead.len(), 1);
        assert_eq!(stored_link(&store, 1, Vendor::Moosejaw).health, LinkHealth::Dead);
    }
}
