// ⏱️ Monitor Scheduler
// One cycle = catalog sweep → alert (if any link died) → retention sweep.
// Cycles never overlap and nothing about the last run is persisted: a
// restart simply begins a fresh cycle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::alert::{AlertEmitter, CycleAlert};
use crate::db::CatalogStore;
use crate::retention::{sweep_retention, RetentionReport};
use crate::sweep::{sweep_catalog, SweepSummary};
use crate::vendor::FetcherSet;

/// Knobs for one monitor instance
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub media_root: PathBuf,
    pub retention_days: u32,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    /// None when the catalog could not be read this cycle
    pub sweep: Option<SweepSummary>,
    pub alerted: bool,
    pub retention: RetentionReport,
}

/// Monitor - owns everything a cycle touches
///
/// The store handle is created by the process entry point and handed in.
pub struct Monitor<S: CatalogStore> {
    store: S,
    fetchers: FetcherSet,
    alerts: Box<dyn AlertEmitter>,
    settings: MonitorSettings,
}

impl<S: CatalogStore> Monitor<S> {
    pub fn new(
        store: S,
        fetchers: FetcherSet,
        alerts: Box<dyn AlertEmitter>,
        settings: MonitorSettings,
    ) -> Self {
        Monitor {
            store,
            fetchers,
            alerts,
            settings,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one full cycle to completion
    pub fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleReport {
        let sweep = match sweep_catalog(&mut self.store, &self.fetchers, self.settings.fetch_timeout)
        {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!(error = %e, "catalog sweep failed");
                None
            }
        };

        let mut alerted = false;
        if let Some(summary) = sweep.as_ref().filter(|s| s.any_went_dead()) {
            let alert = CycleAlert::new(now, summary.went_dead.clone());
            match self.alerts.notify_dead_links(&alert) {
                Ok(()) => alerted = true,
                Err(e) => warn!(error = %e, dead_links = alert.dead_links.len(), "dead-link alert not delivered"),
            }
        }

        let retention = sweep_retention(&self.settings.media_root, self.settings.retention_days, now);

        CycleReport {
            sweep,
            alerted,
            retention,
        }
    }

    /// Cycle, sleep, repeat until the process is terminated
    pub fn run_forever(&mut self, interval: Duration) -> ! {
        info!(interval_secs = interval.as_secs(), "monitor started");

        loop {
            let report = self.run_cycle(Utc::now());
            info!(
                alerted = report.alerted,
                purged = report.retention.removed.len(),
                "cycle complete, waiting"
            );
            thread::sleep(interval);
        }
    }
}
