// 🗑️ Retention Sweep
// Deletes submitted-media batch directories once they reach the retention
// window. Deletion is permanent: nothing is retried or moved aside.
//
// Layout: <media_root>/<category>/<batch>
//   e.g.  static/submissions/submitted_trail_pics/2024-06-01-userpics

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{self, DirEntry};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, error, info, warn};

pub const SECONDS_PER_DAY: i64 = 24 * 3600;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// One batch of user-submitted media
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionDirectory {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl RetentionDirectory {
    pub fn age_in_days(&self, now: DateTime<Utc>) -> i64 {
        age_in_days(now, self.created_at)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub scanned: usize,
    pub removed: Vec<PathBuf>,
    pub retained: usize,
    pub failures: usize,
}

/// Whole days elapsed between `created` and `now`
///
/// Floor of elapsed seconds over seconds-per-day. A creation time in the
/// future (clock skew) counts as age zero.
pub fn age_in_days(now: DateTime<Utc>, created: DateTime<Utc>) -> i64 {
    let elapsed = now.signed_duration_since(created).num_seconds();
    elapsed.max(0).div_euclid(SECONDS_PER_DAY)
}

pub fn is_expired(now: DateTime<Utc>, created: DateTime<Utc>, window_days: u32) -> bool {
    age_in_days(now, created) >= i64::from(window_days)
}

/// Creation stamp of a directory
///
/// Birth time where the filesystem records one, modification time otherwise.
/// The fallback moves forward whenever a file is added to or removed from
/// the batch, so on such filesystems a batch that keeps receiving files is
/// only purged once it has been quiet for the whole window.
fn creation_time(path: &Path) -> io::Result<DateTime<Utc>> {
    let meta = fs::metadata(path)?;
    let stamp: SystemTime = match meta.created() {
        Ok(created) => created,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "birth time unavailable, using modification time");
            meta.modified()?
        }
    };
    Ok(DateTime::<Utc>::from(stamp))
}

/// Unwrap one `read_dir` item, counting and logging a failed read
fn dir_entry(item: io::Result<DirEntry>, parent: &Path, failures: &mut usize) -> Option<DirEntry> {
    match item {
        Ok(entry) => Some(entry),
        Err(e) => {
            *failures += 1;
            warn!(path = %parent.display(), error = %e, "failed to read directory entry");
            None
        }
    }
}

/// List every batch directory under the media root
///
/// Category folders or entries that cannot be read are logged and counted in
/// `failures`; they do not stop the listing.
pub fn list_retention_units(media_root: &Path, failures: &mut usize) -> Vec<RetentionDirectory> {
    let mut units = Vec::new();

    let categories = match fs::read_dir(media_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %media_root.display(), "media root does not exist, nothing to purge");
            return units;
        }
        Err(e) => {
            *failures += 1;
            error!(path = %media_root.display(), error = %e, "failed to read media root");
            return units;
        }
    };

    for item in categories {
        let Some(category) = dir_entry(item, media_root, failures) else {
            continue;
        };
        let category_path = category.path();
        if !category_path.is_dir() {
            continue;
        }

        let batches = match fs::read_dir(&category_path) {
            Ok(entries) => entries,
            Err(e) => {
                *failures += 1;
                warn!(path = %category_path.display(), error = %e, "failed to read media category");
                continue;
            }
        };

        for item in batches {
            let Some(batch) = dir_entry(item, &category_path, failures) else {
                continue;
            };
            let path = batch.path();
            if !path.is_dir() {
                continue;
            }

            match creation_time(&path) {
                Ok(created_at) => units.push(RetentionDirectory { path, created_at }),
                Err(e) => {
                    *failures += 1;
                    warn!(path = %path.display(), error = %e, "failed to read creation time");
                }
            }
        }
    }

    units.sort_by(|a, b| a.path.cmp(&b.path));
    units
}

/// Delete every batch directory whose age meets or exceeds the window
///
/// Younger directories are left untouched, empty or not. A directory that
/// cannot be deleted is logged and skipped; the sweep carries on.
pub fn sweep_retention(media_root: &Path, window_days: u32, now: DateTime<Utc>) -> RetentionReport {
    sweep_with(media_root, window_days, now, |path: &Path| fs::remove_dir_all(path))
}

fn sweep_with<F>(media_root: &Path, window_days: u32, now: DateTime<Utc>, remove: F) -> RetentionReport
where
    F: Fn(&Path) -> io::Result<()>,
{
    let mut report = RetentionReport::default();
    let units = list_retention_units(media_root, &mut report.failures);

    for unit in units {
        report.scanned += 1;
        let age = unit.age_in_days(now);

        if age < i64::from(window_days) {
            report.retained += 1;
            continue;
        }

        match remove(&unit.path) {
            Ok(()) => {
                info!(path = %unit.path.display(), age_days = age, "removed expired submission directory");
                report.removed.push(unit.path);
            }
            Err(e) => {
                report.failures += 1;
                error!(path = %unit.path.display(), error = %e, "failed to remove submission directory");
            }
        }
    }

    info!(
        scanned = report.scanned,
        removed = report.removed.len(),
        retained = report.retained,
        failures = report.failures,
        "retention sweep finished"
    );

    report
}
