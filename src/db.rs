use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

use crate::error::LinkNotFound;
use crate::health::{CatalogEntry, LinkHealth, VendorLink};
use crate::vendor::Vendor;

// ============================================================================
// SQL MAPPINGS
// ============================================================================

impl ToSql for Vendor {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.code()))
    }
}

impl FromSql for Vendor {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let code = value.as_str()?;
        Vendor::from_code(code)
            .ok_or_else(|| FromSqlError::Other(format!("unknown vendor code: {code}").into()))
    }
}

impl ToSql for LinkHealth {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.code()))
    }
}

impl FromSql for LinkHealth {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let code = value.as_str()?;
        LinkHealth::from_code(code)
            .ok_or_else(|| FromSqlError::Other(format!("unknown link health: {code}").into()))
    }
}

// ============================================================================
// AUDIT EVENTS
// ============================================================================

/// Event for audit trail: every health transition, price change and
/// operator override leaves one row behind
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }

    /// Event about one vendor link
    pub fn for_link(
        event_type: &str,
        entry_id: i64,
        vendor: Vendor,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self::new(event_type, LINK_ENTITY, &link_entity_id(entry_id, vendor), data, actor)
    }
}

pub const LINK_ENTITY: &str = "vendor_link";

/// Entity id of a vendor link in the audit trail: `<gear_id>:<vendor code>`
pub fn link_entity_id(entry_id: i64, vendor: Vendor) -> String {
    format!("{}:{}", entry_id, vendor.code())
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS gear (
            id INTEGER PRIMARY KEY,
            name TEXT UNIQUE NOT NULL,
            category TEXT NOT NULL DEFAULT '',
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // One row per (gear, vendor); an empty url means the vendor is not tracked
    conn.execute(
        "CREATE TABLE IF NOT EXISTS vendor_links (
            gear_id INTEGER NOT NULL REFERENCES gear(id),
            vendor TEXT NOT NULL,
            url TEXT NOT NULL DEFAULT '',
            last_known_price TEXT NOT NULL DEFAULT '',
            health TEXT NOT NULL DEFAULT 'alive',
            PRIMARY KEY (gear_id, vendor)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// CATALOG READS
// ============================================================================

/// Every catalog entry with its vendor links, ordered by id
pub fn load_catalog(conn: &Connection) -> Result<Vec<CatalogEntry>> {
    let mut stmt = conn.prepare("SELECT id, name, category FROM gear ORDER BY id")?;
    let mut entries = stmt
        .query_map([], |row| {
            Ok(CatalogEntry::new(
                row.get(0)?,
                &row.get::<_, String>(1)?,
                &row.get::<_, String>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let index: HashMap<i64, usize> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| (e.id, i))
        .collect();

    let mut stmt = conn.prepare(
        "SELECT gear_id, vendor, url, last_known_price, health
         FROM vendor_links
         ORDER BY gear_id",
    )?;
    let links = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, read_link(row, 1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    for (gear_id, link) in links {
        if let Some(&i) = index.get(&gear_id) {
            entries[i].links.push(link);
        }
    }

    for entry in &mut entries {
        entry.links.sort_by_key(|l| l.vendor);
    }

    Ok(entries)
}

/// One catalog entry by id
pub fn get_entry(conn: &Connection, entry_id: i64) -> Result<Option<CatalogEntry>> {
    let entry = conn
        .query_row(
            "SELECT id, name, category FROM gear WHERE id = ?1",
            [entry_id],
            |row| {
                Ok(CatalogEntry::new(
                    row.get(0)?,
                    &row.get::<_, String>(1)?,
                    &row.get::<_, String>(2)?,
                ))
            },
        )
        .optional()?;

    let Some(mut entry) = entry else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT vendor, url, last_known_price, health
         FROM vendor_links
         WHERE gear_id = ?1",
    )?;
    entry.links = stmt
        .query_map([entry_id], |row| read_link(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;
    entry.links.sort_by_key(|l| l.vendor);

    Ok(Some(entry))
}

fn read_link(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<VendorLink> {
    Ok(VendorLink {
        vendor: row.get(offset)?,
        url: row.get(offset + 1)?,
        last_known_price: row.get(offset + 2)?,
        health: row.get(offset + 3)?,
    })
}

fn get_link(conn: &Connection, entry_id: i64, vendor: Vendor) -> Result<Option<VendorLink>> {
    let link = conn
        .query_row(
            "SELECT vendor, url, last_known_price, health
             FROM vendor_links
             WHERE gear_id = ?1 AND vendor = ?2",
            params![entry_id, vendor],
            |row| read_link(row, 0),
        )
        .optional()?;

    Ok(link)
}

// ============================================================================
// CATALOG WRITES
// ============================================================================

/// A sweep's change to one link: the row as it was read and the row the
/// fetch outcome produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkUpdate {
    pub before: VendorLink,
    pub after: VendorLink,
}

/// Commit a sweep's link changes for one entry as a single transaction
///
/// A row is only written while it still matches `before`. Rows changed by an
/// operator override or an import after the sweep read them are left alone.
/// Returns the vendors whose rows were written.
pub fn save_link_updates(
    conn: &Connection,
    entry_id: i64,
    updates: &[LinkUpdate],
) -> Result<Vec<Vendor>> {
    let tx = conn.unchecked_transaction()?;

    let exists: i64 = tx.query_row(
        "SELECT COUNT(*) FROM gear WHERE id = ?1",
        [entry_id],
        |row| row.get(0),
    )?;
    if exists == 0 {
        bail!("Catalog entry {} not found", entry_id);
    }

    let mut written = Vec::new();
    for update in updates {
        let (before, after) = (&update.before, &update.after);
        let rows = tx.execute(
            "UPDATE vendor_links
             SET url = ?3, last_known_price = ?4, health = ?5
             WHERE gear_id = ?1 AND vendor = ?2
               AND url = ?6 AND last_known_price = ?7 AND health = ?8",
            params![
                entry_id,
                after.vendor,
                after.url,
                after.last_known_price,
                after.health,
                before.url,
                before.last_known_price,
                before.health,
            ],
        )?;

        if rows == 0 {
            debug!(entry_id, vendor = after.vendor.code(), "link changed since it was read, update skipped");
        } else {
            written.push(after.vendor);
        }
    }

    tx.commit()
        .with_context(|| format!("Failed to commit catalog entry {}", entry_id))?;

    Ok(written)
}

fn write_link(conn: &Connection, entry_id: i64, link: &VendorLink) -> Result<()> {
    conn.execute(
        "INSERT INTO vendor_links (gear_id, vendor, url, last_known_price, health)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(gear_id, vendor) DO UPDATE SET
            url = excluded.url,
            last_known_price = excluded.last_known_price,
            health = excluded.health",
        params![entry_id, link.vendor, link.url, link.last_known_price, link.health],
    )?;

    Ok(())
}

// ============================================================================
// OPERATOR OVERRIDE
// ============================================================================

/// Operator marks a vendor link out of stock
///
/// Synchronous admin action; the sweep will not undo it.
pub fn mark_out_of_stock(conn: &Connection, entry_id: i64, vendor: Vendor) -> Result<VendorLink> {
    apply_override(conn, entry_id, vendor, "marked_out_of_stock", VendorLink::mark_out_of_stock)
}

/// Operator lifts the out-of-stock flag, returning the link to Alive
pub fn clear_out_of_stock(conn: &Connection, entry_id: i64, vendor: Vendor) -> Result<VendorLink> {
    apply_override(conn, entry_id, vendor, "cleared_out_of_stock", VendorLink::clear_out_of_stock)
}

fn apply_override(
    conn: &Connection,
    entry_id: i64,
    vendor: Vendor,
    event_type: &str,
    action: fn(&mut VendorLink) -> bool,
) -> Result<VendorLink> {
    let tx = conn.unchecked_transaction()?;

    let Some(mut link) = get_link(&tx, entry_id, vendor)? else {
        return Err(LinkNotFound { entry_id, vendor }.into());
    };

    let previous = link.health;
    if action(&mut link) {
        write_link(&tx, entry_id, &link)?;

        let event = Event::for_link(
            event_type,
            entry_id,
            vendor,
            serde_json::json!({
                "previous_health": previous.code(),
                "health": link.health.code(),
                "price": link.last_known_price,
            }),
            "operator",
        );
        insert_event(&tx, &event)?;
    }

    tx.commit()?;

    Ok(link)
}

// ============================================================================
// EVENT LOG
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, newest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?
                    .with_timezone(&Utc),
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

pub fn count_events(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;

    Ok(count)
}

// ============================================================================
// CATALOG IMPORT
// ============================================================================

/// One row of the admin catalog export
#[derive(Debug, Deserialize)]
struct CatalogRow {
    id: i64,
    name: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    moosejaw_url: String,
    #[serde(default)]
    moosejaw_price: String,
    #[serde(default)]
    rei_url: String,
    #[serde(default)]
    rei_price: String,
    #[serde(default)]
    backcountry_url: String,
    #[serde(default)]
    backcountry_price: String,
}

impl CatalogRow {
    fn into_entry(self) -> CatalogEntry {
        let mut entry = CatalogEntry::new(self.id, self.name.trim(), self.category.trim());

        let columns = [
            (Vendor::Moosejaw, self.moosejaw_url, self.moosejaw_price),
            (Vendor::Rei, self.rei_url, self.rei_price),
            (Vendor::Backcountry, self.backcountry_url, self.backcountry_price),
        ];

        for (vendor, url, price) in columns {
            if url.trim().is_empty() && price.trim().is_empty() {
                continue;
            }
            entry = entry.with_link(VendorLink::new(vendor, &url).with_price(price.trim()));
        }

        entry
    }
}

pub fn load_csv(csv_path: &Path) -> Result<Vec<CatalogEntry>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open CSV file: {}", csv_path.display()))?;

    let mut entries = Vec::new();

    for (line, result) in rdr.deserialize().enumerate() {
        let row: CatalogRow = result
            .with_context(|| format!("Failed to parse catalog row on line {}", line + 2))?;
        entries.push(row.into_entry());
    }

    Ok(entries)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub entries: usize,
    pub links: usize,
}

/// Upsert catalog entries
///
/// Re-importing is safe: existing links keep their health and last known
/// price, only the url is refreshed.
pub fn import_entries(conn: &Connection, entries: &[CatalogEntry]) -> Result<ImportSummary> {
    let tx = conn.unchecked_transaction()?;
    let mut summary = ImportSummary::default();

    for entry in entries {
        tx.execute(
            "INSERT INTO gear (id, name, category) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, category = excluded.category",
            params![entry.id, entry.name, entry.category],
        )
        .with_context(|| format!("Failed to import catalog entry {} ({})", entry.id, entry.name))?;
        summary.entries += 1;

        for link in &entry.links {
            tx.execute(
                "INSERT INTO vendor_links (gear_id, vendor, url, last_known_price, health)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(gear_id, vendor) DO UPDATE SET url = excluded.url",
                params![entry.id, link.vendor, link.url, link.last_known_price, link.health],
            )?;
            summary.links += 1;
        }
    }

    tx.commit()?;

    Ok(summary)
}

// ============================================================================
// STORE HANDLE
// ============================================================================

/// CatalogStore - what the sweep needs from persistence
pub trait CatalogStore {
    /// Read all entries with their vendor links
    fn load_catalog(&self) -> Result<Vec<CatalogEntry>>;

    /// Commit one entry's link changes; failure affects only this entry.
    /// Returns the vendors actually written.
    fn save_links(&mut self, entry_id: i64, updates: &[LinkUpdate]) -> Result<Vec<Vendor>>;

    fn record_event(&mut self, event: &Event) -> Result<()>;
}

/// SQLite-backed store; the connection is owned here and handed in by the
/// process entry point
pub struct SqliteCatalog {
    conn: Connection,
}

impl SqliteCatalog {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn)?;
        Ok(SqliteCatalog { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

impl CatalogStore for SqliteCatalog {
    fn load_catalog(&self) -> Result<Vec<CatalogEntry>> {
        load_catalog(&self.conn)
    }

    fn save_links(&mut self, entry_id: i64, updates: &[LinkUpdate]) -> Result<Vec<Vendor>> {
        save_link_updates(&self.conn, entry_id, updates)
    }

    fn record_event(&mut self, event: &Event) -> Result<()> {
        insert_event(&self.conn, event)
    }
}
