//! Event Store: persists detections, taxonomy cache, and the audio
//! projection; serves filtered/paginated queries and aggregates.
//!
//! `rusqlite` with `PRAGMA journal_mode=WAL`, a thin trait so the
//! processor and read API depend on behavior rather than a concrete
//! connection type, and explicit `prepare`/`query` statement handling
//! rather than an ORM.

mod queries;
mod schema;

use crate::model::{AudioEvent, Detection, DetectionFilters, SortOrder, TaxonomyEntry};
use anyhow::{anyhow, Result};
use rusqlite::Connection;
use std::sync::Mutex;

/// Outcome of an upsert, used to decide whether to emit `detection` or
/// `detection_updated` on the broadcaster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

/// Event Store operations. A trait so tests and the processor can swap
/// in a lighter-weight implementation if needed, the same way a
/// sealed-log store trait decouples callers from a concrete backing
/// store.
pub trait EventStore: Send + Sync {
    fn upsert(&self, detection: &Detection) -> Result<UpsertOutcome>;
    fn get_by_external_id(&self, id: &str) -> Result<Option<Detection>>;
    fn list(
        &self,
        filters: &DetectionFilters,
        sort: SortOrder,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Detection>>;
    fn count(&self, filters: &DetectionFilters) -> Result<u64>;
    fn patch(&self, external_id: &str, patch: serde_json::Value) -> Result<Detection>;
    fn delete_by_external_id(&self, id: &str) -> Result<bool>;
    fn species_aggregates(&self, filters: &DetectionFilters) -> Result<Vec<SpeciesAggregate>>;

    fn upsert_taxonomy(&self, entry: &TaxonomyEntry) -> Result<()>;
    fn get_taxonomy(&self, scientific_name: &str) -> Result<Option<TaxonomyEntry>>;

    fn append_audio_event(&self, event: &AudioEvent) -> Result<()>;
    fn recent_audio_events(&self, sensor_id: &str, since: &str) -> Result<Vec<AudioEvent>>;

    fn enforce_retention(&self, cutoff: &str) -> Result<u64>;
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SpeciesAggregate {
    pub display_name: String,
    pub count: u64,
    pub max_score: f64,
}

pub struct SqliteEventStore {
    conn: Mutex<Connection>,
}

impl SqliteEventStore {
    pub fn open(db_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        schema::ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl EventStore for SqliteEventStore {
    fn upsert(&self, detection: &Detection) -> Result<UpsertOutcome> {
        detection.check_invariants()?;
        let conn = self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        queries::upsert(&conn, detection)
    }

    fn get_by_external_id(&self, id: &str) -> Result<Option<Detection>> {
        let conn = self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        queries::get_by_external_id(&conn, id)
    }

    fn list(
        &self,
        filters: &DetectionFilters,
        sort: SortOrder,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Detection>> {
        let conn = self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        queries::list(&conn, filters, sort, limit, offset)
    }

    fn count(&self, filters: &DetectionFilters) -> Result<u64> {
        let conn = self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        queries::count(&conn, filters)
    }

    fn patch(&self, external_id: &str, patch: serde_json::Value) -> Result<Detection> {
        let conn = self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        queries::patch(&conn, external_id, patch)
    }

    fn delete_by_external_id(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        let affected = conn.execute(
            "DELETE FROM detections WHERE external_event_id = ?1",
            rusqlite::params![id],
        )?;
        Ok(affected > 0)
    }

    fn species_aggregates(&self, filters: &DetectionFilters) -> Result<Vec<SpeciesAggregate>> {
        let conn = self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        queries::species_aggregates(&conn, filters)
    }

    fn upsert_taxonomy(&self, entry: &TaxonomyEntry) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        queries::upsert_taxonomy(&conn, entry)
    }

    fn get_taxonomy(&self, scientific_name: &str) -> Result<Option<TaxonomyEntry>> {
        let conn = self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        queries::get_taxonomy(&conn, scientific_name)
    }

    fn append_audio_event(&self, event: &AudioEvent) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        queries::append_audio_event(&conn, event)
    }

    fn recent_audio_events(&self, sensor_id: &str, since: &str) -> Result<Vec<AudioEvent>> {
        let conn = self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        queries::recent_audio_events(&conn, sensor_id, since)
    }

    fn enforce_retention(&self, cutoff: &str) -> Result<u64> {
        let conn = self.conn.lock().map_err(|_| anyhow!("store lock poisoned"))?;
        let affected = conn.execute(
            "DELETE FROM detections WHERE detection_time < ?1",
            rusqlite::params![cutoff],
        )?;
        // Audio projection retention follows the detections table; see DESIGN.md.
        conn.execute("DELETE FROM audio_events WHERE observed_at < ?1", rusqlite::params![cutoff])?;
        Ok(affected as u64)
    }
}
