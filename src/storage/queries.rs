use super::{SpeciesAggregate, UpsertOutcome};
use crate::model::{
    AudioEvent, Detection, DetectionFilters, DetectionSource, SortOrder, TaxonomyEntry,
    VideoClassificationStatus,
};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};

fn row_to_detection(row: &Row) -> rusqlite::Result<Detection> {
    let source: String = row.get("source")?;
    let video_status: String = row.get("video_classification_status")?;
    Ok(Detection {
        external_event_id: row.get("external_event_id")?,
        camera: row.get("camera")?,
        detection_time: row.get("detection_time")?,
        display_name: row.get("display_name")?,
        category_name: row.get("category_name")?,
        score: row.get("score")?,
        source: match source.as_str() {
            "frigate" => DetectionSource::Frigate,
            "video" => DetectionSource::Video,
            "manual" => DetectionSource::Manual,
            _ => DetectionSource::Snapshot,
        },
        frigate_score: row.get("frigate_score")?,
        sub_label: row.get("sub_label")?,
        audio_detected: row.get::<_, i64>("audio_detected")? != 0,
        audio_confirmed: row.get::<_, i64>("audio_confirmed")? != 0,
        audio_species: row.get("audio_species")?,
        audio_score: row.get("audio_score")?,
        video_classification_status: VideoClassificationStatus::from_db_str(&video_status),
        video_classification_label: row.get("video_classification_label")?,
        video_classification_score: row.get("video_classification_score")?,
        temperature: row.get("temperature")?,
        weather_condition: row.get("weather_condition")?,
        wind_speed: row.get("wind_speed")?,
        cloud_cover: row.get("cloud_cover")?,
        precipitation: row.get("precipitation")?,
        scientific_name: row.get("scientific_name")?,
        common_name: row.get("common_name")?,
        taxa_id: row.get("taxa_id")?,
        is_hidden: row.get::<_, i64>("is_hidden")? != 0,
    })
}

const SELECT_COLUMNS: &str = "external_event_id, camera, detection_time, display_name, category_name, \
     score, source, frigate_score, sub_label, audio_detected, audio_confirmed, audio_species, \
     audio_score, video_classification_status, video_classification_label, video_classification_score, \
     temperature, weather_condition, wind_speed, cloud_cover, precipitation, scientific_name, \
     common_name, taxa_id, is_hidden";

pub fn get_by_external_id(conn: &Connection, id: &str) -> Result<Option<Detection>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLUMNS} FROM detections WHERE external_event_id = ?1"
    ))?;
    Ok(stmt.query_row(params![id], row_to_detection).optional()?)
}

/// Upsert keyed on `external_event_id`. The created-vs-updated signal
/// comes from whether a row existed beforehand and whether its content
/// actually changed, not from `Connection::changes()`, which on a
/// pooled/shared connection can reflect a different statement's row
/// count.
pub fn upsert(conn: &Connection, detection: &Detection) -> Result<UpsertOutcome> {
    let existing = get_by_external_id(conn, &detection.external_event_id)?;
    let outcome = match &existing {
        None => UpsertOutcome::Created,
        Some(prev) if detections_equal(prev, detection) => UpsertOutcome::Unchanged,
        Some(_) => UpsertOutcome::Updated,
    };

    if outcome == UpsertOutcome::Unchanged {
        return Ok(outcome);
    }

    conn.execute(
        r#"
        INSERT INTO detections (
            external_event_id, camera, detection_time, display_name, category_name, score, source,
            frigate_score, sub_label, audio_detected, audio_confirmed, audio_species, audio_score,
            video_classification_status, video_classification_label, video_classification_score,
            temperature, weather_condition, wind_speed, cloud_cover, precipitation,
            scientific_name, common_name, taxa_id, is_hidden
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19,
            ?20, ?21, ?22, ?23, ?24, ?25
        )
        ON CONFLICT(external_event_id) DO UPDATE SET
            camera = excluded.camera,
            detection_time = excluded.detection_time,
            display_name = excluded.display_name,
            category_name = excluded.category_name,
            score = excluded.score,
            source = excluded.source,
            frigate_score = excluded.frigate_score,
            sub_label = excluded.sub_label,
            audio_detected = excluded.audio_detected,
            audio_confirmed = excluded.audio_confirmed,
            audio_species = excluded.audio_species,
            audio_score = excluded.audio_score,
            video_classification_status = excluded.video_classification_status,
            video_classification_label = excluded.video_classification_label,
            video_classification_score = excluded.video_classification_score,
            temperature = excluded.temperature,
            weather_condition = excluded.weather_condition,
            wind_speed = excluded.wind_speed,
            cloud_cover = excluded.cloud_cover,
            precipitation = excluded.precipitation,
            scientific_name = excluded.scientific_name,
            common_name = excluded.common_name,
            taxa_id = excluded.taxa_id,
            is_hidden = excluded.is_hidden
        "#,
        params![
            detection.external_event_id,
            detection.camera,
            detection.detection_time,
            detection.display_name,
            detection.category_name,
            detection.score,
            detection.source.as_str(),
            detection.frigate_score,
            detection.sub_label,
            detection.audio_detected as i64,
            detection.audio_confirmed as i64,
            detection.audio_species,
            detection.audio_score,
            detection.video_classification_status.as_str(),
            detection.video_classification_label,
            detection.video_classification_score,
            detection.temperature,
            detection.weather_condition,
            detection.wind_speed,
            detection.cloud_cover,
            detection.precipitation,
            detection.scientific_name,
            detection.common_name,
            detection.taxa_id,
            detection.is_hidden as i64,
        ],
    )?;

    Ok(outcome)
}

fn detections_equal(a: &Detection, b: &Detection) -> bool {
    a.camera == b.camera
        && a.detection_time == b.detection_time
        && a.display_name == b.display_name
        && a.category_name == b.category_name
        && a.score == b.score
        && a.source == b.source
        && a.frigate_score == b.frigate_score
        && a.sub_label == b.sub_label
        && a.audio_detected == b.audio_detected
        && a.audio_confirmed == b.audio_confirmed
        && a.audio_species == b.audio_species
        && a.audio_score == b.audio_score
        && a.video_classification_status == b.video_classification_status
        && a.video_classification_label == b.video_classification_label
        && a.video_classification_score == b.video_classification_score
        && a.is_hidden == b.is_hidden
}

fn push_filters(filters: &DetectionFilters, clauses: &mut Vec<String>, args: &mut Vec<Box<dyn rusqlite::ToSql>>) {
    if !filters.include_hidden {
        clauses.push("is_hidden = 0".to_string());
    }
    if let Some(start) = &filters.start_date {
        clauses.push(format!("detection_time >= ?{}", args.len() + 1));
        args.push(Box::new(start.clone()));
    }
    if let Some(end) = &filters.end_date {
        clauses.push(format!("detection_time <= ?{}", args.len() + 1));
        args.push(Box::new(end.clone()));
    }
    if let Some(camera) = &filters.camera {
        clauses.push(format!("camera = ?{}", args.len() + 1));
        args.push(Box::new(camera.clone()));
    }
    if let Some(species) = &filters.species {
        clauses.push(format!(
            "(display_name = ?{a} OR scientific_name = ?{a})",
            a = args.len() + 1
        ));
        args.push(Box::new(species.clone()));
    }
    if let Some(min_score) = filters.min_score {
        clauses.push(format!("score >= ?{}", args.len() + 1));
        args.push(Box::new(min_score));
    }
    if let Some(audio_confirmed) = filters.audio_confirmed {
        clauses.push(format!("audio_confirmed = ?{}", args.len() + 1));
        args.push(Box::new(audio_confirmed as i64));
    }
}

pub fn list(
    conn: &Connection,
    filters: &DetectionFilters,
    sort: SortOrder,
    limit: u32,
    offset: u32,
) -> Result<Vec<Detection>> {
    let mut clauses = Vec::new();
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    push_filters(filters, &mut clauses, &mut args);

    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let order_clause = match sort {
        SortOrder::Newest => "ORDER BY detection_time DESC",
        SortOrder::Oldest => "ORDER BY detection_time ASC",
        SortOrder::Confidence => "ORDER BY score DESC",
    };

    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM detections {where_clause} {order_clause} LIMIT ?{l} OFFSET ?{o}",
        l = args.len() + 1,
        o = args.len() + 2,
    );
    args.push(Box::new(limit));
    args.push(Box::new(offset));

    let mut stmt = conn.prepare(&sql)?;
    let params_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
    let rows = stmt.query_map(params_refs.as_slice(), row_to_detection)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn count(conn: &Connection, filters: &DetectionFilters) -> Result<u64> {
    let mut clauses = Vec::new();
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    push_filters(filters, &mut clauses, &mut args);
    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!("SELECT COUNT(*) FROM detections {where_clause}");
    let mut stmt = conn.prepare(&sql)?;
    let params_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
    let count: i64 = stmt.query_row(params_refs.as_slice(), |row| row.get(0))?;
    Ok(count as u64)
}

/// Partial mutation (hidden flag, manual relabel). Only a fixed, known
/// set of fields is patchable through the public API.
pub fn patch(conn: &Connection, external_id: &str, patch: serde_json::Value) -> Result<Detection> {
    let mut detection = get_by_external_id(conn, external_id)?
        .ok_or_else(|| anyhow::anyhow!("detection not found: {external_id}"))?;

    if let Some(hidden) = patch.get("is_hidden").and_then(|v| v.as_bool()) {
        detection.is_hidden = hidden;
    }
    if let Some(name) = patch.get("display_name").and_then(|v| v.as_str()) {
        detection.display_name = name.to_string();
        // Manual relabel takes priority over any automated source, per
        // the open-question decision recorded in DESIGN.md.
        detection.source = DetectionSource::Manual;
        detection.score = 1.0;
    }

    upsert(conn, &detection)?;
    Ok(detection)
}

pub fn species_aggregates(conn: &Connection, filters: &DetectionFilters) -> Result<Vec<SpeciesAggregate>> {
    let mut clauses = Vec::new();
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    push_filters(filters, &mut clauses, &mut args);
    let where_clause = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT display_name, COUNT(*) as cnt, MAX(score) as max_score FROM detections {where_clause} \
         GROUP BY display_name ORDER BY cnt DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let params_refs: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
    let rows = stmt.query_map(params_refs.as_slice(), |row| {
        Ok(SpeciesAggregate {
            display_name: row.get(0)?,
            count: row.get::<_, i64>(1)? as u64,
            max_score: row.get(2)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

pub fn upsert_taxonomy(conn: &Connection, entry: &TaxonomyEntry) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO taxonomy_entries (scientific_name, common_name, taxa_id, updated_at)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT(scientific_name) DO UPDATE SET
            common_name = excluded.common_name,
            taxa_id = excluded.taxa_id,
            updated_at = excluded.updated_at
        "#,
        params![entry.scientific_name, entry.common_name, entry.taxa_id, entry.updated_at],
    )?;
    Ok(())
}

pub fn get_taxonomy(conn: &Connection, scientific_name: &str) -> Result<Option<TaxonomyEntry>> {
    let mut stmt = conn.prepare(
        "SELECT scientific_name, common_name, taxa_id, updated_at FROM taxonomy_entries WHERE scientific_name = ?1",
    )?;
    Ok(stmt
        .query_row(params![scientific_name], |row| {
            Ok(TaxonomyEntry {
                scientific_name: row.get(0)?,
                common_name: row.get(1)?,
                taxa_id: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })
        .optional()?)
}

pub fn append_audio_event(conn: &Connection, event: &AudioEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO audio_events (sensor_id, species, score, observed_at) VALUES (?1, ?2, ?3, ?4)",
        params![event.sensor_id, event.species, event.score, event.observed_at],
    )?;
    Ok(())
}

pub fn recent_audio_events(conn: &Connection, sensor_id: &str, since: &str) -> Result<Vec<AudioEvent>> {
    let mut stmt = conn.prepare(
        "SELECT sensor_id, species, score, observed_at FROM audio_events \
         WHERE sensor_id = ?1 AND observed_at >= ?2 ORDER BY observed_at ASC",
    )?;
    let rows = stmt.query_map(params![sensor_id, since], |row| {
        Ok(AudioEvent {
            sensor_id: row.get(0)?,
            species: row.get(1)?,
            score: row.get(2)?,
            observed_at: row.get(3)?,
        })
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DetectionSource;

    fn sample(id: &str) -> Detection {
        Detection {
            external_event_id: id.to_string(),
            camera: "front_yard".to_string(),
            detection_time: "2026-07-31T12:00:00.000Z".to_string(),
            display_name: "House Sparrow".to_string(),
            category_name: "bird".to_string(),
            score: 0.82,
            source: DetectionSource::Snapshot,
            frigate_score: Some(0.9),
            sub_label: None,
            audio_detected: false,
            audio_confirmed: false,
            audio_species: None,
            audio_score: None,
            video_classification_status: VideoClassificationStatus::None,
            video_classification_label: None,
            video_classification_score: None,
            temperature: None,
            weather_condition: None,
            wind_speed: None,
            cloud_cover: None,
            precipitation: None,
            scientific_name: None,
            common_name: None,
            taxa_id: None,
            is_hidden: false,
        }
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let conn = Connection::open_in_memory().unwrap();
        super::super::schema::ensure_schema(&conn).unwrap();
        let detection = sample("E1");
        assert_eq!(upsert(&conn, &detection).unwrap(), UpsertOutcome::Created);
        let fetched = get_by_external_id(&conn, "E1").unwrap().unwrap();
        assert_eq!(fetched.display_name, "House Sparrow");
    }

    #[test]
    fn replaying_identical_update_is_unchanged() {
        let conn = Connection::open_in_memory().unwrap();
        super::super::schema::ensure_schema(&conn).unwrap();
        let detection = sample("E1");
        assert_eq!(upsert(&conn, &detection).unwrap(), UpsertOutcome::Created);
        assert_eq!(upsert(&conn, &detection).unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(upsert(&conn, &detection).unwrap(), UpsertOutcome::Unchanged);

        let count = count(&conn, &DetectionFilters::default()).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn content_change_reports_updated() {
        let conn = Connection::open_in_memory().unwrap();
        super::super::schema::ensure_schema(&conn).unwrap();
        let mut detection = sample("E1");
        upsert(&conn, &detection).unwrap();
        detection.score = 0.91;
        assert_eq!(upsert(&conn, &detection).unwrap(), UpsertOutcome::Updated);
    }

    #[test]
    fn patch_then_get_reflects_change() {
        let conn = Connection::open_in_memory().unwrap();
        super::super::schema::ensure_schema(&conn).unwrap();
        upsert(&conn, &sample("E1")).unwrap();
        patch(&conn, "E1", serde_json::json!({ "is_hidden": true })).unwrap();
        let fetched = get_by_external_id(&conn, "E1").unwrap().unwrap();
        assert!(fetched.is_hidden);
    }

    #[test]
    fn limit_zero_returns_no_rows_but_does_not_error_at_storage_layer() {
        // Input validation for limit=0 happens at the API layer (§8);
        // the storage layer just respects whatever limit it is given.
        let conn = Connection::open_in_memory().unwrap();
        super::super::schema::ensure_schema(&conn).unwrap();
        upsert(&conn, &sample("E1")).unwrap();
        let rows = list(&conn, &DetectionFilters::default(), SortOrder::Newest, 0, 0).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn hidden_detections_excluded_unless_requested() {
        let conn = Connection::open_in_memory().unwrap();
        super::super::schema::ensure_schema(&conn).unwrap();
        let mut hidden = sample("E1");
        hidden.is_hidden = true;
        upsert(&conn, &hidden).unwrap();

        let visible = list(&conn, &DetectionFilters::default(), SortOrder::Newest, 50, 0).unwrap();
        assert!(visible.is_empty());

        let filters = DetectionFilters {
            include_hidden: true,
            ..Default::default()
        };
        let all = list(&conn, &filters, SortOrder::Newest, 50, 0).unwrap();
        assert_eq!(all.len(), 1);
    }
}
