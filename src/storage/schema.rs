use anyhow::Result;
use rusqlite::Connection;

pub fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS detections (
          external_event_id TEXT PRIMARY KEY,
          camera TEXT NOT NULL,
          detection_time TEXT NOT NULL,
          display_name TEXT NOT NULL,
          category_name TEXT NOT NULL,
          score REAL NOT NULL,
          source TEXT NOT NULL,
          frigate_score REAL,
          sub_label TEXT,
          audio_detected INTEGER NOT NULL DEFAULT 0,
          audio_confirmed INTEGER NOT NULL DEFAULT 0,
          audio_species TEXT,
          audio_score REAL,
          video_classification_status TEXT NOT NULL DEFAULT 'none',
          video_classification_label TEXT,
          video_classification_score REAL,
          temperature REAL,
          weather_condition TEXT,
          wind_speed REAL,
          cloud_cover REAL,
          precipitation REAL,
          scientific_name TEXT,
          common_name TEXT,
          taxa_id TEXT,
          is_hidden INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_detections_time ON detections(detection_time);
        CREATE INDEX IF NOT EXISTS idx_detections_camera ON detections(camera);
        CREATE INDEX IF NOT EXISTS idx_detections_display_name ON detections(display_name);

        CREATE TABLE IF NOT EXISTS taxonomy_entries (
          scientific_name TEXT PRIMARY KEY,
          common_name TEXT NOT NULL,
          taxa_id TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audio_events (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          sensor_id TEXT NOT NULL,
          species TEXT NOT NULL,
          score REAL NOT NULL,
          observed_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audio_events_sensor_time ON audio_events(sensor_id, observed_at);
        "#,
    )?;
    Ok(())
}
