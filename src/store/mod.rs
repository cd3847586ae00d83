//! Local Store (C8): a single-file transactional store for sessions, events,
//! and sync bookkeeping. Mutated only through the Event Buffer (C7) and the
//! Cloud Replicator's (C9) sync-mark/prune interface.

pub mod rows;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, SurveillanceError};
use rows::{
    DivisionEventRow, DivisionState, NewSession, NewVideo, SessionCompletion, StoredDivisionEvent,
    StoredTableEvent, TableEventRow, TableState,
};

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Opens (creating if necessary) the store file at `<db_dir>/surveillance.db`,
    /// backing up any pre-existing file before running the idempotent schema
    /// migration.
    pub fn open(db_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(db_dir)?;
        let db_path = db_dir.join("surveillance.db");

        if db_path.exists() {
            let backup_path = db_dir.join(format!(
                "surveillance.db.bak.{}",
                Utc::now().format("%Y%m%d%H%M%S")
            ));
            std::fs::copy(&db_path, &backup_path)?;
        }

        let conn = Connection::open(&db_path)
            .map_err(|e| SurveillanceError::StoreFatal(format!("cannot open {}: {e}", db_path.display())))?;
        let mut store = Store { conn };
        store.migrate()?;
        Ok(store)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SurveillanceError::StoreFatal(format!("cannot open in-memory store: {e}")))?;
        let mut store = Store { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;

        tx.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS locations (
                location_id TEXT PRIMARY KEY,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS videos (
                video_id         INTEGER PRIMARY KEY AUTOINCREMENT,
                camera_id        TEXT NOT NULL,
                video_filename   TEXT NOT NULL,
                video_date       TEXT NOT NULL,
                start_time       TEXT NOT NULL,
                end_time         TEXT NOT NULL,
                duration_seconds REAL NOT NULL,
                file_size_bytes  INTEGER NOT NULL,
                fps              REAL NOT NULL,
                resolution       TEXT NOT NULL,
                is_processed     INTEGER NOT NULL DEFAULT 0,
                storage_location TEXT NOT NULL,
                created_at       TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                session_id                TEXT PRIMARY KEY,
                camera_id                 TEXT NOT NULL,
                video_filename             TEXT NOT NULL,
                video_id                   INTEGER,
                location_id                TEXT NOT NULL,
                config_file_path           TEXT NOT NULL,
                roi_version                TEXT,
                start_time                 TEXT NOT NULL,
                end_time                   TEXT,
                total_frames               INTEGER,
                fps                        REAL,
                resolution                 TEXT,
                processing_status          TEXT NOT NULL DEFAULT 'running',
                processing_time_seconds    REAL,
                error_message              TEXT,
                created_at                 TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_camera_file
                ON sessions(camera_id, video_filename);

            CREATE TABLE IF NOT EXISTS division_states (
                division_state_id  INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id         TEXT NOT NULL,
                camera_id          TEXT NOT NULL,
                location_id        TEXT NOT NULL,
                frame_number       INTEGER NOT NULL,
                timestamp_video    REAL NOT NULL,
                timestamp_recorded TEXT NOT NULL,
                state              TEXT NOT NULL,
                walking_area_waiters INTEGER NOT NULL,
                service_area_waiters INTEGER NOT NULL,
                total_staff        INTEGER NOT NULL,
                screenshot_path    TEXT,
                synced_to_cloud    INTEGER NOT NULL DEFAULT 0,
                created_at         TEXT NOT NULL,
                FOREIGN KEY(session_id) REFERENCES sessions(session_id)
            );
            CREATE INDEX IF NOT EXISTS idx_division_synced ON division_states(synced_to_cloud);
            CREATE INDEX IF NOT EXISTS idx_division_session_frame ON division_states(session_id, frame_number);

            CREATE TABLE IF NOT EXISTS table_states (
                table_state_id      INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id          TEXT NOT NULL,
                camera_id           TEXT NOT NULL,
                location_id         TEXT NOT NULL,
                frame_number        INTEGER NOT NULL,
                timestamp_video     REAL NOT NULL,
                timestamp_recorded  TEXT NOT NULL,
                table_id            TEXT NOT NULL,
                state               TEXT NOT NULL,
                customers_count     INTEGER NOT NULL,
                waiters_count       INTEGER NOT NULL,
                screenshot_path     TEXT,
                synced_to_cloud     INTEGER NOT NULL DEFAULT 0,
                created_at          TEXT NOT NULL,
                FOREIGN KEY(session_id) REFERENCES sessions(session_id)
            );
            CREATE INDEX IF NOT EXISTS idx_table_synced ON table_states(synced_to_cloud);
            CREATE INDEX IF NOT EXISTS idx_table_session_frame ON table_states(session_id, frame_number);

            CREATE TABLE IF NOT EXISTS sync_status (
                sync_status_id  INTEGER PRIMARY KEY AUTOINCREMENT,
                sync_type       TEXT NOT NULL,
                records_synced  INTEGER NOT NULL,
                status          TEXT NOT NULL,
                error_message   TEXT,
                created_at      TEXT NOT NULL
            );
            ",
        )?;

        // Forward-compatible migration: a pre-existing division_states/table_states
        // table from an older schema may be missing location_id/synced_to_cloud.
        // Add them with defaults and backfill location_id from the single
        // pre-existing location row (unordered first row, matching upstream).
        for table in ["division_states", "table_states"] {
            let has_location_id = column_exists(&tx, table, "location_id")?;
            if !has_location_id {
                tx.execute(&format!("ALTER TABLE {table} ADD COLUMN location_id TEXT"), [])?;
                if let Some(loc) = first_location_id(&tx)? {
                    tx.execute(&format!("UPDATE {table} SET location_id = ?1 WHERE location_id IS NULL"), params![loc])?;
                }
            }
            if !column_exists(&tx, table, "synced_to_cloud")? {
                tx.execute(
                    &format!("ALTER TABLE {table} ADD COLUMN synced_to_cloud INTEGER NOT NULL DEFAULT 0"),
                    [],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    // ---- locations -------------------------------------------------------

    pub fn ensure_location(&self, location_id: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO locations (location_id, created_at) VALUES (?1, ?2)",
            params![location_id, Utc::now()],
        )?;
        Ok(())
    }

    /// The Open Question from spec §9: when multiple location rows pre-exist,
    /// this reads the first one with no explicit ordering, matching the
    /// behavior of the system being reimplemented.
    pub fn first_location_id(&self) -> Result<Option<String>> {
        first_location_id(&self.conn)
    }

    // ---- sessions ----------------------------------------------------------

    /// Inserts a new session row. Returns `Err(SurveillanceError::Duplicate)`
    /// (I1) without mutating anything else if `(camera_id, video_filename)`
    /// already has a session.
    pub fn insert_session(&self, session: &NewSession) -> Result<()> {
        let result = self.conn.execute(
            "INSERT INTO sessions
                (session_id, camera_id, video_filename, video_id, location_id,
                 config_file_path, roi_version, start_time, processing_status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'running', ?9)",
            params![
                session.session_id,
                session.camera_id,
                session.video_filename,
                session.video_id,
                session.location_id,
                session.config_file_path,
                session.roi_version,
                session.start_time,
                Utc::now(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(SurveillanceError::Duplicate {
                    camera_id: session.camera_id.clone(),
                    filename: session.video_filename.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// O(log n) duplicate check via the unique index (I1), without inserting.
    pub fn session_exists(&self, camera_id: &str, video_filename: &str) -> Result<bool> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sessions WHERE camera_id = ?1 AND video_filename = ?2",
                params![camera_id, video_filename],
                |row| row.get(0),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn complete_session(&self, completion: &SessionCompletion) -> Result<()> {
        self.conn.execute(
            "UPDATE sessions
             SET end_time = ?1, total_frames = ?2, fps = ?3, resolution = ?4,
                 processing_status = ?5, processing_time_seconds = ?6, error_message = ?7
             WHERE session_id = ?8",
            params![
                completion.end_time,
                completion.total_frames,
                completion.fps,
                completion.resolution,
                completion.processing_status,
                completion.processing_time_seconds,
                completion.error_message,
                completion.session_id,
            ],
        )?;
        Ok(())
    }

    // ---- videos --------------------------------------------------------

    pub fn insert_video(&self, video: &NewVideo) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO videos
                (camera_id, video_filename, video_date, start_time, end_time,
                 duration_seconds, file_size_bytes, fps, resolution, is_processed,
                 storage_location, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11)",
            params![
                video.camera_id,
                video.video_filename,
                video.video_date,
                video.start_time,
                video.end_time,
                video.duration_seconds,
                video.file_size_bytes,
                video.fps,
                video.resolution,
                video.storage_location,
                Utc::now(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    // ---- event batch inserts (called by the Event Buffer, C7) -----------

    pub fn insert_division_batch(&mut self, rows: &[DivisionEventRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO division_states
                    (session_id, camera_id, location_id, frame_number, timestamp_video,
                     timestamp_recorded, state, walking_area_waiters, service_area_waiters,
                     total_staff, screenshot_path, synced_to_cloud, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12)",
            )?;
            let now = Utc::now();
            for row in rows {
                stmt.execute(params![
                    row.session_id,
                    row.camera_id,
                    row.location_id,
                    row.frame_number,
                    row.timestamp_video,
                    row.timestamp_recorded,
                    row.state.as_str(),
                    row.walking_area_waiters,
                    row.service_area_waiters,
                    row.total_staff(),
                    row.screenshot_path,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn insert_table_batch(&mut self, rows: &[TableEventRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO table_states
                    (session_id, camera_id, location_id, frame_number, timestamp_video,
                     timestamp_recorded, table_id, state, customers_count, waiters_count,
                     screenshot_path, synced_to_cloud, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12)",
            )?;
            let now = Utc::now();
            for row in rows {
                stmt.execute(params![
                    row.session_id,
                    row.camera_id,
                    row.location_id,
                    row.frame_number,
                    row.timestamp_video,
                    row.timestamp_recorded,
                    row.table_id,
                    row.state.as_str(),
                    row.customers_count,
                    row.waiters_count,
                    row.screenshot_path,
                    now,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ---- cursor / sync interface (C9) ------------------------------------

    pub fn scan_unsynced_division(
        &self,
        limit: usize,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredDivisionEvent>> {
        let sql = "SELECT division_state_id, session_id, camera_id, location_id, frame_number,
                          timestamp_video, timestamp_recorded, state, walking_area_waiters,
                          service_area_waiters, screenshot_path, created_at
                   FROM division_states
                   WHERE synced_to_cloud = 0 AND created_at >= ?2
                   ORDER BY created_at ASC LIMIT ?1";
        let mut stmt = self.conn.prepare(sql)?;
        let cutoff = created_after.unwrap_or_else(|| DateTime::<Utc>::MIN_UTC);
        let rows = stmt.query_map(params![limit as i64, cutoff], |r| {
            let state_str: String = r.get(7)?;
            Ok(StoredDivisionEvent {
                id: r.get(0)?,
                row: DivisionEventRow {
                    session_id: r.get(1)?,
                    camera_id: r.get(2)?,
                    location_id: r.get(3)?,
                    frame_number: r.get(4)?,
                    timestamp_video: r.get(5)?,
                    timestamp_recorded: r.get(6)?,
                    state: DivisionState::parse(&state_str).unwrap_or(DivisionState::Green),
                    walking_area_waiters: r.get(8)?,
                    service_area_waiters: r.get(9)?,
                    screenshot_path: r.get(10)?,
                },
                created_at: r.get(11)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(SurveillanceError::from)
    }

    pub fn scan_unsynced_table(
        &self,
        limit: usize,
        created_after: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredTableEvent>> {
        let sql = "SELECT table_state_id, session_id, camera_id, location_id, frame_number,
                          timestamp_video, timestamp_recorded, table_id, state, customers_count,
                          waiters_count, screenshot_path, created_at
                   FROM table_states
                   WHERE synced_to_cloud = 0 AND created_at >= ?2
                   ORDER BY created_at ASC LIMIT ?1";
        let mut stmt = self.conn.prepare(sql)?;
        let cutoff = created_after.unwrap_or_else(|| DateTime::<Utc>::MIN_UTC);
        let rows = stmt.query_map(params![limit as i64, cutoff], |r| {
            let state_str: String = r.get(8)?;
            Ok(StoredTableEvent {
                id: r.get(0)?,
                row: TableEventRow {
                    session_id: r.get(1)?,
                    camera_id: r.get(2)?,
                    location_id: r.get(3)?,
                    frame_number: r.get(4)?,
                    timestamp_video: r.get(5)?,
                    timestamp_recorded: r.get(6)?,
                    table_id: r.get(7)?,
                    state: TableState::parse(&state_str).unwrap_or(TableState::Idle),
                    customers_count: r.get(9)?,
                    waiters_count: r.get(10)?,
                    screenshot_path: r.get(11)?,
                },
                created_at: r.get(12)?,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(SurveillanceError::from)
    }

    /// Marks exactly the given rows synced, in a single local transaction.
    /// Never called before the caller has a successful cloud acknowledgement
    /// for the same ids (P7 sync idempotence).
    pub fn mark_division_synced(&mut self, ids: &[i64]) -> Result<()> {
        mark_synced(&mut self.conn, "division_states", "division_state_id", ids)
    }

    pub fn mark_table_synced(&mut self, ids: &[i64]) -> Result<()> {
        mark_synced(&mut self.conn, "table_states", "table_state_id", ids)
    }

    /// Deletes synced rows older than `retention`. Never touches an unsynced
    /// row (I4) or a synced row younger than retention (I3).
    pub fn prune_synced_older_than(&self, retention: chrono::Duration) -> Result<(usize, usize)> {
        let cutoff = Utc::now() - retention;
        let division_deleted = self.conn.execute(
            "DELETE FROM division_states WHERE synced_to_cloud = 1 AND created_at < ?1",
            params![cutoff],
        )?;
        let table_deleted = self.conn.execute(
            "DELETE FROM table_states WHERE synced_to_cloud = 1 AND created_at < ?1",
            params![cutoff],
        )?;
        Ok((division_deleted, table_deleted))
    }

    pub fn insert_sync_status(
        &self,
        sync_type: &str,
        records_synced: i64,
        status: &str,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_status (sync_type, records_synced, status, error_message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![sync_type, records_synced, status, error_message, Utc::now()],
        )?;
        Ok(())
    }
}

fn mark_synced(conn: &mut Connection, table: &str, id_col: &str, ids: &[i64]) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    let tx = conn.transaction()?;
    {
        let sql = format!("UPDATE {table} SET synced_to_cloud = 1 WHERE {id_col} = ?1");
        let mut stmt = tx.prepare(&sql)?;
        for id in ids {
            stmt.execute(params![id])?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn first_location_id(conn: &Connection) -> Result<Option<String>> {
    conn.query_row("SELECT location_id FROM locations LIMIT 1", [], |r| r.get(0))
        .optional()
        .map_err(SurveillanceError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rows::{DivisionEventRow, DivisionState};

    fn sample_division(session_id: &str, frame: i64) -> DivisionEventRow {
        DivisionEventRow {
            session_id: session_id.to_string(),
            camera_id: "camera_35".to_string(),
            location_id: "loc_1".to_string(),
            frame_number: frame,
            timestamp_video: frame as f64 * 0.2,
            timestamp_recorded: Utc::now(),
            state: DivisionState::Green,
            walking_area_waiters: 2,
            service_area_waiters: 1,
            screenshot_path: None,
        }
    }

    #[test]
    fn duplicate_session_is_rejected_without_side_effects() {
        let store = Store::open_in_memory().unwrap();
        let session = NewSession {
            session_id: "s1".into(),
            camera_id: "camera_35".into(),
            video_filename: "camera_35_20251022_195212.mp4".into(),
            video_id: None,
            location_id: "loc_1".into(),
            config_file_path: "roi/camera_35_roi.json".into(),
            roi_version: None,
            start_time: Utc::now(),
        };
        store.insert_session(&session).unwrap();
        let err = store.insert_session(&session).unwrap_err();
        assert!(matches!(err, SurveillanceError::Duplicate { .. }));
        assert!(store.session_exists("camera_35", "camera_35_20251022_195212.mp4").unwrap());
    }

    #[test]
    fn batch_insert_then_mark_then_prune_respects_retention() {
        let mut store = Store::open_in_memory().unwrap();
        let session = NewSession {
            session_id: "s1".into(),
            camera_id: "camera_35".into(),
            video_filename: "f.mp4".into(),
            video_id: None,
            location_id: "loc_1".into(),
            config_file_path: "x".into(),
            roi_version: None,
            start_time: Utc::now(),
        };
        store.insert_session(&session).unwrap();

        let rows: Vec<_> = (0..5).map(|i| sample_division("s1", i)).collect();
        store.insert_division_batch(&rows).unwrap();

        let unsynced = store.scan_unsynced_division(100, None).unwrap();
        assert_eq!(unsynced.len(), 5);

        let ids: Vec<i64> = unsynced.iter().map(|r| r.id).collect();
        store.mark_division_synced(&ids).unwrap();

        // Not yet past retention: nothing pruned.
        let (deleted, _) = store.prune_synced_older_than(chrono::Duration::hours(24)).unwrap();
        assert_eq!(deleted, 0);

        // Past retention: everything synced is pruned.
        let (deleted, _) = store.prune_synced_older_than(chrono::Duration::seconds(-1)).unwrap();
        assert_eq!(deleted, 5);
    }

    #[test]
    fn unsynced_rows_are_never_pruned() {
        let mut store = Store::open_in_memory().unwrap();
        let session = NewSession {
            session_id: "s1".into(),
            camera_id: "camera_35".into(),
            video_filename: "f.mp4".into(),
            video_id: None,
            location_id: "loc_1".into(),
            config_file_path: "x".into(),
            roi_version: None,
            start_time: Utc::now(),
        };
        store.insert_session(&session).unwrap();
        let rows = vec![sample_division("s1", 0)];
        store.insert_division_batch(&rows).unwrap();

        let (deleted, _) = store.prune_synced_older_than(chrono::Duration::seconds(-1)).unwrap();
        assert_eq!(deleted, 0);
        assert_eq!(store.scan_unsynced_division(100, None).unwrap().len(), 1);
    }
}
