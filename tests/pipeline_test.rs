//! Exercises the Event Buffer, Local Store, and Cloud Replicator together:
//! a session's events get buffered, auto-flushed, replicated, and pruned
//! the same way they would across a real capture/processing/sync cycle.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use vigil_core::error::Result;
use vigil_core::event_buffer::EventBuffer;
use vigil_core::replicator::{CloudSink, Replicator, SyncMode};
use vigil_core::store::rows::{DivisionEventRow, DivisionState, NewSession, TableEventRow, TableState};
use vigil_core::store::Store;

struct RecordingSink {
    received: Mutex<Vec<(String, usize)>>,
}

impl CloudSink for RecordingSink {
    fn insert_batch<'a>(
        &'a self,
        table: &'a str,
        records: Vec<serde_json::Value>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        let count = records.len();
        Box::pin(async move {
            self.received.lock().push((table.to_string(), count));
            Ok(())
        })
    }
}

fn seed_session(store: &Store) {
    store
        .insert_session(&NewSession {
            session_id: "s1".into(),
            camera_id: "camera_12".into(),
            video_filename: "camera_12_20260501_120000.mp4".into(),
            video_id: None,
            location_id: "loc_1".into(),
            config_file_path: "roi/camera_12_roi.json".into(),
            roi_version: None,
            start_time: Utc::now(),
        })
        .unwrap();
}

fn division_row(session_id: &str, frame: i64) -> DivisionEventRow {
    DivisionEventRow {
        session_id: session_id.to_string(),
        camera_id: "camera_12".to_string(),
        location_id: "loc_1".to_string(),
        frame_number: frame,
        timestamp_video: frame as f64 * 0.2,
        timestamp_recorded: Utc::now(),
        state: DivisionState::Yellow,
        walking_area_waiters: 2,
        service_area_waiters: 1,
        screenshot_path: None,
    }
}

fn table_row(session_id: &str, frame: i64) -> TableEventRow {
    TableEventRow {
        session_id: session_id.to_string(),
        camera_id: "camera_12".to_string(),
        location_id: "loc_1".to_string(),
        frame_number: frame,
        timestamp_video: frame as f64 * 0.2,
        timestamp_recorded: Utc::now(),
        table_id: "table_3".to_string(),
        state: TableState::Busy,
        customers_count: 4,
        waiters_count: 1,
        screenshot_path: None,
    }
}

#[tokio::test]
async fn buffered_events_auto_flush_and_are_visible_to_a_replication_pass() {
    let buffer_store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
    seed_session(&buffer_store.lock());

    let buffer = EventBuffer::new(buffer_store, 3);
    for i in 0..7 {
        buffer.add_division_state(division_row("s1", i)).unwrap();
        buffer.add_table_state(table_row("s1", i)).unwrap();
    }
    assert!(buffer.pending_division() < 7, "auto-flush should have fired at least once by batch size 3");
    buffer.flush_all().unwrap();
    assert_eq!(buffer.pending_division(), 0);
    assert_eq!(buffer.pending_table(), 0);
    assert_eq!(buffer.stats().total_division_inserts, 7);
    assert_eq!(buffer.stats().total_table_inserts, 7);

    // A fresh store standing in for the same on-disk file the replicator
    // would see in production (in-memory SQLite handles don't share state
    // across Connections the way a shared file path does).
    let replicate_store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
    {
        let mut s = replicate_store.lock();
        seed_session(&s);
        let divisions: Vec<_> = (0..7).map(|i| division_row("s1", i)).collect();
        s.insert_division_batch(&divisions).unwrap();
        let tables: Vec<_> = (0..7).map(|i| table_row("s1", i)).collect();
        s.insert_table_batch(&tables).unwrap();
    }

    let sink = Box::new(RecordingSink { received: Mutex::new(Vec::new()) });
    let replicator = Replicator::new(replicate_store.clone(), sink, 100, 2, 24);
    replicator.run(SyncMode::Full).await.unwrap();

    assert!(replicate_store.lock().scan_unsynced_division(100, None).unwrap().is_empty());
    assert!(replicate_store.lock().scan_unsynced_table(100, None).unwrap().is_empty());

    // Aged-out retention prunes the now-synced rows.
    let (div_pruned, table_pruned) =
        replicate_store.lock().prune_synced_older_than(chrono::Duration::seconds(-1)).unwrap();
    assert_eq!(div_pruned, 7);
    assert_eq!(table_pruned, 7);
}

struct FailEverySink;
impl CloudSink for FailEverySink {
    fn insert_batch<'a>(
        &'a self,
        _table: &'a str,
        _records: Vec<serde_json::Value>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move { Err(vigil_core::error::SurveillanceError::Sync("offline".into())) })
    }
}

#[tokio::test]
async fn rows_stay_unsynced_and_unpruned_when_cloud_is_unreachable() {
    let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
    {
        let s = store.lock();
        seed_session(&s);
    }
    {
        let mut s = store.lock();
        s.insert_division_batch(&[division_row("s1", 0)]).unwrap();
    }

    let replicator = Replicator::new(store.clone(), Box::new(FailEverySink), 10, 2, 24);
    replicator.run(SyncMode::Full).await.unwrap();

    assert_eq!(store.lock().scan_unsynced_division(100, None).unwrap().len(), 1);
    let (pruned, _) = store.lock().prune_synced_older_than(chrono::Duration::seconds(-1)).unwrap();
    assert_eq!(pruned, 0, "unsynced rows must never be pruned regardless of age");
}
