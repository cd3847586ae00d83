//! Processing Dispatcher (C6): a priority work queue drained by a dynamic
//! worker pool sized by GPU telemetry (C5), handing segments to the external
//! analysis runner.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::event_buffer::EventBuffer;
use crate::segment_index::Segment;
use crate::store::rows::{DivisionEventRow, DivisionState, NewSession, TableEventRow, TableState};
use crate::store::Store;

/// One line of the analysis runner's stdout NDJSON stream. The runner is a
/// separate process (it owns its own frame-by-frame vision pipeline); this
/// is the only channel through which its per-frame division/table state
/// changes reach the local store's Event Buffer.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RunnerEvent {
    Division {
        frame_number: i64,
        timestamp_video: f64,
        state: String,
        walking_area_waiters: i64,
        service_area_waiters: i64,
        #[serde(default)]
        screenshot_path: Option<String>,
    },
    Table {
        frame_number: i64,
        timestamp_video: f64,
        table_id: String,
        state: String,
        customers_count: i64,
        waiters_count: i64,
        #[serde(default)]
        screenshot_path: Option<String>,
    },
}

const ANALYSIS_EXIT_SUCCESS: i32 = 0;
const ANALYSIS_EXIT_ERROR: i32 = 1;
const ANALYSIS_EXIT_DUPLICATE: i32 = 2;

#[derive(Debug, Clone, Eq, PartialEq)]
struct QueuedSegment {
    start_ts: chrono::NaiveDateTime,
    segment: Segment,
}

impl Ord for QueuedSegment {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.start_ts.cmp(&other.start_ts)
    }
}
impl PartialOrd for QueuedSegment {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DispatcherStats {
    pub processed: u64,
    pub errors: u64,
    pub duplicates: u64,
}

struct Shared {
    queue: Mutex<BinaryHeap<Reverse<QueuedSegment>>>,
    notify: Notify,
    store: Arc<Mutex<Store>>,
    event_buffer: Arc<EventBuffer>,
    roi_config_path: Box<dyn Fn(&str) -> PathBuf + Send + Sync>,
    location_id: String,
    job_stop_timeout: std::time::Duration,
    stats: Mutex<DispatcherStats>,
    stop: watch::Receiver<bool>,
}

/// Owns the live worker set and the priority queue. One instance per
/// running service; not restarted between processing windows, just drained
/// and refilled.
pub struct Dispatcher {
    shared: Arc<Shared>,
    target_workers: watch::Sender<usize>,
    stop_tx: watch::Sender<bool>,
    active_count: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    min_workers: usize,
    max_workers: usize,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Mutex<Store>>,
        event_buffer: Arc<EventBuffer>,
        location_id: String,
        min_workers: usize,
        max_workers: usize,
        job_stop_timeout: std::time::Duration,
        roi_config_path: impl Fn(&str) -> PathBuf + Send + Sync + 'static,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            store,
            event_buffer,
            roi_config_path: Box::new(roi_config_path),
            location_id,
            job_stop_timeout,
            stats: Mutex::new(DispatcherStats::default()),
            stop: stop_rx,
        });
        let (target_tx, _target_rx) = watch::channel(min_workers);
        let dispatcher = Self {
            shared,
            target_workers: target_tx,
            stop_tx,
            active_count: Arc::new(AtomicUsize::new(0)),
            workers: Mutex::new(Vec::new()),
            min_workers,
            max_workers,
        };
        dispatcher.reconcile_workers();
        dispatcher
    }

    /// Adds segments to the priority queue (oldest start-timestamp first).
    pub fn enqueue(&self, segments: Vec<Segment>) {
        let mut queue = self.shared.queue.lock();
        for segment in segments {
            queue.push(Reverse(QueuedSegment { start_ts: segment.start_ts, segment }));
        }
        drop(queue);
        self.shared.notify.notify_waiters();
    }

    pub fn stats(&self) -> DispatcherStats {
        *self.shared.stats.lock()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Current worker-set target size.
    pub fn worker_count(&self) -> usize {
        *self.target_workers.borrow()
    }

    pub fn scale_up(&self) {
        let current = *self.target_workers.borrow();
        if current < self.max_workers {
            let _ = self.target_workers.send(current + 1);
            self.reconcile_workers();
        }
    }

    pub fn scale_down(&self) {
        let current = *self.target_workers.borrow();
        if current > self.min_workers {
            let _ = self.target_workers.send(current - 1);
        }
    }

    pub fn emergency_shrink(&self) {
        let _ = self.target_workers.send(self.min_workers);
    }

    fn reconcile_workers(&self) {
        let target = *self.target_workers.borrow();
        let mut workers = self.workers.lock();
        workers.retain(|h| !h.is_finished());
        while workers.len() < target {
            let idx = workers.len();
            let shared = self.shared.clone();
            let target_rx = self.target_workers.subscribe();
            let active_count = self.active_count.clone();
            workers.push(tokio::spawn(worker_loop(idx, shared, target_rx, active_count)));
        }
    }

    /// Stops accepting new work and waits for in-flight jobs to finish,
    /// within the configured per-job timeout; never cancels a runner
    /// mid-frame.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = tokio::time::timeout(self.shared.job_stop_timeout, handle).await;
        }
    }

    /// True once the queue is drained and no worker is mid-job.
    pub fn idle(&self) -> bool {
        self.shared.queue.lock().is_empty() && self.active_count.load(Ordering::SeqCst) == 0
    }
}

async fn worker_loop(
    index: usize,
    shared: Arc<Shared>,
    mut target_rx: watch::Receiver<usize>,
    active_count: Arc<AtomicUsize>,
) {
    let mut stop = shared.stop.clone();
    loop {
        if *stop.borrow() {
            return;
        }
        // If the worker set has shrunk below our own index, put the job
        // back (we haven't taken one yet at this point) and exit.
        if index >= *target_rx.borrow() {
            return;
        }

        let segment = {
            let mut queue = shared.queue.lock();
            queue.pop().map(|Reverse(q)| q.segment)
        };

        let segment = match segment {
            Some(s) => s,
            None => {
                tokio::select! {
                    _ = shared.notify.notified() => continue,
                    _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => continue,
                    changed = target_rx.changed() => { if changed.is_err() { return; } continue; }
                    _ = stop.changed() => return,
                }
            }
        };

        active_count.fetch_add(1, Ordering::SeqCst);
        process_segment(&shared, &segment).await;
        active_count.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn process_segment(shared: &Shared, segment: &Segment) {
    // I1: at-most-one Session row per (camera_id, filename), checked before
    // the runner starts.
    let session_id = format!(
        "{}_{}",
        segment.start_ts.format("%Y%m%d%H%M%S"),
        segment.camera_id
    );
    let new_session = NewSession {
        session_id: session_id.clone(),
        camera_id: segment.camera_id.clone(),
        video_filename: segment.filename.clone(),
        video_id: None,
        location_id: shared.location_id.clone(),
        config_file_path: (shared.roi_config_path)(&segment.camera_id).to_string_lossy().into_owned(),
        roi_version: None,
        start_time: Utc::now(),
    };

    let insert_result = {
        let store = shared.store.lock();
        store.insert_session(&new_session)
    };

    if let Err(crate::error::SurveillanceError::Duplicate { .. }) = insert_result {
        shared.stats.lock().duplicates += 1;
        info!(camera = %segment.camera_id, filename = %segment.filename, "duplicate segment skipped");
        return;
    }
    if let Err(e) = insert_result {
        error!(camera = %segment.camera_id, error = %e, "failed to create session row");
        shared.stats.lock().errors += 1;
        return;
    }

    let roi_path = (shared.roi_config_path)(&segment.camera_id);
    let start = std::time::Instant::now();
    let mut child = match Command::new("analysis_runner")
        .arg(&segment.path)
        .arg(&roi_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            shared.stats.lock().errors += 1;
            error!(camera = %segment.camera_id, error = %e, "failed to spawn analysis runner");
            return;
        }
    };

    // The runner emits one DivisionEvent/TableEvent per line as it processes
    // frames; each line is buffered through the Event Buffer as it arrives
    // rather than held until the process exits.
    let stdout = child.stdout.take().expect("analysis runner spawned with piped stdout");
    let mut lines = BufReader::new(stdout).lines();
    let mut events_ingested: u64 = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RunnerEvent>(&line) {
                    Ok(event) => {
                        if ingest_runner_event(&shared, &session_id, &segment.camera_id, event) {
                            events_ingested += 1;
                        }
                    }
                    Err(e) => {
                        warn!(camera = %segment.camera_id, error = %e, "malformed analysis runner event line, skipped");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(camera = %segment.camera_id, error = %e, "failed to read analysis runner stdout");
                break;
            }
        }
    }

    let status = child.wait().await;

    match status {
        Ok(status) => match status.code() {
            Some(ANALYSIS_EXIT_SUCCESS) => {
                shared.stats.lock().processed += 1;
                info!(
                    camera = %segment.camera_id,
                    filename = %segment.filename,
                    elapsed_secs = start.elapsed().as_secs_f64(),
                    events_ingested,
                    "segment processed"
                );
            }
            Some(ANALYSIS_EXIT_DUPLICATE) => {
                shared.stats.lock().duplicates += 1;
                info!(camera = %segment.camera_id, filename = %segment.filename, "runner reported duplicate, non-error skip");
            }
            Some(ANALYSIS_EXIT_ERROR) | Some(_) | None => {
                shared.stats.lock().errors += 1;
                warn!(camera = %segment.camera_id, filename = %segment.filename, exit = ?status.code(), "analysis runner failed");
            }
        },
        Err(e) => {
            shared.stats.lock().errors += 1;
            error!(camera = %segment.camera_id, error = %e, "failed to wait on analysis runner");
        }
    }
}

/// Buffers one parsed runner event through the Event Buffer. Returns `false`
/// (and logs) for a state string the runner sent that doesn't match either
/// enum, or a buffer write that failed.
fn ingest_runner_event(shared: &Shared, session_id: &str, camera_id: &str, event: RunnerEvent) -> bool {
    let result = match event {
        RunnerEvent::Division {
            frame_number,
            timestamp_video,
            state,
            walking_area_waiters,
            service_area_waiters,
            screenshot_path,
        } => {
            let Some(state) = DivisionState::parse(&state) else {
                warn!(camera = %camera_id, state = %state, "analysis runner sent an unrecognized division state, dropped");
                return false;
            };
            shared.event_buffer.add_division_state(DivisionEventRow {
                session_id: session_id.to_string(),
                camera_id: camera_id.to_string(),
                location_id: shared.location_id.clone(),
                frame_number,
                timestamp_video,
                timestamp_recorded: Utc::now(),
                state,
                walking_area_waiters,
                service_area_waiters,
                screenshot_path,
            })
        }
        RunnerEvent::Table {
            frame_number,
            timestamp_video,
            table_id,
            state,
            customers_count,
            waiters_count,
            screenshot_path,
        } => {
            let Some(state) = TableState::parse(&state) else {
                warn!(camera = %camera_id, state = %state, "analysis runner sent an unrecognized table state, dropped");
                return false;
            };
            shared.event_buffer.add_table_state(TableEventRow {
                session_id: session_id.to_string(),
                camera_id: camera_id.to_string(),
                location_id: shared.location_id.clone(),
                frame_number,
                timestamp_video,
                timestamp_recorded: Utc::now(),
                table_id,
                state,
                customers_count,
                waiters_count,
                screenshot_path,
            })
        }
    };

    if let Err(e) = result {
        warn!(camera = %camera_id, error = %e, "failed to buffer analysis runner event");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(camera_id: &str, hhmmss: &str) -> Segment {
        let start_ts =
            chrono::NaiveDateTime::parse_from_str(&format!("20260101{hhmmss}"), "%Y%m%d%H%M%S").unwrap();
        Segment {
            path: PathBuf::from(format!("/videos/20260101/{camera_id}/{camera_id}_20260101_{hhmmss}.mp4")),
            camera_id: camera_id.to_string(),
            filename: format!("{camera_id}_20260101_{hhmmss}.mp4"),
            capture_date: start_ts.date(),
            start_ts,
            size_bytes: 1024,
        }
    }

    #[test]
    fn priority_queue_pops_oldest_first() {
        let mut heap: BinaryHeap<Reverse<QueuedSegment>> = BinaryHeap::new();
        let a = segment("cam1", "090000");
        let b = segment("cam1", "100000");
        heap.push(Reverse(QueuedSegment { start_ts: b.start_ts, segment: b.clone() }));
        heap.push(Reverse(QueuedSegment { start_ts: a.start_ts, segment: a.clone() }));

        let first = heap.pop().unwrap().0.segment;
        assert_eq!(first.filename, a.filename);
        let second = heap.pop().unwrap().0.segment;
        assert_eq!(second.filename, b.filename);
    }

    fn shared_harness() -> (Arc<Shared>, Arc<Mutex<Store>>) {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_session(&NewSession {
                session_id: "s1".into(),
                camera_id: "cam1".into(),
                video_filename: "f.mp4".into(),
                video_id: None,
                location_id: "loc_1".into(),
                config_file_path: "x".into(),
                roi_version: None,
                start_time: Utc::now(),
            })
            .unwrap();
        let store = Arc::new(Mutex::new(store));
        let event_buffer = Arc::new(EventBuffer::new(store.clone(), 100));
        let (_stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            store: store.clone(),
            event_buffer,
            roi_config_path: Box::new(|_: &str| PathBuf::new()),
            location_id: "loc_1".to_string(),
            job_stop_timeout: std::time::Duration::from_secs(1),
            stats: Mutex::new(DispatcherStats::default()),
            stop: stop_rx,
        });
        (shared, store)
    }

    #[test]
    fn ingest_runner_event_buffers_division_and_table_rows() {
        let (shared, _store) = shared_harness();

        let division: RunnerEvent = serde_json::from_str(
            r#"{"kind":"division","frame_number":1,"timestamp_video":0.2,"state":"YELLOW","walking_area_waiters":2,"service_area_waiters":1}"#,
        )
        .unwrap();
        assert!(ingest_runner_event(&shared, "s1", "cam1", division));

        let table: RunnerEvent = serde_json::from_str(
            r#"{"kind":"table","frame_number":1,"timestamp_video":0.2,"table_id":"table_3","state":"BUSY","customers_count":4,"waiters_count":1}"#,
        )
        .unwrap();
        assert!(ingest_runner_event(&shared, "s1", "cam1", table));

        shared.event_buffer.flush_all().unwrap();
        assert_eq!(shared.event_buffer.stats().total_division_inserts, 1);
        assert_eq!(shared.event_buffer.stats().total_table_inserts, 1);
    }

    #[test]
    fn ingest_runner_event_drops_an_unrecognized_state_without_buffering() {
        let (shared, _store) = shared_harness();

        let division: RunnerEvent = serde_json::from_str(
            r#"{"kind":"division","frame_number":1,"timestamp_video":0.2,"state":"PURPLE","walking_area_waiters":0,"service_area_waiters":0}"#,
        )
        .unwrap();
        assert!(!ingest_runner_event(&shared, "s1", "cam1", division));
        assert_eq!(shared.event_buffer.pending_division(), 0);
    }
}
