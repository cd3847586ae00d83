//! Service Controller (C10): process entry point, lifecycle, signal
//! handling, and the 30 s scheduler tick that drives C3/C6 edges.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::capture::CaptureSupervisor;
use crate::clock;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, SurveillanceError};
use crate::event_buffer::EventBuffer;
use crate::gpu::{self, ScaleAction, ScalingClock};
use crate::replicator::{HttpCloudSink, Replicator, SyncMode};
use crate::segment_index;
use crate::store::Store;

const TICK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Init,
    Running,
    Stopping,
    Stopped,
}

// ---- PID file lifecycle, the only in-process/OS coordination boundary ----

fn pid_file_path(config: &Config) -> PathBuf {
    config.storage.root.join("vigil.pid")
}

fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

fn read_pid_file(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn remove_pid_file(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Checks liveness with `kill(pid, 0)`, the same probe used to gate `start`.
fn pid_is_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

fn preflight(config: &Config) -> Result<()> {
    std::fs::create_dir_all(config.videos_root())?;
    std::fs::create_dir_all(config.results_root())?;
    std::fs::create_dir_all(config.db_root())?;
    std::fs::create_dir_all(config.logs_root())?;

    let now = Local::now();
    if now.naive_local().and_utc().timestamp() < 0 {
        return Err(SurveillanceError::Config("system clock is not sane".into()));
    }

    Ok(())
}

/// `start`: refuses if a live PID file exists. Exit-code semantics are the
/// caller's (main.rs) responsibility; this returns an error for failure.
pub async fn start(config_dir: PathBuf) -> Result<()> {
    let config = Config::from_dir(&config_dir)?;
    // Fail fast if any enabled camera is missing a region-of-interest file;
    // the dispatcher resolves paths lazily and would otherwise only notice
    // once the first segment reaches the analysis runner.
    crate::config::load_roi_configs(&config_dir, &config.cameras)?;

    let pid_path = pid_file_path(&config);
    if let Some(existing_pid) = read_pid_file(&pid_path) {
        if pid_is_alive(existing_pid) {
            return Err(SurveillanceError::Service(format!(
                "already running (pid {existing_pid})"
            )));
        }
    }

    preflight(&config)?;
    write_pid_file(&pid_path)?;

    let result = run(config).await;

    remove_pid_file(&pid_path);
    result
}

pub fn status(config_dir: PathBuf) -> Result<String> {
    let config = Config::from_dir(&config_dir)?;
    let pid_path = pid_file_path(&config);

    let running = read_pid_file(&pid_path).map(pid_is_alive).unwrap_or(false);
    let now = Local::now();
    let capture_window = clock::active_capture_window(now, &config.schedule.capture_windows);
    let in_processing = clock::in_processing_window(now, &config.schedule.processing_window);

    Ok(format!(
        "running={running} pid={:?} capture_window={:?} in_processing_window={in_processing}",
        read_pid_file(&pid_path),
        capture_window,
    ))
}

pub fn stop(config_dir: PathBuf) -> Result<()> {
    let config = Config::from_dir(&config_dir)?;
    let pid_path = pid_file_path(&config);
    match read_pid_file(&pid_path) {
        Some(pid) if pid_is_alive(pid) => {
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
            Ok(())
        }
        _ => Err(SurveillanceError::Service("not running".into())),
    }
}

struct RunState {
    capture: CaptureSupervisor,
    dispatcher: Option<Dispatcher>,
    processing_triggered_on: Option<NaiveDate>,
    processing_end_warned_on: Option<NaiveDate>,
}

async fn run(config: Config) -> Result<()> {
    // C8 owns exactly one connection to the store file for the life of the
    // process; every component that touches it (C6, C7, C9) shares this
    // handle instead of opening its own (each open backs up the file first).
    let store = Store::open(&config.db_root())?;
    let location_id = store.first_location_id()?.unwrap_or_else(|| "default".to_string());
    store.ensure_location(&location_id)?;

    let shared_store = Arc::new(Mutex::new(store));
    let event_buffer = Arc::new(EventBuffer::new(shared_store.clone(), config.store.event_batch_size));

    let replicator = build_replicator(&config, shared_store.clone());

    let mut state = ServiceState::Running;
    let mut run_state = RunState {
        capture: CaptureSupervisor::new(config.videos_root(), config.storage.segment_secs),
        dispatcher: None,
        processing_triggered_on: None,
        processing_end_warned_on: None,
    };

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|e| SurveillanceError::Service(format!("cannot install SIGTERM handler: {e}")))?;

    let (gpu_action_tx, mut gpu_action_rx) = watch::channel(ScaleAction::Hold);
    let gpu_thresholds = config.gpu;
    let max_workers = config.dispatcher.max_workers;
    tokio::spawn(async move {
        gpu_monitor_loop(gpu_thresholds, max_workers, gpu_action_tx).await;
    });

    let disk_videos_root = config.videos_root();
    let disk_max_age_days = config.disk.raw_max_age_days;
    let disk_interval_secs = config.disk.interval_secs;
    tokio::spawn(async move {
        disk_watchdog_loop(disk_videos_root, disk_max_age_days, disk_interval_secs).await;
    });

    let mut tick = tokio::time::interval(TICK_INTERVAL);
    let mut sync_tick = tokio::time::interval(Duration::from_secs(config.sync.interval_secs));

    loop {
        if state == ServiceState::Stopping {
            break;
        }
        tokio::select! {
            _ = tick.tick() => {
                tick_once(&config, &location_id, shared_store.clone(), event_buffer.clone(), &mut run_state).await;
            }
            _ = sync_tick.tick() => {
                if let Some(replicator) = &replicator {
                    if let Err(e) = replicator.run(SyncMode::Hourly).await {
                        error!(error = %e, "hourly sync failed");
                    }
                }
            }
            changed = gpu_action_rx.changed() => {
                if changed.is_ok() {
                    apply_scale_action(*gpu_action_rx.borrow(), &mut run_state);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                state = ServiceState::Stopping;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                state = ServiceState::Stopping;
            }
        }
    }

    // Stopping: C3 first, then C6, then flush C7, then a final C9 pass.
    run_state.capture.stop_all().await;
    if let Some(dispatcher) = run_state.dispatcher.take() {
        dispatcher.stop().await;
    }
    if let Err(e) = event_buffer.flush_all() {
        error!(error = %e, "failed to flush event buffer on shutdown");
    }
    if let Some(replicator) = &replicator {
        if let Err(e) = replicator.run(SyncMode::Hourly).await {
            warn!(error = %e, "final sync pass failed during shutdown");
        }
    }

    Ok(())
}

fn build_replicator(config: &Config, store: Arc<Mutex<Store>>) -> Option<Replicator> {
    let base_url = std::env::var("CLOUD_DB_URL").ok()?;
    let api_key = std::env::var("CLOUD_DB_KEY").ok()?;
    match HttpCloudSink::new(base_url, api_key, Duration::from_secs(config.sync.request_timeout_secs)) {
        Ok(sink) => Some(Replicator::new(
            store,
            Box::new(sink),
            config.sync.batch_size,
            config.sync.hourly_window_hours,
            config.store.retention_hours,
        )),
        Err(e) => {
            warn!(error = %e, "cloud replication disabled: failed to build HTTP client");
            None
        }
    }
}

async fn tick_once(
    config: &Config,
    location_id: &str,
    store: Arc<Mutex<Store>>,
    event_buffer: Arc<EventBuffer>,
    run_state: &mut RunState,
) {
    run_state.capture.reap_finished();

    let now = Local::now();
    match clock::active_capture_window(now, &config.schedule.capture_windows) {
        Some(window) => {
            let remaining = clock::remaining_seconds(now, &window);
            run_state
                .capture
                .start_window(&config.cameras, window.start_minutes(), Duration::from_secs(remaining.max(0) as u64))
                .await;
        }
        None => {
            run_state.capture.stop_all().await;
        }
    }

    let in_processing = clock::in_processing_window(now, &config.schedule.processing_window);
    let today = now.date_naive();

    if in_processing && run_state.processing_triggered_on != Some(today) {
        run_state.processing_triggered_on = Some(today);
        start_processing_pass(config, location_id, store, event_buffer, run_state);
    }

    if !in_processing {
        if let Some(dispatcher) = &run_state.dispatcher {
            if !dispatcher.idle() && run_state.processing_end_warned_on != Some(today) {
                warn!("processing dispatcher still running past the processing window end");
                run_state.processing_end_warned_on = Some(today);
            }
        }
    }
}

fn start_processing_pass(
    config: &Config,
    location_id: &str,
    store: Arc<Mutex<Store>>,
    event_buffer: Arc<EventBuffer>,
    run_state: &mut RunState,
) {
    // F2: enabled cameras, plus any camera named in the backlog allow-list so
    // a camera disabled mid-deployment can still have its already-captured
    // segments drained.
    let eligible: HashSet<String> = config
        .cameras
        .iter()
        .filter(|c| c.enabled)
        .map(|c| c.camera_id.clone())
        .chain(config.dispatcher.backlog_allow_list.iter().cloned())
        .collect();
    let videos_root = config.videos_root();
    let store_for_scan = store.clone();
    let segments = segment_index::discover_segments(&videos_root, &eligible, &|camera_id, filename| {
        store_for_scan.lock().session_exists(camera_id, filename).unwrap_or(false)
    });

    let segments = match segments {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to discover segments");
            return;
        }
    };

    if run_state.dispatcher.is_none() {
        let roi_dir = config.storage.root.join("roi");
        let dispatcher = Dispatcher::new(
            store,
            event_buffer,
            location_id.to_string(),
            config.dispatcher.min_workers,
            config.dispatcher.max_workers,
            Duration::from_secs(config.dispatcher.job_stop_timeout_secs),
            move |camera_id: &str| roi_dir.join(format!("{camera_id}_roi.json")),
        );
        run_state.dispatcher = Some(dispatcher);
    }

    if let Some(dispatcher) = &run_state.dispatcher {
        info!(count = segments.len(), "enqueueing discovered segments for processing");
        dispatcher.enqueue(segments);
    }
}

fn apply_scale_action(action: ScaleAction, run_state: &mut RunState) {
    let Some(dispatcher) = &run_state.dispatcher else { return };
    match action {
        ScaleAction::ScaleUp => dispatcher.scale_up(),
        ScaleAction::ScaleDown => dispatcher.scale_down(),
        ScaleAction::Emergency => dispatcher.emergency_shrink(),
        ScaleAction::Hold => {}
    }
}

async fn gpu_monitor_loop(thresholds: crate::config::GpuThresholds, max_workers: usize, tx: watch::Sender<ScaleAction>) {
    let mut clock = ScalingClock::new(&thresholds);
    let mut interval = tokio::time::interval(Duration::from_secs(thresholds.sample_interval_secs));
    // Worker count isn't visible from here; the dispatcher gates max_workers
    // itself, so this loop only needs to forward gated decisions.
    let mut last_workers = 0usize;
    loop {
        interval.tick().await;
        match gpu::sample_gpu().await {
            Ok(sample) => {
                info!(
                    temp_c = sample.temperature_c,
                    util_pct = sample.utilization_pct,
                    free_gb = sample.free_memory_gb,
                    "gpu sample"
                );
                let raw = gpu::classify(sample, last_workers, max_workers, &thresholds);
                let gated = clock.gate(raw, tokio::time::Instant::now());
                if gated == ScaleAction::ScaleUp {
                    last_workers = (last_workers + 1).min(max_workers);
                } else if matches!(gated, ScaleAction::ScaleDown | ScaleAction::Emergency) {
                    last_workers = last_workers.saturating_sub(1);
                }
                let _ = tx.send(gated);
            }
            Err(e) => {
                warn!(error = %e, "gpu sample failed, treating as hold");
            }
        }
    }
}

/// Disk watchdog: deletes raw videos whose capture date is at least
/// `raw_max_age_days` old, unconditionally (independent of processing
/// status), never touching today's directory.
pub async fn disk_watchdog_loop(videos_root: PathBuf, max_age_days: i64, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    loop {
        interval.tick().await;
        if let Err(e) = prune_old_videos(&videos_root, max_age_days) {
            error!(error = %e, "disk watchdog pass failed");
        }
    }
}

fn prune_old_videos(videos_root: &Path, max_age_days: i64) -> std::io::Result<()> {
    if !videos_root.is_dir() {
        return Ok(());
    }
    let cutoff = Local::now().date_naive() - chrono::Duration::days(max_age_days);
    for entry in std::fs::read_dir(videos_root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Ok(date) = NaiveDate::parse_from_str(&name, "%Y%m%d") {
            if date < cutoff {
                info!(date = %date, "disk watchdog removing aged raw video directory");
                std::fs::remove_dir_all(entry.path())?;
            }
        }
    }
    Ok(())
}
