//! Capture Supervisor (C3): one supervised recorder per enabled camera for
//! the lifetime of the active capture window.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::CameraConfig;

/// Time given to the capture subprocess to finalize its container trailer
/// after a polite stop before a hard kill is issued.
const FINALIZATION_BUDGET: Duration = Duration::from_secs(30);
/// Backoff after a failed segment before the next one is attempted.
const SEGMENT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, Copy)]
pub struct RecorderStats {
    pub connection_attempts: u64,
    pub successful_segments: u64,
    pub failed_segments: u64,
    pub reconnects: u64,
}

struct RecorderHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    started_for_window_start_m: u32,
}

/// Owns every active per-camera recorder. One instance per running service.
pub struct CaptureSupervisor {
    videos_root: PathBuf,
    segment_secs: u64,
    recorders: HashMap<String, RecorderHandle>,
}

impl CaptureSupervisor {
    pub fn new(videos_root: PathBuf, segment_secs: u64) -> Self {
        Self { videos_root, segment_secs, recorders: HashMap::new() }
    }

    /// Starts a recorder per enabled camera for the given window, sized to
    /// the window's remaining duration from `now`. Idempotent: cameras that
    /// already have a recorder running for this window are left alone. A
    /// recorder started for a different window is stopped (two-stage) before
    /// its replacement is spawned.
    pub async fn start_window(&mut self, cameras: &[CameraConfig], window_start_m: u32, total_duration: Duration) {
        for cam in cameras.iter().filter(|c| c.enabled) {
            if let Some(existing) = self.recorders.get(&cam.camera_id) {
                if existing.started_for_window_start_m == window_start_m && !existing.task.is_finished() {
                    continue;
                }
                if let Some(handle) = self.recorders.remove(&cam.camera_id) {
                    let _ = handle.stop_tx.send(true);
                    let _ = handle.task.await;
                }
            }
            self.spawn_recorder(cam.clone(), window_start_m, total_duration);
        }
    }

    fn spawn_recorder(&mut self, cam: CameraConfig, window_start_m: u32, total_duration: Duration) {
        let camera_id = cam.camera_id.clone();
        let (stop_tx, stop_rx) = watch::channel(false);
        let videos_root = self.videos_root.clone();
        let segment_secs = self.segment_secs;
        let task = tokio::spawn(async move {
            run_recorder(cam, videos_root, segment_secs, total_duration, stop_rx).await;
        });
        self.recorders.insert(
            camera_id,
            RecorderHandle { stop_tx, task, started_for_window_start_m: window_start_m },
        );
    }

    /// Stops every recorder using the two-stage sequence and waits for all
    /// of them to finish finalizing before returning.
    pub async fn stop_all(&mut self) {
        for (_, handle) in self.recorders.drain() {
            let _ = handle.stop_tx.send(true);
            let _ = handle.task.await;
        }
    }

    /// Removes handles for recorders that exited on their own (crash,
    /// window end reached from inside the loop) so the next tick can
    /// restart them if still inside the window.
    pub fn reap_finished(&mut self) -> Vec<String> {
        let finished: Vec<String> =
            self.recorders.iter().filter(|(_, h)| h.task.is_finished()).map(|(id, _)| id.clone()).collect();
        for id in &finished {
            self.recorders.remove(id);
        }
        finished
    }

    pub fn active_camera_ids(&self) -> Vec<String> {
        self.recorders.keys().cloned().collect()
    }
}

fn segment_output_path(videos_root: &std::path::Path, camera_id: &str) -> PathBuf {
    let now = Local::now();
    let date_dir = now.format("%Y%m%d").to_string();
    let filename = format!("{}_{}.mp4", camera_id, now.format("%Y%m%d_%H%M%S"));
    videos_root.join(date_dir).join(camera_id).join(filename)
}

fn spawn_ffmpeg(cam: &CameraConfig, out_path: &std::path::Path, duration_secs: u64) -> std::io::Result<Child> {
    let transport = match cam.transport {
        crate::config::Transport::Tcp => "tcp",
        crate::config::Transport::Udp => "udp",
    };
    Command::new("ffmpeg")
        .arg("-rtsp_transport")
        .arg(transport)
        .arg("-stimeout")
        .arg("10000000") // microseconds
        .arg("-i")
        .arg(cam.rtsp_url())
        .arg("-t")
        .arg(duration_secs.to_string())
        .arg("-c")
        .arg("copy")
        .arg("-f")
        .arg("mp4")
        .arg("-y")
        .arg(out_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
}

/// Sends a polite stop, then waits up to `FINALIZATION_BUDGET` before
/// escalating to a hard kill. Must always be used instead of a direct kill —
/// a direct hard kill corrupts the segment currently being written.
async fn two_stage_stop(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    } else {
        return;
    }

    match tokio::time::timeout(FINALIZATION_BUDGET, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!("polite stop timed out, escalating to hard kill");
            let _ = child.kill().await;
        }
    }
}

async fn run_recorder(
    cam: CameraConfig,
    videos_root: PathBuf,
    segment_secs: u64,
    total_duration: Duration,
    mut stop: watch::Receiver<bool>,
) -> RecorderStats {
    let start = Instant::now();
    let mut stats = RecorderStats::default();
    info!(camera = %cam.camera_id, duration_secs = total_duration.as_secs(), "session_start");

    loop {
        if *stop.borrow() {
            break;
        }
        let elapsed = start.elapsed();
        if elapsed >= total_duration {
            break;
        }
        let remaining = total_duration - elapsed;
        let this_segment_secs = segment_secs.min(remaining.as_secs().max(1));

        let out_path = segment_output_path(&videos_root, &cam.camera_id);
        if let Some(parent) = out_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!(camera = %cam.camera_id, error = %e, "failed to create segment directory");
                tokio::time::sleep(SEGMENT_BACKOFF).await;
                continue;
            }
        }

        stats.connection_attempts += 1;
        if stats.connection_attempts > 1 {
            // Every attempt after the first re-establishes the RTSP session.
            stats.reconnects += 1;
        }
        info!(
            camera = %cam.camera_id,
            attempt = stats.connection_attempts,
            path = %out_path.display(),
            "ffmpeg_start"
        );

        let mut child = match spawn_ffmpeg(&cam, &out_path, this_segment_secs) {
            Ok(c) => c,
            Err(e) => {
                stats.failed_segments += 1;
                error!(camera = %cam.camera_id, error = %e, "segment_error: failed to spawn capture subprocess");
                tokio::time::sleep(SEGMENT_BACKOFF).await;
                continue;
            }
        };

        tokio::select! {
            status = child.wait() => {
                match status {
                    Ok(s) if s.success() => {
                        stats.successful_segments += 1;
                        info!(
                            camera = %cam.camera_id,
                            successes = stats.successful_segments,
                            failures = stats.failed_segments,
                            "segment_complete"
                        );
                    }
                    Ok(s) => {
                        stats.failed_segments += 1;
                        error!(
                            camera = %cam.camera_id,
                            attempt = stats.connection_attempts,
                            successes = stats.successful_segments,
                            failures = stats.failed_segments,
                            exit = ?s.code(),
                            "segment_error"
                        );
                        tokio::time::sleep(SEGMENT_BACKOFF).await;
                    }
                    Err(e) => {
                        stats.failed_segments += 1;
                        error!(camera = %cam.camera_id, error = %e, "segment_error: wait failed");
                        tokio::time::sleep(SEGMENT_BACKOFF).await;
                    }
                }
            }
            _ = stop.changed() => {
                two_stage_stop(&mut child).await;
                break;
            }
        }
    }

    info!(
        camera = %cam.camera_id,
        attempts = stats.connection_attempts,
        successes = stats.successful_segments,
        failures = stats.failed_segments,
        reconnects = stats.reconnects,
        "session_summary"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transport;

    fn test_camera(camera_id: &str) -> CameraConfig {
        CameraConfig {
            camera_id: camera_id.to_string(),
            display_name: None,
            host: "192.0.2.10".to_string(),
            port: 554,
            username: "user".to_string(),
            password: "pass".to_string(),
            stream_path: "/stream1".to_string(),
            transport: Transport::Tcp,
            width: 1920,
            height: 1080,
            enabled: true,
        }
    }

    /// `ffmpeg` is not on the test machine's PATH, so every attempt fails to
    /// spawn and `run_recorder` retries after `SEGMENT_BACKOFF` until
    /// `total_duration` elapses. Each attempt past the first counts as a
    /// reconnect regardless of whether the subprocess ever spoke RTSP.
    #[tokio::test(start_paused = true)]
    async fn reconnects_counts_every_attempt_after_the_first() {
        let dir = tempfile::tempdir().unwrap();
        let cam = test_camera("cam_no_ffmpeg");
        let (_stop_tx, stop_rx) = watch::channel(false);

        let stats = run_recorder(cam, dir.path().to_path_buf(), 5, Duration::from_secs(17), stop_rx).await;

        assert!(stats.connection_attempts >= 2, "expected multiple attempts, got {}", stats.connection_attempts);
        assert_eq!(stats.reconnects, stats.connection_attempts - 1);
        assert_eq!(stats.failed_segments, stats.connection_attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn a_single_attempt_reports_zero_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let cam = test_camera("cam_short_window");
        let (_stop_tx, stop_rx) = watch::channel(false);

        // Shorter than SEGMENT_BACKOFF: the loop exits after the first failed
        // spawn attempt, before a second one is ever made.
        let stats = run_recorder(cam, dir.path().to_path_buf(), 5, Duration::from_secs(1), stop_rx).await;

        assert_eq!(stats.connection_attempts, 1);
        assert_eq!(stats.reconnects, 0);
    }
}
