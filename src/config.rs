use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, SurveillanceError};

/// Top-level configuration loaded from `cameras_config.toml` + `system_settings.toml`.
#[derive(Debug, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub cameras: Vec<CameraConfig>,
    pub schedule: ScheduleConfig,
    pub gpu: GpuThresholds,
    pub dispatcher: DispatcherConfig,
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub disk: DiskWatchdogConfig,
}

#[derive(Debug, Deserialize, Clone)]
struct CamerasFile {
    cameras: Vec<CameraConfig>,
}

#[derive(Debug, Deserialize, Clone)]
struct SystemSettingsFile {
    storage: StorageConfig,
    schedule: ScheduleConfig,
    #[serde(default)]
    gpu: GpuThresholds,
    #[serde(default)]
    dispatcher: DispatcherConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    sync: SyncConfig,
    #[serde(default)]
    disk: DiskWatchdogConfig,
}

/// Where on disk the appliance keeps segments, the local store, and logs.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub root: PathBuf,
    #[serde(default = "default_segment_secs")]
    pub segment_secs: u64,
}

fn default_segment_secs() -> u64 {
    60
}

/// Transport used when connecting to a camera's RTSP endpoint.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Default for Transport {
    fn default() -> Self {
        Transport::Tcp
    }
}

/// Per-camera configuration. Identity is `camera_id`; duplicates are an error at load.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CameraConfig {
    /// Unique identifier; also the directory name under `videos_root`.
    pub camera_id: String,
    /// Human-readable label shown in status output, if set.
    pub display_name: Option<String>,
    /// RTSP host (IP or hostname).
    pub host: String,
    #[serde(default = "default_rtsp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Path component of the RTSP URL, e.g. `/stream1`.
    pub stream_path: String,
    #[serde(default)]
    pub transport: Transport,
    pub width: u32,
    pub height: u32,
    /// Whether the capture supervisor records this camera. A disabled
    /// camera's existing backlog can still be drained via
    /// `DispatcherConfig::backlog_allow_list`.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_rtsp_port() -> u16 {
    554
}

fn default_enabled() -> bool {
    true
}

impl CameraConfig {
    /// RTSP URL as `rtsp://<user>:<pw>@<host>:<port><stream_path>`.
    pub fn rtsp_url(&self) -> String {
        format!(
            "rtsp://{}:{}@{}:{}{}",
            self.username, self.password, self.host, self.port, self.stream_path
        )
    }
}

/// A daily local-time capture interval, half-open `[start, end)`.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct CaptureWindow {
    pub start_h: u32,
    pub start_m: u32,
    pub end_h: u32,
    pub end_m: u32,
}

impl CaptureWindow {
    pub fn start_minutes(&self) -> u32 {
        self.start_h * 60 + self.start_m
    }

    pub fn end_minutes(&self) -> u32 {
        self.end_h * 60 + self.end_m
    }
}

/// A daily local-time interval during which the dispatcher drains the backlog.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingWindow {
    pub start_h: u32,
    pub end_h: u32,
}

impl ProcessingWindow {
    pub fn start_minutes(&self) -> u32 {
        self.start_h * 60
    }

    pub fn end_minutes(&self) -> u32 {
        self.end_h * 60
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    pub capture_windows: Vec<CaptureWindow>,
    pub processing_window: ProcessingWindow,
}

/// Classification thresholds for GPU-aware worker scaling (see `gpu.rs`).
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct GpuThresholds {
    #[serde(default = "default_sample_interval_secs")]
    pub sample_interval_secs: u64,
    #[serde(default = "default_scale_up_max_temp")]
    pub scale_up_max_temp_c: f64,
    #[serde(default = "default_scale_up_max_util")]
    pub scale_up_max_util_pct: f64,
    #[serde(default = "default_scale_up_min_free_gb")]
    pub scale_up_min_free_gb: f64,
    #[serde(default = "default_scale_down_min_temp")]
    pub scale_down_min_temp_c: f64,
    #[serde(default = "default_scale_down_min_util")]
    pub scale_down_min_util_pct: f64,
    #[serde(default = "default_scale_down_max_free_gb")]
    pub scale_down_max_free_gb: f64,
    #[serde(default = "default_emergency_temp")]
    pub emergency_temp_c: f64,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_emergency_pause_secs")]
    pub emergency_pause_secs: u64,
}

impl Default for GpuThresholds {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval_secs(),
            scale_up_max_temp_c: default_scale_up_max_temp(),
            scale_up_max_util_pct: default_scale_up_max_util(),
            scale_up_min_free_gb: default_scale_up_min_free_gb(),
            scale_down_min_temp_c: default_scale_down_min_temp(),
            scale_down_min_util_pct: default_scale_down_min_util(),
            scale_down_max_free_gb: default_scale_down_max_free_gb(),
            emergency_temp_c: default_emergency_temp(),
            cooldown_secs: default_cooldown_secs(),
            emergency_pause_secs: default_emergency_pause_secs(),
        }
    }
}

fn default_sample_interval_secs() -> u64 {
    30
}
fn default_scale_up_max_temp() -> f64 {
    70.0
}
fn default_scale_up_max_util() -> f64 {
    70.0
}
fn default_scale_up_min_free_gb() -> f64 {
    2.0
}
fn default_scale_down_min_temp() -> f64 {
    75.0
}
fn default_scale_down_min_util() -> f64 {
    85.0
}
fn default_scale_down_max_free_gb() -> f64 {
    1.0
}
fn default_emergency_temp() -> f64 {
    80.0
}
fn default_cooldown_secs() -> u64 {
    60
}
fn default_emergency_pause_secs() -> u64 {
    120
}

/// Worker pool sizing for the processing dispatcher.
#[derive(Debug, Deserialize, Clone)]
pub struct DispatcherConfig {
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_job_stop_timeout_secs")]
    pub job_stop_timeout_secs: u64,
    /// Camera ids whose already-captured backlog should still be drained by
    /// the processing dispatcher even while `enabled = false` for capture.
    /// F2's explicit allow-list clause — a camera taken out of rotation
    /// doesn't forfeit footage it already recorded.
    #[serde(default)]
    pub backlog_allow_list: Vec<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            job_stop_timeout_secs: default_job_stop_timeout_secs(),
            backlog_allow_list: Vec::new(),
        }
    }
}

fn default_min_workers() -> usize {
    1
}
fn default_max_workers() -> usize {
    6
}
fn default_job_stop_timeout_secs() -> u64 {
    300
}

/// Local store batching and retention knobs.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct StoreConfig {
    #[serde(default = "default_event_batch_size")]
    pub event_batch_size: usize,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            event_batch_size: default_event_batch_size(),
            retention_hours: default_retention_hours(),
        }
    }
}

fn default_event_batch_size() -> usize {
    100
}
fn default_retention_hours() -> i64 {
    24
}

/// Cloud replication schedule and batch size.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_sync_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_hourly_window_hours")]
    pub hourly_window_hours: i64,
    #[serde(default = "default_sync_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval_secs(),
            batch_size: default_sync_batch_size(),
            hourly_window_hours: default_hourly_window_hours(),
            request_timeout_secs: default_sync_timeout_secs(),
        }
    }
}

fn default_sync_interval_secs() -> u64 {
    3600
}
fn default_sync_batch_size() -> usize {
    1000
}
fn default_hourly_window_hours() -> i64 {
    2
}
fn default_sync_timeout_secs() -> u64 {
    30
}

/// Age-based pruning of raw video directories, independent of the event store.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct DiskWatchdogConfig {
    #[serde(default = "default_min_free_gb")]
    pub min_free_gb: f64,
    #[serde(default = "default_raw_max_age_days")]
    pub raw_max_age_days: i64,
    #[serde(default = "default_watchdog_interval_secs")]
    pub interval_secs: u64,
}

impl Default for DiskWatchdogConfig {
    fn default() -> Self {
        Self {
            min_free_gb: default_min_free_gb(),
            raw_max_age_days: default_raw_max_age_days(),
            interval_secs: default_watchdog_interval_secs(),
        }
    }
}

fn default_min_free_gb() -> f64 {
    150.0
}
fn default_raw_max_age_days() -> i64 {
    2
}
fn default_watchdog_interval_secs() -> u64 {
    3600
}

/// A polygon as a list of (x, y) vertices in the reference frame's pixel space.
pub type Polygon = Vec<(f64, f64)>;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TableRoi {
    pub table_id: String,
    pub polygon: Polygon,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SittingAreaRoi {
    pub table_id: String,
    pub polygon: Polygon,
}

/// Per-camera region-of-interest configuration, loaded from JSON.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RoiConfig {
    pub camera_id: String,
    pub reference_width: u32,
    pub reference_height: u32,
    pub division_polygon: Polygon,
    pub tables: Vec<TableRoi>,
    pub sitting_areas: Vec<SittingAreaRoi>,
    pub service_areas: Vec<Polygon>,
}

impl RoiConfig {
    fn validate(&self) -> Result<()> {
        if self.division_polygon.len() < 3 {
            return Err(SurveillanceError::Config(format!(
                "camera '{}': division polygon needs >= 3 vertices",
                self.camera_id
            )));
        }
        for t in &self.tables {
            if t.polygon.len() < 3 {
                return Err(SurveillanceError::Config(format!(
                    "camera '{}': table '{}' polygon needs >= 3 vertices",
                    self.camera_id, t.table_id
                )));
            }
        }
        for sa in &self.sitting_areas {
            if sa.polygon.len() < 3 {
                return Err(SurveillanceError::Config(format!(
                    "camera '{}': sitting area for table '{}' needs >= 3 vertices",
                    self.camera_id, sa.table_id
                )));
            }
            if !self.tables.iter().any(|t| t.table_id == sa.table_id) {
                return Err(SurveillanceError::Config(format!(
                    "camera '{}': sitting area references unknown table '{}'",
                    self.camera_id, sa.table_id
                )));
            }
        }
        for sv in &self.service_areas {
            if sv.len() < 3 {
                return Err(SurveillanceError::Config(format!(
                    "camera '{}': service area polygon needs >= 3 vertices",
                    self.camera_id
                )));
            }
        }
        Ok(())
    }
}

impl Config {
    /// Load `cameras_config.toml` and `system_settings.toml` from `config_dir`.
    pub fn from_dir(config_dir: &Path) -> Result<Self> {
        let cameras_path = config_dir.join("cameras_config.toml");
        let settings_path = config_dir.join("system_settings.toml");

        let cameras_raw = std::fs::read_to_string(&cameras_path)
            .map_err(|e| SurveillanceError::Config(format!("cannot read {}: {e}", cameras_path.display())))?;
        let cameras_file: CamerasFile = toml::from_str(&cameras_raw)
            .map_err(|e| SurveillanceError::Config(format!("invalid TOML in {}: {e}", cameras_path.display())))?;

        let settings_raw = std::fs::read_to_string(&settings_path)
            .map_err(|e| SurveillanceError::Config(format!("cannot read {}: {e}", settings_path.display())))?;
        let settings: SystemSettingsFile = toml::from_str(&settings_raw)
            .map_err(|e| SurveillanceError::Config(format!("invalid TOML in {}: {e}", settings_path.display())))?;

        let config = Config {
            storage: settings.storage,
            cameras: cameras_file.cameras,
            schedule: settings.schedule,
            gpu: settings.gpu,
            dispatcher: settings.dispatcher,
            store: settings.store,
            sync: settings.sync,
            disk: settings.disk,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(SurveillanceError::Config("no cameras defined".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for cam in &self.cameras {
            if !seen.insert(cam.camera_id.clone()) {
                return Err(SurveillanceError::Config(format!(
                    "duplicate camera_id '{}'",
                    cam.camera_id
                )));
            }
            if Ipv4Addr::from_str(&cam.host).is_err() && cam.host.parse::<std::net::Ipv6Addr>().is_err() {
                // Hostnames are allowed too; only reject obviously malformed dotted-quad attempts.
                if cam.host.chars().all(|c| c.is_ascii_digit() || c == '.') && Ipv4Addr::from_str(&cam.host).is_err() {
                    return Err(SurveillanceError::Config(format!(
                        "camera '{}': malformed IP address '{}'",
                        cam.camera_id, cam.host
                    )));
                }
            }
            if cam.port == 0 {
                return Err(SurveillanceError::Config(format!(
                    "camera '{}': port out of range",
                    cam.camera_id
                )));
            }
        }

        let mut windows = self.schedule.capture_windows.clone();
        windows.sort_by_key(|w| w.start_minutes());
        for pair in windows.windows(2) {
            if pair[0].end_minutes() > pair[1].start_minutes() {
                return Err(SurveillanceError::Config(
                    "capture windows overlap".into(),
                ));
            }
        }
        for w in &windows {
            if w.start_minutes() >= w.end_minutes() {
                return Err(SurveillanceError::Config(
                    "capture window start must precede end".into(),
                ));
            }
        }

        if self.storage.segment_secs == 0 {
            return Err(SurveillanceError::Config("segment_secs must be > 0".into()));
        }
        if self.dispatcher.min_workers == 0 {
            return Err(SurveillanceError::Config("min_workers must be > 0".into()));
        }
        if self.dispatcher.max_workers < self.dispatcher.min_workers {
            return Err(SurveillanceError::Config(
                "max_workers must be >= min_workers".into(),
            ));
        }

        Ok(())
    }

    /// Directory holding raw segments: `<root>/videos`.
    pub fn videos_root(&self) -> PathBuf {
        self.storage.root.join("videos")
    }

    /// Directory holding processed artifacts: `<root>/results`.
    pub fn results_root(&self) -> PathBuf {
        self.storage.root.join("results")
    }

    /// Local store directory: `<root>/db`.
    pub fn db_root(&self) -> PathBuf {
        self.storage.root.join("db")
    }

    /// Log directory: `<root>/logs`.
    pub fn logs_root(&self) -> PathBuf {
        self.storage.root.join("logs")
    }
}

/// Loads every camera's ROI config from `<config_dir>/roi/<camera_id>_roi.json`,
/// migrating a legacy single `<config_dir>/roi/roi_config.json` by aliasing it to
/// the first enabled camera when no per-camera file exists for that camera yet.
pub fn load_roi_configs(config_dir: &Path, cameras: &[CameraConfig]) -> Result<HashMap<String, RoiConfig>> {
    let roi_dir = config_dir.join("roi");
    let mut out = HashMap::new();

    let legacy_path = roi_dir.join("roi_config.json");
    let legacy: Option<RoiConfig> = if legacy_path.exists() {
        let raw = std::fs::read_to_string(&legacy_path)
            .map_err(|e| SurveillanceError::Config(format!("cannot read {}: {e}", legacy_path.display())))?;
        Some(serde_json::from_str(&raw).map_err(|e| {
            SurveillanceError::Config(format!("invalid legacy ROI JSON in {}: {e}", legacy_path.display()))
        })?)
    } else {
        None
    };

    for cam in cameras {
        let per_camera_path = roi_dir.join(format!("{}_roi.json", cam.camera_id));
        if per_camera_path.exists() {
            let raw = std::fs::read_to_string(&per_camera_path).map_err(|e| {
                SurveillanceError::Config(format!("cannot read {}: {e}", per_camera_path.display()))
            })?;
            let mut roi: RoiConfig = serde_json::from_str(&raw).map_err(|e| {
                SurveillanceError::Config(format!("invalid ROI JSON in {}: {e}", per_camera_path.display()))
            })?;
            roi.camera_id = cam.camera_id.clone();
            roi.validate()?;
            out.insert(cam.camera_id.clone(), roi);
        } else if let Some(legacy) = &legacy {
            // Legacy migration: the single pre-existing ROI file is silently aliased
            // to the first enabled camera that has no per-camera file of its own.
            let is_first_enabled = cameras
                .iter()
                .find(|c| c.enabled)
                .map(|c| c.camera_id == cam.camera_id)
                .unwrap_or(false);
            if is_first_enabled && !out.contains_key(&cam.camera_id) {
                let mut roi = legacy.clone();
                roi.camera_id = cam.camera_id.clone();
                roi.validate()?;
                out.insert(cam.camera_id.clone(), roi);
            }
        }
    }

    for cam in cameras {
        if cam.enabled && !out.contains_key(&cam.camera_id) {
            return Err(SurveillanceError::Config(format!(
                "camera '{}' has no ROI configuration",
                cam.camera_id
            )));
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(id: &str) -> CameraConfig {
        CameraConfig {
            camera_id: id.to_string(),
            display_name: None,
            host: "192.0.2.1".to_string(),
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

    fn window(start_h: u32, start_m: u32, end_h: u32, end_m: u32) -> CaptureWindow {
        CaptureWindow { start_h, start_m, end_h, end_m }
    }

    fn base_config(cameras: Vec<CameraConfig>, capture_windows: Vec<CaptureWindow>) -> Config {
        Config {
            storage: StorageConfig { root: PathBuf::from("/tmp/surveillance"), segment_secs: 60 },
            cameras,
            schedule: ScheduleConfig {
                capture_windows,
                processing_window: ProcessingWindow { start_h: 2, end_h: 6 },
            },
            gpu: GpuThresholds::default(),
            dispatcher: DispatcherConfig::default(),
            store: StoreConfig::default(),
            sync: SyncConfig::default(),
            disk: DiskWatchdogConfig::default(),
        }
    }

    #[test]
    fn a_single_camera_with_one_window_is_valid() {
        let config = base_config(vec![camera("cam1")], vec![window(8, 0, 20, 0)]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn duplicate_camera_id_is_rejected() {
        let config = base_config(vec![camera("cam1"), camera("cam1")], vec![window(8, 0, 20, 0)]);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate camera_id"), "unexpected error: {err}");
    }

    #[test]
    fn overlapping_capture_windows_are_rejected() {
        let config = base_config(vec![camera("cam1")], vec![window(8, 0, 14, 0), window(13, 0, 20, 0)]);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("overlap"), "unexpected error: {err}");
    }

    #[test]
    fn back_to_back_non_overlapping_windows_are_accepted() {
        let config = base_config(vec![camera("cam1")], vec![window(8, 0, 14, 0), window(14, 0, 20, 0)]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn a_window_that_ends_before_it_starts_is_rejected() {
        let config = base_config(vec![camera("cam1")], vec![window(20, 0, 8, 0)]);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("start must precede end"), "unexpected error: {err}");
    }

    #[test]
    fn no_cameras_is_rejected() {
        let config = base_config(vec![], vec![window(8, 0, 20, 0)]);
        assert!(config.validate().is_err());
    }

    fn roi(camera_id: &str) -> RoiConfig {
        RoiConfig {
            camera_id: camera_id.to_string(),
            reference_width: 1920,
            reference_height: 1080,
            division_polygon: vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)],
            tables: vec![TableRoi { table_id: "t1".to_string(), polygon: vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)] }],
            sitting_areas: vec![],
            service_areas: vec![],
        }
    }

    #[test]
    fn a_well_formed_roi_is_valid() {
        assert!(roi("cam1").validate().is_ok());
    }

    #[test]
    fn a_division_polygon_with_fewer_than_three_vertices_is_rejected() {
        let mut r = roi("cam1");
        r.division_polygon = vec![(0.0, 0.0), (1.0, 1.0)];
        let err = r.validate().unwrap_err().to_string();
        assert!(err.contains(">= 3 vertices"), "unexpected error: {err}");
    }

    #[test]
    fn a_table_polygon_with_fewer_than_three_vertices_is_rejected() {
        let mut r = roi("cam1");
        r.tables[0].polygon = vec![(0.0, 0.0)];
        let err = r.validate().unwrap_err().to_string();
        assert!(err.contains("table 't1'"), "unexpected error: {err}");
    }

    #[test]
    fn a_sitting_area_referencing_an_unknown_table_is_rejected() {
        let mut r = roi("cam1");
        r.sitting_areas = vec![SittingAreaRoi {
            table_id: "ghost_table".to_string(),
            polygon: vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)],
        }];
        let err = r.validate().unwrap_err().to_string();
        assert!(err.contains("references unknown table"), "unexpected error: {err}");
    }

    #[test]
    fn a_sitting_area_referencing_a_known_table_is_accepted() {
        let mut r = roi("cam1");
        r.sitting_areas =
            vec![SittingAreaRoi { table_id: "t1".to_string(), polygon: vec![(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)] }];
        assert!(r.validate().is_ok());
    }
}
