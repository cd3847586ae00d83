//! One named record per table — no dynamic-typed rows.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_id: String,
    pub camera_id: String,
    pub video_filename: String,
    pub video_id: Option<i64>,
    pub location_id: String,
    pub config_file_path: String,
    pub roi_version: Option<String>,
    pub start_time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionCompletion {
    pub session_id: String,
    pub end_time: DateTime<Utc>,
    pub total_frames: i64,
    pub fps: f64,
    pub resolution: String,
    pub processing_status: String,
    pub processing_time_seconds: f64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivisionState {
    Red,
    Yellow,
    Green,
}

impl DivisionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DivisionState::Red => "RED",
            DivisionState::Yellow => "YELLOW",
            DivisionState::Green => "GREEN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RED" => Some(DivisionState::Red),
            "YELLOW" => Some(DivisionState::Yellow),
            "GREEN" => Some(DivisionState::Green),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    Idle,
    Busy,
    Cleaning,
}

impl TableState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableState::Idle => "IDLE",
            TableState::Busy => "BUSY",
            TableState::Cleaning => "CLEANING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(TableState::Idle),
            "BUSY" => Some(TableState::Busy),
            "CLEANING" => Some(TableState::Cleaning),
            _ => None,
        }
    }
}

/// A buffered division-event row, pre-flush. Mirrors the field set the
/// analysis runner emits per frame.
#[derive(Debug, Clone)]
pub struct DivisionEventRow {
    pub session_id: String,
    pub camera_id: String,
    pub location_id: String,
    pub frame_number: i64,
    pub timestamp_video: f64,
    pub timestamp_recorded: DateTime<Utc>,
    pub state: DivisionState,
    pub walking_area_waiters: i64,
    pub service_area_waiters: i64,
    pub screenshot_path: Option<String>,
}

impl DivisionEventRow {
    pub fn total_staff(&self) -> i64 {
        self.walking_area_waiters + self.service_area_waiters
    }
}

#[derive(Debug, Clone)]
pub struct TableEventRow {
    pub session_id: String,
    pub camera_id: String,
    pub location_id: String,
    pub frame_number: i64,
    pub timestamp_video: f64,
    pub timestamp_recorded: DateTime<Utc>,
    pub table_id: String,
    pub state: TableState,
    pub customers_count: i64,
    pub waiters_count: i64,
    pub screenshot_path: Option<String>,
}

/// A synced-back-from-the-store division event, used by the cloud replicator.
#[derive(Debug, Clone)]
pub struct StoredDivisionEvent {
    pub id: i64,
    pub row: DivisionEventRow,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoredTableEvent {
    pub id: i64,
    pub row: TableEventRow,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewVideo {
    pub camera_id: String,
    pub video_filename: String,
    pub video_date: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
    pub file_size_bytes: i64,
    pub fps: f64,
    pub resolution: String,
    pub storage_location: String,
}
