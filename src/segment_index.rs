//! Segment Index (C4): discovers finalized segments on disk and filters out
//! today's (still-open) segments, disabled cameras, and already-processed
//! files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};

/// A finalized video file produced by a recorder, as seen by the indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub path: PathBuf,
    pub camera_id: String,
    pub filename: String,
    pub capture_date: NaiveDate,
    pub start_ts: chrono::NaiveDateTime,
    pub size_bytes: u64,
}

/// Walks `<videos_root>/YYYYMMDD/<camera_id>/*` and returns segments ordered
/// oldest-first, applying filters F1 (not today), F2 (camera enabled or
/// allow-listed), F3 (not already in the session table).
pub fn discover_segments(
    videos_root: &Path,
    eligible_camera_ids: &HashSet<String>,
    already_processed: &dyn Fn(&str, &str) -> bool,
) -> std::io::Result<Vec<Segment>> {
    let today = Local::now().date_naive();
    let mut out = Vec::new();

    if !videos_root.is_dir() {
        return Ok(out);
    }

    for date_entry in std::fs::read_dir(videos_root)? {
        let date_entry = date_entry?;
        if !date_entry.file_type()?.is_dir() {
            continue;
        }
        let date_name = date_entry.file_name().to_string_lossy().to_string();
        let capture_date = match NaiveDate::parse_from_str(&date_name, "%Y%m%d") {
            Ok(d) => d,
            Err(_) => continue,
        };

        // F1: today's segments are assumed to still be open.
        if capture_date >= today {
            continue;
        }

        for cam_entry in std::fs::read_dir(date_entry.path())? {
            let cam_entry = cam_entry?;
            if !cam_entry.file_type()?.is_dir() {
                continue;
            }
            let camera_id = cam_entry.file_name().to_string_lossy().to_string();

            // F2: camera is enabled, or explicitly allow-listed.
            if !eligible_camera_ids.contains(&camera_id) {
                continue;
            }

            for file_entry in std::fs::read_dir(cam_entry.path())? {
                let file_entry = file_entry?;
                if !file_entry.file_type()?.is_file() {
                    continue;
                }
                let filename = file_entry.file_name().to_string_lossy().to_string();

                // F3: not already processed.
                if already_processed(&camera_id, &filename) {
                    continue;
                }

                let start_ts = match parse_start_ts(&camera_id, &filename) {
                    Some(ts) => ts,
                    None => continue,
                };

                let size_bytes = file_entry.metadata()?.len();
                out.push(Segment {
                    path: file_entry.path(),
                    camera_id,
                    filename,
                    capture_date,
                    start_ts,
                    size_bytes,
                });
            }
        }
    }

    // Older first, to minimize processing backlog age.
    out.sort_by_key(|s| s.start_ts);
    Ok(out)
}

/// Parses `<camera_id>_YYYYMMDD_HHMMSS[.ext]` into a timestamp.
fn parse_start_ts(camera_id: &str, filename: &str) -> Option<chrono::NaiveDateTime> {
    let stem = filename.rsplit_once('.').map(|(s, _)| s).unwrap_or(filename);
    let rest = stem.strip_prefix(camera_id)?.strip_prefix('_')?;
    let (date_part, time_part) = rest.split_once('_')?;
    let combined = format!("{date_part}{time_part}");
    chrono::NaiveDateTime::parse_from_str(&combined, "%Y%m%d%H%M%S").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"fake mp4 bytes").unwrap();
    }

    #[test]
    fn excludes_today_includes_yesterday_unprocessed_only() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("videos");

        let today = Local::now().date_naive().format("%Y%m%d").to_string();
        let yesterday = (Local::now().date_naive() - chrono::Duration::days(1)).format("%Y%m%d").to_string();

        touch(&root.join(&today).join("camera_35").join(format!("camera_35_{today}_120000.mp4")));
        touch(&root.join(&yesterday).join("camera_35").join(format!("camera_35_{yesterday}_120000.mp4")));
        touch(&root.join(&yesterday).join("camera_35").join(format!("camera_35_{yesterday}_130000.mp4")));

        let processed_file = format!("camera_35_{yesterday}_120000.mp4");
        let mut enabled = HashSet::new();
        enabled.insert("camera_35".to_string());

        let segments = discover_segments(&root, &enabled, &|_cam, file| file == processed_file).unwrap();

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].filename, format!("camera_35_{yesterday}_130000.mp4"));
    }

    #[test]
    fn sorts_oldest_first() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("videos");
        let d = (Local::now().date_naive() - chrono::Duration::days(1)).format("%Y%m%d").to_string();

        touch(&root.join(&d).join("cam1").join(format!("cam1_{d}_150000.mp4")));
        touch(&root.join(&d).join("cam1").join(format!("cam1_{d}_090000.mp4")));

        let mut enabled = HashSet::new();
        enabled.insert("cam1".to_string());
        let segments = discover_segments(&root, &enabled, &|_, _| false).unwrap();

        assert_eq!(segments.len(), 2);
        assert!(segments[0].start_ts < segments[1].start_ts);
    }

    #[test]
    fn disabled_camera_is_filtered_out() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("videos");
        let d = (Local::now().date_naive() - chrono::Duration::days(1)).format("%Y%m%d").to_string();
        touch(&root.join(&d).join("cam_other").join(format!("cam_other_{d}_090000.mp4")));

        let enabled = HashSet::new();
        let segments = discover_segments(&root, &enabled, &|_, _| false).unwrap();
        assert!(segments.is_empty());
    }

    #[test]
    fn allow_listed_but_disabled_camera_backlog_is_still_discovered() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("videos");
        let d = (Local::now().date_naive() - chrono::Duration::days(1)).format("%Y%m%d").to_string();
        touch(&root.join(&d).join("cam_retired").join(format!("cam_retired_{d}_090000.mp4")));

        // cam_retired isn't in the enabled set, but it is explicitly
        // allow-listed (F2's OR clause), so its backlog must still surface.
        let mut eligible = HashSet::new();
        eligible.insert("cam_retired".to_string());
        let segments = discover_segments(&root, &eligible, &|_, _| false).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].camera_id, "cam_retired");
    }
}
