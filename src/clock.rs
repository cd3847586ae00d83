//! Pure time-window evaluation. No I/O, no clock reads — callers pass `now`.

use chrono::{DateTime, Local, Timelike};

use crate::config::{CaptureWindow, ProcessingWindow};

/// Converts a local timestamp to minutes-since-local-midnight.
fn minutes_of_day(now: DateTime<Local>) -> u32 {
    now.hour() * 60 + now.minute()
}

/// Finds the unique capture window containing `now`, if any. Windows are
/// half-open `[start, end)`; ties are impossible given the non-overlap
/// invariant enforced at config load time.
pub fn active_capture_window(now: DateTime<Local>, windows: &[CaptureWindow]) -> Option<CaptureWindow> {
    let m = minutes_of_day(now);
    windows
        .iter()
        .copied()
        .find(|w| w.start_minutes() <= m && m < w.end_minutes())
}

/// Whether `now` falls inside the given processing window.
pub fn in_processing_window(now: DateTime<Local>, window: &ProcessingWindow) -> bool {
    let m = minutes_of_day(now);
    window.start_minutes() <= m && m < window.end_minutes()
}

/// Seconds remaining until `window`'s end, from `now`. Used to size a
/// recorder's total capture duration for the current window.
pub fn remaining_seconds(now: DateTime<Local>, window: &CaptureWindow) -> i64 {
    let m = minutes_of_day(now) as i64;
    let end = window.end_minutes() as i64;
    ((end - m) * 60 - now.second() as i64).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        let today = Local::now().date_naive();
        Local
            .from_local_datetime(&today.and_hms_opt(h, m, s).unwrap())
            .unwrap()
    }

    fn window(sh: u32, sm: u32, eh: u32, em: u32) -> CaptureWindow {
        CaptureWindow { start_h: sh, start_m: sm, end_h: eh, end_m: em }
    }

    #[test]
    fn finds_the_containing_window() {
        let windows = vec![window(11, 30, 14, 0), window(17, 0, 23, 0)];
        assert_eq!(active_capture_window(at(13, 0, 0), &windows), Some(windows[0]));
        assert_eq!(active_capture_window(at(18, 0, 0), &windows), Some(windows[1]));
    }

    #[test]
    fn start_is_inclusive_end_is_exclusive() {
        let windows = vec![window(11, 30, 14, 0)];
        assert_eq!(active_capture_window(at(11, 30, 0), &windows), Some(windows[0]));
        assert_eq!(active_capture_window(at(14, 0, 0), &windows), None);
    }

    #[test]
    fn outside_every_window_is_none() {
        let windows = vec![window(11, 30, 14, 0)];
        assert_eq!(active_capture_window(at(9, 0, 0), &windows), None);
        assert_eq!(active_capture_window(at(20, 0, 0), &windows), None);
    }

    #[test]
    fn remaining_seconds_counts_down_to_the_boundary() {
        let w = window(11, 30, 14, 0);
        let secs = remaining_seconds(at(13, 59, 59), &w);
        assert_eq!(secs, 1);
    }

    #[test]
    fn remaining_seconds_never_negative_past_the_boundary() {
        let w = window(11, 30, 14, 0);
        assert_eq!(remaining_seconds(at(14, 0, 1), &w), 0);
    }

    #[test]
    fn processing_window_is_half_open() {
        let w = ProcessingWindow { start_h: 2, end_h: 6 };
        assert!(in_processing_window(at(2, 0, 0), &w));
        assert!(!in_processing_window(at(6, 0, 0), &w));
        assert!(!in_processing_window(at(1, 59, 59), &w));
    }
}
