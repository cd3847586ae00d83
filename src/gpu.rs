//! GPU Telemetry (C5): samples GPU health via `nvidia-smi` and classifies
//! the sample into a scaling decision for the processing dispatcher.

use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::GpuThresholds;
use crate::error::{Result, SurveillanceError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuSample {
    pub temperature_c: f64,
    pub utilization_pct: f64,
    pub free_memory_gb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    ScaleUp,
    ScaleDown,
    Emergency,
    Hold,
}

/// Runs `nvidia-smi --query-gpu=... --format=csv,noheader,nounits` and parses
/// the single-GPU CSV line it prints.
pub async fn sample_gpu() -> Result<GpuSample> {
    let output = Command::new("nvidia-smi")
        .arg("--query-gpu=temperature.gpu,utilization.gpu,memory.used,memory.total,name")
        .arg("--format=csv,noheader,nounits")
        .output()
        .await
        .map_err(|e| SurveillanceError::Gpu(format!("failed to run nvidia-smi: {e}")))?;

    if !output.status.success() {
        return Err(SurveillanceError::Gpu(format!(
            "nvidia-smi exited with {:?}",
            output.status.code()
        )));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let line = text.lines().next().ok_or_else(|| SurveillanceError::Gpu("empty nvidia-smi output".into()))?;
    parse_csv_line(line)
}

fn parse_csv_line(line: &str) -> Result<GpuSample> {
    let parts: Vec<&str> = line.split(',').map(|p| p.trim()).collect();
    if parts.len() < 4 {
        return Err(SurveillanceError::Gpu(format!("unexpected nvidia-smi line: '{line}'")));
    }
    let temperature_c: f64 = parts[0]
        .parse()
        .map_err(|_| SurveillanceError::Gpu(format!("bad temperature field: '{}'", parts[0])))?;
    let utilization_pct: f64 = parts[1]
        .parse()
        .map_err(|_| SurveillanceError::Gpu(format!("bad utilization field: '{}'", parts[1])))?;
    let used_mb: f64 = parts[2]
        .parse()
        .map_err(|_| SurveillanceError::Gpu(format!("bad memory.used field: '{}'", parts[2])))?;
    let total_mb: f64 = parts[3]
        .parse()
        .map_err(|_| SurveillanceError::Gpu(format!("bad memory.total field: '{}'", parts[3])))?;
    let free_memory_gb = (total_mb - used_mb) / 1024.0;

    Ok(GpuSample { temperature_c, utilization_pct, free_memory_gb })
}

/// Classifies a sample against the configured thresholds. Scale-up is
/// conservative (every condition must hold); scale-down is aggressive (any
/// one suffices); emergency overrides both.
pub fn classify(sample: GpuSample, workers: usize, max_workers: usize, thresholds: &GpuThresholds) -> ScaleAction {
    if sample.temperature_c >= thresholds.emergency_temp_c {
        return ScaleAction::Emergency;
    }
    if sample.temperature_c > thresholds.scale_down_min_temp_c
        || sample.utilization_pct > thresholds.scale_down_min_util_pct
        || sample.free_memory_gb < thresholds.scale_down_max_free_gb
    {
        return ScaleAction::ScaleDown;
    }
    if sample.temperature_c < thresholds.scale_up_max_temp_c
        && sample.utilization_pct < thresholds.scale_up_max_util_pct
        && sample.free_memory_gb >= thresholds.scale_up_min_free_gb
        && workers < max_workers
    {
        return ScaleAction::ScaleUp;
    }
    ScaleAction::Hold
}

/// Rate-limits scaling decisions: a plain cooldown between any two actions,
/// plus a longer post-emergency pause that blocks scale-ups specifically.
pub struct ScalingClock {
    cooldown: std::time::Duration,
    emergency_pause: std::time::Duration,
    last_action: Option<Instant>,
    emergency_until: Option<Instant>,
}

impl ScalingClock {
    pub fn new(thresholds: &GpuThresholds) -> Self {
        Self {
            cooldown: std::time::Duration::from_secs(thresholds.cooldown_secs),
            emergency_pause: std::time::Duration::from_secs(thresholds.emergency_pause_secs),
            last_action: None,
            emergency_until: None,
        }
    }

    /// Given a raw classification, returns the action actually permitted
    /// right now (`Hold` if rate-limited).
    pub fn gate(&mut self, action: ScaleAction, now: Instant) -> ScaleAction {
        match action {
            ScaleAction::Emergency => {
                self.last_action = Some(now);
                self.emergency_until = Some(now + self.emergency_pause);
                warn!("gpu emergency: shrinking to minimum workers");
                ScaleAction::Emergency
            }
            ScaleAction::ScaleUp => {
                if let Some(until) = self.emergency_until {
                    if now < until {
                        debug!("scale-up suppressed: emergency pause still in effect");
                        return ScaleAction::Hold;
                    }
                }
                if self.cooldown_active(now) {
                    return ScaleAction::Hold;
                }
                self.last_action = Some(now);
                ScaleAction::ScaleUp
            }
            ScaleAction::ScaleDown => {
                if self.cooldown_active(now) {
                    return ScaleAction::Hold;
                }
                self.last_action = Some(now);
                ScaleAction::ScaleDown
            }
            ScaleAction::Hold => ScaleAction::Hold,
        }
    }

    fn cooldown_active(&self, now: Instant) -> bool {
        match self.last_action {
            Some(last) => now.duration_since(last) < self.cooldown,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> GpuThresholds {
        GpuThresholds::default()
    }

    #[test]
    fn parses_a_typical_nvidia_smi_line() {
        let sample = parse_csv_line("65, 50, 2048, 8192, NVIDIA GeForce RTX 3080").unwrap();
        assert_eq!(sample.temperature_c, 65.0);
        assert_eq!(sample.utilization_pct, 50.0);
        assert_eq!(sample.free_memory_gb, 6.0);
    }

    #[test]
    fn classifies_conservative_scale_up() {
        let sample = GpuSample { temperature_c: 65.0, utilization_pct: 50.0, free_memory_gb: 3.0 };
        assert_eq!(classify(sample, 1, 6, &thresholds()), ScaleAction::ScaleUp);
    }

    #[test]
    fn classifies_aggressive_scale_down_on_any_condition() {
        let sample = GpuSample { temperature_c: 76.0, utilization_pct: 10.0, free_memory_gb: 5.0 };
        assert_eq!(classify(sample, 3, 6, &thresholds()), ScaleAction::ScaleDown);
    }

    #[test]
    fn classifies_emergency_at_80c() {
        let sample = GpuSample { temperature_c: 81.0, utilization_pct: 40.0, free_memory_gb: 5.0 };
        assert_eq!(classify(sample, 6, 6, &thresholds()), ScaleAction::Emergency);
    }

    #[test]
    fn scale_up_blocked_once_at_max_workers() {
        let sample = GpuSample { temperature_c: 65.0, utilization_pct: 50.0, free_memory_gb: 3.0 };
        assert_eq!(classify(sample, 6, 6, &thresholds()), ScaleAction::Hold);
    }

    #[test]
    fn emergency_pause_blocks_scale_up_for_the_full_window() {
        let mut clock = ScalingClock::new(&thresholds());
        let t0 = Instant::now();
        assert_eq!(clock.gate(ScaleAction::Emergency, t0), ScaleAction::Emergency);
        assert_eq!(clock.gate(ScaleAction::ScaleUp, t0 + std::time::Duration::from_secs(90)), ScaleAction::Hold);
        assert_eq!(
            clock.gate(ScaleAction::ScaleUp, t0 + std::time::Duration::from_secs(121)),
            ScaleAction::ScaleUp
        );
    }

    #[test]
    fn cooldown_suppresses_rapid_scale_ups() {
        let mut clock = ScalingClock::new(&thresholds());
        let t0 = Instant::now();
        assert_eq!(clock.gate(ScaleAction::ScaleUp, t0), ScaleAction::ScaleUp);
        assert_eq!(clock.gate(ScaleAction::ScaleUp, t0 + std::time::Duration::from_secs(29)), ScaleAction::Hold);
        assert_eq!(
            clock.gate(ScaleAction::ScaleUp, t0 + std::time::Duration::from_secs(60)),
            ScaleAction::ScaleUp
        );
    }
}
