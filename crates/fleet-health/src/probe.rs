//! Metric collection and threshold evaluation.
//!
//! Probes run one composite shell command that prints `key=value` pairs;
//! the exact command strings are adapter-local detail and the parser is
//! deliberately tolerant of missing keys (a board without a thermal zone
//! simply reports no temperature).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleet_config::Thresholds;
use fleet_types::{AlertCategory, HealthLevel};

/// Composite metrics command for servers and hosts: utilization plus free
/// disk, emitted as `key=value` pairs on one line.
pub const METRICS_COMMAND: &str = concat!(
    "cpu=$(awk -v c=$(nproc) '{printf \"%.1f\", $1*100/c}' /proc/loadavg); ",
    "mem=$(free | awk '/Mem:/ {printf \"%.1f\", $3*100/$2}'); ",
    "storage=$(df -P / | awk 'NR==2 {print $5}' | tr -d %); ",
    "free_gb=$(df -BG -P / | awk 'NR==2 {print $4}' | tr -d G); ",
    "echo \"cpu=$cpu mem=$mem storage=$storage free_gb=$free_gb\""
);

/// Board variant: adds SoC temperature when the thermal zone exists.
pub const BOARD_METRICS_COMMAND: &str = concat!(
    "storage=$(df -P / | awk 'NR==2 {print $5}' | tr -d %); ",
    "temp=$(awk '{printf \"%.1f\", $1/1000}' /sys/class/thermal/thermal_zone0/temp 2>/dev/null); ",
    "echo \"storage=$storage temp=$temp\""
);

/// Parsed metric sample. Every field is optional; evaluation only judges
/// what was observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub storage_percent: Option<f64>,
    pub free_disk_gb: Option<f64>,
    pub temperature_celsius: Option<f64>,
}

/// Parse `key=value` pairs out of probe output.
pub fn parse_metrics(output: &str) -> MetricSample {
    let mut sample = MetricSample::default();
    for token in output.split_whitespace() {
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        let Ok(parsed) = value.parse::<f64>() else {
            continue;
        };
        match key {
            "cpu" => sample.cpu_percent = Some(parsed),
            "mem" => sample.memory_percent = Some(parsed),
            "storage" => sample.storage_percent = Some(parsed),
            "free_gb" => sample.free_disk_gb = Some(parsed),
            "temp" => sample.temperature_celsius = Some(parsed),
            _ => {}
        }
    }
    sample
}

/// One threshold judgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckFinding {
    pub category: AlertCategory,
    pub level: HealthLevel,
    pub message: String,
}

/// Evaluate a sample against thresholds. The resulting level is the worst
/// individual finding; an empty findings list means healthy.
pub fn evaluate(
    sample: &MetricSample,
    response_time: Duration,
    thresholds: &Thresholds,
) -> (HealthLevel, Vec<CheckFinding>) {
    let mut findings = Vec::new();

    let mut judge = |value: Option<f64>,
                     warn: f64,
                     crit: f64,
                     higher_is_worse: bool,
                     category: AlertCategory,
                     what: &str,
                     unit: &str| {
        let Some(value) = value else {
            return;
        };
        let level = if higher_is_worse {
            if value >= crit {
                HealthLevel::Unhealthy
            } else if value >= warn {
                HealthLevel::Degraded
            } else {
                HealthLevel::Healthy
            }
        } else if value <= crit {
            HealthLevel::Unhealthy
        } else if value <= warn {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        };
        if level != HealthLevel::Healthy {
            findings.push(CheckFinding {
                category,
                level,
                message: format!("{} {}{}", what, value, unit),
            });
        }
    };

    judge(
        sample.cpu_percent,
        thresholds.cpu_warning_percent,
        thresholds.cpu_critical_percent,
        true,
        AlertCategory::Utilization,
        "cpu",
        "%",
    );
    judge(
        sample.memory_percent,
        thresholds.memory_warning_percent,
        thresholds.memory_critical_percent,
        true,
        AlertCategory::Utilization,
        "memory",
        "%",
    );
    judge(
        sample.storage_percent,
        thresholds.storage_warning_percent,
        thresholds.storage_critical_percent,
        true,
        AlertCategory::Utilization,
        "storage",
        "%",
    );
    judge(
        sample.free_disk_gb,
        thresholds.disk_space_warning_gb,
        thresholds.disk_space_critical_gb,
        false,
        AlertCategory::Capacity,
        "free disk",
        "GB",
    );
    judge(
        sample.temperature_celsius,
        thresholds.temperature_warning_celsius,
        thresholds.temperature_critical_celsius,
        true,
        AlertCategory::Temperature,
        "temperature",
        "C",
    );
    judge(
        Some(response_time.as_millis() as f64),
        thresholds.response_time_warning_ms as f64,
        thresholds.response_time_critical_ms as f64,
        true,
        AlertCategory::Connectivity,
        "response time",
        "ms",
    );

    let level = findings
        .iter()
        .fold(HealthLevel::Healthy, |acc, f| acc.worst(f.level));
    (level, findings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> Duration {
        Duration::from_millis(40)
    }

    #[test]
    fn parse_full_sample() {
        let sample = parse_metrics("cpu=12.5 mem=40.2 storage=71 free_gb=120 temp=48.0");
        assert_eq!(sample.cpu_percent, Some(12.5));
        assert_eq!(sample.memory_percent, Some(40.2));
        assert_eq!(sample.storage_percent, Some(71.0));
        assert_eq!(sample.free_disk_gb, Some(120.0));
        assert_eq!(sample.temperature_celsius, Some(48.0));
    }

    #[test]
    fn parse_tolerates_missing_and_garbage() {
        let sample = parse_metrics("storage=55 temp= cpu=abc noise");
        assert_eq!(sample.storage_percent, Some(55.0));
        assert_eq!(sample.temperature_celsius, None);
        assert_eq!(sample.cpu_percent, None);
    }

    #[test]
    fn all_nominal_is_healthy() {
        let sample = parse_metrics("cpu=10 mem=20 storage=30 free_gb=200 temp=40");
        let (level, findings) = evaluate(&sample, fast(), &Thresholds::default());
        assert_eq!(level, HealthLevel::Healthy);
        assert!(findings.is_empty());
    }

    #[test]
    fn warning_threshold_degrades() {
        let sample = parse_metrics("cpu=86 mem=20 storage=30");
        let (level, findings) = evaluate(&sample, fast(), &Thresholds::default());
        assert_eq!(level, HealthLevel::Degraded);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].category, AlertCategory::Utilization);
    }

    #[test]
    fn critical_threshold_is_unhealthy() {
        let sample = parse_metrics("mem=96");
        let (level, _) = evaluate(&sample, fast(), &Thresholds::default());
        assert_eq!(level, HealthLevel::Unhealthy);
    }

    #[test]
    fn worst_finding_wins() {
        // One warning (cpu) plus one critical (storage): unhealthy overall.
        let sample = parse_metrics("cpu=86 storage=97");
        let (level, findings) = evaluate(&sample, fast(), &Thresholds::default());
        assert_eq!(level, HealthLevel::Unhealthy);
        assert_eq!(findings.len(), 2);
    }

    #[test]
    fn low_free_disk_uses_inverted_comparison() {
        let warn = parse_metrics("free_gb=8");
        let (level, findings) = evaluate(&warn, fast(), &Thresholds::default());
        assert_eq!(level, HealthLevel::Degraded);
        assert_eq!(findings[0].category, AlertCategory::Capacity);

        let crit = parse_metrics("free_gb=4");
        let (level, _) = evaluate(&crit, fast(), &Thresholds::default());
        assert_eq!(level, HealthLevel::Unhealthy);
    }

    #[test]
    fn board_temperature_scenario() {
        // 72C with warn=70/crit=85: degraded with a temperature finding.
        let sample = parse_metrics("storage=40 temp=72");
        let (level, findings) = evaluate(&sample, fast(), &Thresholds::default());
        assert_eq!(level, HealthLevel::Degraded);
        assert!(
            findings
                .iter()
                .any(|f| f.category == AlertCategory::Temperature)
        );
    }

    #[test]
    fn slow_response_degrades_connectivity() {
        let sample = MetricSample::default();
        let (level, findings) =
            evaluate(&sample, Duration::from_millis(6_000), &Thresholds::default());
        assert_eq!(level, HealthLevel::Degraded);
        assert_eq!(findings[0].category, AlertCategory::Connectivity);

        let (level, _) = evaluate(&sample, Duration::from_millis(11_000), &Thresholds::default());
        assert_eq!(level, HealthLevel::Unhealthy);
    }

    #[test]
    fn per_asset_override_changes_judgement() {
        let tight = Thresholds {
            cpu_warning_percent: 50.0,
            ..Thresholds::default()
        };
        let sample = parse_metrics("cpu=60");
        let (default_level, _) = evaluate(&sample, fast(), &Thresholds::default());
        assert_eq!(default_level, HealthLevel::Healthy);
        let (tight_level, _) = evaluate(&sample, fast(), &tight);
        assert_eq!(tight_level, HealthLevel::Degraded);
    }
}
