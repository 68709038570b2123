// src/types.rs

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, SnippetError};
use crate::overlay::tracker::TrackerKind;

/// Segment file stem layout, e.g. `2023-01-19T17-09-30Z`.
pub const SEGMENT_DATE_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";
pub const SEGMENT_SUFFIX: &str = ".mp4";

const LOG_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub segments: SegmentConfig,
    #[serde(default)]
    pub assembly: AssemblyConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the duration of the newest segment is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    /// Recording finished: min(probed duration, nominal length).
    Closed,
    /// Newest file still being written: now - start - safety margin.
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    pub nominal_duration_secs: u64,
    pub mode: IndexMode,
    pub live_safety_margin_secs: f64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            nominal_duration_secs: 600, // recorder rolls files every 10 min
            mode: IndexMode::Closed,
            live_safety_margin_secs: 3.0,
        }
    }
}

impl SegmentConfig {
    pub fn nominal_duration(&self) -> Duration {
        Duration::seconds(self.nominal_duration_secs as i64)
    }

    pub fn live_safety_margin(&self) -> Duration {
        secs_f64(self.live_safety_margin_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyConfig {
    /// Four-character codec code handed to the video writer.
    pub fourcc: String,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            fourcc: "avc1".to_string(),
        }
    }
}

/// Which frames the overlay pass emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrawPolicy {
    /// Every frame, with whatever boxes apply to it.
    Continuous,
    /// Only frames on which a detection box was newly drawn.
    Sparse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    pub tracker: TrackerKind,
    /// Producer sends boxes with x/y swapped relative to the frame axes.
    pub flip_bbox_xy: bool,
    pub draw_policy: DrawPolicy,
    pub box_color_bgr: [u8; 3],
    pub box_thickness: i32,
    pub draw_labels: bool,
    pub max_consecutive_read_failures: u32,
    pub read_timeout_secs: f64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerKind::Kcf,
            flip_bbox_xy: true,
            draw_policy: DrawPolicy::Continuous,
            box_color_bgr: [0, 255, 0],
            box_thickness: 2,
            draw_labels: true,
            max_consecutive_read_failures: 5,
            read_timeout_secs: 10.0,
        }
    }
}

impl OverlayConfig {
    pub fn read_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.read_timeout_secs.max(0.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub timeout_secs: u64,
    pub max_concurrent: usize,
    /// Ranges shorter than this get `pre_roll_secs` of extra lead-in.
    pub min_duration_secs: f64,
    pub pre_roll_secs: f64,
    /// A range ending this close to "now" waits for the recorder to flush.
    pub live_edge_guard_secs: f64,
    pub live_edge_delay_secs: f64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 900,
            max_concurrent: 1,
            min_duration_secs: 10.0,
            pre_roll_secs: 5.0,
            live_edge_guard_secs: 10.0,
            live_edge_delay_secs: 15.0,
        }
    }
}

impl TaskConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ============================================================================
// TIME
// ============================================================================

pub fn secs_f64(secs: f64) -> Duration {
    Duration::microseconds((secs * 1_000_000.0).round() as i64)
}

pub fn as_secs_f64(duration: Duration) -> f64 {
    match duration.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => duration.num_milliseconds() as f64 / 1_000.0,
    }
}

/// Half-open window `[start, end)` with `end > start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end <= start {
            return Err(SnippetError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        self.start <= timestamp && timestamp < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} ({:.3}s)",
            self.start.format(LOG_TIME_FORMAT),
            self.end.format(LOG_TIME_FORMAT),
            as_secs_f64(self.duration())
        )
    }
}

// ============================================================================
// SEGMENTS
// ============================================================================

/// One recorded file, identified by the start time in its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: DateTime<Utc>,
    pub duration: Duration,
}

impl Segment {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + self.duration
    }

    /// `timestamp` falls inside `[start, start + duration)`.
    pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
        timestamp >= self.start && timestamp - self.start < self.duration
    }

    pub fn file_name(&self) -> String {
        format!("{}{}", self.start.format(SEGMENT_DATE_FORMAT), SEGMENT_SUFFIX)
    }

    pub fn path_in(&self, folder: &Path) -> PathBuf {
        folder.join(self.file_name())
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} ({:.3}s)",
            self.start.format(LOG_TIME_FORMAT),
            self.end().format(LOG_TIME_FORMAT),
            as_secs_f64(self.duration)
        )
    }
}

// ============================================================================
// DETECTIONS & TASKS
// ============================================================================

/// Box edges as fractions of the frame, in the producer's axis convention.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizedBox {
    pub top: f32,
    pub left: f32,
    pub bottom: f32,
    pub right: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    #[serde(with = "chrono::serde::ts_nanoseconds")]
    pub timestamp: DateTime<Utc>,
    pub object_id: i64,
    #[serde(rename = "box")]
    pub bbox: NormalizedBox,
}

/// One snippet request, as handed over by the event listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub cam_folder: PathBuf,
    #[serde(with = "chrono::serde::ts_nanoseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_nanoseconds")]
    pub end_time: DateTime<Utc>,
    pub output_file: PathBuf,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

impl Task {
    pub fn range(&self) -> Result<TimeRange> {
        TimeRange::new(self.start_time, self.end_time)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} - {}] -> {} ({} detections)",
            self.cam_folder.display(),
            self.start_time.format(LOG_TIME_FORMAT),
            self.end_time.format(LOG_TIME_FORMAT),
            self.output_file.display(),
            self.detections.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::at;

    #[test]
    fn test_time_range_rejects_non_positive_span() {
        assert!(TimeRange::new(at(0, 10, 0), at(0, 10, 0)).is_err());
        assert!(TimeRange::new(at(0, 10, 0), at(0, 9, 59)).is_err());
        assert!(TimeRange::new(at(0, 10, 0), at(0, 10, 1)).is_ok());
    }

    #[test]
    fn test_time_range_is_half_open() {
        let range = TimeRange::new(at(0, 0, 0), at(0, 1, 0)).unwrap();
        assert!(range.contains(at(0, 0, 0)));
        assert!(range.contains(at(0, 0, 59)));
        assert!(!range.contains(at(0, 1, 0)));
    }

    #[test]
    fn test_segment_file_name_round_trips_format() {
        let seg = Segment {
            start: at(17, 9, 30),
            duration: Duration::minutes(10),
        };
        assert_eq!(seg.file_name(), "2023-01-19T17-09-30Z.mp4");
        assert_eq!(seg.end(), at(17, 19, 30));
    }

    #[test]
    fn test_segment_boundary_belongs_to_next() {
        let seg = Segment {
            start: at(0, 0, 0),
            duration: Duration::minutes(10),
        };
        assert!(seg.contains(at(0, 9, 59)));
        assert!(!seg.contains(at(0, 10, 0)));
        assert!(!seg.contains(at(0, 0, 0) - Duration::seconds(1)));
    }

    #[test]
    fn test_task_parses_listener_json() {
        let json = r#"{
            "camFolder": "/videos/2023-01-19/B8A44F3C4792",
            "startTime": 1674148170000000000,
            "endTime": 1674148200000000000,
            "outputFile": "/snippets/out.mp4",
            "detections": [
                {"timestamp": 1674148171500000000, "objectId": 42,
                 "box": {"top": 0.1, "left": 0.2, "bottom": 0.5, "right": 0.6}}
            ]
        }"#;

        let task: Task = serde_json::from_str(json).unwrap();
        assert_eq!(task.start_time, at(17, 9, 30));
        assert_eq!(task.end_time, at(17, 10, 0));
        assert_eq!(task.detections.len(), 1);
        assert_eq!(task.detections[0].object_id, 42);
        assert_eq!(
            task.detections[0].timestamp,
            at(17, 9, 31) + Duration::milliseconds(500)
        );
        assert_eq!(task.detections[0].bbox.left, 0.2);
        assert!(task.range().is_ok());
    }

    #[test]
    fn test_config_sections_default_when_missing() {
        let cfg: Config = serde_yaml::from_str("segments:\n  nominal_duration_secs: 300\n  mode: live\n  live_safety_margin_secs: 2.0\n").unwrap();
        assert_eq!(cfg.segments.mode, IndexMode::Live);
        assert_eq!(cfg.segments.nominal_duration(), Duration::minutes(5));
        assert_eq!(cfg.overlay.draw_policy, DrawPolicy::Continuous);
        assert!(cfg.overlay.flip_bbox_xy);
    }
}
