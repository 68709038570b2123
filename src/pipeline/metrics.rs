// src/pipeline/metrics.rs
//
// Run-wide counters shared by every task worker. Cloning shares the same
// counters; the runner logs `summary()` once all tasks are done.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::assembler::CopyStats;
use crate::error::ErrorCategory;
use crate::overlay::OverlayStats;

#[derive(Debug, Clone)]
pub struct SnippetMetrics {
    pub tasks_succeeded: Arc<AtomicU64>,
    pub tasks_failed: Arc<AtomicU64>,
    pub tasks_timed_out: Arc<AtomicU64>,
    pub config_errors: Arc<AtomicU64>,
    pub range_errors: Arc<AtomicU64>,
    pub assembly_errors: Arc<AtomicU64>,
    pub io_errors: Arc<AtomicU64>,
    pub frames_written: Arc<AtomicU64>,
    pub detection_boxes: Arc<AtomicU64>,
    pub tracked_boxes: Arc<AtomicU64>,
    pub detections_dropped: Arc<AtomicU64>,
    pub objects_lost: Arc<AtomicU64>,
    pub partial_outputs: Arc<AtomicU64>,
    pub empty_outputs: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl Default for SnippetMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SnippetMetrics {
    pub fn new() -> Self {
        Self {
            tasks_succeeded: Arc::new(AtomicU64::new(0)),
            tasks_failed: Arc::new(AtomicU64::new(0)),
            tasks_timed_out: Arc::new(AtomicU64::new(0)),
            config_errors: Arc::new(AtomicU64::new(0)),
            range_errors: Arc::new(AtomicU64::new(0)),
            assembly_errors: Arc::new(AtomicU64::new(0)),
            io_errors: Arc::new(AtomicU64::new(0)),
            frames_written: Arc::new(AtomicU64::new(0)),
            detection_boxes: Arc::new(AtomicU64::new(0)),
            tracked_boxes: Arc::new(AtomicU64::new(0)),
            detections_dropped: Arc::new(AtomicU64::new(0)),
            objects_lost: Arc::new(AtomicU64::new(0)),
            partial_outputs: Arc::new(AtomicU64::new(0)),
            empty_outputs: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }

    fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_copy(&self, stats: &CopyStats) {
        Self::add(&self.tasks_succeeded, 1);
        Self::add(&self.frames_written, stats.frames_written);
        self.record_output_shape(stats.frames_written, stats.terminated_early);
    }

    pub fn record_overlay(&self, stats: &OverlayStats) {
        Self::add(&self.tasks_succeeded, 1);
        Self::add(&self.frames_written, stats.frames_written);
        Self::add(&self.detection_boxes, stats.detection_boxes);
        Self::add(&self.tracked_boxes, stats.tracked_boxes);
        Self::add(&self.detections_dropped, stats.detections_dropped);
        Self::add(&self.objects_lost, stats.objects_lost);
        self.record_output_shape(stats.frames_written, stats.terminated_early);
    }

    fn record_output_shape(&self, frames_written: u64, terminated_early: bool) {
        if frames_written == 0 {
            Self::add(&self.empty_outputs, 1);
        } else if terminated_early {
            Self::add(&self.partial_outputs, 1);
        }
    }

    pub fn record_dropped(&self, detections_dropped: u64) {
        Self::add(&self.detections_dropped, detections_dropped);
    }

    pub fn record_failure(&self, category: ErrorCategory) {
        let counter = match category {
            ErrorCategory::Config => &self.config_errors,
            ErrorCategory::Range => &self.range_errors,
            ErrorCategory::Assembly => &self.assembly_errors,
            // Tracker errors are recovered per object and never fail a task
            ErrorCategory::Io | ErrorCategory::Tracker => &self.io_errors,
            // Already counted by the runner as a timeout
            ErrorCategory::Cancelled => return,
        };
        Self::add(&self.tasks_failed, 1);
        Self::add(counter, 1);
    }

    pub fn record_timeout(&self) {
        Self::add(&self.tasks_timed_out, 1);
    }

    pub fn summary(&self) -> MetricsSummary {
        let load = |c: &Arc<AtomicU64>| c.load(Ordering::Relaxed);
        MetricsSummary {
            tasks_succeeded: load(&self.tasks_succeeded),
            tasks_failed: load(&self.tasks_failed),
            tasks_timed_out: load(&self.tasks_timed_out),
            config_errors: load(&self.config_errors),
            range_errors: load(&self.range_errors),
            assembly_errors: load(&self.assembly_errors),
            io_errors: load(&self.io_errors),
            frames_written: load(&self.frames_written),
            detection_boxes: load(&self.detection_boxes),
            tracked_boxes: load(&self.tracked_boxes),
            detections_dropped: load(&self.detections_dropped),
            objects_lost: load(&self.objects_lost),
            partial_outputs: load(&self.partial_outputs),
            empty_outputs: load(&self.empty_outputs),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_timed_out: u64,
    pub config_errors: u64,
    pub range_errors: u64,
    pub assembly_errors: u64,
    pub io_errors: u64,
    pub frames_written: u64,
    pub detection_boxes: u64,
    pub tracked_boxes: u64,
    pub detections_dropped: u64,
    pub objects_lost: u64,
    pub partial_outputs: u64,
    pub empty_outputs: u64,
    pub elapsed_secs: f64,
}
