// src/pipeline/task.rs
//
// One snippet request end to end:
//
//   prepare  -> pre-roll short ranges, delay ranges at the live edge
//   index    -> segments in the camera folder
//   check    -> query inside indexed coverage
//   resolve  -> minimal covering run of segments
//   assemble -> clip plan with per-segment sub-ranges
//   write    -> plain copy, or overlay pass when detections are attached
//
// Every failure is logged under the task span with its category and
// counted; it never affects other tasks. A task cancelled by the runner's
// timeout is counted there and nowhere else.

use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::assembler::{Clip, CopyStats, SnippetAssembler};
use crate::error::{Result, SnippetError};
use crate::overlay::{OverlayEngine, OverlayOutcome, OverlayStats};
use crate::pipeline::context::{CancelFlag, Clock, TaskContext};
use crate::pipeline::metrics::SnippetMetrics;
use crate::segments::{resolve, MediaProbe, SegmentIndexer};
use crate::types::{as_secs_f64, secs_f64, Config, Segment, Task, TaskConfig, TimeRange};
use crate::video_processor::{FrameSource, ReadWatchdog, VideoFileSink};

// ============================================================================
// PREPARATION
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTask {
    pub task: Task,
    /// Wait this long before indexing so the recorder can flush the live file.
    pub delay: Option<std::time::Duration>,
}

pub struct TaskPlanner {
    config: TaskConfig,
}

impl TaskPlanner {
    pub fn new(config: TaskConfig) -> Self {
        Self { config }
    }

    pub fn prepare(&self, mut task: Task, now: DateTime<Utc>) -> PreparedTask {
        let requested = task.end_time - task.start_time;
        if requested > chrono::Duration::zero()
            && requested < secs_f64(self.config.min_duration_secs)
        {
            task.start_time = task.start_time - secs_f64(self.config.pre_roll_secs);
            info!(
                "Range of {:.3}s is short, starting {:.1}s earlier",
                as_secs_f64(requested),
                self.config.pre_roll_secs
            );
        }

        let delay = if now - task.end_time < secs_f64(self.config.live_edge_guard_secs) {
            let delay = std::time::Duration::from_secs_f64(self.config.live_edge_delay_secs);
            info!(
                "Range ends within {:.1}s of now, waiting {:.1}s for the recorder",
                self.config.live_edge_guard_secs,
                delay.as_secs_f64()
            );
            Some(delay)
        } else {
            None
        };

        PreparedTask { task, delay }
    }
}

// ============================================================================
// GENERATION
// ============================================================================

#[derive(Debug, Clone)]
pub enum TaskReport {
    Copied {
        stats: CopyStats,
        detections_dropped: u64,
    },
    Annotated(OverlayStats),
}

impl TaskReport {
    pub fn frames_written(&self) -> u64 {
        match self {
            Self::Copied { stats, .. } => stats.frames_written,
            Self::Annotated(stats) => stats.frames_written,
        }
    }
}

pub struct SnippetGenerator {
    config: Config,
    probe: Arc<dyn MediaProbe>,
    clock: Arc<dyn Clock>,
    metrics: SnippetMetrics,
}

impl SnippetGenerator {
    pub fn new(
        config: Config,
        probe: Arc<dyn MediaProbe>,
        clock: Arc<dyn Clock>,
        metrics: SnippetMetrics,
    ) -> Self {
        Self {
            config,
            probe,
            clock,
            metrics,
        }
    }

    pub fn metrics(&self) -> &SnippetMetrics {
        &self.metrics
    }

    pub fn process_task(&self, task: &Task, cancel: &CancelFlag) -> Result<TaskReport> {
        let ctx = TaskContext::new(
            &task.cam_folder,
            task.start_time,
            task.end_time,
            self.clock.clone(),
        )
        .with_cancel(cancel.clone());
        info!(parent: ctx.span(), "Processing {}", task);

        let result = self.run(&ctx, task);
        if ctx.is_cancelled() {
            warn!(
                parent: ctx.span(),
                "Abandoned after timeout, {} may be incomplete",
                task.output_file.display()
            );
            return result;
        }

        match result {
            Ok(report) => {
                match &report {
                    TaskReport::Copied {
                        stats,
                        detections_dropped,
                    } => {
                        self.metrics.record_copy(stats);
                        self.metrics.record_dropped(*detections_dropped);
                    }
                    TaskReport::Annotated(stats) => self.metrics.record_overlay(stats),
                }
                if report.frames_written() == 0 {
                    warn!(
                        parent: ctx.span(),
                        "No frames written, {} was not created",
                        task.output_file.display()
                    );
                } else {
                    info!(
                        parent: ctx.span(),
                        frames = report.frames_written(),
                        "Snippet ready: {}",
                        task.output_file.display()
                    );
                }
                Ok(report)
            }
            Err(e) => {
                error!(
                    parent: ctx.span(),
                    category = %e.category(),
                    "Snippet for {} failed: {}",
                    task.cam_folder.display(),
                    e
                );
                self.metrics.record_failure(e.category());
                Err(e)
            }
        }
    }

    fn run(&self, ctx: &TaskContext, task: &Task) -> Result<TaskReport> {
        let range = task.range()?;
        let clip = self.build_clip(ctx, ctx.camera_folder(), &range)?;

        if let Some(parent) = task.output_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| SnippetError::io(parent, e))?;
            }
        }

        let fourcc = &self.config.assembly.fourcc;
        if task.detections.is_empty() {
            let stats = clip.write_to(ctx, &task.output_file, fourcc, self.watchdog())?;
            return Ok(TaskReport::Copied {
                stats,
                detections_dropped: 0,
            });
        }

        let overlay = &self.config.overlay;
        let engine = OverlayEngine::new(overlay, &overlay.tracker);
        let mut source = clip.open()?;
        let mut sink = VideoFileSink::new(&task.output_file, fourcc, source.fps());

        match engine.overlay(
            ctx,
            &mut source,
            &mut sink,
            &task.detections,
            clip.range(),
            clip.origin(),
        )? {
            OverlayOutcome::Annotated(stats) => {
                sink.finish()?;
                Ok(TaskReport::Annotated(stats))
            }
            OverlayOutcome::Unmodified { detections_dropped } => {
                drop(source);
                let stats = clip.write_to(ctx, &task.output_file, fourcc, self.watchdog())?;
                Ok(TaskReport::Copied {
                    stats,
                    detections_dropped,
                })
            }
        }
    }

    /// Index, coverage-check, resolve and assemble `range` from `folder`.
    pub fn build_clip(&self, ctx: &TaskContext, folder: &Path, range: &TimeRange) -> Result<Clip> {
        let segments =
            SegmentIndexer::new(&self.config.segments, self.probe.as_ref()).index(ctx, folder)?;
        check_coverage(&segments, range)?;

        let resolved = resolve(ctx, &segments, range);
        if resolved.is_empty() {
            return Err(SnippetError::NoOverlap(*range));
        }

        SnippetAssembler::new(self.probe.as_ref()).assemble(ctx, folder, &resolved, range)
    }

    fn watchdog(&self) -> ReadWatchdog {
        ReadWatchdog::new(
            self.config.overlay.max_consecutive_read_failures,
            self.config.overlay.read_timeout(),
        )
    }
}

/// Reject queries that start before the first segment or end after the last.
pub fn check_coverage(segments: &[Segment], range: &TimeRange) -> Result<()> {
    let (Some(first), Some(last)) = (segments.first(), segments.last()) else {
        return Err(SnippetError::NoOverlap(*range));
    };
    if range.start() < first.start || range.end() > last.end() {
        return Err(SnippetError::OutsideCoverage {
            query: *range,
            first_start: first.start,
            last_end: last.end(),
        });
    }
    Ok(())
}
