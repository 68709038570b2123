// src/overlay/engine.rs
//
// Per-frame detection overlay with tracker interpolation between
// detections.
//
// Per object id:
//
//   Uninitialized -> Detected -> Interpolating -> {Interpolating, Lost}
//
//   - A detection is applied on the first frame whose timestamp is >= its
//     own: the box is drawn and a fresh tracker is seeded on it.
//   - Frames with no new detection advance every Interpolating tracker.
//     A failed update (or failed seed) makes the object Lost; Lost is
//     terminal for the rest of the clip and never affects other objects.
//   - Trackers always see the undrawn frame; boxes are painted afterwards.
//
// Frame timestamps are `origin + position / fps`, where `origin` is the
// wall-clock time of the clip's first decoded frame.

use chrono::{DateTime, Utc};
use opencv::{core::Rect, prelude::*};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::overlay::draw::{draw_box, BoxMapper, BoxStyle};
use crate::overlay::tracker::{TrackerFactory, VisualTracker};
use crate::pipeline::context::TaskContext;
use crate::types::{Detection, DrawPolicy, OverlayConfig, TimeRange};
use crate::video_processor::{frame_offset, FrameRead, FrameSink, FrameSource, ReadWatchdog};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackPhase {
    Uninitialized,
    Detected,
    Interpolating,
    Lost,
}

struct Track {
    phase: TrackPhase,
    tracker: Option<Box<dyn VisualTracker>>,
}

impl Track {
    fn new() -> Self {
        Self {
            phase: TrackPhase::Uninitialized,
            tracker: None,
        }
    }

    fn lose(&mut self) {
        self.phase = TrackPhase::Lost;
        self.tracker = None;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OverlayStats {
    pub frames_read: u64,
    pub frames_written: u64,
    pub detection_boxes: u64,
    pub tracked_boxes: u64,
    pub detections_dropped: u64,
    pub objects_lost: u64,
    pub read_failures: u64,
    pub terminated_early: bool,
    pub final_phases: BTreeMap<i64, TrackPhase>,
}

#[derive(Debug, Clone)]
pub enum OverlayOutcome {
    /// Nothing to draw; the clip should be written as-is.
    Unmodified { detections_dropped: u64 },
    Annotated(OverlayStats),
}

pub struct OverlayEngine<'a, F: TrackerFactory> {
    config: &'a OverlayConfig,
    trackers: &'a F,
    mapper: BoxMapper,
    style: BoxStyle,
}

impl<'a, F: TrackerFactory> OverlayEngine<'a, F> {
    pub fn new(config: &'a OverlayConfig, trackers: &'a F) -> Self {
        Self {
            config,
            trackers,
            mapper: BoxMapper::new(config.flip_bbox_xy),
            style: BoxStyle::from_config(config),
        }
    }

    /// Keep detections inside `range`, ordered by timestamp. Returns the
    /// queue and how many were dropped.
    pub fn filter_detections(
        &self,
        ctx: &TaskContext,
        detections: &[Detection],
        range: &TimeRange,
    ) -> (VecDeque<Detection>, u64) {
        let mut kept = Vec::with_capacity(detections.len());
        let mut dropped = 0;
        for det in detections {
            if range.contains(det.timestamp) {
                kept.push(det.clone());
            } else {
                warn!(
                    parent: ctx.span(),
                    object_id = det.object_id,
                    "Dropping detection at {} outside {}",
                    det.timestamp,
                    range
                );
                dropped += 1;
            }
        }
        // Stable: same-timestamp detections keep their input order
        kept.sort_by_key(|d| d.timestamp);
        (kept.into(), dropped)
    }

    pub fn overlay(
        &self,
        ctx: &TaskContext,
        source: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
        detections: &[Detection],
        range: &TimeRange,
        origin: DateTime<Utc>,
    ) -> Result<OverlayOutcome> {
        let (mut queue, dropped) = self.filter_detections(ctx, detections, range);
        if queue.is_empty() {
            info!(parent: ctx.span(), dropped, "No detections in range, clip left unmodified");
            return Ok(OverlayOutcome::Unmodified {
                detections_dropped: dropped,
            });
        }

        info!(
            parent: ctx.span(),
            detections = queue.len(),
            dropped,
            tracker = %self.config.tracker,
            policy = ?self.config.draw_policy,
            "Starting overlay"
        );

        let fps = source.fps();
        let mut watchdog = ReadWatchdog::new(
            self.config.max_consecutive_read_failures,
            self.config.read_timeout(),
        );
        let mut tracks: BTreeMap<i64, Track> = BTreeMap::new();
        let mut stats = OverlayStats {
            detections_dropped: dropped,
            ..OverlayStats::default()
        };

        loop {
            ctx.check_cancelled()?;
            let frame = match source.next_frame()? {
                FrameRead::End => break,
                FrameRead::Failed => {
                    stats.read_failures += 1;
                    if watchdog.record_failure() {
                        error!(
                            parent: ctx.span(),
                            consecutive = watchdog.consecutive_failures(),
                            "Frame reads keep failing, ending overlay after {} frames",
                            stats.frames_written
                        );
                        stats.terminated_early = true;
                        break;
                    }
                    continue;
                }
                FrameRead::Frame(frame) => {
                    watchdog.record_success();
                    frame
                }
            };
            stats.frames_read += 1;

            let mut image = frame.image;
            let timestamp = origin + frame_offset(frame.position, fps);
            let (width, height) = (image.cols(), image.rows());

            let mut boxes: Vec<(Rect, i64)> = Vec::new();
            let mut new_detection = false;

            while queue.front().is_some_and(|d| d.timestamp <= timestamp) {
                let Some(det) = queue.pop_front() else { break };
                let track = tracks.entry(det.object_id).or_insert_with(Track::new);
                if track.phase == TrackPhase::Lost {
                    debug!(
                        parent: ctx.span(),
                        object_id = det.object_id,
                        "Ignoring detection for lost object"
                    );
                    continue;
                }

                let rect = self.mapper.to_pixel_rect(&det.bbox, width, height);
                track.phase = TrackPhase::Detected;
                boxes.push((rect, det.object_id));
                stats.detection_boxes += 1;
                new_detection = true;

                match self.seed(det.object_id, &image, rect) {
                    Ok(tracker) => {
                        track.tracker = Some(tracker);
                        track.phase = TrackPhase::Interpolating;
                    }
                    Err(e) => {
                        warn!(
                            parent: ctx.span(),
                            object_id = det.object_id,
                            "Tracker init failed, object lost: {}",
                            e
                        );
                        track.lose();
                        stats.objects_lost += 1;
                    }
                }
            }

            if !new_detection {
                for (&object_id, track) in tracks.iter_mut() {
                    if track.phase != TrackPhase::Interpolating {
                        continue;
                    }
                    let update = match track.tracker.as_mut() {
                        Some(tracker) => tracker.update(&image),
                        None => Ok(None),
                    };
                    match update {
                        Ok(Some(rect)) => {
                            boxes.push((rect, object_id));
                            stats.tracked_boxes += 1;
                        }
                        Ok(None) => {
                            debug!(
                                parent: ctx.span(),
                                object_id,
                                "Tracker lost target at {}",
                                timestamp
                            );
                            track.lose();
                            stats.objects_lost += 1;
                        }
                        Err(e) => {
                            warn!(parent: ctx.span(), object_id, "Tracker update failed: {}", e);
                            track.lose();
                            stats.objects_lost += 1;
                        }
                    }
                }
            }

            for (rect, object_id) in &boxes {
                draw_box(&mut image, *rect, *object_id, &self.style)?;
            }

            let emit = match self.config.draw_policy {
                DrawPolicy::Continuous => true,
                DrawPolicy::Sparse => new_detection,
            };
            if emit {
                sink.write_frame(&image)?;
                stats.frames_written += 1;
            }
        }

        if !queue.is_empty() {
            debug!(
                parent: ctx.span(),
                "{} detections were past the last decoded frame",
                queue.len()
            );
        }

        if stats.frames_written == 0 {
            warn!(
                parent: ctx.span(),
                frames_read = stats.frames_read,
                "Overlay produced no frames to write"
            );
        }

        stats.final_phases = tracks
            .iter()
            .map(|(&object_id, track)| (object_id, track.phase))
            .collect();

        info!(
            parent: ctx.span(),
            frames = stats.frames_written,
            detection_boxes = stats.detection_boxes,
            tracked_boxes = stats.tracked_boxes,
            lost = stats.objects_lost,
            "Overlay complete ({:.1}s of video)",
            stats.frames_read as f64 / fps.max(f64::EPSILON)
        );

        Ok(OverlayOutcome::Annotated(stats))
    }

    fn seed(
        &self,
        object_id: i64,
        frame: &opencv::core::Mat,
        rect: Rect,
    ) -> Result<Box<dyn VisualTracker>> {
        let mut tracker = self.trackers.create(object_id)?;
        tracker.init(frame, rect)?;
        Ok(tracker)
    }
}
