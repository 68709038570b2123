// src/testing.rs
//
// Test doubles for the clock, media probe, segment decoder, frame
// source/sink and tracker seams, plus small time helpers. Compiled for tests only.

use chrono::{DateTime, Duration, TimeZone, Utc};
use opencv::{
    core::{Mat, Rect, Scalar, Vec3b, CV_8UC3},
    prelude::*,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Result, SnippetError};
use crate::overlay::tracker::{TrackerFactory, VisualTracker};
use crate::pipeline::context::{Clock, TaskContext};
use crate::segments::MediaProbe;
use crate::types::Segment;
use crate::video_processor::{
    Decoded, FrameRead, FrameSink, FrameSource, SegmentDecoder, SegmentOpener, SourceFrame,
};

/// 2023-01-19 at `h:m:s` UTC.
pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 1, 19, h, m, s).unwrap()
}

pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub fn ctx_at(now: DateTime<Utc>) -> TaskContext {
    TaskContext::new(Path::new("/cam"), now, now, Arc::new(FixedClock(now)))
}

pub fn ten_minute_segments(starts: &[DateTime<Utc>]) -> Vec<Segment> {
    starts
        .iter()
        .map(|&start| Segment {
            start,
            duration: Duration::minutes(10),
        })
        .collect()
}

// ============================================================================
// PROBES
// ============================================================================

pub struct FixedProbe(pub Duration);

impl MediaProbe for FixedProbe {
    fn duration(&self, _path: &Path) -> Result<Duration> {
        Ok(self.0)
    }
}

/// Per-file durations keyed by file name, with a fallback.
pub struct NamedProbe {
    fallback: Duration,
    by_name: HashMap<String, Duration>,
}

impl NamedProbe {
    pub fn new(fallback: Duration) -> Self {
        Self {
            fallback,
            by_name: HashMap::new(),
        }
    }

    pub fn with(mut self, file_name: &str, duration: Duration) -> Self {
        self.by_name.insert(file_name.to_string(), duration);
        self
    }
}

impl MediaProbe for NamedProbe {
    fn duration(&self, path: &Path) -> Result<Duration> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(self.by_name.get(&name).copied().unwrap_or(self.fallback))
    }
}

// ============================================================================
// FRAMES
// ============================================================================

pub const FRAME_SIZE: i32 = 64;

pub fn blank_frame() -> Mat {
    Mat::new_rows_cols_with_default(FRAME_SIZE, FRAME_SIZE, CV_8UC3, Scalar::all(0.0)).unwrap()
}

/// Frame whose first pixel is `(tag, index, 0)`, so tests can tell which
/// file and frame it was decoded from.
pub fn tagged_frame(tag: u8, index: u8) -> Mat {
    Mat::new_rows_cols_with_default(
        FRAME_SIZE,
        FRAME_SIZE,
        CV_8UC3,
        Scalar::new(tag as f64, index as f64, 0.0, 0.0),
    )
    .unwrap()
}

pub fn frame_tag(frame: &Mat) -> (u8, u8) {
    let px = frame.at_2d::<Vec3b>(0, 0).unwrap();
    (px.0[0], px.0[1])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    Frame,
    Fail,
}

/// Plays back a fixed script of good and failed reads.
pub struct SyntheticSource {
    script: VecDeque<Scripted>,
    fps: f64,
    position: u64,
}

impl SyntheticSource {
    pub fn frames(count: usize, fps: f64) -> Self {
        Self::scripted(vec![Scripted::Frame; count], fps)
    }

    pub fn scripted(script: Vec<Scripted>, fps: f64) -> Self {
        Self {
            script: script.into(),
            fps,
            position: 0,
        }
    }
}

impl FrameSource for SyntheticSource {
    fn fps(&self) -> f64 {
        self.fps
    }

    fn next_frame(&mut self) -> Result<FrameRead> {
        let Some(step) = self.script.pop_front() else {
            return Ok(FrameRead::End);
        };
        let position = self.position;
        self.position += 1;
        Ok(match step {
            Scripted::Frame => FrameRead::Frame(SourceFrame {
                image: blank_frame(),
                position,
            }),
            Scripted::Fail => FrameRead::Failed,
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub frames: Vec<Mat>,
}

impl FrameSink for RecordingSink {
    fn write_frame(&mut self, frame: &Mat) -> Result<()> {
        let copy = frame
            .try_clone()
            .map_err(|e| SnippetError::media("recording sink", e))?;
        self.frames.push(copy);
        Ok(())
    }
}

// ============================================================================
// SEGMENT FILES
// ============================================================================

struct FakeFile {
    tag: u8,
    frames: u64,
    missing: HashSet<u64>,
}

/// In-memory segment files keyed by file name. Each holds `frames` real
/// frames; reads past them report end of stream.
pub struct FakeSegments {
    fps: f64,
    files: HashMap<String, FakeFile>,
    pub opened: Mutex<Vec<String>>,
}

impl FakeSegments {
    pub fn new(fps: f64) -> Self {
        Self {
            fps,
            files: HashMap::new(),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn file(mut self, name: &str, tag: u8, frames: u64) -> Self {
        self.files.insert(
            name.to_string(),
            FakeFile {
                tag,
                frames,
                missing: HashSet::new(),
            },
        );
        self
    }

    /// Make frame `index` of `name` undecodable.
    pub fn missing(mut self, name: &str, index: u64) -> Self {
        if let Some(file) = self.files.get_mut(name) {
            file.missing.insert(index);
        }
        self
    }
}

impl SegmentOpener for FakeSegments {
    fn open(&self, path: &Path) -> Result<Box<dyn SegmentDecoder>> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let file = self
            .files
            .get(&name)
            .ok_or_else(|| SnippetError::io(path, "failed to open video file"))?;
        self.opened.lock().unwrap().push(name);
        Ok(Box::new(FakeDecoder {
            fps: self.fps,
            tag: file.tag,
            frames: file.frames,
            missing: file.missing.clone(),
            next: 0,
        }))
    }
}

struct FakeDecoder {
    fps: f64,
    tag: u8,
    frames: u64,
    missing: HashSet<u64>,
    next: u64,
}

impl SegmentDecoder for FakeDecoder {
    fn fps(&self) -> f64 {
        self.fps
    }

    fn seek_frame(&mut self, index: u64) -> Result<()> {
        self.next = index;
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Decoded> {
        if self.next >= self.frames {
            return Ok(Decoded::EndOfStream);
        }
        let index = self.next;
        self.next += 1;
        if self.missing.contains(&index) {
            return Ok(Decoded::Missing);
        }
        Ok(Decoded::Frame(tagged_frame(self.tag, index as u8)))
    }
}

// ============================================================================
// TRACKERS
// ============================================================================

/// Trackers that hold their seed box still. Objects can be scripted to
/// fail init, or to fail after a number of successful updates.
#[derive(Default)]
pub struct FakeTrackerFactory {
    failing_inits: HashSet<i64>,
    updates_before_failure: HashMap<i64, u32>,
    pub created: Mutex<Vec<i64>>,
}

impl FakeTrackerFactory {
    pub fn fail_init_for(mut self, object_id: i64) -> Self {
        self.failing_inits.insert(object_id);
        self
    }

    pub fn fail_update_after(mut self, object_id: i64, successes: u32) -> Self {
        self.updates_before_failure.insert(object_id, successes);
        self
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl TrackerFactory for FakeTrackerFactory {
    fn create(&self, object_id: i64) -> Result<Box<dyn VisualTracker>> {
        self.created.lock().unwrap().push(object_id);
        Ok(Box::new(FakeTracker {
            rect: None,
            fail_init: self.failing_inits.contains(&object_id),
            updates_left: self.updates_before_failure.get(&object_id).copied(),
        }))
    }
}

struct FakeTracker {
    rect: Option<Rect>,
    fail_init: bool,
    updates_left: Option<u32>,
}

impl VisualTracker for FakeTracker {
    fn init(&mut self, _frame: &Mat, rect: Rect) -> Result<()> {
        if self.fail_init {
            return Err(SnippetError::tracker("scripted init failure"));
        }
        self.rect = Some(rect);
        Ok(())
    }

    fn update(&mut self, _frame: &Mat) -> Result<Option<Rect>> {
        match self.updates_left.as_mut() {
            Some(0) => Ok(None),
            Some(left) => {
                *left -= 1;
                Ok(self.rect)
            }
            None => Ok(self.rect),
        }
    }
}
