// src/video_processor.rs
//
// OpenCV-backed media access: probing segment durations, decoding frames
// from a segment at a frame offset, and writing the output snippet.
// Every capture/writer handle is owned by a struct and released on drop,
// so error paths never leak decoders.

use chrono::Duration;
use opencv::{
    core::{self, Mat},
    prelude::*,
    videoio::{self, VideoCapture, VideoWriter},
};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

use crate::error::{Result, SnippetError};
use crate::segments::MediaProbe;
use crate::types::secs_f64;

// ============================================================================
// FRAME STREAM SEAMS
// ============================================================================

#[derive(Debug)]
pub struct SourceFrame {
    pub image: Mat,
    /// Zero-based playback position within the stream, counting failed slots.
    pub position: u64,
}

#[derive(Debug)]
pub enum FrameRead {
    Frame(SourceFrame),
    /// One frame slot could not be decoded; the stream may continue.
    Failed,
    End,
}

pub trait FrameSource {
    fn fps(&self) -> f64;

    /// `Err` is fatal (e.g. a segment that cannot be opened); transient
    /// decode failures come back as `FrameRead::Failed`.
    fn next_frame(&mut self) -> Result<FrameRead>;
}

pub trait FrameSink {
    fn write_frame(&mut self, frame: &Mat) -> Result<()>;
}

/// Outcome of one decode call on a single segment file.
#[derive(Debug)]
pub enum Decoded {
    Frame(Mat),
    /// The slot could not be decoded but the stream moved past it.
    Missing,
    /// The decoder ran out of frames.
    EndOfStream,
}

/// One segment file opened for sequential decoding.
pub trait SegmentDecoder {
    fn fps(&self) -> f64;
    fn seek_frame(&mut self, index: u64) -> Result<()>;
    fn read_frame(&mut self) -> Result<Decoded>;
}

pub trait SegmentOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn SegmentDecoder>>;
}

// ============================================================================
// READING
// ============================================================================

pub struct SegmentReader {
    cap: VideoCapture,
    path: PathBuf,
    fps: f64,
    total_frames: u64,
}

impl SegmentReader {
    pub fn open(path: &Path) -> Result<Self> {
        let path_str = path
            .to_str()
            .ok_or_else(|| SnippetError::io(path, "path is not valid UTF-8"))?;

        let cap = VideoCapture::from_file(path_str, videoio::CAP_ANY)
            .map_err(|e| SnippetError::io(path, e))?;
        if !cap.is_opened().map_err(|e| SnippetError::io(path, e))? {
            return Err(SnippetError::io(path, "failed to open video file"));
        }

        let fps = cap
            .get(videoio::CAP_PROP_FPS)
            .map_err(|e| SnippetError::io(path, e))?;
        if !fps.is_finite() || fps <= 0.0 {
            return Err(SnippetError::io(path, format!("invalid frame rate {fps}")));
        }
        let total_frames = cap
            .get(videoio::CAP_PROP_FRAME_COUNT)
            .map_err(|e| SnippetError::io(path, e))?
            .max(0.0) as u64;

        debug!(
            "Opened {}: {:.2} FPS, {} frames",
            path.display(),
            fps,
            total_frames
        );

        Ok(Self {
            cap,
            path: path.to_path_buf(),
            fps,
            total_frames,
        })
    }

    pub fn duration(&self) -> Duration {
        secs_f64(self.total_frames as f64 / self.fps)
    }

    fn position(&self) -> Result<f64> {
        self.cap
            .get(videoio::CAP_PROP_POS_FRAMES)
            .map_err(|e| SnippetError::io(&self.path, e))
    }
}

impl SegmentDecoder for SegmentReader {
    fn fps(&self) -> f64 {
        self.fps
    }

    fn seek_frame(&mut self, index: u64) -> Result<()> {
        if index == 0 {
            return Ok(());
        }
        self.cap
            .set(videoio::CAP_PROP_POS_FRAMES, index as f64)
            .map_err(|e| SnippetError::io(&self.path, e))?;
        Ok(())
    }

    /// A failed read that leaves the decoder position where it was is the
    /// end of the file; `CAP_PROP_FRAME_COUNT` is only an estimate for MP4.
    fn read_frame(&mut self) -> Result<Decoded> {
        let before = self.position()?;
        let mut mat = Mat::default();
        let ok = VideoCaptureTrait::read(&mut self.cap, &mut mat)
            .map_err(|e| SnippetError::io(&self.path, e))?;
        if ok && !mat.empty() {
            return Ok(Decoded::Frame(mat));
        }
        if self.position()? <= before {
            return Ok(Decoded::EndOfStream);
        }
        Ok(Decoded::Missing)
    }
}

/// Frame index of `offset` at `fps`, rounded to the nearest frame.
pub fn frame_index(offset: Duration, fps: f64) -> u64 {
    let secs = crate::types::as_secs_f64(offset);
    (secs * fps).round().max(0.0) as u64
}

/// Offset of frame slot `position` from the start of the stream, rounded up
/// to the next nanosecond so a timestamp stamped at the exact frame instant
/// never sorts after it.
pub fn frame_offset(position: u64, fps: f64) -> Duration {
    let nanos = position as f64 * 1_000_000_000.0 / fps.max(f64::EPSILON);
    Duration::nanoseconds(nanos.ceil() as i64)
}

pub struct OpenCvOpener;

impl SegmentOpener for OpenCvOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn SegmentDecoder>> {
        Ok(Box::new(SegmentReader::open(path)?))
    }
}

pub struct OpenCvProbe;

impl MediaProbe for OpenCvProbe {
    fn duration(&self, path: &Path) -> Result<Duration> {
        Ok(SegmentReader::open(path)?.duration())
    }
}

// ============================================================================
// WRITING
// ============================================================================

/// Video file sink that opens its writer on the first frame, taking the
/// output size from that frame.
pub struct VideoFileSink {
    path: PathBuf,
    fourcc: String,
    fps: f64,
    writer: Option<VideoWriter>,
    frames_written: u64,
}

impl VideoFileSink {
    pub fn new(path: &Path, fourcc: &str, fps: f64) -> Self {
        Self {
            path: path.to_path_buf(),
            fourcc: fourcc.to_string(),
            fps,
            writer: None,
            frames_written: 0,
        }
    }

    fn open_writer(&self, frame: &Mat) -> Result<VideoWriter> {
        let path_str = self
            .path
            .to_str()
            .ok_or_else(|| SnippetError::io(&self.path, "path is not valid UTF-8"))?;

        let mut code = self.fourcc.chars();
        let (Some(c1), Some(c2), Some(c3), Some(c4)) =
            (code.next(), code.next(), code.next(), code.next())
        else {
            return Err(SnippetError::io(
                &self.path,
                format!("invalid fourcc {:?}", self.fourcc),
            ));
        };
        let fourcc =
            VideoWriter::fourcc(c1, c2, c3, c4).map_err(|e| SnippetError::io(&self.path, e))?;

        let size = core::Size::new(frame.cols(), frame.rows());
        let writer = VideoWriter::new(path_str, fourcc, self.fps, size, true)
            .map_err(|e| SnippetError::io(&self.path, e))?;
        if !writer.is_opened().map_err(|e| SnippetError::io(&self.path, e))? {
            return Err(SnippetError::io(&self.path, "failed to open video writer"));
        }

        info!(
            "Writing snippet {}: {}x{} @ {:.2} FPS ({})",
            self.path.display(),
            size.width,
            size.height,
            self.fps,
            self.fourcc
        );
        Ok(writer)
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Flush and close the output. When nothing was ever written no file
    /// is created and this returns 0.
    pub fn finish(mut self) -> Result<u64> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .release()
                .map_err(|e| SnippetError::io(&self.path, e))?;
        }
        Ok(self.frames_written)
    }
}

impl FrameSink for VideoFileSink {
    fn write_frame(&mut self, frame: &Mat) -> Result<()> {
        if self.writer.is_none() {
            self.writer = Some(self.open_writer(frame)?);
        }
        if let Some(writer) = self.writer.as_mut() {
            writer
                .write(frame)
                .map_err(|e| SnippetError::io(&self.path, e))?;
            self.frames_written += 1;
        }
        Ok(())
    }
}

// ============================================================================
// READ FAILURE WATCHDOG
// ============================================================================

/// Decides when a stream of failing or stalled reads should be abandoned:
/// after `max_consecutive` failed reads in a row, or once `timeout` has
/// passed since the last good frame.
#[derive(Debug)]
pub struct ReadWatchdog {
    max_consecutive: u32,
    timeout: std::time::Duration,
    consecutive_failures: u32,
    last_success: Instant,
}

impl ReadWatchdog {
    pub fn new(max_consecutive: u32, timeout: std::time::Duration) -> Self {
        Self {
            max_consecutive,
            timeout,
            consecutive_failures: 0,
            last_success: Instant::now(),
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_success = Instant::now();
    }

    /// Returns `true` when the stream should be given up.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        self.consecutive_failures >= self.max_consecutive || self.stalled()
    }

    pub fn stalled(&self) -> bool {
        self.last_success.elapsed() > self.timeout
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}
