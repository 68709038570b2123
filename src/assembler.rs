// src/assembler.rs
//
// Turns a resolved segment run into one continuous clip.
//
//   one segment:  [query.start - seg.start, query.end - seg.start]
//   first:        [query.start - first.start, first.duration]
//   interior:     [0, duration]
//   last:         [0, query.end - last.start]
//
// Sub-ranges are checked against the probed media duration. Filename-derived
// times can drift from the real recording, so offsets outside the file are
// clamped and logged instead of failing the task.
//
// The clip itself is a plan; frames are decoded lazily by `ClipReader`, one
// segment at a time and strictly in order.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::error::{Result, SnippetError};
use crate::pipeline::context::TaskContext;
use crate::segments::MediaProbe;
use crate::types::{as_secs_f64, Segment, TimeRange};
use crate::video_processor::{
    frame_index, Decoded, FrameRead, FrameSink, FrameSource, OpenCvOpener, ReadWatchdog,
    SegmentDecoder, SegmentOpener, SourceFrame, VideoFileSink,
};

// ============================================================================
// CLIP PLAN
// ============================================================================

/// The part of one segment file that contributes to the clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubClip {
    pub path: PathBuf,
    pub from: Duration,
    pub to: Duration,
}

impl SubClip {
    pub fn duration(&self) -> Duration {
        self.to - self.from
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clip {
    range: TimeRange,
    /// Wall-clock time of the first decoded frame. Differs from
    /// `range.start()` when leading parts collapsed during clamping.
    origin: DateTime<Utc>,
    parts: Vec<SubClip>,
}

impl Clip {
    pub fn range(&self) -> &TimeRange {
        &self.range
    }

    pub fn origin(&self) -> DateTime<Utc> {
        self.origin
    }

    pub fn parts(&self) -> &[SubClip] {
        &self.parts
    }

    pub fn duration(&self) -> Duration {
        self.parts
            .iter()
            .fold(Duration::zero(), |acc, part| acc + part.duration())
    }

    pub fn open(&self) -> Result<ClipReader<'static>> {
        ClipReader::open(self, &OpenCvOpener)
    }

    /// Copy the clip unmodified into `output`.
    pub fn write_to(
        &self,
        ctx: &TaskContext,
        output: &Path,
        fourcc: &str,
        watchdog: ReadWatchdog,
    ) -> Result<CopyStats> {
        let mut reader = self.open()?;
        let mut sink = VideoFileSink::new(output, fourcc, reader.fps());
        let mut stats = copy_frames(ctx, &mut reader, &mut sink, watchdog)?;

        stats.frames_written = sink.finish()?;
        if stats.frames_written == 0 {
            error!(
                parent: ctx.span(),
                read_failures = stats.read_failures,
                "No frames decoded, {} not written",
                output.display()
            );
        } else {
            info!(
                parent: ctx.span(),
                frames = stats.frames_written,
                read_failures = stats.read_failures,
                "Wrote snippet {}",
                output.display()
            );
        }
        Ok(stats)
    }
}

/// Pump every decodable frame from `source` into `sink` until the stream
/// ends, the watchdog gives up, or the task is cancelled.
pub fn copy_frames(
    ctx: &TaskContext,
    source: &mut dyn FrameSource,
    sink: &mut dyn FrameSink,
    mut watchdog: ReadWatchdog,
) -> Result<CopyStats> {
    let mut stats = CopyStats::default();

    loop {
        ctx.check_cancelled()?;
        match source.next_frame()? {
            FrameRead::End => break,
            FrameRead::Failed => {
                stats.read_failures += 1;
                if watchdog.record_failure() {
                    error!(
                        parent: ctx.span(),
                        consecutive = watchdog.consecutive_failures(),
                        "Giving up on frame reads, keeping {} frames",
                        stats.frames_written
                    );
                    stats.terminated_early = true;
                    break;
                }
            }
            FrameRead::Frame(frame) => {
                watchdog.record_success();
                sink.write_frame(&frame.image)?;
                stats.frames_written += 1;
            }
        }
    }
    Ok(stats)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub frames_written: u64,
    pub read_failures: u64,
    pub terminated_early: bool,
}

// ============================================================================
// ASSEMBLER
// ============================================================================

/// Offsets `[from, to]` into each resolved segment, before any clamping.
pub fn sub_ranges(resolved: &[Segment], query: &TimeRange) -> Vec<(Segment, Duration, Duration)> {
    match resolved {
        [] => Vec::new(),
        [only] => vec![(
            *only,
            query.start() - only.start,
            query.end() - only.start,
        )],
        [first, middle @ .., last] => {
            let mut ranges = Vec::with_capacity(resolved.len());
            ranges.push((*first, query.start() - first.start, first.duration));
            ranges.extend(
                middle
                    .iter()
                    .map(|seg| (*seg, Duration::zero(), seg.duration)),
            );
            ranges.push((*last, Duration::zero(), query.end() - last.start));
            ranges
        }
    }
}

pub struct SnippetAssembler<'a> {
    probe: &'a dyn MediaProbe,
}

impl<'a> SnippetAssembler<'a> {
    pub fn new(probe: &'a dyn MediaProbe) -> Self {
        Self { probe }
    }

    pub fn assemble(
        &self,
        ctx: &TaskContext,
        folder: &Path,
        resolved: &[Segment],
        query: &TimeRange,
    ) -> Result<Clip> {
        if resolved.is_empty() {
            return Err(SnippetError::EmptyResolution(*query));
        }

        debug!(parent: ctx.span(), "Assembling {} using:", query);
        for seg in resolved {
            debug!(parent: ctx.span(), "    {}", seg);
        }

        let planned: Vec<(Segment, SubClip)> = sub_ranges(resolved, query)
            .into_iter()
            .map(|(seg, from, to)| {
                let part = self.clamp_to_media(ctx, seg.path_in(folder), from, to);
                (seg, part)
            })
            .collect();

        let origin = planned
            .iter()
            .find(|(_, part)| part.duration() > Duration::zero())
            .map_or(query.start(), |(seg, part)| seg.start + part.from);
        if origin != query.start() {
            warn!(
                parent: ctx.span(),
                "First frame is {:.3}s after the requested start, timing detections from {}",
                as_secs_f64(origin - query.start()),
                origin
            );
        }
        let parts: Vec<SubClip> = planned.into_iter().map(|(_, part)| part).collect();

        for part in &parts {
            debug!(
                parent: ctx.span(),
                "  {} [{:.3}s, {:.3}s]",
                part.path.display(),
                as_secs_f64(part.from),
                as_secs_f64(part.to)
            );
        }

        let clip = Clip {
            range: *query,
            origin,
            parts,
        };
        let shortfall = query.duration() - clip.duration();
        if shortfall != Duration::zero() {
            warn!(
                parent: ctx.span(),
                "Assembled duration {:.3}s differs from requested {:.3}s",
                as_secs_f64(clip.duration()),
                as_secs_f64(query.duration())
            );
        }
        info!(
            parent: ctx.span(),
            parts = clip.parts.len(),
            "Assembled clip of {:.3}s",
            as_secs_f64(clip.duration())
        );
        Ok(clip)
    }

    fn clamp_to_media(
        &self,
        ctx: &TaskContext,
        path: PathBuf,
        mut from: Duration,
        mut to: Duration,
    ) -> SubClip {
        if from < Duration::zero() {
            warn!(
                parent: ctx.span(),
                "Sub-range start {:.3}s before beginning of {}, clamping to 0",
                as_secs_f64(from),
                path.display()
            );
            from = Duration::zero();
        }

        match self.probe.duration(&path) {
            Ok(actual) => {
                if to > actual {
                    warn!(
                        parent: ctx.span(),
                        "Sub-range end {:.3}s past probed duration {:.3}s of {}, clamping",
                        as_secs_f64(to),
                        as_secs_f64(actual),
                        path.display()
                    );
                    to = actual;
                }
                if from > actual {
                    from = actual;
                }
            }
            Err(e) => warn!(
                parent: ctx.span(),
                "Could not probe {}, keeping index-derived sub-range: {}",
                path.display(),
                e
            ),
        }

        if to < from {
            to = from;
        }
        SubClip { path, from, to }
    }
}

// ============================================================================
// CLIP READER
// ============================================================================

struct PartCursor {
    path: PathBuf,
    decoder: Box<dyn SegmentDecoder>,
    remaining: u64,
}

/// Decodes a clip's parts back to back as one frame stream.
///
/// Positions are planned slots: a part that runs out of frames early is
/// skipped past, so the next part still starts at its planned position.
pub struct ClipReader<'a> {
    opener: &'a dyn SegmentOpener,
    pending: VecDeque<SubClip>,
    current: Option<PartCursor>,
    fps: f64,
    position: u64,
}

impl<'a> ClipReader<'a> {
    pub fn open(clip: &Clip, opener: &'a dyn SegmentOpener) -> Result<Self> {
        let mut pending: VecDeque<SubClip> = clip.parts.iter().cloned().collect();
        let first = pending
            .pop_front()
            .ok_or(SnippetError::EmptyResolution(clip.range))?;
        let cursor = Self::open_part(opener, &first)?;
        let fps = cursor.decoder.fps();

        Ok(Self {
            opener,
            pending,
            current: Some(cursor),
            fps,
            position: 0,
        })
    }

    fn open_part(opener: &dyn SegmentOpener, part: &SubClip) -> Result<PartCursor> {
        let mut decoder = opener.open(&part.path)?;
        let first = frame_index(part.from, decoder.fps());
        let last = frame_index(part.to, decoder.fps());
        decoder.seek_frame(first)?;
        debug!(
            "Reading frames {}..{} of {}",
            first,
            last,
            part.path.display()
        );
        Ok(PartCursor {
            path: part.path.clone(),
            decoder,
            remaining: last.saturating_sub(first),
        })
    }
}

impl FrameSource for ClipReader<'_> {
    fn fps(&self) -> f64 {
        self.fps
    }

    fn next_frame(&mut self) -> Result<FrameRead> {
        loop {
            match self.current.as_mut() {
                Some(cursor) if cursor.remaining > 0 => match cursor.decoder.read_frame()? {
                    Decoded::Frame(image) => {
                        cursor.remaining -= 1;
                        let position = self.position;
                        self.position += 1;
                        return Ok(FrameRead::Frame(SourceFrame { image, position }));
                    }
                    Decoded::Missing => {
                        cursor.remaining -= 1;
                        self.position += 1;
                        return Ok(FrameRead::Failed);
                    }
                    Decoded::EndOfStream => {
                        debug!(
                            "{} ended {} frames early",
                            cursor.path.display(),
                            cursor.remaining
                        );
                        self.position += cursor.remaining;
                        cursor.remaining = 0;
                    }
                },
                _ => {
                    // Drop the exhausted decoder before opening the next one
                    self.current = None;
                    match self.pending.pop_front() {
                        Some(part) => self.current = Some(Self::open_part(self.opener, &part)?),
                        None => return Ok(FrameRead::End),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segments::resolve;
    use crate::testing::{
        at, ctx_at, frame_tag, ten_minute_segments, FakeSegments, FixedProbe, NamedProbe,
        RecordingSink, Scripted, SyntheticSource,
    };

    fn part(name: &str, from_ms: i64, to_ms: i64) -> SubClip {
        SubClip {
            path: PathBuf::from("/cam").join(name),
            from: Duration::milliseconds(from_ms),
            to: Duration::milliseconds(to_ms),
        }
    }

    fn clip_of(parts: Vec<SubClip>) -> Clip {
        Clip {
            range: TimeRange::new(at(0, 0, 0), at(0, 0, 1)).unwrap(),
            origin: at(0, 0, 0),
            parts,
        }
    }

    /// Drain a reader into `(position, (file tag, frame index))`, with
    /// failed slots as `None`.
    fn drain(reader: &mut ClipReader) -> Vec<Option<(u64, (u8, u8))>> {
        let mut seen = Vec::new();
        loop {
            match reader.next_frame().unwrap() {
                FrameRead::End => return seen,
                FrameRead::Failed => seen.push(None),
                FrameRead::Frame(f) => seen.push(Some((f.position, frame_tag(&f.image)))),
            }
        }
    }

    fn watchdog() -> ReadWatchdog {
        ReadWatchdog::new(3, std::time::Duration::from_secs(60))
    }

    #[test]
    fn test_empty_resolution_is_assembly_error() {
        let probe = FixedProbe(Duration::minutes(10));
        let assembler = SnippetAssembler::new(&probe);
        let query = TimeRange::new(at(0, 0, 0), at(0, 1, 0)).unwrap();

        let err = assembler
            .assemble(&ctx_at(at(1, 0, 0)), Path::new("/cam"), &[], &query)
            .unwrap_err();
        assert!(matches!(err, SnippetError::EmptyResolution(_)));
        assert_eq!(err.category(), crate::error::ErrorCategory::Assembly);
    }

    #[test]
    fn test_single_segment_sub_range() {
        let segments = ten_minute_segments(&[at(0, 0, 0), at(0, 10, 0)]);
        let probe = FixedProbe(Duration::minutes(10));
        let assembler = SnippetAssembler::new(&probe);
        let query = TimeRange::new(at(0, 12, 0), at(0, 13, 30)).unwrap();
        let ctx = ctx_at(at(1, 0, 0));

        let resolved = resolve(&ctx, &segments, &query);
        let clip = assembler
            .assemble(&ctx, Path::new("/cam"), &resolved, &query)
            .unwrap();

        assert_eq!(
            clip.parts(),
            &[SubClip {
                path: PathBuf::from("/cam/2023-01-19T00-10-00Z.mp4"),
                from: Duration::minutes(2),
                to: Duration::seconds(210),
            }]
        );
        assert_eq!(clip.duration(), query.duration());
        assert_eq!(clip.origin(), query.start());
    }

    #[test]
    fn test_two_segments_make_exactly_ten_minutes() {
        let segments = ten_minute_segments(&[at(0, 0, 0), at(0, 10, 0), at(0, 20, 0)]);
        let probe = FixedProbe(Duration::minutes(10));
        let assembler = SnippetAssembler::new(&probe);
        let query = TimeRange::new(at(0, 5, 0), at(0, 15, 0)).unwrap();
        let ctx = ctx_at(at(1, 0, 0));

        let resolved = resolve(&ctx, &segments, &query);
        let clip = assembler
            .assemble(&ctx, Path::new("/cam"), &resolved, &query)
            .unwrap();

        assert_eq!(clip.parts().len(), 2);
        assert_eq!(clip.parts()[0].from, Duration::minutes(5));
        assert_eq!(clip.parts()[0].to, Duration::minutes(10));
        assert_eq!(clip.parts()[1].from, Duration::zero());
        assert_eq!(clip.parts()[1].to, Duration::minutes(5));
        assert_eq!(clip.duration(), Duration::minutes(10));
    }

    #[test]
    fn test_sub_range_durations_sum_to_query() {
        let starts: Vec<_> = (0..6).map(|i| at(0, i * 10, 0)).collect();
        let segments = ten_minute_segments(&starts);
        let ctx = ctx_at(at(2, 0, 0));

        let queries = [
            (at(0, 0, 0), at(0, 0, 1)),
            (at(0, 3, 17), at(0, 9, 59)),
            (at(0, 9, 59), at(0, 10, 1)),
            (at(0, 5, 0), at(0, 45, 0)),
            (at(0, 10, 0), at(0, 20, 0)),
            (at(0, 0, 0), at(0, 59, 59)),
        ];

        for (start, end) in queries {
            let query = TimeRange::new(start, end).unwrap();
            let resolved = resolve(&ctx, &segments, &query);
            assert!(!resolved.is_empty(), "{} should resolve", query);

            let total = sub_ranges(&resolved, &query)
                .iter()
                .fold(Duration::zero(), |acc, (_, from, to)| acc + (*to - *from));
            assert_eq!(total, query.duration(), "{}", query);
        }
    }

    #[test]
    fn test_offsets_past_probed_duration_are_clamped() {
        // Filenames say 10 min, but the first file only holds 9m30s
        let segments = ten_minute_segments(&[at(0, 0, 0), at(0, 10, 0)]);
        let probe = NamedProbe::new(Duration::minutes(10))
            .with("2023-01-19T00-00-00Z.mp4", Duration::seconds(570));
        let assembler = SnippetAssembler::new(&probe);
        let query = TimeRange::new(at(0, 5, 0), at(0, 12, 0)).unwrap();
        let ctx = ctx_at(at(1, 0, 0));

        let resolved = resolve(&ctx, &segments, &query);
        let clip = assembler
            .assemble(&ctx, Path::new("/cam"), &resolved, &query)
            .unwrap();

        assert_eq!(clip.parts()[0].to, Duration::seconds(570));
        assert_eq!(clip.parts()[1].to, Duration::minutes(2));
        assert_eq!(clip.duration(), Duration::seconds(390));
    }

    #[test]
    fn test_start_past_probed_duration_collapses_part() {
        let segments = ten_minute_segments(&[at(0, 0, 0), at(0, 10, 0)]);
        let probe = NamedProbe::new(Duration::minutes(10))
            .with("2023-01-19T00-00-00Z.mp4", Duration::seconds(500));
        let assembler = SnippetAssembler::new(&probe);
        let query = TimeRange::new(at(0, 9, 0), at(0, 11, 0)).unwrap();
        let ctx = ctx_at(at(1, 0, 0));

        let resolved = resolve(&ctx, &segments, &query);
        let clip = assembler
            .assemble(&ctx, Path::new("/cam"), &resolved, &query)
            .unwrap();

        assert_eq!(clip.parts()[0].duration(), Duration::zero());
        assert_eq!(clip.duration(), Duration::minutes(1));
        // First decoded frame comes from the second file
        assert_eq!(clip.origin(), at(0, 10, 0));
    }

    #[test]
    fn test_assembly_is_deterministic() {
        let segments = ten_minute_segments(&[at(0, 0, 0), at(0, 10, 0), at(0, 20, 0)]);
        let probe = FixedProbe(Duration::minutes(10));
        let assembler = SnippetAssembler::new(&probe);
        let query = TimeRange::new(at(0, 7, 30), at(0, 24, 15)).unwrap();
        let ctx = ctx_at(at(1, 0, 0));

        let first = assembler
            .assemble(&ctx, Path::new("/cam"), &resolve(&ctx, &segments, &query), &query)
            .unwrap();
        let second = assembler
            .assemble(&ctx, Path::new("/cam"), &resolve(&ctx, &segments, &query), &query)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_reader_fails_on_missing_segment() {
        let segments = ten_minute_segments(&[at(0, 0, 0)]);
        let probe = FixedProbe(Duration::minutes(10));
        let assembler = SnippetAssembler::new(&probe);
        let query = TimeRange::new(at(0, 1, 0), at(0, 2, 0)).unwrap();
        let ctx = ctx_at(at(1, 0, 0));

        let clip = assembler
            .assemble(&ctx, Path::new("/no/such/cam"), &segments, &query)
            .unwrap();
        let err = clip.open().err().unwrap();
        assert_eq!(err.category(), crate::error::ErrorCategory::Io);
    }

    #[test]
    fn test_reader_concatenates_parts_in_order() {
        let files = FakeSegments::new(10.0)
            .file("a.mp4", 1, 100)
            .file("b.mp4", 2, 100);
        let clip = clip_of(vec![part("a.mp4", 500, 800), part("b.mp4", 0, 200)]);

        let mut reader = ClipReader::open(&clip, &files).unwrap();
        assert_eq!(
            drain(&mut reader),
            vec![
                Some((0, (1, 5))),
                Some((1, (1, 6))),
                Some((2, (1, 7))),
                Some((3, (2, 0))),
                Some((4, (2, 1))),
            ]
        );
        assert_eq!(*files.opened.lock().unwrap(), vec!["a.mp4", "b.mp4"]);
    }

    #[test]
    fn test_reader_moves_on_when_a_part_ends_early() {
        // Planned 5..10 but the file only holds 8 frames
        let files = FakeSegments::new(10.0)
            .file("a.mp4", 1, 8)
            .file("b.mp4", 2, 100);
        let clip = clip_of(vec![part("a.mp4", 500, 1000), part("b.mp4", 0, 300)]);

        let mut reader = ClipReader::open(&clip, &files).unwrap();
        assert_eq!(
            drain(&mut reader),
            vec![
                Some((0, (1, 5))),
                Some((1, (1, 6))),
                Some((2, (1, 7))),
                // Skipped slots keep the next file on its planned position
                Some((5, (2, 0))),
                Some((6, (2, 1))),
                Some((7, (2, 2))),
            ]
        );
    }

    #[test]
    fn test_reader_reports_undecodable_slot_and_keeps_position() {
        let files = FakeSegments::new(10.0)
            .file("a.mp4", 1, 100)
            .missing("a.mp4", 5);
        let clip = clip_of(vec![part("a.mp4", 500, 800)]);

        let mut reader = ClipReader::open(&clip, &files).unwrap();
        assert_eq!(
            drain(&mut reader),
            vec![None, Some((1, (1, 6))), Some((2, (1, 7)))]
        );
    }

    #[test]
    fn test_early_end_of_part_does_not_trip_watchdog() {
        // Five planned slots of a.mp4 do not exist, more than the watchdog allows
        let files = FakeSegments::new(10.0)
            .file("a.mp4", 1, 5)
            .file("b.mp4", 2, 100);
        let clip = clip_of(vec![part("a.mp4", 0, 1000), part("b.mp4", 0, 300)]);
        let mut reader = ClipReader::open(&clip, &files).unwrap();
        let mut sink = RecordingSink::default();

        let stats = copy_frames(&ctx_at(at(1, 0, 0)), &mut reader, &mut sink, watchdog()).unwrap();

        assert_eq!(stats.frames_written, 8);
        assert_eq!(stats.read_failures, 0);
        assert!(!stats.terminated_early);
        assert_eq!(frame_tag(&sink.frames[7]), (2, 2));
    }

    #[test]
    fn test_copy_failing_from_first_read_keeps_empty_result() {
        let mut source = SyntheticSource::scripted(vec![Scripted::Fail; 5], 10.0);
        let mut sink = RecordingSink::default();

        let stats = copy_frames(&ctx_at(at(1, 0, 0)), &mut source, &mut sink, watchdog()).unwrap();

        assert_eq!(stats.frames_written, 0);
        assert_eq!(stats.read_failures, 3);
        assert!(stats.terminated_early);
        assert!(sink.frames.is_empty());
    }
}
