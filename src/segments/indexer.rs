// src/segments/indexer.rs
//
// Builds the ordered segment index for one camera folder.
//
// Durations are gap-derived (start[i+1] - start[i]) so recorder jitter is
// absorbed instead of assuming the nominal file length. The newest segment
// has no successor; its duration follows the configured IndexMode:
//
//   Closed: min(probed media duration, nominal length)
//   Live:   now - start - safety margin, floored at zero

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Result, SnippetError};
use crate::pipeline::context::TaskContext;
use crate::types::{IndexMode, Segment, SegmentConfig, SEGMENT_DATE_FORMAT, SEGMENT_SUFFIX};

/// Length of a segment file stem, `YYYY-MM-DDTHH-MM-SSZ`.
const SEGMENT_STEM_LEN: usize = 20;

/// Reads the playable duration of a media file.
pub trait MediaProbe: Send + Sync {
    fn duration(&self, path: &Path) -> Result<Duration>;
}

/// Parse `2023-01-19T17-09-30Z.mp4` into its UTC start time.
pub fn parse_segment_start(file_name: &str) -> Option<DateTime<Utc>> {
    let stem = file_name.strip_suffix(SEGMENT_SUFFIX)?;
    if stem.len() != SEGMENT_STEM_LEN {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(stem, SEGMENT_DATE_FORMAT).ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

pub struct SegmentIndexer<'a> {
    config: &'a SegmentConfig,
    probe: &'a dyn MediaProbe,
}

impl<'a> SegmentIndexer<'a> {
    pub fn new(config: &'a SegmentConfig, probe: &'a dyn MediaProbe) -> Self {
        Self { config, probe }
    }

    /// Index `folder` into segments sorted strictly ascending by start.
    pub fn index(&self, ctx: &TaskContext, folder: &Path) -> Result<Vec<Segment>> {
        if !folder.is_dir() {
            return Err(SnippetError::FolderNotFound(folder.to_path_buf()));
        }

        debug!(parent: ctx.span(), "Loading segment start times from {}", folder.display());

        let mut starts = Vec::new();
        for entry in WalkDir::new(folder).min_depth(1).max_depth(1) {
            let entry = entry.map_err(|e| SnippetError::io(folder, e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            match parse_segment_start(&name) {
                Some(start) => starts.push(start),
                None => debug!(parent: ctx.span(), file = %name, "Skipping non-segment file"),
            }
        }

        starts.sort();
        starts.dedup();

        let Some(&last_start) = starts.last() else {
            return Err(SnippetError::NoSegments(folder.to_path_buf()));
        };

        let mut segments: Vec<Segment> = starts
            .windows(2)
            .map(|pair| Segment {
                start: pair[0],
                duration: pair[1] - pair[0],
            })
            .collect();

        let last = Segment {
            start: last_start,
            duration: self.last_segment_duration(ctx, folder, last_start)?,
        };
        segments.push(last);

        for seg in &segments {
            debug!(parent: ctx.span(), "    {}", seg);
        }
        info!(
            parent: ctx.span(),
            count = segments.len(),
            mode = ?self.config.mode,
            "Indexed segments {} .. {}",
            segments[0].start.format(SEGMENT_DATE_FORMAT),
            last.end().format(SEGMENT_DATE_FORMAT)
        );

        Ok(segments)
    }

    fn last_segment_duration(
        &self,
        ctx: &TaskContext,
        folder: &Path,
        start: DateTime<Utc>,
    ) -> Result<Duration> {
        match self.config.mode {
            IndexMode::Closed => {
                let path = folder.join(format!(
                    "{}{}",
                    start.format(SEGMENT_DATE_FORMAT),
                    SEGMENT_SUFFIX
                ));
                let probed = self.probe.duration(&path)?;
                Ok(probed.min(self.config.nominal_duration()))
            }
            IndexMode::Live => {
                let elapsed = ctx.now() - start - self.config.live_safety_margin();
                Ok(elapsed.max(Duration::zero()))
            }
        }
    }
}
