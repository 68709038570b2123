// src/overlay/tracker.rs
//
// Visual tracker seam. The overlay state machine only ever sees
// `VisualTracker`; which OpenCV algorithm sits behind it is picked by
// `TrackerKind` from the config file.

use opencv::{
    core::{Mat, Ptr, Rect},
    prelude::*,
    tracking::{TrackerCSRT, TrackerCSRT_Params, TrackerKCF, TrackerKCF_Params},
    video::{TrackerMIL, TrackerMIL_Params},
};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SnippetError};

pub trait VisualTracker {
    /// (Re)seed the tracker on `rect` in `frame`.
    fn init(&mut self, frame: &Mat, rect: Rect) -> Result<()>;

    /// Advance one frame. `Ok(None)` means the target was lost.
    fn update(&mut self, frame: &Mat) -> Result<Option<Rect>>;
}

pub trait TrackerFactory {
    fn create(&self, object_id: i64) -> Result<Box<dyn VisualTracker>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerKind {
    /// Kernelized correlation filter, fastest of the three.
    Kcf,
    Csrt,
    Mil,
}

impl fmt::Display for TrackerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Kcf => "KCF",
            Self::Csrt => "CSRT",
            Self::Mil => "MIL",
        };
        f.write_str(name)
    }
}

impl TrackerFactory for TrackerKind {
    fn create(&self, object_id: i64) -> Result<Box<dyn VisualTracker>> {
        let backend = match self {
            Self::Kcf => {
                let params = TrackerKCF_Params::default().map_err(SnippetError::tracker)?;
                OpenCvTracker::Kcf(TrackerKCF::create(params).map_err(SnippetError::tracker)?)
            }
            Self::Csrt => {
                let params = TrackerCSRT_Params::default().map_err(SnippetError::tracker)?;
                OpenCvTracker::Csrt(TrackerCSRT::create(&params).map_err(SnippetError::tracker)?)
            }
            Self::Mil => {
                let params = TrackerMIL_Params::default().map_err(SnippetError::tracker)?;
                OpenCvTracker::Mil(TrackerMIL::create(params).map_err(SnippetError::tracker)?)
            }
        };
        tracing::trace!(object_id, kind = %self, "Created tracker");
        Ok(Box::new(backend))
    }
}

enum OpenCvTracker {
    Kcf(Ptr<TrackerKCF>),
    Csrt(Ptr<TrackerCSRT>),
    Mil(Ptr<TrackerMIL>),
}

impl VisualTracker for OpenCvTracker {
    fn init(&mut self, frame: &Mat, rect: Rect) -> Result<()> {
        match self {
            Self::Kcf(t) => t.init(frame, rect),
            Self::Csrt(t) => t.init(frame, rect),
            Self::Mil(t) => t.init(frame, rect),
        }
        .map_err(SnippetError::tracker)
    }

    fn update(&mut self, frame: &Mat) -> Result<Option<Rect>> {
        let mut rect = Rect::default();
        let found = match self {
            Self::Kcf(t) => t.update(frame, &mut rect),
            Self::Csrt(t) => t.update(frame, &mut rect),
            Self::Mil(t) => t.update(frame, &mut rect),
        }
        .map_err(SnippetError::tracker)?;

        if found && rect.width > 0 && rect.height > 0 {
            Ok(Some(rect))
        } else {
            Ok(None)
        }
    }
}
