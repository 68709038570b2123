// src/pipeline/context.rs
//
// Per-task context handed explicitly to the indexer, resolver, assembler
// and overlay engine. Carries the wall clock (live-mode indexing reads
// "now" from it) and the tracing span every component logs under, so a
// log line always names the camera folder and requested range.
//
// Frame loops poll the context's cancel flag once per frame, so a task
// abandoned by the runner's timeout stops decoding promptly.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info_span, Span};

use crate::error::{Result, SnippetError};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared between the runner and one task's blocking worker.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct TaskContext {
    camera_folder: PathBuf,
    clock: Arc<dyn Clock>,
    cancel: CancelFlag,
    span: Span,
}

impl TaskContext {
    pub fn new(
        camera_folder: &Path,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let span = info_span!(
            "snippet",
            folder = %camera_folder.display(),
            start = %start.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            end = %end.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        );
        Self {
            camera_folder: camera_folder.to_path_buf(),
            clock,
            cancel: CancelFlag::new(),
            span,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SnippetError::Cancelled);
        }
        Ok(())
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn camera_folder(&self) -> &Path {
        &self.camera_folder
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}
