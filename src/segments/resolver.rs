// src/segments/resolver.rs
//
// Picks the minimal run of segments covering a query range.
//
// Scan ascending: the start segment is the one whose [start, start+duration)
// contains query.start; from there segments are collected until one satisfies
// query.end - segment.start < segment.duration. Boundary timestamps belong to
// the following segment. No start or no end match -> empty result.

use tracing::debug;

use crate::pipeline::context::TaskContext;
use crate::types::{Segment, TimeRange};

pub fn resolve(ctx: &TaskContext, segments: &[Segment], query: &TimeRange) -> Vec<Segment> {
    let mut relevant = Vec::new();
    let mut found_start = false;

    debug!(parent: ctx.span(), "Looking for start time {}", query.start());
    for segment in segments {
        if !found_start {
            if !segment.contains(query.start()) {
                debug!(parent: ctx.span(), "  start time not in: {}", segment);
                continue;
            }
            found_start = true;
            debug!(parent: ctx.span(), "  found start time in: {}", segment);
            debug!(parent: ctx.span(), "Looking for end time {}", query.end());
        }

        relevant.push(*segment);
        if query.end() - segment.start < segment.duration {
            debug!(parent: ctx.span(), "  found end time in: {}", segment);
            return relevant;
        }
        debug!(parent: ctx.span(), "  end time not in: {}", segment);
    }

    if found_start {
        debug!(parent: ctx.span(), "End time {} not covered by any segment", query.end());
    } else {
        debug!(parent: ctx.span(), "Start time {} not covered by any segment", query.start());
    }
    Vec::new()
}
