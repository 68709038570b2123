// src/overlay/mod.rs

pub mod draw;
pub mod engine;
pub mod tracker;

pub use engine::{OverlayEngine, OverlayOutcome, OverlayStats};
