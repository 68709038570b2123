// src/config.rs

use crate::types::Config;
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

/// Rejects NaN and infinities along with negatives.
fn non_negative(secs: f64) -> bool {
    secs.is_finite() && secs >= 0.0
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.segments.nominal_duration_secs == 0 {
            bail!("segments.nominal_duration_secs must be positive");
        }
        if !non_negative(self.segments.live_safety_margin_secs) {
            bail!("segments.live_safety_margin_secs must be a non-negative number");
        }
        if self.assembly.fourcc.chars().count() != 4 {
            bail!(
                "assembly.fourcc must be exactly four characters, got {:?}",
                self.assembly.fourcc
            );
        }
        if self.overlay.max_consecutive_read_failures == 0 {
            bail!("overlay.max_consecutive_read_failures must be at least 1");
        }
        if !non_negative(self.overlay.read_timeout_secs) || self.overlay.read_timeout_secs == 0.0 {
            bail!("overlay.read_timeout_secs must be positive");
        }
        if self.overlay.box_thickness <= 0 {
            bail!("overlay.box_thickness must be positive");
        }
        if self.tasks.timeout_secs == 0 {
            bail!("tasks.timeout_secs must be positive");
        }
        if self.tasks.max_concurrent == 0 {
            bail!("tasks.max_concurrent must be at least 1");
        }
        let task_secs = [
            self.tasks.pre_roll_secs,
            self.tasks.min_duration_secs,
            self.tasks.live_edge_guard_secs,
            self.tasks.live_edge_delay_secs,
        ];
        if !task_secs.into_iter().all(non_negative) {
            bail!("tasks durations must be non-negative numbers");
        }
        Ok(())
    }
}
