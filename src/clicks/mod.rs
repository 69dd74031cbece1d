//! Click detection and removal.
//!
//! Detection flags samples whose second difference exceeds a threshold
//! derived from the block's mean absolute first difference. Consecutive
//! flagged samples form a click region that is repaired by Hermite
//! interpolation, by crossfading toward a local average, or by picking one of
//! the two from the region width.

mod decrackle;
mod detector;
mod repair;
mod task;

pub use decrackle::Decrackler;
pub use detector::{ClickProcessor, ClickRemover};
pub use task::{
    detect_clicks, remove_clicks, spawn_detection, spawn_removal, CancellationToken,
    DetectionResult, RemovalResult, TaskEvent, TaskHandle, TASK_CHUNK_SIZE,
};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MIN_SENSITIVITY: f32 = 0.0;
pub const MAX_SENSITIVITY: f32 = 100.0;
pub const MIN_MAX_WIDTH: usize = 10;
pub const MAX_MAX_WIDTH: usize = 2000;
pub const MIN_AVERAGING_WIDTH: usize = 1;
pub const MAX_AVERAGING_WIDTH: usize = 10;

/// Errors raised by click operations before any work starts
#[derive(Debug, Error, PartialEq)]
pub enum ClickError {
    #[error("Empty processing range {start}..{end}")]
    EmptyRange { start: usize, end: usize },

    #[error("Invalid click settings: {0}")]
    InvalidSettings(String),
}

/// How a click region is repaired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepairMethod {
    /// Cubic Hermite across the region
    #[serde(alias = "spline")]
    Interpolation,
    /// Blend toward the local windowed average
    Crossfade,
    /// Interpolation for short regions, crossfade for long ones
    #[default]
    Automatic,
}

impl RepairMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairMethod::Interpolation => "interpolation",
            RepairMethod::Crossfade => "crossfade",
            RepairMethod::Automatic => "automatic",
        }
    }
}

impl fmt::Display for RepairMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepairMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "interpolation" | "spline" | "0" => Ok(RepairMethod::Interpolation),
            "crossfade" | "1" => Ok(RepairMethod::Crossfade),
            "automatic" | "auto" | "2" => Ok(RepairMethod::Automatic),
            _ => Err(format!(
                "Unknown repair method: {}. Use interpolation, crossfade or automatic.",
                s
            )),
        }
    }
}

/// Click detection and repair parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickSettings {
    /// 0 to 100; higher flags quieter clicks
    pub sensitivity: f32,
    /// Longest region repaired, in samples (10 to 2000)
    pub max_width: usize,
    pub method: RepairMethod,
    /// Widest region `Automatic` repairs by interpolation
    pub interpolation_limit: usize,
    /// Crossfade window half-width (1 to 10)
    pub averaging_width: usize,
}

impl Default for ClickSettings {
    fn default() -> Self {
        Self {
            sensitivity: 60.0,
            max_width: 500,
            method: RepairMethod::Automatic,
            interpolation_limit: 20,
            averaging_width: 3,
        }
    }
}

impl ClickSettings {
    /// Reject values that cannot be clamped into range
    pub fn validate(&self) -> Result<(), ClickError> {
        if !self.sensitivity.is_finite() {
            return Err(ClickError::InvalidSettings(format!(
                "sensitivity must be a finite number, got {}",
                self.sensitivity
            )));
        }
        Ok(())
    }

    /// Copy with every field clamped into its supported range
    pub fn clamped(&self) -> Self {
        let sensitivity = if self.sensitivity.is_finite() {
            self.sensitivity.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY)
        } else {
            ClickSettings::default().sensitivity
        };
        Self {
            sensitivity,
            max_width: self.max_width.clamp(MIN_MAX_WIDTH, MAX_MAX_WIDTH),
            method: self.method,
            interpolation_limit: self.interpolation_limit.max(1),
            averaging_width: self
                .averaging_width
                .clamp(MIN_AVERAGING_WIDTH, MAX_AVERAGING_WIDTH),
        }
    }

    /// Threshold multiplier applied to the noise floor.
    ///
    /// Sensitivity 100 gives 1x, the default 60 gives 5x and 0 gives 11x.
    pub fn threshold_multiplier(&self) -> f32 {
        let sensitivity = self.sensitivity.clamp(MIN_SENSITIVITY, MAX_SENSITIVITY);
        1.0 + (MAX_SENSITIVITY - sensitivity) / 10.0
    }

    /// Method used for a region of `width` samples
    pub fn method_for_width(&self, width: usize) -> RepairMethod {
        match self.method {
            RepairMethod::Automatic if width <= self.interpolation_limit => {
                RepairMethod::Interpolation
            }
            RepairMethod::Automatic => RepairMethod::Crossfade,
            method => method,
        }
    }
}

/// A detected or user-marked click
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickInfo {
    /// First sample of the region, absolute within the buffer
    pub position: usize,
    /// Anomaly score in [0, 1)
    pub magnitude: f32,
    /// Region length in samples
    pub width: usize,
    pub is_manual: bool,
    /// Channel the click was found on; `None` applies to every channel
    pub channel: Option<usize>,
}

impl ClickInfo {
    /// A user-marked click spanning every channel
    pub fn manual(position: usize, width: usize) -> Self {
        Self {
            position,
            magnitude: 0.0,
            width,
            is_manual: true,
            channel: None,
        }
    }
}
