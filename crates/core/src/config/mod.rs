use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, ScopeError};

/// Upper bound on the number of logged channels.
pub const MAX_CHANNELS: usize = 64;

/// Number of capture windows the frame ring holds.
pub const FRAMES_STORED: usize = 4;

/// What the emitted snapshots contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlotMode {
    #[default]
    TimeDomain,
    Spectral,
}

/// Policy deciding when a primed trigger fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Fire on a qualifying edge, or on the auto-retrigger countdown.
    #[default]
    Auto,
    /// Fire only on a qualifying edge.
    Normal,
    /// Fire only when [`crate::ScopeController::trigger`] is called.
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerDirection {
    #[default]
    Rising,
    Falling,
}

/// Display form of spectral frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpectralAxis {
    Linear,
    #[default]
    Decibel,
}

/// Edge-trigger parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerSettings {
    pub mode: TriggerMode,
    pub channel: usize,
    pub direction: TriggerDirection,
    /// Threshold in signal units.
    pub level: f32,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            mode: TriggerMode::Auto,
            channel: 0,
            direction: TriggerDirection::Rising,
            level: 0.0,
        }
    }
}

/// Transform parameters for the spectral plot mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectralConfig {
    /// Transform length in samples; a power of two.
    pub length: usize,
    /// Largest length a runtime resize may request. Sizes the snapshot pool.
    pub max_length: usize,
    /// Linear magnitude scale. Defaults to `2 / length`.
    pub scale: Option<f32>,
    /// Decibel offset. Defaults to `20 * log10(scale)`.
    pub log_offset: Option<f32>,
    pub axis: SpectralAxis,
}

impl Default for SpectralConfig {
    fn default() -> Self {
        Self {
            length: 1024,
            max_length: 8192,
            scale: None,
            log_offset: None,
            axis: SpectralAxis::Decibel,
        }
    }
}

/// Sizing of the producer to consumer handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Snapshot buffers in rotation between producer and consumer.
    pub generations: usize,
    /// Extra work-queue slots reserved for inline messages.
    pub message_slots: usize,
    /// How long the idle worker parks before re-checking for work.
    pub idle_park_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            generations: 3,
            message_slots: 32,
            idle_park_ms: 5,
        }
    }
}

/// Setup-time configuration of a scope. Not mutated from the real-time path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    pub channels: usize,
    pub sample_rate: f32,
    pub pixel_width: usize,
    /// Points per channel in an emitted time-domain snapshot.
    pub frame_width: usize,
    pub plot_mode: PlotMode,
    pub trigger: TriggerSettings,
    /// Captured samples of the window shown before the trigger point.
    /// Negative values start the window after the trigger.
    pub x_offset: isize,
    pub up_sampling: usize,
    pub down_sampling: usize,
    /// Captured samples between the end of one trigger cycle and the next arm.
    pub hold_off: usize,
    /// Primed samples without an edge before auto mode fires anyway.
    /// Defaults to capture width plus hold-off.
    pub auto_trigger_timeout: Option<usize>,
    pub fft: SpectralConfig,
    pub slider_count: usize,
    pub bridge: BridgeConfig,
    /// Capacity of the controller to producer command queue.
    pub command_capacity: usize,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            channels: 2,
            sample_rate: 44_100.0,
            pixel_width: 1280,
            frame_width: 1280,
            plot_mode: PlotMode::TimeDomain,
            trigger: TriggerSettings::default(),
            x_offset: 0,
            up_sampling: 1,
            down_sampling: 1,
            hold_off: 64,
            auto_trigger_timeout: None,
            fft: SpectralConfig::default(),
            slider_count: 0,
            bridge: BridgeConfig::default(),
            command_capacity: 64,
        }
    }
}

impl ScopeConfig {
    /// Reads a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Captured samples per emitted time-domain window.
    pub fn capture_width(&self) -> usize {
        self.frame_width / self.up_sampling.max(1)
    }

    /// Frame slots in the ring buffer.
    pub fn ring_capacity(&self) -> usize {
        self.capture_width() * FRAMES_STORED
    }

    pub fn auto_timeout(&self) -> usize {
        self.auto_trigger_timeout
            .unwrap_or(self.capture_width() + self.hold_off)
    }

    /// Sample rate of the points in an emitted window.
    pub fn effective_sample_rate(&self) -> f32 {
        self.sample_rate * self.up_sampling as f32 / self.down_sampling.max(1) as f32
    }

    /// Payload length every snapshot buffer must hold without reallocating.
    pub fn snapshot_capacity(&self) -> usize {
        self.channels * self.frame_width.max(self.fft.max_length / 2)
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.channels == 0 || self.channels > MAX_CHANNELS {
            return Err(ScopeError::config(format!(
                "channel count {} outside 1..={MAX_CHANNELS}",
                self.channels
            )));
        }
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(ScopeError::config("sample rate must be positive"));
        }
        if self.pixel_width == 0 {
            return Err(ScopeError::config("pixel width must be non-zero"));
        }
        if self.up_sampling == 0 || self.down_sampling == 0 {
            return Err(ScopeError::config("sampling factors must be at least 1"));
        }
        if self.frame_width % self.up_sampling != 0 {
            return Err(ScopeError::config(format!(
                "frame width {} is not a multiple of up-sampling {}",
                self.frame_width, self.up_sampling
            )));
        }
        if self.capture_width() < 2 {
            return Err(ScopeError::config("capture width must be at least 2"));
        }
        check_trigger(&self.trigger, self.channels)?;
        check_offset(self.x_offset, self.capture_width())?;
        check_fft_length(self.fft.length, self.fft.max_length)?;
        if self.bridge.generations == 0 {
            return Err(ScopeError::config("at least one buffer generation is required"));
        }
        if self.command_capacity == 0 {
            return Err(ScopeError::config("command capacity must be non-zero"));
        }
        Ok(())
    }
}

pub(crate) fn check_trigger(trigger: &TriggerSettings, channels: usize) -> Result<()> {
    if trigger.channel >= channels {
        return Err(ScopeError::config(format!(
            "trigger channel {} out of range for {channels} channels",
            trigger.channel
        )));
    }
    if !trigger.level.is_finite() {
        return Err(ScopeError::config("trigger level must be finite"));
    }
    Ok(())
}

pub(crate) fn check_offset(x_offset: isize, capture_width: usize) -> Result<()> {
    if x_offset.unsigned_abs() >= capture_width {
        return Err(ScopeError::config(format!(
            "horizontal offset {x_offset} must be smaller than capture width {capture_width}"
        )));
    }
    Ok(())
}

pub(crate) fn check_fft_length(length: usize, max_length: usize) -> Result<()> {
    if !max_length.is_power_of_two() || max_length < 4 {
        return Err(ScopeError::config(format!(
            "maximum transform length {max_length} is not a power of two >= 4"
        )));
    }
    if !length.is_power_of_two() || length < 4 || length > max_length {
        return Err(ScopeError::config(format!(
            "transform length {length} must be a power of two in 4..={max_length}"
        )));
    }
    Ok(())
}
