//! Exported snapshots and the inline messages that travel beside them.

use serde::{Deserialize, Serialize};

use crate::{control::Setting, PlotMode, SliderSpec, TriggerDirection, TriggerMode};

/// Bytes in an encoded [`SnapshotHeader`].
pub const HEADER_LEN: usize = 40;

/// What made a window fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOrigin {
    #[default]
    Edge,
    /// Auto-retrigger countdown expired.
    Auto,
    /// Explicit forced-trigger call.
    Forced,
    /// A full transform-length window was accumulated.
    Spectral,
}

impl TriggerOrigin {
    fn code(self) -> u8 {
        match self {
            Self::Edge => 0,
            Self::Auto => 1,
            Self::Forced => 2,
            Self::Spectral => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TriggerInfo {
    pub mode: TriggerMode,
    pub channel: usize,
    pub direction: TriggerDirection,
    pub level: f32,
    pub origin: TriggerOrigin,
    /// Absolute capture position of the trigger point.
    pub position: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SnapshotHeader {
    pub channels: usize,
    /// Points per channel in the payload.
    pub frame_width: usize,
    /// Rate of the payload points (time domain) or of the analysed signal.
    pub sample_rate: f32,
    pub plot_mode: PlotMode,
    pub trigger: TriggerInfo,
    /// Monotonic per-engine snapshot counter.
    pub sequence: u64,
}

/// One exported window: header plus planar payload, channel after channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Snapshot {
    pub header: SnapshotHeader,
    pub payload: Vec<f32>,
}

impl Snapshot {
    /// Preallocates room for `capacity` payload values so filling never
    /// reallocates.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            header: SnapshotHeader::default(),
            payload: Vec::with_capacity(capacity),
        }
    }

    /// Payload points of one channel.
    pub fn channel(&self, channel: usize) -> &[f32] {
        let width = self.header.frame_width;
        let start = channel * width;
        self.payload.get(start..start + width).unwrap_or(&[])
    }

    /// Resizes the payload to `len` zeroed values within existing capacity.
    pub(crate) fn reset_payload(&mut self, len: usize) -> &mut [f32] {
        self.payload.clear();
        self.payload.resize(len.min(self.payload.capacity()), 0.0);
        &mut self.payload
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len() * 4
    }

    /// Appends the wire form: a fixed little-endian header followed by the
    /// payload as `f32` values.
    ///
    /// Header field order: channels (u32), frame width (u32), sample rate
    /// (f32), plot mode, trigger mode, trigger direction and trigger origin
    /// (u8 each), trigger channel (u32), trigger level (f32), trigger
    /// position (u64), sequence (u64).
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let h = &self.header;
        out.reserve(self.encoded_len());
        out.extend_from_slice(&(h.channels as u32).to_le_bytes());
        out.extend_from_slice(&(h.frame_width as u32).to_le_bytes());
        out.extend_from_slice(&h.sample_rate.to_le_bytes());
        out.push(match h.plot_mode {
            PlotMode::TimeDomain => 0,
            PlotMode::Spectral => 1,
        });
        out.push(match h.trigger.mode {
            TriggerMode::Auto => 0,
            TriggerMode::Normal => 1,
            TriggerMode::Custom => 2,
        });
        out.push(match h.trigger.direction {
            TriggerDirection::Rising => 0,
            TriggerDirection::Falling => 1,
        });
        out.push(h.trigger.origin.code());
        out.extend_from_slice(&(h.trigger.channel as u32).to_le_bytes());
        out.extend_from_slice(&h.trigger.level.to_le_bytes());
        out.extend_from_slice(&h.trigger.position.to_le_bytes());
        out.extend_from_slice(&h.sequence.to_le_bytes());
        for value in &self.payload {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Small inline payloads delivered through the same path as snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScopeMessage {
    /// Sent once at start.
    Layout {
        channels: usize,
        sample_rate: f32,
        pixel_width: usize,
        frame_width: usize,
    },
    /// Slider definition, sent once per slider at start.
    Slider { index: usize, spec: SliderSpec },
    /// A runtime setting the producer has applied.
    Setting { setting: Setting },
    /// A staged transform length took effect.
    FftResized { length: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_fixed_header_then_payload() {
        let mut snapshot = Snapshot::with_capacity(4);
        snapshot.header = SnapshotHeader {
            channels: 2,
            frame_width: 2,
            sample_rate: 48_000.0,
            plot_mode: PlotMode::Spectral,
            trigger: TriggerInfo {
                origin: TriggerOrigin::Forced,
                position: 77,
                ..Default::default()
            },
            sequence: 9,
        };
        snapshot.reset_payload(4).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);

        let mut bytes = Vec::new();
        snapshot.encode_into(&mut bytes);

        assert_eq!(bytes.len(), HEADER_LEN + 16);
        assert_eq!(&bytes[0..4], &2u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &48_000f32.to_le_bytes());
        assert_eq!(bytes[12], 1);
        assert_eq!(bytes[15], 2);
        assert_eq!(&bytes[24..32], &77u64.to_le_bytes());
        assert_eq!(&bytes[32..40], &9u64.to_le_bytes());
        assert_eq!(&bytes[HEADER_LEN + 12..], &4f32.to_le_bytes());
    }

    #[test]
    fn payload_reset_stays_within_capacity() {
        let mut snapshot = Snapshot::with_capacity(8);
        let ptr = snapshot.payload.as_ptr();
        assert_eq!(snapshot.reset_payload(6).len(), 6);
        assert_eq!(snapshot.reset_payload(20).len(), 8);
        assert_eq!(snapshot.payload.as_ptr(), ptr);
    }

    #[test]
    fn channel_view_is_planar() {
        let mut snapshot = Snapshot::with_capacity(6);
        snapshot.header.channels = 2;
        snapshot.header.frame_width = 3;
        snapshot
            .reset_payload(6)
            .copy_from_slice(&[0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);
        assert_eq!(snapshot.channel(1), &[10.0, 11.0, 12.0]);
        assert!(snapshot.channel(2).is_empty());
    }
}
