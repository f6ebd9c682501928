//! Core library for RtScope.
//!
//! A real-time capture engine: a producer logs one multi-channel frame per
//! tick into a ring buffer, a trigger state machine decides when the buffered
//! signal forms a window worth exporting, an optional spectral pipeline turns
//! windows into magnitude spectra, and a delivery bridge hands finished
//! snapshots to a non-real-time worker that exports them. The producer path
//! never blocks, allocates or locks.

pub mod bridge;
pub mod config;
pub mod control;
pub mod error;
pub mod export;
pub mod ring;
pub mod scope;
pub mod slider;
pub mod snapshot;
pub mod spectral;
pub mod trigger;

pub use bridge::{BridgeStats, Payload};
pub use config::{
    BridgeConfig, PlotMode, ScopeConfig, SpectralAxis, SpectralConfig, TriggerDirection,
    TriggerMode, TriggerSettings,
};
pub use control::Setting;
pub use error::{Result, ScopeError};
pub use export::{BytesSink, ExportSink, JsonLinesSink, MemorySink, WireSink};
pub use ring::FrameRing;
pub use scope::{Scope, ScopeController, ScopeProducer, ScopeStats, TriggerHandle};
pub use slider::{SliderSpec, SliderStore};
pub use snapshot::{ScopeMessage, Snapshot, SnapshotHeader, TriggerInfo, TriggerOrigin};
pub use spectral::{FftResources, SpectralPipeline};
pub use trigger::{Phase, TriggerEngine};
