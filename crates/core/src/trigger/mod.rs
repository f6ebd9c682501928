//! Trigger state machine.
//!
//! Waiting -> Primed -> Collecting -> Emitting -> Waiting. The engine is
//! stepped once per captured frame by the producer and decides when the
//! buffered signal forms an exportable window. Nothing here allocates.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::{
    ring::FrameRing, snapshot::TriggerOrigin, ScopeConfig, TriggerDirection, TriggerMode,
    TriggerSettings,
};

const LATCH_BIT: u64 = 1 << 63;
const SPECTRAL_BIT: u8 = 1 << 2;
const PHASE_MASK: u8 = 0b11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Hold-off running; nothing armed.
    Waiting,
    /// Armed and watching for an edge, a forced trigger or the auto countdown.
    Primed,
    /// Fired; capturing the rest of the window.
    Collecting,
    /// Window complete and being handed off.
    Emitting,
}

impl Phase {
    fn code(self) -> u8 {
        match self {
            Self::Waiting => 0,
            Self::Primed => 1,
            Self::Collecting => 2,
            Self::Emitting => 3,
        }
    }

    fn from_code(code: u8) -> Self {
        match code & PHASE_MASK {
            0 => Self::Waiting,
            1 => Self::Primed,
            2 => Self::Collecting,
            _ => Self::Emitting,
        }
    }
}

/// A completed window, in absolute capture positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerWindow {
    pub start: u64,
    pub len: usize,
    pub position: u64,
    pub origin: TriggerOrigin,
}

impl TriggerWindow {
    pub fn end(&self) -> u64 {
        self.start + self.len as u64
    }
}

/// State the producer publishes and the controller touches concurrently.
///
/// The forced-trigger latch and its position share one atomic word, so the
/// producer observes either no request or a complete one.
#[derive(Debug, Default)]
pub struct TriggerShared {
    status: AtomicU8,
    write_position: AtomicU64,
    latch: AtomicU64,
}

impl TriggerShared {
    pub fn phase(&self) -> Phase {
        Phase::from_code(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn publish(&self, phase: Phase, spectral: bool, newest: u64) {
        self.write_position.store(newest, Ordering::Release);
        let status = phase.code() | if spectral { SPECTRAL_BIT } else { 0 };
        self.status.store(status, Ordering::Release);
    }

    /// Forced-trigger request. Accepted only while the time-domain trigger
    /// is primed and no request is outstanding.
    pub fn request(&self) -> bool {
        let status = self.status.load(Ordering::Acquire);
        if status & SPECTRAL_BIT != 0 || Phase::from_code(status) != Phase::Primed {
            return false;
        }
        let position = self.write_position.load(Ordering::Acquire) & !LATCH_BIT;
        self.latch
            .compare_exchange(0, LATCH_BIT | position, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Consumes an outstanding request, yielding its position.
    pub(crate) fn take(&self) -> Option<u64> {
        let word = self.latch.swap(0, Ordering::AcqRel);
        (word & LATCH_BIT != 0).then_some(word & !LATCH_BIT)
    }

    pub(crate) fn clear(&self) {
        self.latch.store(0, Ordering::Release);
    }
}

#[derive(Debug, Clone)]
pub struct TriggerEngine {
    settings: TriggerSettings,
    capture_width: usize,
    x_offset: isize,
    hold_off: usize,
    auto_timeout: usize,
    phase: Phase,
    countdown: usize,
    auto_count: usize,
    primed_at: u64,
    armed: Option<TriggerWindow>,
}

impl TriggerEngine {
    pub fn new(config: &ScopeConfig) -> Self {
        let mut engine = Self {
            settings: config.trigger,
            capture_width: config.capture_width(),
            x_offset: config.x_offset,
            hold_off: config.hold_off,
            auto_timeout: config.auto_timeout(),
            phase: Phase::Waiting,
            countdown: 0,
            auto_count: 0,
            primed_at: 0,
            armed: None,
        };
        engine.restart();
        engine
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn settings(&self) -> &TriggerSettings {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: TriggerSettings) {
        self.settings = settings;
    }

    /// Takes effect from the next trigger.
    pub fn set_x_offset(&mut self, x_offset: isize) {
        self.x_offset = x_offset;
    }

    /// Takes effect from the next hold-off.
    pub fn set_hold_off(&mut self, hold_off: usize) {
        self.hold_off = hold_off;
    }

    /// Back to Waiting with a hold-off long enough to also cover the
    /// pre-trigger part of the first window.
    pub fn restart(&mut self) {
        self.phase = Phase::Waiting;
        self.countdown = self.hold_off.max(self.pre_trigger());
        self.auto_count = 0;
        self.armed = None;
    }

    /// Steps the time-domain policy for the newest frame in `ring`.
    /// `forced` is a consumed forced-trigger position.
    pub fn step(&mut self, ring: &FrameRing, forced: Option<u64>) -> Option<TriggerWindow> {
        let newest = ring.newest()?;
        match self.phase {
            Phase::Waiting => {
                self.hold(newest);
                None
            }
            Phase::Primed => {
                let fire = if let Some(position) = forced {
                    Some((position.clamp(self.primed_at, newest), TriggerOrigin::Forced))
                } else if self.settings.mode != TriggerMode::Custom && self.edge_at(ring, newest) {
                    Some((newest, TriggerOrigin::Edge))
                } else if self.settings.mode == TriggerMode::Auto {
                    self.auto_count += 1;
                    (self.auto_count >= self.auto_timeout).then_some((newest, TriggerOrigin::Auto))
                } else {
                    None
                };
                let (position, origin) = fire?;
                self.arm(position, origin);
                self.check_complete(newest)
            }
            Phase::Collecting => self.check_complete(newest),
            Phase::Emitting => None,
        }
    }

    /// Steps the spectral policy: edge logic is bypassed and the trigger
    /// fires once the pipeline reports a full transform window.
    pub fn step_spectral(
        &mut self,
        newest: u64,
        window_full: bool,
        length: usize,
    ) -> Option<TriggerWindow> {
        match self.phase {
            Phase::Waiting => {
                self.hold(newest);
                None
            }
            Phase::Primed if window_full => {
                let window = TriggerWindow {
                    start: (newest + 1).saturating_sub(length as u64),
                    len: length,
                    position: newest,
                    origin: TriggerOrigin::Spectral,
                };
                self.phase = Phase::Emitting;
                Some(window)
            }
            _ => None,
        }
    }

    /// Emitting -> Waiting once the window has been handed off.
    pub fn complete(&mut self) {
        self.phase = Phase::Waiting;
        self.countdown = self.hold_off;
        self.armed = None;
    }

    fn hold(&mut self, newest: u64) {
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown == 0 {
            self.phase = Phase::Primed;
            self.auto_count = 0;
            self.primed_at = newest;
        }
    }

    fn arm(&mut self, position: u64, origin: TriggerOrigin) {
        let start = (position as i64 - self.x_offset as i64).max(0) as u64;
        self.armed = Some(TriggerWindow {
            start,
            len: self.capture_width,
            position,
            origin,
        });
        self.auto_count = 0;
        self.phase = Phase::Collecting;
    }

    fn check_complete(&mut self, newest: u64) -> Option<TriggerWindow> {
        let window = self.armed?;
        if newest + 1 < window.end() {
            return None;
        }
        self.phase = Phase::Emitting;
        Some(window)
    }

    fn edge_at(&self, ring: &FrameRing, newest: u64) -> bool {
        let Some(previous) = newest.checked_sub(1) else {
            return false;
        };
        let channel = self.settings.channel;
        let (Some(prev), Some(cur)) = (ring.sample(previous, channel), ring.sample(newest, channel))
        else {
            return false;
        };
        let level = self.settings.level;
        match self.settings.direction {
            TriggerDirection::Rising => prev < level && level <= cur,
            TriggerDirection::Falling => prev > level && level >= cur,
        }
    }

    fn pre_trigger(&self) -> usize {
        self.x_offset.max(0) as usize
    }
}
