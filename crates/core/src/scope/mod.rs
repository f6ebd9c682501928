//! Scope engine: setup, the real-time producer and the non-real-time
//! controller.
//!
//! [`Scope`] is the setup phase. [`Scope::start`] consumes it and returns a
//! [`ScopeProducer`] for the real-time thread and a [`ScopeController`] for
//! everything else, so setup-only calls cannot race the tick.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    bridge::{self, BridgePoster, BridgeStats, BridgeWorker, Payload},
    config::{check_fft_length, check_offset, check_trigger},
    control::{
        Command, ControlChannels, ControlEvent, ControlHandle, EngineControl, Setting,
        MAX_COMMANDS_PER_TICK,
    },
    export::ExportSink,
    ring::FrameRing,
    slider::{SliderSpec, SliderStore},
    snapshot::{ScopeMessage, Snapshot, SnapshotHeader, TriggerInfo},
    spectral::{FftResources, SpectralPipeline},
    trigger::{Phase, TriggerEngine, TriggerShared, TriggerWindow},
    PlotMode, Result, ScopeConfig, ScopeError, TriggerDirection, TriggerMode, TriggerSettings,
};

/// Flags for the two-phase stop.
#[derive(Debug, Default)]
struct RunState {
    stop_requested: AtomicBool,
    in_tick: AtomicBool,
}

#[derive(Debug, Default)]
struct EngineCounters {
    ticks: AtomicU64,
    triggers: AtomicU64,
}

/// Counters sampled by [`ScopeController::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScopeStats {
    /// Frames captured after down-sampling.
    pub ticks: u64,
    pub triggers: u64,
    pub posted: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub export_failures: u64,
}

/// Setup phase of a scope.
#[derive(Debug)]
pub struct Scope {
    config: ScopeConfig,
    sliders: SliderStore,
}

impl Scope {
    /// Validates `config`. Every configuration error surfaces here.
    pub fn setup(config: ScopeConfig) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            channels = config.channels,
            sample_rate = config.sample_rate,
            plot_mode = ?config.plot_mode,
            "scope configured"
        );
        Ok(Self {
            sliders: SliderStore::new(config.slider_count),
            config,
        })
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    /// Initialises a slider. Its changed flag reads true once after start.
    pub fn set_slider(
        &mut self,
        index: usize,
        min: f32,
        max: f32,
        step: f32,
        value: f32,
        name: impl Into<String>,
    ) -> Result<()> {
        let spec = SliderSpec {
            min,
            max,
            step,
            value,
            name: name.into(),
        };
        self.sliders.set(index, spec)
    }

    pub fn set_trigger(
        &mut self,
        mode: TriggerMode,
        channel: usize,
        direction: TriggerDirection,
        level: f32,
    ) -> Result<()> {
        let trigger = TriggerSettings {
            mode,
            channel,
            direction,
            level,
        };
        check_trigger(&trigger, self.config.channels)?;
        self.config.trigger = trigger;
        Ok(())
    }

    /// Allocates every buffer, spawns the delivery worker that owns `sink`,
    /// and splits the scope into its real-time and control halves.
    pub fn start<S>(self, sink: S) -> Result<(ScopeProducer, ScopeController<S>)>
    where
        S: ExportSink + Send + 'static,
    {
        let Self { config, sliders } = self;
        let spectral = SpectralPipeline::new(&config.fft, config.channels)?;
        let sliders = Arc::new(sliders);
        let (mut poster, worker) = bridge::spawn(
            "scope-delivery",
            &config.bridge,
            config.snapshot_capacity(),
            1 + sliders.len(),
            sink,
        )?;

        poster.post(Payload::Message(ScopeMessage::Layout {
            channels: config.channels,
            sample_rate: config.sample_rate,
            pixel_width: config.pixel_width,
            frame_width: config.frame_width,
        }));
        for (index, spec) in sliders.specs().iter().enumerate() {
            poster.post(Payload::Message(ScopeMessage::Slider {
                index,
                spec: spec.clone(),
            }));
        }

        let (control, engine_control) = ControlChannels::new(config.command_capacity).split();
        let shared = Arc::new(TriggerShared::default());
        let run = Arc::new(RunState::default());
        let counters = Arc::new(EngineCounters::default());

        tracing::info!(
            channels = config.channels,
            frame_width = config.frame_width,
            fft_length = config.fft.length,
            generations = config.bridge.generations,
            "scope started"
        );

        let producer = ScopeProducer {
            ring: FrameRing::new(config.channels, config.ring_capacity()),
            trigger: TriggerEngine::new(&config),
            spectral,
            plot_mode: config.plot_mode,
            down_count: 0,
            sequence: 0,
            poster,
            control: engine_control,
            shared: Arc::clone(&shared),
            sliders: Arc::clone(&sliders),
            run: Arc::clone(&run),
            counters: Arc::clone(&counters),
            config,
        };
        let controller = ScopeController {
            live: LiveSettings::from(&producer.config),
            config: producer.config.clone(),
            control,
            outstanding_resizes: 0,
            worker,
            shared,
            sliders,
            run,
            counters,
        };
        Ok((producer, controller))
    }
}

/// Real-time half. Owns the ring, trigger engine and spectral pipeline.
pub struct ScopeProducer {
    config: ScopeConfig,
    ring: FrameRing,
    trigger: TriggerEngine,
    spectral: SpectralPipeline,
    plot_mode: PlotMode,
    down_count: usize,
    sequence: u64,
    poster: BridgePoster,
    control: EngineControl,
    shared: Arc<TriggerShared>,
    sliders: Arc<SliderStore>,
    run: Arc<RunState>,
    counters: Arc<EngineCounters>,
}

impl ScopeProducer {
    /// Logs one frame, one value per channel. Call once per tick from the
    /// real-time thread. Never blocks, allocates or takes a lock; a no-op
    /// once the scope has been stopped.
    pub fn log(&mut self, values: &[f32]) {
        if self.run.stop_requested.load(Ordering::Acquire) {
            return;
        }
        self.run.in_tick.store(true, Ordering::SeqCst);
        if !self.run.stop_requested.load(Ordering::SeqCst) {
            self.tick(values);
        }
        self.run.in_tick.store(false, Ordering::Release);
    }

    /// Logs every complete frame of an interleaved block.
    pub fn log_frames(&mut self, interleaved: &[f32]) {
        for frame in interleaved.chunks_exact(self.config.channels) {
            self.log(frame);
        }
    }

    /// Current slider value. Leaves the changed flag set.
    pub fn slider_value(&self, index: usize) -> f32 {
        self.sliders.read(index)
    }

    /// True once after each external write to the slider.
    pub fn slider_changed(&self, index: usize) -> bool {
        self.sliders.poll_changed(index)
    }

    pub fn phase(&self) -> Phase {
        self.trigger.phase()
    }

    pub fn plot_mode(&self) -> PlotMode {
        self.plot_mode
    }

    pub fn fft_length(&self) -> usize {
        self.spectral.length()
    }

    fn tick(&mut self, values: &[f32]) {
        if self.config.down_sampling > 1 {
            self.down_count += 1;
            if self.down_count < self.config.down_sampling {
                return;
            }
            self.down_count = 0;
        }

        self.process_commands();
        self.apply_pending_resize();

        self.ring.write(values);
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        let Some(newest) = self.ring.newest() else {
            return;
        };

        let window = match self.plot_mode {
            PlotMode::TimeDomain => {
                let forced = if self.trigger.phase() == Phase::Primed {
                    self.shared.take()
                } else {
                    None
                };
                self.trigger.step(&self.ring, forced)
            }
            PlotMode::Spectral => {
                let full = self.trigger.phase() == Phase::Primed && self.spectral.push(values);
                self.trigger
                    .step_spectral(newest, full, self.spectral.length())
            }
        };

        if let Some(window) = window {
            self.counters.triggers.fetch_add(1, Ordering::Relaxed);
            self.emit(&window);
            self.ring.advance_read(window.end());
            self.trigger.complete();
        }

        let phase = self.trigger.phase();
        if phase == Phase::Primed && self.trigger_just_armed() {
            self.shared.clear();
        }
        self.shared
            .publish(phase, self.plot_mode == PlotMode::Spectral, newest);
    }

    /// True on the tick the engine moved from Waiting to Primed.
    fn trigger_just_armed(&self) -> bool {
        self.shared.phase() == Phase::Waiting
    }

    fn emit(&mut self, window: &TriggerWindow) {
        let Some(mut snapshot) = self.poster.acquire() else {
            // The held window is consumed by the drop; the next spectral
            // trigger needs a fresh one.
            self.spectral.reset();
            self.poster.stats().record_drop();
            return;
        };

        let settings = *self.trigger.settings();
        let (frame_width, sample_rate) = match self.plot_mode {
            PlotMode::TimeDomain => (self.config.frame_width, self.config.effective_sample_rate()),
            PlotMode::Spectral => (
                self.spectral.bins(),
                self.config.sample_rate / self.config.down_sampling as f32,
            ),
        };
        snapshot.header = SnapshotHeader {
            channels: self.config.channels,
            frame_width,
            sample_rate,
            plot_mode: self.plot_mode,
            trigger: TriggerInfo {
                mode: settings.mode,
                channel: settings.channel,
                direction: settings.direction,
                level: settings.level,
                origin: window.origin,
                position: window.position,
            },
            sequence: self.sequence,
        };

        let filled = match self.plot_mode {
            PlotMode::TimeDomain => {
                self.fill_time_domain(&mut snapshot, window);
                true
            }
            PlotMode::Spectral => {
                let payload = snapshot.reset_payload(self.config.channels * frame_width);
                self.spectral.transform_into(payload).is_ok()
            }
        };

        if filled {
            self.sequence += 1;
            self.poster.post(Payload::Snapshot(snapshot));
        } else {
            self.poster.release(snapshot);
            self.poster.stats().record_drop();
        }
    }

    /// Copies the window into `snapshot`, interpolating linearly when
    /// up-sampling.
    fn fill_time_domain(&self, snapshot: &mut Snapshot, window: &TriggerWindow) {
        let channels = self.config.channels;
        let width = self.config.frame_width;
        let up = self.config.up_sampling;
        let payload = snapshot.reset_payload(channels * width);
        let ring = &self.ring;

        for (channel, out) in payload.chunks_exact_mut(width).enumerate() {
            for (index, value) in out.iter_mut().enumerate() {
                let position = window.start + (index / up) as u64;
                let current = ring.sample(position, channel).unwrap_or(0.0);
                *value = if up > 1 {
                    let fraction = (index % up) as f32 / up as f32;
                    let next = ring.sample(position + 1, channel).unwrap_or(current);
                    current + (next - current) * fraction
                } else {
                    current
                };
            }
        }
    }

    fn process_commands(&mut self) {
        for _ in 0..MAX_COMMANDS_PER_TICK {
            let Some(command) = self.control.recv_command() else {
                break;
            };
            match command {
                Command::Apply(setting) => {
                    self.apply_setting(setting);
                    self.poster
                        .post(Payload::Message(ScopeMessage::Setting { setting }));
                }
                Command::ResizeFft(resources) => {
                    if let Some(superseded) = self.spectral.stage(resources) {
                        self.retire(superseded);
                    }
                }
            }
        }
    }

    fn apply_setting(&mut self, setting: Setting) {
        let mut trigger = *self.trigger.settings();
        match setting {
            Setting::Trigger(settings) => trigger = settings,
            Setting::TriggerMode(mode) => trigger.mode = mode,
            Setting::TriggerChannel(channel) => trigger.channel = channel,
            Setting::TriggerDirection(direction) => trigger.direction = direction,
            Setting::TriggerLevel(level) => trigger.level = level,
            Setting::XOffset(x_offset) => self.trigger.set_x_offset(x_offset),
            Setting::HoldOff(hold_off) => self.trigger.set_hold_off(hold_off),
            Setting::PlotMode(mode) => {
                if mode != self.plot_mode {
                    self.plot_mode = mode;
                    self.spectral.reset();
                    self.trigger.restart();
                }
            }
            Setting::SpectralAxis(axis) => self.spectral.set_axis(axis),
        }
        self.trigger.set_settings(trigger);
    }

    fn apply_pending_resize(&mut self) {
        if !self.spectral.has_pending() || self.control.event_slots() == 0 {
            return;
        }
        if let Some(retired) = self.spectral.apply_pending() {
            let length = self.spectral.length();
            self.retire(retired);
            self.poster
                .post(Payload::Message(ScopeMessage::FftResized { length }));
        }
    }

    /// Sends replaced resources back to the controller for freeing. The
    /// controller never has more resizes outstanding than the event ring
    /// holds, so the push succeeds.
    fn retire(&mut self, resources: Box<FftResources>) {
        let sent = self.control.send_event(ControlEvent::Retired(resources));
        debug_assert!(sent.is_ok(), "retired transform resources had no event slot");
    }
}

impl fmt::Debug for ScopeProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeProducer")
            .field("plot_mode", &self.plot_mode)
            .field("phase", &self.trigger.phase())
            .field("write_pointer", &self.ring.write_pointer())
            .field("fft_length", &self.spectral.length())
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Forced-trigger entry point that can be cloned onto other threads.
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    shared: Arc<TriggerShared>,
}

impl TriggerHandle {
    /// Requests a forced trigger. Returns false unless the time-domain
    /// trigger is currently primed.
    pub fn trigger(&self) -> bool {
        self.shared.request()
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }
}

/// Controller-side copy of the settings the producer can change at runtime,
/// used to validate requests before they are queued.
#[derive(Debug, Clone, Copy)]
struct LiveSettings {
    trigger: TriggerSettings,
    fft_length: usize,
}

impl From<&ScopeConfig> for LiveSettings {
    fn from(config: &ScopeConfig) -> Self {
        Self {
            trigger: config.trigger,
            fft_length: config.fft.length,
        }
    }
}

/// Non-real-time half: forced triggers, runtime settings, slider writes and
/// the two-phase stop.
pub struct ScopeController<S> {
    config: ScopeConfig,
    live: LiveSettings,
    control: ControlHandle,
    outstanding_resizes: usize,
    worker: BridgeWorker<S>,
    shared: Arc<TriggerShared>,
    sliders: Arc<SliderStore>,
    run: Arc<RunState>,
    counters: Arc<EngineCounters>,
}

impl<S> ScopeController<S> {
    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    /// Forces a trigger. Safe to call while the producer is mid-tick; the
    /// request is seen either entirely or not at all on the next tick.
    pub fn trigger(&self) -> bool {
        self.shared.request()
    }

    pub fn trigger_handle(&self) -> TriggerHandle {
        TriggerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    pub fn set_trigger(
        &mut self,
        mode: TriggerMode,
        channel: usize,
        direction: TriggerDirection,
        level: f32,
    ) -> Result<()> {
        let trigger = TriggerSettings {
            mode,
            channel,
            direction,
            level,
        };
        self.apply(Setting::Trigger(trigger))
    }

    /// Validates and queues a runtime setting for the producer.
    pub fn apply(&mut self, setting: Setting) -> Result<()> {
        self.reclaim();
        let mut trigger = self.live.trigger;
        match setting {
            Setting::Trigger(settings) => trigger = settings,
            Setting::TriggerMode(mode) => trigger.mode = mode,
            Setting::TriggerChannel(channel) => trigger.channel = channel,
            Setting::TriggerDirection(direction) => trigger.direction = direction,
            Setting::TriggerLevel(level) => trigger.level = level,
            Setting::XOffset(x_offset) => check_offset(x_offset, self.config.capture_width())?,
            Setting::HoldOff(_) | Setting::PlotMode(_) | Setting::SpectralAxis(_) => {}
        }
        check_trigger(&trigger, self.config.channels)?;
        self.control
            .send(Command::Apply(setting))
            .map_err(|_| ScopeError::QueueFull)?;
        self.live.trigger = trigger;
        tracing::debug!(?setting, "setting queued");
        Ok(())
    }

    /// Builds transform resources for `length` here, off the real-time
    /// thread, and stages them. The producer swaps them in once its current
    /// spectral window is idle.
    pub fn set_fft_length(&mut self, length: usize) -> Result<()> {
        self.reclaim();
        check_fft_length(length, self.config.fft.max_length)?;
        if self.outstanding_resizes >= self.control.event_capacity() {
            return Err(ScopeError::QueueFull);
        }
        let resources = FftResources::new(length, self.config.fft.max_length, self.config.channels)?;
        self.control
            .send(Command::ResizeFft(resources))
            .map_err(|_| ScopeError::QueueFull)?;
        self.outstanding_resizes += 1;
        self.live.fft_length = length;
        tracing::info!(length, "transform resize staged");
        Ok(())
    }

    /// Most recently requested transform length.
    pub fn requested_fft_length(&self) -> usize {
        self.live.fft_length
    }

    /// External slider write; the producer sees the changed flag once.
    pub fn write_slider(&self, index: usize, value: f32) -> Result<f32> {
        self.sliders.write(index, value)
    }

    pub fn slider_value(&self, index: usize) -> Result<f32> {
        if index >= self.sliders.len() {
            return Err(ScopeError::SliderOutOfRange {
                index,
                count: self.sliders.len(),
            });
        }
        Ok(self.sliders.read(index))
    }

    pub fn sliders(&self) -> &[SliderSpec] {
        self.sliders.specs()
    }

    pub fn stats(&self) -> ScopeStats {
        let bridge: &BridgeStats = self.worker.stats();
        ScopeStats {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            triggers: self.counters.triggers.load(Ordering::Relaxed),
            posted: bridge.posted(),
            dropped: bridge.dropped(),
            delivered: bridge.delivered(),
            export_failures: bridge.failed(),
        }
    }

    /// Two-phase stop: request the stop, wait out any tick in progress, then
    /// shut the delivery worker down after it drains. Returns the sink.
    pub fn stop(mut self) -> Result<S> {
        self.run.stop_requested.store(true, Ordering::SeqCst);
        while self.run.in_tick.load(Ordering::SeqCst) {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
        self.reclaim();
        let stats = self.stats();
        let sink = self.worker.shutdown()?;
        tracing::info!(
            triggers = stats.triggers,
            delivered = stats.delivered,
            dropped = stats.dropped,
            "scope stopped"
        );
        Ok(sink)
    }

    /// Frees resources the producer has handed back.
    fn reclaim(&mut self) {
        for event in self.control.drain_events() {
            match event {
                ControlEvent::Retired(resources) => {
                    tracing::trace!(length = resources.length(), "transform resources freed");
                    self.outstanding_resizes = self.outstanding_resizes.saturating_sub(1);
                }
            }
        }
    }
}

impl<S> fmt::Debug for ScopeController<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeController")
            .field("phase", &self.shared.phase())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::f32::consts::PI;

    use super::*;
    use crate::{export::MemorySink, snapshot::TriggerOrigin, SpectralAxis};

    fn time_config(mode: TriggerMode) -> ScopeConfig {
        ScopeConfig {
            channels: 2,
            sample_rate: 1000.0,
            frame_width: 16,
            hold_off: 4,
            trigger: TriggerSettings {
                mode,
                level: 0.5,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn start(config: ScopeConfig) -> (ScopeProducer, ScopeController<MemorySink>) {
        Scope::setup(config).unwrap().start(MemorySink::default()).unwrap()
    }

    fn snapshots(sink: &MemorySink) -> &[Snapshot] {
        &sink.snapshots
    }

    /// Logs frames, waiting for the worker to recycle buffers so no snapshot
    /// is dropped.
    fn log_paced(producer: &mut ScopeProducer, controller: &ScopeController<MemorySink>, frames: &[[f32; 2]]) {
        for frame in frames {
            while controller.stats().posted > controller.stats().delivered + 1 {
                std::thread::yield_now();
            }
            producer.log(frame);
        }
    }

    #[test]
    fn setup_rejects_invalid_configuration() {
        let config = ScopeConfig {
            channels: 2,
            trigger: TriggerSettings {
                channel: 5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(Scope::setup(config), Err(ScopeError::InvalidConfig(_))));

        let mut scope = Scope::setup(ScopeConfig::default()).unwrap();
        assert!(scope
            .set_trigger(TriggerMode::Normal, 2, TriggerDirection::Rising, 0.0)
            .is_err());
    }

    #[test]
    fn normal_mode_emits_one_snapshot_per_crossing() {
        let (mut producer, controller) = start(time_config(TriggerMode::Normal));

        let mut frames = vec![[0.0, 7.0]; 10];
        frames.extend(vec![[1.0, 7.0]; 40]);
        log_paced(&mut producer, &controller, &frames);

        let sink = controller.stop().unwrap();
        let snaps = snapshots(&sink);
        assert_eq!(snaps.len(), 1);
        let header = &snaps[0].header;
        assert_eq!(header.trigger.origin, TriggerOrigin::Edge);
        assert_eq!(header.trigger.position, 10);
        assert_eq!(header.frame_width, 16);
        assert_eq!(snaps[0].channel(0), &[1.0; 16]);
        assert_eq!(snaps[0].channel(1), &[7.0; 16]);
    }

    #[test]
    fn normal_mode_without_edges_stays_silent() {
        let (mut producer, controller) = start(time_config(TriggerMode::Normal));
        log_paced(&mut producer, &controller, &vec![[0.2, 0.0]; 2000]);
        assert_eq!(producer.phase(), Phase::Primed);

        let sink = controller.stop().unwrap();
        assert!(sink.snapshots.is_empty());
        assert!(matches!(sink.messages[0], ScopeMessage::Layout { channels: 2, .. }));
    }

    #[test]
    fn auto_mode_emits_without_signal() {
        let config = time_config(TriggerMode::Auto);
        let budget = config.hold_off + config.auto_timeout() + config.capture_width();
        let (mut producer, controller) = start(config);
        log_paced(&mut producer, &controller, &vec![[0.0, 0.0]; budget]);

        let sink = controller.stop().unwrap();
        assert_eq!(sink.snapshots.len(), 1);
        assert_eq!(sink.snapshots[0].header.trigger.origin, TriggerOrigin::Auto);
    }

    #[test]
    fn forced_trigger_needs_primed_engine() {
        let (mut producer, controller) = start(time_config(TriggerMode::Custom));
        assert!(!controller.trigger());

        producer.log(&[0.0, 0.0]);
        assert_eq!(producer.phase(), Phase::Waiting);
        assert!(!controller.trigger());

        for _ in 0..5 {
            producer.log(&[0.0, 0.0]);
        }
        assert_eq!(producer.phase(), Phase::Primed);
        let handle = controller.trigger_handle();
        assert!(handle.trigger());
        assert!(!handle.trigger());

        producer.log(&[0.0, 0.0]);
        assert_eq!(producer.phase(), Phase::Collecting);
        for _ in 0..20 {
            producer.log(&[1.0, 1.0]);
        }

        let sink = controller.stop().unwrap();
        assert_eq!(sink.snapshots.len(), 1);
        assert_eq!(sink.snapshots[0].header.trigger.origin, TriggerOrigin::Forced);
        assert_eq!(sink.snapshots[0].header.trigger.mode, TriggerMode::Custom);
    }

    #[test]
    fn up_sampling_interpolates_between_captured_samples() {
        let config = ScopeConfig {
            channels: 1,
            frame_width: 8,
            up_sampling: 2,
            hold_off: 1,
            trigger: TriggerSettings {
                mode: TriggerMode::Normal,
                level: 0.5,
                ..Default::default()
            },
            ..Default::default()
        };
        let (mut producer, controller) = start(config);
        for value in [0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0] {
            producer.log(&[value]);
        }
        let sink = controller.stop().unwrap();
        assert_eq!(
            sink.snapshots[0].payload,
            vec![1.0, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0, 4.0]
        );
    }

    #[test]
    fn down_sampling_keeps_every_nth_frame() {
        let config = ScopeConfig {
            channels: 1,
            frame_width: 4,
            down_sampling: 3,
            hold_off: 1,
            trigger: TriggerSettings {
                mode: TriggerMode::Normal,
                level: 3.0,
                ..Default::default()
            },
            ..Default::default()
        };
        let (mut producer, controller) = start(config);
        for n in 0..30 {
            producer.log(&[n as f32]);
        }
        let stats = controller.stats();
        assert_eq!(stats.ticks, 10);
        let sink = controller.stop().unwrap();
        // Kept frames are 2, 5, 8, ...; the edge through 3.0 is at the second.
        assert_eq!(sink.snapshots[0].payload, vec![5.0, 8.0, 11.0, 14.0]);
        assert!((sink.snapshots[0].header.sample_rate - 44_100.0 / 3.0).abs() < 0.01);
    }

    #[test]
    fn spectral_mode_emits_peak_at_signal_bin() {
        let (length, rate, freq) = (256usize, 8000.0_f32, 1000.0_f32);
        let config = ScopeConfig {
            channels: 1,
            sample_rate: rate,
            plot_mode: PlotMode::Spectral,
            hold_off: 1,
            fft: crate::SpectralConfig {
                length,
                axis: SpectralAxis::Linear,
                ..Default::default()
            },
            ..Default::default()
        };
        let (mut producer, controller) = start(config);
        for n in 0..(length + 8) {
            producer.log(&[(2.0 * PI * freq * n as f32 / rate).sin()]);
        }

        let sink = controller.stop().unwrap();
        let snapshot = &sink.snapshots[0];
        assert_eq!(snapshot.header.plot_mode, PlotMode::Spectral);
        assert_eq!(snapshot.header.frame_width, length / 2);
        assert_eq!(snapshot.header.trigger.origin, TriggerOrigin::Spectral);
        let peak = snapshot
            .payload
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(bin, _)| bin)
            .unwrap();
        let expected = (freq * length as f32 / rate).round() as usize;
        assert!(peak.abs_diff(expected) <= 1);
    }

    #[test]
    fn forced_trigger_is_refused_in_spectral_mode() {
        let config = ScopeConfig {
            plot_mode: PlotMode::Spectral,
            hold_off: 1,
            ..Default::default()
        };
        let (mut producer, controller) = start(config);
        producer.log(&[0.0, 0.0]);
        producer.log(&[0.0, 0.0]);
        assert_eq!(producer.phase(), Phase::Primed);
        assert!(!controller.trigger());
        controller.stop().unwrap();
    }

    #[test]
    fn fft_resize_waits_for_idle_window() {
        let config = ScopeConfig {
            channels: 1,
            plot_mode: PlotMode::Spectral,
            hold_off: 1,
            fft: crate::SpectralConfig {
                length: 64,
                max_length: 256,
                ..Default::default()
            },
            ..Default::default()
        };
        let (mut producer, mut controller) = start(config);
        for _ in 0..10 {
            producer.log(&[0.0]);
        }
        controller.set_fft_length(128).unwrap();
        assert_eq!(controller.requested_fft_length(), 128);
        producer.log(&[0.0]);
        assert_eq!(producer.fft_length(), 64);

        for _ in 0..60 {
            producer.log(&[0.0]);
        }
        assert_eq!(producer.fft_length(), 128);
        assert!(controller.set_fft_length(100).is_err());

        let sink = controller.stop().unwrap();
        assert!(sink
            .messages
            .contains(&ScopeMessage::FftResized { length: 128 }));
    }

    #[test]
    fn runtime_settings_are_validated_and_applied() {
        let (mut producer, mut controller) = start(time_config(TriggerMode::Auto));
        assert!(controller.apply(Setting::TriggerChannel(9)).is_err());
        assert!(controller.apply(Setting::XOffset(16)).is_err());

        controller
            .set_trigger(TriggerMode::Custom, 1, TriggerDirection::Falling, 0.25)
            .unwrap();
        controller.apply(Setting::PlotMode(PlotMode::Spectral)).unwrap();
        producer.log(&[0.0, 0.0]);
        producer.log(&[0.0, 0.0]);
        assert_eq!(producer.plot_mode(), PlotMode::Spectral);

        let sink = controller.stop().unwrap();
        assert!(sink.messages.contains(&ScopeMessage::Setting {
            setting: Setting::Trigger(TriggerSettings {
                mode: TriggerMode::Custom,
                channel: 1,
                direction: TriggerDirection::Falling,
                level: 0.25,
            })
        }));
        assert!(sink.messages.contains(&ScopeMessage::Setting {
            setting: Setting::PlotMode(PlotMode::Spectral)
        }));
    }

    #[test]
    fn sliders_report_changes_once() {
        let config = ScopeConfig {
            slider_count: 2,
            ..Default::default()
        };
        let mut scope = Scope::setup(config).unwrap();
        scope.set_slider(0, 0.0, 10.0, 1.0, 3.0, "gain").unwrap();
        assert!(scope.set_slider(2, 0.0, 1.0, 0.1, 0.5, "nope").is_err());
        let (producer, controller) = scope.start(MemorySink::default()).unwrap();

        assert!(producer.slider_changed(0));
        assert!(!producer.slider_changed(0));
        assert!(!producer.slider_changed(1));
        assert!((producer.slider_value(0) - 3.0).abs() < f32::EPSILON);

        controller.write_slider(0, 7.0).unwrap();
        assert!(producer.slider_changed(0));
        assert!(!producer.slider_changed(0));
        assert!((producer.slider_value(0) - 7.0).abs() < f32::EPSILON);
        assert_eq!(controller.sliders()[0].name, "gain");

        let sink = controller.stop().unwrap();
        assert!(sink
            .messages
            .iter()
            .any(|m| matches!(m, ScopeMessage::Slider { index: 0, spec } if spec.name == "gain")));
    }

    #[test]
    fn stop_turns_log_into_no_op() {
        let (mut producer, controller) = start(time_config(TriggerMode::Auto));
        producer.log(&[0.0, 0.0]);
        let ticks = controller.stats().ticks;
        let _sink = controller.stop().unwrap();
        producer.log(&[0.0, 0.0]);
        assert_eq!(ticks, 1);
        assert_eq!(producer.phase(), Phase::Waiting);
    }

    #[test]
    fn slow_consumer_never_stalls_the_producer() {
        use std::time::{Duration, Instant};

        struct Slow(Vec<Snapshot>);
        impl ExportSink for Slow {
            fn export_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
                std::thread::sleep(Duration::from_millis(10));
                self.0.push(snapshot.clone());
                Ok(())
            }
        }

        let config = ScopeConfig {
            channels: 1,
            frame_width: 8,
            hold_off: 0,
            auto_trigger_timeout: Some(1),
            bridge: crate::BridgeConfig {
                generations: 2,
                ..Default::default()
            },
            ..Default::default()
        };
        let (mut producer, controller) = Scope::setup(config).unwrap().start(Slow(Vec::new())).unwrap();

        let started = Instant::now();
        for n in 0..20_000 {
            producer.log(&[n as f32]);
        }
        assert!(started.elapsed() < Duration::from_secs(2));

        let stats = controller.stats();
        assert!(stats.dropped > 0);
        let Slow(seen) = controller.stop().unwrap();
        assert!(!seen.is_empty());
        for snapshot in &seen {
            // Each window is a run of consecutive ramp values.
            for pair in snapshot.payload.windows(2) {
                assert_eq!(pair[1] - pair[0], 1.0);
            }
        }
    }

    /// Records snapshots after a fixed delay each.
    struct DelayedSink {
        delay: std::time::Duration,
        seen: Vec<Snapshot>,
    }

    impl DelayedSink {
        fn new(millis: u64) -> Self {
            Self {
                delay: std::time::Duration::from_millis(millis),
                seen: Vec::new(),
            }
        }
    }

    impl ExportSink for DelayedSink {
        fn export_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
            std::thread::sleep(self.delay);
            self.seen.push(snapshot.clone());
            Ok(())
        }
    }

    fn spectral_config(length: usize, hold_off: usize, generations: usize) -> ScopeConfig {
        ScopeConfig {
            channels: 1,
            plot_mode: PlotMode::Spectral,
            hold_off,
            fft: crate::SpectralConfig {
                length,
                axis: SpectralAxis::Linear,
                ..Default::default()
            },
            bridge: crate::BridgeConfig {
                generations,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn each_separate_crossing_emits_its_own_snapshot() {
        let (mut producer, controller) = start(time_config(TriggerMode::Normal));

        // Pulses every 40 frames; window 16 plus hold-off 4 fits between.
        let frames: Vec<[f32; 2]> = (0..120)
            .map(|n| [if n % 40 >= 10 && n % 40 < 13 { 1.0 } else { 0.0 }, 7.0])
            .collect();
        log_paced(&mut producer, &controller, &frames);
        assert_eq!(controller.stats().triggers, 3);

        let sink = controller.stop().unwrap();
        let positions: Vec<u64> = sink
            .snapshots
            .iter()
            .map(|s| s.header.trigger.position)
            .collect();
        assert_eq!(positions, vec![10, 50, 90]);
        for snapshot in &sink.snapshots {
            assert_eq!(&snapshot.channel(0)[..4], &[1.0, 1.0, 1.0, 0.0]);
            assert_eq!(snapshot.channel(1), &[7.0; 16]);
        }
    }

    #[test]
    fn trigger_settings_apply_all_or_nothing() {
        let config = ScopeConfig {
            command_capacity: 1,
            ..time_config(TriggerMode::Auto)
        };
        let (mut producer, mut controller) = start(config);

        controller.apply(Setting::HoldOff(8)).unwrap();
        let rejected = controller.set_trigger(TriggerMode::Normal, 1, TriggerDirection::Falling, 0.7);
        assert!(matches!(rejected, Err(ScopeError::QueueFull)));
        producer.log(&[0.0, 0.0]);

        controller
            .set_trigger(TriggerMode::Normal, 1, TriggerDirection::Falling, 0.7)
            .unwrap();
        producer.log(&[0.0, 0.0]);

        let sink = controller.stop().unwrap();
        let settings: Vec<Setting> = sink
            .messages
            .iter()
            .filter_map(|m| match m {
                ScopeMessage::Setting { setting } => Some(*setting),
                _ => None,
            })
            .collect();
        assert_eq!(
            settings,
            vec![
                Setting::HoldOff(8),
                Setting::Trigger(TriggerSettings {
                    mode: TriggerMode::Normal,
                    channel: 1,
                    direction: TriggerDirection::Falling,
                    level: 0.7,
                }),
            ]
        );
    }

    #[test]
    fn dropped_spectral_window_is_not_reused() {
        use std::time::Duration;

        let (mut producer, controller) = Scope::setup(spectral_config(64, 1, 1))
            .unwrap()
            .start(DelayedSink::new(200))
            .unwrap();

        // First window fires at position 64 and holds the only buffer.
        for _ in 0..70 {
            producer.log(&[1.0]);
        }
        // Second window fires at 129 while the buffer is still exporting.
        for _ in 0..70 {
            producer.log(&[2.0]);
        }
        let stats = controller.stats();
        assert_eq!(stats.triggers, 2);
        assert_eq!(stats.dropped, 1);

        std::thread::sleep(Duration::from_millis(400));
        for _ in 0..4 {
            producer.log(&[0.0]);
        }
        assert_eq!(controller.stats().triggers, 2);

        // Re-armed at 130, so the next full window ends 64 frames later.
        for _ in 0..60 {
            producer.log(&[3.0]);
        }
        assert_eq!(controller.stats().triggers, 3);

        let sink = controller.stop().unwrap();
        let positions: Vec<u64> = sink.seen.iter().map(|s| s.header.trigger.position).collect();
        assert_eq!(positions, vec![64, 194]);
    }

    #[test]
    fn spectral_backpressure_keeps_windows_fresh() {
        use std::time::{Duration, Instant};

        let (length, hold_off) = (64usize, 4usize);
        let period = (length + hold_off) as u64;
        let total = 20_000u64;
        let (mut producer, controller) = Scope::setup(spectral_config(length, hold_off, 1))
            .unwrap()
            .start(DelayedSink::new(5))
            .unwrap();

        // Constant within each trigger period, so a window's DC bin names
        // the period it was captured in.
        let started = Instant::now();
        for n in 0..total {
            producer.log(&[(n / period) as f32 + 1.0]);
        }
        assert!(started.elapsed() < Duration::from_secs(2));

        let stats = controller.stats();
        assert_eq!(stats.triggers, total / period);
        assert!(stats.dropped > 0);

        let sink = controller.stop().unwrap();
        assert!(!sink.seen.is_empty());
        assert_eq!(sink.seen.len() as u64 + stats.dropped, stats.triggers);
        for snapshot in &sink.seen {
            let position = snapshot.header.trigger.position;
            assert_eq!(position % period, period - 1);
            // Hann-windowed DC scaled by 2/N is value * (N - 1) / N.
            let value = (position / period) as f32 + 1.0;
            let expected = value * (length - 1) as f32 / length as f32;
            assert!((snapshot.payload[0] - expected).abs() < 1e-3 * value);
        }
    }
}
