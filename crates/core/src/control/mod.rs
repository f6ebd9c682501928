//! Control channels
//!
//! Lock-free communication between the non-real-time controller and the
//! producer. Commands flow to the producer through an rtrb SPSC ring and are
//! drained at the start of a tick; replaced transform resources flow back so
//! they are freed off the real-time thread.

use rtrb::{Consumer, Producer, RingBuffer};
use serde::{Deserialize, Serialize};

use crate::{
    spectral::FftResources, PlotMode, SpectralAxis, TriggerDirection, TriggerMode, TriggerSettings,
};

/// Most commands applied during a single tick.
pub const MAX_COMMANDS_PER_TICK: usize = 4;

/// A runtime-adjustable engine setting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "value", rename_all = "snake_case")]
pub enum Setting {
    /// Every trigger parameter at once, applied within a single tick.
    Trigger(TriggerSettings),
    TriggerMode(TriggerMode),
    TriggerChannel(usize),
    TriggerDirection(TriggerDirection),
    TriggerLevel(f32),
    XOffset(isize),
    HoldOff(usize),
    PlotMode(PlotMode),
    SpectralAxis(SpectralAxis),
}

/// Controller to producer.
#[derive(Debug)]
pub enum Command {
    Apply(Setting),
    /// Transform resources built off-thread, swapped in at the next idle
    /// boundary of the spectral pipeline.
    ResizeFft(Box<FftResources>),
}

/// Producer to controller.
#[derive(Debug)]
pub enum ControlEvent {
    /// Resources no longer used by the producer, to be dropped by the
    /// controller.
    Retired(Box<FftResources>),
}

/// Both directions, before being split between the two threads.
pub struct ControlChannels {
    command_tx: Producer<Command>,
    command_rx: Consumer<Command>,
    event_tx: Producer<ControlEvent>,
    event_rx: Consumer<ControlEvent>,
}

impl ControlChannels {
    /// Both rings get `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        let (command_tx, command_rx) = RingBuffer::new(capacity);
        let (event_tx, event_rx) = RingBuffer::new(capacity);
        Self {
            command_tx,
            command_rx,
            event_tx,
            event_rx,
        }
    }

    /// Splits into the controller-side and producer-side handles.
    pub fn split(self) -> (ControlHandle, EngineControl) {
        (
            ControlHandle {
                command_tx: self.command_tx,
                event_rx: self.event_rx,
            },
            EngineControl {
                command_rx: self.command_rx,
                event_tx: self.event_tx,
            },
        )
    }
}

/// Controller side.
pub struct ControlHandle {
    command_tx: Producer<Command>,
    event_rx: Consumer<ControlEvent>,
}

impl ControlHandle {
    /// Queues a command without waiting. Gives the command back if full.
    pub fn send(&mut self, command: Command) -> Result<(), Command> {
        self.command_tx
            .push(command)
            .map_err(|rtrb::PushError::Full(command)| command)
    }

    pub fn recv_event(&mut self) -> Option<ControlEvent> {
        self.event_rx.pop().ok()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ControlEvent> + '_ {
        std::iter::from_fn(|| self.recv_event())
    }

    pub fn event_capacity(&self) -> usize {
        self.event_rx.buffer().capacity()
    }
}

/// Producer side. Every method is non-blocking and allocation-free.
pub struct EngineControl {
    command_rx: Consumer<Command>,
    event_tx: Producer<ControlEvent>,
}

impl EngineControl {
    pub fn recv_command(&mut self) -> Option<Command> {
        self.command_rx.pop().ok()
    }

    /// Hands an event back; returns it if the ring is full.
    pub fn send_event(&mut self, event: ControlEvent) -> Result<(), ControlEvent> {
        self.event_tx
            .push(event)
            .map_err(|rtrb::PushError::Full(event)| event)
    }

    pub fn event_slots(&self) -> usize {
        self.event_tx.slots()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_arrive_in_order() {
        let (mut controller, mut engine) = ControlChannels::new(4).split();
        controller
            .send(Command::Apply(Setting::TriggerLevel(0.25)))
            .unwrap();
        controller
            .send(Command::Apply(Setting::PlotMode(PlotMode::Spectral)))
            .unwrap();

        assert!(matches!(
            engine.recv_command(),
            Some(Command::Apply(Setting::TriggerLevel(level))) if level == 0.25
        ));
        assert!(matches!(
            engine.recv_command(),
            Some(Command::Apply(Setting::PlotMode(PlotMode::Spectral)))
        ));
        assert!(engine.recv_command().is_none());
    }

    #[test]
    fn full_queue_returns_the_command() {
        let (mut controller, _engine) = ControlChannels::new(1).split();
        assert!(controller.send(Command::Apply(Setting::HoldOff(1))).is_ok());
        let rejected = controller.send(Command::Apply(Setting::HoldOff(2)));
        assert!(matches!(
            rejected,
            Err(Command::Apply(Setting::HoldOff(2)))
        ));
    }

    #[test]
    fn settings_serialise_by_name() {
        let json = serde_json::to_string(&Setting::TriggerChannel(3)).unwrap();
        assert_eq!(json, r#"{"name":"trigger_channel","value":3}"#);
    }

    #[test]
    fn handles_are_send() {
        fn assert_send<T: Send>() {}
        assert_send::<ControlHandle>();
        assert_send::<EngineControl>();
    }
}
