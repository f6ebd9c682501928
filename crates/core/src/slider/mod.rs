use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::{Result, ScopeError};

/// Range, step and label of one slider, announced to the viewer at start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliderSpec {
    pub min: f32,
    pub max: f32,
    pub step: f32,
    pub value: f32,
    pub name: String,
}

impl Default for SliderSpec {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 1.0,
            step: 0.01,
            value: 0.5,
            name: "Slider".to_owned(),
        }
    }
}

impl SliderSpec {
    /// Clamps `value` into range and snaps it to the step grid.
    pub fn quantize(&self, value: f32) -> f32 {
        let snapped = if self.step > 0.0 {
            self.min + ((value - self.min) / self.step).round() * self.step
        } else {
            value
        };
        snapped.clamp(self.min, self.max)
    }
}

#[derive(Debug)]
struct SliderSlot {
    /// `f32` bits.
    value: AtomicU32,
    changed: AtomicBool,
}

impl SliderSlot {
    fn new(value: f32) -> Self {
        Self {
            value: AtomicU32::new(value.to_bits()),
            changed: AtomicBool::new(false),
        }
    }

    fn store(&self, value: f32) {
        self.value.store(value.to_bits(), Ordering::Relaxed);
        self.changed.store(true, Ordering::Release);
    }
}

/// Externally written, real-time read parameter slots.
///
/// The non-real-time side is the only writer of values and the only setter
/// of change flags; the producer only reads values and clears flags. Every
/// field is a single atomic, so neither side ever waits on the other.
#[derive(Debug, Default)]
pub struct SliderStore {
    specs: Vec<SliderSpec>,
    slots: Vec<SliderSlot>,
}

impl SliderStore {
    pub fn new(count: usize) -> Self {
        let spec = SliderSpec::default();
        Self {
            slots: (0..count).map(|_| SliderSlot::new(spec.value)).collect(),
            specs: vec![spec; count],
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn specs(&self) -> &[SliderSpec] {
        &self.specs
    }

    /// Initialises slot `index`. Setup only: requires exclusive access.
    pub fn set(&mut self, index: usize, spec: SliderSpec) -> Result<()> {
        self.check(index)?;
        if !(spec.min < spec.max) || !spec.step.is_finite() || spec.step < 0.0 {
            return Err(ScopeError::InvalidInput(
                "slider needs min < max and a non-negative step",
            ));
        }
        let value = spec.quantize(spec.value);
        self.slots[index].store(value);
        self.specs[index] = SliderSpec { value, ..spec };
        Ok(())
    }

    /// External write. Returns the stored value after clamping and snapping.
    pub fn write(&self, index: usize, value: f32) -> Result<f32> {
        self.check(index)?;
        if !value.is_finite() {
            return Err(ScopeError::InvalidInput("slider value must be finite"));
        }
        let value = self.specs[index].quantize(value);
        self.slots[index].store(value);
        Ok(value)
    }

    /// Current value; leaves the change flag untouched.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`SliderStore::len`].
    pub fn read(&self, index: usize) -> f32 {
        f32::from_bits(self.slots[index].value.load(Ordering::Acquire))
    }

    /// Whether slot `index` was written since the last poll. Clears the flag.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`SliderStore::len`].
    pub fn poll_changed(&self, index: usize) -> bool {
        self.slots[index].changed.swap(false, Ordering::AcqRel)
    }

    fn check(&self, index: usize) -> Result<()> {
        if index >= self.slots.len() {
            return Err(ScopeError::SliderOutOfRange {
                index,
                count: self.slots.len(),
            });
        }
        Ok(())
    }
}
