use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::{config::check_fft_length, Result, SpectralAxis, SpectralConfig};

/// Smallest power fed to `log10` so silent bins stay finite.
const POWER_FLOOR: f32 = 1e-20;

/// Everything one transform length needs, allocated off the real-time thread.
pub struct FftResources {
    length: usize,
    channels: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    /// Accumulated samples, `length` per channel.
    inputs: Vec<f32>,
    work: Vec<f32>,
    spectrum: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl FftResources {
    /// Plans a forward transform and allocates all buffers for `length`.
    pub fn new(length: usize, max_length: usize, channels: usize) -> Result<Box<Self>> {
        check_fft_length(length, max_length)?;
        let mut planner = RealFftPlanner::<f32>::new();
        let plan = planner.plan_fft_forward(length);
        Ok(Box::new(Self {
            length,
            channels,
            window: (0..length).map(|i| hann_value(i, length)).collect(),
            inputs: vec![0.0; length * channels],
            work: plan.make_input_vec(),
            spectrum: plan.make_output_vec(),
            scratch: plan.make_scratch_vec(),
            plan,
        }))
    }

    pub fn length(&self) -> usize {
        self.length
    }

    /// Spectral points emitted per channel.
    pub fn bins(&self) -> usize {
        self.length / 2
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("length", &self.length)
            .field("channels", &self.channels)
            .finish()
    }
}

/// Accumulates frames and turns full windows into magnitude spectra.
///
/// A resize is only staged by [`SpectralPipeline::stage`]; it takes effect in
/// [`SpectralPipeline::apply_pending`] when no window is half filled.
#[derive(Debug)]
pub struct SpectralPipeline {
    current: Box<FftResources>,
    pending: Option<Box<FftResources>>,
    fill: usize,
    axis: SpectralAxis,
    scale_override: Option<f32>,
    log_offset_override: Option<f32>,
}

impl SpectralPipeline {
    pub fn new(config: &SpectralConfig, channels: usize) -> Result<Self> {
        Ok(Self {
            current: FftResources::new(config.length, config.max_length, channels)?,
            pending: None,
            fill: 0,
            axis: config.axis,
            scale_override: config.scale,
            log_offset_override: config.log_offset,
        })
    }

    pub fn length(&self) -> usize {
        self.current.length
    }

    pub fn bins(&self) -> usize {
        self.current.bins()
    }

    pub fn fill(&self) -> usize {
        self.fill
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn set_axis(&mut self, axis: SpectralAxis) {
        self.axis = axis;
    }

    /// Linear magnitude scale for the current length.
    pub fn scale(&self) -> f32 {
        self.scale_override
            .unwrap_or(2.0 / self.current.length as f32)
    }

    pub fn log_offset(&self) -> f32 {
        self.log_offset_override
            .unwrap_or_else(|| 20.0 * self.scale().log10())
    }

    /// Stages a new length. Returns a previously staged, now superseded,
    /// resource set.
    pub fn stage(&mut self, resources: Box<FftResources>) -> Option<Box<FftResources>> {
        self.pending.replace(resources)
    }

    /// Swaps in the staged resources if the accumulator is empty. Returns the
    /// replaced set.
    pub fn apply_pending(&mut self) -> Option<Box<FftResources>> {
        if self.fill != 0 {
            return None;
        }
        let next = self.pending.take()?;
        Some(std::mem::replace(&mut self.current, next))
    }

    /// Drops a partially accumulated window.
    pub fn reset(&mut self) {
        self.fill = 0;
    }

    /// Adds one frame. Returns true once a full window is held.
    pub fn push(&mut self, frame: &[f32]) -> bool {
        let res = &mut self.current;
        if self.fill < res.length {
            for channel in 0..res.channels {
                let value = frame.get(channel).copied().unwrap_or(0.0);
                res.inputs[channel * res.length + self.fill] = value;
            }
            self.fill += 1;
        }
        self.fill == res.length
    }

    /// Windows and transforms every channel of the held window, writing
    /// `bins()` display values per channel into `out`. Empties the
    /// accumulator.
    pub fn transform_into(&mut self, out: &mut [f32]) -> Result<()> {
        let scale = self.scale();
        let log_offset = self.log_offset();
        let axis = self.axis;
        let res = &mut *self.current;
        let bins = res.bins();
        self.fill = 0;

        for channel in 0..res.channels {
            let input = &res.inputs[channel * res.length..(channel + 1) * res.length];
            for ((dest, sample), w) in res.work.iter_mut().zip(input).zip(&res.window) {
                *dest = sample * w;
            }
            res.plan
                .process_with_scratch(&mut res.work, &mut res.spectrum, &mut res.scratch)?;

            let Some(dest) = out.get_mut(channel * bins..(channel + 1) * bins) else {
                break;
            };
            for (value, bin) in dest.iter_mut().zip(&res.spectrum) {
                *value = match axis {
                    SpectralAxis::Linear => scale * bin.norm(),
                    SpectralAxis::Decibel => {
                        10.0 * bin.norm_sqr().max(POWER_FLOOR).log10() + log_offset
                    }
                };
            }
        }
        Ok(())
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}
