//! Spectrum post-filters applied before aggregation.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{SmoothedSpectrum, Spectrum, Tap};
use crate::buffer::{shared, SharedBuffer};
use crate::error::{Error, Result};
use crate::pipeline::{fan_out, Dependency, Job, PrepareContext, Processor, Registry};

/// `rate` blends the current tick against the previous output (1 keeps only
/// the current tick); `radius` averages each bin with its `±radius` neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmoothingSettings {
    pub rate: f32,
    pub radius: usize,
}

impl Default for SmoothingSettings {
    fn default() -> Self {
        Self {
            rate: 1.0,
            radius: 0,
        }
    }
}

impl SmoothingSettings {
    pub fn new(rate: f32, radius: usize) -> Result<Self> {
        let settings = Self { rate, radius };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate.is_finite() && self.rate > 0.0 && self.rate <= 1.0 {
            Ok(())
        } else {
            Err(Error::InvalidSmoothing(self.rate))
        }
    }

    /// Output equals input.
    pub fn is_neutral(&self) -> bool {
        self.rate == 1.0 && self.radius == 0
    }
}

/// Pending smoothing settings, picked up at the next `lock`.
#[derive(Debug, Clone, Default)]
pub struct SmoothingControl {
    pending: Arc<Mutex<SmoothingSettings>>,
}

impl SmoothingControl {
    pub fn new(settings: SmoothingSettings) -> Self {
        Self {
            pending: Arc::new(Mutex::new(settings)),
        }
    }

    pub fn set(&self, settings: SmoothingSettings) -> Result<()> {
        settings.validate()?;
        *self.pending.lock() = settings;
        Ok(())
    }

    pub fn settings(&self) -> SmoothingSettings {
        *self.pending.lock()
    }
}

/// Mean of `values[i - radius ..= i + radius]`, clipped to the slice.
fn spatial(values: &[f32], i: usize, radius: usize) -> f32 {
    if radius == 0 {
        return values[i];
    }
    let lo = i.saturating_sub(radius);
    let hi = (i + radius + 1).min(values.len());
    values[lo..hi].iter().sum::<f32>() / (hi - lo) as f32
}

/// Temporal and spatial smoothing of the spectrum.
pub struct SmoothingStage {
    control: SmoothingControl,
    locked: SmoothingSettings,
    input: Dependency<Spectrum>,
    output: Tap<f32>,
    history: SharedBuffer<f32>,
}

impl SmoothingStage {
    pub const NAME: &'static str = "smoothing";

    pub fn new(control: SmoothingControl) -> Self {
        Self {
            locked: control.settings(),
            control,
            input: Dependency::new(),
            output: Tap::new(),
            history: shared(),
        }
    }

    pub fn output(&self) -> Tap<f32> {
        self.output.clone()
    }
}

impl Processor for SmoothingStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn register(&self, registry: &mut Registry) {
        registry.provide::<SmoothedSpectrum>(self.output.clone());
    }

    fn lock(&mut self) {
        self.locked = self.control.settings();
    }

    fn prepare(&mut self, ctx: &PrepareContext<'_>) -> Result<Job> {
        let input = self.input.resolve(Self::NAME, ctx)?;
        let bins = input.working().read().len();
        {
            let mut history = self.history.write();
            if history.resize(bins) {
                log::debug!("{}: history reset for {} bins", Self::NAME, bins);
                history.fill(0.0);
            }
        }
        self.output.working().write().resize(bins);

        let SmoothingSettings { rate, radius } = self.locked;
        let history = self.history.clone();
        let output = self.output.working().clone();
        Ok(Job::parallel(bins, move || {
            let current = input.working().read();
            let current = current.as_slice();
            let previous = history.read();
            let previous = previous.as_slice();
            let mut output = output.write();
            fan_out(output.as_mut_slice(), |i, bin| {
                *bin = spatial(current, i, radius) * rate + previous[i] * (1.0 - rate);
            });
        }))
    }

    fn apply(&mut self) {
        let output = self.output.working().read();
        self.history.write().copy_from(output.as_slice());
        drop(output);
        self.output.publish();
    }

    fn dispose(&mut self) {
        self.output.release();
        self.history.write().release();
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    struct Fixture {
        stage: SmoothingStage,
        spectrum: Tap<f32>,
        registry: Registry,
    }

    impl Fixture {
        fn new(settings: SmoothingSettings) -> Self {
            let spectrum = Tap::<f32>::new();
            let mut registry = Registry::new();
            registry.provide::<Spectrum>(spectrum.clone());
            Self {
                stage: SmoothingStage::new(SmoothingControl::new(settings)),
                spectrum,
                registry,
            }
        }

        fn tick(&mut self, input: &[f32]) -> Vec<f32> {
            self.spectrum.working().write().copy_from(input);
            let ctx = PrepareContext::new(&self.registry, 1);
            self.stage.lock();
            self.stage.prepare(&ctx).unwrap().run();
            self.stage.apply();
            self.stage.unlock();
            self.stage.output().snapshot()
        }
    }

    #[test]
    fn neutral_settings_are_identity() {
        let mut fixture = Fixture::new(SmoothingSettings::default());
        let input = [0.3, -1.5, 7.25, 0.0, 1e-7, 42.0];
        assert_eq!(fixture.tick(&input), input.to_vec());
        let next = [9.0, 8.0, 7.0, 6.0, 5.0, 4.0];
        assert_eq!(fixture.tick(&next), next.to_vec());
    }

    #[test]
    fn decays_towards_zero_on_silence() {
        let mut fixture = Fixture::new(SmoothingSettings::new(0.5, 0).unwrap());
        fixture.tick(&[8.0, 4.0]);
        let mut last = fixture.tick(&[0.0, 0.0]);
        assert_relative_eq!(last[0], 2.0);
        for _ in 0..20 {
            let next = fixture.tick(&[0.0, 0.0]);
            assert!(next[0] < last[0]);
            last = next;
        }
        assert!(last[0] < 1e-5);
    }

    #[test]
    fn spatial_radius_averages_neighbours() {
        let mut fixture = Fixture::new(SmoothingSettings::new(1.0, 1).unwrap());
        let out = fixture.tick(&[0.0, 3.0, 0.0, 6.0]);
        assert_relative_eq!(out[0], 1.5);
        assert_relative_eq!(out[1], 1.0);
        assert_relative_eq!(out[2], 3.0);
        assert_relative_eq!(out[3], 3.0);
    }

    #[test]
    fn settings_change_at_next_lock() {
        let control = SmoothingControl::default();
        let mut fixture = Fixture::new(SmoothingSettings::default());
        fixture.stage = SmoothingStage::new(control.clone());
        fixture.tick(&[4.0]);
        control.set(SmoothingSettings::new(0.25, 0).unwrap()).unwrap();
        assert_relative_eq!(fixture.tick(&[0.0])[0], 3.0);
    }

    #[test]
    fn rate_outside_unit_interval_is_rejected() {
        assert!(SmoothingSettings::new(0.0, 0).is_err());
        assert!(SmoothingSettings::new(1.5, 0).is_err());
        assert!(SmoothingSettings::new(f32::NAN, 0).is_err());
        assert!(SmoothingControl::default()
            .set(SmoothingSettings { rate: -1.0, radius: 2 })
            .is_err());
    }
}
