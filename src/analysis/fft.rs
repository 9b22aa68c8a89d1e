//! The transform, split into four chained units: coefficients, windowing,
//! execution and the magnitude pass.

use std::f32::consts::PI;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use rustfft::{Fft, FftPlanner, Length};
use serde::{Deserialize, Serialize};

use super::{Coefficients, Complex32, ComplexLanes, Geometry, Samples, Spectrum, Tap};
use crate::buffer::{shared, SharedBuffer};
use crate::error::Result;
use crate::pipeline::{fan_out, Chain, Dependency, Job, Node, PrepareContext, Processor, Registry};

/// Window applied to the time-domain block before the transform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowKind {
    Rectangular,
    #[default]
    Hann,
    Hamming,
    Blackman,
}

impl WindowKind {
    pub fn coefficients(self, size: usize) -> Vec<f32> {
        if size < 2 {
            return vec![1.0; size];
        }
        let denom = (size - 1) as f32;
        (0..size)
            .map(|i| {
                let x = 2.0 * PI * i as f32 / denom;
                match self {
                    WindowKind::Rectangular => 1.0,
                    WindowKind::Hann => 0.5 * (1.0 - x.cos()),
                    WindowKind::Hamming => 0.54 - 0.46 * x.cos(),
                    WindowKind::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
                }
            })
            .collect()
    }
}

impl FromStr for WindowKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rectangular" | "rect" | "none" => Ok(WindowKind::Rectangular),
            "hann" | "hanning" => Ok(WindowKind::Hann),
            "hamming" => Ok(WindowKind::Hamming),
            "blackman" => Ok(WindowKind::Blackman),
            other => Err(format!("unknown window '{}'", other)),
        }
    }
}

/// Window weights, magnitude scale and transform plan for one window length.
#[derive(Default)]
pub struct FftCoefficients {
    pub kind: WindowKind,
    pub window: Vec<f32>,
    /// `2 / Σw`, so a full-scale sine reads as amplitude 1.
    pub scale: f32,
    pub plan: Option<Arc<dyn Fft<f32>>>,
}

impl FftCoefficients {
    pub fn generate(kind: WindowKind, len: usize) -> Self {
        let window = kind.coefficients(len);
        let sum: f32 = window.iter().sum();
        let scale = if sum > 0.0 { 2.0 / sum } else { 0.0 };
        let plan = (len > 0).then(|| FftPlanner::<f32>::new().plan_fft_forward(len));
        Self {
            kind,
            window,
            scale,
            plan,
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

impl fmt::Debug for FftCoefficients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftCoefficients")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .field("scale", &self.scale)
            .finish()
    }
}

/// Step 1: regenerate the window and plan when the window length moves.
pub struct CoefficientStage {
    kind: WindowKind,
    coefficients: Arc<RwLock<FftCoefficients>>,
    geometry: Dependency<Geometry>,
    generated: usize,
    pending: Option<usize>,
}

impl CoefficientStage {
    pub const NAME: &'static str = "fft.coefficients";

    pub fn new(kind: WindowKind) -> Self {
        Self {
            kind,
            coefficients: Arc::new(RwLock::new(FftCoefficients::default())),
            geometry: Dependency::new(),
            generated: 0,
            pending: None,
        }
    }
}

impl Processor for CoefficientStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn register(&self, registry: &mut Registry) {
        registry.provide::<Coefficients>(self.coefficients.clone());
    }

    fn prepare(&mut self, ctx: &PrepareContext<'_>) -> Result<Job> {
        let len = self.geometry.resolve(Self::NAME, ctx)?.read().window_len;
        if len == self.generated {
            return Ok(Job::idle());
        }
        log::debug!(
            "{}: regenerating {:?} window for {} samples",
            Self::NAME,
            self.kind,
            len
        );
        self.pending = Some(len);
        let kind = self.kind;
        let coefficients = self.coefficients.clone();
        Ok(Job::single(move || {
            *coefficients.write() = FftCoefficients::generate(kind, len);
        }))
    }

    // The length only counts as generated once its job has run.
    fn apply(&mut self) {
        if let Some(len) = self.pending.take() {
            self.generated = len;
        }
    }

    fn unlock(&mut self) {
        self.pending = None;
    }

    fn dispose(&mut self) {
        *self.coefficients.write() = FftCoefficients::default();
        self.generated = 0;
        self.pending = None;
    }
}

/// Step 2: window the samples and pack them into complex lanes.
pub struct PackStage {
    lanes: SharedBuffer<Complex32>,
    samples: Dependency<Samples>,
    coefficients: Dependency<Coefficients>,
    geometry: Dependency<Geometry>,
}

impl PackStage {
    pub const NAME: &'static str = "fft.prepare";

    pub fn new() -> Self {
        Self {
            lanes: shared(),
            samples: Dependency::new(),
            coefficients: Dependency::new(),
            geometry: Dependency::new(),
        }
    }
}

impl Default for PackStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for PackStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn register(&self, registry: &mut Registry) {
        registry.provide::<ComplexLanes>(self.lanes.clone());
    }

    fn prepare(&mut self, ctx: &PrepareContext<'_>) -> Result<Job> {
        let len = self.geometry.resolve(Self::NAME, ctx)?.read().window_len;
        let samples = self.samples.resolve(Self::NAME, ctx)?;
        let coefficients = self.coefficients.resolve(Self::NAME, ctx)?;
        self.lanes.write().resize(len);

        let lanes = self.lanes.clone();
        Ok(Job::parallel(len, move || {
            let samples = samples.working().read();
            let samples = samples.as_slice();
            let coefficients = coefficients.read();
            let window = coefficients.window.as_slice();
            let mut lanes = lanes.write();
            fan_out(lanes.as_mut_slice(), |i, lane| {
                *lane = Complex32::new(samples[i] * window[i], 0.0);
            });
        }))
    }

    fn dispose(&mut self) {
        self.lanes.write().release();
    }
}

/// Step 3: run the planned transform in place. A missing or mismatched
/// plan panics the lane, which faults the tick.
pub struct ExecuteStage {
    scratch: SharedBuffer<Complex32>,
    lanes: Dependency<ComplexLanes>,
    coefficients: Dependency<Coefficients>,
}

impl ExecuteStage {
    pub const NAME: &'static str = "fft.execute";

    pub fn new() -> Self {
        Self {
            scratch: shared(),
            lanes: Dependency::new(),
            coefficients: Dependency::new(),
        }
    }
}

impl Default for ExecuteStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for ExecuteStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn prepare(&mut self, ctx: &PrepareContext<'_>) -> Result<Job> {
        let lanes = self.lanes.resolve(Self::NAME, ctx)?;
        let coefficients = self.coefficients.resolve(Self::NAME, ctx)?;
        let scratch = self.scratch.clone();

        Ok(Job::single(move || {
            let coefficients = coefficients.read();
            let mut lanes = lanes.write();
            match coefficients.plan.as_ref() {
                Some(plan) if plan.len() == lanes.len() => {
                    let mut scratch = scratch.write();
                    scratch.resize(plan.get_inplace_scratch_len());
                    plan.process_with_scratch(lanes.as_mut_slice(), scratch.as_mut_slice());
                }
                plan => panic!(
                    "{}: no transform plan for {} lanes (plan length {:?})",
                    ExecuteStage::NAME,
                    lanes.len(),
                    plan.map(|p| p.len())
                ),
            }
        }))
    }

    fn dispose(&mut self) {
        self.scratch.write().release();
    }
}

/// Step 4: normalized magnitude of the lower half of the transform.
pub struct MagnitudeStage {
    spectrum: Tap<f32>,
    lanes: Dependency<ComplexLanes>,
    coefficients: Dependency<Coefficients>,
    geometry: Dependency<Geometry>,
}

impl MagnitudeStage {
    pub const NAME: &'static str = "fft.magnitude";

    pub fn new() -> Self {
        Self {
            spectrum: Tap::new(),
            lanes: Dependency::new(),
            coefficients: Dependency::new(),
            geometry: Dependency::new(),
        }
    }

    pub fn spectrum(&self) -> Tap<f32> {
        self.spectrum.clone()
    }
}

impl Default for MagnitudeStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor for MagnitudeStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn register(&self, registry: &mut Registry) {
        registry.provide::<Spectrum>(self.spectrum.clone());
    }

    fn prepare(&mut self, ctx: &PrepareContext<'_>) -> Result<Job> {
        let bins = self.geometry.resolve(Self::NAME, ctx)?.read().bin_count;
        let lanes = self.lanes.resolve(Self::NAME, ctx)?;
        let coefficients = self.coefficients.resolve(Self::NAME, ctx)?;
        self.spectrum.working().write().resize(bins);

        let spectrum = self.spectrum.working().clone();
        Ok(Job::parallel(bins, move || {
            let scale = coefficients.read().scale;
            let lanes = lanes.read();
            let lanes = lanes.as_slice();
            let mut spectrum = spectrum.write();
            fan_out(spectrum.as_mut_slice(), |i, bin| {
                *bin = lanes[i].norm() * scale;
            });
        }))
    }

    fn apply(&mut self) {
        self.spectrum.publish();
    }

    fn dispose(&mut self) {
        self.spectrum.release();
    }
}

/// The four transform units in order.
pub fn fft_chain(window: WindowKind) -> Chain {
    Chain::new("fft")
        .with(Node::unit(CoefficientStage::new(window)))
        .with(Node::unit(PackStage::new()))
        .with(Node::unit(ExecuteStage::new()))
        .with(Node::unit(MagnitudeStage::new()))
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::analysis::{FrequencyBins, SpectrumInfos};
    use crate::pipeline::Processor;

    #[test]
    fn hann_is_zero_at_both_ends() {
        let w = WindowKind::Hann.coefficients(16);
        assert_abs_diff_eq!(w[0], 0.0);
        assert_abs_diff_eq!(w[15], 0.0, epsilon = 1e-6);
        assert!(w[7] > 0.9);
    }

    #[test]
    fn rectangular_scale_is_two_over_len() {
        let c = FftCoefficients::generate(WindowKind::Rectangular, 128);
        assert_abs_diff_eq!(c.scale, 2.0 / 128.0);
        assert_eq!(c.plan.as_ref().map(|p| p.len()), Some(128));
    }

    #[test]
    fn window_names_parse() {
        assert_eq!("Hann".parse::<WindowKind>().unwrap(), WindowKind::Hann);
        assert_eq!(
            "blackman".parse::<WindowKind>().unwrap(),
            WindowKind::Blackman
        );
        assert!("kaiser".parse::<WindowKind>().is_err());
    }

    /// Runs the four steps by hand over a fixed sample block.
    fn transform(input: &[f32], window: WindowKind) -> Vec<f32> {
        let mut registry = Registry::new();
        let infos = SpectrumInfos::new(FrequencyBins::B64, 128, 1);
        assert_eq!(infos.window_len, input.len());
        registry.provide::<Geometry>(Arc::new(RwLock::new(infos)));
        let samples = Tap::<f32>::new();
        samples.working().write().copy_from(input);
        registry.provide::<Samples>(samples);

        let mut stages: Vec<Box<dyn Processor>> = vec![
            Box::new(CoefficientStage::new(window)),
            Box::new(PackStage::new()),
            Box::new(ExecuteStage::new()),
            Box::new(MagnitudeStage::new()),
        ];
        for stage in &stages {
            stage.register(&mut registry);
        }
        let ctx = PrepareContext::new(&registry, 1);
        for stage in &mut stages {
            stage.prepare(&ctx).unwrap().run();
        }
        for stage in &mut stages {
            stage.apply();
        }
        registry.first::<Spectrum>().unwrap().snapshot()
    }

    fn sine(bin: usize, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * bin as f32 * i as f32 / len as f32).sin())
            .collect()
    }

    #[test]
    fn sine_peaks_at_its_bin() {
        let spectrum = transform(&sine(8, 128), WindowKind::Rectangular);
        assert_eq!(spectrum.len(), 64);
        let peak = spectrum
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i);
        assert_eq!(peak, Some(8));
        assert_abs_diff_eq!(spectrum[8], 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(spectrum[20], 0.0, epsilon = 1e-4);
    }

    #[test]
    fn repeated_transforms_are_identical() {
        let input: Vec<f32> = (0..128).map(|i| ((i * 37) % 11) as f32 / 11.0 - 0.5).collect();
        let first = transform(&input, WindowKind::Hann);
        let second = transform(&input, WindowKind::Hann);
        assert_eq!(first, second);
    }

    #[test]
    fn coefficients_regenerate_after_an_aborted_tick() {
        let mut registry = Registry::new();
        let geometry = Arc::new(RwLock::new(SpectrumInfos::new(FrequencyBins::B64, 128, 1)));
        registry.provide::<Geometry>(geometry.clone());
        let mut stage = CoefficientStage::new(WindowKind::Hann);
        stage.register(&mut registry);
        let coefficients = registry.first::<Coefficients>().unwrap();
        let ctx = PrepareContext::new(&registry, 1);

        // A later unit failed: the job is dropped unrun and the stage unlocked.
        drop(stage.prepare(&ctx).unwrap());
        stage.unlock();
        assert!(coefficients.read().is_empty());

        let job = stage.prepare(&ctx).unwrap();
        assert_eq!(job.lanes(), 1);
        job.run();
        stage.apply();
        stage.unlock();
        assert_eq!(coefficients.read().len(), 128);
        assert_eq!(stage.prepare(&ctx).unwrap().lanes(), 0);
        stage.unlock();

        *geometry.write() = SpectrumInfos::new(FrequencyBins::B128, 128, 1);
        drop(stage.prepare(&ctx).unwrap());
        stage.unlock();
        let job = stage.prepare(&ctx).unwrap();
        assert_eq!(job.lanes(), 1);
        job.run();
        stage.apply();
        assert_eq!(coefficients.read().len(), 256);
    }

    #[test]
    #[should_panic(expected = "no transform plan")]
    fn execute_without_a_plan_panics() {
        let mut registry = Registry::new();
        let lanes = shared::<Complex32>();
        lanes.write().resize(128);
        registry.provide::<ComplexLanes>(lanes);
        registry.provide::<Coefficients>(Arc::new(RwLock::new(FftCoefficients::default())));

        let mut stage = ExecuteStage::new();
        let ctx = PrepareContext::new(&registry, 1);
        stage.prepare(&ctx).unwrap().run();
    }

    #[test]
    fn silence_gives_zero_spectrum() {
        let spectrum = transform(&[0.0; 128], WindowKind::Blackman);
        assert!(spectrum.iter().all(|&v| v == 0.0));
    }
}
