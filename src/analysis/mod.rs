//! Spectrum extraction stages built on the [`pipeline`](crate::pipeline) core.
//!
//! Data flows strictly forward through one tick:
//!
//! ```text
//! raw interleaved samples -> single-channel samples -> complex lanes
//!     -> magnitude spectrum -> (smoothing) -> bands / brackets
//! ```

pub mod bands;
pub mod brackets;
pub mod builder;
pub mod fft;
pub mod frame;
pub mod modifiers;
pub mod samples;
pub mod table;

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use rustfft::num_complex::Complex;
use serde::{Deserialize, Serialize};

use crate::buffer::{shared, Buffer, SharedBuffer};
use crate::error::{Error, Result};
use crate::pipeline::{Capability, Dependency, PrepareContext};

pub use bands::{band_average, BandStage};
pub use brackets::{bracket, BracketData, BracketStage};
pub use builder::{Analyzer, AnalyzerBuilder, AnalyzerSettings};
pub use fft::{fft_chain, FftCoefficients, WindowKind};
pub use frame::{Frame, FrameCollector, Outputs, Sink};
pub use modifiers::{SmoothingControl, SmoothingSettings, SmoothingStage};
pub use samples::{ChannelSelection, SampleStage, SourceControl, SourceSettings};
pub use table::{
    BandInfos, BandResolution, BinRange, FrequencyRange, FrequencyScale, FrequencyTable, RangeSet,
};

/// Supported bin counts.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "usize", into = "usize")]
pub enum FrequencyBins {
    B64,
    B128,
    B256,
    B512,
    #[default]
    B1024,
    B2048,
    B4096,
    B8192,
}

impl FrequencyBins {
    pub const ALL: [FrequencyBins; 8] = [
        FrequencyBins::B64,
        FrequencyBins::B128,
        FrequencyBins::B256,
        FrequencyBins::B512,
        FrequencyBins::B1024,
        FrequencyBins::B2048,
        FrequencyBins::B4096,
        FrequencyBins::B8192,
    ];

    pub fn count(self) -> usize {
        64 << (self as usize)
    }
}

impl TryFrom<usize> for FrequencyBins {
    type Error = Error;

    fn try_from(bins: usize) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|b| b.count() == bins)
            .ok_or(Error::InvalidBinCount(bins))
    }
}

impl From<FrequencyBins> for usize {
    fn from(bins: FrequencyBins) -> usize {
        bins.count()
    }
}

/// Geometry of one analysis tick.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SpectrumInfos {
    pub bin_count: usize,
    pub sample_rate: u32,
    pub channel_count: usize,
    /// Time-domain samples per tick, always twice the bin count.
    pub window_len: usize,
    /// Hz covered by one bin.
    pub frequency_step: f32,
}

impl SpectrumInfos {
    pub fn new(bins: FrequencyBins, sample_rate: u32, channel_count: usize) -> Self {
        let bin_count = bins.count();
        Self {
            bin_count,
            sample_rate,
            channel_count,
            window_len: bin_count * 2,
            frequency_step: sample_rate as f32 / (bin_count * 2) as f32,
        }
    }

    pub fn nyquist(&self) -> f32 {
        self.sample_rate as f32 / 2.0
    }
}

/// A stage output: lanes write `working`, `apply` copies it to `published`
/// for readers outside the tick.
#[derive(Debug)]
pub struct Tap<T> {
    working: SharedBuffer<T>,
    published: SharedBuffer<T>,
}

impl<T> Clone for Tap<T> {
    fn clone(&self) -> Self {
        Self {
            working: self.working.clone(),
            published: self.published.clone(),
        }
    }
}

impl<T: Clone + Default> Default for Tap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Default> Tap<T> {
    pub fn new() -> Self {
        Self {
            working: shared(),
            published: shared(),
        }
    }

    /// Buffer written by lanes during a tick.
    pub fn working(&self) -> &SharedBuffer<T> {
        &self.working
    }

    pub fn publish(&self) {
        let working = self.working.read();
        self.published.write().copy_from(working.as_slice());
    }

    /// Result of the last applied tick.
    pub fn read(&self) -> RwLockReadGuard<'_, Buffer<T>> {
        self.published.read()
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.published.read().as_slice().to_vec()
    }

    pub fn release(&self) {
        self.working.write().release();
        self.published.write().release();
    }
}

pub type Complex32 = Complex<f32>;

/// Geometry of the current tick, published by the sample stage in `prepare`.
pub struct Geometry;

impl Capability for Geometry {
    type Handle = Arc<RwLock<SpectrumInfos>>;
    const NAME: &'static str = "spectrum geometry";
}

/// Interleaved multi-channel block read from the source.
pub struct RawSamples;

impl Capability for RawSamples {
    type Handle = Tap<f32>;
    const NAME: &'static str = "raw samples";
}

/// Single-channel time-domain samples.
pub struct Samples;

impl Capability for Samples {
    type Handle = Tap<f32>;
    const NAME: &'static str = "samples";
}

pub struct Coefficients;

impl Capability for Coefficients {
    type Handle = Arc<RwLock<FftCoefficients>>;
    const NAME: &'static str = "fft coefficients";
}

/// Windowed complex lanes the transform runs over.
pub struct ComplexLanes;

impl Capability for ComplexLanes {
    type Handle = SharedBuffer<Complex32>;
    const NAME: &'static str = "complex lanes";
}

/// Normalized magnitude spectrum.
pub struct Spectrum;

impl Capability for Spectrum {
    type Handle = Tap<f32>;
    const NAME: &'static str = "spectrum";
}

/// Spectrum after the modifier stage.
pub struct SmoothedSpectrum;

impl Capability for SmoothedSpectrum {
    type Handle = Tap<f32>;
    const NAME: &'static str = "smoothed spectrum";
}

pub struct Table;

impl Capability for Table {
    type Handle = Arc<FrequencyTable>;
    const NAME: &'static str = "frequency table";
}

/// Which spectrum an aggregation stage reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpectrumInput {
    #[default]
    Raw,
    Smoothed,
}

/// Dependency on whichever spectrum [`SpectrumInput`] selects.
pub(crate) struct SpectrumDependency {
    input: SpectrumInput,
    raw: Dependency<Spectrum>,
    smoothed: Dependency<SmoothedSpectrum>,
}

impl SpectrumDependency {
    pub(crate) fn new(input: SpectrumInput) -> Self {
        Self {
            input,
            raw: Dependency::new(),
            smoothed: Dependency::new(),
        }
    }

    pub(crate) fn resolve(&mut self, unit: &str, ctx: &PrepareContext<'_>) -> Result<Tap<f32>> {
        match self.input {
            SpectrumInput::Raw => self.raw.resolve(unit, ctx),
            SpectrumInput::Smoothed => self.smoothed.resolve(unit, ctx),
        }
    }
}
