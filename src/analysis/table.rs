//! Static partition of the spectrum into band and bracket ranges.
//!
//! Ranges are stored as fractions of the bin count and resolved against the
//! live bin count when a stage prepares, so one table serves every bin count.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const RANGE_EPSILON: f32 = 1.0e-6;
pub const DEFAULT_OCTAVES: f32 = 10.0;

/// A contiguous slice of the spectrum as fractions of the bin count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrequencyRange {
    start: f32,
    end: f32,
}

/// Ranges used by band aggregation.
pub type BandInfos = FrequencyRange;

impl FrequencyRange {
    /// `start` in `[0, 1)`, `length` in `(0, 1]`, `start + length <= 1`.
    pub fn new(start: f32, length: f32) -> Result<Self> {
        let valid = start.is_finite()
            && length.is_finite()
            && (0.0..1.0).contains(&start)
            && length > 0.0
            && length <= 1.0
            && start + length <= 1.0 + RANGE_EPSILON;
        if !valid {
            return Err(Error::InvalidRange { start, length });
        }
        Ok(Self {
            start,
            end: (start + length).min(1.0),
        })
    }

    /// Range between two frequencies, given the Nyquist frequency.
    pub fn from_hz(low_hz: f32, high_hz: f32, nyquist: f32) -> Result<Self> {
        let start = (low_hz / nyquist).max(0.0);
        let end = (high_hz / nyquist).min(1.0);
        Self::new(start, end - start)
    }

    /// Used for table boundaries, which are validated as a whole.
    fn between(start: f32, end: f32) -> Self {
        Self { start, end }
    }

    pub fn start(&self) -> f32 {
        self.start
    }

    pub fn length(&self) -> f32 {
        self.end - self.start
    }

    pub fn end(&self) -> f32 {
        self.end
    }

    /// Integer `[start, end)` against `bins`. Ranges that share a fractional
    /// boundary share the resolved boundary too.
    pub fn resolve(&self, bins: usize) -> BinRange {
        let edge = |fraction: f32| ((fraction * bins as f32).round() as usize).min(bins);
        let start = edge(self.start);
        BinRange {
            start,
            end: edge(self.end).max(start),
        }
    }
}

/// A resolved `[start, end)` bin range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BinRange {
    pub start: usize,
    pub end: usize,
}

impl BinRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn width(&self) -> usize {
        self.end - self.start
    }
}

/// The band counts a table carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum BandResolution {
    Bands8,
    Bands16,
    Bands32,
    Bands64,
    Bands128,
}

impl BandResolution {
    pub const ALL: [BandResolution; 5] = [
        BandResolution::Bands8,
        BandResolution::Bands16,
        BandResolution::Bands32,
        BandResolution::Bands64,
        BandResolution::Bands128,
    ];

    pub fn count(self) -> usize {
        8 << (self as usize)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<usize> for BandResolution {
    type Error = Error;

    fn try_from(count: usize) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.count() == count)
            .ok_or(Error::InvalidResolution(count))
    }
}

/// How band boundaries are spaced across the spectrum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrequencyScale {
    /// `b_i = (2^(i·k/r) − 1) / (2^k − 1)` for `k` octaves.
    Logarithmic { octaves: f32 },
    Linear,
}

impl Default for FrequencyScale {
    fn default() -> Self {
        FrequencyScale::Logarithmic {
            octaves: DEFAULT_OCTAVES,
        }
    }
}

impl FrequencyScale {
    /// `count + 1` strictly increasing boundaries from 0 to 1.
    pub fn boundaries(self, count: usize) -> Vec<f32> {
        let mut edges: Vec<f32> = (0..=count)
            .map(|i| {
                let t = i as f32 / count as f32;
                match self {
                    FrequencyScale::Linear => t,
                    FrequencyScale::Logarithmic { octaves } => {
                        let k = if octaves > 0.0 { octaves } else { DEFAULT_OCTAVES };
                        (2f32.powf(t * k) - 1.0) / (2f32.powf(k) - 1.0)
                    }
                }
            })
            .collect();
        edges[0] = 0.0;
        edges[count] = 1.0;
        edges
    }
}

/// Which range list a stage aggregates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeSet {
    Bands(BandResolution),
    Custom,
}

impl RangeSet {
    pub fn label(&self) -> String {
        match self {
            RangeSet::Bands(resolution) => resolution.count().to_string(),
            RangeSet::Custom => "custom".to_string(),
        }
    }
}

/// Band ranges for every [`BandResolution`] plus user-defined brackets.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyTable {
    scale: FrequencyScale,
    bands: Vec<Vec<FrequencyRange>>,
    brackets: Vec<FrequencyRange>,
}

impl Default for FrequencyTable {
    fn default() -> Self {
        Self::new(FrequencyScale::default())
    }
}

impl FrequencyTable {
    pub fn new(scale: FrequencyScale) -> Self {
        let bands = BandResolution::ALL
            .iter()
            .map(|resolution| {
                scale
                    .boundaries(resolution.count())
                    .windows(2)
                    .map(|edge| FrequencyRange::between(edge[0], edge[1]))
                    .collect()
            })
            .collect();
        Self {
            scale,
            bands,
            brackets: Vec::new(),
        }
    }

    pub fn with_brackets(mut self, brackets: Vec<FrequencyRange>) -> Self {
        self.brackets = brackets;
        self
    }

    pub fn scale(&self) -> FrequencyScale {
        self.scale
    }

    pub fn bands(&self, resolution: BandResolution) -> &[FrequencyRange] {
        &self.bands[resolution.index()]
    }

    pub fn brackets(&self) -> &[FrequencyRange] {
        &self.brackets
    }

    pub fn ranges(&self, set: RangeSet) -> &[FrequencyRange] {
        match set {
            RangeSet::Bands(resolution) => self.bands(resolution),
            RangeSet::Custom => self.brackets(),
        }
    }

    pub fn resolve(&self, set: RangeSet, bins: usize) -> Vec<BinRange> {
        self.ranges(set).iter().map(|r| r.resolve(bins)).collect()
    }
}
