//! Read side of an analyzer: published outputs and per-tick snapshots.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use super::brackets::BracketData;
use super::table::{BandResolution, RangeSet};
use super::{SpectrumInfos, Tap};
use crate::error::Result;

/// Everything one tick produced, owned.
#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    pub tick: u64,
    /// Seconds into the source.
    pub position: f64,
    pub infos: SpectrumInfos,
    pub spectrum: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smoothed: Option<Vec<f32>>,
    /// Keyed by band count.
    pub bands: BTreeMap<String, Vec<f32>>,
    /// Keyed by band count, or `custom`.
    pub brackets: BTreeMap<String, Vec<BracketData>>,
}

/// Published views of every stage output in one analyzer.
///
/// Reads only ever see the last applied tick; lanes write elsewhere.
#[derive(Debug, Clone)]
pub struct Outputs {
    pub(crate) geometry: Arc<RwLock<SpectrumInfos>>,
    pub(crate) raw: Tap<f32>,
    pub(crate) samples: Tap<f32>,
    pub(crate) spectrum: Tap<f32>,
    pub(crate) smoothed: Option<Tap<f32>>,
    pub(crate) bands: Vec<(BandResolution, Tap<f32>)>,
    pub(crate) brackets: Vec<(RangeSet, Tap<BracketData>)>,
}

impl Outputs {
    pub fn infos(&self) -> SpectrumInfos {
        *self.geometry.read()
    }

    /// Interleaved block as read from the source.
    pub fn raw(&self) -> &Tap<f32> {
        &self.raw
    }

    pub fn samples(&self) -> &Tap<f32> {
        &self.samples
    }

    pub fn spectrum(&self) -> &Tap<f32> {
        &self.spectrum
    }

    pub fn smoothed(&self) -> Option<&Tap<f32>> {
        self.smoothed.as_ref()
    }

    pub fn band(&self, resolution: BandResolution) -> Option<&Tap<f32>> {
        self.bands
            .iter()
            .find(|(r, _)| *r == resolution)
            .map(|(_, tap)| tap)
    }

    pub fn bracket(&self, set: RangeSet) -> Option<&Tap<BracketData>> {
        self.brackets
            .iter()
            .find(|(s, _)| *s == set)
            .map(|(_, tap)| tap)
    }

    pub fn frame(&self, tick: u64, position: f64) -> Frame {
        Frame {
            tick,
            position,
            infos: self.infos(),
            spectrum: self.spectrum.snapshot(),
            smoothed: self.smoothed.as_ref().map(Tap::snapshot),
            bands: self
                .bands
                .iter()
                .map(|(r, tap)| (r.count().to_string(), tap.snapshot()))
                .collect(),
            brackets: self
                .brackets
                .iter()
                .map(|(s, tap)| (s.label(), tap.snapshot()))
                .collect(),
        }
    }
}

/// Receives the outputs once per applied tick. Views must not be held past
/// the call.
pub trait Sink {
    fn consume(&mut self, tick: u64, position: f64, outputs: &Outputs) -> Result<()>;
}

/// Keeps a [`Frame`] per tick.
#[derive(Debug, Default)]
pub struct FrameCollector {
    frames: Vec<Frame>,
}

impl FrameCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

impl Sink for FrameCollector {
    fn consume(&mut self, tick: u64, position: f64, outputs: &Outputs) -> Result<()> {
        self.frames.push(outputs.frame(tick, position));
        Ok(())
    }
}
