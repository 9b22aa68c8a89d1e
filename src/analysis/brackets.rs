//! Min / max / mean over table ranges.

use serde::Serialize;

use super::bands::RangeCache;
use super::table::{BinRange, RangeSet};
use super::{Geometry, SpectrumDependency, SpectrumInput, Table, Tap};
use crate::error::Result;
use crate::pipeline::{fan_out, Dependency, Job, PrepareContext, Processor};

/// Statistics over one resolved range. All zero when the range is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BracketData {
    pub min: f32,
    pub max: f32,
    pub average: f32,
    pub width: u32,
}

pub fn bracket(spectrum: &[f32], range: BinRange) -> BracketData {
    let width = range.width();
    if width == 0 {
        return BracketData::default();
    }
    let values = &spectrum[range.start..range.end];
    let (min, max, sum) = values.iter().fold(
        (f32::INFINITY, f32::NEG_INFINITY, 0.0f32),
        |(min, max, sum), &v| (min.min(v), max.max(v), sum + v),
    );
    BracketData {
        min,
        max,
        // Rounding can push the mean a hair outside the extremes.
        average: (sum / width as f32).max(min).min(max),
        width: width as u32,
    }
}

pub struct BracketStage {
    name: String,
    set: RangeSet,
    ranges: RangeCache,
    input: SpectrumDependency,
    table: Dependency<Table>,
    geometry: Dependency<Geometry>,
    output: Tap<BracketData>,
}

impl BracketStage {
    pub fn new(set: RangeSet, input: SpectrumInput) -> Self {
        Self {
            name: format!("brackets.{}", set.label()),
            set,
            ranges: RangeCache::new(set),
            input: SpectrumDependency::new(input),
            table: Dependency::new(),
            geometry: Dependency::new(),
            output: Tap::new(),
        }
    }

    pub fn set(&self) -> RangeSet {
        self.set
    }

    pub fn output(&self) -> Tap<BracketData> {
        self.output.clone()
    }
}

impl Processor for BracketStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self, ctx: &PrepareContext<'_>) -> Result<Job> {
        let bins = self.geometry.resolve(&self.name, ctx)?.read().bin_count;
        let table = self.table.resolve(&self.name, ctx)?;
        let spectrum = self.input.resolve(&self.name, ctx)?;
        let ranges = self
            .ranges
            .resolve(&self.name, &table, bins, ctx.generation());
        self.output.working().write().resize(ranges.len());

        let output = self.output.working().clone();
        Ok(Job::parallel(ranges.len(), move || {
            let spectrum = spectrum.working().read();
            let spectrum = spectrum.as_slice();
            let mut output = output.write();
            fan_out(output.as_mut_slice(), |i, data| {
                *data = bracket(spectrum, ranges[i]);
            });
        }))
    }

    fn apply(&mut self) {
        self.output.publish();
    }

    fn dispose(&mut self) {
        self.output.release();
    }
}
