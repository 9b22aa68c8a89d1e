//! Weighted band averages over one resolution of the frequency table.

use std::sync::Arc;

use super::table::{BandResolution, BinRange, FrequencyTable, RangeSet};
use super::{Geometry, SpectrumDependency, SpectrumInput, Table, Tap};
use crate::error::Result;
use crate::pipeline::{fan_out, Dependency, Job, PrepareContext, Processor};

/// `Σ spectrum[k]·(k+1) / end` over `[start, end)`. Empty ranges give 0.
///
/// The weight favours the upper bins of a range and the divisor is the
/// absolute end index, not the width.
pub fn band_average(spectrum: &[f32], range: BinRange) -> f32 {
    if range.width() == 0 {
        return 0.0;
    }
    let sum: f32 = spectrum[range.start..range.end]
        .iter()
        .enumerate()
        .map(|(offset, &v)| v * (range.start + offset + 1) as f32)
        .sum();
    sum / range.end as f32
}

/// Table ranges resolved against the last seen bin count and topology.
pub(crate) struct RangeCache {
    set: RangeSet,
    key: Option<(usize, u64)>,
    ranges: Arc<[BinRange]>,
}

impl RangeCache {
    pub(crate) fn new(set: RangeSet) -> Self {
        Self {
            set,
            key: None,
            ranges: Vec::new().into(),
        }
    }

    pub(crate) fn resolve(
        &mut self,
        unit: &str,
        table: &FrequencyTable,
        bins: usize,
        generation: u64,
    ) -> Arc<[BinRange]> {
        if self.key == Some((bins, generation)) {
            return self.ranges.clone();
        }
        let ranges = table.resolve(self.set, bins);
        let empty = ranges.iter().filter(|r| r.width() == 0).count();
        if empty > 0 {
            log::warn!(
                "{}: {} of {} ranges are empty at {} bins",
                unit,
                empty,
                ranges.len(),
                bins
            );
        }
        log::debug!("{}: resolved {} ranges against {} bins", unit, ranges.len(), bins);
        self.ranges = ranges.into();
        self.key = Some((bins, generation));
        self.ranges.clone()
    }
}

pub struct BandStage {
    name: String,
    resolution: BandResolution,
    ranges: RangeCache,
    input: SpectrumDependency,
    table: Dependency<Table>,
    geometry: Dependency<Geometry>,
    output: Tap<f32>,
}

impl BandStage {
    pub fn new(resolution: BandResolution, input: SpectrumInput) -> Self {
        Self {
            name: format!("bands.{}", resolution.count()),
            resolution,
            ranges: RangeCache::new(RangeSet::Bands(resolution)),
            input: SpectrumDependency::new(input),
            table: Dependency::new(),
            geometry: Dependency::new(),
            output: Tap::new(),
        }
    }

    pub fn resolution(&self) -> BandResolution {
        self.resolution
    }

    pub fn output(&self) -> Tap<f32> {
        self.output.clone()
    }
}

impl Processor for BandStage {
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
            fan_out(output.as_mut_slice(), |i, band| {
                *band = band_average(spectrum, ranges[i]);
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
