//! Assembles the standard analysis tree on a [`Compound`].
//!
//! ```text
//! analysis (chain)
//! ├── samples
//! ├── fft (chain): coefficients, prepare, execute, magnitude
//! ├── smoothing            (optional)
//! └── aggregation (group): bands.N..., brackets.N..., brackets.custom
//! ```

use std::sync::Arc;

use super::bands::BandStage;
use super::brackets::BracketStage;
use super::fft::{fft_chain, WindowKind};
use super::frame::{Outputs, Sink};
use super::modifiers::{SmoothingControl, SmoothingSettings, SmoothingStage};
use super::samples::{ChannelSelection, SampleStage, SourceControl, SourceSettings};
use super::table::{BandResolution, FrequencyRange, FrequencyScale, FrequencyTable, RangeSet};
use super::{FrequencyBins, Geometry, RawSamples, Samples, Spectrum, SpectrumInput, Table};
use crate::audio::SampleSource;
use crate::error::{Error, Result};
use crate::pipeline::{Capability, Chain, Compound, Group, Node};

/// Everything needed to build an [`Analyzer`].
#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    pub bins: FrequencyBins,
    pub channels: ChannelSelection,
    pub window: WindowKind,
    /// `None` leaves the smoothing stage out of the tree.
    pub smoothing: Option<SmoothingSettings>,
    pub resolutions: Vec<BandResolution>,
    pub scale: FrequencyScale,
    pub brackets: Vec<FrequencyRange>,
    /// Worker threads; 0 lets rayon decide.
    pub threads: usize,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            bins: FrequencyBins::default(),
            channels: ChannelSelection::default(),
            window: WindowKind::default(),
            smoothing: None,
            resolutions: BandResolution::ALL.to_vec(),
            scale: FrequencyScale::default(),
            brackets: Vec::new(),
            threads: 0,
        }
    }
}

pub struct AnalyzerBuilder {
    settings: AnalyzerSettings,
    name: String,
}

impl AnalyzerBuilder {
    pub fn new(settings: AnalyzerSettings) -> Self {
        Self {
            settings,
            name: "bandscope".to_string(),
        }
    }

    /// Name of the compound and prefix of its worker threads.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn build(self, source: impl SampleSource + 'static) -> Result<Analyzer> {
        let settings = self.settings;
        if let Some(smoothing) = &settings.smoothing {
            smoothing.validate()?;
        }
        let format = source.format();
        settings.channels.validate(format.channels)?;

        let mut compound = Compound::with_threads(self.name, settings.threads)?;
        let table = FrequencyTable::new(settings.scale).with_brackets(settings.brackets.clone());
        compound.provide::<Table>(Arc::new(table))?;

        let source_control = SourceControl::new(SourceSettings {
            bins: settings.bins,
            channels: settings.channels.clone(),
            position: 0.0,
        });

        let mut analysis = Chain::new("analysis")
            .with(Node::unit(SampleStage::new(source, source_control.clone())))
            .with(fft_chain(settings.window));

        let (smoothing_control, smoothed, input) = match settings.smoothing {
            Some(smoothing) => {
                let control = SmoothingControl::new(smoothing);
                let stage = SmoothingStage::new(control.clone());
                let output = stage.output();
                analysis.push(Node::unit(stage));
                (Some(control), Some(output), SpectrumInput::Smoothed)
            }
            None => (None, None, SpectrumInput::Raw),
        };

        let mut resolutions = settings.resolutions.clone();
        resolutions.sort();
        resolutions.dedup();

        let mut aggregation = Group::new("aggregation");
        let mut bands = Vec::with_capacity(resolutions.len());
        let mut brackets = Vec::with_capacity(resolutions.len() + 1);
        for &resolution in &resolutions {
            let stage = BandStage::new(resolution, input);
            bands.push((resolution, stage.output()));
            aggregation.push(Node::unit(stage));
        }
        let mut sets: Vec<RangeSet> = resolutions.iter().copied().map(RangeSet::Bands).collect();
        if !settings.brackets.is_empty() {
            sets.push(RangeSet::Custom);
        }
        for set in sets {
            let stage = BracketStage::new(set, input);
            brackets.push((set, stage.output()));
            aggregation.push(Node::unit(stage));
        }
        if !aggregation.is_empty() {
            analysis.push(aggregation);
        }

        compound.add(analysis)?;

        let outputs = Outputs {
            geometry: lookup::<Geometry>(&compound)?,
            raw: lookup::<RawSamples>(&compound)?,
            samples: lookup::<Samples>(&compound)?,
            spectrum: lookup::<Spectrum>(&compound)?,
            smoothed,
            bands,
            brackets,
        };

        log::info!(
            "analyzer '{}': {} bins, {:?} window, {} band resolutions, {} custom brackets, smoothing {}",
            compound.name(),
            settings.bins.count(),
            settings.window,
            resolutions.len(),
            settings.brackets.len(),
            if smoothing_control.is_some() { "on" } else { "off" }
        );

        Ok(Analyzer {
            compound,
            source: source_control,
            smoothing: smoothing_control,
            outputs,
            position: 0.0,
        })
    }
}

fn lookup<C: Capability>(compound: &Compound) -> Result<C::Handle> {
    compound
        .registry()
        .first::<C>()
        .ok_or_else(|| Error::MissingDependency {
            unit: compound.name().to_string(),
            capability: C::NAME,
        })
}

/// A built analysis tree plus the handles used to steer and read it.
pub struct Analyzer {
    compound: Compound,
    source: SourceControl,
    smoothing: Option<SmoothingControl>,
    outputs: Outputs,
    position: f64,
}

impl Analyzer {
    pub fn new(settings: AnalyzerSettings, source: impl SampleSource + 'static) -> Result<Self> {
        AnalyzerBuilder::new(settings).build(source)
    }

    pub fn compound(&self) -> &Compound {
        &self.compound
    }

    pub fn compound_mut(&mut self) -> &mut Compound {
        &mut self.compound
    }

    pub fn source(&self) -> &SourceControl {
        &self.source
    }

    pub fn smoothing(&self) -> Option<&SmoothingControl> {
        self.smoothing.as_ref()
    }

    pub fn outputs(&self) -> &Outputs {
        &self.outputs
    }

    /// Position of the last tick that was begun.
    pub fn position(&self) -> f64 {
        self.position
    }

    /// Swap the shared table. Counts as a reconfiguration and clears a fault.
    pub fn set_frequency_table(&mut self, table: FrequencyTable) -> Result<()> {
        self.compound.provide::<Table>(Arc::new(table))
    }

    /// Run one whole tick at `position` seconds and wait for it.
    pub fn tick(&mut self, position: f64) -> Result<()> {
        self.source.set_position(position);
        self.position = position;
        self.compound.run()
    }

    /// Start a tick at `position` without waiting for its lanes.
    pub fn begin(&mut self, position: f64) -> Result<()> {
        self.source.set_position(position);
        self.position = position;
        self.compound.begin()
    }

    /// Poll the tick started by [`Analyzer::begin`]; applies it once done.
    pub fn poll(&mut self) -> Result<bool> {
        if !self.compound.try_complete()? {
            return Ok(false);
        }
        self.compound.apply()?;
        self.compound.unlock()?;
        Ok(true)
    }

    /// Hand the last applied tick to `sink`.
    pub fn emit(&self, sink: &mut dyn Sink) -> Result<()> {
        let tick = self.compound.ticks().saturating_sub(1);
        sink.consume(tick, self.position, &self.outputs)
    }

    pub fn dispose(&mut self) -> Result<()> {
        self.compound.dispose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Clip;
    use crate::pipeline::LifecycleState;

    fn clip() -> Clip {
        let samples = (0..8192).flat_map(|i| [(i % 7) as f32, 0.0]).collect();
        Clip::new(samples, 2, 8000)
    }

    #[test]
    fn builds_every_requested_stage() {
        let settings = AnalyzerSettings {
            bins: FrequencyBins::B128,
            smoothing: Some(SmoothingSettings::default()),
            brackets: vec![FrequencyRange::new(0.0, 0.25).unwrap()],
            ..AnalyzerSettings::default()
        };
        let analyzer = Analyzer::new(settings, clip()).unwrap();
        let compound = analyzer.compound();
        for name in [
            "samples",
            "fft.coefficients",
            "fft.prepare",
            "fft.execute",
            "fft.magnitude",
            "smoothing",
            "bands.8",
            "bands.128",
            "brackets.64",
            "brackets.custom",
        ] {
            assert_eq!(compound.state_of(name), Some(LifecycleState::Idle), "{}", name);
        }
        assert!(analyzer.smoothing().is_some());
        assert_eq!(analyzer.outputs().bands.len(), 5);
        assert_eq!(analyzer.outputs().brackets.len(), 6);
    }

    #[test]
    fn no_smoothing_and_no_custom_brackets() {
        let settings = AnalyzerSettings {
            resolutions: vec![BandResolution::Bands16, BandResolution::Bands16],
            ..AnalyzerSettings::default()
        };
        let analyzer = Analyzer::new(settings, clip()).unwrap();
        assert_eq!(analyzer.compound().state_of("smoothing"), None);
        assert_eq!(analyzer.compound().state_of("brackets.custom"), None);
        assert_eq!(analyzer.outputs().bands.len(), 1);
        assert!(analyzer.outputs().smoothed().is_none());
    }

    #[test]
    fn invalid_channel_is_caught_at_build() {
        let settings = AnalyzerSettings {
            channels: ChannelSelection::Combine(vec![0, 5]),
            ..AnalyzerSettings::default()
        };
        assert!(matches!(
            Analyzer::new(settings, clip()),
            Err(Error::InvalidChannel { channel: 5, .. })
        ));
    }

    #[test]
    fn invalid_smoothing_is_caught_at_build() {
        let settings = AnalyzerSettings {
            smoothing: Some(SmoothingSettings {
                rate: 2.0,
                radius: 0,
            }),
            ..AnalyzerSettings::default()
        };
        assert!(matches!(
            Analyzer::new(settings, clip()),
            Err(Error::InvalidSmoothing(_))
        ));
    }
}
