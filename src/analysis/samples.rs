//! First stage of a tick: read one block from the source and reduce it to a
//! single channel.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::{FrequencyBins, Geometry, RawSamples, Samples, SpectrumInfos, Tap};
use crate::audio::SampleSource;
use crate::error::{Error, Result};
use crate::pipeline::{fan_out, Job, PrepareContext, Processor, Registry};

/// Which source channels feed the analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelSelection {
    Single(usize),
    /// Average of the listed channels.
    Combine(Vec<usize>),
}

impl Default for ChannelSelection {
    fn default() -> Self {
        ChannelSelection::Single(0)
    }
}

impl ChannelSelection {
    /// One entry selects, several combine.
    pub fn from_list(channels: &[usize]) -> Result<Self> {
        match channels {
            [] => Err(Error::EmptyChannelSelection),
            [channel] => Ok(ChannelSelection::Single(*channel)),
            many => Ok(ChannelSelection::Combine(many.to_vec())),
        }
    }

    pub fn indices(&self) -> &[usize] {
        match self {
            ChannelSelection::Single(channel) => std::slice::from_ref(channel),
            ChannelSelection::Combine(channels) => channels,
        }
    }

    pub fn validate(&self, channels: usize) -> Result<()> {
        let indices = self.indices();
        if indices.is_empty() {
            return Err(Error::EmptyChannelSelection);
        }
        match indices.iter().find(|&&c| c >= channels) {
            Some(&channel) => Err(Error::InvalidChannel { channel, channels }),
            None => Ok(()),
        }
    }
}

/// Settings the sample stage snapshots at `lock`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceSettings {
    pub bins: FrequencyBins,
    pub channels: ChannelSelection,
    /// Seconds into the source.
    pub position: f64,
}

/// Pending-configuration handle for a [`SampleStage`]. Setters may be called
/// at any time; they take effect at the next `lock`.
#[derive(Debug, Clone, Default)]
pub struct SourceControl {
    pending: Arc<Mutex<SourceSettings>>,
}

impl SourceControl {
    pub fn new(settings: SourceSettings) -> Self {
        Self {
            pending: Arc::new(Mutex::new(settings)),
        }
    }

    pub fn set_bins(&self, bins: FrequencyBins) {
        self.pending.lock().bins = bins;
    }

    pub fn set_channels(&self, channels: ChannelSelection) {
        self.pending.lock().channels = channels;
    }

    pub fn set_position(&self, position: f64) {
        self.pending.lock().position = position;
    }

    pub fn settings(&self) -> SourceSettings {
        self.pending.lock().clone()
    }
}

pub struct SampleStage {
    name: String,
    source: Box<dyn SampleSource>,
    control: SourceControl,
    locked: SourceSettings,
    raw: Tap<f32>,
    samples: Tap<f32>,
    geometry: Arc<RwLock<SpectrumInfos>>,
}

impl SampleStage {
    pub const NAME: &'static str = "samples";

    pub fn new(source: impl SampleSource + 'static, control: SourceControl) -> Self {
        Self {
            name: Self::NAME.to_string(),
            source: Box::new(source),
            locked: control.settings(),
            control,
            raw: Tap::new(),
            samples: Tap::new(),
            geometry: Arc::new(RwLock::new(SpectrumInfos::default())),
        }
    }

    pub fn control(&self) -> SourceControl {
        self.control.clone()
    }

    pub fn raw(&self) -> Tap<f32> {
        self.raw.clone()
    }

    pub fn samples(&self) -> Tap<f32> {
        self.samples.clone()
    }

    pub fn geometry(&self) -> Arc<RwLock<SpectrumInfos>> {
        self.geometry.clone()
    }
}

impl Processor for SampleStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&self, registry: &mut Registry) {
        registry.provide::<Geometry>(self.geometry.clone());
        registry.provide::<RawSamples>(self.raw.clone());
        registry.provide::<Samples>(self.samples.clone());
    }

    fn lock(&mut self) {
        self.locked = self.control.settings();
    }

    fn prepare(&mut self, _ctx: &PrepareContext<'_>) -> Result<Job> {
        let format = self.source.format();
        self.locked.channels.validate(format.channels)?;

        let infos = SpectrumInfos::new(self.locked.bins, format.sample_rate, format.channels);
        {
            let mut geometry = self.geometry.write();
            if geometry.bin_count != infos.bin_count {
                log::debug!(
                    "{}: bin count {} -> {}",
                    self.name,
                    geometry.bin_count,
                    infos.bin_count
                );
            }
            *geometry = infos;
        }

        let frames = infos.window_len;
        {
            let mut raw = self.raw.working().write();
            raw.resize(frames * format.channels);
            self.source
                .read(self.locked.position, frames, raw.as_mut_slice());
        }
        self.samples.working().write().resize(frames);

        let raw = self.raw.working().clone();
        let out = self.samples.working().clone();
        let selection = self.locked.channels.clone();
        let stride = format.channels;

        Ok(Job::parallel(frames, move || {
            let raw = raw.read();
            let raw = raw.as_slice();
            let mut out = out.write();
            match &selection {
                ChannelSelection::Single(channel) => {
                    fan_out(out.as_mut_slice(), |i, sample| {
                        *sample = raw[i * stride + channel];
                    });
                }
                ChannelSelection::Combine(channels) => {
                    let count = channels.len() as f32;
                    fan_out(out.as_mut_slice(), |i, sample| {
                        let frame = &raw[i * stride..(i + 1) * stride];
                        *sample = channels.iter().map(|&c| frame[c]).sum::<f32>() / count;
                    });
                }
            }
        }))
    }

    fn apply(&mut self) {
        self.raw.publish();
        self.samples.publish();
    }

    fn dispose(&mut self) {
        self.raw.release();
        self.samples.release();
    }
}
