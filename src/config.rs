use serde::Deserialize;
use std::path::Path;

use crate::analysis::{
    AnalyzerSettings, BandResolution, ChannelSelection, FrequencyBins, FrequencyRange,
    FrequencyScale, SmoothingSettings, WindowKind,
};
use crate::error::Result;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub bands: BandsConfig,
    #[serde(default)]
    pub brackets: Vec<BracketConfig>,
}

#[derive(Debug, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_bin_count")]
    pub bin_count: usize,
    #[serde(default)]
    pub window: WindowKind,
    #[serde(default = "default_channels")]
    pub channels: Vec<usize>,
    #[serde(default = "default_smoothing")]
    pub smoothing: f32,
    #[serde(default)]
    pub spatial_radius: usize,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub threads: usize,
}

#[derive(Debug, Deserialize)]
pub struct BandsConfig {
    #[serde(default = "default_resolutions")]
    pub resolutions: Vec<usize>,
    #[serde(default)]
    pub scale: FrequencyScale,
}

/// A user bracket, either as fractions of the spectrum or in Hz.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum BracketConfig {
    Fraction { start: f32, length: f32 },
    Hz { low_hz: f32, high_hz: f32 },
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            bin_count: default_bin_count(),
            window: WindowKind::default(),
            channels: default_channels(),
            smoothing: default_smoothing(),
            spatial_radius: 0,
            fps: default_fps(),
            threads: 0,
        }
    }
}

impl Default for BandsConfig {
    fn default() -> Self {
        Self {
            resolutions: default_resolutions(),
            scale: FrequencyScale::default(),
        }
    }
}

pub fn default_bin_count() -> usize { 1024 }
fn default_channels() -> Vec<usize> { vec![0] }
pub fn default_smoothing() -> f32 { 1.0 }
pub fn default_fps() -> u32 { 30 }
fn default_resolutions() -> Vec<usize> { BandResolution::ALL.iter().map(|r| r.count()).collect() }

impl BracketConfig {
    pub fn range(&self, nyquist: f32) -> Result<FrequencyRange> {
        match *self {
            BracketConfig::Fraction { start, length } => FrequencyRange::new(start, length),
            BracketConfig::Hz { low_hz, high_hz } => {
                FrequencyRange::from_hz(low_hz, high_hz, nyquist)
            }
        }
    }
}

impl Config {
    /// Validate and turn into analyzer settings for a source at `sample_rate`.
    pub fn settings(&self, sample_rate: u32) -> Result<AnalyzerSettings> {
        let analysis = &self.analysis;
        let smoothing = SmoothingSettings::new(analysis.smoothing, analysis.spatial_radius)?;
        let nyquist = sample_rate as f32 / 2.0;
        Ok(AnalyzerSettings {
            bins: FrequencyBins::try_from(analysis.bin_count)?,
            channels: ChannelSelection::from_list(&analysis.channels)?,
            window: analysis.window,
            smoothing: (!smoothing.is_neutral()).then_some(smoothing),
            resolutions: self
                .bands
                .resolutions
                .iter()
                .map(|&r| BandResolution::try_from(r))
                .collect::<Result<_>>()?,
            scale: self.bands.scale,
            brackets: self
                .brackets
                .iter()
                .map(|b| b.range(nyquist))
                .collect::<Result<_>>()?,
            threads: analysis.threads,
        })
    }
}

pub fn load_config(path: &Path) -> Option<Config> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(err) => {
            log::warn!("Invalid config {}: {}", path.display(), err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::BinRange;
    use crate::error::Error;

    #[test]
    fn empty_file_gives_defaults() {
        let config: Config = toml::from_str("").unwrap();
        let settings = config.settings(48000).unwrap();
        assert_eq!(settings.bins, FrequencyBins::B1024);
        assert_eq!(settings.channels, ChannelSelection::Single(0));
        assert_eq!(settings.resolutions.len(), 5);
        assert!(settings.smoothing.is_none());
        assert!(settings.brackets.is_empty());
    }

    #[test]
    fn full_file_parses() {
        let config: Config = toml::from_str(
            r#"
            [analysis]
            bin_count = 2048
            window = "blackman"
            channels = [0, 1]
            smoothing = 0.4
            spatial_radius = 2
            threads = 4

            [bands]
            resolutions = [8, 32]
            scale = { kind = "linear" }

            [[brackets]]
            start = 0.0
            length = 0.25

            [[brackets]]
            low_hz = 0.0
            high_hz = 12000.0
            "#,
        )
        .unwrap();
        let settings = config.settings(48000).unwrap();
        assert_eq!(settings.bins, FrequencyBins::B2048);
        assert_eq!(settings.window, WindowKind::Blackman);
        assert_eq!(settings.channels, ChannelSelection::Combine(vec![0, 1]));
        assert_eq!(settings.smoothing, Some(SmoothingSettings { rate: 0.4, radius: 2 }));
        assert_eq!(
            settings.resolutions,
            vec![BandResolution::Bands8, BandResolution::Bands32]
        );
        assert_eq!(settings.scale, FrequencyScale::Linear);
        assert_eq!(settings.brackets[1].resolve(1024), BinRange::new(0, 512));
        assert_eq!(settings.threads, 4);
    }

    #[test]
    fn logarithmic_scale_takes_octaves() {
        let config: Config =
            toml::from_str("[bands]\nscale = { kind = \"logarithmic\", octaves = 6.0 }").unwrap();
        assert_eq!(config.bands.scale, FrequencyScale::Logarithmic { octaves: 6.0 });
    }

    #[test]
    fn invalid_values_are_errors() {
        let mut config = Config::default();
        config.analysis.bin_count = 1000;
        assert!(matches!(config.settings(44100), Err(Error::InvalidBinCount(1000))));

        let mut config = Config::default();
        config.analysis.smoothing = 0.0;
        assert!(matches!(config.settings(44100), Err(Error::InvalidSmoothing(_))));

        let mut config = Config::default();
        config.bands.resolutions = vec![12];
        assert!(matches!(config.settings(44100), Err(Error::InvalidResolution(12))));

        let mut config = Config::default();
        config.brackets = vec![BracketConfig::Fraction { start: 0.9, length: 0.5 }];
        assert!(matches!(config.settings(44100), Err(Error::InvalidRange { .. })));
    }
}
