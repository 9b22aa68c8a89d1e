use std::sync::Arc;

/// Channel layout and rate of a sample source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFormat {
    pub channels: usize,
    pub sample_rate: u32,
}

/// Something that can hand out blocks of interleaved samples by time.
pub trait SampleSource: Send {
    fn format(&self) -> SourceFormat;

    /// Fill `out` (`frames * channels` long) with interleaved samples starting
    /// at `position` seconds. Frames outside the source are zero.
    fn read(&mut self, position: f64, frames: usize, out: &mut [f32]);
}

/// A decoded clip held in memory, interleaved.
#[derive(Debug, Clone)]
pub struct Clip {
    samples: Arc<[f32]>,
    channels: usize,
    sample_rate: u32,
}

impl Clip {
    pub fn new(samples: Vec<f32>, channels: usize, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            channels: channels.max(1),
            sample_rate,
        }
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels
    }

    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn is_silent(&self) -> bool {
        self.samples.iter().all(|s| *s == 0.0)
    }
}

impl SampleSource for Clip {
    fn format(&self) -> SourceFormat {
        SourceFormat {
            channels: self.channels,
            sample_rate: self.sample_rate,
        }
    }

    fn read(&mut self, position: f64, frames: usize, out: &mut [f32]) {
        out.fill(0.0);
        let total = self.frames() as i64;
        let first = (position * self.sample_rate as f64).floor() as i64;
        let from = first.clamp(0, total);
        let to = (first + frames as i64).clamp(0, total);
        if from >= to {
            return;
        }
        let offset = ((from - first) as usize) * self.channels;
        let src = &self.samples[from as usize * self.channels..to as usize * self.channels];
        let len = src.len().min(out.len().saturating_sub(offset));
        out[offset..offset + len].copy_from_slice(&src[..len]);
    }
}
