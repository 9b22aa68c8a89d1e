use clap::Parser;
use std::path::PathBuf;

use bandscope::analysis::WindowKind;

#[derive(Parser, Debug)]
#[command(name = "bandscope", about = "Spectrum, band and bracket extraction for audio files")]
pub struct Cli {
    /// Input audio file (WAV, MP3, FLAC, OGG)
    pub input: PathBuf,

    /// Output JSON file, one frame per tick
    #[arg(short, long, default_value = "bands.json")]
    pub output: PathBuf,

    /// Frequency bins per tick (64 to 8192, power of two)
    #[arg(long, default_value_t = 1024)]
    pub bins: usize,

    /// Ticks per second of audio
    #[arg(long, default_value_t = 30)]
    pub fps: u32,

    /// Source channels to analyze; several are averaged
    #[arg(long, value_delimiter = ',')]
    pub channels: Vec<usize>,

    /// Temporal smoothing rate in (0, 1]; 1 disables it
    #[arg(long, default_value_t = 1.0)]
    pub smoothing: f32,

    /// Neighbour bins averaged on each side; 0 disables it
    #[arg(long, default_value_t = 0)]
    pub spatial_radius: usize,

    /// Band resolutions to compute (8, 16, 32, 64, 128)
    #[arg(long, value_delimiter = ',')]
    pub resolutions: Vec<usize>,

    /// Window function (hann, hamming, blackman, rectangular)
    #[arg(long)]
    pub window: Option<WindowKind>,

    /// Worker threads (0 = one per core)
    #[arg(long)]
    pub threads: Option<usize>,

    /// Config file (default: bandscope.toml, then the user config dir)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Run every tick synchronously instead of polling
    #[arg(long)]
    pub blocking: bool,
}
