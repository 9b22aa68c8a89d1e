mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use bandscope::analysis::{Analyzer, FrameCollector};
use bandscope::audio::{decode_clip, SampleSource};
use bandscope::config::{self, Config};
use cli::Cli;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    // Load config: explicit --config path, or auto-detect bandscope.toml / global config
    let config_path = cli.config.clone().or_else(|| {
        let local = PathBuf::from("bandscope.toml");
        if local.exists() {
            return Some(local);
        }
        if let Some(home) = dirs::home_dir() {
            let xdg = home.join(".config").join("bandscope").join("config.toml");
            if xdg.exists() {
                return Some(xdg);
            }
        }
        if let Some(config_dir) = dirs::config_dir() {
            let platform = config_dir.join("bandscope").join("config.toml");
            if platform.exists() {
                return Some(platform);
            }
        }
        None
    });
    let mut cfg = match config_path {
        Some(ref path) => match config::load_config(path) {
            Some(cfg) => {
                log::info!("Loaded config from {}", path.display());
                cfg
            }
            None => {
                log::warn!("Failed to load config from {}", path.display());
                Config::default()
            }
        },
        None => Config::default(),
    };
    merge_cli(&cli, &mut cfg);

    if !cli.input.exists() {
        anyhow::bail!("Input file not found: {}", cli.input.display());
    }

    log::info!("bandscope - spectrum band extraction");
    log::info!("Input: {}", cli.input.display());
    log::info!("Output: {}", cli.output.display());

    // 1. Decode audio
    log::info!("Decoding audio...");
    let clip = decode_clip(&cli.input)
        .with_context(|| format!("Failed to decode {}", cli.input.display()))?;
    let sample_rate = clip.format().sample_rate;
    let duration = clip.duration();

    // 2. Build the analysis tree
    let settings = cfg
        .settings(sample_rate)
        .context("Invalid analysis settings")?;
    let fps = cfg.analysis.fps.max(1);
    let total_ticks = ((duration * fps as f64).ceil() as u64).max(1);
    let mut analyzer = Analyzer::new(settings, clip).context("Failed to build analyzer")?;

    // 3. Tick loop
    log::info!(
        "Analyzing {:.1}s at {} ticks/s ({} ticks, {})",
        duration,
        fps,
        total_ticks,
        if cli.blocking { "blocking" } else { "polling" }
    );
    let pb = ProgressBar::new(total_ticks);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ticks ({eta} remaining)")
            .context("Invalid progress template")?
            .progress_chars("=>-"),
    );

    let mut collector = FrameCollector::new();
    let mut polls = 0u64;
    for tick in 0..total_ticks {
        let position = tick as f64 / fps as f64;
        if cli.blocking {
            analyzer.tick(position)?;
        } else {
            analyzer.begin(position)?;
            while !analyzer.poll()? {
                polls += 1;
                std::thread::yield_now();
            }
        }
        analyzer.emit(&mut collector)?;
        pb.set_position(tick + 1);
    }
    pb.finish_with_message("Analysis complete");

    let compound = analyzer.compound();
    log::info!(
        "Completed {} ticks, {} lanes per tick",
        compound.ticks(),
        compound.lanes()
    );
    if !cli.blocking {
        log::debug!("{} idle polls", polls);
    }
    analyzer.dispose()?;

    // 4. Write frames
    let frames = collector.into_frames();
    let file = File::create(&cli.output)
        .with_context(|| format!("Failed to create {}", cli.output.display()))?;
    serde_json::to_writer(BufWriter::new(file), &frames)
        .with_context(|| format!("Failed to write {}", cli.output.display()))?;

    log::info!("Done! Output: {}", cli.output.display());
    Ok(())
}

/// Config values apply only where the CLI is at its default.
fn merge_cli(cli: &Cli, cfg: &mut Config) {
    let analysis = &mut cfg.analysis;
    if cli.bins != config::default_bin_count() { analysis.bin_count = cli.bins; }
    if cli.fps != config::default_fps() { analysis.fps = cli.fps; }
    if cli.smoothing != config::default_smoothing() { analysis.smoothing = cli.smoothing; }
    if cli.spatial_radius != 0 { analysis.spatial_radius = cli.spatial_radius; }
    if !cli.channels.is_empty() {
        analysis.channels = cli.channels.clone();
    }
    if let Some(window) = cli.window {
        analysis.window = window;
    }
    if let Some(threads) = cli.threads {
        analysis.threads = threads;
    }
    if !cli.resolutions.is_empty() {
        cfg.bands.resolutions = cli.resolutions.clone();
    }
}
