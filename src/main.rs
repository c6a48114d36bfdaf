//! streamcap: decode a file/RTP/RTSP stream and capture frames in a loop

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::{eyre::eyre, Result};
use streamcap::capture::PixelFormat;
use streamcap::{CaptureLoopConfig, Config, DecodeError, Decoder, DecoderOptions, GstRuntime};
use tracing::{debug, info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let (config_path, resource) = parse_args();
    let mut config = Config::load(config_path.as_deref())?;
    if let Some(resource) = resource {
        config.decoder.resource = resource;
    }

    init_tracing(&config.logging.filter);
    info!("streamcap launching...");
    streamcap::CONFIG.store(Arc::new(config.clone()));

    if let Some(path) = &config.capture.snapshot {
        snapshot_color(config.capture.format)
            .ok_or_else(|| eyre!("cannot write {} frames as PNG ({})", config.capture.format, path.display()))?;
    }

    let runtime = GstRuntime::init()?;
    let options = DecoderOptions::try_from(&config.decoder)?;
    info!("decoding {} ({})", options.resource, options.codec);
    let decoder = Decoder::create(&runtime, options)?;

    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = Arc::clone(&stop);
    let capture_config = config.capture.clone();
    let mut worker =
        tokio::task::spawn_blocking(move || run_capture(decoder, &capture_config, &worker_stop));

    let captured = tokio::select! {
        result = &mut worker => result??,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping capture");
            stop.store(true, Ordering::Relaxed);
            worker.await??
        }
    };

    info!("streamcap shutting down after {} frames", captured);
    Ok(())
}

/// `streamcap [config.toml] [resource]`
fn parse_args() -> (Option<PathBuf>, Option<String>) {
    let mut config = None;
    let mut resource = None;
    for arg in std::env::args().skip(1) {
        if config.is_none() && arg.ends_with(".toml") {
            config = Some(PathBuf::from(arg));
        } else {
            resource = Some(arg);
        }
    }
    (config, resource)
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_timer(fmt::time::uptime()));

    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());

    registry.init();
}

fn run_capture(mut decoder: Decoder, config: &CaptureLoopConfig, stop: &AtomicBool) -> Result<u64> {
    decoder.open()?;

    let timeout = config.timeout();
    let mut last = Vec::new();
    let mut geometry = (0, 0);
    let mut total = 0u64;
    let mut window_frames = 0u64;
    let mut window_start = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        match decoder.capture(config.format, timeout) {
            Ok(frame) => {
                total += 1;
                window_frames += 1;
                if config.snapshot.is_some() {
                    last.clear();
                    last.extend_from_slice(frame.data);
                    geometry = (frame.width, frame.height);
                }
            }
            Err(DecodeError::Timeout) => debug!("no frame within {:?}", timeout),
            Err(err) if err.is_end_of_stream() => {
                info!("end of stream");
                break;
            }
            Err(err) if err.is_transient() => {
                warn!("capture failed: {}", err);
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(err) => return Err(err.into()),
        }

        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let stats = decoder.stats();
            info!(
                "{:.1} fps, {}x{}, {} overwritten, {} dropped",
                window_frames as f64 / elapsed.as_secs_f64(),
                decoder.width(),
                decoder.height(),
                stats.ring.overwritten,
                stats.dropped
            );
            window_frames = 0;
            window_start = Instant::now();
        }

        if config.max_frames.is_some_and(|max| total >= max) {
            info!("captured {} frames, stopping", total);
            break;
        }
    }

    decoder.close();

    if let Some(path) = &config.snapshot {
        if last.is_empty() {
            warn!("no frame captured, skipping snapshot");
        } else {
            save_snapshot(path, &last, geometry, config.format)?;
        }
    }
    Ok(total)
}

fn snapshot_color(format: PixelFormat) -> Option<image::ColorType> {
    match format {
        PixelFormat::Rgb8 => Some(image::ColorType::Rgb8),
        PixelFormat::Rgba8 => Some(image::ColorType::Rgba8),
        PixelFormat::Gray8 => Some(image::ColorType::L8),
        _ => None,
    }
}

fn save_snapshot(path: &Path, data: &[u8], (width, height): (u32, u32), format: PixelFormat) -> Result<()> {
    let color = snapshot_color(format).ok_or_else(|| eyre!("cannot write {} as PNG", format))?;
    image::save_buffer_with_format(path, data, width, height, color, image::ImageFormat::Png)?;
    info!("wrote {}x{} snapshot to {}", width, height, path.display());
    Ok(())
}
