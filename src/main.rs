//! vcam demo host: runs one virtual camera stream and drains its queue

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use vcam::capture::{self, FrameSource, ManualSource};
use vcam::{CaptureBackend, Config, MediaSample, StreamController, StreamId};

/// vcam command line arguments
#[derive(Parser, Debug)]
#[command(name = "vcam")]
#[command(version, about = "Re-publish a camera as a virtual video stream", long_about = None)]
struct Args {
    /// Feed the stream from generated test frames instead of a camera
    #[arg(long)]
    stub: bool,

    /// TOML configuration file layered over the defaults
    #[arg(value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize error handling and logging
    color_eyre::install()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vcam=info"));
    let registry = tracing_subscriber::registry().with(filter).with(
        tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()),
    );
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();

    info!("vcam launching...");

    let mut config = Config::load(args.config.as_deref())?;
    if args.stub {
        config.capture.backend = CaptureBackend::Stub;
    }
    info!("Capture backend: {:?}", config.capture.backend);

    let (source, feed) = build_source(&config);
    let stream = Arc::new(StreamController::new(StreamId(1), &config, source));

    // The listener runs on the timer path: it only wakes the drain task
    let (wake_tx, wake_rx) = flume::bounded::<u64>(config.stream.queue_capacity);
    let listener = move |_stream: StreamId, sample: &Arc<MediaSample>| {
        let _ = wake_tx.try_send(sample.sequence());
    };
    let queue = stream.register_consumer(Some(Arc::new(listener)))?;

    let drain = tokio::spawn(async move {
        let mut drained = 0u64;
        while wake_rx.recv_async().await.is_ok() {
            for sample in queue.drain() {
                drained += 1;
                if drained % 300 == 1 {
                    info!(
                        "sample #{} pts={:.3}s {}x{} {}",
                        sample.sequence(),
                        sample.presentation_timestamp().as_secs_f64(),
                        sample.format().width,
                        sample.format().height,
                        sample.format().codec_str()
                    );
                }
            }
        }
        drained
    });

    // Stub frames stand in for a camera at the configured rate
    let feeder = feed.map(|feed| {
        let (width, height, format, fps) = (
            config.stream.width,
            config.stream.height,
            config.stream.format,
            config.stream.fps,
        );
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1) / fps.max(1));
            let mut sequence = 0;
            loop {
                interval.tick().await;
                sequence += 1;
                feed.deliver(capture::stub::test_pattern(width, height, format, sequence));
            }
        })
    });

    if let Err(e) = stream.start() {
        warn!("Stream did not start: {}", e);
    }

    tokio::signal::ctrl_c().await?;
    info!("Ctrl-C received");

    stream.stop_and_wait().await;
    if let Some(feeder) = feeder {
        feeder.abort();
    }
    if let Some(stats) = stream.stats() {
        info!(
            "Enqueued {} samples, dropped {}, reader took {}",
            stats.enqueued, stats.dropped, stats.dequeued
        );
    }

    // Dropping the stream releases the listener and closes the wake channel
    drop(stream);
    let drained = drain.await?;
    info!("vcam shutting down after draining {} samples", drained);
    Ok(())
}

fn build_source(config: &Config) -> (Box<dyn FrameSource>, Option<capture::ManualFeed>) {
    match config.capture.backend {
        CaptureBackend::V4l2 => (
            Box::new(capture::V4l2Source::new(&config.stream, config.capture.clone())),
            None,
        ),
        #[cfg(feature = "gstreamer-source")]
        CaptureBackend::Gstreamer => (
            Box::new(capture::GstSource::new(&config.stream, config.capture.clone())),
            None,
        ),
        #[cfg(not(feature = "gstreamer-source"))]
        CaptureBackend::Gstreamer => {
            warn!("Built without gstreamer-source, falling back to V4L2");
            (
                Box::new(capture::V4l2Source::new(&config.stream, config.capture.clone())),
                None,
            )
        }
        CaptureBackend::Stub => {
            let (source, feed) = ManualSource::new();
            (Box::new(source), Some(feed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stub_and_config() {
        let args = Args::try_parse_from(["vcam", "--stub", "vcam.toml"]).unwrap();
        assert!(args.stub);
        assert_eq!(args.config, Some(PathBuf::from("vcam.toml")));
    }

    #[test]
    fn test_parse_defaults() {
        let args = Args::try_parse_from(["vcam"]).unwrap();
        assert!(!args.stub);
        assert_eq!(args.config, None);
    }

    #[test]
    fn test_unknown_flag_is_not_a_config_path() {
        let err = Args::try_parse_from(["vcam", "--stb"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::UnknownArgument);

        let err = Args::try_parse_from(["vcam", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
