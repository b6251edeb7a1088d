//! Capture Replay
//!
//! Streams recorded capture files, or a synthetic pulse, to a relay as
//! live `/ppg/{id}` datagrams.
//!
//! Usage:
//!   replay [OPTIONS] FILE...
//!   replay [OPTIONS] --synthetic BPM
//!
//! Options:
//!   --target HOST:PORT   relay ingest address (default 127.0.0.1:8000)
//!   --channel N          send on channel N instead of the recorded one
//!   --loop               repeat until interrupted
//!   --duration SECS      length of the synthetic pulse (default: endless)

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulse_relay::{
    capture::{CaptureReader, CaptureRecord},
    channel::ChannelId,
    constants::*,
    network::sender_socket,
    protocol::SampleBatch,
    signal::PulseWave,
};

struct Options {
    target: SocketAddr,
    channel: Option<ChannelId>,
    looping: bool,
    synthetic: Option<f64>,
    duration: Option<f64>,
    files: Vec<PathBuf>,
}

fn parse_args() -> Result<Options> {
    let mut options = Options {
        target: SocketAddr::from(([127, 0, 0, 1], DEFAULT_INGEST_PORT)),
        channel: None,
        looping: false,
        synthetic: None,
        duration: None,
        files: Vec::new(),
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |name: &str| args.next().with_context(|| format!("{name} needs a value"));
        match arg.as_str() {
            "--target" => {
                options.target = value("--target")?.parse().context("Invalid target address")?;
            }
            "--channel" => {
                let raw: u8 = value("--channel")?.parse().context("Invalid channel")?;
                options.channel = Some(ChannelId::new(raw).context("Channel out of range")?);
            }
            "--loop" => options.looping = true,
            "--synthetic" => {
                options.synthetic = Some(value("--synthetic")?.parse().context("Invalid BPM")?);
            }
            "--duration" => {
                options.duration = Some(value("--duration")?.parse().context("Invalid duration")?);
            }
            flag if flag.starts_with("--") => bail!("Unknown option {flag}"),
            _ => options.files.push(PathBuf::from(&arg)),
        }
    }

    if options.synthetic.is_none() && options.files.is_empty() {
        bail!("Nothing to replay: give capture files or --synthetic BPM");
    }
    Ok(options)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = parse_args()?;
    let socket = Arc::new(sender_socket(false).context("Failed to create sender socket")?);
    tracing::info!("Replaying to {}", options.target);

    let mut tasks = Vec::new();

    if let Some(bpm) = options.synthetic {
        let channel = options.channel.unwrap_or(ChannelId::new(0).context("Channel 0")?);
        let socket = socket.clone();
        let (target, duration) = (options.target, options.duration);
        tasks.push(tokio::spawn(async move {
            synthetic(socket, target, channel, bpm, duration).await
        }));
    }

    for path in options.files {
        let socket = socket.clone();
        let (target, channel, looping) = (options.target, options.channel, options.looping);
        tasks.push(tokio::spawn(async move {
            replay_file(socket, target, path, channel, looping).await
        }));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
        _ = async {
            for task in tasks {
                match task.await {
                    Ok(Err(e)) => tracing::error!("{:#}", e),
                    Err(e) => tracing::error!("Replay task failed: {}", e),
                    Ok(Ok(())) => {}
                }
            }
        } => tracing::info!("Replay finished"),
    }
    Ok(())
}

async fn replay_file(
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    path: PathBuf,
    channel: Option<ChannelId>,
    looping: bool,
) -> Result<()> {
    let reader = CaptureReader::open(&path).with_context(|| format!("Cannot open {}", path.display()))?;
    let header = reader.header();
    let channel = channel.unwrap_or(header.channel);

    let mut records: Vec<CaptureRecord> = Vec::new();
    for record in reader {
        match record {
            Ok(r) => records.push(r),
            Err(e) => {
                tracing::warn!("{}: {}, replaying what was read", path.display(), e);
                break;
            }
        }
    }
    let (Some(first), Some(last)) = (records.first(), records.last()) else {
        tracing::warn!("{}: no records", path.display());
        return Ok(());
    };

    let interval_ms = 1000.0 / DEFAULT_SAMPLE_RATE_HZ as f64;
    let first_ts = first.timestamp_ms as i64;
    // One loop spans the file plus one record period
    let span_ms = (last.timestamp_ms as i64 - first_ts) + (interval_ms * header.bundle_size as f64) as i64;

    tracing::info!(
        "{}: {} records on channel {} ({:.1}s)",
        path.display(),
        records.len(),
        channel,
        span_ms as f64 / 1000.0
    );

    let start = Instant::now();
    let mut offset_ms: i64 = 0;
    loop {
        for record in &records {
            let due = offset_ms + record.timestamp_ms as i64 - first_ts;
            tokio::time::sleep_until(start + Duration::from_millis(due.max(0) as u64)).await;
            let batch = record.to_batch(channel, offset_ms, interval_ms);
            send(&socket, target, &batch).await;
        }
        if !looping {
            return Ok(());
        }
        offset_ms += span_ms;
    }
}

async fn synthetic(
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    channel: ChannelId,
    bpm: f64,
    duration: Option<f64>,
) -> Result<()> {
    if !(bpm.is_finite() && bpm > 0.0) {
        bail!("BPM must be positive");
    }
    tracing::info!("Synthetic {:.0} BPM pulse on channel {}", bpm, channel);

    let wave = PulseWave::new(bpm);
    let interval = 1.0 / DEFAULT_SAMPLE_RATE_HZ as f64;
    let bundle_period = Duration::from_secs_f64(interval * DEFAULT_BUNDLE_SIZE as f64);
    let start = Instant::now();
    let mut ticker = tokio::time::interval(bundle_period);

    for bundle in 0u64.. {
        ticker.tick().await;
        let t0 = bundle as f64 * DEFAULT_BUNDLE_SIZE as f64 * interval;
        if duration.is_some_and(|d| t0 >= d) {
            break;
        }
        let values = (0..DEFAULT_BUNDLE_SIZE)
            .map(|k| wave.sample_at(t0 + k as f64 * interval))
            .collect();
        let batch = SampleBatch {
            channel,
            timestamp_ms: (t0 * 1000.0).round() as i64,
            values,
            interval_ms: interval * 1000.0,
        };
        send(&socket, target, &batch).await;
    }

    tracing::info!("Synthetic pulse done after {:.1}s", start.elapsed().as_secs_f64());
    Ok(())
}

async fn send(socket: &UdpSocket, target: SocketAddr, batch: &SampleBatch) {
    if let Err(e) = socket.send_to(&batch.encode(), target).await {
        tracing::warn!("Failed to send batch: {}", e);
    }
}
