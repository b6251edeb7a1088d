//! Background capture recorder
//!
//! Ingest hands batches over a bounded channel; a dedicated thread owns the
//! files. A full channel drops the batch instead of stalling ingest.

use chrono::Local;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

use super::{CaptureHeader, CaptureWriter};
use crate::channel::ChannelId;
use crate::error::CaptureError;
use crate::protocol::SampleBatch;

/// Recorder counters
#[derive(Debug, Default)]
pub struct RecorderStats {
    pub recorded: AtomicU64,
    pub dropped: AtomicU64,
    pub write_errors: AtomicU64,
}

/// Point-in-time copy of [`RecorderStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecorderSnapshot {
    pub recorded: u64,
    pub dropped: u64,
    pub write_errors: u64,
}

/// Writes every ingested batch to `ppg_{channel}_{time}.bin` under a directory
#[derive(Debug)]
pub struct CaptureRecorder {
    tx: Option<Sender<SampleBatch>>,
    thread_handle: Option<JoinHandle<()>>,
    stats: Arc<RecorderStats>,
    directory: PathBuf,
}

impl CaptureRecorder {
    /// Create the directory if needed and start the writer thread
    pub fn start(directory: impl Into<PathBuf>, queue: usize) -> Result<Self, CaptureError> {
        let directory = directory.into();
        fs::create_dir_all(&directory)?;

        let (tx, rx) = bounded::<SampleBatch>(queue.max(1));
        let stats = Arc::new(RecorderStats::default());
        let thread_stats = stats.clone();
        let thread_dir = directory.clone();

        let handle = thread::Builder::new()
            .name("capture-recorder".into())
            .spawn(move || write_loop(rx, &thread_dir, &thread_stats))?;

        info!("Recording raw samples to {}", directory.display());

        Ok(Self {
            tx: Some(tx),
            thread_handle: Some(handle),
            stats,
            directory,
        })
    }

    /// Queue a batch for writing. Returns `false` if it had to be dropped.
    pub fn record(&self, batch: &SampleBatch) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(batch.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn snapshot(&self) -> RecorderSnapshot {
        RecorderSnapshot {
            recorded: self.stats.recorded.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            write_errors: self.stats.write_errors.load(Ordering::Relaxed),
        }
    }

    /// Flush and close every file
    pub fn stop(&mut self) {
        // Closing the channel ends the write loop
        self.tx.take();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                error!("Capture recorder thread panicked");
            }
        }
    }
}

impl Drop for CaptureRecorder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn write_loop(rx: Receiver<SampleBatch>, directory: &Path, stats: &RecorderStats) {
    let mut writers: HashMap<ChannelId, CaptureWriter<BufWriter<File>>> = HashMap::new();

    for batch in rx.iter() {
        // Records store 32-bit millisecond stamps
        let Ok(timestamp_ms) = i32::try_from(batch.timestamp_ms) else {
            stats.write_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Channel {} capture: timestamp {}ms does not fit a record, batch skipped",
                batch.channel, batch.timestamp_ms
            );
            continue;
        };

        if !writers.contains_key(&batch.channel) {
            let header = CaptureHeader {
                channel: batch.channel,
                bundle_size: batch.values.len(),
            };
            let path = directory.join(file_name(batch.channel));
            match CaptureWriter::create(&path, header) {
                Ok(w) => {
                    info!("Channel {} capture: {}", batch.channel, path.display());
                    writers.insert(batch.channel, w);
                }
                Err(e) => {
                    stats.write_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Cannot create {}: {}", path.display(), e);
                    continue;
                }
            }
        }
        let Some(writer) = writers.get_mut(&batch.channel) else {
            continue;
        };

        match writer.write_record(timestamp_ms, &batch.values) {
            Ok(()) => {
                stats.recorded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Channel {} capture write failed: {}", batch.channel, e);
            }
        }
    }

    for (channel, mut writer) in writers {
        if let Err(e) = writer.flush() {
            warn!("Channel {} capture flush failed: {}", channel, e);
        }
        info!("Channel {} capture closed, {} records", channel, writer.records());
    }
}

fn file_name(channel: ChannelId) -> String {
    format!("ppg_{}_{}.bin", channel, Local::now().format("%Y%m%d_%H%M%S_%6f"))
}
