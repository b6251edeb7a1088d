//! Per-channel worker task

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::channel::{Channel, ChannelId};
use crate::dispatch::Dispatcher;
use crate::protocol::SampleBatch;

/// Owns one [`Channel`] and feeds its events to the dispatcher.
///
/// Batches arrive in receive order on a bounded queue; the worker is the
/// only writer of the channel's state.
pub struct ChannelWorker {
    channel: Channel,
    queue: mpsc::Receiver<SampleBatch>,
    dispatcher: Arc<Dispatcher>,
}

impl ChannelWorker {
    pub fn new(channel: Channel, queue: mpsc::Receiver<SampleBatch>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            channel,
            queue,
            dispatcher,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                batch = self.queue.recv() => match batch {
                    Some(batch) => {
                        self.process(&batch);
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Channel {} worker stopped", self.channel.id());
    }

    /// Run every sample of a batch through the channel.
    ///
    /// Returns the number of events dispatched.
    pub fn process(&mut self, batch: &SampleBatch) -> usize {
        let mut emitted = 0;
        for sample in batch.samples() {
            // Out-of-order samples are logged and counted by the channel
            let Ok(Some(event)) = self.channel.ingest(&sample) else {
                continue;
            };
            emitted += 1;
            match self.dispatcher.dispatch(&event) {
                Ok(lanes) => trace!("Channel {} beat sent to {} lanes", event.channel, lanes),
                Err(e) => debug!("Channel {} beat not dispatched: {}", event.channel, e),
            }
        }
        emitted
    }
}
