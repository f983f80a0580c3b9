//! Throttled broadcast scheduler
//!
//! Edits and effect steps overwrite a single pending-frame slot. Once per tick
//! the slot is taken, stamped with the live cursors and client count, encoded
//! once and queued for every client. Anything overwritten before its tick is
//! never sent.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::net::presence::Presence;
use crate::net::protocol::{encode, CanvasMessage};

pub struct BroadcastScheduler {
    pending: Mutex<Option<CanvasMessage>>,
    presence: Arc<Presence>,
    metrics: Arc<Metrics>,
}

impl BroadcastScheduler {
    pub fn new(presence: Arc<Presence>, metrics: Arc<Metrics>) -> Self {
        Self {
            pending: Mutex::new(None),
            presence,
            metrics,
        }
    }

    /// Make `frame` the next one to go out, replacing any frame still pending
    pub fn submit(&self, frame: CanvasMessage) {
        if self.pending.lock().replace(frame).is_some() {
            self.metrics.frames_coalesced.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Send the pending frame, if any, to every live client.
    ///
    /// Returns the number of clients that took the frame. Clients that could
    /// not are dropped and the remaining ones are told the new count.
    pub fn flush(&self) -> Option<usize> {
        let mut frame = self.pending.lock().take()?;
        let started = Instant::now();

        let (cursors, count) = self.presence.view();
        frame.stamp(cursors, count);

        let encoded = match encode(&frame) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Failed to encode frame for broadcast: {}", e);
                return None;
            }
        };

        let delivery = self.presence.deliver(&encoded);
        self.metrics.frames_broadcast.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Broadcast {} bytes to {} clients ({} failed)",
            encoded.len(),
            delivery.sent,
            delivery.failed.len()
        );

        if !delivery.failed.is_empty() && self.presence.drop_clients(&delivery.failed) > 0 {
            self.presence.announce_count();
        }

        self.metrics.record_broadcast_time(started.elapsed());
        Some(delivery.sent)
    }
}

/// Start the periodic broadcast task
pub fn start_broadcast_loop(scheduler: Arc<BroadcastScheduler>, tick: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Broadcast loop started, tick {:?}", tick);

        loop {
            ticker.tick().await;
            scheduler.flush();
        }
    })
}
