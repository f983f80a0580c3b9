//! Canvas session - the shared state every client connection works against

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::canvas::effects::EffectEngine;
use crate::canvas::grid::{BoundsError, Grid, GridStore};
use crate::canvas::pattern::{Detection, DetectionGate, PatternDetector, Trigger};
use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::net::broadcast::{start_broadcast_loop, BroadcastScheduler};
use crate::net::presence::{ClientId, Presence};
use crate::net::protocol::{encode, CanvasMessage, Cursor, Edit, EncodedFrame};
use crate::net::session::SessionError;

/// Grid, presence, broadcast scheduler and effect worker for one canvas
pub struct CanvasSession {
    grid: Arc<GridStore>,
    presence: Arc<Presence>,
    scheduler: Arc<BroadcastScheduler>,
    effects: EffectEngine,
    detector: PatternDetector,
    gate: DetectionGate,
    clear_trigger: bool,
    skip_malformed: bool,
    tick: Duration,
    outbound_queue: usize,
    metrics: Arc<Metrics>,
}

impl CanvasSession {
    /// Build the canvas and spawn its effect worker. Must run inside a tokio runtime.
    pub fn new(config: &ServerConfig, metrics: Arc<Metrics>) -> Self {
        let grid = Arc::new(GridStore::new(config.grid_rows, config.grid_cols));
        let presence = Arc::new(Presence::new(metrics.clone()));
        let scheduler = Arc::new(BroadcastScheduler::new(presence.clone(), metrics.clone()));
        let effects = EffectEngine::start(
            grid.clone(),
            scheduler.clone(),
            config.effect_timing(),
            metrics.clone(),
        );

        info!(
            "Canvas {}x{} (bomb scan {:?}, fill scan {:?}, detection {:?})",
            config.grid_rows, config.grid_cols, config.bomb_scan, config.fill_scan, config.detection_gate
        );

        Self {
            grid,
            presence,
            scheduler,
            effects,
            detector: PatternDetector::new(config.bomb_scan, config.fill_scan),
            gate: config.detection_gate,
            clear_trigger: config.clear_trigger,
            skip_malformed: config.skip_malformed,
            tick: config.broadcast_tick,
            outbound_queue: config.outbound_queue_depth(),
            metrics,
        }
    }

    /// Register a client and queue its snapshot frame.
    ///
    /// The returned receiver carries every frame meant for this client; it
    /// closes once the client is removed from presence.
    pub fn connect(&self, identity: String) -> (ClientId, Cursor, mpsc::Receiver<EncodedFrame>) {
        let (tx, rx) = mpsc::channel(self.outbound_queue);
        let (id, cursor) = self.presence.join(identity, tx.clone());
        self.metrics.connections_total.fetch_add(1, Ordering::Relaxed);

        let (cursors, count) = self.presence.view();
        match encode(&CanvasMessage::snapshot(self.grid.read(), &cursor, cursors, count)) {
            Ok(frame) => {
                if let Err(e) = tx.try_send(frame) {
                    warn!("Could not queue snapshot for {}: {}", id, e);
                }
            }
            Err(e) => warn!("Failed to encode snapshot: {}", e),
        }
        drop(tx);

        self.presence.announce_count();
        (id, cursor, rx)
    }

    /// Apply one client edit.
    ///
    /// The client's grid replaces the shared one wholesale and its cursor
    /// moves to `(x, y)`; the color stays whatever was assigned at join.
    /// Returns the trigger handed to the effect worker, if any.
    pub fn apply_edit(&self, id: ClientId, edit: Edit) -> Result<Option<Detection>, SessionError> {
        let (rows, cols) = self.grid.dimensions();
        let rejected = if edit.x >= rows || edit.y >= cols {
            Some(BoundsError::Cell {
                x: edit.x,
                y: edit.y,
                rows,
                cols,
            })
        } else if !edit.grid.has_shape(rows, cols) {
            Some(BoundsError::Shape { rows, cols })
        } else {
            None
        };
        if let Some(e) = rejected {
            self.metrics.edits_rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }

        let cursor = self
            .presence
            .move_cursor(id, edit.x, edit.y)
            .ok_or_else(|| SessionError::Disconnected(format!("client {} is no longer present", id)))?;
        self.grid.replace_all(edit.grid.clone())?;

        let detection = if self
            .gate
            .should_scan(edit.grid.get(edit.x, edit.y), edit.check_sequences)
        {
            self.detector.detect(&edit.grid, edit.x, edit.y)
        } else {
            None
        };

        if let Some(found) = &detection {
            debug!("{} found on {:?} at {:?}", found.trigger, found.line, found.span);
            if self.clear_trigger {
                self.grid.clear_span(found.line, found.span.clone())?;
            }
        }

        self.scheduler.submit(CanvasMessage::edit(self.grid.read(), &cursor));

        Ok(detection.filter(|found| self.effects.trigger(found.clone())))
    }

    /// Remove a client; the remaining clients are told the new count
    pub fn disconnect(&self, id: ClientId) {
        if self.presence.leave(id).is_some() {
            self.presence.announce_count();
        }
    }

    /// Start the periodic broadcast task
    pub fn start_broadcast_loop(&self) -> JoinHandle<()> {
        start_broadcast_loop(self.scheduler.clone(), self.tick)
    }

    /// Push out the pending frame and wait for outbound queues to empty
    pub async fn drain(&self, grace: Duration) -> bool {
        self.scheduler.flush();
        self.presence.drain(grace).await
    }

    /// Current grid snapshot
    pub fn grid(&self) -> Arc<Grid> {
        self.grid.read()
    }

    pub fn client_count(&self) -> usize {
        self.presence.count()
    }

    pub fn cursor(&self, id: ClientId) -> Option<Cursor> {
        self.presence.cursor(id)
    }

    pub fn is_effect_pending(&self, trigger: Trigger) -> bool {
        self.effects.is_pending(trigger)
    }

    pub fn skip_malformed(&self) -> bool {
        self.skip_malformed
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}
