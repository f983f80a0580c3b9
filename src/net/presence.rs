//! Presence tracking: who is connected, where their cursor is, and how to reach them

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::canvas::constants::{broadcast, colors};
use crate::metrics::Metrics;
use crate::net::protocol::{encode, CanvasMessage, Cursor, EncodedFrame};

/// Internal key of a connected client
pub type ClientId = Uuid;

/// Outcome of queueing one frame for every live client
#[derive(Debug, Default)]
pub struct Delivery {
    /// Clients that took the frame
    pub sent: usize,
    /// Clients that could not (gone, or too far behind)
    pub failed: Vec<ClientId>,
}

struct ClientEntry {
    /// Remote endpoint, the key clients see in the cursor mapping
    identity: String,
    cursor: Cursor,
    outbound: mpsc::Sender<EncodedFrame>,
}

/// Live clients and their cursors.
///
/// Every read and write of the mapping goes through one lock, so a cursor
/// mapping handed out is always a consistent snapshot.
pub struct Presence {
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
    metrics: Arc<Metrics>,
}

impl Presence {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    /// Register a client and assign its color.
    ///
    /// The first live client is red, the second green, later ones get a random
    /// palette color. Counting and inserting happen under the same lock.
    pub fn join(&self, identity: String, outbound: mpsc::Sender<EncodedFrame>) -> (ClientId, Cursor) {
        let id = Uuid::new_v4();
        let mut clients = self.clients.write();

        let color = match clients.len() + 1 {
            1 => colors::FIRST,
            2 => colors::SECOND,
            _ => colors::PALETTE[rand::thread_rng().gen_range(0..colors::PALETTE.len())],
        };
        let cursor = Cursor::at_origin(color);

        info!("Client {} joined as {} ({})", identity, color, id);
        clients.insert(
            id,
            ClientEntry {
                identity,
                cursor: cursor.clone(),
                outbound,
            },
        );
        self.metrics.connections_active.store(clients.len() as u64, Ordering::Relaxed);

        (id, cursor)
    }

    /// Move a client's cursor; its color is kept
    pub fn move_cursor(&self, id: ClientId, x: usize, y: usize) -> Option<Cursor> {
        let mut clients = self.clients.write();
        let entry = clients.get_mut(&id)?;
        entry.cursor.x = x;
        entry.cursor.y = y;
        Some(entry.cursor.clone())
    }

    /// Remove a client. Returns `None` if it was already gone.
    pub fn leave(&self, id: ClientId) -> Option<Cursor> {
        let mut clients = self.clients.write();
        let entry = clients.remove(&id)?;
        self.metrics.connections_active.store(clients.len() as u64, Ordering::Relaxed);
        info!("Client {} left ({} remaining)", entry.identity, clients.len());
        Some(entry.cursor)
    }

    pub fn count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn cursor(&self, id: ClientId) -> Option<Cursor> {
        self.clients.read().get(&id).map(|entry| entry.cursor.clone())
    }

    /// Remote endpoint -> cursor for every live client
    pub fn cursor_map(&self) -> HashMap<String, Cursor> {
        self.view().0
    }

    /// Cursor mapping and count taken under one lock
    pub fn view(&self) -> (HashMap<String, Cursor>, usize) {
        let clients = self.clients.read();
        let cursors = clients
            .values()
            .map(|entry| (entry.identity.clone(), entry.cursor.clone()))
            .collect();
        (cursors, clients.len())
    }

    /// Queue a frame for every live client. Never stops early.
    pub fn deliver(&self, frame: &EncodedFrame) -> Delivery {
        let clients = self.clients.read();
        let mut delivery = Delivery::default();

        for (id, entry) in clients.iter() {
            match entry.outbound.try_send(frame.clone()) {
                Ok(()) => delivery.sent += 1,
                Err(TrySendError::Closed(_)) => {
                    debug!("Client {} is gone, dropping", entry.identity);
                    delivery.failed.push(*id);
                }
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Client {} is {} frames behind, dropping",
                        entry.identity,
                        entry.outbound.max_capacity()
                    );
                    delivery.failed.push(*id);
                }
            }
        }

        if !delivery.failed.is_empty() {
            self.metrics
                .send_failures
                .fetch_add(delivery.failed.len() as u64, Ordering::Relaxed);
        }
        delivery
    }

    /// Remove clients whose delivery failed. Returns how many were still present.
    pub fn drop_clients(&self, ids: &[ClientId]) -> usize {
        ids.iter().filter(|id| self.leave(**id).is_some()).count()
    }

    /// Send a count-only frame to everyone.
    ///
    /// Clients that fail are removed and the new count is announced again,
    /// until a round goes through cleanly.
    pub fn announce_count(&self) {
        loop {
            let frame = match encode(&CanvasMessage::client_count(self.count())) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to encode client count: {}", e);
                    return;
                }
            };

            let failed = self.deliver(&frame).failed;
            if failed.is_empty() || self.drop_clients(&failed) == 0 {
                return;
            }
        }
    }

    /// Wait until every outbound queue is empty, at most `grace`
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let pending: usize = {
                let clients = self.clients.read();
                clients
                    .values()
                    .filter(|entry| !entry.outbound.is_closed())
                    .map(|entry| entry.outbound.max_capacity() - entry.outbound.capacity())
                    .sum()
            };
            if pending == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                warn!("Shutdown grace period over with {} frames undelivered", pending);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(broadcast::DRAIN_POLL_MS)).await;
        }
    }
}
