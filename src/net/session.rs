//! Per-connection session loop
//!
//! A session owns one socket, split into a [`FrameSource`] and a [`FrameSink`].
//! The reader applies edits to the canvas; the writer forwards the frames the
//! broadcast scheduler queued for this client. Whichever half ends first ends
//! the session.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::canvas::grid::BoundsError;
use crate::metrics::Metrics;
use crate::net::canvas_session::CanvasSession;
use crate::net::dos_protection::DoSError;
use crate::net::presence::ClientId;
use crate::net::protocol::{CanvasMessage, DecodeError, EncodedFrame};

/// Why a message was refused or a session ended
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Bounds(#[from] BoundsError),
    #[error("Disconnected: {0}")]
    Disconnected(String),
    #[error("Throttled: {0}")]
    Throttled(DoSError),
    #[error("Rejected: {0}")]
    Rejected(DoSError),
}

impl SessionError {
    /// Whether the session drops the offending message and keeps reading
    pub fn is_recoverable(&self, skip_malformed: bool) -> bool {
        match self {
            SessionError::Decode(_) | SessionError::Bounds(_) => skip_malformed,
            SessionError::Throttled(_) => true,
            SessionError::Disconnected(_) | SessionError::Rejected(_) => false,
        }
    }
}

impl From<DoSError> for SessionError {
    fn from(err: DoSError) -> Self {
        if err.is_recoverable() {
            SessionError::Throttled(err)
        } else {
            SessionError::Rejected(err)
        }
    }
}

/// Outbound half of a client socket
pub trait FrameSink: Send {
    fn send(&mut self, frame: EncodedFrame) -> impl Future<Output = Result<(), SessionError>> + Send;
}

/// Inbound half of a client socket.
///
/// Yields decoded messages; protocol noise such as pings is handled below
/// this layer.
pub trait FrameSource: Send {
    fn receive(&mut self) -> impl Future<Output = Result<CanvasMessage, SessionError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// Lifecycle record of one connection
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub identity: String,
    pub client_id: Option<ClientId>,
    pub state: SessionState,
    pub connected_at: Instant,
    pub edits_applied: u64,
}

impl ClientSession {
    pub fn new(identity: String) -> Self {
        Self {
            identity,
            client_id: None,
            state: SessionState::Connecting,
            connected_at: Instant::now(),
            edits_applied: 0,
        }
    }

    pub fn activate(&mut self, id: ClientId) {
        self.client_id = Some(id);
        self.state = SessionState::Active;
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Serve one client until either socket half fails.
///
/// Returns the closed session record and the reason it ended.
pub async fn run<Tx, Rx>(
    canvas: Arc<CanvasSession>,
    identity: String,
    mut sink: Tx,
    mut source: Rx,
) -> (ClientSession, SessionError)
where
    Tx: FrameSink,
    Rx: FrameSource,
{
    let mut session = ClientSession::new(identity);
    let (id, cursor, mut outbound) = canvas.connect(session.identity.clone());
    session.activate(id);
    debug!("Session {} active as {}", session.identity, cursor.color);

    let reason = tokio::select! {
        reason = read_loop(&canvas, &mut session, &mut source) => reason,
        reason = write_loop(canvas.metrics(), &mut outbound, &mut sink) => reason,
    };

    canvas.disconnect(id);
    session.close();
    info!(
        "Session {} closed after {:.1}s, {} edits: {}",
        session.identity,
        session.age().as_secs_f64(),
        session.edits_applied,
        reason
    );

    (session, reason)
}

async fn read_loop<Rx: FrameSource>(
    canvas: &CanvasSession,
    session: &mut ClientSession,
    source: &mut Rx,
) -> SessionError {
    let Some(id) = session.client_id else {
        return SessionError::Disconnected("session was never activated".to_string());
    };
    let metrics = canvas.metrics();

    loop {
        let result = match source.receive().await {
            Ok(message) => {
                metrics.messages_received.fetch_add(1, Ordering::Relaxed);
                message
                    .into_edit()
                    .map_err(SessionError::from)
                    .and_then(|edit| canvas.apply_edit(id, edit))
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(detection) => {
                session.edits_applied += 1;
                if let Some(found) = detection {
                    info!("{} triggered {}", session.identity, found.trigger);
                }
            }
            Err(e) => {
                if matches!(e, SessionError::Decode(_)) {
                    metrics.decode_errors.fetch_add(1, Ordering::Relaxed);
                }
                if !e.is_recoverable(canvas.skip_malformed()) {
                    return e;
                }
                warn!("Skipping message from {}: {}", session.identity, e);
            }
        }
    }
}

async fn write_loop<Tx: FrameSink>(
    metrics: &Metrics,
    outbound: &mut mpsc::Receiver<EncodedFrame>,
    sink: &mut Tx,
) -> SessionError {
    while let Some(frame) = outbound.recv().await {
        let len = frame.len() as u64;
        if let Err(e) = sink.send(frame).await {
            return e;
        }
        metrics.frames_sent.fetch_add(1, Ordering::Relaxed);
        metrics.bytes_sent.fetch_add(len, Ordering::Relaxed);
    }
    SessionError::Disconnected("removed from the canvas".to_string())
}
