//! WebSocket server
//!
//! Accepts TCP connections, upgrades them to WebSocket and hands each one to
//! a session loop on the shared canvas.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use crate::config::ServerConfig;
use crate::metrics::Metrics;
use crate::net::canvas_session::CanvasSession;
use crate::net::dos_protection::DoSProtection;
use crate::net::protocol::{decode, CanvasMessage, DecodeError, EncodedFrame};
use crate::net::session::{self, FrameSink, FrameSource, SessionError};

type Socket = WebSocketStream<TcpStream>;

/// WebSocket front end of a canvas
pub struct WebSocketServer {
    config: ServerConfig,
    canvas: Arc<CanvasSession>,
    dos_protection: Arc<Mutex<DoSProtection>>,
    metrics: Arc<Metrics>,
}

impl WebSocketServer {
    pub fn new(config: ServerConfig, canvas: Arc<CanvasSession>, metrics: Arc<Metrics>) -> Self {
        let dos_protection = Arc::new(Mutex::new(DoSProtection::new(config.dos_config())));
        Self {
            config,
            canvas,
            dos_protection,
            metrics,
        }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.config.bind_address, self.config.port)
    }

    /// Bind the configured address and serve until the task is dropped
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr()).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        tracing::info!("WebSocket server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            };

            let canvas = self.canvas.clone();
            let dos = self.dos_protection.clone();
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, canvas, dos, metrics).await {
                    tracing::warn!("Connection {} error: {}", addr, e);
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    canvas: Arc<CanvasSession>,
    dos_protection: Arc<Mutex<DoSProtection>>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    let guard_id = {
        let mut dos = dos_protection.lock();
        match dos.register_connection(addr.ip()) {
            Ok(id) => id,
            Err(e) => {
                metrics.connections_rejected.fetch_add(1, Ordering::Relaxed);
                return Err(anyhow::anyhow!("Connection rejected: {}", e));
            }
        }
    };

    let served = serve_socket(stream, addr, canvas, guard_id, dos_protection.clone(), metrics).await;
    dos_protection.lock().unregister_connection(guard_id, addr.ip());
    served
}

async fn serve_socket(
    stream: TcpStream,
    addr: SocketAddr,
    canvas: Arc<CanvasSession>,
    guard_id: u64,
    dos_protection: Arc<Mutex<DoSProtection>>,
    metrics: Arc<Metrics>,
) -> anyhow::Result<()> {
    let socket = accept_async(stream).await?;
    tracing::debug!("WebSocket handshake completed with {}", addr);

    let (sink, stream) = socket.split();
    let source = WsSource {
        stream,
        guard_id,
        dos_protection,
        metrics,
    };

    session::run(canvas, addr.to_string(), WsSink(sink), source).await;
    Ok(())
}

/// Writes frames as WebSocket text messages
struct WsSink(SplitSink<Socket, Message>);

impl FrameSink for WsSink {
    async fn send(&mut self, frame: EncodedFrame) -> Result<(), SessionError> {
        self.0
            .send(Message::Text(frame.into_inner()))
            .await
            .map_err(|e| SessionError::Disconnected(e.to_string()))
    }
}

/// Reads WebSocket messages and decodes the text ones.
///
/// Pings are answered by tungstenite itself while the stream is read.
struct WsSource {
    stream: SplitStream<Socket>,
    guard_id: u64,
    dos_protection: Arc<Mutex<DoSProtection>>,
    metrics: Arc<Metrics>,
}

impl WsSource {
    fn admit(&self, size: usize) -> Result<(), SessionError> {
        self.metrics.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
        self.dos_protection.lock().check_message(self.guard_id, size)?;
        Ok(())
    }
}

impl FrameSource for WsSource {
    async fn receive(&mut self) -> Result<CanvasMessage, SessionError> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(SessionError::Disconnected(e.to_string())),
                None => return Err(SessionError::Disconnected("stream ended".to_string())),
            };

            match message {
                Message::Text(text) => {
                    self.admit(text.len())?;
                    return Ok(decode(text.as_str())?);
                }
                Message::Binary(data) => {
                    self.admit(data.len())?;
                    return Err(DecodeError::NotText.into());
                }
                Message::Close(frame) => {
                    let reason = frame
                        .map(|f| format!("closed by peer ({})", f.code))
                        .unwrap_or_else(|| "closed by peer".to_string());
                    return Err(SessionError::Disconnected(reason));
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }
}
