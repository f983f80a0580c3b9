//! Prometheus-compatible metrics endpoint
//!
//! Exposes canvas server metrics in Prometheus format.
//! Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{info, debug};

/// Metrics registry for the canvas server
#[derive(Debug)]
pub struct Metrics {
    // Connections
    pub connections_active: AtomicU64,
    pub connections_total: AtomicU64,
    pub connections_rejected: AtomicU64,

    // Inbound
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub decode_errors: AtomicU64,
    pub edits_rejected: AtomicU64,

    // Broadcast
    pub frames_broadcast: AtomicU64,
    pub frames_coalesced: AtomicU64,
    pub frames_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub send_failures: AtomicU64,

    // Broadcast fan-out timing (microseconds)
    pub broadcast_time_us: AtomicU64,
    pub broadcast_time_p95_us: AtomicU64,
    pub broadcast_time_max_us: AtomicU64,

    // Effects
    pub effects_started: AtomicU64,
    pub effects_completed: AtomicU64,
    pub effects_dropped: AtomicU64,

    // Server uptime
    start_time: Instant,

    // Rolling fan-out times for percentile calculation
    broadcast_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_active: AtomicU64::new(0),
            connections_total: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            edits_rejected: AtomicU64::new(0),
            frames_broadcast: AtomicU64::new(0),
            frames_coalesced: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            broadcast_time_us: AtomicU64::new(0),
            broadcast_time_p95_us: AtomicU64::new(0),
            broadcast_time_max_us: AtomicU64::new(0),
            effects_started: AtomicU64::new(0),
            effects_completed: AtomicU64::new(0),
            effects_dropped: AtomicU64::new(0),
            start_time: Instant::now(),
            broadcast_history: RwLock::new(VecDeque::with_capacity(1000)),
        }
    }

    /// Record how long one broadcast fan-out took and update percentiles
    pub fn record_broadcast_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.broadcast_time_us.store(us, Ordering::Relaxed);

        let mut history = self.broadcast_history.write();
        history.push_back(us);

        // Keep last 1000 samples
        while history.len() > 1000 {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            self.broadcast_time_p95_us.store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.broadcast_time_max_us.store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("canvas_connections_active", "Live WebSocket clients", "gauge",
            self.connections_active.load(Ordering::Relaxed));
        metric!("canvas_connections_total", "Clients accepted since start", "counter",
            self.connections_total.load(Ordering::Relaxed));
        metric!("canvas_connections_rejected_total", "Connections refused by the connection guard", "counter",
            self.connections_rejected.load(Ordering::Relaxed));

        metric!("canvas_messages_received_total", "Inbound messages", "counter",
            self.messages_received.load(Ordering::Relaxed));
        metric!("canvas_bytes_received_total", "Inbound bytes", "counter",
            self.bytes_received.load(Ordering::Relaxed));
        metric!("canvas_decode_errors_total", "Malformed inbound messages", "counter",
            self.decode_errors.load(Ordering::Relaxed));
        metric!("canvas_edits_rejected_total", "Edits outside the grid bounds", "counter",
            self.edits_rejected.load(Ordering::Relaxed));

        metric!("canvas_frames_broadcast_total", "Frames fanned out by the scheduler", "counter",
            self.frames_broadcast.load(Ordering::Relaxed));
        metric!("canvas_frames_sent_total", "Frames written to client sockets", "counter",
            self.frames_sent.load(Ordering::Relaxed));
        metric!("canvas_bytes_sent_total", "Bytes written to client sockets", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("canvas_send_failures_total", "Clients dropped during fan-out", "counter",
            self.send_failures.load(Ordering::Relaxed));
        metric!("canvas_broadcast_time_microseconds", "Last fan-out time", "gauge",
            self.broadcast_time_us.load(Ordering::Relaxed));
        metric!("canvas_broadcast_time_p95_microseconds", "95th percentile fan-out time", "gauge",
            self.broadcast_time_p95_us.load(Ordering::Relaxed));
        metric!("canvas_broadcast_time_max_microseconds", "Maximum fan-out time", "gauge",
            self.broadcast_time_max_us.load(Ordering::Relaxed));

        #[cfg(feature = "metrics_extended")]
        {
            metric!("canvas_frames_coalesced_total", "Pending frames overwritten before their tick", "counter",
                self.frames_coalesced.load(Ordering::Relaxed));
            metric!("canvas_effects_started_total", "Effects started", "counter",
                self.effects_started.load(Ordering::Relaxed));
            metric!("canvas_effects_completed_total", "Effects finished", "counter",
                self.effects_completed.load(Ordering::Relaxed));
            metric!("canvas_effects_dropped_total", "Triggers ignored while the same effect was pending", "counter",
                self.effects_dropped.load(Ordering::Relaxed));
        }

        metric!("canvas_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// Generate JSON format metrics (alternative for direct API access)
    pub fn to_json(&self) -> String {
        format!(r#"{{
  "connections": {{
    "active": {},
    "total": {},
    "rejected": {}
  }},
  "inbound": {{
    "messages": {},
    "bytes": {},
    "decode_errors": {},
    "edits_rejected": {}
  }},
  "broadcast": {{
    "frames": {},
    "coalesced": {},
    "sent": {},
    "bytes_sent": {},
    "send_failures": {},
    "time_us": {},
    "time_p95_us": {}
  }},
  "effects": {{
    "started": {},
    "completed": {},
    "dropped": {}
  }},
  "uptime_seconds": {}
}}"#,
            self.connections_active.load(Ordering::Relaxed),
            self.connections_total.load(Ordering::Relaxed),
            self.connections_rejected.load(Ordering::Relaxed),
            self.messages_received.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
            self.decode_errors.load(Ordering::Relaxed),
            self.edits_rejected.load(Ordering::Relaxed),
            self.frames_broadcast.load(Ordering::Relaxed),
            self.frames_coalesced.load(Ordering::Relaxed),
            self.frames_sent.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
            self.send_failures.load(Ordering::Relaxed),
            self.broadcast_time_us.load(Ordering::Relaxed),
            self.broadcast_time_p95_us.load(Ordering::Relaxed),
            self.effects_started.load(Ordering::Relaxed),
            self.effects_completed.load(Ordering::Relaxed),
            self.effects_dropped.load(Ordering::Relaxed),
            self.uptime_seconds(),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Status line, content type and body for a metrics request
fn route(request: &str, metrics: &Metrics) -> (&'static str, &'static str, String) {
    let path = request
        .strip_prefix("GET ")
        .and_then(|rest| rest.split_whitespace().next())
        .unwrap_or("");

    match path {
        "/metrics/json" => ("200 OK", "application/json", metrics.to_json()),
        "/metrics" => ("200 OK", "text/plain; version=0.0.4", metrics.to_prometheus()),
        "/health" => ("200 OK", "text/plain", "OK".to_string()),
        _ => ("404 Not Found", "text/plain", String::new()),
    }
}

/// Serve `/metrics`, `/metrics/json` and `/health` on `port`
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Metrics server listening on http://0.0.0.0:{}/metrics", port);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];
            let n = match socket.read(&mut buffer).await {
                Ok(0) => return,
                Ok(n) => n,
                Err(e) => {
                    debug!("Metrics read from {} failed: {}", peer, e);
                    return;
                }
            };

            let (status, content_type, body) = route(&String::from_utf8_lossy(&buffer[..n]), &metrics);
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                content_type,
                body.len(),
                body
            );

            if let Err(e) = socket.write_all(response.as_bytes()).await {
                debug!("Metrics write to {} failed: {}", peer, e);
            }
        });
    }
}
