//! Shared Canvas Server Library
//!
//! A real-time collaborative text canvas served over WebSocket.
//!
//! # Features
//!
//! - `dos_ratelimit` - Per-message rate limiting on top of the connection limits (enabled by default)
//! - `metrics_extended` - Coalescing and effect counters in the Prometheus output (enabled by default)

pub mod canvas;
pub mod config;
pub mod metrics;
pub mod net;
