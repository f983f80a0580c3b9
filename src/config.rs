use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

use crate::canvas::constants::{broadcast, detection, effects, grid};
use crate::canvas::effects::EffectTiming;
use crate::canvas::pattern::{DetectionGate, ScanStrategy};
use crate::net::dos_protection::DoSConfig;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Grid rows, fixed for the process lifetime
    pub grid_rows: usize,
    /// Grid columns, fixed for the process lifetime
    pub grid_cols: usize,
    /// Broadcast tick
    pub broadcast_tick: Duration,
    /// Delay between effect animation steps
    pub effect_step: Duration,
    /// Rows regenerated per fill frame
    pub fill_chunk_rows: usize,
    /// Half-width of windowed scans
    pub scan_radius: usize,
    /// Scan used for the bomb trigger
    pub bomb_scan: ScanStrategy,
    /// Scan used for the fill trigger
    pub fill_scan: ScanStrategy,
    /// Which edits are scanned
    pub detection_gate: DetectionGate,
    /// Skip malformed messages instead of disconnecting
    pub skip_malformed: bool,
    /// Blank the matched trigger literal when it fires
    pub clear_trigger: bool,
    /// Port of the metrics endpoint
    pub metrics_port: u16,
    /// How long shutdown waits for outbound queues to drain
    pub shutdown_grace: Duration,
    /// Maximum total concurrent connections
    pub max_connections: usize,
    /// Maximum connections per IP address
    pub max_connections_per_ip: usize,
    /// Maximum messages per second per connection
    pub max_messages_per_second: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 8080,
            grid_rows: grid::DEFAULT_ROWS,
            grid_cols: grid::DEFAULT_COLS,
            broadcast_tick: Duration::from_millis(broadcast::TICK_MS),
            effect_step: Duration::from_millis(effects::STEP_MS),
            fill_chunk_rows: default_chunk(grid::DEFAULT_ROWS),
            scan_radius: detection::SCAN_RADIUS,
            bomb_scan: ScanStrategy::Windowed {
                radius: detection::SCAN_RADIUS,
            },
            fill_scan: ScanStrategy::Full,
            detection_gate: DetectionGate::Always,
            skip_malformed: true,
            clear_trigger: false,
            metrics_port: 9090,
            shutdown_grace: Duration::from_secs(5),
            max_connections: 1000,
            max_connections_per_ip: 16,
            max_messages_per_second: 120,
        }
    }
}

fn default_chunk(rows: usize) -> usize {
    (rows / 10).max(1)
}

/// Read and parse an environment variable, warning on bad values
fn env_value<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!("Invalid {} '{}', using default", name, raw);
            None
        }
    }
}

fn parse_scan(raw: &str, radius: usize) -> Option<ScanStrategy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "full" => Some(ScanStrategy::Full),
        "windowed" | "window" => Some(ScanStrategy::Windowed { radius }),
        _ => None,
    }
}

fn parse_gate(raw: &str) -> Option<DetectionGate> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "always" => Some(DetectionGate::Always),
        "trigger_char" | "hash" => Some(DetectionGate::TriggerChar),
        _ => None,
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Some(addr) = env_value("BIND_ADDRESS") {
            config.bind_address = addr;
        }

        if let Some(port) = env_value::<u16>("PORT") {
            if port > 0 {
                config.port = port;
            } else {
                tracing::warn!("PORT must be > 0, using default");
            }
        }

        if let Some(rows) = env_value::<usize>("GRID_ROWS") {
            if (1..=grid::MAX_DIMENSION).contains(&rows) {
                config.grid_rows = rows;
                config.fill_chunk_rows = default_chunk(rows);
            } else {
                tracing::warn!("GRID_ROWS must be 1-{}, using default", grid::MAX_DIMENSION);
            }
        }

        if let Some(cols) = env_value::<usize>("GRID_COLS") {
            if (1..=grid::MAX_DIMENSION).contains(&cols) {
                config.grid_cols = cols;
            } else {
                tracing::warn!("GRID_COLS must be 1-{}, using default", grid::MAX_DIMENSION);
            }
        }

        if let Some(ms) = env_value::<u64>("BROADCAST_TICK_MS") {
            if ms > 0 {
                config.broadcast_tick = Duration::from_millis(ms);
            } else {
                tracing::warn!("BROADCAST_TICK_MS must be > 0, using default");
            }
        }

        if let Some(ms) = env_value::<u64>("EFFECT_STEP_MS") {
            config.effect_step = Duration::from_millis(ms);
        }

        if let Some(rows) = env_value::<usize>("FILL_CHUNK_ROWS") {
            if rows > 0 {
                config.fill_chunk_rows = rows;
            } else {
                tracing::warn!("FILL_CHUNK_ROWS must be > 0, using default");
            }
        }

        if let Some(radius) = env_value::<usize>("SCAN_RADIUS") {
            if radius > 0 {
                config.scan_radius = radius;
                config.bomb_scan = ScanStrategy::Windowed { radius };
            } else {
                tracing::warn!("SCAN_RADIUS must be > 0, using default");
            }
        }

        for (name, slot) in [("BOMB_SCAN", &mut config.bomb_scan), ("FILL_SCAN", &mut config.fill_scan)] {
            if let Ok(raw) = std::env::var(name) {
                match parse_scan(&raw, config.scan_radius) {
                    Some(strategy) => *slot = strategy,
                    None => tracing::warn!("Invalid {} '{}', expected full or windowed", name, raw),
                }
            }
        }

        if let Ok(raw) = std::env::var("DETECTION") {
            match parse_gate(&raw) {
                Some(gate) => config.detection_gate = gate,
                None => tracing::warn!("Invalid DETECTION '{}', expected always or trigger_char", raw),
            }
        }

        if let Some(skip) = env_flag("SKIP_MALFORMED") {
            config.skip_malformed = skip;
        }

        if let Some(clear) = env_flag("CLEAR_TRIGGER") {
            config.clear_trigger = clear;
        }

        if let Some(port) = env_value("METRICS_PORT") {
            config.metrics_port = port;
        }

        if let Some(secs) = env_value::<u64>("SHUTDOWN_GRACE_SECS") {
            config.shutdown_grace = Duration::from_secs(secs);
        }

        if let Some(max) = env_value::<usize>("MAX_CONNECTIONS") {
            if max > 0 && max <= 100_000 {
                config.max_connections = max;
            } else {
                tracing::warn!("MAX_CONNECTIONS must be 1-100000, using default");
            }
        }

        if let Some(max) = env_value("MAX_CONNECTIONS_PER_IP") {
            config.max_connections_per_ip = max;
        }

        if let Some(max) = env_value("MAX_MESSAGES_PER_SECOND") {
            config.max_messages_per_second = max;
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.grid_rows == 0 || self.grid_cols == 0 {
            return Err("Grid must have at least one row and one column".to_string());
        }
        if self.grid_rows > grid::MAX_DIMENSION || self.grid_cols > grid::MAX_DIMENSION {
            return Err(format!("Grid dimensions cannot exceed {}", grid::MAX_DIMENSION));
        }
        if self.broadcast_tick.is_zero() {
            return Err("broadcast_tick must be positive".to_string());
        }
        if self.fill_chunk_rows == 0 {
            return Err("fill_chunk_rows must be at least 1".to_string());
        }
        if self.max_connections_per_ip > self.max_connections {
            return Err("max_connections_per_ip cannot exceed max_connections".to_string());
        }
        if self.port == self.metrics_port {
            return Err("metrics_port must differ from port".to_string());
        }
        Ok(())
    }

    /// Largest inbound message accepted: a full grid of multi-byte cells plus envelope
    pub fn max_message_size(&self) -> usize {
        self.grid_rows * self.grid_cols * 16 + 4096
    }

    /// Frames one client may have queued, bounded by a byte budget on large grids
    pub fn outbound_queue_depth(&self) -> usize {
        (broadcast::OUTBOUND_BYTE_BUDGET / self.max_message_size())
            .clamp(broadcast::MIN_OUTBOUND_QUEUE, broadcast::OUTBOUND_QUEUE)
    }

    pub fn effect_timing(&self) -> EffectTiming {
        EffectTiming {
            step: self.effect_step,
            fill_chunk_rows: self.fill_chunk_rows,
        }
    }

    pub fn dos_config(&self) -> DoSConfig {
        DoSConfig {
            max_connections_total: self.max_connections,
            max_connections_per_ip: self.max_connections_per_ip,
            max_messages_per_second: self.max_messages_per_second,
            max_message_size: self.max_message_size(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!((config.grid_rows, config.grid_cols), (50, 50));
        assert_eq!(config.broadcast_tick, Duration::from_millis(16));
        assert_eq!(config.bomb_scan, ScanStrategy::Windowed { radius: 25 });
        assert_eq!(config.fill_scan, ScanStrategy::Full);
        assert_eq!(config.fill_chunk_rows, 5);
        assert!(config.skip_malformed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default() {
        let config = ServerConfig::load_or_default();
        assert!(config.port > 0);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ServerConfig {
            grid_rows: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            metrics_port: 8080,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ServerConfig {
            max_connections: 4,
            max_connections_per_ip: 8,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_scan("Full", 3), Some(ScanStrategy::Full));
        assert_eq!(parse_scan("windowed", 3), Some(ScanStrategy::Windowed { radius: 3 }));
        assert_eq!(parse_scan("diagonal", 3), None);
        assert_eq!(parse_gate("trigger_char"), Some(DetectionGate::TriggerChar));
        assert_eq!(parse_gate("never"), None);
    }

    #[test]
    fn test_message_size_scales_with_grid() {
        let small = ServerConfig::default();
        let large = ServerConfig {
            grid_rows: 1000,
            grid_cols: 1000,
            ..Default::default()
        };
        assert!(large.max_message_size() > small.max_message_size());
        assert_eq!(large.dos_config().max_message_size, large.max_message_size());
    }

    #[test]
    fn test_outbound_queue_shrinks_with_grid() {
        let small = ServerConfig::default();
        assert_eq!(small.outbound_queue_depth(), broadcast::OUTBOUND_QUEUE);

        let large = ServerConfig {
            grid_rows: 1000,
            grid_cols: 1000,
            ..Default::default()
        };
        assert_eq!(large.outbound_queue_depth(), broadcast::MIN_OUTBOUND_QUEUE);

        let medium = ServerConfig {
            grid_rows: 200,
            grid_cols: 200,
            ..Default::default()
        };
        let depth = medium.outbound_queue_depth();
        assert!(depth < broadcast::OUTBOUND_QUEUE);
        assert!(depth * medium.max_message_size() <= broadcast::OUTBOUND_BYTE_BUDGET);
    }
}
