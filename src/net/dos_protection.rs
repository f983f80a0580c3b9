//! Connection admission and inbound message throttling

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Limits applied to sockets before they reach the canvas
#[derive(Debug, Clone)]
pub struct DoSConfig {
    /// Maximum total concurrent connections
    pub max_connections_total: usize,
    /// Maximum connections per IP address
    pub max_connections_per_ip: usize,
    /// Maximum messages per window per connection
    pub max_messages_per_second: u32,
    /// Maximum inbound message size in bytes
    pub max_message_size: usize,
    /// Time window for rate limiting
    pub rate_limit_window: Duration,
    /// Rate violations before the connection is closed
    pub violations_before_close: u32,
    /// Apply the per-connection message window; size limits apply regardless
    pub rate_limited: bool,
}

impl Default for DoSConfig {
    fn default() -> Self {
        Self {
            max_connections_total: 1000,
            max_connections_per_ip: 16,
            max_messages_per_second: 120,
            max_message_size: 64 * 1024,
            rate_limit_window: Duration::from_secs(1),
            violations_before_close: 10,
            rate_limited: cfg!(feature = "dos_ratelimit"),
        }
    }
}

#[derive(Debug)]
struct MessageWindow {
    count: u32,
    started: Instant,
    violations: u32,
}

impl MessageWindow {
    fn new() -> Self {
        Self {
            count: 0,
            started: Instant::now(),
            violations: 0,
        }
    }

    fn admit(&mut self, max: u32, window: Duration) -> bool {
        let now = Instant::now();
        if now.duration_since(self.started) >= window {
            self.started = now;
            self.count = 0;
        }

        self.count += 1;
        if self.count > max {
            self.violations += 1;
            false
        } else {
            true
        }
    }
}

/// Per-IP connection counts and per-connection message windows
pub struct DoSProtection {
    config: DoSConfig,
    ip_connections: HashMap<IpAddr, usize>,
    windows: HashMap<u64, MessageWindow>,
    next_id: u64,
}

impl DoSProtection {
    pub fn new(config: DoSConfig) -> Self {
        Self {
            config,
            ip_connections: HashMap::new(),
            windows: HashMap::new(),
            next_id: 0,
        }
    }

    /// Check whether another connection from `ip` would be admitted
    pub fn check_connection(&self, ip: IpAddr) -> Result<(), DoSError> {
        if self.windows.len() >= self.config.max_connections_total {
            return Err(DoSError::TooManyConnections);
        }

        let from_ip = self.ip_connections.get(&ip).copied().unwrap_or(0);
        if from_ip >= self.config.max_connections_per_ip {
            return Err(DoSError::TooManyConnectionsFromIp(ip));
        }

        Ok(())
    }

    /// Admit a connection and return its guard key
    pub fn register_connection(&mut self, ip: IpAddr) -> Result<u64, DoSError> {
        self.check_connection(ip)?;

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        *self.ip_connections.entry(ip).or_insert(0) += 1;
        self.windows.insert(id, MessageWindow::new());
        Ok(id)
    }

    pub fn unregister_connection(&mut self, id: u64, ip: IpAddr) {
        if self.windows.remove(&id).is_none() {
            return;
        }

        if let Some(count) = self.ip_connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.ip_connections.remove(&ip);
            }
        }
    }

    /// Check one inbound message of `size` bytes
    pub fn check_message(&mut self, id: u64, size: usize) -> Result<(), DoSError> {
        if size > self.config.max_message_size {
            return Err(DoSError::MessageTooLarge(size));
        }
        if !self.config.rate_limited {
            return Ok(());
        }

        if let Some(window) = self.windows.get_mut(&id) {
            if window.violations >= self.config.violations_before_close {
                return Err(DoSError::ViolationLimitExceeded);
            }
            if !window.admit(self.config.max_messages_per_second, self.config.rate_limit_window) {
                return Err(DoSError::RateLimitExceeded);
            }
        }

        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.windows.len()
    }

    pub fn connections_from_ip(&self, ip: IpAddr) -> usize {
        self.ip_connections.get(&ip).copied().unwrap_or(0)
    }

    pub fn violation_count(&self, id: u64) -> u32 {
        self.windows.get(&id).map(|w| w.violations).unwrap_or(0)
    }
}

impl Default for DoSProtection {
    fn default() -> Self {
        Self::new(DoSConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DoSError {
    #[error("Too many total connections")]
    TooManyConnections,
    #[error("Too many connections from {0}")]
    TooManyConnectionsFromIp(IpAddr),
    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
    #[error("Rate limit exceeded")]
    RateLimitExceeded,
    #[error("Too many violations, connection terminated")]
    ViolationLimitExceeded,
}

impl DoSError {
    /// Whether the offending message can be dropped and the connection kept
    pub fn is_recoverable(&self) -> bool {
        matches!(self, DoSError::RateLimitExceeded)
    }
}
