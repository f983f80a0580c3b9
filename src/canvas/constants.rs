/// Grid dimensions
pub mod grid {
    /// Default number of rows
    pub const DEFAULT_ROWS: usize = 50;
    /// Default number of columns
    pub const DEFAULT_COLS: usize = 50;
    /// Largest accepted dimension (rows or cols)
    pub const MAX_DIMENSION: usize = 1000;
}

/// Broadcast timing
pub mod broadcast {
    /// Broadcast tick in milliseconds (~60 Hz)
    pub const TICK_MS: u64 = 16;
    /// Most frames that may queue up for one client before it is dropped as lagging
    pub const OUTBOUND_QUEUE: usize = 256;
    /// Fewest frames a client queue holds, however large the grid
    pub const MIN_OUTBOUND_QUEUE: usize = 4;
    /// Bytes of queued frames one client may hold before it is dropped
    pub const OUTBOUND_BYTE_BUDGET: usize = 32 * 1024 * 1024;
    /// Poll interval while draining outbound queues on shutdown
    pub const DRAIN_POLL_MS: u64 = 50;
}

/// Cursor colors handed out on join
pub mod colors {
    /// Color of the first live client
    pub const FIRST: &str = "red";
    /// Color of the second live client
    pub const SECOND: &str = "green";
    /// Pool for every later client
    pub const PALETTE: [&str; 6] = ["blue", "yellow", "purple", "orange", "pink", "brown"];
}

/// Trigger detection
pub mod detection {
    /// Literal that starts an explosion
    pub const BOMB_LITERAL: &str = "#bomb";
    /// Literal that starts a fill
    pub const FILL_LITERAL: &str = "#fill";
    /// Character every trigger literal starts with
    pub const TRIGGER_CHAR: char = '#';
    /// Half-width of the windowed scan, in cells
    pub const SCAN_RADIUS: usize = 25;
}

/// Effect animation
pub mod effects {
    /// Delay between animation steps in milliseconds
    pub const STEP_MS: u64 = 50;
    /// Tint sequence of the explosion, in order
    pub const EXPLOSION_TINTS: [&str; 5] = ["red", "green", "blue", "yellow", "pink"];
    /// Overlay color of fill frames
    pub const FILL_TEXT_COLOR: &str = "#2F4F4F";
    /// Full fill palette, densest first
    pub const FILL_PATTERNS: [&str; 4] = ["█", "▒", "░", " "];
    /// Ground band and dense-row palette
    pub const GROUND_PATTERNS: [&str; 2] = ["█", "▒"];
    /// Sky band palette
    pub const SKY_PATTERNS: [&str; 2] = ["░", " "];
    /// Chance that a middle row is drawn dense
    pub const DENSE_ROW_CHANCE: f64 = 0.3;
}
