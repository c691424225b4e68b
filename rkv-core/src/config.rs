use std::time::Duration;

/// Engine configuration for durability, compaction and queue behaviour
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the background flusher makes appended records durable
    pub flush_interval: Duration,

    /// Unflushed bytes that force a flush on the write path
    pub flush_threshold_bytes: u64,

    /// Start a log rewrite automatically when the thresholds below are met
    pub auto_compaction: bool,

    /// Share of superseded records (0.0 - 1.0) that triggers a rewrite
    pub rewrite_dead_ratio: f64,

    /// Minimum log size in bytes before a rewrite is considered
    pub rewrite_min_log_bytes: u64,

    /// Size of the buffered chunk a rewrite writes out at once
    pub rewrite_tail_flush_bytes: usize,

    /// How long the queue worker spins on empty queues before blocking
    pub queue_idle_window: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            flush_threshold_bytes: 64 * 1024,
            auto_compaction: true,
            rewrite_dead_ratio: 0.6,
            rewrite_min_log_bytes: 10_000_000,
            rewrite_tail_flush_bytes: 64 * 1024,
            queue_idle_window: Duration::from_millis(50),
        }
    }
}

impl EngineConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the background flush interval
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set the unflushed byte count that forces a flush
    pub fn with_flush_threshold_bytes(mut self, bytes: u64) -> Self {
        self.flush_threshold_bytes = bytes;
        self
    }

    /// Enable or disable automatic rewrites
    pub fn with_auto_compaction(mut self, enabled: bool) -> Self {
        self.auto_compaction = enabled;
        self
    }

    /// Set the dead record ratio that triggers a rewrite
    pub fn with_rewrite_dead_ratio(mut self, ratio: f64) -> Self {
        self.rewrite_dead_ratio = ratio;
        self
    }

    /// Set the minimum log size for automatic rewrites
    pub fn with_rewrite_min_log_bytes(mut self, bytes: u64) -> Self {
        self.rewrite_min_log_bytes = bytes;
        self
    }

    /// Set the rewrite chunk size
    pub fn with_rewrite_tail_flush_bytes(mut self, bytes: usize) -> Self {
        self.rewrite_tail_flush_bytes = bytes;
        self
    }

    /// Set how long the queue worker stays busy-waiting before it blocks
    pub fn with_queue_idle_window(mut self, window: Duration) -> Self {
        self.queue_idle_window = window;
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.flush_interval.is_zero() {
            return Err("flush_interval must be greater than 0".to_string());
        }

        if self.flush_threshold_bytes == 0 {
            return Err("flush_threshold_bytes must be greater than 0".to_string());
        }

        if !(0.0..=1.0).contains(&self.rewrite_dead_ratio) {
            return Err("rewrite_dead_ratio must be between 0.0 and 1.0".to_string());
        }

        if self.rewrite_tail_flush_bytes == 0 {
            return Err("rewrite_tail_flush_bytes must be greater than 0".to_string());
        }

        Ok(())
    }
}
