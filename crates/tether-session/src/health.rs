//! Connection health monitor: a dead-man's switch over keepalive signals
//!
//! Background tabs get throttled timers, so a long gap seen while hidden says
//! nothing about the connection. The monitor only judges the gap while in the
//! foreground and restarts the clock when the tab comes back.

use std::time::Duration;
use tokio::time::Instant;

/// Whether the hosting page is visible
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Foreground,
    Background,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// How often the watchdog runs
    pub poll_interval: Duration,
    /// Silence longer than this marks the connection unhealthy
    pub unhealthy_after: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            unhealthy_after: Duration::from_secs(45),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    last_keepalive_at: Instant,
    visibility: Visibility,
    healthy: bool,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, now: Instant) -> Self {
        Self {
            config,
            last_keepalive_at: now,
            visibility: Visibility::Foreground,
            healthy: true,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Record a received event or keepalive. Returns true if this restored health.
    pub fn touch(&mut self, now: Instant) -> bool {
        self.last_keepalive_at = now;
        let restored = !self.healthy;
        self.healthy = true;
        restored
    }

    /// Update page visibility; returning to the foreground resets the clock.
    pub fn set_visibility(&mut self, visibility: Visibility, now: Instant) {
        if visibility == Visibility::Foreground && self.visibility == Visibility::Background {
            self.last_keepalive_at = now;
        }
        self.visibility = visibility;
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    /// Run one watchdog check. Returns true if this check flipped to unhealthy.
    pub fn check(&mut self, now: Instant) -> bool {
        if self.visibility == Visibility::Background || !self.healthy {
            return false;
        }
        let silence = now.saturating_duration_since(self.last_keepalive_at);
        if silence > self.config.unhealthy_after {
            tracing::warn!("No keepalive for {:?}; marking connection unhealthy", silence);
            self.healthy = false;
            return true;
        }
        false
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Start a fresh watch, e.g. for a new connection
    pub fn reset(&mut self, now: Instant) {
        self.last_keepalive_at = now;
        self.healthy = true;
    }
}
