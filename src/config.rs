//! Auto-mode configuration.
//!
//! Plain builder-style structs with sensible defaults. Everything the
//! dispatcher and its trips need comes in through these values; the crate
//! never reads files or the environment itself.
//!
//! # Example
//!
//! ```rust
//! use rs_autoplay::config::{AutoModeConfig, TripConfig};
//!
//! // Use defaults
//! let config = AutoModeConfig::default();
//! assert_eq!(config.poll_interval_ms, 2500);
//!
//! // Or customize
//! let config = AutoModeConfig::default()
//!     .with_poll_interval_ms(500)
//!     .with_dwell_seconds(3)
//!     .with_trip(TripConfig::default().with_cruise_speed(80));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::traits::MAX_SPEED_STEP;

// ============================================================================
// Auto Mode Config
// ============================================================================

/// Dispatcher configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoModeConfig {
    /// Time between dispatcher ticks
    pub poll_interval_ms: u64,
    /// Default dwell after arrival (a block may set its own)
    pub dwell_seconds: u64,
    /// Upper bound on waiting for trips when stopping
    pub stop_timeout_ms: u64,
    /// Poll interval while waiting for trips when stopping
    pub stop_poll_ms: u64,
    /// Seed for the route tie-break; `None` seeds from entropy
    pub rng_seed: Option<u64>,
    /// Per-trip settings
    pub trip: TripConfig,
}

impl Default for AutoModeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2500,
            dwell_seconds: 10,
            stop_timeout_ms: 30_000,
            stop_poll_ms: 250,
            rng_seed: None,
            trip: TripConfig::default(),
        }
    }
}

impl AutoModeConfig {
    /// Set tick interval
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms.max(1);
        self
    }

    /// Set default dwell
    pub fn with_dwell_seconds(mut self, seconds: u64) -> Self {
        self.dwell_seconds = seconds;
        self
    }

    /// Set stop timeout
    pub fn with_stop_timeout_ms(mut self, ms: u64) -> Self {
        self.stop_timeout_ms = ms;
        self
    }

    /// Set stop poll interval
    pub fn with_stop_poll_ms(mut self, ms: u64) -> Self {
        self.stop_poll_ms = ms.max(1);
        self
    }

    /// Fix the random tie-break seed
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Set trip configuration
    pub fn with_trip(mut self, trip: TripConfig) -> Self {
        self.trip = trip;
        self
    }

    /// Tick interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Stop timeout as a duration
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Stop poll interval as a duration
    pub fn stop_poll(&self) -> Duration {
        Duration::from_millis(self.stop_poll_ms)
    }
}

// ============================================================================
// Trip Config
// ============================================================================

/// Speed ramp and sensor polling for one trip
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TripConfig {
    /// Speed step to accelerate to
    pub cruise_speed: u8,
    /// Speed step held after decelerating, until the in sensor fires
    pub creep_speed: u8,
    /// Speed steps per ramp tick
    pub speed_step: u8,
    /// Time between ramp ticks
    pub ramp_interval_ms: u64,
    /// Time between sensor reads
    pub sensor_poll_ms: u64,
}

impl Default for TripConfig {
    fn default() -> Self {
        Self {
            cruise_speed: 60,
            creep_speed: 10,
            speed_step: 4,
            ramp_interval_ms: 150,
            sensor_poll_ms: 100,
        }
    }
}

impl TripConfig {
    /// Set cruise speed (clamped to the valid step range)
    pub fn with_cruise_speed(mut self, speed: u8) -> Self {
        self.cruise_speed = speed.clamp(1, MAX_SPEED_STEP);
        self
    }

    /// Set creep speed (never 0)
    pub fn with_creep_speed(mut self, speed: u8) -> Self {
        self.creep_speed = speed.clamp(1, MAX_SPEED_STEP);
        self
    }

    /// Set ramp increment
    pub fn with_speed_step(mut self, step: u8) -> Self {
        self.speed_step = step.max(1);
        self
    }

    /// Set ramp tick interval
    pub fn with_ramp_interval_ms(mut self, ms: u64) -> Self {
        self.ramp_interval_ms = ms.max(1);
        self
    }

    /// Set sensor poll interval
    pub fn with_sensor_poll_ms(mut self, ms: u64) -> Self {
        self.sensor_poll_ms = ms.max(1);
        self
    }

    /// Cruise speed for a locomotive limited to `max_speed`
    ///
    /// Never below the creep speed.
    ///
    /// ```
    /// use rs_autoplay::config::TripConfig;
    ///
    /// let trip = TripConfig::default();
    /// assert_eq!(trip.cruise_for(None), 60);
    /// assert_eq!(trip.cruise_for(Some(30)), 30);
    /// assert_eq!(trip.cruise_for(Some(2)), 10);
    /// ```
    pub fn cruise_for(&self, max_speed: Option<u8>) -> u8 {
        let cruise = max_speed.map_or(self.cruise_speed, |m| m.min(self.cruise_speed));
        cruise.max(self.creep_speed).min(MAX_SPEED_STEP)
    }

    /// Ramp tick interval as a duration
    pub fn ramp_interval(&self) -> Duration {
        Duration::from_millis(self.ramp_interval_ms)
    }

    /// Sensor poll interval as a duration
    pub fn sensor_poll(&self) -> Duration {
        Duration::from_millis(self.sensor_poll_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = AutoModeConfig::default();
        assert_eq!(config.dwell_seconds, 10);
        assert_eq!(config.stop_timeout(), Duration::from_secs(30));
        assert_eq!(config.trip.creep_speed, 10);
        assert!(config.rng_seed.is_none());
    }

    #[test]
    fn builders_clamp() {
        let trip = TripConfig::default()
            .with_creep_speed(0)
            .with_cruise_speed(200)
            .with_speed_step(0);
        assert_eq!(trip.creep_speed, 1);
        assert_eq!(trip.cruise_speed, MAX_SPEED_STEP);
        assert_eq!(trip.speed_step, 1);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: AutoModeConfig =
            serde_json::from_str(r#"{"poll_interval_ms": 100, "trip": {"cruise_speed": 40}}"#).unwrap();
        assert_eq!(config.poll_interval_ms, 100);
        assert_eq!(config.dwell_seconds, 10);
        assert_eq!(config.trip.cruise_speed, 40);
        assert_eq!(config.trip.speed_step, 4);
    }
}
