//! Runtime clock backed by tokio's timer.

use tokio::time::Instant;

use crate::traits::Clock;

/// Clock reading [`tokio::time::Instant`].
///
/// Measures milliseconds since construction. Under a paused tokio runtime
/// (`#[tokio::test(start_paused = true)]`) it advances with virtual time,
/// so dwell periods can be tested without real waiting.
///
/// # Example
///
/// ```
/// use rs_autoplay::hal::TokioClock;
/// use rs_autoplay::traits::Clock;
///
/// let clock = TokioClock::new();
/// let start = clock.now_ms();
/// assert!(clock.now_ms() >= start);
/// ```
#[derive(Clone, Copy, Debug)]
pub struct TokioClock {
    epoch: Instant,
}

impl TokioClock {
    /// Creates a clock whose epoch is now.
    #[inline]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    #[inline]
    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn follows_paused_time() {
        let clock = TokioClock::new();
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.now_ms(), 1500);
    }
}
