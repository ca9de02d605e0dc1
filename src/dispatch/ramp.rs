//! Stepwise speed ramps.

/// Iterator over the speed steps between two speeds.
///
/// Yields every intermediate speed and finally the target; the starting
/// speed itself is not yielded.
///
/// ```
/// use rs_autoplay::dispatch::SpeedRamp;
///
/// assert_eq!(SpeedRamp::new(0, 10, 4).collect::<Vec<_>>(), [4, 8, 10]);
/// assert_eq!(SpeedRamp::new(60, 10, 20).collect::<Vec<_>>(), [40, 20, 10]);
/// assert_eq!(SpeedRamp::new(10, 10, 4).count(), 0);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SpeedRamp {
    current: u8,
    target: u8,
    step: u8,
}

impl SpeedRamp {
    /// Ramp from `from` to `to` in increments of `step` (at least 1).
    pub fn new(from: u8, to: u8, step: u8) -> Self {
        Self {
            current: from,
            target: to,
            step: step.max(1),
        }
    }
}

impl Iterator for SpeedRamp {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.current == self.target {
            return None;
        }
        self.current = if self.current < self.target {
            self.current.saturating_add(self.step).min(self.target)
        } else {
            self.current.saturating_sub(self.step).max(self.target)
        };
        Some(self.current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let distance = usize::from(self.current.abs_diff(self.target));
        let n = distance.div_ceil(usize::from(self.step));
        (n, Some(n))
    }
}

impl ExactSizeIterator for SpeedRamp {}
