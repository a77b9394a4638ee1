use std::time::Duration;

/// Adaptive scan window: shorter when the staging pool overflows, longer
/// when it was mostly idle, always within `[min, max]`.
#[derive(Debug, Clone)]
pub struct ScanTuner {
    current: Duration,
    min: Duration,
    max: Duration,
    step: Duration,
}

impl ScanTuner {
    pub fn new(initial: Duration, min: Duration, max: Duration, step: Duration) -> Self {
        Self {
            current: initial.clamp(min, max),
            min,
            max,
            step,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Feed back one scan's staging pressure and return the next window.
    pub fn adjust(&mut self, staged: usize, overflowed: u64, capacity: usize) -> Duration {
        let previous = self.current;
        if overflowed > 0 {
            self.current = self.current.saturating_sub(self.step).max(self.min);
        } else if staged * 2 < capacity {
            self.current = (self.current + self.step).min(self.max);
        }
        if self.current != previous {
            tracing::debug!(
                "Scan window {}s -> {}s (staged {}/{}, overflowed {})",
                previous.as_secs(),
                self.current.as_secs(),
                staged,
                capacity,
                overflowed
            );
        }
        self.current
    }
}
