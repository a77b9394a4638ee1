use chrono::{DateTime, TimeZone, Utc};

/// Wall-clock source. "Not established yet" is a normal answer, not an error.
pub trait Clock: Send {
    fn now(&self) -> Option<DateTime<Utc>>;
}

/// System time, trusted once it is past the build-era floor.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Option<DateTime<Utc>> {
        established(Utc::now())
    }
}

/// No time source at all; timestamps stay unset.
pub struct UnsetClock;

impl Clock for UnsetClock {
    fn now(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// A clock without an RTC boots at the epoch; anything before 2020 is treated
/// as not yet synchronized.
fn established(now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let floor = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single()?;
    (now >= floor).then_some(now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_is_not_established() {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        assert!(established(epoch).is_none());
    }

    #[test]
    fn test_system_clock_is_established() {
        assert!(SystemClock.now().is_some());
        assert!(UnsetClock.now().is_none());
    }
}
