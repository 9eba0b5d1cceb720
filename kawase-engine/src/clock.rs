//! Wall-time abstraction for real and simulated runs.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc, Weekday};
use chrono::Datelike;
use chrono::Timelike;

/// Source of "now" for the decision pipeline.
///
/// In simulated mode time is driven by the highest tick timestamp consumed so
/// far, which keeps replays deterministic and independent of the host clock.
#[derive(Clone, Debug)]
pub enum EngineClock {
    System,
    Simulated(DateTime<Utc>),
}

impl EngineClock {
    /// Simulated clock starting at the given instant.
    #[must_use]
    pub fn simulated_at(start: DateTime<Utc>) -> Self {
        Self::Simulated(start)
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Self::System => Utc::now(),
            Self::Simulated(now) => *now,
        }
    }

    /// Feed an observed event timestamp; simulated time never runs backwards.
    pub fn observe(&mut self, at: DateTime<Utc>) {
        if let Self::Simulated(now) = self {
            if at > *now {
                *now = at;
            }
        }
    }
}

/// Broker-local calendar coordinates for an instant.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BrokerTime {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub weekday: Weekday,
}

/// Project a UTC instant into the broker's fixed-offset wall clock.
#[must_use]
pub fn broker_time(at: DateTime<Utc>, offset: FixedOffset) -> BrokerTime {
    let local = at.with_timezone(&offset);
    BrokerTime {
        date: local.date_naive(),
        time: local.time(),
        weekday: local.weekday(),
    }
}

/// Whether a broker-local instant falls inside the weekend halt.
///
/// The window runs from `start` (e.g. FRI 23:00) through `end`
/// (e.g. MON 07:00), wrapping over the week boundary.
#[must_use]
pub fn in_weekend(
    at: BrokerTime,
    start: (Weekday, NaiveTime),
    end: (Weekday, NaiveTime),
) -> bool {
    let minutes = |weekday: Weekday, time: NaiveTime| -> u32 {
        weekday.num_days_from_monday() * 24 * 60 + time.hour() * 60 + time.minute()
    };
    let point = minutes(at.weekday, at.time);
    let begin = minutes(start.0, start.1);
    let finish = minutes(end.0, end.1);
    if begin <= finish {
        begin <= point && point < finish
    } else {
        point >= begin || point < finish
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn offset() -> FixedOffset {
        FixedOffset::east_opt(2 * 3600).unwrap()
    }

    fn weekend() -> ((Weekday, NaiveTime), (Weekday, NaiveTime)) {
        (
            (Weekday::Fri, NaiveTime::from_hms_opt(23, 0, 0).unwrap()),
            (Weekday::Mon, NaiveTime::from_hms_opt(7, 0, 0).unwrap()),
        )
    }

    #[test]
    fn simulated_clock_is_monotonic() {
        let start = Utc.with_ymd_and_hms(2025, 10, 23, 12, 0, 0).unwrap();
        let mut clock = EngineClock::simulated_at(start);
        clock.observe(start - chrono::Duration::seconds(5));
        assert_eq!(clock.now(), start);
        clock.observe(start + chrono::Duration::seconds(5));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(5));
    }

    #[test]
    fn broker_time_applies_fixed_offset() {
        let at = Utc.with_ymd_and_hms(2025, 10, 23, 21, 30, 0).unwrap();
        let local = broker_time(at, offset());
        assert_eq!(local.time, NaiveTime::from_hms_opt(23, 30, 0).unwrap());
        assert_eq!(local.weekday, Weekday::Thu);
    }

    #[test]
    fn weekend_window_wraps_the_week_boundary() {
        let (start, end) = weekend();
        let friday_late = BrokerTime {
            date: NaiveDate::from_ymd_opt(2025, 10, 24).unwrap(),
            time: NaiveTime::from_hms_opt(23, 30, 0).unwrap(),
            weekday: Weekday::Fri,
        };
        let saturday = BrokerTime {
            date: NaiveDate::from_ymd_opt(2025, 10, 25).unwrap(),
            time: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
            weekday: Weekday::Sat,
        };
        let monday_early = BrokerTime {
            date: NaiveDate::from_ymd_opt(2025, 10, 27).unwrap(),
            time: NaiveTime::from_hms_opt(6, 59, 0).unwrap(),
            weekday: Weekday::Mon,
        };
        let monday_open = BrokerTime {
            date: NaiveDate::from_ymd_opt(2025, 10, 27).unwrap(),
            time: NaiveTime::from_hms_opt(7, 0, 0).unwrap(),
            weekday: Weekday::Mon,
        };
        assert!(in_weekend(friday_late, start, end));
        assert!(in_weekend(saturday, start, end));
        assert!(in_weekend(monday_early, start, end));
        assert!(!in_weekend(monday_open, start, end));
    }
}
