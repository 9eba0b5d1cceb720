//! Periodic and daily job scheduling with a documented total order.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};

use crate::clock::broker_time;

/// Work items the scheduler can own.
///
/// The derived `Ord` is the total execution order for jobs due at the same
/// virtual instant: emergency checks first, then anomaly checks, then the
/// daily force-close (which must beat the periodic review when both land on
/// the same second), then the review itself, then informational checkpoints.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum JobKind {
    Layer1,
    Layer2Minute,
    Layer2FiveMinute,
    DailyForceClose,
    Layer3Periodic,
    DailyCheckpoint(NaiveTime),
}

impl JobKind {
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::Layer1 => "layer1".to_string(),
            Self::Layer2Minute => "layer2_minute".to_string(),
            Self::Layer2FiveMinute => "layer2_five_minute".to_string(),
            Self::DailyForceClose => "daily_force_close".to_string(),
            Self::Layer3Periodic => "layer3_periodic".to_string(),
            Self::DailyCheckpoint(at) => format!("checkpoint_{}", at.format("%H:%M")),
        }
    }
}

#[derive(Debug)]
struct PeriodicSlot {
    kind: JobKind,
    period: Duration,
    phase: Duration,
    next_due: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct DailySlot {
    kind: JobKind,
    at: NaiveTime,
    last_fired_on: Option<NaiveDate>,
}

/// Drives periodic jobs by elapsed virtual time and daily jobs by the
/// broker-local wall clock, firing each at most once per period / per date.
pub struct Scheduler {
    broker_offset: FixedOffset,
    periodic: Vec<PeriodicSlot>,
    daily: Vec<DailySlot>,
    primed: bool,
}

impl Scheduler {
    #[must_use]
    pub fn new(broker_offset: FixedOffset) -> Self {
        Self {
            broker_offset,
            periodic: Vec::new(),
            daily: Vec::new(),
            primed: false,
        }
    }

    pub fn register_periodic(&mut self, kind: JobKind, period: Duration, phase: Duration) {
        self.periodic.push(PeriodicSlot {
            kind,
            period,
            phase,
            next_due: None,
        });
    }

    pub fn register_daily(&mut self, kind: JobKind, at: NaiveTime) {
        self.daily.push(DailySlot {
            kind,
            at,
            last_fired_on: None,
        });
    }

    /// Mark daily jobs whose time already passed today as done so a mid-day
    /// start does not replay the morning schedule.
    fn prime(&mut self, now: DateTime<Utc>) {
        let local = broker_time(now, self.broker_offset);
        for slot in &mut self.daily {
            if local.time >= slot.at {
                slot.last_fired_on = Some(local.date);
            }
        }
        for slot in &mut self.periodic {
            slot.next_due = Some(now + slot.phase + slot.period);
        }
        self.primed = true;
    }

    /// All jobs due at `now`, in execution order. Each periodic job advances
    /// by whole periods so a stalled feed does not produce a burst of
    /// catch-up firings.
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<JobKind> {
        if !self.primed {
            self.prime(now);
            return Vec::new();
        }
        let mut fired = Vec::new();
        for slot in &mut self.periodic {
            let due_at = slot.next_due.get_or_insert(now + slot.period);
            if now >= *due_at {
                fired.push(slot.kind);
                let mut next = *due_at + slot.period;
                if next <= now {
                    next = now + slot.period;
                }
                slot.next_due = Some(next);
            }
        }
        let local = broker_time(now, self.broker_offset);
        for slot in &mut self.daily {
            if local.time >= slot.at && slot.last_fired_on != Some(local.date) {
                fired.push(slot.kind);
                slot.last_fired_on = Some(local.date);
            }
        }
        fired.sort();
        fired
    }
}
