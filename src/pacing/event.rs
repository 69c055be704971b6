use crate::errors::SimError;
use crate::pacing::PacingEventSpec;

/// A scheduled occurrence of a protocol event.
#[derive(Clone, Copy, Debug)]
struct Scheduled {
    level: f64,
    start: f64,
    duration: f64,
    period: f64,
    /// Remaining occurrences, `None` for indefinitely repeating events.
    remaining: Option<u32>,
}

/// Event-based pacing system.
///
/// Produces a piecewise-constant level from a list of stimulus events. The
/// system keeps a time cursor which may only move forward; advancing it fires
/// every event whose scheduled start lies at or before the new cursor time.
#[derive(Clone, Debug)]
pub struct EventPacing {
    /// Future occurrences, sorted by ascending start time.
    pending: Vec<Scheduled>,
    /// The time cursor.
    time: f64,
    /// The level currently imposed.
    level: f64,
    /// End of the active event, or infinity when no event is active.
    tdown: f64,
}

impl EventPacing {
    /// Builds the system from a protocol description, validating every event.
    pub fn populate(events: &[PacingEventSpec]) -> Result<Self, SimError> {
        let mut pending = Vec::with_capacity(events.len());
        for e in events {
            if !(e.level.is_finite() && e.start.is_finite()) {
                return Err(SimError::InvalidPacing(
                    "event level and start must be finite".to_string(),
                ));
            }
            if !(e.duration.is_finite() && e.duration >= 0.0) {
                return Err(SimError::InvalidPacing(format!(
                    "event duration must be finite and non-negative, got {}",
                    e.duration
                )));
            }
            if !(e.period.is_finite() && e.period >= 0.0) {
                return Err(SimError::InvalidPacing(format!(
                    "event period must be finite and non-negative, got {}",
                    e.period
                )));
            }
            if e.period == 0.0 && e.multiplier > 0 {
                return Err(SimError::InvalidPacing(
                    "non-periodic event cannot have a multiplier".to_string(),
                ));
            }
            if e.period > 0.0 && e.duration > e.period {
                return Err(SimError::InvalidPacing(format!(
                    "event duration ({}) exceeds its period ({})",
                    e.duration, e.period
                )));
            }
            pending.push(Scheduled {
                level: e.level,
                start: e.start,
                duration: e.duration,
                period: e.period,
                remaining: if e.multiplier == 0 {
                    None
                } else {
                    Some(e.multiplier)
                },
            });
        }
        pending.sort_by(|a, b| a.start.total_cmp(&b.start));
        for w in pending.windows(2) {
            if w[0].start == w[1].start {
                return Err(SimError::InvalidPacing(format!(
                    "simultaneous pacing events at t={}",
                    w[0].start
                )));
            }
        }
        Ok(Self {
            pending,
            time: f64::NEG_INFINITY,
            level: 0.0,
            tdown: f64::INFINITY,
        })
    }

    /// Moves the cursor to `t`, firing and expiring events along the way.
    pub fn advance_time(&mut self, t: f64) -> Result<(), SimError> {
        if t < self.time {
            return Err(SimError::InvalidPacing(format!(
                "pacing cannot be advanced backwards in time (from {} to {})",
                self.time, t
            )));
        }
        self.time = t;
        loop {
            let t_start = self.pending.first().map_or(f64::INFINITY, |e| e.start);
            if self.tdown.min(t_start) > t {
                break;
            }
            if self.tdown <= t_start {
                // The active event expires before the next one fires.
                self.level = 0.0;
                self.tdown = f64::INFINITY;
            } else {
                let mut e = self.pending.remove(0);
                if let Some(next) = self.pending.first() {
                    if next.start == e.start {
                        return Err(SimError::InvalidPacing(format!(
                            "simultaneous pacing events at t={}",
                            e.start
                        )));
                    }
                }
                self.level = e.level;
                self.tdown = e.start + e.duration;
                if e.period > 0.0 {
                    let reschedule = match e.remaining {
                        None => true,
                        Some(n) => {
                            e.remaining = Some(n - 1);
                            n > 1
                        }
                    };
                    if reschedule {
                        e.start += e.period;
                        let pos = self
                            .pending
                            .partition_point(|other| other.start < e.start);
                        self.pending.insert(pos, e);
                    }
                }
            }
        }
        Ok(())
    }

    /// The level the protocol currently imposes.
    pub fn level(&self) -> f64 {
        self.level
    }

    /// The earliest future time at which the level will change.
    pub fn next_time(&self) -> f64 {
        let t_start = self.pending.first().map_or(f64::INFINITY, |e| e.start);
        self.tdown.min(t_start)
    }
}
