use serde_derive::{Deserialize, Serialize};

use crate::errors::SimError;

/// Event-based pacing: a protocol of timed stimulus events.
pub mod event;
pub use self::event::EventPacing;

/// Time-series pacing: a sampled signal with linear interpolation.
pub mod time_series;
pub use self::time_series::TimeSeriesPacing;

/// A single stimulus event in an event-based protocol.
///
/// The event raises the pacing level to `level` at `start` for `duration`
/// time units. If `period` is positive the event repeats every `period`
/// units, `multiplier` times in total (zero meaning indefinitely).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PacingEventSpec {
    pub level: f64,
    pub start: f64,
    pub duration: f64,
    pub period: f64,
    pub multiplier: u32,
}

impl PacingEventSpec {
    /// A single non-repeating stimulus.
    pub fn single(level: f64, start: f64, duration: f64) -> Self {
        Self {
            level,
            start,
            duration,
            period: 0.0,
            multiplier: 0,
        }
    }

    /// A stimulus repeating every `period` time units, indefinitely.
    pub fn periodic(level: f64, start: f64, duration: f64, period: f64) -> Self {
        Self {
            level,
            start,
            duration,
            period,
            multiplier: 0,
        }
    }
}

/// A plain-data description of a pacing protocol, as supplied by the host.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Protocol {
    Event(Vec<PacingEventSpec>),
    TimeSeries(Vec<(f64, f64)>),
}

/// A live pacing system, driving one bound input over the simulation.
///
/// Both variants present the same contract: `advance_time` moves the internal
/// cursor forward, `level` is the currently imposed level, and `next_time` is
/// the earliest future time at which the level will change discretely
/// (infinity for time-series systems, whose level may change continuously and
/// is therefore sampled inside the RHS instead).
#[derive(Clone, Debug)]
pub enum Pacing {
    Event(EventPacing),
    TimeSeries(TimeSeriesPacing),
}

impl Pacing {
    /// Builds a pacing system from its protocol description.
    pub fn from_protocol(protocol: &Protocol) -> Result<Self, SimError> {
        match protocol {
            Protocol::Event(events) => Ok(Pacing::Event(EventPacing::populate(events)?)),
            Protocol::TimeSeries(samples) => {
                Ok(Pacing::TimeSeries(TimeSeriesPacing::populate(samples)?))
            }
        }
    }

    /// Moves the internal cursor to `t`, applying any events up to and
    /// including `t`. Fails if `t` is earlier than the current cursor.
    pub fn advance_time(&mut self, t: f64) -> Result<(), SimError> {
        match self {
            Pacing::Event(e) => e.advance_time(t),
            Pacing::TimeSeries(f) => f.advance_time(t),
        }
    }

    /// The level currently imposed on the bound input.
    pub fn level(&self) -> f64 {
        match self {
            Pacing::Event(e) => e.level(),
            Pacing::TimeSeries(f) => f.level(),
        }
    }

    /// The earliest future time at which the level will change, or infinity.
    pub fn next_time(&self) -> f64 {
        match self {
            Pacing::Event(e) => e.next_time(),
            Pacing::TimeSeries(_) => f64::INFINITY,
        }
    }
}

/// Tolerant time comparison, shared by the pacing systems and the driver's
/// final-time snap.
pub(crate) fn times_close(a: f64, b: f64) -> bool {
    a == b || (a - b).abs() < 1e-9 * a.abs().max(b.abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_times_close() {
        assert!(times_close(1000.0, 1000.0));
        assert!(times_close(1000.0, 1000.0 + 1e-10));
        assert!(!times_close(1000.0, 1000.1));
        assert!(times_close(0.0, 0.0));
        assert!(!times_close(0.0, 1e-30));
    }

    #[test]
    fn test_protocol_dispatch() {
        let p = Protocol::Event(vec![PacingEventSpec::periodic(1.0, 10.0, 1.0, 1000.0)]);
        let mut sys = Pacing::from_protocol(&p).unwrap();
        sys.advance_time(0.0).unwrap();
        assert_eq!(sys.level(), 0.0);
        assert_eq!(sys.next_time(), 10.0);

        let p = Protocol::TimeSeries(vec![(0.0, 0.0), (1.0, 2.0)]);
        let sys = Pacing::from_protocol(&p).unwrap();
        assert_eq!(sys.next_time(), f64::INFINITY);
    }
}
