use crate::errors::SimError;

/// Time-series pacing system.
///
/// Holds a sampled signal as a sorted `(time, value)` table and produces its
/// level by linear interpolation, clamping outside the sampled range. Because
/// the level can change at any point within an integration step, the driver
/// samples it inside the RHS via [`TimeSeriesPacing::level_at`] rather than at
/// pacing-update points.
#[derive(Clone, Debug)]
pub struct TimeSeriesPacing {
    times: Vec<f64>,
    values: Vec<f64>,
    time: f64,
}

impl TimeSeriesPacing {
    /// Builds the system from a `(time, value)` table.
    pub fn populate(samples: &[(f64, f64)]) -> Result<Self, SimError> {
        if samples.is_empty() {
            return Err(SimError::InvalidPacing(
                "time series protocol must contain at least one sample".to_string(),
            ));
        }
        for (t, v) in samples {
            if !(t.is_finite() && v.is_finite()) {
                return Err(SimError::InvalidPacing(
                    "time series samples must be finite".to_string(),
                ));
            }
        }
        for w in samples.windows(2) {
            if w[1].0 <= w[0].0 {
                return Err(SimError::InvalidPacing(format!(
                    "time series times must be strictly increasing ({} followed by {})",
                    w[0].0, w[1].0
                )));
            }
        }
        Ok(Self {
            times: samples.iter().map(|s| s.0).collect(),
            values: samples.iter().map(|s| s.1).collect(),
            time: f64::NEG_INFINITY,
        })
    }

    /// The signal value at time `t`, by linear interpolation.
    pub fn level_at(&self, t: f64) -> f64 {
        let n = self.times.len();
        if t <= self.times[0] {
            return self.values[0];
        }
        if t >= self.times[n - 1] {
            return self.values[n - 1];
        }
        let i = self.times.partition_point(|&x| x <= t);
        let (t0, t1) = (self.times[i - 1], self.times[i]);
        let (v0, v1) = (self.values[i - 1], self.values[i]);
        v0 + (v1 - v0) * (t - t0) / (t1 - t0)
    }

    /// Moves the time cursor forward to `t`.
    pub fn advance_time(&mut self, t: f64) -> Result<(), SimError> {
        if t < self.time {
            return Err(SimError::InvalidPacing(format!(
                "pacing cannot be advanced backwards in time (from {} to {})",
                self.time, t
            )));
        }
        self.time = t;
        Ok(())
    }

    /// The level at the current cursor time.
    pub fn level(&self) -> f64 {
        self.level_at(self.time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolation_and_clamping() {
        let sys =
            TimeSeriesPacing::populate(&[(0.0, 0.0), (1.0, 2.0), (3.0, 2.0), (4.0, -1.0)]).unwrap();
        assert_eq!(sys.level_at(-5.0), 0.0);
        assert_eq!(sys.level_at(0.5), 1.0);
        assert_eq!(sys.level_at(2.0), 2.0);
        assert_eq!(sys.level_at(3.5), 0.5);
        assert_eq!(sys.level_at(10.0), -1.0);
    }

    #[test]
    fn test_rejects_bad_tables() {
        assert!(TimeSeriesPacing::populate(&[]).is_err());
        assert!(TimeSeriesPacing::populate(&[(0.0, 1.0), (0.0, 2.0)]).is_err());
        assert!(TimeSeriesPacing::populate(&[(1.0, 0.0), (0.5, 0.0)]).is_err());
        assert!(TimeSeriesPacing::populate(&[(0.0, f64::NAN)]).is_err());
    }

    #[test]
    fn test_cursor() {
        let mut sys = TimeSeriesPacing::populate(&[(0.0, 0.0), (2.0, 4.0)]).unwrap();
        sys.advance_time(1.0).unwrap();
        assert_eq!(sys.level(), 2.0);
        assert!(sys.advance_time(0.5).is_err());
    }
}
