use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::errors::SimError;

/// The coupling surface between the integrator and the model being
/// integrated. The driver implements this on top of the model record, the
/// pacing systems and the evaluation counters.
pub trait OdeSystem {
    fn n_states(&self) -> usize;

    /// Evaluates the time-derivative of the state vector into `ydot`.
    fn rhs(&mut self, t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> Result<(), SimError>;

    /// Adds `delta` to the constant behind sensitivity independent `i`.
    /// A no-op for initial-state independents.
    fn perturb_independent(&mut self, _i: usize, _delta: f64) {}
}

/// Integrator options: scalar tolerances and optional step bounds.
#[derive(Clone, Copy, Debug)]
pub struct SolverOptions {
    pub abs_tol: f64,
    pub rel_tol: f64,
    /// Maximum step size; zero or negative disables the bound.
    pub max_step: f64,
    /// Minimum step size; zero or negative disables the bound.
    pub min_step: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            abs_tol: 1e-6,
            rel_tol: 1e-4,
            max_step: 0.0,
            min_step: 0.0,
        }
    }
}

/// The single root function `states[index] - threshold`.
#[derive(Clone, Copy, Debug)]
pub struct RootSpec {
    pub index: usize,
    pub threshold: f64,
}

/// Forward-sensitivity configuration: one entry per independent.
#[derive(Clone, Debug)]
pub struct SensSetup {
    /// Whether the independent is a parameter (else an initial state).
    pub is_parameter: Vec<bool>,
    /// Per-independent scaling used in the difference-quotient increments.
    pub pbar: Vec<f64>,
}

impl SensSetup {
    pub fn ns(&self) -> usize {
        self.is_parameter.len()
    }
}

/// A detected root crossing; the solver has stopped at the crossing time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RootEvent {
    /// `+1` for an upward crossing, `-1` for a downward crossing.
    pub direction: i8,
}

/// Outcome of a single accepted integration step.
#[derive(Clone, Copy, Debug)]
pub struct StepResult {
    pub t: f64,
    pub root: Option<RootEvent>,
}

/// Stores the details of the previous integration step.
#[derive(Clone, Copy, Debug)]
pub struct IntegrationDetails {
    /// step size used
    pub step: f64,
    /// weighted error estimate of the previous step
    pub error: f64,
    /// number of attempts needed to pass the error test
    pub attempts: u8,
}

const SAFETY: f64 = 0.9;
const MAX_GROWTH: f64 = 5.0;
const MIN_SHRINK: f64 = 0.1;
const MAX_ATTEMPTS: u8 = 50;
const MAX_NEWTON_ITERS: usize = 4;
const NEWTON_TOL: f64 = 0.05;
const JAC_REFRESH_STEPS: u32 = 20;
const ROOT_BISECTIONS: usize = 80;

/// An adaptive implicit integrator: variable-step BDF with Newton iteration
/// and a dense LU linear solve.
///
/// Steps are order one immediately after (re)initialisation and order two
/// once a history point exists. The Jacobian is computed numerically and
/// reused across steps until it goes stale. Dense output over the last
/// accepted step is by cubic Hermite interpolation, which also backs the
/// bisection refinement of root crossings. Forward sensitivities are
/// corrected together with the state, reusing the Newton matrix
/// factorisation for one linear solve per independent.
pub struct BdfSolver {
    n: usize,
    opts: SolverOptions,
    root: Option<RootSpec>,
    sens: Option<SensSetup>,
    t: f64,
    y: DVector<f64>,
    f: DVector<f64>,
    t_prev: f64,
    y_prev: DVector<f64>,
    f_prev: DVector<f64>,
    s: Vec<DVector<f64>>,
    sdot: Vec<DVector<f64>>,
    s_prev: Vec<DVector<f64>>,
    sdot_prev: Vec<DVector<f64>>,
    /// True once a previous accepted step exists and order two is usable.
    have_history: bool,
    /// Proposed size of the next step.
    h: f64,
    jac: DMatrix<f64>,
    jac_stale: bool,
    steps_since_jac: u32,
    details: IntegrationDetails,
}

impl BdfSolver {
    /// Creates the integrator at `(t0, y0)` with the given initial
    /// sensitivity columns (empty when sensitivities are disabled).
    pub fn new<S: OdeSystem>(
        sys: &mut S,
        t0: f64,
        y0: DVector<f64>,
        s0: Vec<DVector<f64>>,
        opts: SolverOptions,
        root: Option<RootSpec>,
        sens: Option<SensSetup>,
    ) -> Result<Self, SimError> {
        let n = y0.len();
        if n == 0 {
            return Err(SimError::IntegratorSetup(
                "cannot integrate an empty state vector".to_string(),
            ));
        }
        if let Some(rs) = &root {
            if rs.index >= n {
                return Err(SimError::IntegratorSetup(format!(
                    "root function index {} out of range for {} states",
                    rs.index, n
                )));
            }
        }
        if let Some(setup) = &sens {
            if s0.len() != setup.ns() {
                return Err(SimError::IntegratorSetup(format!(
                    "expected {} sensitivity columns, got {}",
                    setup.ns(),
                    s0.len()
                )));
            }
        }
        let ns = s0.len();
        let mut solver = Self {
            n,
            opts,
            root,
            sens,
            t: t0,
            y: y0.clone(),
            f: DVector::zeros(n),
            t_prev: t0,
            y_prev: y0,
            f_prev: DVector::zeros(n),
            s: s0.clone(),
            sdot: vec![DVector::zeros(n); ns],
            s_prev: s0,
            sdot_prev: vec![DVector::zeros(n); ns],
            have_history: false,
            h: 0.0,
            jac: DMatrix::zeros(n, n),
            jac_stale: true,
            steps_since_jac: 0,
            details: IntegrationDetails {
                step: 0.0,
                error: 0.0,
                attempts: 1,
            },
        };
        solver.refresh_slopes(sys)?;
        solver.h = solver.initial_step();
        Ok(solver)
    }

    pub fn time(&self) -> f64 {
        self.t
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.y
    }

    pub fn sensitivities(&self) -> &[DVector<f64>] {
        &self.s
    }

    /// Borrow the details of the latest integration step.
    pub fn latest_details(&self) -> &IntegrationDetails {
        &self.details
    }

    /// Restarts the method at `(t, y)` (and sensitivities), discarding all
    /// history. Called by the driver after pacing discontinuities.
    pub fn reinit<S: OdeSystem>(
        &mut self,
        sys: &mut S,
        t: f64,
        y: &DVector<f64>,
        s: &[DVector<f64>],
    ) -> Result<(), SimError> {
        self.t = t;
        self.t_prev = t;
        self.y.copy_from(y);
        self.y_prev.copy_from(y);
        for (dst, src) in self.s.iter_mut().zip(s) {
            dst.copy_from(src);
        }
        self.s_prev.clone_from(&self.s);
        self.have_history = false;
        self.jac_stale = true;
        self.refresh_slopes(sys)?;
        self.h = self.initial_step();
        Ok(())
    }

    /// Takes exactly one accepted internal step. The step may overshoot any
    /// horizon the driver cares about; rewinding is the driver's job via
    /// [`BdfSolver::interpolate`].
    pub fn one_step<S: OdeSystem>(&mut self, sys: &mut S) -> Result<StepResult, SimError> {
        let mut h = self.clamp_step(self.h);
        self.details.attempts = 1;
        loop {
            if self.t + h == self.t {
                // Step underflow: no progress is possible at this size. The
                // driver's zero-step guard decides when to give up.
                self.details.step = 0.0;
                return Ok(StepResult {
                    t: self.t,
                    root: None,
                });
            }
            match self.attempt_step(sys, h, false)? {
                Attempt::Accepted { error, order } => {
                    self.details.step = h;
                    self.details.error = error;
                    let factor = if error > 0.0 {
                        (SAFETY * error.powf(-1.0 / (order as f64 + 1.0))).min(MAX_GROWTH)
                    } else {
                        MAX_GROWTH
                    };
                    self.h = self.clamp_step(h * factor);
                    let root = self.check_root(sys)?;
                    return Ok(StepResult { t: self.t, root });
                }
                Attempt::ErrorTest { error, order } => {
                    if h <= self.min_step_at(self.t) || self.details.attempts >= MAX_ATTEMPTS {
                        warn!(
                            "error test failed at the minimum step size, accepting step (t={}, error={})",
                            self.t, error
                        );
                        // Nothing smaller is allowed: redo the step and keep it.
                        match self.attempt_step(sys, h, true)? {
                            Attempt::Accepted { error, .. } => {
                                self.details.step = h;
                                self.details.error = error;
                                self.h = self.clamp_step(h);
                                let root = self.check_root(sys)?;
                                return Ok(StepResult { t: self.t, root });
                            }
                            _ => {
                                return Err(SimError::IntegratorConvergence(format!(
                                    "could not take a step at t={} with the minimum step size",
                                    self.t
                                )))
                            }
                        }
                    }
                    self.details.attempts = self.details.attempts.saturating_add(1);
                    let factor = if error.is_finite() && error > 0.0 {
                        (SAFETY * error.powf(-1.0 / (order as f64 + 1.0)))
                            .clamp(MIN_SHRINK, SAFETY)
                    } else {
                        0.25
                    };
                    h = self.clamp_step((h * factor).max(self.min_step_at(self.t)));
                }
                Attempt::NewtonFailure => {
                    if h <= self.min_step_at(self.t) || self.details.attempts >= MAX_ATTEMPTS {
                        return Err(SimError::IntegratorConvergence(format!(
                            "Newton iteration failed to converge at t={} with step size {}",
                            self.t, h
                        )));
                    }
                    self.details.attempts = self.details.attempts.saturating_add(1);
                    self.jac_stale = true;
                    h = self.clamp_step((h * 0.25).max(self.min_step_at(self.t)));
                }
            }
        }
    }

    /// Dense output: the interpolated state at `tq`, which must lie within
    /// the last accepted step.
    pub fn interpolate(&self, tq: f64, out: &mut DVector<f64>) -> Result<(), SimError> {
        let (theta, hs) = self.interp_theta(tq)?;
        if hs == 0.0 {
            out.copy_from(&self.y);
            return Ok(());
        }
        hermite(
            out,
            theta,
            hs,
            &self.y_prev,
            &self.f_prev,
            &self.y,
            &self.f,
        );
        Ok(())
    }

    /// Dense output for the sensitivity columns at `tq`.
    pub fn interpolate_sens(&self, tq: f64, out: &mut [DVector<f64>]) -> Result<(), SimError> {
        let (theta, hs) = self.interp_theta(tq)?;
        for (i, column) in out.iter_mut().enumerate() {
            if hs == 0.0 {
                column.copy_from(&self.s[i]);
            } else {
                hermite(
                    column,
                    theta,
                    hs,
                    &self.s_prev[i],
                    &self.sdot_prev[i],
                    &self.s[i],
                    &self.sdot[i],
                );
            }
        }
        Ok(())
    }

    fn interp_theta(&self, tq: f64) -> Result<(f64, f64), SimError> {
        let hs = self.t - self.t_prev;
        let slack = 1e-9 * self.t.abs().max(self.t_prev.abs()).max(1.0);
        if tq < self.t_prev.min(self.t) - slack || tq > self.t_prev.max(self.t) + slack {
            return Err(SimError::IntegratorInput(format!(
                "interpolation time {} outside the last step [{}, {}]",
                tq, self.t_prev, self.t
            )));
        }
        if hs == 0.0 {
            return Ok((0.0, 0.0));
        }
        Ok(((tq - self.t_prev) / hs, hs))
    }

    /// Evaluates the slope at the current point, plus the Jacobian and the
    /// sensitivity slopes when sensitivities are enabled. Used at
    /// construction and after every restart so the dense output has valid
    /// endpoint derivatives.
    fn refresh_slopes<S: OdeSystem>(&mut self, sys: &mut S) -> Result<(), SimError> {
        let y = self.y.clone();
        let mut f = DVector::zeros(self.n);
        sys.rhs(self.t, &y, &mut f)?;
        self.f = f;
        self.f_prev.copy_from(&self.f);
        if let Some(setup) = self.sens.clone() {
            self.update_jacobian(sys, self.t, &y)?;
            for i in 0..setup.ns() {
                let fp = self.sens_partial(sys, &setup, i, self.t, &y)?;
                self.sdot[i] = &self.jac * &self.s[i] + fp;
            }
            self.sdot_prev.clone_from(&self.sdot);
        }
        Ok(())
    }

    fn initial_step(&self) -> f64 {
        let scale = self.wrms(&self.f, &self.y);
        let h0 = if scale > 0.0 && scale.is_finite() {
            0.1 / scale
        } else {
            1e-3
        };
        self.clamp_step(h0)
    }

    fn clamp_step(&self, h: f64) -> f64 {
        let mut h = h;
        if self.opts.max_step > 0.0 {
            h = h.min(self.opts.max_step);
        }
        let floor = self.min_step_at(self.t);
        if h < floor {
            h = floor;
        }
        h
    }

    fn min_step_at(&self, t: f64) -> f64 {
        if self.opts.min_step > 0.0 {
            self.opts.min_step
        } else {
            1e-14 * t.abs().max(1.0)
        }
    }

    /// Weighted root-mean-square norm of `v` with weights from `yref`.
    fn wrms(&self, v: &DVector<f64>, yref: &DVector<f64>) -> f64 {
        let mut acc = 0.0;
        for i in 0..self.n {
            let w = 1.0 / (self.opts.rel_tol * yref[i].abs() + self.opts.abs_tol);
            acc += (v[i] * w) * (v[i] * w);
        }
        (acc / self.n as f64).sqrt()
    }

    fn update_jacobian<S: OdeSystem>(
        &mut self,
        sys: &mut S,
        t: f64,
        y: &DVector<f64>,
    ) -> Result<(), SimError> {
        let srur = f64::EPSILON.sqrt();
        let mut base = DVector::zeros(self.n);
        sys.rhs(t, y, &mut base)?;
        let mut pert = y.clone();
        let mut fp = DVector::zeros(self.n);
        for j in 0..self.n {
            let delta = srur * y[j].abs().max(self.opts.abs_tol);
            pert[j] = y[j] + delta;
            sys.rhs(t, &pert, &mut fp)?;
            pert[j] = y[j];
            for i in 0..self.n {
                self.jac[(i, j)] = (fp[i] - base[i]) / delta;
            }
        }
        self.jac_stale = false;
        self.steps_since_jac = 0;
        Ok(())
    }

    /// The difference-quotient partial `df/dp_i`, zero for initial-state
    /// independents.
    fn sens_partial<S: OdeSystem>(
        &self,
        sys: &mut S,
        setup: &SensSetup,
        i: usize,
        t: f64,
        y: &DVector<f64>,
    ) -> Result<DVector<f64>, SimError> {
        if !setup.is_parameter[i] {
            return Ok(DVector::zeros(self.n));
        }
        let sigma = f64::EPSILON.sqrt() * setup.pbar[i];
        let mut base = DVector::zeros(self.n);
        sys.rhs(t, y, &mut base)?;
        let mut fp = DVector::zeros(self.n);
        sys.perturb_independent(i, sigma);
        let res = sys.rhs(t, y, &mut fp);
        sys.perturb_independent(i, -sigma);
        res?;
        Ok((fp - base) / sigma)
    }

    fn attempt_step<S: OdeSystem>(
        &mut self,
        sys: &mut S,
        h: f64,
        force_accept: bool,
    ) -> Result<Attempt, SimError> {
        let t_new = self.t + h;
        // Order two only with a usable history point: extreme step ratios
        // (after a restart or a root stop) make the variable-step
        // coefficients ill-conditioned, so those steps drop to order one.
        let span = self.t - self.t_prev;
        let second_order = self.have_history && span > 0.0 && h / span <= 100.0;
        let (order, a1, a2, b) = if second_order {
            let rho = h / span;
            let denom = 1.0 + 2.0 * rho;
            (
                2u32,
                (1.0 + rho) * (1.0 + rho) / denom,
                -(rho * rho) / denom,
                (1.0 + rho) / denom,
            )
        } else {
            (1u32, 1.0, 0.0, 1.0)
        };

        // Predictor: Taylor expansion around the current point, with a
        // difference-quotient second derivative once history exists.
        let y_pred = if second_order {
            let fdot = (&self.f - &self.f_prev) / span;
            &self.y + h * &self.f + (0.5 * h * h) * fdot
        } else {
            &self.y + h * &self.f
        };
        let past = a1 * &self.y + a2 * &self.y_prev;

        if self.jac_stale || self.steps_since_jac >= JAC_REFRESH_STEPS {
            self.update_jacobian(sys, t_new, &y_pred)?;
        }
        let m = DMatrix::identity(self.n, self.n) - (b * h) * &self.jac;
        let lu = m.lu();

        // Newton iteration on G(x) = x - past - b h f(t_new, x).
        let mut x = y_pred.clone();
        let mut fx = DVector::zeros(self.n);
        sys.rhs(t_new, &x, &mut fx)?;
        let mut converged = false;
        for _ in 0..MAX_NEWTON_ITERS {
            let residual = &x - &past - (b * h) * &fx;
            let delta = match lu.solve(&residual) {
                Some(d) => d,
                None => break,
            };
            x -= &delta;
            let dn = self.wrms(&delta, &self.y);
            sys.rhs(t_new, &x, &mut fx)?;
            if dn.is_finite() && dn <= NEWTON_TOL {
                converged = true;
                break;
            }
        }
        if !converged || !x.iter().all(|v| v.is_finite()) {
            debug!("Newton failure at t={} with step {}", self.t, h);
            return Ok(Attempt::NewtonFailure);
        }

        let coeff = if order == 2 { 0.25 } else { 0.5 };
        let error = coeff * self.wrms(&(&x - &y_pred), &self.y);
        if !(error <= 1.0) && !force_accept {
            return Ok(Attempt::ErrorTest { error, order });
        }

        // Correct the sensitivity columns with the same Newton matrix:
        // (I - b h J) s_new = a1 s + a2 s_prev + b h df/dp.
        let mut s_new = Vec::new();
        let mut sdot_new = Vec::new();
        if let Some(setup) = self.sens.clone() {
            for i in 0..setup.ns() {
                let fp = self.sens_partial(sys, &setup, i, t_new, &x)?;
                let rhs_s = a1 * &self.s[i] + a2 * &self.s_prev[i] + (b * h) * &fp;
                let si = lu.solve(&rhs_s).ok_or_else(|| {
                    SimError::IntegratorConvergence(format!(
                        "sensitivity corrector solve failed at t={}",
                        t_new
                    ))
                })?;
                sdot_new.push(&self.jac * &si + fp);
                s_new.push(si);
            }
        }

        // Commit the accepted step.
        self.t_prev = self.t;
        std::mem::swap(&mut self.y_prev, &mut self.y);
        std::mem::swap(&mut self.f_prev, &mut self.f);
        self.t = t_new;
        self.y = x;
        self.f = fx;
        if self.sens.is_some() {
            std::mem::swap(&mut self.s_prev, &mut self.s);
            std::mem::swap(&mut self.sdot_prev, &mut self.sdot);
            self.s = s_new;
            self.sdot = sdot_new;
        }
        self.have_history = true;
        self.steps_since_jac += 1;
        Ok(Attempt::Accepted { error, order })
    }

    /// Detects a root crossing over the last accepted step and, if found,
    /// moves the current point back to the crossing.
    fn check_root<S: OdeSystem>(&mut self, sys: &mut S) -> Result<Option<RootEvent>, SimError> {
        let rs = match self.root {
            Some(rs) => rs,
            None => return Ok(None),
        };
        let g0 = self.y_prev[rs.index] - rs.threshold;
        let g1 = self.y[rs.index] - rs.threshold;
        if !(g0.is_finite() && g1.is_finite()) {
            return Err(SimError::RootFuncFailed(format!(
                "root function is not finite at t={}",
                self.t
            )));
        }
        if g0 == 0.0 || (g1 != 0.0 && g0.signum() == g1.signum()) {
            return Ok(None);
        }
        let direction = if g1 > g0 { 1 } else { -1 };

        // Bisection on the dense output.
        let mut lo = self.t_prev;
        let mut hi = self.t;
        let mut scratch = DVector::zeros(self.n);
        for _ in 0..ROOT_BISECTIONS {
            let mid = 0.5 * (lo + hi);
            if mid <= lo || mid >= hi {
                break;
            }
            self.interpolate(mid, &mut scratch)?;
            let gm = scratch[rs.index] - rs.threshold;
            if gm == 0.0 {
                lo = mid;
                hi = mid;
                break;
            }
            if gm.signum() == g0.signum() {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        let tr = hi;
        debug!("root crossing (direction {}) located at t={}", direction, tr);

        // Stop at the crossing: interpolate everything against the full step
        // first, then shrink the dense interval to [t_prev, tr].
        self.interpolate(tr, &mut scratch)?;
        if self.sens.is_some() {
            let hs = self.t - self.t_prev;
            let theta = if hs != 0.0 { (tr - self.t_prev) / hs } else { 1.0 };
            let mut cols = self.s.clone();
            self.interpolate_sens(tr, &mut cols)?;
            self.s = cols;
            for i in 0..self.sdot.len() {
                self.sdot[i] = (1.0 - theta) * &self.sdot_prev[i] + theta * &self.sdot[i];
            }
        }
        self.t = tr;
        self.y.copy_from(&scratch);
        let y_root = self.y.clone();
        sys.rhs(tr, &y_root, &mut self.f)?;
        Ok(Some(RootEvent { direction }))
    }
}

enum Attempt {
    Accepted { error: f64, order: u32 },
    ErrorTest { error: f64, order: u32 },
    NewtonFailure,
}

/// Cubic Hermite interpolation over one step of size `hs`, at fraction
/// `theta` of the way from `(y0, f0)` to `(y1, f1)`.
fn hermite(
    out: &mut DVector<f64>,
    theta: f64,
    hs: f64,
    y0: &DVector<f64>,
    f0: &DVector<f64>,
    y1: &DVector<f64>,
    f1: &DVector<f64>,
) {
    let t2 = theta * theta;
    let t3 = t2 * theta;
    let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
    let h10 = t3 - 2.0 * t2 + theta;
    let h01 = -2.0 * t3 + 3.0 * t2;
    let h11 = t3 - t2;
    out.copy_from(y0);
    *out *= h00;
    *out += (h10 * hs) * f0;
    *out += h01 * y1;
    *out += (h11 * hs) * f1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Linear {
        lambda: f64,
    }

    impl OdeSystem for Linear {
        fn n_states(&self) -> usize {
            1
        }

        fn rhs(
            &mut self,
            _t: f64,
            y: &DVector<f64>,
            ydot: &mut DVector<f64>,
        ) -> Result<(), SimError> {
            ydot[0] = self.lambda * y[0];
            Ok(())
        }
    }

    struct DecayWithParam {
        k: f64,
    }

    impl OdeSystem for DecayWithParam {
        fn n_states(&self) -> usize {
            1
        }

        fn rhs(
            &mut self,
            _t: f64,
            y: &DVector<f64>,
            ydot: &mut DVector<f64>,
        ) -> Result<(), SimError> {
            ydot[0] = -self.k * y[0];
            Ok(())
        }

        fn perturb_independent(&mut self, _i: usize, delta: f64) {
            self.k += delta;
        }
    }

    fn tight_opts() -> SolverOptions {
        SolverOptions {
            abs_tol: 1e-9,
            rel_tol: 1e-7,
            max_step: 0.0,
            min_step: 0.0,
        }
    }

    #[test]
    fn test_exponential_decay() {
        let mut sys = Linear { lambda: -1.0 };
        let y0 = DVector::from_vec(vec![1.0]);
        let mut solver =
            BdfSolver::new(&mut sys, 0.0, y0, Vec::new(), tight_opts(), None, None).unwrap();
        while solver.time() < 2.0 {
            solver.one_step(&mut sys).unwrap();
        }
        let t = solver.time();
        assert_relative_eq!(solver.state()[0], (-t).exp(), epsilon = 1e-4);
    }

    #[test]
    fn test_stiff_decay() {
        let mut sys = Linear { lambda: -1000.0 };
        let y0 = DVector::from_vec(vec![1.0]);
        let mut solver =
            BdfSolver::new(&mut sys, 0.0, y0, Vec::new(), SolverOptions::default(), None, None)
                .unwrap();
        let mut steps = 0;
        while solver.time() < 1.0 {
            solver.one_step(&mut sys).unwrap();
            steps += 1;
            assert!(steps < 100_000, "stiff problem did not progress");
        }
        // Fully decayed and stable despite the stiffness.
        assert!(solver.state()[0].abs() < 1e-2);
    }

    #[test]
    fn test_dense_output() {
        let mut sys = Linear { lambda: -1.0 };
        let y0 = DVector::from_vec(vec![1.0]);
        let mut solver =
            BdfSolver::new(&mut sys, 0.0, y0, Vec::new(), tight_opts(), None, None).unwrap();
        let mut out = DVector::zeros(1);
        while solver.time() < 1.0 {
            let before = solver.time();
            solver.one_step(&mut sys).unwrap();
            let mid = 0.5 * (before + solver.time());
            solver.interpolate(mid, &mut out).unwrap();
            assert_relative_eq!(out[0], (-mid).exp(), epsilon = 1e-4);
        }
        // Outside the last step is an input error.
        assert!(matches!(
            solver.interpolate(solver.time() + 1.0, &mut out),
            Err(SimError::IntegratorInput(_))
        ));
    }

    #[test]
    fn test_root_detection() {
        let mut sys = Linear { lambda: -1.0 };
        let y0 = DVector::from_vec(vec![1.0]);
        let root = Some(RootSpec {
            index: 0,
            threshold: 0.5,
        });
        let mut solver =
            BdfSolver::new(&mut sys, 0.0, y0, Vec::new(), tight_opts(), root, None).unwrap();
        let mut found = None;
        while solver.time() < 2.0 {
            let result = solver.one_step(&mut sys).unwrap();
            if let Some(event) = result.root {
                found = Some((result.t, event.direction));
                break;
            }
        }
        let (tr, direction) = found.expect("no root found");
        assert_eq!(direction, -1);
        assert_relative_eq!(tr, 2.0_f64.ln(), epsilon = 1e-4);
        assert_relative_eq!(solver.state()[0], 0.5, epsilon = 1e-4);
    }

    #[test]
    fn test_forward_sensitivity() {
        let mut sys = DecayWithParam { k: 1.0 };
        let y0 = DVector::from_vec(vec![1.0]);
        let s0 = vec![DVector::from_vec(vec![0.0])];
        let sens = Some(SensSetup {
            is_parameter: vec![true],
            pbar: vec![1.0],
        });
        let mut solver =
            BdfSolver::new(&mut sys, 0.0, y0, s0, tight_opts(), None, sens).unwrap();
        while solver.time() < 1.0 {
            solver.one_step(&mut sys).unwrap();
        }
        let t = solver.time();
        // d/dk of exp(-k t) at k=1 is -t exp(-t).
        assert_relative_eq!(solver.sensitivities()[0][0], -t * (-t).exp(), epsilon = 1e-3);
    }

    #[test]
    fn test_reinit_discards_history() {
        let mut sys = Linear { lambda: -1.0 };
        let y0 = DVector::from_vec(vec![1.0]);
        let mut solver =
            BdfSolver::new(&mut sys, 0.0, y0, Vec::new(), tight_opts(), None, None).unwrap();
        for _ in 0..5 {
            solver.one_step(&mut sys).unwrap();
        }
        let restart = DVector::from_vec(vec![2.0]);
        solver.reinit(&mut sys, 10.0, &restart, &[]).unwrap();
        assert_eq!(solver.time(), 10.0);
        assert_eq!(solver.state()[0], 2.0);
        while solver.time() < 11.0 {
            solver.one_step(&mut sys).unwrap();
        }
        let t = solver.time();
        assert_relative_eq!(solver.state()[0], 2.0 * (-(t - 10.0)).exp(), epsilon = 1e-4);
    }
}
