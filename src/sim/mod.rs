use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use nalgebra::DVector;

use crate::errors::SimError;
use crate::model::{CellModel, IndependentGroup, Model};
use crate::pacing::{times_close, Pacing, Protocol};
use crate::solver::{BdfSolver, OdeSystem, RootSpec, SensSetup, SolverOptions};

/// Boundary containers: shared log, sensitivity, root and state buffers.
pub mod logging;
pub use self::logging::{LogBuffer, MatrixBuffer, RootBuffer, RootCrossing, SensBuffer};

/// Wall-clock access for the `engine.realtime` bound variable.
pub mod benchmark;
pub use self::benchmark::Benchmarker;

/// Consecutive zero-length integrator steps tolerated before giving up.
const MAX_ZERO_STEPS: u32 = 500;

/// Accepted integrator steps per `step()` call before control is returned
/// to the host.
const STEPS_PER_YIELD: u32 = 100;

/// Root-finding request: watch `states[index] - threshold` and record every
/// crossing in `sink`.
#[derive(Clone, Debug)]
pub struct RootConfig {
    pub index: usize,
    pub threshold: f64,
    pub sink: RootBuffer,
}

/// The full request handed to [`Simulation::init`].
///
/// `state` doubles as input and output: it supplies the initial state and
/// receives the final (or, on error, last-good) state. `s_state` does the
/// same for the sensitivity matrix. Empty input buffers select the
/// template's default initial values.
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub tmin: f64,
    pub tmax: f64,
    pub state: LogBuffer,
    pub s_state: MatrixBuffer,
    pub bound_out: LogBuffer,
    pub literals: Vec<f64>,
    pub parameters: Vec<f64>,
    pub protocols: Vec<Protocol>,
    pub log: HashMap<String, LogBuffer>,
    /// Selects periodic logging when positive.
    pub log_interval: f64,
    /// Selects point-list logging when present (and `log_interval <= 0`).
    pub log_times: Option<Vec<f64>>,
    pub sens_out: Option<SensBuffer>,
    pub root_finding: Option<RootConfig>,
    pub benchmarker: Option<Benchmarker>,
    pub log_realtime: bool,
    /// The host's signal facility, polled once per loop iteration.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl SimConfig {
    pub fn new(tmin: f64, tmax: f64) -> Self {
        Self {
            tmin,
            tmax,
            state: LogBuffer::new(),
            s_state: MatrixBuffer::new(),
            bound_out: LogBuffer::new(),
            literals: Vec::new(),
            parameters: Vec::new(),
            protocols: Vec::new(),
            log: HashMap::new(),
            log_interval: 0.0,
            log_times: None,
            sens_out: None,
            root_finding: None,
            benchmarker: None,
            log_realtime: false,
            cancel: None,
        }
    }
}

/// What a `step()` call reported back to the host.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StepOutcome {
    /// Control returned after a batch of integrator steps; call `step()`
    /// again to resume at the carried time.
    Yielded(f64),
    /// The simulation reached its final time and has been torn down.
    Finished(f64),
}

impl StepOutcome {
    pub fn time(&self) -> f64 {
        match self {
            StepOutcome::Yielded(t) | StepOutcome::Finished(t) => *t,
        }
    }
}

#[derive(Clone, Debug)]
enum LogMode {
    Dynamic,
    Periodic { interval: f64 },
    PointList { times: Vec<f64> },
}

/// The per-run state owned by the driver between `init` and `clean`.
struct Run {
    model: Model,
    pacing: Vec<Pacing>,
    pace: Vec<f64>,
    solver: Option<BdfSolver>,
    y: DVector<f64>,
    sy: Vec<DVector<f64>>,
    ylast: DVector<f64>,
    /// Scratch vectors for interpolation logging, so sampling never
    /// disturbs the integrator state.
    z: DVector<f64>,
    sz: Vec<DVector<f64>>,
    t: f64,
    tlast: f64,
    tnext: f64,
    tmin: f64,
    tmax: f64,
    mode: LogMode,
    tlog: f64,
    ilog: u64,
    zero_step_count: u32,
    state_out: LogBuffer,
    s_state_out: MatrixBuffer,
    bound_out: LogBuffer,
    sens_out: Option<SensBuffer>,
    root_sink: Option<RootBuffer>,
    cancel: Option<Arc<AtomicBool>>,
    benchmarker: Option<Benchmarker>,
    log_realtime: bool,
    realtime_start: f64,
    realtime: f64,
}

/// The coupling of model and pacing handed to the integrator: evaluates the
/// model RHS at arbitrary `(t, y)`, sampling time-series pacing at the exact
/// evaluation time.
struct SimSystem<'a> {
    model: &'a mut Model,
    pacing: &'a [Pacing],
    pace: &'a mut [f64],
    evaluations: &'a mut u64,
    realtime: f64,
}

impl SimSystem<'_> {
    /// Brings the model up to date at `(t, y)` without producing a
    /// derivative vector: refreshes bound inputs, states, intermediaries
    /// and derivatives in the model record.
    fn refresh(&mut self, t: f64, y: &DVector<f64>) {
        for (i, p) in self.pacing.iter().enumerate() {
            if let Pacing::TimeSeries(ts) = p {
                self.pace[i] = ts.level_at(t);
            }
        }
        *self.evaluations += 1;
        self.model
            .set_bound_variables(t, self.pace, self.realtime, *self.evaluations as f64);
        self.model.set_states(y.as_slice());
        self.model.evaluate_derivatives();
    }
}

impl OdeSystem for SimSystem<'_> {
    fn n_states(&self) -> usize {
        self.model.n_states()
    }

    fn rhs(&mut self, t: f64, y: &DVector<f64>, ydot: &mut DVector<f64>) -> Result<(), SimError> {
        self.refresh(t, y);
        ydot.copy_from_slice(&self.model.vars.derivatives);
        Ok(())
    }

    fn perturb_independent(&mut self, i: usize, delta: f64) {
        let ind = self.model.independents()[i];
        if ind.group == IndependentGroup::Parameter {
            self.model.nudge_parameter(ind.index, delta);
        }
    }
}

/// At most one live simulation per process: taken by `init`, released by
/// `clean`.
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// The simulation driver.
///
/// Proper sequence is `init()`, repeated `step()` calls until
/// [`StepOutcome::Finished`], then `clean()` (which `step` performs itself
/// on completion or error). Tolerances and step bounds apply to the next
/// `init`.
pub struct Simulation {
    template: Arc<dyn CellModel>,
    abs_tol: f64,
    rel_tol: f64,
    dt_max: f64,
    dt_min: f64,
    steps: u64,
    evaluations: u64,
    run: Option<Run>,
}

impl Simulation {
    pub fn new(template: Arc<dyn CellModel>) -> Self {
        Self {
            template,
            abs_tol: 1e-6,
            rel_tol: 1e-4,
            dt_max: 0.0,
            dt_min: 0.0,
            steps: 0,
            evaluations: 0,
            run: None,
        }
    }

    /// Sets the absolute and relative solver tolerances.
    pub fn set_tolerance(&mut self, abs_tol: f64, rel_tol: f64) {
        self.abs_tol = abs_tol;
        self.rel_tol = rel_tol;
    }

    /// Sets the maximum solver step size; a value of zero or less disables
    /// the bound.
    pub fn set_max_step_size(&mut self, value: f64) {
        self.dt_max = value;
    }

    /// Sets the minimum solver step size; a value of zero or less disables
    /// the bound.
    pub fn set_min_step_size(&mut self, value: f64) {
        self.dt_min = value;
    }

    /// The number of integrator steps taken since the last `init`.
    pub fn number_of_steps(&self) -> u64 {
        self.steps
    }

    /// The number of RHS evaluations performed since the last `init`.
    pub fn number_of_evaluations(&self) -> u64 {
        self.evaluations
    }

    pub fn is_initialized(&self) -> bool {
        self.run.is_some()
    }

    /// Validates the request and brings up the whole run: model, pacing
    /// systems, integrator, logging mode, and the first-point log where
    /// dynamic logging selects one.
    pub fn init(&mut self, config: SimConfig) -> Result<(), SimError> {
        if self.run.is_some() {
            return Err(SimError::AlreadyInitialized);
        }
        if INITIALIZED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SimError::AlreadyInitialized);
        }
        match self.init_inner(config) {
            Ok(run) => {
                self.run = Some(run);
                Ok(())
            }
            Err(e) => {
                INITIALIZED.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn init_inner(&mut self, config: SimConfig) -> Result<Run, SimError> {
        let tmin = config.tmin;
        let tmax = config.tmax;
        info!("preparing to simulate from {} to {}", tmin, tmax);

        self.steps = 0;
        self.evaluations = 0;

        let mut model = Model::new(self.template.clone())?;
        let n_states = model.n_states();
        let n_pace = config.protocols.len();
        model.setup_pacing(n_pace);
        let is_ode = model.is_ode;
        let has_sens = model.has_sensitivities;
        let ns = model.ns_independents();

        // Initial state.
        let state_in = config.state.values();
        let y0: Vec<f64> = if state_in.is_empty() {
            self.template.initial_states()
        } else if state_in.len() == n_states {
            state_in
        } else {
            return Err(SimError::InvalidArgumentShape(format!(
                "expected {} state values, got {}",
                n_states,
                state_in.len()
            )));
        };
        model.set_states(&y0);

        // Initial state sensitivities.
        let mut sy0: Vec<DVector<f64>> = Vec::new();
        if has_sens {
            let rows_in = config.s_state.rows();
            let rows = if rows_in.is_empty() {
                vec![vec![0.0; n_states]; ns]
            } else {
                rows_in
            };
            if rows.len() != ns {
                return Err(SimError::InvalidArgumentShape(format!(
                    "expected {} sensitivity rows, got {}",
                    ns,
                    rows.len()
                )));
            }
            for (i, row) in rows.iter().enumerate() {
                if row.len() != n_states {
                    return Err(SimError::InvalidArgumentShape(format!(
                        "sensitivity row {} has {} entries, expected {}",
                        i,
                        row.len(),
                        n_states
                    )));
                }
                model.set_state_sensitivities(i, row);
                sy0.push(DVector::from_vec(row.clone()));
            }
        }

        // Constants: literals first (re-evaluating both derived groups),
        // then the sensitivity parameters.
        if !config.literals.is_empty() {
            model.set_literal_variables(&config.literals)?;
        }
        if !config.parameters.is_empty() {
            model.set_parameters(&config.parameters)?;
        }

        // Per-independent scaling for the sensitivity error control.
        let pbar: Vec<f64> = (0..ns)
            .map(|i| model.independent_value(i).abs().max(1.0))
            .collect();

        // Pacing systems; unless set by pacing, tnext is the final time.
        let mut pacing = Vec::with_capacity(n_pace);
        let mut pace = vec![0.0; n_pace];
        let mut tnext = tmax;
        for (i, protocol) in config.protocols.iter().enumerate() {
            let mut system = Pacing::from_protocol(protocol)?;
            system.advance_time(tmin)?;
            pace[i] = system.level();
            tnext = tnext.min(system.next_time());
            pacing.push(system);
        }

        // Integrator.
        let solver = if is_ode {
            let root = match &config.root_finding {
                Some(rf) => Some(RootSpec {
                    index: rf.index,
                    threshold: rf.threshold,
                }),
                None => None,
            };
            let sens = if has_sens {
                Some(SensSetup {
                    is_parameter: model
                        .independents()
                        .iter()
                        .map(|ind| ind.group == IndependentGroup::Parameter)
                        .collect(),
                    pbar,
                })
            } else {
                None
            };
            let opts = SolverOptions {
                abs_tol: self.abs_tol,
                rel_tol: self.rel_tol,
                max_step: self.dt_max,
                min_step: self.dt_min,
            };
            let mut sys = SimSystem {
                model: &mut model,
                pacing: &pacing,
                pace: &mut pace,
                evaluations: &mut self.evaluations,
                realtime: 0.0,
            };
            Some(BdfSolver::new(
                &mut sys,
                tmin,
                DVector::from_vec(y0.clone()),
                sy0.clone(),
                opts,
                root,
                sens,
            )?)
        } else {
            None
        };

        // Loss-of-precision check for periodic logging.
        if config.log_interval > 0.0 && tmax + config.log_interval == tmax {
            return Err(SimError::LogIntervalTooSmall);
        }

        // Wire the log sinks to the model variables.
        model.initialize_logging(&config.log)?;
        if has_sens && config.sens_out.is_none() {
            return Err(SimError::InvalidArgumentShape(
                "sensitivities are enabled but no sensitivity output was supplied".to_string(),
            ));
        }

        // Select the logging mode and its first logging point.
        let mode;
        let mut tlog = f64::INFINITY;
        let mut ilog: u64 = 0;
        if config.log_interval > 0.0 {
            mode = LogMode::Periodic {
                interval: config.log_interval,
            };
            tlog = tmin;
        } else if let Some(times) = &config.log_times {
            for v in times {
                if !v.is_finite() {
                    return Err(SimError::InvalidArgumentShape(
                        "entries in log_times must be finite".to_string(),
                    ));
                }
            }
            // Skip entries before the start time; the first remaining entry
            // becomes the next logging point.
            let mut next = tmin - 1.0;
            while (ilog as usize) < times.len() && next < tmin {
                next = times[ilog as usize];
                ilog += 1;
            }
            tlog = if next < tmin { f64::INFINITY } else { next };
            mode = LogMode::PointList {
                times: times.clone(),
            };
        } else {
            mode = LogMode::Dynamic;
            // Log the first point, but only when not continuing into an
            // existing log: otherwise the seam point would appear twice.
            if model.first_sink_empty() {
                let mut sys = SimSystem {
                    model: &mut model,
                    pacing: &pacing,
                    pace: &mut pace,
                    evaluations: &mut self.evaluations,
                    realtime: 0.0,
                };
                sys.refresh(tmin, &DVector::from_vec(y0.clone()));
                model.log()?;
                if has_sens {
                    model.evaluate_sensitivity_outputs();
                    model.log_sensitivity_matrix(config.sens_out.as_ref().unwrap())?;
                }
            }
        }

        let y = DVector::from_vec(y0);
        Ok(Run {
            ylast: y.clone(),
            z: DVector::zeros(n_states),
            sz: vec![DVector::zeros(n_states); ns],
            y,
            sy: sy0,
            model,
            pacing,
            pace,
            solver,
            t: tmin,
            tlast: tmin,
            tnext,
            tmin,
            tmax,
            mode,
            tlog,
            ilog,
            zero_step_count: 0,
            state_out: config.state,
            s_state_out: config.s_state,
            bound_out: config.bound_out,
            sens_out: config.sens_out,
            root_sink: config.root_finding.map(|rf| rf.sink),
            cancel: config.cancel,
            benchmarker: config.benchmarker.or_else(|| {
                if config.log_realtime {
                    Some(Benchmarker::new())
                } else {
                    None
                }
            }),
            log_realtime: config.log_realtime,
            realtime_start: 0.0,
            realtime: 0.0,
        })
    }

    /// Advances the simulation. Returns [`StepOutcome::Yielded`] with the
    /// current time after a batch of integrator steps, or
    /// [`StepOutcome::Finished`] once the final time is reached (after which
    /// the run has been torn down). On error the run is also torn down, with
    /// the last-good state written to the output buffers first.
    pub fn step(&mut self) -> Result<StepOutcome, SimError> {
        if self.run.is_none() {
            return Err(SimError::NotInitialized);
        }
        let result = self.step_inner();
        match &result {
            Ok(StepOutcome::Finished(_)) | Err(_) => self.clean(),
            Ok(StepOutcome::Yielded(_)) => {}
        }
        result
    }

    /// Runs `step()` to completion, ignoring cooperative yields.
    pub fn run(&mut self) -> Result<f64, SimError> {
        loop {
            match self.step()? {
                StepOutcome::Yielded(_) => continue,
                StepOutcome::Finished(t) => return Ok(t),
            }
        }
    }

    fn step_inner(&mut self) -> Result<StepOutcome, SimError> {
        let run = self.run.as_mut().expect("checked by step()");
        let has_sens = run.model.has_sensitivities;
        let ns = run.sy.len();

        // Realtime logging measures stepping only, not initialisation.
        if run.log_realtime && run.realtime_start == 0.0 {
            run.realtime_start = run.benchmarker.as_ref().map_or(0.0, |b| b.time());
        }

        let mut steps_taken: u32 = 0;
        loop {
            // Snapshot for error reporting.
            run.ylast.copy_from(&run.y);
            run.tlast = run.t;
            let mut flag_reinit = false;
            let mut root_hit = None;

            if run.model.is_ode {
                let result = {
                    let mut sys = SimSystem {
                        model: &mut run.model,
                        pacing: &run.pacing,
                        pace: &mut run.pace,
                        evaluations: &mut self.evaluations,
                        realtime: run.realtime,
                    };
                    run.solver.as_mut().expect("ODE run has a solver").one_step(&mut sys)
                };
                match result {
                    Ok(step) => {
                        run.t = step.t;
                        root_hit = step.root;
                        let solver = run.solver.as_ref().expect("ODE run has a solver");
                        run.y.copy_from(solver.state());
                        for (dst, src) in run.sy.iter_mut().zip(solver.sensitivities()) {
                            dst.copy_from(src);
                        }
                    }
                    Err(e) => {
                        // Surface the failure with the pre-step snapshot in
                        // the host's output buffers.
                        run.state_out.assign(run.ylast.as_slice());
                        let mut bound = vec![run.tlast, run.realtime, self.evaluations as f64];
                        bound.extend_from_slice(&run.pace);
                        run.bound_out.assign(&bound);
                        return Err(e);
                    }
                }
            } else {
                // No ODEs: jump straight to the next event (tnext can be
                // infinite, so never jump past the final time).
                run.t = if run.tmax > run.tnext { run.tnext } else { run.tmax };
            }

            // Zero-progress guard: only consecutive zero steps count.
            if run.t == run.tlast {
                run.zero_step_count += 1;
                if run.zero_step_count >= MAX_ZERO_STEPS {
                    return Err(SimError::ZeroStepLimit(run.t));
                }
            } else {
                run.zero_step_count = 0;
            }
            self.steps += 1;

            // Rewind past the pacing horizon, or record a root crossing.
            if run.model.is_ode {
                if run.t > run.tnext {
                    debug!("pacing horizon exceeded, rewinding to {}", run.tnext);
                    let solver = run.solver.as_mut().expect("ODE run has a solver");
                    solver.interpolate(run.tnext, &mut run.y)?;
                    if has_sens {
                        solver.interpolate_sens(run.tnext, &mut run.sy)?;
                    }
                    run.t = run.tnext;
                    flag_reinit = true;
                } else if let Some(event) = root_hit {
                    if let Some(sink) = &run.root_sink {
                        sink.append(RootCrossing {
                            time: run.t,
                            direction: event.direction,
                        })?;
                    }
                }
            }

            // Interpolated logging: emit every logging point passed by this
            // step. Periodic logging keeps the interval half-open (the
            // terminal point is never included); point-list logging includes
            // points that coincide with the current time.
            loop {
                let due = match &run.mode {
                    LogMode::Dynamic => false,
                    LogMode::Periodic { .. } => run.t > run.tlog,
                    LogMode::PointList { .. } => {
                        run.t > run.tlog || times_close(run.t, run.tlog)
                    }
                };
                if !due {
                    break;
                }
                if run.log_realtime {
                    run.realtime =
                        run.benchmarker.as_ref().map_or(0.0, |b| b.time()) - run.realtime_start;
                }
                if run.model.is_ode {
                    let solver = run.solver.as_mut().expect("ODE run has a solver");
                    solver.interpolate(run.tlog, &mut run.z)?;
                    if has_sens {
                        solver.interpolate_sens(run.tlog, &mut run.sz)?;
                    }
                } else {
                    run.z.copy_from(&run.y);
                }
                {
                    let mut sys = SimSystem {
                        model: &mut run.model,
                        pacing: &run.pacing,
                        pace: &mut run.pace,
                        evaluations: &mut self.evaluations,
                        realtime: run.realtime,
                    };
                    sys.refresh(run.tlog, &run.z);
                }
                run.model.log()?;
                if has_sens {
                    for i in 0..ns {
                        run.model.set_state_sensitivities(i, run.sz[i].as_slice());
                    }
                    run.model.evaluate_sensitivity_outputs();
                    run.model
                        .log_sensitivity_matrix(run.sens_out.as_ref().unwrap())?;
                }
                match &run.mode {
                    LogMode::Periodic { interval } => {
                        run.ilog = run.ilog.checked_add(1).ok_or(SimError::CountOverflow)?;
                        run.tlog = run.tmin + run.ilog as f64 * interval;
                    }
                    LogMode::PointList { times } => {
                        if (run.ilog as usize) < times.len() {
                            let proposed = times[run.ilog as usize];
                            if proposed < run.tlog {
                                return Err(SimError::LogTimesNonDecreasing);
                            }
                            run.tlog = proposed;
                            run.ilog += 1;
                        } else {
                            run.tlog = f64::INFINITY;
                        }
                    }
                    LogMode::Dynamic => unreachable!("dynamic mode has no logging points"),
                }
            }

            // Everything before time t is logged; the pacing systems may now
            // be advanced to t.
            run.tnext = run.tmax;
            for (i, system) in run.pacing.iter_mut().enumerate() {
                if let Pacing::Event(e) = system {
                    e.advance_time(run.t)?;
                    run.pace[i] = e.level();
                    run.tnext = run.tnext.min(e.next_time());
                }
            }

            // Dynamic logging: one row per visited point.
            if matches!(run.mode, LogMode::Dynamic) {
                if run.log_realtime {
                    run.realtime =
                        run.benchmarker.as_ref().map_or(0.0, |b| b.time()) - run.realtime_start;
                }
                if run.model.logging_derivatives()
                    || run.model.logging_intermediary()
                    || has_sens
                {
                    let mut sys = SimSystem {
                        model: &mut run.model,
                        pacing: &run.pacing,
                        pace: &mut run.pace,
                        evaluations: &mut self.evaluations,
                        realtime: run.realtime,
                    };
                    sys.refresh(run.t, &run.y);
                } else if run.model.logging_bound() {
                    // No derivatives or intermediaries in the log: refreshing
                    // the bound inputs is enough.
                    run.model.set_bound_variables(
                        run.t,
                        &run.pace,
                        run.realtime,
                        self.evaluations as f64,
                    );
                }
                run.model.log()?;
                if has_sens {
                    for i in 0..ns {
                        run.model.set_state_sensitivities(i, run.sy[i].as_slice());
                    }
                    run.model.evaluate_sensitivity_outputs();
                    run.model
                        .log_sensitivity_matrix(run.sens_out.as_ref().unwrap())?;
                }
            }

            // Restart the integrator after a pacing discontinuity.
            if run.model.is_ode && flag_reinit {
                let mut sys = SimSystem {
                    model: &mut run.model,
                    pacing: &run.pacing,
                    pace: &mut run.pace,
                    evaluations: &mut self.evaluations,
                    realtime: run.realtime,
                };
                run.solver
                    .as_mut()
                    .expect("ODE run has a solver")
                    .reinit(&mut sys, run.t, &run.y, &run.sy)?;
            }

            // Finished?
            if times_close(run.t, run.tmax) {
                run.t = run.tmax;
            }
            if run.t >= run.tmax {
                break;
            }

            // Cancellation requested by the host?
            if run.cancel.as_ref().map_or(false, |c| c.load(Ordering::SeqCst)) {
                return Err(SimError::Cancelled);
            }

            // Return control to the host after every batch of steps.
            steps_taken += 1;
            if steps_taken >= STEPS_PER_YIELD {
                return Ok(StepOutcome::Yielded(run.t));
            }
        }

        // Finished: write the final state, sensitivities and bound values.
        run.state_out.assign(run.y.as_slice());
        if has_sens {
            let rows: Vec<Vec<f64>> = run.sy.iter().map(|c| c.as_slice().to_vec()).collect();
            run.s_state_out.assign(&rows);
        }
        let mut bound = vec![run.t, run.realtime, self.evaluations as f64];
        bound.extend_from_slice(&run.pace);
        run.bound_out.assign(&bound);
        info!(
            "simulation finished at t={} after {} steps and {} evaluations",
            run.t, self.steps, self.evaluations
        );
        Ok(StepOutcome::Finished(run.t))
    }

    /// Tears down the current run, releasing every resource acquired by
    /// `init`. Idempotent.
    pub fn clean(&mut self) {
        if let Some(mut run) = self.run.take() {
            run.model.deinitialize_logging();
            INITIALIZED.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.clean();
    }
}

/// One-shot derivative evaluation on a transient model: sets the supplied
/// time, pacing levels, literals, parameters and states, evaluates the
/// derived constant groups and the derivatives, and writes the derivative
/// vector to `deriv_out`.
pub fn eval_derivatives(
    template: Arc<dyn CellModel>,
    t: f64,
    pace: &[f64],
    states: &[f64],
    deriv_out: &mut Vec<f64>,
    literals: &[f64],
    parameters: &[f64],
) -> Result<(), SimError> {
    let mut model = Model::new(template)?;
    model.setup_pacing(pace.len());
    model.set_bound_variables(t, pace, 0.0, 0.0);
    if !literals.is_empty() {
        model.set_literal_variables(literals)?;
    }
    model.evaluate_literal_derived();
    if !parameters.is_empty() {
        model.set_parameters(parameters)?;
    }
    model.evaluate_parameter_derived();
    if states.len() != model.n_states() {
        return Err(SimError::InvalidArgumentShape(format!(
            "expected {} state values, got {}",
            model.n_states(),
            states.len()
        )));
    }
    model.set_states(states);
    model.evaluate_derivatives();
    deriv_out.clear();
    deriv_out.extend_from_slice(&model.vars.derivatives);
    Ok(())
}
