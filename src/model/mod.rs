use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::DMatrix;

use crate::errors::SimError;
use crate::sim::logging::{LogBuffer, SensBuffer};

/// The Luo-Rudy 1991 ventricular action potential model.
pub mod lr1991;
pub use self::lr1991::Lr1991;

/// A one-state exponential decay model with a sensitivity parameter.
pub mod decay;
pub use self::decay::ExpDecay;

/// Externally driven inputs to a cell model.
#[derive(Clone, Debug, Default)]
pub struct Bound {
    pub time: f64,
    pub pace: Vec<f64>,
    pub realtime: f64,
    pub evaluations: f64,
}

/// Storage for every variable group of a cell model.
///
/// The groups are disjoint: no variable is both a literal and a parameter,
/// nor both a state and an intermediary. `derivatives` and `intermediary` are
/// functions of `(states, bound, constants)` alone and are produced together
/// by a single call to `evaluate_derivatives`.
#[derive(Clone, Debug)]
pub struct Variables {
    pub states: Vec<f64>,
    pub derivatives: Vec<f64>,
    pub intermediary: Vec<f64>,
    pub bound: Bound,
    pub literals: Vec<f64>,
    pub literal_derived: Vec<f64>,
    pub parameters: Vec<f64>,
    pub parameter_derived: Vec<f64>,
    /// Row-major `ns_independents x n_states` matrix of state sensitivities.
    pub s_states: Vec<f64>,
    /// Intermediary sensitivities used in the sensitivity outputs.
    pub s_intermediary: Vec<f64>,
}

/// Which storage group a sensitivity independent lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndependentGroup {
    Parameter,
    InitialState,
}

/// A sensitivity independent, identified by group and index.
///
/// For a `Parameter` independent the referenced value is `parameters[index]`;
/// for an `InitialState` independent it is the *current* `states[index]` (the
/// initial value is only semantically distinct at the start of a run).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Independent {
    pub group: IndependentGroup,
    pub index: usize,
}

impl Independent {
    pub fn parameter(index: usize) -> Self {
        Self {
            group: IndependentGroup::Parameter,
            index,
        }
    }

    pub fn initial_state(index: usize) -> Self {
        Self {
            group: IndependentGroup::InitialState,
            index,
        }
    }
}

/// The contract of a hand-compiled cell model template.
///
/// A template declares the size and names of every variable group, supplies
/// default values, and provides the closed-form evaluation routines that keep
/// the derived groups consistent. Templates are stateless: all storage lives
/// in a [`Variables`] record owned by the [`Model`].
pub trait CellModel: Send + Sync {
    fn name(&self) -> &str;

    /// Whether any state is integrated. When false the system is algebraic
    /// and the driver skips the integrator entirely.
    fn is_ode(&self) -> bool {
        true
    }

    fn n_states(&self) -> usize;
    fn n_intermediary(&self) -> usize;
    fn n_literals(&self) -> usize;
    fn n_literal_derived(&self) -> usize;
    fn n_parameters(&self) -> usize {
        0
    }
    fn n_parameter_derived(&self) -> usize {
        0
    }
    fn ns_intermediary(&self) -> usize {
        0
    }

    /// Fully qualified state variable names, in storage order.
    fn state_names(&self) -> &[&str];
    /// Fully qualified intermediary variable names, in storage order.
    fn intermediary_names(&self) -> &[&str];

    fn initial_states(&self) -> Vec<f64>;
    fn default_literals(&self) -> Vec<f64>;
    fn default_parameters(&self) -> Vec<f64> {
        Vec::new()
    }

    /// The independents `x` for which sensitivities `dy/dx` are propagated.
    fn sensitivity_independents(&self) -> Vec<Independent> {
        Vec::new()
    }

    /// The number of dependent outputs `y` in the sensitivity matrix.
    fn ns_dependents(&self) -> usize {
        0
    }

    fn evaluate_literal_derived(&self, vars: &mut Variables);
    fn evaluate_parameter_derived(&self, _vars: &mut Variables) {}

    /// Computes `intermediary` and `derivatives` from the current states,
    /// bound inputs and constants in a single dependency-ordered pass.
    fn evaluate_derivatives(&self, vars: &mut Variables);

    /// Computes `s_intermediary` from `s_states` and the current model state.
    fn evaluate_sensitivity_outputs(&self, _vars: &mut Variables) {}

    /// A snapshot of the sensitivity outputs: `ns_dependents` rows, one per
    /// dependent, by `ns_independents` columns.
    fn sensitivity_matrix(&self, _vars: &Variables) -> DMatrix<f64> {
        DMatrix::zeros(0, 0)
    }
}

/// One resolved logging binding: a variable source wired to a sink.
#[derive(Clone, Debug)]
enum Source {
    State(usize),
    Derivative(usize),
    Time,
    Pace(usize),
    Realtime,
    Evaluations,
    Intermediary(usize),
}

#[derive(Debug, Default)]
struct Bindings {
    entries: Vec<(Source, LogBuffer)>,
    states: bool,
    derivatives: bool,
    bound: bool,
    intermediary: bool,
}

/// The simulation-wide mutable model record.
///
/// Couples a template with the storage for all of its variable groups, and
/// keeps the derived groups consistent: setters detect changes and trigger
/// the dependent re-evaluations (a changed literal re-evaluates the literal-
/// and parameter-derived constants, a changed parameter the parameter-derived
/// constants).
pub struct Model {
    template: Arc<dyn CellModel>,
    pub vars: Variables,
    pub is_ode: bool,
    pub has_sensitivities: bool,
    independents: Vec<Independent>,
    log: Option<Bindings>,
}

impl Model {
    /// Creates a model with default values and consistent derived groups.
    pub fn new(template: Arc<dyn CellModel>) -> Result<Self, SimError> {
        let n_states = template.n_states();
        let states = template.initial_states();
        let literals = template.default_literals();
        let parameters = template.default_parameters();
        if states.len() != n_states {
            return Err(SimError::InvalidModel(format!(
                "template declares {} states but provides {} initial values",
                n_states,
                states.len()
            )));
        }
        if literals.len() != template.n_literals() {
            return Err(SimError::InvalidModel(format!(
                "template declares {} literals but provides {} default values",
                template.n_literals(),
                literals.len()
            )));
        }
        if parameters.len() != template.n_parameters() {
            return Err(SimError::InvalidModel(format!(
                "template declares {} parameters but provides {} default values",
                template.n_parameters(),
                parameters.len()
            )));
        }
        let independents = template.sensitivity_independents();
        for ind in &independents {
            let bound = match ind.group {
                IndependentGroup::Parameter => template.n_parameters(),
                IndependentGroup::InitialState => n_states,
            };
            if ind.index >= bound {
                return Err(SimError::InvalidModel(format!(
                    "sensitivity independent index {} out of range",
                    ind.index
                )));
            }
        }
        let mut vars = Variables {
            states,
            derivatives: vec![0.0; n_states],
            intermediary: vec![0.0; template.n_intermediary()],
            bound: Bound::default(),
            literals,
            literal_derived: vec![0.0; template.n_literal_derived()],
            parameters,
            parameter_derived: vec![0.0; template.n_parameter_derived()],
            s_states: vec![0.0; independents.len() * n_states],
            s_intermediary: vec![0.0; template.ns_intermediary()],
        };
        template.evaluate_literal_derived(&mut vars);
        template.evaluate_parameter_derived(&mut vars);
        let is_ode = template.is_ode();
        let has_sensitivities = !independents.is_empty();
        Ok(Self {
            template,
            vars,
            is_ode,
            has_sensitivities,
            independents,
            log: None,
        })
    }

    pub fn template(&self) -> &Arc<dyn CellModel> {
        &self.template
    }

    pub fn n_states(&self) -> usize {
        self.vars.states.len()
    }

    pub fn n_pace(&self) -> usize {
        self.vars.bound.pace.len()
    }

    pub fn ns_independents(&self) -> usize {
        self.independents.len()
    }

    pub fn independents(&self) -> &[Independent] {
        &self.independents
    }

    /// The current value referenced by the `i`-th sensitivity independent.
    pub fn independent_value(&self, i: usize) -> f64 {
        let ind = self.independents[i];
        match ind.group {
            IndependentGroup::Parameter => self.vars.parameters[ind.index],
            IndependentGroup::InitialState => self.vars.states[ind.index],
        }
    }

    /// Allocates the pacing channels driven by the protocols.
    pub fn setup_pacing(&mut self, n_pace: usize) {
        self.vars.bound.pace = vec![0.0; n_pace];
    }

    /// Copies `values` into the literals; on any change the literal-derived
    /// and parameter-derived constants are recomputed.
    pub fn set_literal_variables(&mut self, values: &[f64]) -> Result<(), SimError> {
        if values.len() != self.vars.literals.len() {
            return Err(SimError::InvalidArgumentShape(format!(
                "expected {} literal values, got {}",
                self.vars.literals.len(),
                values.len()
            )));
        }
        if self.vars.literals != values {
            self.vars.literals.copy_from_slice(values);
            self.template.evaluate_literal_derived(&mut self.vars);
            self.template.evaluate_parameter_derived(&mut self.vars);
        }
        Ok(())
    }

    /// Copies `values` into the parameters; on any change the parameter-
    /// derived constants are recomputed.
    pub fn set_parameters(&mut self, values: &[f64]) -> Result<(), SimError> {
        if values.len() != self.vars.parameters.len() {
            return Err(SimError::InvalidArgumentShape(format!(
                "expected {} parameter values, got {}",
                self.vars.parameters.len(),
                values.len()
            )));
        }
        if self.vars.parameters != values {
            self.vars.parameters.copy_from_slice(values);
            self.template.evaluate_parameter_derived(&mut self.vars);
        }
        Ok(())
    }

    /// Copies the parameter-tagged entries of an independents vector into the
    /// parameters, ignoring initial-state entries.
    pub fn set_parameters_from_independents(&mut self, values: &[f64]) -> Result<(), SimError> {
        if values.len() != self.independents.len() {
            return Err(SimError::InvalidArgumentShape(format!(
                "expected {} independent values, got {}",
                self.independents.len(),
                values.len()
            )));
        }
        let mut changed = false;
        for (ind, value) in self.independents.iter().zip(values) {
            if ind.group == IndependentGroup::Parameter
                && self.vars.parameters[ind.index] != *value
            {
                self.vars.parameters[ind.index] = *value;
                changed = true;
            }
        }
        if changed {
            self.template.evaluate_parameter_derived(&mut self.vars);
        }
        Ok(())
    }

    /// Adds `delta` to one parameter and recomputes its derived constants.
    /// Used by the integrator's difference-quotient sensitivity columns.
    pub fn nudge_parameter(&mut self, index: usize, delta: f64) {
        self.vars.parameters[index] += delta;
        self.template.evaluate_parameter_derived(&mut self.vars);
    }

    pub fn set_bound_variables(&mut self, time: f64, pace: &[f64], realtime: f64, evaluations: f64) {
        self.vars.bound.time = time;
        self.vars.bound.pace.copy_from_slice(pace);
        self.vars.bound.realtime = realtime;
        self.vars.bound.evaluations = evaluations;
    }

    pub fn set_states(&mut self, values: &[f64]) {
        self.vars.states.copy_from_slice(values);
    }

    pub fn evaluate_literal_derived(&mut self) {
        self.template.evaluate_literal_derived(&mut self.vars);
    }

    pub fn evaluate_parameter_derived(&mut self) {
        self.template.evaluate_parameter_derived(&mut self.vars);
    }

    pub fn evaluate_derivatives(&mut self) {
        self.template.evaluate_derivatives(&mut self.vars);
    }

    /// Copies `values` into row `i` of the state sensitivity matrix.
    pub fn set_state_sensitivities(&mut self, i: usize, values: &[f64]) {
        let n = self.vars.states.len();
        self.vars.s_states[i * n..(i + 1) * n].copy_from_slice(values);
    }

    pub fn evaluate_sensitivity_outputs(&mut self) {
        self.template.evaluate_sensitivity_outputs(&mut self.vars);
    }

    /// Resolves every key of the caller's log mapping against the known
    /// variable names, family by family: states, then derivatives, then
    /// bound variables, then intermediaries.
    pub fn initialize_logging(&mut self, log: &HashMap<String, LogBuffer>) -> Result<(), SimError> {
        if self.log.is_some() {
            return Err(SimError::InvalidModel(
                "logging initialized twice".to_string(),
            ));
        }
        let mut bindings = Bindings::default();
        let mut add = |name: String, source: Source| {
            if let Some(sink) = log.get(&name) {
                bindings.entries.push((source, sink.clone()));
                true
            } else {
                false
            }
        };

        for (i, name) in self.template.state_names().iter().enumerate() {
            bindings.states |= add(name.to_string(), Source::State(i));
        }
        for (i, name) in self.template.state_names().iter().enumerate() {
            bindings.derivatives |= add(format!("dot({name})"), Source::Derivative(i));
        }
        bindings.bound |= add("engine.time".to_string(), Source::Time);
        if !self.vars.bound.pace.is_empty() {
            bindings.bound |= add("engine.pace".to_string(), Source::Pace(0));
        }
        bindings.bound |= add("engine.realtime".to_string(), Source::Realtime);
        bindings.bound |= add("engine.evaluations".to_string(), Source::Evaluations);
        for (i, name) in self.template.intermediary_names().iter().enumerate() {
            bindings.intermediary |= add(name.to_string(), Source::Intermediary(i));
        }

        if bindings.entries.len() != log.len() {
            let mut known: Vec<String> = self
                .template
                .state_names()
                .iter()
                .map(|n| n.to_string())
                .collect();
            known.extend(self.template.state_names().iter().map(|n| format!("dot({n})")));
            known.push("engine.time".to_string());
            if !self.vars.bound.pace.is_empty() {
                known.push("engine.pace".to_string());
            }
            known.push("engine.realtime".to_string());
            known.push("engine.evaluations".to_string());
            known.extend(self.template.intermediary_names().iter().map(|n| n.to_string()));
            let mut unknown: Vec<&String> =
                log.keys().filter(|k| !known.contains(*k)).collect();
            unknown.sort();
            return Err(SimError::UnknownLoggedVariable(
                unknown
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            ));
        }
        self.log = Some(bindings);
        Ok(())
    }

    pub fn deinitialize_logging(&mut self) {
        self.log = None;
    }

    pub fn n_logged_variables(&self) -> usize {
        self.log.as_ref().map_or(0, |b| b.entries.len())
    }

    /// Whether the first registered sink is still empty. Used to decide the
    /// first-point log when continuing from an existing log.
    pub fn first_sink_empty(&self) -> bool {
        self.log
            .as_ref()
            .and_then(|b| b.entries.first())
            .map_or(true, |(_, sink)| sink.len() == 0)
    }

    pub fn logging_derivatives(&self) -> bool {
        self.log.as_ref().map_or(false, |b| b.derivatives)
    }

    pub fn logging_intermediary(&self) -> bool {
        self.log.as_ref().map_or(false, |b| b.intermediary)
    }

    pub fn logging_bound(&self) -> bool {
        self.log.as_ref().map_or(false, |b| b.bound)
    }

    /// Appends the current value of every bound variable source to its sink,
    /// in registration order.
    pub fn log(&self) -> Result<(), SimError> {
        let bindings = self.log.as_ref().ok_or_else(|| {
            SimError::InvalidModel("logging not initialized".to_string())
        })?;
        for (source, sink) in &bindings.entries {
            let value = match source {
                Source::State(i) => self.vars.states[*i],
                Source::Derivative(i) => self.vars.derivatives[*i],
                Source::Time => self.vars.bound.time,
                Source::Pace(i) => self.vars.bound.pace[*i],
                Source::Realtime => self.vars.bound.realtime,
                Source::Evaluations => self.vars.bound.evaluations,
                Source::Intermediary(i) => self.vars.intermediary[*i],
            };
            sink.append(value)?;
        }
        Ok(())
    }

    /// Appends an immutable snapshot of the sensitivity output matrix.
    pub fn log_sensitivity_matrix(&self, sink: &SensBuffer) -> Result<(), SimError> {
        sink.append(self.template.sensitivity_matrix(&self.vars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_detected_reevaluation() {
        let mut model = Model::new(Arc::new(ExpDecay::new())).unwrap();
        // Defaults: tau = 1, amp = 1, k = 1 -> inv_tau = 1, kn = 1.
        assert_eq!(model.vars.literal_derived[0], 1.0);
        assert_eq!(model.vars.parameter_derived[0], 1.0);

        // A literal change must propagate to both derived groups.
        model.set_literal_variables(&[2.0, 1.0]).unwrap();
        assert_eq!(model.vars.literal_derived[0], 0.5);
        assert_eq!(model.vars.parameter_derived[0], 0.5);

        // A parameter change reaches the parameter-derived group only.
        model.set_parameters(&[3.0]).unwrap();
        assert_eq!(model.vars.literal_derived[0], 0.5);
        assert_eq!(model.vars.parameter_derived[0], 1.5);
    }

    #[test]
    fn test_parameters_from_independents() {
        let mut model = Model::new(Arc::new(ExpDecay::new())).unwrap();
        model.set_parameters_from_independents(&[4.0]).unwrap();
        assert_eq!(model.vars.parameters[0], 4.0);
        assert_eq!(model.vars.parameter_derived[0], 4.0);
        assert!(model.set_parameters_from_independents(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_logging_resolution() {
        let mut model = Model::new(Arc::new(ExpDecay::new())).unwrap();
        model.setup_pacing(1);
        let mut log = HashMap::new();
        log.insert("env.y".to_string(), LogBuffer::new());
        log.insert("dot(env.y)".to_string(), LogBuffer::new());
        log.insert("engine.pace".to_string(), LogBuffer::new());
        log.insert("env.rate".to_string(), LogBuffer::new());
        model.initialize_logging(&log).unwrap();
        assert_eq!(model.n_logged_variables(), 4);
        assert!(model.logging_derivatives());
        assert!(model.logging_bound());
        assert!(model.logging_intermediary());

        model.log().unwrap();
        for sink in log.values() {
            assert_eq!(sink.len(), 1);
        }
    }

    #[test]
    fn test_unknown_logged_variable() {
        let mut model = Model::new(Arc::new(ExpDecay::new())).unwrap();
        let mut log = HashMap::new();
        log.insert("env.y".to_string(), LogBuffer::new());
        log.insert("nope.nope".to_string(), LogBuffer::new());
        match model.initialize_logging(&log) {
            Err(SimError::UnknownLoggedVariable(names)) => assert_eq!(names, "nope.nope"),
            other => panic!("expected UnknownLoggedVariable, got {other:?}"),
        }
    }

    #[test]
    fn test_independent_value_tracks_current_state() {
        let mut model = Model::new(Arc::new(ExpDecay::new())).unwrap();
        assert_eq!(model.independent_value(0), 1.0);
        model.set_parameters(&[2.5]).unwrap();
        assert_eq!(model.independent_value(0), 2.5);
    }
}
