use nalgebra::DMatrix;

use crate::model::{CellModel, Independent, Variables};

/// A one-state exponential decay model with a driven source term.
///
/// The state `env.y` follows `dy/dt = amp * pace - (k / tau) * y`, with the
/// decay rate `env.k` declared as a sensitivity parameter. Small enough to
/// verify against closed-form solutions: with no pacing,
/// `y(t) = y0 * exp(-k t / tau)` and `dy/dk = -(t / tau) * y(t)`.
#[derive(Clone, Copy, Debug)]
pub struct ExpDecay {
    y0: f64,
}

impl Default for ExpDecay {
    fn default() -> Self {
        Self { y0: 1.0 }
    }
}

impl ExpDecay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_state(y0: f64) -> Self {
        Self { y0 }
    }
}

const STATE_NAMES: &[&str] = &["env.y"];
const INTERMEDIARY_NAMES: &[&str] = &["env.drive", "env.rate"];

impl CellModel for ExpDecay {
    fn name(&self) -> &str {
        "exp-decay"
    }

    fn n_states(&self) -> usize {
        1
    }

    fn n_intermediary(&self) -> usize {
        2
    }

    fn n_literals(&self) -> usize {
        2
    }

    fn n_literal_derived(&self) -> usize {
        1
    }

    fn n_parameters(&self) -> usize {
        1
    }

    fn n_parameter_derived(&self) -> usize {
        1
    }

    fn ns_intermediary(&self) -> usize {
        1
    }

    fn state_names(&self) -> &[&str] {
        STATE_NAMES
    }

    fn intermediary_names(&self) -> &[&str] {
        INTERMEDIARY_NAMES
    }

    fn initial_states(&self) -> Vec<f64> {
        vec![self.y0]
    }

    fn default_literals(&self) -> Vec<f64> {
        // env.tau, env.amp
        vec![1.0, 1.0]
    }

    fn default_parameters(&self) -> Vec<f64> {
        // env.k
        vec![1.0]
    }

    fn sensitivity_independents(&self) -> Vec<Independent> {
        vec![Independent::parameter(0)]
    }

    fn ns_dependents(&self) -> usize {
        2
    }

    fn evaluate_literal_derived(&self, vars: &mut Variables) {
        vars.literal_derived[0] = 1.0 / vars.literals[0];
    }

    fn evaluate_parameter_derived(&self, vars: &mut Variables) {
        vars.parameter_derived[0] = vars.parameters[0] * vars.literal_derived[0];
    }

    fn evaluate_derivatives(&self, vars: &mut Variables) {
        let y = vars.states[0];
        let pace = vars.bound.pace.first().copied().unwrap_or(0.0);
        let drive = vars.literals[1] * pace;
        let rate = drive - vars.parameter_derived[0] * y;
        vars.intermediary[0] = drive;
        vars.intermediary[1] = rate;
        vars.derivatives[0] = rate;
    }

    fn evaluate_sensitivity_outputs(&self, vars: &mut Variables) {
        let s_y = vars.s_states[0];
        let y = vars.states[0];
        vars.s_intermediary[0] = -vars.parameter_derived[0] * s_y - vars.literal_derived[0] * y;
    }

    fn sensitivity_matrix(&self, vars: &Variables) -> DMatrix<f64> {
        DMatrix::from_row_slice(2, 1, &[vars.s_states[0], vars.s_intermediary[0]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Model;
    use approx::assert_relative_eq;
    use std::sync::Arc;

    #[test]
    fn test_rate_and_sensitivity_outputs() {
        let mut model = Model::new(Arc::new(ExpDecay::with_initial_state(2.0))).unwrap();
        model.setup_pacing(1);
        model.set_bound_variables(0.0, &[0.5], 0.0, 0.0);
        model.evaluate_derivatives();
        // rate = amp * pace - k / tau * y = 0.5 - 2.0
        assert_relative_eq!(model.vars.derivatives[0], -1.5, epsilon = 1e-12);

        model.set_state_sensitivities(0, &[0.25]);
        model.evaluate_sensitivity_outputs();
        // d(rate)/dk = -kn * s - y / tau
        assert_relative_eq!(model.vars.s_intermediary[0], -2.25, epsilon = 1e-12);

        let matrix = model.template().sensitivity_matrix(&model.vars);
        assert_eq!(matrix.nrows(), 2);
        assert_eq!(matrix.ncols(), 1);
        assert_relative_eq!(matrix[(0, 0)], 0.25, epsilon = 1e-12);
    }
}
