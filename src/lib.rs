/*! # myosim

An ODE-based cardiac cell model simulator. Given a hand-compiled cell model
template, a set of pacing protocols and a logging configuration, the
simulation driver advances the model from an initial to a final time with an
adaptive implicit integrator, interleaving pacing-event handling, root
detection on a designated state variable, dynamic or scheduled sampling, and
optional forward-sensitivity propagation.

The host-facing surface is [`sim::Simulation`]: configure it, `init` a run,
call `step` until it reports completion (control is returned cooperatively
after every batch of integrator steps), and read the results out of the
shared buffers supplied in the [`sim::SimConfig`].
*/

/// The error enumeration for the whole crate.
pub mod errors;
pub use crate::errors::SimError;

/// Model record, evaluator trait and the bundled cell model templates.
pub mod model;

/// Event-based and time-series pacing systems.
pub mod pacing;

/// The adaptive implicit integrator and its coupling trait.
pub mod solver;

/// The simulation driver, logging sinks and benchmarker.
pub mod sim;

pub use crate::sim::{eval_derivatives, SimConfig, Simulation, StepOutcome};
