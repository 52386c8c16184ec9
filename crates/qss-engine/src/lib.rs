//! The public entrypoint: wires a caller-supplied [`ModelBackend`] to the
//! rest of the workspace and drives it to completion.
//!
//! Everything the core needs to run a model lives behind the crates this
//! one re-exports; a caller who only depends on `qss-engine` never needs to
//! name `qss-sim`, `qss-var`, or `qss-graph` directly. Building the actual
//! variable/conditional wiring for a given model is still the caller's job
//! (an FMU importer, a hand-built test model, ...) — this crate only
//! forwards to [`qss_sim::SimulationBuilder`] and runs the result.

pub use qss_backend::{
    BackendError, BackendRef, BackendResult, BackendSeverity, EventInfo, InitError, ModelBackend,
};
pub use qss_graph::Category;
pub use qss_options::{DerivativeMode, LogLevel, Options, OptionsError, QssMethod};
pub use qss_sim::{RuntimeError, SimStats, Simulation, SimulationBuilder};
pub use qss_var::VarId;
pub use qss_zc::ConditionalId;

use tracing::{info, instrument};

/// Assemble and run a model in one call: build against `backend` and
/// `options` via `assemble`, then drive it to `options.t_end`. Most
/// embedders want [`SimulationBuilder`] directly (to interleave other
/// work between construction and `run`); this is the one-shot shorthand,
/// the same shape as an FMU-ME `pre_simulate`/`simulate`/`post_simulate`
/// sequence collapsed into a single call.
#[instrument(skip_all, fields(t_end = options.t_end, method = %options.qss_method))]
pub fn run_to_completion<B: ModelBackend>(
    backend: B,
    options: Options,
    assemble: impl FnOnce(&mut SimulationBuilder<B>),
) -> Result<SimStats, RuntimeError> {
    let mut builder = SimulationBuilder::new(backend, options);
    assemble(&mut builder);
    let mut sim = builder.build()?;
    info!(target: "qss.run", "simulation_built");
    let stats = sim.run()?;
    info!(
        target: "qss.run",
        steps = stats.steps,
        quantization_events = stats.quantization_events,
        zero_crossing_events = stats.zero_crossing_events,
        conditional_firings = stats.conditional_firings,
        final_time = stats.final_time,
        "simulation_complete"
    );
    Ok(stats)
}

/// The staged `pre_simulate`/`simulate`/`post_simulate` entrypoint an FMI-ME
/// style co-simulation master expects, as opposed to [`run_to_completion`]'s
/// one-shot shorthand: the caller controls when the loop resumes, and can
/// read every declared connected output's value in between.
///
/// [`Self::simulate`] hands control back at the next declared connected
/// output boundary (or `options.t_end`, whichever comes first) instead of
/// running the whole segment unattended — the same handoff point a master
/// algorithm would get back from an FMU's `doStep`. A model with no
/// connected outputs marked via [`SimulationBuilder::mark_connected_output`]
/// never reports a boundary, so a single `simulate` call runs to completion.
pub struct Driver<B: ModelBackend> {
    sim: Simulation<B>,
    t_end: f64,
}

impl<B: ModelBackend> Driver<B> {
    /// Assemble the model against `backend` and `options`. Mirrors an FMU
    /// importer's `fmi2EnterInitializationMode`/`fmi2ExitInitializationMode`
    /// pair: the model is fully wired and its first event is scheduled
    /// before this returns, but no time has advanced yet.
    #[instrument(skip_all, fields(t_end = options.t_end, method = %options.qss_method))]
    pub fn pre_simulate(
        backend: B,
        options: Options,
        assemble: impl FnOnce(&mut SimulationBuilder<B>),
    ) -> Result<Self, RuntimeError> {
        let t_end = options.t_end;
        let mut builder = SimulationBuilder::new(backend, options);
        assemble(&mut builder);
        let sim = builder.build()?;
        info!(target: "qss.run", "simulation_built");
        Ok(Self { sim, t_end })
    }

    /// Advance through the next connected-output segment, or to `t_end` if
    /// the model declares no connected outputs. Returns the cumulative
    /// stats as of this call; call again to resume past the boundary it
    /// just stopped at. A no-op once [`Self::is_finished`] is true.
    pub fn simulate(&mut self) -> Result<&SimStats, RuntimeError> {
        if self.is_finished() {
            return Ok(self.sim.stats());
        }
        self.sim.run_segment()?;
        Ok(self.sim.stats())
    }

    /// Whether the simulation has reached `t_end` or a backend-requested
    /// termination. Checks the queue rather than `self.sim.time()` directly,
    /// since the last dispatched event need not land exactly on `t_end`.
    pub fn is_finished(&self) -> bool {
        self.sim.time() >= self.t_end || self.sim.is_exhausted()
    }

    /// The variable's current continuous value, evaluated at the
    /// simulation's present time — the read side of a connected-output
    /// handoff.
    pub fn value(&self, id: VarId) -> f64 {
        self.sim.value(id)
    }

    /// The variable's value extrapolated to an arbitrary `t`, rather than
    /// the simulation's current time.
    pub fn value_at(&self, id: VarId, t: f64) -> f64 {
        self.sim.value_at(id, t)
    }

    pub fn time(&self) -> f64 {
        self.sim.time()
    }

    /// Log the final summary and hand back the accumulated stats. Mirrors
    /// an FMU importer's `fmi2Terminate`.
    pub fn post_simulate(self) -> SimStats {
        let stats = self.sim.stats().clone();
        info!(
            target: "qss.run",
            steps = stats.steps,
            quantization_events = stats.quantization_events,
            zero_crossing_events = stats.zero_crossing_events,
            conditional_firings = stats.conditional_firings,
            final_time = stats.final_time,
            "simulation_complete"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qss_backend::testkit::{ExponentialDecayBackend, HarmonicOscillatorBackend};

    #[test]
    fn run_to_completion_assembles_and_runs_a_single_state_model() {
        let mut options = Options::default();
        options.qss_method = QssMethod::Qss2;
        options.t_end = 5.0;

        let stats = run_to_completion(ExponentialDecayBackend::new(1.0, 100.0), options, |builder| {
            builder.add_state_variable("x", 100.0, 100.0).unwrap();
        })
        .unwrap();

        assert!(stats.steps > 0);
        assert!(stats.final_time > 0.0 && stats.final_time <= 5.0);
    }

    #[test]
    fn run_to_completion_wires_observer_edges_between_two_states() {
        let mut options = Options::default();
        options.qss_method = QssMethod::Qss3;
        options.t_end = 2.0 * std::f64::consts::PI;
        options.r_tol = 1.0e-6;

        let backend = HarmonicOscillatorBackend::new(1.0, 1.0, 0.0);
        let stats = run_to_completion(backend, options, |builder| {
            let x1 = builder.add_state_variable("x1", 1.0, 1.0).unwrap();
            let x2 = builder.add_state_variable("x2", 0.0, 1.0).unwrap();
            builder.observe(x1, x2);
            builder.observe(x2, x1);
        })
        .unwrap();

        assert!(stats.quantization_events > 0);
    }

    #[test]
    fn invalid_options_surface_as_a_runtime_error_before_any_events_run() {
        let mut options = Options::default();
        options.bin_frac = 10.0; // out of the (0, 1] range
        let result = run_to_completion(ExponentialDecayBackend::new(1.0, 1.0), options, |builder| {
            builder.add_state_variable("x", 1.0, 1.0).unwrap();
        });
        assert!(matches!(result, Err(RuntimeError::InvalidOptions(_))));
    }

    #[test]
    fn driver_stops_simulate_at_a_connected_output_boundary() {
        let mut options = Options::default();
        options.qss_method = QssMethod::Qss2;
        options.t_end = 5.0;

        let mut driver =
            Driver::pre_simulate(ExponentialDecayBackend::new(1.0, 100.0), options, |builder| {
                let x = builder.add_state_variable("x", 100.0, 100.0).unwrap();
                builder.mark_connected_output(x);
            })
            .unwrap();

        let mut segments = 0;
        while !driver.is_finished() {
            driver.simulate().unwrap();
            segments += 1;
            assert!(segments < 10_000, "driver never reached t_end");
        }

        assert!(segments > 1, "a connected output should yield more than one segment");
        assert!(driver.time() > 0.0 && driver.time() <= 5.0);
        let stats = driver.post_simulate();
        assert!(stats.final_time > 0.0 && stats.final_time <= 5.0);
    }

    #[test]
    fn driver_runs_to_completion_in_one_call_without_connected_outputs() {
        let mut options = Options::default();
        options.qss_method = QssMethod::Qss2;
        options.t_end = 5.0;

        let mut driver =
            Driver::pre_simulate(ExponentialDecayBackend::new(1.0, 100.0), options, |builder| {
                builder.add_state_variable("x", 100.0, 100.0).unwrap();
            })
            .unwrap();

        driver.simulate().unwrap();
        assert!(driver.is_finished());
        let stats = driver.post_simulate();
        assert!(stats.final_time > 0.0 && stats.final_time <= 5.0);
    }
}
