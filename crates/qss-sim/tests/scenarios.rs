//! End-to-end scenario tests driven straight against
//! `SimulationBuilder`/`Simulation`, the way a crate with no CLI or FMU
//! importer in front of it exercises its own event loop.

use qss_backend::testkit::{ChatterZcBackend, ExponentialDecayBackend, HarmonicOscillatorBackend, ReplicatedExponentialBackend};
use qss_options::{Options, QssMethod};
use qss_sim::SimulationBuilder;

/// S1 — single exponential decay, QSS2, tight enough tolerances to force
/// at least 50 requantizations over the run.
#[test]
fn s1_exponential_decay_matches_closed_form_within_tolerance() {
    let mut options = Options::default();
    options.qss_method = QssMethod::Qss2;
    options.r_tol = 1.0e-4;
    options.a_tol = Some(1.0e-6);
    options.t_end = 10.0;

    let mut builder = SimulationBuilder::new(ExponentialDecayBackend::new(1.0, 1.0), options);
    let x = builder.add_state_variable("x", 1.0, 1.0).unwrap();
    let mut sim = builder.build().unwrap();
    let stats = sim.run().unwrap();

    let exact = (-10.0_f64).exp();
    let got = sim.value_at(x, 10.0);
    assert!((got - exact).abs() <= 1.0e-3, "x(10) = {got}, exact = {exact}");
    assert!(stats.quantization_events >= 50, "expected >= 50 requantizations, got {}", stats.quantization_events);
}

/// S2 — harmonic oscillator, QSS3, checked for energy conservation at
/// every segment boundary (both states are declared connected outputs, so
/// `run_segment` hands control back after every batch) and for returning
/// to its starting point after one full period.
#[test]
fn s2_harmonic_oscillator_conserves_energy_over_one_period() {
    let mut options = Options::default();
    options.qss_method = QssMethod::Qss3;
    options.r_tol = 1.0e-6;
    options.t_end = 2.0 * std::f64::consts::PI;
    options.perfect = true;

    let mut builder = SimulationBuilder::new(HarmonicOscillatorBackend::new(1.0, 1.0, 0.0), options);
    let x1 = builder.add_state_variable("x1", 1.0, 1.0).unwrap();
    let x2 = builder.add_state_variable("x2", 0.0, 1.0).unwrap();
    builder.observe(x1, x2);
    builder.observe(x2, x1);
    builder.mark_connected_output(x1);
    builder.mark_connected_output(x2);
    let mut sim = builder.build().unwrap();

    let t_end = 2.0 * std::f64::consts::PI;
    let mut iterations = 0;
    while !sim.is_exhausted() {
        sim.run_segment().unwrap();
        let energy = sim.value(x1).powi(2) + sim.value(x2).powi(2);
        assert!((1.0 - 5.0e-4..=1.0 + 5.0e-4).contains(&energy), "energy drifted to {energy} at t={}", sim.time());
        iterations += 1;
        assert!(iterations < 1_000_000, "harmonic oscillator never reached t_end");
    }

    let x1_end = sim.value_at(x1, t_end);
    assert!((x1_end - 1.0).abs() <= 1.0e-4, "x1(2*pi) = {x1_end}, expected ~1.0");
}

/// S5 — a high-frequency indicator whose amplitude sits below `zTol`: every
/// predicted root must be culled before it ever reaches a handler.
#[test]
fn s5_zero_crossing_chatter_is_culled_to_zero_handler_firings() {
    let mut options = Options::default();
    options.qss_method = QssMethod::Qss2;
    options.t_end = 1.0;
    let z_tol = options.z_tol * options.z_fac;

    let mut builder =
        SimulationBuilder::new(ChatterZcBackend::new(1.0, 100.0, 0.5 * z_tol, 1.0), options);
    let x = builder.add_state_variable("x", 1.0, 1.0).unwrap();
    let cond = builder.add_conditional();
    builder.watch(x, cond);
    let mut sim = builder.build().unwrap();
    let stats = sim.run().unwrap();

    assert_eq!(stats.conditional_firings, 0, "chatter below zTol should never fire a handler");
}

/// S6 — 25 identical decaying copies sharing a bin size large enough that
/// almost every requantization pass should land as a batch rather than a
/// singleton event.
#[test]
fn s6_binned_simultaneous_requantization_ratio_is_at_least_80_percent() {
    let mut options = Options::default();
    options.qss_method = QssMethod::Qss2;
    options.bin_size = 8;
    options.t_end = 5.0;

    let mut builder = SimulationBuilder::new(ReplicatedExponentialBackend::new(25, 1.0, 1.0), options);
    for i in 0..25 {
        builder.add_state_variable(format!("x{i}"), 1.0, 1.0).unwrap();
    }
    let mut sim = builder.build().unwrap();
    let stats = sim.run().unwrap();

    assert!(stats.steps > 0);
    let ratio = stats.simultaneous_batches as f64 / stats.steps as f64;
    assert!(
        ratio >= 0.8,
        "expected >= 80% simultaneous batches, got {ratio} ({}/{})",
        stats.simultaneous_batches,
        stats.steps
    );
}
