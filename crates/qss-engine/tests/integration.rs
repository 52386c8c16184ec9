//! End-to-end scenario tests driven through the public
//! facade — `run_to_completion` and `Driver` — rather than `qss-sim`
//! directly, the way an embedder only depending on this crate would.

use qss_backend::testkit::{BouncingBallBackend, StiffTwoStateBackend};
use qss_engine::{run_to_completion, Driver, Options, QssMethod};

/// S3 — bouncing ball: height is declared a connected output, so
/// `Driver::simulate` hands control back at every bounce (and at every
/// ordinary requantization in between); peak heights should shrink by the
/// restitution ratio each bounce and the ball should settle near rest by
/// `tEnd`.
#[test]
fn s3_bouncing_ball_peak_heights_decay_by_restitution_ratio() {
    let mut options = Options::default();
    options.qss_method = QssMethod::Qss2;
    options.t_end = 5.0;

    let mut h_id = None;
    let mut driver =
        Driver::pre_simulate(BouncingBallBackend::new(9.81, 0.8, 1.0), options, |builder| {
            let h = builder.add_state_variable("h", 1.0, 1.0).unwrap();
            let v = builder.add_state_variable("v", 0.0, 1.0).unwrap();
            builder.observe(v, h);
            let cond = builder.add_conditional();
            builder.watch(h, cond);
            builder.set_handler_targets(cond, &[h, v]);
            builder.mark_connected_output(h);
            h_id = Some(h);
        })
        .unwrap();
    let h_id = h_id.unwrap();

    let mut peaks = Vec::new();
    let mut rising = true;
    let mut last_h = driver.value(h_id);
    let mut iterations = 0;
    while !driver.is_finished() {
        driver.simulate().unwrap();
        let h = driver.value(h_id);
        if rising && h < last_h {
            peaks.push(last_h);
            rising = false;
        } else if !rising && h > last_h {
            rising = true;
        }
        last_h = h;
        iterations += 1;
        assert!(iterations < 1_000_000, "bouncing ball never reached t_end");
    }

    assert!(peaks.len() >= 2, "expected at least two bounces, got {}", peaks.len());
    for pair in peaks.windows(2) {
        let ratio = pair[1] / pair[0];
        assert!((0.5..=0.8).contains(&ratio), "peak ratio {ratio} outside the expected decay band");
    }
    assert!(last_h <= 0.2, "final height {last_h} should have settled near rest");
}

/// S4 — stiff two-state system: LIQSS2's implicit bracket selection should
/// need far fewer total requantizations than explicit QSS2 to cover the
/// same run, since QSS2 is forced to the fast mode's tiny step throughout.
#[test]
fn s4_liqss_needs_far_fewer_requantizations_than_explicit_qss_on_a_stiff_pair() {
    let mut qss_options = Options::default();
    qss_options.qss_method = QssMethod::Qss2;
    qss_options.r_tol = 1.0e-3;
    qss_options.t_end = 1.0;

    let qss_stats = run_to_completion(StiffTwoStateBackend::new(1000.0, 1.0, 1.0, 1.0), qss_options, |builder| {
        builder.add_state_variable("x1", 1.0, 1.0).unwrap();
        builder.add_state_variable("x2", 1.0, 1.0).unwrap();
    })
    .unwrap();

    let mut liqss_options = Options::default();
    liqss_options.qss_method = QssMethod::Liqss2;
    liqss_options.r_tol = 1.0e-3;
    liqss_options.t_end = 1.0;

    let liqss_stats =
        run_to_completion(StiffTwoStateBackend::new(1000.0, 1.0, 1.0, 1.0), liqss_options, |builder| {
            builder.add_state_variable("x1", 1.0, 1.0).unwrap();
            builder.add_state_variable("x2", 1.0, 1.0).unwrap();
        })
        .unwrap();

    assert!(
        qss_stats.quantization_events >= 5 * liqss_stats.quantization_events.max(1),
        "expected QSS2 ({}) to take at least 5x LIQSS2's ({}) requantizations",
        qss_stats.quantization_events,
        liqss_stats.quantization_events
    );
}
