//! Smallest-positive-real-root kernel for polynomials of degree <= 3.
//!
//! Every prediction in the core — a state variable's next requantization,
//! a zero-crossing variable's next root — reduces to finding the smallest
//! `Δ > 0` solving a degree-<=3 polynomial. This crate is the one place
//! that knows how; `qss-var` and `qss-zc` only ever call into it.
//!
//! `f64::INFINITY` is the "no positive root" sentinel throughout, matching
//! the convention the quantized-state literature uses for a variable that
//! becomes dormant (`tE := +∞`) rather than an `Option` — it composes
//! naturally with `f64::min` when picking the smaller of two boundary roots.

use std::f64::consts::PI;

const HALLEY_MAX_ITERS: u32 = 50;
/// Threshold from the numerical policy: when the monic quadratic
/// coefficient exceeds this magnitude the cubic's leading term is treated
/// as numerically negligible and the root is found via the quadratic
/// instead, then polished with a single Halley step against the full cubic.
const MONIC_DEGENERACY_THRESHOLD: f64 = 1.0e3;

fn smallest_positive(candidates: &[f64]) -> f64 {
    candidates
        .iter()
        .copied()
        .filter(|r| r.is_finite() && *r > 0.0)
        .fold(f64::INFINITY, f64::min)
}

/// Smallest positive root of `a*Δ + b = 0`, or `+∞` if none (including the
/// degenerate `a == 0` case).
pub fn root_linear(a: f64, b: f64) -> f64 {
    if a == 0.0 {
        return f64::INFINITY;
    }
    smallest_positive(&[-b / a])
}

/// The (up to two) real roots of `a*Δ² + b*Δ + c = 0`, unfiltered by sign.
/// Used when callers need both roots (e.g. locating an extremum between
/// `tQ` and a predicted crossing), not just the smallest positive one.
pub fn quadratic_real_roots(a: f64, b: f64, c: f64) -> (Option<f64>, Option<f64>) {
    if a == 0.0 {
        return match root_linear_unfiltered(b, c) {
            Some(r) => (Some(r), None),
            None => (None, None),
        };
    }
    let disc = b * b - 4.0 * a * c;
    if disc < 0.0 {
        return (None, None);
    }
    let sqrt_disc = disc.sqrt();
    // Numerically stable form: avoids cancellation when b and sqrt(disc) are close in magnitude.
    let sign_b = if b >= 0.0 { 1.0 } else { -1.0 };
    let q = -0.5 * (b + sign_b * sqrt_disc);
    if q == 0.0 {
        (Some(0.0), None)
    } else {
        (Some(q / a), Some(c / q))
    }
}

fn root_linear_unfiltered(a: f64, b: f64) -> Option<f64> {
    if a == 0.0 { None } else { Some(-b / a) }
}

/// Smallest positive root of `a*Δ² + b*Δ + c = 0`, or `+∞` if none.
pub fn root_quadratic(a: f64, b: f64, c: f64) -> f64 {
    if a == 0.0 {
        return root_linear(b, c);
    }
    let (r1, r2) = quadratic_real_roots(a, b, c);
    smallest_positive(&[r1.unwrap_or(f64::INFINITY), r2.unwrap_or(f64::INFINITY)])
}

/// Smallest positive root shared between two quadratics differing only in
/// the constant term (`c_lower`, `c_upper`) — the quantization-tolerance
/// boundary pair `x(Δ) - q(Δ) = ∓Q`.
pub fn root_quadratic_both(a: f64, b: f64, c_lower: f64, c_upper: f64) -> f64 {
    root_quadratic(a, b, c_lower).min(root_quadratic(a, b, c_upper))
}

/// Smallest positive root shared between two linear equations differing
/// only in the constant term.
pub fn root_linear_both(a: f64, b_lower: f64, b_upper: f64) -> f64 {
    root_linear(a, b_lower).min(root_linear(a, b_upper))
}

fn real_roots_monic_cubic(a2: f64, a1: f64, a0: f64) -> Vec<f64> {
    // Depressed cubic t^3 + p*t + q = 0 via the shift x = t - a2/3.
    let shift = a2 / 3.0;
    let p = a1 - a2 * a2 / 3.0;
    let q = 2.0 * a2 * a2 * a2 / 27.0 - a2 * a1 / 3.0 + a0;
    let discriminant = q * q / 4.0 + p * p * p / 27.0;

    if discriminant > 1.0e-300 {
        let sqrt_disc = discriminant.sqrt();
        let u = (-q / 2.0 + sqrt_disc).cbrt();
        let v = (-q / 2.0 - sqrt_disc).cbrt();
        vec![u + v - shift]
    } else if discriminant.abs() <= 1.0e-300 {
        let u = (-q / 2.0).cbrt();
        vec![2.0 * u - shift, -u - shift]
    } else {
        // Three distinct real roots: trigonometric (Viete) form.
        let r = (-p * p * p / 27.0).sqrt();
        let phi = (-q / (2.0 * r)).clamp(-1.0, 1.0).acos();
        let m = 2.0 * (-p / 3.0).sqrt();
        vec![
            m * (phi / 3.0).cos() - shift,
            m * ((phi + 2.0 * PI) / 3.0).cos() - shift,
            m * ((phi + 4.0 * PI) / 3.0).cos() - shift,
        ]
    }
}

/// Refine a cubic root with (bounded) Halley iteration against the
/// original (non-monic) cubic `a*x^3 + b*x^2 + c*x + d`. Accepted only
/// while the residual magnitude strictly decreases each step; the last
/// directly-convergent iterate is returned, so a refinement that starts
/// diverging simply stops rather than corrupting the candidate.
fn halley_refine_cubic(a: f64, b: f64, c: f64, d: f64, x0: f64, max_iters: u32) -> f64 {
    let f = |x: f64| a * x * x * x + b * x * x + c * x + d;
    let fp = |x: f64| 3.0 * a * x * x + 2.0 * b * x + c;
    let fpp = |x: f64| 6.0 * a * x + 2.0 * b;

    let mut x = x0;
    let mut resid = f(x).abs();
    for _ in 0..max_iters {
        let fx = f(x);
        let fpx = fp(x);
        let fppx = fpp(x);
        let denom = 2.0 * fpx * fpx - fx * fppx;
        if denom.abs() < 1.0e-300 {
            break;
        }
        let x_next = x - (2.0 * fx * fpx) / denom;
        let resid_next = f(x_next).abs();
        if !resid_next.is_finite() || resid_next >= resid {
            break;
        }
        x = x_next;
        resid = resid_next;
    }
    x
}

/// Smallest positive root of `a*Δ³ + b*Δ² + c*Δ + d = 0`, or `+∞` if none.
///
/// Tries, in order: a small-positive-root search starting from `Δ = 0`
/// (the common case for quantization/zero-crossing predictions, where the
/// root of interest is close to the current time), the full analytical
/// solution (Cardano/trigonometric), each refined by Halley iteration.
/// When the cubic term is numerically negligible relative to the
/// quadratic one (`|b/a| > 1e3`), the cubic is solved as a quadratic and
/// polished with a single Halley step against the original cubic.
pub fn root_cubic(a: f64, b: f64, c: f64, d: f64) -> f64 {
    if a == 0.0 {
        return root_quadratic(b, c, d);
    }
    let b_monic = b / a;
    if b_monic.abs() > MONIC_DEGENERACY_THRESHOLD {
        let approx = root_quadratic(b, c, d);
        if !approx.is_finite() {
            return f64::INFINITY;
        }
        return smallest_positive(&[halley_refine_cubic(a, b, c, d, approx, 1)]);
    }

    let c_monic = c / a;
    let d_monic = d / a;

    let mut candidates = vec![halley_refine_cubic(a, b, c, d, 0.0, HALLEY_MAX_ITERS)];
    for root in real_roots_monic_cubic(b_monic, c_monic, d_monic) {
        candidates.push(halley_refine_cubic(a, b, c, d, root, HALLEY_MAX_ITERS));
    }
    smallest_positive(&candidates)
}

/// Smallest positive root shared between two cubics differing only in the
/// constant term (`d_lower`, `d_upper`) — the order-3 quantization boundary
/// pair.
pub fn root_cubic_both(a: f64, b: f64, c: f64, d_lower: f64, d_upper: f64) -> f64 {
    root_cubic(a, b, c, d_lower).min(root_cubic(a, b, c, d_upper))
}

/// Anti-chatter root culling: a candidate root is
/// only accepted if the indicator magnitude test passes; otherwise the
/// root is rejected (`+∞`), forcing the caller to look past it.
pub fn zc_root_cull(root: f64, magnitude: f64, zmag: f64) -> f64 {
    if magnitude.abs() >= zmag { root } else { f64::INFINITY }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1.0e-9;

    #[test]
    fn linear_root_basic() {
        // 2Δ - 4 = 0 => Δ = 2
        assert!((root_linear(2.0, -4.0) - 2.0).abs() < EPS);
    }

    #[test]
    fn linear_root_negative_is_rejected() {
        assert_eq!(root_linear(2.0, 4.0), f64::INFINITY);
    }

    #[test]
    fn quadratic_known_roots() {
        // (Δ-2)(Δ-3) = Δ^2 -5Δ+6
        let r = root_quadratic(1.0, -5.0, 6.0);
        assert!((r - 2.0).abs() < EPS, "expected smallest positive root 2, got {r}");
    }

    #[test]
    fn quadratic_no_real_root_is_infinite() {
        // Δ^2 + 1 = 0
        assert_eq!(root_quadratic(1.0, 0.0, 1.0), f64::INFINITY);
    }

    #[test]
    fn quadratic_both_picks_smaller_boundary() {
        // a=1,b=0 ; c_lower=-4 (root 2), c_upper=-1 (root 1)
        let r = root_quadratic_both(1.0, 0.0, -4.0, -1.0);
        assert!((r - 1.0).abs() < EPS);
    }

    #[test]
    fn cubic_known_root_p4_style() {
        // (Δ-1)(Δ-2)(Δ-3) = Δ^3 -6Δ^2+11Δ-6, known root Δ*=1 is the smallest.
        let r = root_cubic(1.0, -6.0, 11.0, -6.0);
        let delta_star = 1.0;
        let slack = (1.0e-10_f64).max(1.0e-8 * delta_star.abs());
        assert!((r - delta_star).abs() <= slack, "root {r} not close to {delta_star}");
    }

    #[test]
    fn cubic_degenerate_small_leading_behaves_like_quadratic() {
        // a tiny relative to b,c,d: behaves like the quadratic b*x^2+c*x+d=0.
        let r = root_cubic(1.0e-9, 1.0, -5.0, 6.0);
        assert!((r - 2.0).abs() < 1.0e-4);
    }

    #[test]
    fn monomial_cubic_matches_cube_root() {
        // Δ^3 - 8 = 0 => Δ = 2
        let r = root_cubic(1.0, 0.0, 0.0, -8.0);
        assert!((r - 2.0).abs() < 1.0e-6);
    }

    #[test]
    fn zc_cull_rejects_below_magnitude() {
        assert_eq!(zc_root_cull(1.5, 0.01, 0.5), f64::INFINITY);
        assert_eq!(zc_root_cull(1.5, 0.6, 0.5), 1.5);
    }

    #[test]
    fn quadratic_real_roots_unfiltered_returns_both() {
        let (r1, r2) = quadratic_real_roots(1.0, -3.0, 2.0);
        let mut roots = [r1.unwrap(), r2.unwrap()];
        roots.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((roots[0] - 1.0).abs() < EPS);
        assert!((roots[1] - 2.0).abs() < EPS);
    }
}
