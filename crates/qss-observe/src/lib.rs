//! Turns a bucket of observer variables (produced by `qss-graph`) into
//! fresh Taylor coefficients, by talking to the `ModelBackend` in as few
//! round-trips as the directional-derivative protocol allows: one batched call per Taylor order across the whole bucket,
//! rather than one call per variable.
//!
//! `BackendRef` layout convention, shared with `qss-backend::testkit`:
//! state `i` lives at ref `i`, its first derivative at ref `n + i`, where
//! `n` is the arena size.

use qss_backend::{BackendRef, BackendResult, ModelBackend};
use qss_options::DerivativeMode;
use qss_time::EntityId;
use qss_var::{VarArena, VarId, VariableKind};

/// Maps `VarId`s to the backend value references the testkit (and any
/// real FMU) convention uses: states first, then their derivatives.
pub struct RefMap {
    deriv_base: u32,
}

impl RefMap {
    pub fn new(variable_count: usize) -> Self {
        Self { deriv_base: variable_count as u32 }
    }

    pub fn state_ref(&self, id: VarId) -> BackendRef {
        BackendRef(id.index() as u32)
    }

    pub fn deriv_ref(&self, id: VarId) -> BackendRef {
        BackendRef(self.deriv_base + id.index() as u32)
    }
}

/// Push every variable's current value into the backend, evaluated
/// `delta` past its own last quantization time. Which polynomial backs
/// that value is the actual difference between the explicit and
/// broadcast families: `Qss`/`Liqss` variables expose the *quantized*
/// trajectory `q(t)` to the model (the whole point of state
/// quantization), while `Xqss` exposes the full continuous `x(t)`.
/// Called once before reading derivatives for a pass so the backend's
/// state matches the core's polynomial trajectory.
pub fn push_states<B: ModelBackend>(
    backend: &mut B,
    refmap: &RefMap,
    arena: &VarArena,
    now: f64,
) -> BackendResult<()> {
    let refs: Vec<BackendRef> = arena.iter().map(|v| refmap.state_ref(v.id)).collect();
    let vals: Vec<f64> = arena
        .iter()
        .map(|v| {
            let delta = now - v.last_quantization_time();
            match v.kind {
                VariableKind::Xqss => v.continuous_value(delta),
                _ => v.quantized_value(delta),
            }
        })
        .collect();
    backend.set_reals(&refs, &vals)
}

fn all_state_refs(refmap: &RefMap, n: usize) -> Vec<BackendRef> {
    (0..n).map(|i| refmap.state_ref(VarId(EntityId(i as u32)))).collect()
}

/// Evaluate Taylor coefficients `x1..=x_max` for every variable in
/// `bucket` using chained directional derivatives, with one backend call
/// per order across the whole bucket at once. The seed vector for each
/// order is built from every arena variable's *currently stored*
/// coefficient at that order (the linearization point QSS advances
/// incrementally pass by pass), overwritten with freshly computed values
/// for the bucket members themselves.
///
/// Returns one `Vec<f64>` per bucket entry, in bucket order, each holding
/// up to `max_order` entries (`[x1]`, `[x1, x2]`, or `[x1, x2, x3]|`);
/// callers slice to each variable's own `order`.
pub fn directional_coeffs_batch<B: ModelBackend>(
    backend: &mut B,
    refmap: &RefMap,
    arena: &VarArena,
    bucket: &[VarId],
    max_threads: usize,
) -> BackendResult<Vec<Vec<f64>>> {
    let max_order = bucket.iter().map(|id| arena.get(*id).order).max().unwrap_or(1);
    let deriv_refs: Vec<BackendRef> = bucket.iter().map(|id| refmap.deriv_ref(*id)).collect();
    let state_refs = all_state_refs(refmap, arena.len());

    let d1 = backend.get_reals(&deriv_refs)?;
    let mut coeffs: Vec<Vec<f64>> = d1.iter().map(|&v| vec![v]).collect();
    if max_order < 2 {
        return Ok(coeffs);
    }

    let mut seed1: Vec<f64> = arena
        .iter()
        .map(|v| v.continuous_coeffs().get(1).copied().unwrap_or(0.0))
        .collect();
    for (id, d) in bucket.iter().zip(&d1) {
        seed1[id.index()] = *d;
    }
    let d2_raw = backend.get_directional_derivatives(&state_refs, &seed1, &deriv_refs)?;
    distribute_scaled(&mut coeffs, &d2_raw, 0.5, max_threads);
    if max_order < 3 {
        return Ok(coeffs);
    }

    let mut seed2: Vec<f64> = arena
        .iter()
        .map(|v| v.continuous_coeffs().get(2).map(|c| c * 2.0).unwrap_or(0.0))
        .collect();
    for (id, raw) in bucket.iter().zip(&d2_raw) {
        seed2[id.index()] = *raw;
    }
    let d3_raw = backend.get_directional_derivatives(&state_refs, &seed2, &deriv_refs)?;
    distribute_scaled(&mut coeffs, &d3_raw, 1.0 / 6.0, max_threads);
    Ok(coeffs)
}

/// Candidate count below which the per-task dispatch overhead of a
/// data-parallel scatter outweighs just doing the scaled push inline.
pub fn parallel_threshold(max_threads: usize) -> usize {
    max_threads.max(1) * 64
}

#[cfg(feature = "parallel")]
fn distribute_scaled_parallel(coeffs: &mut [Vec<f64>], raw: &[f64], scale: f64) {
    use rayon::prelude::*;
    coeffs.par_iter_mut().zip(raw.par_iter()).for_each(|(c, r)| c.push(r * scale));
}

/// Scatter one freshly computed Taylor coefficient (`raw * scale`) across
/// an entire bucket's coefficient vectors, switching to a data-parallel
/// scatter once the bucket crosses [`parallel_threshold`] and the
/// `parallel` feature is enabled (§5's intra-event parallelism).
fn distribute_scaled(coeffs: &mut [Vec<f64>], raw: &[f64], scale: f64, max_threads: usize) {
    #[cfg(feature = "parallel")]
    {
        if coeffs.len() >= parallel_threshold(max_threads) {
            distribute_scaled_parallel(coeffs, raw, scale);
            return;
        }
    }
    let _ = max_threads;
    for (c, r) in coeffs.iter_mut().zip(raw) {
        c.push(r * scale);
    }
}

/// Finite-difference fallback (`DerivativeMode::Numerical`): perturbs the
/// backend's time around `t0` and differences the first derivative
/// itself, rather than chaining directional calls. Cheaper to implement
/// against a backend with no directional-derivative support, at the cost
/// of `O(dt_nd^2)` truncation error instead of exactness.
///
/// Centered differencing (`t0 ± dt_nd`) needs a sample strictly before
/// `t0`; when `t0` is still within `dt_nd` of the run's start (`t_start`),
/// that sample would fall before time began, so this instead samples
/// forward — `t0`, `t0 + dt_nd`, `t0 + 2*dt_nd` — and uses the three-point
/// forward-difference stencil for the first and second derivative of the
/// derivative series.
pub fn numerical_coeffs_batch<B: ModelBackend>(
    backend: &mut B,
    refmap: &RefMap,
    arena: &VarArena,
    bucket: &[VarId],
    t0: f64,
    dt_nd: f64,
    t_start: f64,
) -> BackendResult<Vec<Vec<f64>>> {
    let max_order = bucket.iter().map(|id| arena.get(*id).order).max().unwrap_or(1);
    let deriv_refs: Vec<BackendRef> = bucket.iter().map(|id| refmap.deriv_ref(*id)).collect();

    let d0 = backend.get_reals(&deriv_refs)?;
    let mut coeffs: Vec<Vec<f64>> = d0.iter().map(|&v| vec![v]).collect();
    if max_order < 2 {
        return Ok(coeffs);
    }

    if t0 - dt_nd < t_start {
        backend.set_time(t0 + dt_nd)?;
        let d1 = backend.get_reals(&deriv_refs)?;
        backend.set_time(t0 + 2.0 * dt_nd)?;
        let d2 = backend.get_reals(&deriv_refs)?;
        backend.set_time(t0)?;

        for i in 0..coeffs.len() {
            let d_prime = (-3.0 * d0[i] + 4.0 * d1[i] - d2[i]) / (2.0 * dt_nd);
            coeffs[i].push(d_prime / 2.0);
        }
        if max_order < 3 {
            return Ok(coeffs);
        }
        for i in 0..coeffs.len() {
            let d_double_prime = (d0[i] - 2.0 * d1[i] + d2[i]) / (dt_nd * dt_nd);
            coeffs[i].push(d_double_prime / 6.0);
        }
        return Ok(coeffs);
    }

    backend.set_time(t0 + dt_nd)?;
    let d_plus = backend.get_reals(&deriv_refs)?;
    backend.set_time(t0 - dt_nd)?;
    let d_minus = backend.get_reals(&deriv_refs)?;
    backend.set_time(t0)?;

    for i in 0..coeffs.len() {
        coeffs[i].push((d_plus[i] - d_minus[i]) / (2.0 * dt_nd) / 2.0);
    }
    if max_order < 3 {
        return Ok(coeffs);
    }
    for i in 0..coeffs.len() {
        coeffs[i].push((d_plus[i] - 2.0 * d0[i] + d_minus[i]) / (dt_nd * dt_nd) / 6.0);
    }
    Ok(coeffs)
}

/// Dispatch to the configured derivative mode.
#[allow(clippy::too_many_arguments)]
pub fn recompute_bucket<B: ModelBackend>(
    backend: &mut B,
    refmap: &RefMap,
    arena: &VarArena,
    bucket: &[VarId],
    mode: DerivativeMode,
    t0: f64,
    dt_nd: f64,
    t_start: f64,
    max_threads: usize,
) -> BackendResult<Vec<Vec<f64>>> {
    match mode {
        DerivativeMode::Directional => directional_coeffs_batch(backend, refmap, arena, bucket, max_threads),
        DerivativeMode::Numerical => numerical_coeffs_batch(backend, refmap, arena, bucket, t0, dt_nd, t_start),
    }
}

/// The LIQSS perturb/restore dance: evaluate the
/// derivative at the backend-perturbed states `x0 - Q` and `x0 + Q`, then
/// restore the continuous value, so `qss-var`'s bracket rule has both
/// candidate derivatives to choose from.
pub fn liqss_bracket_derivatives<B: ModelBackend>(
    backend: &mut B,
    refmap: &RefMap,
    id: VarId,
    x0: f64,
    quantum: f64,
) -> BackendResult<(f64, f64)> {
    let state_ref = refmap.state_ref(id);
    let deriv_ref = refmap.deriv_ref(id);
    backend.set_reals(&[state_ref], &[x0 - quantum])?;
    let d_minus = backend.get_reals(&[deriv_ref])?[0];
    backend.set_reals(&[state_ref], &[x0 + quantum])?;
    let d_plus = backend.get_reals(&[deriv_ref])?[0];
    backend.set_reals(&[state_ref], &[x0])?;
    Ok((d_minus, d_plus))
}

#[cfg(test)]
mod tests {
    use super::*;
    use qss_backend::testkit::HarmonicOscillatorBackend;
    use qss_var::VariableKind;

    fn two_state_arena(order: u8) -> (VarArena, VarId, VarId) {
        let mut arena = VarArena::new();
        let a = arena.push("x1", VariableKind::Qss, order, 1.0, 1.0e-4, 1.0e-6).unwrap();
        let b = arena.push("x2", VariableKind::Qss, order, 0.0, 1.0e-4, 1.0e-6).unwrap();
        (arena, a, b)
    }

    #[test]
    fn directional_batch_matches_closed_form_for_harmonic_oscillator() {
        let (arena, a, b) = two_state_arena(3);
        let refmap = RefMap::new(arena.len());
        let mut backend = HarmonicOscillatorBackend::new(2.0, 1.0, 0.0);
        push_states(&mut backend, &refmap, &arena, 0.0).unwrap();

        let bucket = [a, b];
        let coeffs =
            directional_coeffs_batch(&mut backend, &refmap, &arena, &bucket, 4).unwrap();

        // x1' = x2 = 0, x2' = -4*x1 = -4
        assert!((coeffs[0][0] - 0.0).abs() < 1.0e-12);
        assert!((coeffs[1][0] - (-4.0)).abs() < 1.0e-12);
        // x1'' = x2' = -4 => x1 Taylor coeff = -4/2 = -2
        assert!((coeffs[0][1] - (-2.0)).abs() < 1.0e-12);
    }

    #[test]
    fn liqss_bracket_derivatives_perturb_and_restore_state() {
        let (arena, id, _) = two_state_arena(1);
        let refmap = RefMap::new(arena.len());
        let mut backend = HarmonicOscillatorBackend::new(1.0, 2.0, 0.5);
        let (d_minus, d_plus) =
            liqss_bracket_derivatives(&mut backend, &refmap, id, 2.0, 0.1).unwrap();
        // derivative of x1 is x2, independent of x1's own perturbation here.
        assert!((d_minus - 0.5).abs() < 1.0e-12);
        assert!((d_plus - 0.5).abs() < 1.0e-12);
        let restored = backend.get_reals(&[refmap.state_ref(id)]).unwrap()[0];
        assert!((restored - 2.0).abs() < 1.0e-12);
    }

    #[test]
    fn numerical_mode_approximates_directional_mode_for_linear_system() {
        let (arena, a, _) = two_state_arena(2);
        let refmap = RefMap::new(arena.len());
        let mut backend = HarmonicOscillatorBackend::new(3.0, 1.0, 0.0);
        push_states(&mut backend, &refmap, &arena, 0.0).unwrap();
        let bucket = [a];
        let numeric =
            numerical_coeffs_batch(&mut backend, &refmap, &arena, &bucket, 1.0, 1.0e-4, 0.0).unwrap();
        // x1'' = -9 => Taylor coeff -4.5
        assert!((numeric[0][1] - (-4.5)).abs() < 1.0e-3);
    }

    #[test]
    fn numerical_forward_branch_is_used_near_the_run_start() {
        let (arena, a, _) = two_state_arena(2);
        let refmap = RefMap::new(arena.len());
        let mut backend = HarmonicOscillatorBackend::new(3.0, 1.0, 0.0);
        push_states(&mut backend, &refmap, &arena, 0.0).unwrap();
        let bucket = [a];
        // t0 - dt_nd < t_start=0.0, so this must take the forward branch
        // instead of reading before the run began.
        let numeric =
            numerical_coeffs_batch(&mut backend, &refmap, &arena, &bucket, 0.0, 1.0e-4, 0.0).unwrap();
        assert!((numeric[0][1] - (-4.5)).abs() < 1.0e-3);
    }
}
