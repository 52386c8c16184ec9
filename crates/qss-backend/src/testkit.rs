//! Analytic `ModelBackend` implementations used by integration tests
//!. Each backend knows its own closed-form
//! equations; none of it is exercised outside `#[cfg(test)]`/tests crates,
//! so the approximations noted inline (e.g. evaluating a Jacobian at the
//! current stored state rather than advancing a shadow clock) are fine for
//! a harness model and would not be acceptable in a real FMU importer.
//!
//! Convention shared by every backend here: state `i` lives at
//! `BackendRef(i)`, and its first derivative lives at `BackendRef(n + i)`
//! where `n` is the state count, mirroring how an FMU commonly exposes
//! `der(x)` as its own output value reference.

use crate::{BackendError, BackendRef, BackendResult, EventInfo, ModelBackend};

fn state_ref(i: usize) -> BackendRef {
    BackendRef(i as u32)
}

fn deriv_ref(n: usize, i: usize) -> BackendRef {
    BackendRef((n + i) as u32)
}

/// `dx/dt = -k x`, the single-state decay used by S1 and as the unit cell
/// of [`ReplicatedExponentialBackend`] (S6).
pub struct ExponentialDecayBackend {
    pub k: f64,
    x: f64,
    t: f64,
}

impl ExponentialDecayBackend {
    pub fn new(k: f64, x0: f64) -> Self {
        Self { k, x: x0, t: 0.0 }
    }
}

impl ModelBackend for ExponentialDecayBackend {
    fn set_time(&mut self, t: f64) -> BackendResult<()> {
        self.t = t;
        Ok(())
    }

    fn set_reals(&mut self, refs: &[BackendRef], values: &[f64]) -> BackendResult<()> {
        for (r, v) in refs.iter().zip(values) {
            if *r == state_ref(0) {
                self.x = *v;
            }
        }
        Ok(())
    }

    fn get_reals(&mut self, refs: &[BackendRef]) -> BackendResult<Vec<f64>> {
        refs.iter()
            .map(|r| {
                if *r == state_ref(0) {
                    Ok(self.x)
                } else if *r == deriv_ref(1, 0) {
                    Ok(-self.k * self.x)
                } else {
                    Err(BackendError::fatal(format!("unknown ref {r}")))
                }
            })
            .collect()
    }

    fn get_directional_derivatives(
        &mut self,
        input_refs: &[BackendRef],
        input_seeds: &[f64],
        output_refs: &[BackendRef],
    ) -> BackendResult<Vec<f64>> {
        let seed = input_refs
            .iter()
            .zip(input_seeds)
            .find(|(r, _)| **r == state_ref(0))
            .map(|(_, s)| *s)
            .unwrap_or(0.0);
        let jv = -self.k * seed;
        Ok(output_refs.iter().map(|_| jv).collect())
    }

    fn enter_event_mode(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo::default())
    }
    fn event_iteration(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo::default())
    }
    fn enter_continuous_mode(&mut self) -> BackendResult<()> {
        Ok(())
    }
    fn get_event_indicators(&mut self) -> BackendResult<Vec<f64>> {
        Ok(Vec::new())
    }
    fn completed_integrator_step(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo::default())
    }
    fn nominal(&self, _r: BackendRef) -> f64 {
        self.x.abs().max(1.0)
    }
}

/// `x1' = x2, x2' = -w^2 x1`: the linear, constant-Jacobian harmonic
/// oscillator used by S2. Linearity means `get_directional_derivatives`
/// chained twice yields exact 2nd/3rd derivatives of either state, which
/// is what QSS3 needs to build its cubic.
pub struct HarmonicOscillatorBackend {
    pub omega: f64,
    x: [f64; 2],
    t: f64,
}

impl HarmonicOscillatorBackend {
    pub fn new(omega: f64, x0: f64, v0: f64) -> Self {
        Self { omega, x: [x0, v0], t: 0.0 }
    }

    fn jacobian_vector_product(&self, seed: &[f64; 2]) -> [f64; 2] {
        [seed[1], -self.omega * self.omega * seed[0]]
    }
}

impl ModelBackend for HarmonicOscillatorBackend {
    fn set_time(&mut self, t: f64) -> BackendResult<()> {
        self.t = t;
        Ok(())
    }

    fn set_reals(&mut self, refs: &[BackendRef], values: &[f64]) -> BackendResult<()> {
        for (r, v) in refs.iter().zip(values) {
            if *r == state_ref(0) {
                self.x[0] = *v;
            } else if *r == state_ref(1) {
                self.x[1] = *v;
            }
        }
        Ok(())
    }

    fn get_reals(&mut self, refs: &[BackendRef]) -> BackendResult<Vec<f64>> {
        let d = self.jacobian_vector_product(&self.x);
        refs.iter()
            .map(|r| {
                if *r == state_ref(0) {
                    Ok(self.x[0])
                } else if *r == state_ref(1) {
                    Ok(self.x[1])
                } else if *r == deriv_ref(2, 0) {
                    Ok(d[0])
                } else if *r == deriv_ref(2, 1) {
                    Ok(d[1])
                } else {
                    Err(BackendError::fatal(format!("unknown ref {r}")))
                }
            })
            .collect()
    }

    fn get_directional_derivatives(
        &mut self,
        input_refs: &[BackendRef],
        input_seeds: &[f64],
        output_refs: &[BackendRef],
    ) -> BackendResult<Vec<f64>> {
        let mut seed = [0.0; 2];
        for (r, s) in input_refs.iter().zip(input_seeds) {
            if *r == state_ref(0) {
                seed[0] = *s;
            } else if *r == state_ref(1) {
                seed[1] = *s;
            }
        }
        let jv = self.jacobian_vector_product(&seed);
        Ok(output_refs
            .iter()
            .map(|r| if *r == deriv_ref(2, 0) { jv[0] } else { jv[1] })
            .collect())
    }

    fn enter_event_mode(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo::default())
    }
    fn event_iteration(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo::default())
    }
    fn enter_continuous_mode(&mut self) -> BackendResult<()> {
        Ok(())
    }
    fn get_event_indicators(&mut self) -> BackendResult<Vec<f64>> {
        Ok(Vec::new())
    }
    fn completed_integrator_step(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo::default())
    }
    fn nominal(&self, r: BackendRef) -> f64 {
        if r == state_ref(1) { self.x[1].abs().max(1.0) } else { self.x[0].abs().max(1.0) }
    }
}

/// Height/velocity under gravity with an inelastic-ish bounce
/// (`v := -0.8 v` when `h` crosses zero from above), used by S3. Event
/// indicator 0 is the height itself; the bounce is applied directly by
/// this backend when asked to run an event iteration, since the backend
/// owns the model's discrete equations.
pub struct BouncingBallBackend {
    pub g: f64,
    pub restitution: f64,
    h: f64,
    v: f64,
    t: f64,
}

impl BouncingBallBackend {
    pub fn new(g: f64, restitution: f64, h0: f64) -> Self {
        Self { g, restitution, h: h0, v: 0.0, t: 0.0 }
    }
}

impl ModelBackend for BouncingBallBackend {
    fn set_time(&mut self, t: f64) -> BackendResult<()> {
        self.t = t;
        Ok(())
    }

    fn set_reals(&mut self, refs: &[BackendRef], values: &[f64]) -> BackendResult<()> {
        for (r, v) in refs.iter().zip(values) {
            if *r == state_ref(0) {
                self.h = *v;
            } else if *r == state_ref(1) {
                self.v = *v;
            }
        }
        Ok(())
    }

    fn get_reals(&mut self, refs: &[BackendRef]) -> BackendResult<Vec<f64>> {
        refs.iter()
            .map(|r| {
                if *r == state_ref(0) {
                    Ok(self.h)
                } else if *r == state_ref(1) {
                    Ok(self.v)
                } else if *r == deriv_ref(2, 0) {
                    Ok(self.v)
                } else if *r == deriv_ref(2, 1) {
                    Ok(-self.g)
                } else {
                    Err(BackendError::fatal(format!("unknown ref {r}")))
                }
            })
            .collect()
    }

    fn get_directional_derivatives(
        &mut self,
        input_refs: &[BackendRef],
        input_seeds: &[f64],
        output_refs: &[BackendRef],
    ) -> BackendResult<Vec<f64>> {
        // h' = v, v' = -g (constant): Jacobian row for h' is [0, 1], for v' is [0, 0].
        let seed_v = input_refs
            .iter()
            .zip(input_seeds)
            .find(|(r, _)| **r == state_ref(1))
            .map(|(_, s)| *s)
            .unwrap_or(0.0);
        Ok(output_refs
            .iter()
            .map(|r| if *r == deriv_ref(2, 0) { seed_v } else { 0.0 })
            .collect())
    }

    fn enter_event_mode(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo { enter_event_mode: true, terminate: false })
    }

    fn event_iteration(&mut self) -> BackendResult<EventInfo> {
        if self.h <= 0.0 {
            self.h = 0.0;
            self.v = -self.restitution * self.v;
        }
        Ok(EventInfo::default())
    }

    fn enter_continuous_mode(&mut self) -> BackendResult<()> {
        Ok(())
    }

    fn get_event_indicators(&mut self) -> BackendResult<Vec<f64>> {
        Ok(vec![self.h])
    }

    fn completed_integrator_step(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo { enter_event_mode: self.h <= 0.0, terminate: false })
    }

    fn nominal(&self, r: BackendRef) -> f64 {
        if r == state_ref(1) { self.v.abs().max(1.0) } else { self.h.abs().max(1.0) }
    }
}

/// A two-state linear system with widely separated time constants
/// (`x1' = -1000 x1 + x2`, `x2' = -x2`), the stiff LIQSS exercise for S4:
/// an explicit QSS method would be forced to tiny steps by `x1`'s fast
/// mode, while LIQSS's implicit bracket selection stays stable at a step
/// sized for `x2`.
pub struct StiffTwoStateBackend {
    pub fast_rate: f64,
    pub slow_rate: f64,
    x: [f64; 2],
    t: f64,
}

impl StiffTwoStateBackend {
    pub fn new(fast_rate: f64, slow_rate: f64, x1_0: f64, x2_0: f64) -> Self {
        Self { fast_rate, slow_rate, x: [x1_0, x2_0], t: 0.0 }
    }

    fn jacobian_vector_product(&self, seed: &[f64; 2]) -> [f64; 2] {
        [-self.fast_rate * seed[0] + seed[1], -self.slow_rate * seed[1]]
    }
}

impl ModelBackend for StiffTwoStateBackend {
    fn set_time(&mut self, t: f64) -> BackendResult<()> {
        self.t = t;
        Ok(())
    }

    fn set_reals(&mut self, refs: &[BackendRef], values: &[f64]) -> BackendResult<()> {
        for (r, v) in refs.iter().zip(values) {
            if *r == state_ref(0) {
                self.x[0] = *v;
            } else if *r == state_ref(1) {
                self.x[1] = *v;
            }
        }
        Ok(())
    }

    fn get_reals(&mut self, refs: &[BackendRef]) -> BackendResult<Vec<f64>> {
        let d = self.jacobian_vector_product(&self.x);
        refs.iter()
            .map(|r| {
                if *r == state_ref(0) {
                    Ok(self.x[0])
                } else if *r == state_ref(1) {
                    Ok(self.x[1])
                } else if *r == deriv_ref(2, 0) {
                    Ok(d[0])
                } else if *r == deriv_ref(2, 1) {
                    Ok(d[1])
                } else {
                    Err(BackendError::fatal(format!("unknown ref {r}")))
                }
            })
            .collect()
    }

    fn get_directional_derivatives(
        &mut self,
        input_refs: &[BackendRef],
        input_seeds: &[f64],
        output_refs: &[BackendRef],
    ) -> BackendResult<Vec<f64>> {
        let mut seed = [0.0; 2];
        for (r, s) in input_refs.iter().zip(input_seeds) {
            if *r == state_ref(0) {
                seed[0] = *s;
            } else if *r == state_ref(1) {
                seed[1] = *s;
            }
        }
        let jv = self.jacobian_vector_product(&seed);
        Ok(output_refs
            .iter()
            .map(|r| if *r == deriv_ref(2, 0) { jv[0] } else { jv[1] })
            .collect())
    }

    fn enter_event_mode(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo::default())
    }
    fn event_iteration(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo::default())
    }
    fn enter_continuous_mode(&mut self) -> BackendResult<()> {
        Ok(())
    }
    fn get_event_indicators(&mut self) -> BackendResult<Vec<f64>> {
        Ok(Vec::new())
    }
    fn completed_integrator_step(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo::default())
    }
    fn nominal(&self, r: BackendRef) -> f64 {
        if r == state_ref(1) { self.x[1].abs().max(1.0) } else { self.x[0].abs().max(1.0) }
    }
}

/// A slowly decaying state whose event indicator oscillates at high
/// frequency with amplitude close to `zTol`, used by S5 to exercise
/// anti-chatter root culling: without [`qss_roots::zc_root_cull`] the
/// indicator would fire a zero-crossing event on nearly every period.
pub struct ChatterZcBackend {
    pub decay_rate: f64,
    pub chatter_freq: f64,
    pub chatter_amplitude: f64,
    x: f64,
    t: f64,
}

impl ChatterZcBackend {
    pub fn new(decay_rate: f64, chatter_freq: f64, chatter_amplitude: f64, x0: f64) -> Self {
        Self { decay_rate, chatter_freq, chatter_amplitude, x: x0, t: 0.0 }
    }
}

impl ModelBackend for ChatterZcBackend {
    fn set_time(&mut self, t: f64) -> BackendResult<()> {
        self.t = t;
        Ok(())
    }

    fn set_reals(&mut self, refs: &[BackendRef], values: &[f64]) -> BackendResult<()> {
        for (r, v) in refs.iter().zip(values) {
            if *r == state_ref(0) {
                self.x = *v;
            }
        }
        Ok(())
    }

    fn get_reals(&mut self, refs: &[BackendRef]) -> BackendResult<Vec<f64>> {
        refs.iter()
            .map(|r| {
                if *r == state_ref(0) {
                    Ok(self.x)
                } else if *r == deriv_ref(1, 0) {
                    Ok(-self.decay_rate * self.x)
                } else {
                    Err(BackendError::fatal(format!("unknown ref {r}")))
                }
            })
            .collect()
    }

    fn get_directional_derivatives(
        &mut self,
        input_refs: &[BackendRef],
        input_seeds: &[f64],
        output_refs: &[BackendRef],
    ) -> BackendResult<Vec<f64>> {
        let seed = input_refs
            .iter()
            .zip(input_seeds)
            .find(|(r, _)| **r == state_ref(0))
            .map(|(_, s)| *s)
            .unwrap_or(0.0);
        let jv = -self.decay_rate * seed;
        Ok(output_refs.iter().map(|_| jv).collect())
    }

    fn enter_event_mode(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo::default())
    }
    fn event_iteration(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo::default())
    }
    fn enter_continuous_mode(&mut self) -> BackendResult<()> {
        Ok(())
    }

    fn get_event_indicators(&mut self) -> BackendResult<Vec<f64>> {
        Ok(vec![self.chatter_amplitude * (self.chatter_freq * self.t).sin()])
    }

    fn completed_integrator_step(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo::default())
    }

    fn nominal(&self, _r: BackendRef) -> f64 {
        self.x.abs().max(1.0)
    }
}

/// `n` independent, identically-parameterized exponential decays sharing a
/// common rate and starting value, used by S6 to drive many variables to
/// simultaneous requantization and exercise bin selection.
pub struct ReplicatedExponentialBackend {
    pub k: f64,
    x: Vec<f64>,
    t: f64,
}

impl ReplicatedExponentialBackend {
    pub fn new(count: usize, k: f64, x0: f64) -> Self {
        Self { k, x: vec![x0; count], t: 0.0 }
    }

    pub fn count(&self) -> usize {
        self.x.len()
    }
}

impl ModelBackend for ReplicatedExponentialBackend {
    fn set_time(&mut self, t: f64) -> BackendResult<()> {
        self.t = t;
        Ok(())
    }

    fn set_reals(&mut self, refs: &[BackendRef], values: &[f64]) -> BackendResult<()> {
        let n = self.x.len();
        for (r, v) in refs.iter().zip(values) {
            let idx = r.0 as usize;
            if idx < n {
                self.x[idx] = *v;
            }
        }
        Ok(())
    }

    fn get_reals(&mut self, refs: &[BackendRef]) -> BackendResult<Vec<f64>> {
        let n = self.x.len();
        refs.iter()
            .map(|r| {
                let idx = r.0 as usize;
                if idx < n {
                    Ok(self.x[idx])
                } else if idx < 2 * n {
                    Ok(-self.k * self.x[idx - n])
                } else {
                    Err(BackendError::fatal(format!("unknown ref {r}")))
                }
            })
            .collect()
    }

    fn get_directional_derivatives(
        &mut self,
        input_refs: &[BackendRef],
        input_seeds: &[f64],
        output_refs: &[BackendRef],
    ) -> BackendResult<Vec<f64>> {
        let n = self.x.len();
        let mut seeds = vec![0.0; n];
        for (r, s) in input_refs.iter().zip(input_seeds) {
            let idx = r.0 as usize;
            if idx < n {
                seeds[idx] = *s;
            }
        }
        Ok(output_refs
            .iter()
            .map(|r| {
                let idx = r.0 as usize;
                let state_idx = if idx >= n { idx - n } else { idx };
                -self.k * seeds.get(state_idx).copied().unwrap_or(0.0)
            })
            .collect())
    }

    fn enter_event_mode(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo::default())
    }
    fn event_iteration(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo::default())
    }
    fn enter_continuous_mode(&mut self) -> BackendResult<()> {
        Ok(())
    }
    fn get_event_indicators(&mut self) -> BackendResult<Vec<f64>> {
        Ok(Vec::new())
    }
    fn completed_integrator_step(&mut self) -> BackendResult<EventInfo> {
        Ok(EventInfo::default())
    }
    fn nominal(&self, r: BackendRef) -> f64 {
        let n = self.x.len();
        let idx = (r.0 as usize).min(n.saturating_sub(1).max(0));
        self.x.get(idx).copied().unwrap_or(1.0).abs().max(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_decay_derivative_matches_closed_form() {
        let mut b = ExponentialDecayBackend::new(2.0, 10.0);
        let d = b.get_reals(&[deriv_ref(1, 0)]).unwrap();
        assert!((d[0] - (-20.0)).abs() < 1.0e-12);
    }

    #[test]
    fn harmonic_oscillator_jacobian_is_constant() {
        let mut b = HarmonicOscillatorBackend::new(3.0, 1.0, 0.0);
        let d1 = b.get_reals(&[deriv_ref(2, 0), deriv_ref(2, 1)]).unwrap();
        assert_eq!(d1[0], 0.0);
        assert!((d1[1] - (-9.0)).abs() < 1.0e-12);
        let d2 = b
            .get_directional_derivatives(
                &[state_ref(0), state_ref(1)],
                &[d1[0], d1[1]],
                &[deriv_ref(2, 0), deriv_ref(2, 1)],
            )
            .unwrap();
        assert!((d2[0] - d1[1]).abs() < 1.0e-12);
    }

    #[test]
    fn bouncing_ball_applies_restitution_on_event_iteration() {
        let mut b = BouncingBallBackend::new(9.81, 0.8, 0.0);
        b.set_reals(&[state_ref(1)], &[-5.0]).unwrap();
        b.event_iteration().unwrap();
        let vals = b.get_reals(&[state_ref(1)]).unwrap();
        assert!((vals[0] - 4.0).abs() < 1.0e-12);
    }

    #[test]
    fn replicated_exponential_backend_keeps_instances_independent() {
        let mut b = ReplicatedExponentialBackend::new(4, 1.0, 5.0);
        b.set_reals(&[state_ref(2)], &[9.0]).unwrap();
        let vals = b.get_reals(&[state_ref(0), state_ref(2)]).unwrap();
        assert_eq!(vals[0], 5.0);
        assert_eq!(vals[1], 9.0);
    }
}
