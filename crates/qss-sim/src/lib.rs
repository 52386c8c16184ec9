//! The simulation loop: queue dispatch, bucket propagation, and the
//! pass-limit watchdog that ties every other crate together into a single
//! event-driven run.
//!
//! [`SimulationBuilder`] assembles the model (state variables, conditionals,
//! and the dependency edges between them) against a caller-supplied
//! [`ModelBackend`], then [`SimulationBuilder::build`] seeds the event queue
//! and hands back a [`Simulation`] ready for [`Simulation::run`]. Everything
//! about the model's actual equations lives behind the backend; this crate
//! only knows how to drive it.

use qss_backend::{BackendRef, InitError, ModelBackend};
use qss_binopt::BinOptimizer;
use qss_graph::{Category, ObserverGraph};
use qss_observe::{liqss_bracket_derivatives, push_states, recompute_bucket, RefMap};
pub use qss_options::{Options, OptionsError};
use qss_queue::EventQueue;
use qss_time::{EntityId, EventKind, EventRecord, QueueHandle, SuperdenseTime};
use qss_var::{StepClamp, VarArena, VarId, VariableKind};
use qss_zc::{ConditionalArena, ConditionalId, ConditionalState};
use thiserror::Error;

/// Errors a running simulation can surface. Distinct from the fatal-init
/// class ([`InitError`]) raised while a model is still being assembled.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Backend(#[from] qss_backend::BackendError),
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(transparent)]
    InvalidOptions(#[from] OptionsError),
    #[error("no progress after {count} events stuck at time {time}: possible event-chatter livelock")]
    PassLimitExceeded { time: f64, count: u32 },
}

/// Summary counters for a completed (or in-progress) run.
#[derive(Debug, Clone, Default)]
pub struct SimStats {
    pub steps: u64,
    pub quantization_events: u64,
    pub zero_crossing_events: u64,
    /// Zero crossings confirmed outside the normally scheduled
    /// `ZeroCrossingReached` path: a same-instant `completed_integrator_step`
    /// confirmation, or a handler-side-effect re-verification that found a
    /// renewed sign flip.
    pub unpredicted_zero_crossings: u64,
    pub conditional_firings: u64,
    /// Passes whose dispatched batch held more than one event — the bin
    /// optimizer folding near-simultaneous events together rather than the
    /// exact-tie queue pop alone.
    pub simultaneous_batches: u64,
    /// Mean number of events per dispatched pass over the whole run.
    pub average_bin_size: f64,
    pub terminated: bool,
    pub final_time: f64,
    pub elapsed: std::time::Duration,
}

/// Assembles a model's variables, conditionals, and dependency edges before
/// handing off to [`Simulation`]. `ObserverGraph` and the watcher/affects
/// maps all need the final entity counts up front, so edges are collected
/// here and only applied once [`Self::build`] knows the final arena sizes.
pub struct SimulationBuilder<B: ModelBackend> {
    backend: B,
    options: Options,
    arena: VarArena,
    conditionals: ConditionalArena,
    categories: Vec<(VarId, Category)>,
    observe_edges: Vec<(VarId, VarId)>,
    watch_edges: Vec<(VarId, ConditionalId)>,
    handler_targets: Vec<(ConditionalId, Vec<VarId>)>,
    connected_outputs: Vec<VarId>,
}

impl<B: ModelBackend> SimulationBuilder<B> {
    pub fn new(backend: B, options: Options) -> Self {
        Self {
            backend,
            options,
            arena: VarArena::new(),
            conditionals: ConditionalArena::new(),
            categories: Vec::new(),
            observe_edges: Vec::new(),
            watch_edges: Vec::new(),
            handler_targets: Vec::new(),
            connected_outputs: Vec::new(),
        }
    }

    /// Add a continuous state variable, advanced with the run's configured
    /// `qss_method` (order and explicit/implicit/broadcast family all
    /// follow from it — §4.1). `nominal` resolves the absolute tolerance
    /// per [`Options::resolve_absolute_tolerance`] when `a_tol` is unset.
    /// Categorized `RealActive` instead of `QssState` when `options.relaxation`
    /// is set, with its tolerance band scaled by `zr_fac`/`za_fac` — the
    /// relaxation family trades a looser band for processing last among the
    /// non-zero-crossing buckets.
    pub fn add_state_variable(
        &mut self,
        name: impl Into<String>,
        x0: f64,
        nominal: f64,
    ) -> Result<VarId, InitError> {
        let kind = if self.options.qss_method.is_implicit() {
            VariableKind::Liqss
        } else if self.options.qss_method.is_broadcast() {
            VariableKind::Xqss
        } else {
            VariableKind::Qss
        };
        let order = self.options.qss_method.order();
        let (r_tol, a_tol, category) = if self.options.relaxation {
            (
                self.options.r_tol * self.options.zr_fac,
                self.options.resolve_absolute_tolerance(nominal) * self.options.za_fac,
                Category::RealActive,
            )
        } else {
            (self.options.r_tol, self.options.resolve_absolute_tolerance(nominal), Category::QssState)
        };
        let id = self.arena.push(name, kind, order, x0, r_tol, a_tol)?;
        self.categories.push((id, category));
        Ok(id)
    }

    /// Add a discrete (backend-driven, quantum-free) variable: no
    /// polynomial evolution between events, just a value observers can
    /// depend on. Categorized `OtherXBased`: driven purely by already-updated
    /// `x` values, processed after every `QssState`/`RealActive` bucket.
    pub fn add_discrete_variable(&mut self, name: impl Into<String>, x0: f64) -> Result<VarId, InitError> {
        let id = self.arena.push(name, VariableKind::Discrete, 0, x0, self.options.r_tol, self.options.a_fac)?;
        self.categories.push((id, Category::OtherXBased));
        Ok(id)
    }

    /// Add an externally driven input variable: like a discrete variable,
    /// no derivative or quantum of its own, but dispatched on its own
    /// `QssInputRequantization` event so traces can tell it apart from a
    /// backend-driven discrete signal. Also `OtherXBased`.
    pub fn add_input_variable(&mut self, name: impl Into<String>, x0: f64) -> Result<VarId, InitError> {
        let id = self.arena.push(name, VariableKind::Input, 0, x0, self.options.r_tol, self.options.a_fac)?;
        self.categories.push((id, Category::OtherXBased));
        Ok(id)
    }

    pub fn set_category(&mut self, id: VarId, category: Category) {
        self.categories.push((id, category));
    }

    /// Declare `id` a connected output of the model (the connected-output
    /// driver mode): a segment run stops at the first
    /// batch that would change it, or one of its observers, rather than
    /// running on to `t_end` in one pass.
    pub fn mark_connected_output(&mut self, id: VarId) {
        self.connected_outputs.push(id);
    }

    /// Declare that `observer`'s derivative function reads `owner`.
    pub fn observe(&mut self, owner: VarId, observer: VarId) {
        self.observe_edges.push((owner, observer));
    }

    /// Register a zero-crossing conditional whose indicator is exposed at
    /// `get_event_indicators()[index]`, where `index` is this conditional's
    /// creation order (the convention `ConditionalArena`/`get_event_indicators`
    /// share throughout this crate). `z_fac` scales the configured `z_tol`
    /// at registration time, so a model that wants every conditional looser
    /// or tighter than the default doesn't have to pass a pre-scaled value
    /// itself.
    pub fn add_conditional(&mut self) -> ConditionalId {
        self.conditionals.push(1, self.options.z_tol * self.options.z_fac)
    }

    /// Declare that `cond`'s indicator reads `owner`'s value, so `owner`
    /// requantizing triggers the indicator's refresh.
    pub fn watch(&mut self, owner: VarId, cond: ConditionalId) {
        self.watch_edges.push((owner, cond));
    }

    /// Declare the state variables `cond`'s handlers mutate directly in the
    /// backend (a discontinuity), so the core knows which variables need
    /// re-pulling from the backend once the handlers finish running.
    pub fn set_handler_targets(&mut self, cond: ConditionalId, vars: &[VarId]) {
        self.handler_targets.push((cond, vars.to_vec()));
    }

    /// Finalize the dependency graph, seed the event queue with every
    /// variable's and conditional's first predicted event, and return a
    /// simulation ready to [`Simulation::run`].
    pub fn build(mut self) -> Result<Simulation<B>, RuntimeError> {
        self.options.validate()?;

        let n = self.arena.len();
        let mut graph = ObserverGraph::new(n);
        for (id, category) in self.categories {
            graph.set_category(id, category);
        }
        for (owner, observer) in self.observe_edges {
            graph.observe(owner, observer);
        }
        for id in self.connected_outputs {
            graph.mark_connected_output(id);
        }
        graph.finalize();

        if self.options.cycles && graph.has_cycle() {
            tracing::warn!(target: "qss.build", "dependency graph has a cycle");
        }

        for i in 0..n {
            let id = VarId(EntityId(i as u32));
            let v = self.arena.get_mut(id);
            v.set_self_observer(graph.is_self_observer(id));
            v.set_connected_output(graph.is_connected_output(id));
            v.set_connected_output_observer(graph.is_connected_output_observer(id));
            v.set_has_upstream_state_or_ei_observer(graph.has_upstream_state_or_ei_observer(id));
        }

        let mut var_watchers = vec![Vec::new(); n];
        let mut cond_depends = vec![Vec::new(); self.conditionals.len()];
        for (owner, cond) in self.watch_edges {
            var_watchers[owner.index()].push(cond);
            cond_depends[cond.index()].push(owner);
        }
        let mut handler_targets = vec![Vec::new(); self.conditionals.len()];
        for (cond, vars) in self.handler_targets {
            handler_targets[cond.index()] = vars;
        }

        let dt_zc_current = vec![self.options.dt_zc; self.conditionals.len()];
        let sim_dt_min = self.options.dt_min;

        let mut sim = Simulation {
            backend: self.backend,
            bin_opt: BinOptimizer::new(self.options.bin_size, self.options.bin_frac, self.options.bin_auto),
            options: self.options,
            refmap: RefMap::new(n),
            arena: self.arena,
            graph,
            conditionals: self.conditionals,
            queue: EventQueue::new(),
            var_handles: vec![QueueHandle(0); n],
            cond_handles: Vec::new(),
            var_watchers,
            cond_depends,
            handler_targets,
            dt_zc_current,
            sim_dt_min,
            active_time: f64::NAN,
            active_step: 0,
            start_time: 0.0,
            bin_size_sum: 0,
            bin_batches: 0,
            pending_boundary: false,
            time: 0.0,
            stats: SimStats::default(),
        };
        sim.initialize()?;
        Ok(sim)
    }
}

/// A model assembled against a live [`ModelBackend`], ready to advance
/// through its event queue. See [`SimulationBuilder`] for construction.
pub struct Simulation<B: ModelBackend> {
    backend: B,
    options: Options,
    arena: VarArena,
    graph: ObserverGraph,
    conditionals: ConditionalArena,
    refmap: RefMap,
    queue: EventQueue,
    var_handles: Vec<QueueHandle>,
    cond_handles: Vec<QueueHandle>,
    /// Which conditionals must refresh when a given variable requantizes.
    var_watchers: Vec<Vec<ConditionalId>>,
    /// The state variables each conditional's indicator reads, the inverse
    /// of `var_watchers` — used to estimate the indicator's state-sensitivity
    /// term in `refresh_indicator`.
    cond_depends: Vec<Vec<VarId>>,
    /// Which variables a conditional's handlers perturb directly in the
    /// backend (discontinuities that need re-pulling into the arena).
    handler_targets: Vec<Vec<VarId>>,
    /// Per-conditional bump width, grown by `z_mul` (capped at `dt_zmax`)
    /// each time `confirm_crossing` comes back empty-handed, and reset to
    /// `options.dt_zc` on a genuine crossing — an anti-chatter widening so a
    /// conditional that keeps grazing zero at the same fixed bump width
    /// doesn't keep re-missing it by the same margin forever.
    dt_zc_current: Vec<f64>,
    bin_opt: BinOptimizer,
    /// The floor every predicted delta is clamped against. Starts at
    /// `options.dt_min`, doubled (capped at `options.dt_max / 2`) by the
    /// pass-limit watchdog's soft phase when a superdense instant keeps
    /// generating new events without real time advancing.
    sim_dt_min: f64,
    /// The real time the current run of same-instant micro-steps is
    /// anchored to; `active_step` only keeps incrementing while a
    /// reschedule target equals this.
    active_time: f64,
    active_step: u32,
    /// Fixed at construction: the earliest time `numerical_coeffs_batch`
    /// may look behind without reading before the run began.
    start_time: f64,
    bin_size_sum: u64,
    bin_batches: u64,
    /// Set by `run_segment` when a boundary batch was held back (reinserted
    /// rather than dispatched) so the caller could observe state just
    /// before it; cleared once that same batch comes back around and is
    /// actually dispatched. Without this, a held-back boundary would be
    /// reinserted again on every subsequent call, forever.
    pending_boundary: bool,
    time: f64,
    stats: SimStats,
}

impl<B: ModelBackend> Simulation<B> {
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    /// Whether `run`/`run_segment` have nothing left to do at or before
    /// `options.t_end`: the backend requested termination, or the event
    /// queue holds nothing left at or before `t_end`. `self.time` itself
    /// isn't a reliable completion check — the last dispatched event lands
    /// wherever the queue put it, not necessarily exactly on `t_end`.
    pub fn is_exhausted(&self) -> bool {
        self.stats.terminated
            || self.queue.peek_time().map_or(true, |top| top.time > self.options.t_end)
    }

    /// The variable's current continuous value, evaluated at the
    /// simulation's present time.
    pub fn value(&self, id: VarId) -> f64 {
        let v = self.arena.get(id);
        v.continuous_value(self.time - v.last_quantization_time())
    }

    /// The variable's continuous value extrapolated to an arbitrary `t`,
    /// rather than the simulation's current time — the read side of
    /// sampled output: emitting formatted output on a cadence is out of
    /// scope, but reading a variable's trajectory at a chosen output time
    /// isn't. Valid for any `t` at or after the variable's
    /// `last_quantization_time`.
    pub fn value_at(&self, id: VarId, t: f64) -> f64 {
        let v = self.arena.get(id);
        v.continuous_value(t - v.last_quantization_time())
    }

    fn owner_event_kind(&self, id: VarId) -> EventKind {
        match self.arena.get(id).kind {
            VariableKind::Discrete => EventKind::Discrete(id.0),
            VariableKind::Input => EventKind::QssInputRequantization(id.0),
            _ => match self.graph.category_of(id) {
                Category::RealActive => EventKind::QssRRequantization(id.0),
                Category::ZeroCrossing => EventKind::QssZcRequantization(id.0),
                _ => EventKind::QssRequantization(id.0),
            },
        }
    }

    fn all_state_refs(&self) -> Vec<BackendRef> {
        (0..self.arena.len()).map(|i| self.refmap.state_ref(VarId(EntityId(i as u32)))).collect()
    }

    /// The time-step clamp every `advance_*`/`refresh_trajectory` call uses:
    /// `sim_dt_min` (not the static `options.dt_min` — the watchdog may have
    /// widened it) paired with the run's configured ceiling and inflection
    /// settings.
    fn step_clamp(&self) -> StepClamp {
        StepClamp {
            dt_min: self.sim_dt_min,
            dt_max: self.options.dt_max,
            dt_inf: self.options.dt_inf,
            inflection: self.options.inflection,
            inflection_frac: self.options.inflection_frac,
        }
    }

    /// The numerical-differencing step, grown toward `dt_nd_max` with the
    /// bin optimizer's observed event velocity when `dt_nd_optimizer` is
    /// set — a burst of closely-spaced events is exactly when a coarser
    /// `dt_nd` still resolves the derivative well enough and saves backend
    /// round-trips.
    fn effective_dt_nd(&self) -> f64 {
        if self.options.dt_nd_optimizer {
            (self.options.dt_nd * (1.0 + self.bin_opt.velocity())).min(self.options.dt_nd_max)
        } else {
            self.options.dt_nd
        }
    }

    fn initialize(&mut self) -> Result<(), RuntimeError> {
        push_states(&mut self.backend, &self.refmap, &self.arena, 0.0)?;
        for i in 0..self.arena.len() {
            let id = VarId(EntityId(i as u32));
            let next = self.requantize_owner(0.0, id)?;
            let kind = self.owner_event_kind(id);
            self.var_handles[id.index()] = self.queue.insert(kind, SuperdenseTime::origin(next));
        }
        self.cond_handles = vec![QueueHandle(0); self.conditionals.len()];
        for i in 0..self.conditionals.len() {
            let id = ConditionalId(EntityId(i as u32));
            let next = self.refresh_indicator(0.0, id)?;
            self.cond_handles[id.index()] =
                self.queue.insert(EventKind::ZeroCrossingReached(id.0), SuperdenseTime::origin(next));
        }
        Ok(())
    }

    /// Pull the owner's fresh continuous value from the backend, recompute
    /// its derivative (via the explicit or LIQSS bracket rule, per its
    /// kind), requantize, and propagate the change to every observer and
    /// watching conditional. Returns the owner's own next predicted event
    /// time. Shared by ordinary scheduled requantizations and by
    /// post-handler state reinitialization (`dispatch_event`'s `Handler`
    /// arm) — both are "pull whatever the backend has now and requantize".
    fn requantize_owner(&mut self, now: f64, id: VarId) -> Result<f64, RuntimeError> {
        let kind = self.arena.get(id).kind;
        let clamp = self.step_clamp();
        let next = if matches!(kind, VariableKind::Discrete | VariableKind::Input) {
            let r = self.refmap.state_ref(id);
            let x0 = self.backend.get_reals(&[r])?[0];
            self.arena.get_mut(id).advance_explicit(now, x0, &[], clamp);
            now + self.options.dt_inf
        } else if kind.is_implicit() {
            let r = self.refmap.state_ref(id);
            let x0 = self.backend.get_reals(&[r])?[0];
            let quantum = self.arena.get(id).quantum();
            let (d_minus, d_plus) =
                liqss_bracket_derivatives(&mut self.backend, &self.refmap, id, x0, quantum)?;
            let chosen = if d_plus >= 0.0 && d_minus <= 0.0 {
                0.5 * (d_minus + d_plus)
            } else if d_plus > 0.0 {
                d_plus
            } else {
                d_minus
            };
            let higher = self.liqss_higher_order(id, chosen)?;
            self.arena.get_mut(id).advance_liqss(now, x0, d_minus, d_plus, &higher, clamp)
        } else {
            let r = self.refmap.state_ref(id);
            let x0 = self.backend.get_reals(&[r])?[0];
            let bucket = [id];
            let dt_nd = self.effective_dt_nd();
            let coeffs = recompute_bucket(
                &mut self.backend,
                &self.refmap,
                &self.arena,
                &bucket,
                self.options.derivative_mode,
                now,
                dt_nd,
                self.start_time,
                self.options.max_threads,
            )?;
            self.arena.get_mut(id).advance_explicit(now, x0, &coeffs[0], clamp)
        };
        self.propagate_from(now, id)?;
        Ok(next)
    }

    /// The LIQSS second/third Taylor coefficients: chained directional
    /// derivatives seeded with the bracket-chosen top coefficient, not the
    /// stale one `recompute_bucket` would otherwise substitute. LIQSS's
    /// perturb/restore dance is already inherently per-variable, so unlike
    /// the explicit family this isn't batched across a bucket.
    fn liqss_higher_order(&mut self, id: VarId, chosen_x1: f64) -> Result<Vec<f64>, RuntimeError> {
        let order = self.arena.get(id).order;
        if order < 2 {
            return Ok(Vec::new());
        }
        let deriv_ref = self.refmap.deriv_ref(id);
        let state_refs = self.all_state_refs();

        let mut seed1: Vec<f64> =
            self.arena.iter().map(|v| v.continuous_coeffs().get(1).copied().unwrap_or(0.0)).collect();
        seed1[id.index()] = chosen_x1;
        let d2_raw = self.backend.get_directional_derivatives(&state_refs, &seed1, &[deriv_ref])?[0];
        let mut out = vec![d2_raw / 2.0];
        if order >= 3 {
            let mut seed2: Vec<f64> = self
                .arena
                .iter()
                .map(|v| v.continuous_coeffs().get(2).map(|c| c * 2.0).unwrap_or(0.0))
                .collect();
            seed2[id.index()] = d2_raw;
            let d3_raw = self.backend.get_directional_derivatives(&state_refs, &seed2, &[deriv_ref])?[0];
            out.push(d3_raw / 6.0);
        }
        Ok(out)
    }

    /// Refresh every observer of `owner` (fresh derivative, same continuous
    /// value, re-anchored `q`) and every conditional watching `owner`
    /// (fresh indicator coefficients), rescheduling each in the queue.
    fn propagate_from(&mut self, now: f64, owner: VarId) -> Result<(), RuntimeError> {
        let observers = self.graph.observers_of(owner).to_vec();
        if !observers.is_empty() {
            push_states(&mut self.backend, &self.refmap, &self.arena, now)?;
            let dt_nd = self.effective_dt_nd();
            let coeffs = recompute_bucket(
                &mut self.backend,
                &self.refmap,
                &self.arena,
                &observers,
                self.options.derivative_mode,
                now,
                dt_nd,
                self.start_time,
                self.options.max_threads,
            )?;
            let clamp = self.step_clamp();
            for (obs_id, c) in observers.iter().zip(coeffs) {
                let r = self.refmap.state_ref(*obs_id);
                let x0 = self.backend.get_reals(&[r])?[0];
                let next = self.arena.get_mut(*obs_id).refresh_trajectory(now, x0, &c, clamp);
                let sdt = self.next_sdt(next);
                self.reschedule_var(*obs_id, sdt);
            }
        }

        let watchers = self.var_watchers[owner.index()].clone();
        for cond_id in watchers {
            if self.conditionals.get(cond_id).state() == ConditionalState::Armed {
                let next = self.refresh_indicator(now, cond_id)?;
                let sdt = self.next_sdt(next);
                self.reschedule_cond(cond_id, sdt);
            }
        }
        Ok(())
    }

    /// Refresh a conditional's indicator polynomial. `get_event_indicators`
    /// exposes no directional-derivative protocol of its own (unlike state
    /// derivatives), and an indicator is in general a function of both time
    /// and state, so this estimates `dz/dt` as the sum of two
    /// central-difference terms: bumping the backend's clock `+-dt_nd` at
    /// the current state (the explicit time dependence), plus, for every
    /// state variable the indicator reads, perturbing that variable by
    /// `+-`its quantum at the current time and scaling by the variable's
    /// own `dx/dt` (chain rule, the same perturb/restore shape as the LIQSS
    /// bracket). A pure-time indicator (no watched states) and a
    /// pure-state indicator (constant in time) both fall out of this as the
    /// special case where one term vanishes.
    fn refresh_indicator(&mut self, now: f64, cond_id: ConditionalId) -> Result<f64, RuntimeError> {
        let idx = cond_id.index();
        let dt = self.effective_dt_nd().max(f64::EPSILON);

        self.backend.set_time(now)?;
        let z0 = self.backend.get_event_indicators()?[idx];
        self.backend.set_time(now + dt)?;
        let z_t_plus = self.backend.get_event_indicators()?[idx];
        self.backend.set_time(now - dt)?;
        let z_t_minus = self.backend.get_event_indicators()?[idx];
        self.backend.set_time(now)?;
        let mut z1 = (z_t_plus - z_t_minus) / (2.0 * dt);

        for dep in self.cond_depends[idx].clone() {
            let var = self.arena.get(dep);
            if var.order == 0 {
                continue;
            }
            let dx_dt = var.continuous_coeffs()[1];
            let h = var.quantum().max(1.0e-10);
            let r = self.refmap.state_ref(dep);
            let x0 = self.backend.get_reals(&[r])?[0];
            self.backend.set_reals(&[r], &[x0 + h])?;
            let z_x_plus = self.backend.get_event_indicators()?[idx];
            self.backend.set_reals(&[r], &[x0 - h])?;
            let z_x_minus = self.backend.get_event_indicators()?[idx];
            self.backend.set_reals(&[r], &[x0])?;
            z1 += (z_x_plus - z_x_minus) / (2.0 * h) * dx_dt;
        }

        let cond = self.conditionals.get_mut(cond_id);
        cond.indicator.update(now, z0, &[z1]);
        Ok(now + cond.indicator.predict_root())
    }

    /// The superdense time to schedule `t` at: a fresh micro-step
    /// (`SuperdenseTime::origin`) unless `t` is exactly the instant the
    /// current pass is processing, in which case it's the next micro-step
    /// of the same instant. `SuperdenseTime::origin` always resets `step`
    /// to 0, which would silently defeat a step-based pass-limit watchdog
    /// for a same-real-time chatter cycle — every reschedule would look
    /// like a brand new event instead of another lap of the same stall.
    fn next_sdt(&mut self, t: f64) -> SuperdenseTime {
        if t == self.active_time {
            self.active_step += 1;
            SuperdenseTime::new(t, self.active_step)
        } else {
            self.active_time = t;
            self.active_step = 0;
            SuperdenseTime::origin(t)
        }
    }

    fn reschedule_var(&mut self, id: VarId, sdt: SuperdenseTime) {
        if self.queue.reschedule(self.var_handles[id.index()], sdt).is_none() {
            let kind = self.owner_event_kind(id);
            self.var_handles[id.index()] = self.queue.insert(kind, sdt);
        }
    }

    fn reschedule_cond(&mut self, id: ConditionalId, sdt: SuperdenseTime) {
        if self.queue.reschedule(self.cond_handles[id.index()], sdt).is_none() {
            self.cond_handles[id.index()] = self.queue.insert(EventKind::ZeroCrossingReached(id.0), sdt);
        }
    }

    /// An event's own natural scheduling gap `Δt = tE - tQ`: how long it's
    /// been (or will have been) since the entity it targets last refreshed
    /// its trajectory. `Conditional`/`Handler` events have no such gap (they
    /// already belong to the exact-tie batch, not a bin candidate) and are
    /// given `+∞` so they never gate bin membership.
    fn natural_gap(&self, rec: &EventRecord) -> f64 {
        match rec.kind {
            EventKind::Conditional(_) | EventKind::Handler(_) => f64::INFINITY,
            EventKind::ZeroCrossingReached(eid) => {
                let cond_id = ConditionalId(eid);
                (rec.sdt.time - self.conditionals.get(cond_id).indicator.last_eval_time()).max(0.0)
            }
            _ => {
                let id = VarId(rec.kind.target());
                (rec.sdt.time - self.arena.get(id).last_quantization_time()).max(0.0)
            }
        }
    }

    /// Pop every event at the current superdense top, then widen the batch
    /// with whatever trailing events are still "about as due" as the batch
    /// they'd join: a trailing candidate's own natural gap
    /// must be within `bin_frac` of `Δt_top`, the smallest gap across the
    /// exact-tie batch just popped. Events looked ahead but rejected by
    /// [`qss_binopt::select_bin`] are put back.
    fn gather_bin(&mut self) -> Result<Vec<EventRecord>, RuntimeError> {
        let batch = self.queue.pop_all_at_top();
        let delta_top = batch.iter().map(|r| self.natural_gap(r)).fold(f64::INFINITY, f64::min);
        if !delta_top.is_finite() || delta_top <= 0.0 {
            return Ok(batch);
        }

        let bin_size = self.bin_opt.effective_bin_size();
        let mut lookahead = Vec::new();
        while lookahead.len() < bin_size {
            if self.queue.peek_time().is_none() {
                break;
            }
            lookahead.push(self.queue.pop_top().expect("peeked time implies a live top entry"));
        }
        let deltas: Vec<f64> = lookahead.iter().map(|r| self.natural_gap(r)).collect();
        let keep = qss_binopt::select_bin(delta_top, &deltas, self.bin_opt.bin_frac(), bin_size);

        let mut batch = batch;
        batch.extend(lookahead.drain(..keep));
        for leftover in lookahead {
            let handle = self.queue.insert(leftover.kind, leftover.sdt);
            match leftover.kind {
                EventKind::Conditional(id) | EventKind::Handler(id) | EventKind::ZeroCrossingReached(id) => {
                    self.cond_handles[ConditionalId(id).index()] = handle;
                }
                _ => {
                    self.var_handles[VarId(leftover.kind.target()).index()] = handle;
                }
            }
        }
        Ok(batch)
    }

    /// Whether dispatching `kind` would change a declared connected output
    /// or one of its observers — the natural boundary a connected-output
    /// driver segment run stops at.
    fn touches_connected_output(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Conditional(_) | EventKind::Handler(_) | EventKind::ZeroCrossingReached(_) => false,
            _ => {
                let v = self.arena.get(VarId(kind.target()));
                v.connected_output() || v.connected_output_observer()
            }
        }
    }

    /// Reinsert a batch exactly as popped, restoring the handle bookkeeping
    /// — used when a connected-output segment run stops before dispatching
    /// a batch it already gathered.
    fn reinsert_batch(&mut self, batch: Vec<EventRecord>) {
        for rec in batch {
            let handle = self.queue.insert(rec.kind, rec.sdt);
            match rec.kind {
                EventKind::Conditional(id) | EventKind::Handler(id) | EventKind::ZeroCrossingReached(id) => {
                    self.cond_handles[ConditionalId(id).index()] = handle;
                }
                _ => {
                    self.var_handles[VarId(rec.kind.target()).index()] = handle;
                }
            }
        }
    }

    fn dispatch_event(&mut self, now: f64, rec: EventRecord) -> Result<(), RuntimeError> {
        match rec.kind {
            EventKind::QssRequantization(eid)
            | EventKind::QssZcRequantization(eid)
            | EventKind::QssRRequantization(eid)
            | EventKind::QssInputRequantization(eid)
            | EventKind::Discrete(eid) => {
                let id = VarId(eid);
                let next = self.requantize_owner(now, id)?;
                let sdt = self.next_sdt(next);
                self.var_handles[id.index()] = self.queue.insert(rec.kind, sdt);
                self.stats.quantization_events += 1;
            }
            EventKind::ZeroCrossingReached(eid) => {
                let cond_id = ConditionalId(eid);
                let idx = cond_id.index();
                let dt_zc = self.dt_zc_current[idx];
                let crossed = {
                    let cond = self.conditionals.get_mut(cond_id);
                    cond.confirm_crossing(&mut self.backend, idx, now, dt_zc)?
                };
                if crossed {
                    self.dt_zc_current[idx] = self.options.dt_zc;
                    self.cond_handles[cond_id.index()] =
                        self.queue.insert(EventKind::Conditional(eid), rec.sdt.next_step());
                    self.stats.zero_crossing_events += 1;
                } else {
                    self.dt_zc_current[idx] = (dt_zc * self.options.z_mul).min(self.options.dt_zmax);
                    let next = self.refresh_indicator(now, cond_id)?;
                    let sdt = self.next_sdt(next);
                    self.cond_handles[cond_id.index()] = self.queue.insert(EventKind::ZeroCrossingReached(eid), sdt);
                }
            }
            EventKind::Conditional(eid) => {
                let cond_id = ConditionalId(eid);
                let terminate = self.conditionals.get_mut(cond_id).fire_handlers(&mut self.backend)?;
                self.stats.conditional_firings += 1;
                self.stats.terminated |= terminate;
                self.cond_handles[cond_id.index()] =
                    self.queue.insert(EventKind::Handler(eid), rec.sdt.next_step());
            }
            EventKind::Handler(eid) => {
                let cond_id = ConditionalId(eid);
                let affected = self.handler_targets[cond_id.index()].clone();
                for v in affected {
                    let next = self.requantize_owner(now, v)?;
                    let sdt = self.next_sdt(next);
                    self.reschedule_var(v, sdt);
                }
                let dt_zc = self.dt_zc_current[cond_id.index()];
                let renewed = {
                    let cond = self.conditionals.get_mut(cond_id);
                    cond.reverify_after_handlers(&mut self.backend, cond_id.index(), now, dt_zc)?
                };
                if renewed {
                    self.stats.unpredicted_zero_crossings += 1;
                }
                self.conditionals.get_mut(cond_id).rearm();
                let next = self.refresh_indicator(now, cond_id)?;
                let sdt = self.next_sdt(next);
                self.cond_handles[cond_id.index()] = self.queue.insert(EventKind::ZeroCrossingReached(eid), sdt);
            }
        }
        Ok(())
    }

    /// Enforce the pass-limit watchdog against the instant about to be
    /// processed: a soft phase that widens `sim_dt_min`
    /// once the same instant has generated `pass_limit` micro-steps without
    /// real time advancing, and a hard phase — `pass_limit *
    /// max_pass_count_multiplier` micro-steps — that aborts the run. Uses
    /// `top.step` directly rather than a separate stall counter, since
    /// `next_sdt` is what keeps that step count meaningful across repeated
    /// same-instant reschedules.
    fn enforce_pass_limit(&mut self, top: SuperdenseTime) -> Result<(), RuntimeError> {
        let hard_limit = self.options.pass_limit.saturating_mul(self.options.max_pass_count_multiplier);
        if top.step >= hard_limit {
            return Err(RuntimeError::PassLimitExceeded { time: top.time, count: top.step });
        }
        if top.step >= self.options.pass_limit {
            self.sim_dt_min = (self.sim_dt_min * 2.0).min(self.options.dt_max / 2.0);
        }
        Ok(())
    }

    fn dispatch_batch(&mut self, now: f64, batch: Vec<EventRecord>) -> Result<(), RuntimeError> {
        let batch_len = batch.len() as u64;
        self.bin_size_sum += batch_len;
        self.bin_batches += 1;
        if batch_len > 1 {
            self.stats.simultaneous_batches += 1;
        }
        for rec in batch {
            self.dispatch_event(now, rec)?;
        }
        self.check_completed_step(now)
    }

    fn finish_pass(&mut self, now: f64) {
        self.time = now;
        self.stats.steps += 1;
    }

    fn finalize_stats(&mut self, elapsed: std::time::Duration) {
        self.stats.final_time = self.time;
        self.stats.average_bin_size =
            if self.bin_batches > 0 { self.bin_size_sum as f64 / self.bin_batches as f64 } else { 0.0 };
        self.stats.elapsed += elapsed;
    }

    /// Drive the queue forward until nothing remains scheduled at or before
    /// `t_end`.
    pub fn run(&mut self) -> Result<SimStats, RuntimeError> {
        let started = std::time::Instant::now();
        let t_end = self.options.t_end;

        while let Some(top) = self.queue.peek_time() {
            if top.time > t_end {
                break;
            }
            let now = top.time;
            if now != self.active_time {
                self.active_time = now;
                self.active_step = 0;
            }
            self.enforce_pass_limit(top)?;

            self.bin_opt.observe(now);
            let batch = self.gather_bin()?;
            self.dispatch_batch(now, batch)?;
            self.finish_pass(now);
            if self.stats.terminated {
                break;
            }
        }
        self.finalize_stats(started.elapsed());
        Ok(self.stats.clone())
    }

    /// Like [`Self::run`], but hands control back at the first batch that
    /// would change a declared connected output or one of its observers,
    /// instead of running on to `t_end` in one pass — the segment boundary
    /// a connected-output driver reports state across before resuming.
    ///
    /// With `options.perfect` set, a boundary batch is dispatched
    /// immediately and the call stops right after (the model's output is
    /// never reported one batch stale). Otherwise the first time a new
    /// boundary is seen, its batch is put back and the call stops strictly
    /// before it — `pending_boundary` remembers that across the call
    /// boundary so the *next* call dispatches that same batch (rather than
    /// reinserting it again forever) and stops right after crossing it.
    pub fn run_segment(&mut self) -> Result<SimStats, RuntimeError> {
        let started = std::time::Instant::now();
        let t_end = self.options.t_end;

        loop {
            let Some(top) = self.queue.peek_time() else { break };
            if top.time > t_end {
                break;
            }
            let now = top.time;
            if now != self.active_time {
                self.active_time = now;
                self.active_step = 0;
            }
            self.enforce_pass_limit(top)?;

            self.bin_opt.observe(now);
            let batch = self.gather_bin()?;
            let boundary = batch.iter().any(|rec| self.touches_connected_output(rec.kind));
            let resuming_boundary = std::mem::take(&mut self.pending_boundary);

            if boundary && !resuming_boundary && !self.options.perfect {
                self.reinsert_batch(batch);
                self.pending_boundary = true;
                break;
            }

            self.dispatch_batch(now, batch)?;
            self.finish_pass(now);
            if boundary || self.stats.terminated {
                break;
            }
        }
        self.finalize_stats(started.elapsed());
        Ok(self.stats.clone())
    }

    /// Ask the backend whether this pass's changes demand immediate event
    /// handling or a stop, the way a step-based FMI-ME importer would after
    /// every integrator step. Most backends never raise either flag (QSS
    /// predicts its own events from the indicator polynomial); a backend
    /// that detects a condition the polynomial missed — the ball testkit
    /// flags this once height has already gone non-positive — gets a
    /// same-instant confirmation check instead of waiting for its already
    /// scheduled `ZeroCrossingReached`. A crossing confirmed this way is, by
    /// construction, one the indicator's own root prediction didn't catch
    /// in time — counted as `unpredicted_zero_crossings`.
    fn check_completed_step(&mut self, now: f64) -> Result<(), RuntimeError> {
        let info = self.backend.completed_integrator_step()?;
        if info.enter_event_mode {
            for i in 0..self.conditionals.len() {
                let cond_id = ConditionalId(EntityId(i as u32));
                if self.conditionals.get(cond_id).state() != ConditionalState::Armed {
                    continue;
                }
                let dt_zc = self.dt_zc_current[cond_id.index()];
                let crossed = {
                    let cond = self.conditionals.get_mut(cond_id);
                    cond.confirm_crossing(&mut self.backend, i, now, dt_zc)?
                };
                if crossed {
                    self.dt_zc_current[cond_id.index()] = self.options.dt_zc;
                    self.queue.erase(self.cond_handles[cond_id.index()]);
                    let sdt = self.next_sdt(now);
                    self.cond_handles[cond_id.index()] = self.queue.insert(EventKind::Conditional(cond_id.0), sdt);
                    self.stats.zero_crossing_events += 1;
                    self.stats.unpredicted_zero_crossings += 1;
                }
            }
        }
        self.stats.terminated |= info.terminate;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qss_backend::testkit::ExponentialDecayBackend;
    use qss_options::QssMethod;

    fn options(method: QssMethod, t_end: f64) -> Options {
        let mut o = Options::default();
        o.qss_method = method;
        o.t_end = t_end;
        o
    }

    #[test]
    fn pass_limit_exceeded_error_names_the_stuck_time() {
        let err = RuntimeError::PassLimitExceeded { time: 3.5, count: 42 };
        let msg = format!("{err}");
        assert!(msg.contains("3.5"));
        assert!(msg.contains("42"));
    }

    #[test]
    fn relaxation_option_categorizes_state_variables_as_real_active() {
        let mut opts = options(QssMethod::Qss2, 1.0);
        opts.relaxation = true;
        let mut builder = SimulationBuilder::new(ExponentialDecayBackend::new(1.0, 1.0), opts);
        let x = builder.add_state_variable("x", 1.0, 1.0).unwrap();
        let sim = builder.build().unwrap();
        assert_eq!(sim.graph.category_of(x), Category::RealActive);
    }

    #[test]
    fn discrete_and_input_variables_are_categorized_other_x_based() {
        let mut builder = SimulationBuilder::new(ExponentialDecayBackend::new(1.0, 1.0), options(QssMethod::Qss2, 1.0));
        let d = builder.add_discrete_variable("d", 1.0).unwrap();
        let i = builder.add_input_variable("i", 1.0).unwrap();
        let sim = builder.build().unwrap();
        assert_eq!(sim.graph.category_of(d), Category::OtherXBased);
        assert_eq!(sim.graph.category_of(i), Category::OtherXBased);
    }

    #[test]
    fn a_zero_crossing_categorized_variable_dispatches_its_own_event_kind() {
        let mut builder = SimulationBuilder::new(ExponentialDecayBackend::new(1.0, 1.0), options(QssMethod::Qss1, 1.0));
        let x = builder.add_state_variable("x", 1.0, 1.0).unwrap();
        builder.set_category(x, Category::ZeroCrossing);
        let sim = builder.build().unwrap();
        assert_eq!(sim.owner_event_kind(x), EventKind::QssZcRequantization(x.0));
    }

    #[test]
    fn self_observer_flag_is_copied_from_the_graph_onto_the_variable() {
        let mut builder = SimulationBuilder::new(ExponentialDecayBackend::new(1.0, 1.0), options(QssMethod::Qss2, 1.0));
        let x = builder.add_state_variable("x", 1.0, 1.0).unwrap();
        builder.observe(x, x);
        let sim = builder.build().unwrap();
        assert!(sim.arena.get(x).self_observer());
    }
}
