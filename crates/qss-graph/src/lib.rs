//! The observer/observee dependency graph:
//! when a variable requantizes, every variable whose derivative function
//! reads it must recompute. This crate stores that "who reads me" edge
//! set and hands it back partitioned into the fixed processing order the
//! simulation loop relies on for correctness (invariant I5: a variable's
//! own new derivative must be evaluated using already-updated QSS states,
//! before any real-active relaxation or zero-crossing re-check runs off
//! stale values).
//!
//! Edges are declared once, at model-assembly time (the simulation
//! builder walks the model's sparsity and calls [`ObserverGraph::observe`]
//! for each read), then [`ObserverGraph::finalize`] sorts and dedups every
//! adjacency list exactly once before the first event is processed.

use qss_var::VarId;

/// The four fixed processing buckets observers are grouped into,
/// ascending in processing order. A variable's category reflects its
/// role for propagation purposes, independent of its `qss_var::VariableKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Category {
    /// A plain QSS/LIQSS/xQSS continuous state: recomputed first, since
    /// every other bucket's derivative may read it.
    QssState,
    /// A Real-active (relaxation-family) observer.
    RealActive,
    /// Anything else driven purely by already-updated `x` values (discrete,
    /// input, connection-input).
    OtherXBased,
    /// Zero-crossing indicators: always re-checked last, after every state
    /// that could affect them has settled for this pass.
    ZeroCrossing,
}

impl Category {
    const fn rank(self) -> u8 {
        match self {
            Category::QssState => 0,
            Category::RealActive => 1,
            Category::OtherXBased => 2,
            Category::ZeroCrossing => 3,
        }
    }
}

#[derive(Debug, Default)]
pub struct ObserverGraph {
    category: Vec<Category>,
    observers: Vec<Vec<VarId>>,
    /// Set when a variable observes itself (invariant I5's self-edge
    /// case). Recorded rather than silently dropped: a self-edge carries
    /// no propagation work (the owner's own requantization already
    /// recomputes its own next event), but callers inspecting the model's
    /// wiring need to see that the edge was declared.
    self_observer: Vec<bool>,
    /// Declared connected outputs (the connected-output driver mode).
    connected_output: Vec<bool>,
    /// Derived at `finalize()`: true if a variable observes a declared
    /// connected output.
    connected_output_observer: Vec<bool>,
    /// Derived at `finalize()`: true if a variable observes a QSS state or
    /// an `OtherXBased` (discrete/input) variable.
    has_upstream_state_or_ei_observer: Vec<bool>,
    finalized: bool,
}

impl ObserverGraph {
    /// Create a graph sized for `n` variables, each defaulting to the
    /// `QssState` category until overridden with [`Self::set_category`].
    pub fn new(n: usize) -> Self {
        Self {
            category: vec![Category::QssState; n],
            observers: vec![Vec::new(); n],
            self_observer: vec![false; n],
            connected_output: vec![false; n],
            connected_output_observer: vec![false; n],
            has_upstream_state_or_ei_observer: vec![false; n],
            finalized: false,
        }
    }

    pub fn set_category(&mut self, id: VarId, category: Category) {
        self.category[id.index()] = category;
    }

    pub fn category_of(&self, id: VarId) -> Category {
        self.category[id.index()]
    }

    /// Mark `id` as a declared connected output.
    pub fn mark_connected_output(&mut self, id: VarId) {
        self.connected_output[id.index()] = true;
        self.finalized = false;
    }

    pub fn is_connected_output(&self, id: VarId) -> bool {
        self.connected_output[id.index()]
    }

    pub fn is_self_observer(&self, id: VarId) -> bool {
        self.self_observer[id.index()]
    }

    pub fn is_connected_output_observer(&self, id: VarId) -> bool {
        debug_assert!(self.finalized, "is_connected_output_observer called on an unfinalized graph");
        self.connected_output_observer[id.index()]
    }

    pub fn has_upstream_state_or_ei_observer(&self, id: VarId) -> bool {
        debug_assert!(self.finalized, "has_upstream_state_or_ei_observer called on an unfinalized graph");
        self.has_upstream_state_or_ei_observer[id.index()]
    }

    /// Declare that `observer`'s derivative function reads `owner`'s
    /// value, i.e. `owner` requantizing must trigger `observer`'s
    /// recomputation. A self-edge (`owner == observer`) contributes no
    /// propagation edge — a variable's own requantization already
    /// recomputes its own next event time — but is recorded via
    /// [`Self::is_self_observer`] rather than dropped outright.
    pub fn observe(&mut self, owner: VarId, observer: VarId) {
        if owner == observer {
            self.self_observer[owner.index()] = true;
            return;
        }
        self.observers[owner.index()].push(observer);
        self.finalized = false;
    }

    /// Sort and dedup every owner's observer list into fixed bucket order
    /// (`QssState` < `RealActive` < `OtherXBased` < `ZeroCrossing`), stable
    /// by first-declared order within a bucket. Idempotent; cheap to call
    /// again after further `observe` calls.
    pub fn finalize(&mut self) {
        let category = &self.category;
        for list in &mut self.observers {
            let mut seen = vec![false; category.len()];
            list.retain(|v| {
                let idx = v.index();
                if seen[idx] {
                    false
                } else {
                    seen[idx] = true;
                    true
                }
            });
            list.sort_by_key(|v| category[v.index()].rank());
        }

        self.connected_output_observer.iter_mut().for_each(|v| *v = false);
        self.has_upstream_state_or_ei_observer.iter_mut().for_each(|v| *v = false);
        for owner_idx in 0..self.observers.len() {
            let owner_is_connected_output = self.connected_output[owner_idx];
            let owner_is_upstream = matches!(category[owner_idx], Category::QssState | Category::OtherXBased);
            for &observer in &self.observers[owner_idx] {
                if owner_is_connected_output {
                    self.connected_output_observer[observer.index()] = true;
                }
                if owner_is_upstream {
                    self.has_upstream_state_or_ei_observer[observer.index()] = true;
                }
            }
        }
        self.finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Whether the observer edges contain a cycle (excluding self-edges,
    /// which `observe` already turns away from the adjacency lists). A
    /// cycle means some variable's derivative transitively depends on its
    /// own not-yet-updated value within a single pass — diagnostic only,
    /// the processing-order buckets don't themselves detect it.
    pub fn has_cycle(&self) -> bool {
        let n = self.observers.len();
        const UNVISITED: u8 = 0;
        const VISITING: u8 = 1;
        const DONE: u8 = 2;
        let mut mark = vec![UNVISITED; n];
        let mut stack = Vec::new();

        fn visit(
            node: usize,
            observers: &[Vec<VarId>],
            mark: &mut [u8],
            stack: &mut Vec<usize>,
        ) -> bool {
            match mark[node] {
                DONE => return false,
                VISITING => return true,
                _ => {}
            }
            mark[node] = VISITING;
            stack.push(node);
            for next in &observers[node] {
                if visit(next.index(), observers, mark, stack) {
                    return true;
                }
            }
            stack.pop();
            mark[node] = DONE;
            false
        }

        (0..n).any(|start| mark[start] == UNVISITED && visit(start, &self.observers, &mut mark, &mut stack))
    }

    /// The variables that must recompute when `owner` changes, in fixed
    /// bucket order. Panics in debug builds if called before `finalize`
    /// runs at least once after the last `observe` call, since an
    /// unfinalized list may contain duplicates or be out of bucket order.
    pub fn observers_of(&self, owner: VarId) -> &[VarId] {
        debug_assert!(self.finalized, "observers_of called on an unfinalized graph");
        &self.observers[owner.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qss_time::EntityId;

    fn id(i: u32) -> VarId {
        VarId(EntityId(i))
    }

    #[test]
    fn observers_are_grouped_into_fixed_bucket_order() {
        let mut g = ObserverGraph::new(4);
        g.set_category(id(1), Category::ZeroCrossing);
        g.set_category(id(2), Category::QssState);
        g.set_category(id(3), Category::RealActive);
        g.observe(id(0), id(1));
        g.observe(id(0), id(2));
        g.observe(id(0), id(3));
        g.finalize();
        let observers = g.observers_of(id(0));
        assert_eq!(observers, &[id(2), id(3), id(1)]);
    }

    #[test]
    fn duplicate_edges_are_deduped_on_finalize() {
        let mut g = ObserverGraph::new(2);
        g.observe(id(0), id(1));
        g.observe(id(0), id(1));
        g.finalize();
        assert_eq!(g.observers_of(id(0)), &[id(1)]);
    }

    #[test]
    fn self_edges_contribute_no_propagation_but_are_recorded() {
        let mut g = ObserverGraph::new(2);
        g.observe(id(0), id(0));
        g.finalize();
        assert!(g.observers_of(id(0)).is_empty());
        assert!(g.is_self_observer(id(0)));
        assert!(!g.is_self_observer(id(1)));
    }

    #[test]
    fn connected_output_observer_and_upstream_flags_are_derived_on_finalize() {
        let mut g = ObserverGraph::new(3);
        g.set_category(id(1), Category::OtherXBased);
        g.mark_connected_output(id(0));
        g.observe(id(0), id(1));
        g.observe(id(1), id(2));
        g.finalize();
        assert!(g.is_connected_output_observer(id(1)));
        assert!(!g.is_connected_output_observer(id(2)));
        assert!(g.has_upstream_state_or_ei_observer(id(1)), "observes a QssState owner");
        assert!(g.has_upstream_state_or_ei_observer(id(2)), "observes an OtherXBased owner");
    }

    #[test]
    fn has_cycle_detects_a_mutual_observer_loop() {
        let mut g = ObserverGraph::new(2);
        g.observe(id(0), id(1));
        g.observe(id(1), id(0));
        g.finalize();
        assert!(g.has_cycle());
    }

    #[test]
    fn has_cycle_is_false_for_a_dag() {
        let mut g = ObserverGraph::new(3);
        g.observe(id(0), id(1));
        g.observe(id(1), id(2));
        g.finalize();
        assert!(!g.has_cycle());
    }

    #[test]
    fn refinalize_after_more_edges_stays_correct() {
        let mut g = ObserverGraph::new(3);
        g.observe(id(0), id(1));
        g.finalize();
        g.observe(id(0), id(2));
        g.finalize();
        assert_eq!(g.observers_of(id(0)), &[id(1), id(2)]);
    }
}
