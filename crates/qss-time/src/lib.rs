//! Superdense time and the tagged event-kind record shared by every other
//! crate in the workspace.
//!
//! Kept dependency-free and tiny on purpose: `SuperdenseTime`, `EntityId`,
//! and `EventKind` are the vocabulary every other crate (queue, variable
//! arena, observer graph, zero-crossing dispatcher, simulation loop) shares,
//! so they live at the bottom of the dependency graph rather than owned by
//! whichever crate happens to need them first.

use std::cmp::Ordering;
use std::fmt;

/// `(real time, micro-step)` total order used to break ties among events
/// scheduled at the same real time. Lexicographic: `time` dominates, `step`
/// breaks ties.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuperdenseTime {
    pub time: f64,
    pub step: u32,
}

impl SuperdenseTime {
    pub const fn new(time: f64, step: u32) -> Self {
        Self { time, step }
    }

    /// The superdense time for the very start of a run.
    pub const fn origin(time: f64) -> Self {
        Self { time, step: 0 }
    }

    /// A superdense time strictly after `self` at the same real time,
    /// i.e. the next micro-step. Used when scheduling an event that must
    /// follow another at an identical real time (e.g. a Handler event one
    /// micro-step after its Conditional).
    pub const fn next_step(self) -> Self {
        Self {
            time: self.time,
            step: self.step + 1,
        }
    }
}

impl Eq for SuperdenseTime {}

impl PartialOrd for SuperdenseTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SuperdenseTime {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.time.partial_cmp(&other.time) {
            Some(Ordering::Equal) | None => self.step.cmp(&other.step),
            Some(ord) => ord,
        }
    }
}

impl fmt::Display for SuperdenseTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.time, self.step)
    }
}

/// Arena index for a variable or conditional. Variables and conditionals
/// each own a disjoint arena (see `qss-var::VarArena`, `qss-zc::ConditionalArena`)
/// so an `EntityId` is only meaningful relative to the arena it indexes;
/// nothing here prevents mixing them up, by design — the owning crates
/// expose typed wrappers (`VarId`, `ConditionalId`) instead of passing this
/// type across their public APIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntityId(pub u32);

impl EntityId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Opaque queue position token. Equal to the actual position of the event
/// in the queue for as long as the event has not been popped; reschedule/
/// cancel operations consume and reissue it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub u64);

/// Tagged union of event kinds the simulation loop dispatches on. Each
/// variant carries the `EntityId` of the variable (or conditional, for
/// `Conditional`/`Handler`) it targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A QSS state variable's predicted requantization time has arrived.
    QssRequantization(EntityId),
    /// A zero-crossing variable's quantized polynomial root prediction is due.
    QssZcRequantization(EntityId),
    /// A Real-active observer variable's requantization (relaxation family).
    QssRRequantization(EntityId),
    /// An input variable's next scheduled function-driven step.
    QssInputRequantization(EntityId),
    /// A discrete (boolean/integer/discrete-real) variable's scheduled update.
    Discrete(EntityId),
    /// A zero-crossing variable's predicted root has been reached; schedule
    /// the bump-time backend probe.
    ZeroCrossingReached(EntityId),
    /// A conditional has fired and must advance backend event mode.
    Conditional(EntityId),
    /// A conditional's handlers must be advanced (one micro-step after its
    /// Conditional event).
    Handler(EntityId),
}

impl EventKind {
    /// The entity (variable or conditional) this event targets.
    pub const fn target(&self) -> EntityId {
        match *self {
            EventKind::QssRequantization(id)
            | EventKind::QssZcRequantization(id)
            | EventKind::QssRRequantization(id)
            | EventKind::QssInputRequantization(id)
            | EventKind::Discrete(id)
            | EventKind::ZeroCrossingReached(id)
            | EventKind::Conditional(id)
            | EventKind::Handler(id) => id,
        }
    }

    /// Short discriminant name, used in trace events and diagnostics.
    pub const fn label(&self) -> &'static str {
        match self {
            EventKind::QssRequantization(_) => "qss_requant",
            EventKind::QssZcRequantization(_) => "qss_zc_requant",
            EventKind::QssRRequantization(_) => "qss_r_requant",
            EventKind::QssInputRequantization(_) => "qss_input_requant",
            EventKind::Discrete(_) => "discrete",
            EventKind::ZeroCrossingReached(_) => "zero_crossing",
            EventKind::Conditional(_) => "conditional",
            EventKind::Handler(_) => "handler",
        }
    }
}

/// A queued event: its kind, its scheduled superdense time, and the handle
/// the queue issued for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub kind: EventKind,
    pub sdt: SuperdenseTime,
    pub handle: QueueHandle,
}

impl EventRecord {
    pub const fn new(kind: EventKind, sdt: SuperdenseTime, handle: QueueHandle) -> Self {
        Self { kind, sdt, handle }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superdense_time_orders_by_real_time_first() {
        let a = SuperdenseTime::new(1.0, 5);
        let b = SuperdenseTime::new(2.0, 0);
        assert!(a < b);
    }

    #[test]
    fn superdense_time_breaks_ties_by_step() {
        let a = SuperdenseTime::new(1.0, 0);
        let b = SuperdenseTime::new(1.0, 1);
        assert!(a < b);
        assert_eq!(a, SuperdenseTime::new(1.0, 0));
    }

    #[test]
    fn next_step_keeps_real_time_bumps_micro_step() {
        let a = SuperdenseTime::new(3.5, 2);
        let b = a.next_step();
        assert_eq!(b.time, 3.5);
        assert_eq!(b.step, 3);
        assert!(a < b);
    }

    #[test]
    fn event_kind_target_extraction() {
        let id = EntityId(7);
        let ev = EventKind::Handler(id);
        assert_eq!(ev.target(), id);
        assert_eq!(ev.label(), "handler");
    }
}
