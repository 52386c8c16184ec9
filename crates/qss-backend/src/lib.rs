//! The `ModelBackend` capability the simulation core consumes.
//!
//! This is the seam: the core never imports an
//! FMU, parses a model description, or knows anything about the model's
//! equations. It asks a `ModelBackend` for values, derivatives, and event
//! indicators, and tells it when to move its clock or enter/leave event
//! mode. A real embedder plugs in an FMI/FMU importer; tests plug in the
//! [`testkit`] analytic models.

use std::fmt;
use thiserror::Error;

/// Reference to a single scalar quantity the backend knows about (a state,
/// a state derivative, or an event indicator). Opaque to the core beyond
/// equality and ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendRef(pub u32);

impl fmt::Display for BackendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vr{}", self.0)
    }
}

/// Severity a backend call failed with, per the §7/§4.9 failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendSeverity {
    /// Logged, simulation continues; the next event at this variable may retry.
    Warning,
    /// Logged, the result of this call is discarded; caller must cope
    /// without it (e.g. treat as unchanged).
    Discard,
    /// Simulation must abort.
    Fatal,
}

/// Error returned by a `ModelBackend` call.
#[derive(Debug, Clone, Error)]
#[error("backend {severity:?}: {message}")]
pub struct BackendError {
    pub severity: BackendSeverity,
    pub message: String,
}

impl BackendError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self { severity: BackendSeverity::Fatal, message: message.into() }
    }
    pub fn warning(message: impl Into<String>) -> Self {
        Self { severity: BackendSeverity::Warning, message: message.into() }
    }
    pub fn discard(message: impl Into<String>) -> Self {
        Self { severity: BackendSeverity::Discard, message: message.into() }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Flags returned by event-mode transitions (FMI's `eventInfo`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventInfo {
    pub enter_event_mode: bool,
    pub terminate: bool,
}

/// Fatal conditions detectable at model-import time (§7 "Fatal init").
/// The importer itself is out of scope; this enum is what a variable's
/// constructor (in `qss-var`) raises when the backend-supplied metadata
/// violates a core invariant.
#[derive(Debug, Clone, Error)]
pub enum InitError {
    #[error("variable '{name}': nominal value must be > 0, got {nominal}")]
    NonPositiveNominal { name: String, nominal: f64 },
    #[error("variable '{name}': start value {declared} does not match computed start value {computed} (exact match required)")]
    StartValueMismatch { name: String, declared: f64, computed: f64 },
    #[error("duplicate variable name '{name}'")]
    DuplicateName { name: String },
    #[error("backend does not provide required capability: {capability}")]
    MissingCapability { capability: String },
    #[error("unsupported QSS method: {method}")]
    UnsupportedMethod { method: String },
    #[error("variable '{name}': non-SI unit '{unit}' on state or event-indicator variable")]
    NonSiUnit { name: String, unit: String },
}

/// The minimum capability the core requires of a model implementation
///. All methods take `&mut self`: backend state (its
/// internal clock, event mode) is mutated by every call, and the core
/// never calls two backend methods concurrently (§5 — the backend is a
/// single exclusive resource).
pub trait ModelBackend {
    /// Move the backend's internal clock to `t`.
    fn set_time(&mut self, t: f64) -> BackendResult<()>;

    /// Push input values into the backend at the refs given.
    fn set_reals(&mut self, refs: &[BackendRef], values: &[f64]) -> BackendResult<()>;

    /// Read current values (states, derivatives, or any other real output)
    /// at the backend's current time.
    fn get_reals(&mut self, refs: &[BackendRef]) -> BackendResult<Vec<f64>>;

    /// `J · v`: the directional derivative of `output_refs` with respect to
    /// `input_refs`, seeded with `input_seeds`, without forming the full
    /// Jacobian. Used to obtain 2nd/3rd derivatives from 1st derivatives.
    fn get_directional_derivatives(
        &mut self,
        input_refs: &[BackendRef],
        input_seeds: &[f64],
        output_refs: &[BackendRef],
    ) -> BackendResult<Vec<f64>>;

    fn enter_event_mode(&mut self) -> BackendResult<EventInfo>;
    fn event_iteration(&mut self) -> BackendResult<EventInfo>;
    fn enter_continuous_mode(&mut self) -> BackendResult<()>;

    /// Current values of the model's event indicators.
    fn get_event_indicators(&mut self) -> BackendResult<Vec<f64>>;

    /// Called after an integrator step completes; returns whether the
    /// backend wants to enter event mode and whether it requests
    /// termination.
    fn completed_integrator_step(&mut self) -> BackendResult<EventInfo>;

    /// The nominal magnitude of a variable, used to resolve its absolute
    /// tolerance when none is configured explicitly (§4.1 supplement).
    /// Must be `> 0` (checked at variable construction, §7 fatal init).
    fn nominal(&self, r: BackendRef) -> f64;
}

#[cfg(feature = "testkit")]
pub mod testkit;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_display_includes_severity_and_message() {
        let e = BackendError::fatal("model diverged");
        let s = format!("{e}");
        assert!(s.contains("Fatal"));
        assert!(s.contains("model diverged"));
    }

    #[test]
    fn init_error_messages_name_the_offending_variable() {
        let e = InitError::NonPositiveNominal { name: "x1".into(), nominal: -1.0 };
        assert!(format!("{e}").contains("x1"));
    }
}
