//! Global, read-only simulation configuration: the QSS method selector,
//! tolerances, time-step clamps, and feature toggles.
//!
//! `Options` is constructed once (programmatically or from a TOML
//! document) and handed to every variable and to the simulation loop as a
//! shared, immutable reference — never mutated on the hot path. This
//! mirrors the corpus's own config crate (`Config`/`ConfigFile` loaded via
//! `toml`, validated once, then consulted read-only).

use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// The QSS method family. Order is carried by the variant; `Relaxation`
/// and `broadcast` (xQSS) are handled as an orthogonal modifier via
/// [`Options::relaxation`] rather than further variants, matching the
/// original `[n][r][f][LI]QSS(1|2|3)` composition where `r`/`f` are
/// independent of the base method and order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QssMethod {
    Qss1,
    Qss2,
    Qss3,
    Liqss1,
    Liqss2,
    Liqss3,
    Xqss1,
    Xqss2,
    Xqss3,
}

impl QssMethod {
    /// Polynomial order of the continuous representation `x` (1, 2, or 3).
    pub const fn order(self) -> u8 {
        match self {
            QssMethod::Qss1 | QssMethod::Liqss1 | QssMethod::Xqss1 => 1,
            QssMethod::Qss2 | QssMethod::Liqss2 | QssMethod::Xqss2 => 2,
            QssMethod::Qss3 | QssMethod::Liqss3 | QssMethod::Xqss3 => 3,
        }
    }

    /// Whether this method uses the linearly-implicit (LIQSS) bracket
    /// selection rather than a plain explicit derivative.
    pub const fn is_implicit(self) -> bool {
        matches!(self, QssMethod::Liqss1 | QssMethod::Liqss2 | QssMethod::Liqss3)
    }

    /// Whether observers see the full-order `x` polynomial rather than the
    /// truncated `q` (the "broadcast"/xQSS variant).
    pub const fn is_broadcast(self) -> bool {
        matches!(self, QssMethod::Xqss1 | QssMethod::Xqss2 | QssMethod::Xqss3)
    }
}

impl fmt::Display for QssMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QssMethod::Qss1 => "QSS1",
            QssMethod::Qss2 => "QSS2",
            QssMethod::Qss3 => "QSS3",
            QssMethod::Liqss1 => "LIQSS1",
            QssMethod::Liqss2 => "LIQSS2",
            QssMethod::Liqss3 => "LIQSS3",
            QssMethod::Xqss1 => "xQSS1",
            QssMethod::Xqss2 => "xQSS2",
            QssMethod::Xqss3 => "xQSS3",
        };
        f.write_str(s)
    }
}

/// How second/third derivatives are obtained from the backend (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivativeMode {
    /// Directional-derivative calls seeded with observees' derivatives.
    Directional,
    /// Centered/forward numerical differencing at `t ± dtND`.
    Numerical,
}

/// Diagnostic severity, mirroring §7's `{Info, Warning, Error}` levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Default worker count for the intra-event parallel bucket scan
/// (`qss-observe`'s `recompute_bucket`): the host's logical CPU count.
/// Not itself part of the TOML document — a run-time property of the
/// machine the simulation executes on, not a model parameter.
fn default_max_threads() -> usize {
    num_cpus::get()
}

/// Raw, TOML-deserializable configuration document. Every field has a
/// default matching `examples/original_source/src/QSS/options.cc`, so a
/// partially-specified document (or none at all) still produces a usable
/// [`Options`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Options {
    pub qss_method: QssMethod,
    pub derivative_mode: DerivativeMode,
    pub relaxation: bool,
    pub r_tol: f64,
    /// Explicit absolute tolerance; when `None`, each variable resolves it
    /// from `a_fac * rTol * nominal` at construction (§4.1 supplement).
    pub a_tol: Option<f64>,
    pub a_fac: f64,
    pub z_tol: f64,
    pub z_mul: f64,
    pub z_fac: f64,
    pub zr_fac: f64,
    pub za_fac: f64,
    pub dt_min: f64,
    pub dt_max: f64,
    pub dt_inf: f64,
    pub dt_zmax: f64,
    pub dt_zc: f64,
    pub dt_nd: f64,
    pub dt_nd_max: f64,
    pub dt_nd_optimizer: bool,
    pub dt_out: f64,
    pub t_end: f64,
    pub bin_size: usize,
    pub bin_frac: f64,
    pub bin_auto: bool,
    pub pass_limit: u32,
    pub max_pass_count_multiplier: u32,
    pub cycles: bool,
    pub inflection: bool,
    pub inflection_frac: f64,
    pub perfect: bool,
    pub steps: bool,
    pub log_level: LogLevel,
    /// Worker count for `qss-observe`'s data-parallel bucket scan. Not a
    /// model parameter, so it never comes from a TOML document — always
    /// resolved from the host at construction time.
    #[serde(skip, default = "default_max_threads")]
    pub max_threads: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            qss_method: QssMethod::Qss2,
            derivative_mode: DerivativeMode::Directional,
            relaxation: false,
            r_tol: 1.0e-4,
            a_tol: None,
            a_fac: 0.01,
            z_tol: 1.0e-6,
            z_mul: 10.0,
            z_fac: 1.0,
            zr_fac: 10.0,
            za_fac: 0.1,
            dt_min: 0.0,
            dt_max: f64::INFINITY,
            dt_inf: f64::INFINITY,
            dt_zmax: 0.01,
            dt_zc: 1.0e-9,
            dt_nd: 1.0e-6,
            dt_nd_max: 1.0,
            dt_nd_optimizer: false,
            dt_out: 1.0e-3,
            t_end: 1.0,
            bin_size: 1,
            bin_frac: 0.25,
            bin_auto: false,
            pass_limit: 20,
            max_pass_count_multiplier: 2,
            cycles: false,
            inflection: false,
            inflection_frac: 0.05,
            perfect: false,
            steps: false,
            log_level: LogLevel::Warning,
            max_threads: default_max_threads(),
        }
    }
}

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("failed to parse options document: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("rTol must be >= 0, got {0}")]
    NegativeRelativeTolerance(f64),
    #[error("aFac must be > 0, got {0}")]
    NonPositiveAbsoluteFactor(f64),
    #[error("zTol must be >= 0, got {0}")]
    NegativeZeroCrossingTolerance(f64),
    #[error("bin_size must be >= 1, got {0}")]
    ZeroBinSize(usize),
    #[error("bin_frac must be in (0, 1], got {0}")]
    InvalidBinFrac(f64),
    #[error("pass_limit must be >= 1, got {0}")]
    ZeroPassLimit(u32),
    #[error("dt_min must be <= dt_max (dt_min={0}, dt_max={1})")]
    InvertedStepClamp(f64, f64),
}

impl Options {
    /// Parse a TOML document into `Options`, falling back to defaults for
    /// any field the document omits, then validate.
    pub fn from_toml_str(document: &str) -> Result<Self, OptionsError> {
        let options: Options = toml::from_str(document)?;
        options.validate()?;
        Ok(options)
    }

    /// Check the invariants the hot path assumes always hold (fatal-init
    /// class errors from §7 that are detectable from configuration alone,
    /// independent of any particular model).
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.r_tol < 0.0 {
            return Err(OptionsError::NegativeRelativeTolerance(self.r_tol));
        }
        if self.a_fac <= 0.0 {
            return Err(OptionsError::NonPositiveAbsoluteFactor(self.a_fac));
        }
        if self.z_tol < 0.0 {
            return Err(OptionsError::NegativeZeroCrossingTolerance(self.z_tol));
        }
        if self.bin_size == 0 {
            return Err(OptionsError::ZeroBinSize(self.bin_size));
        }
        if !(self.bin_frac > 0.0 && self.bin_frac <= 1.0) {
            return Err(OptionsError::InvalidBinFrac(self.bin_frac));
        }
        if self.pass_limit == 0 {
            return Err(OptionsError::ZeroPassLimit(self.pass_limit));
        }
        if self.dt_min > self.dt_max {
            return Err(OptionsError::InvertedStepClamp(self.dt_min, self.dt_max));
        }
        Ok(())
    }

    /// Resolve the effective absolute tolerance for a variable with the
    /// given backend-supplied nominal value, per the §4.1 supplement:
    /// explicit `a_tol` wins, otherwise `a_fac * r_tol * nominal`.
    pub fn resolve_absolute_tolerance(&self, nominal: f64) -> f64 {
        self.a_tol.unwrap_or(self.a_fac * self.r_tol * nominal.abs())
    }

    /// Effective zero-crossing magnitude threshold used by the anti-chatter
    /// test (`zMag := zTol` in "magnitude" mode, `0` otherwise, §4.4).
    pub fn zero_crossing_magnitude(&self, magnitude_mode: bool) -> f64 {
        if magnitude_mode { self.z_tol } else { 0.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_solver() {
        let o = Options::default();
        assert_eq!(o.qss_method, QssMethod::Qss2);
        assert_eq!(o.r_tol, 1.0e-4);
        assert_eq!(o.a_fac, 0.01);
        assert_eq!(o.bin_size, 1);
        assert_eq!(o.pass_limit, 20);
        assert!(o.validate().is_ok());
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let doc = r#"
            r_tol = 1.0e-6
            qss_method = "QSS3"
            derivative_mode = "numerical"
            log_level = "error"
        "#;
        let o = Options::from_toml_str(doc).expect("valid document");
        assert_eq!(o.r_tol, 1.0e-6);
        assert_eq!(o.qss_method, QssMethod::Qss3);
        assert_eq!(o.derivative_mode, DerivativeMode::Numerical);
        assert_eq!(o.log_level, LogLevel::Error);
        // untouched fields keep their defaults
        assert_eq!(o.a_fac, 0.01);
        assert_eq!(o.bin_size, 1);
    }

    #[test]
    fn rejects_invalid_bin_frac() {
        let mut o = Options::default();
        o.bin_frac = 1.5;
        assert!(matches!(o.validate(), Err(OptionsError::InvalidBinFrac(_))));
    }

    #[test]
    fn resolves_absolute_tolerance_from_nominal_when_unset() {
        let o = Options::default();
        let resolved = o.resolve_absolute_tolerance(200.0);
        assert!((resolved - (0.01 * 1.0e-4 * 200.0)).abs() < 1.0e-12);
    }

    #[test]
    fn explicit_absolute_tolerance_wins() {
        let mut o = Options::default();
        o.a_tol = Some(5.0e-6);
        assert_eq!(o.resolve_absolute_tolerance(1000.0), 5.0e-6);
    }

    #[test]
    fn method_order_and_flags() {
        assert_eq!(QssMethod::Qss1.order(), 1);
        assert_eq!(QssMethod::Liqss2.order(), 2);
        assert_eq!(QssMethod::Xqss3.order(), 3);
        assert!(QssMethod::Liqss2.is_implicit());
        assert!(!QssMethod::Qss2.is_implicit());
        assert!(QssMethod::Xqss1.is_broadcast());
        assert!(!QssMethod::Qss1.is_broadcast());
    }
}
