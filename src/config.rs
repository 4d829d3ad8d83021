//! TOML-based analysis configuration and preset definitions.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::HcaError;
use crate::metrics::MetricId;
use crate::simulator::{ElementRef, SolveMode, SolverTime};
use crate::upgrade::UpgradeCatalog;

/// How the engine drives the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HcaMethod {
    /// One solve over the whole horizon per trial.
    #[default]
    TimeSeries,
    /// Step-by-step solves with a running solver clock.
    Sequence,
}

/// Inverter control regime applied to every PV system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InverterMode {
    Unity,
    #[default]
    ConstantPf,
    VoltVar,
}

impl InverterMode {
    pub fn as_str(self) -> &'static str {
        match self {
            InverterMode::Unity => "unity",
            InverterMode::ConstantPf => "constant_pf",
            InverterMode::VoltVar => "volt_var",
        }
    }
}

/// Voltage monitor placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoltMonitorMethod {
    /// One bus per BFS depth from the source.
    #[default]
    Bfs,
    /// Every bus.
    All,
    /// No voltage monitors; voltage metrics fall back to the solver's
    /// voltage exception table.
    None,
}

/// Growth rule for one-sided bisection bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoundStrategy {
    /// Multiply kW by a factor greater than one.
    Multiply(f64),
    /// Add a positive number of kW.
    Add(f64),
}

impl Default for BoundStrategy {
    fn default() -> Self {
        BoundStrategy::Multiply(2.0)
    }
}

impl BoundStrategy {
    /// Pushes an open lower bound outward.
    pub fn grow(self, kw: f64) -> f64 {
        match self {
            BoundStrategy::Multiply(f) => kw * f,
            BoundStrategy::Add(d) => kw + d,
        }
    }

    /// Pulls an open upper bound inward.
    pub fn shrink(self, kw: f64) -> f64 {
        match self {
            BoundStrategy::Multiply(f) => kw / f,
            BoundStrategy::Add(d) => kw - d,
        }
    }
}

/// Top-level analysis configuration parsed from TOML.
///
/// All fields have defaults. Load with [`HcaConfig::from_toml_file`] or
/// start from a preset with [`HcaConfig::from_preset`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HcaConfig {
    /// Feeder identifier; selects `{model_dir}/{choice}.toml`.
    pub choice: String,
    /// Directory holding circuit files.
    pub model_dir: PathBuf,
    pub hca_method: HcaMethod,
    /// Overrides the seed derived from the feeder name.
    pub seed: Option<u32>,
    /// Sequence start, `[hour, second]`.
    pub start_time: SolverTime,
    /// Sequence end (exclusive), `[hour, second]`.
    pub end_time: SolverTime,
    /// Sequence step in seconds.
    pub stepsize: f64,
    /// Steps per solve in `time_series` mode.
    pub numsteps: usize,
    pub solnmode: SolveMode,
    /// Shape attached to every PV system.
    pub pvcurve: Option<String>,
    /// Shape attached to every load.
    pub loadcurve: Option<String>,
    pub invmode: InverterMode,
    /// Power factor for `constant_pf`; negative absorbs vars.
    pub invpf: f64,
    /// Fraction of residential loads that receive a rooftop PV sibling.
    pub res_pv_frac: f64,
    pub remove_all_pv: bool,
    /// Elements to disable, written `class.name`.
    pub remove_large_der: Vec<String>,
    /// Voltage floor below which a converged solve is treated as failed.
    pub min_converged_vpu: f64,
    pub reg_control: RegControlConfig,
    pub storage_control: StorageControlConfig,
    pub explicit_pv: Vec<ExplicitResource>,
    pub explicit_storage: Vec<ExplicitResource>,
    pub explicit_generator: Vec<ExplicitResource>,
    pub redisp_pv: Vec<Redispatch>,
    pub redisp_storage: Vec<Redispatch>,
    pub redisp_gen: Vec<Redispatch>,
    pub metrics: MetricsConfig,
    pub monitors: MonitorsConfig,
    pub hca: SearchConfig,
    pub upgrades: UpgradeCatalog,
}

impl Default for HcaConfig {
    fn default() -> Self {
        Self {
            choice: "trivial".to_string(),
            model_dir: PathBuf::from("circuits"),
            hca_method: HcaMethod::TimeSeries,
            seed: None,
            start_time: SolverTime::new(0, 0.0),
            end_time: SolverTime::new(24, 0.0),
            stepsize: 3600.0,
            numsteps: 1,
            solnmode: SolveMode::Snapshot,
            pvcurve: None,
            loadcurve: None,
            invmode: InverterMode::ConstantPf,
            invpf: 1.0,
            res_pv_frac: 0.0,
            remove_all_pv: false,
            remove_large_der: Vec::new(),
            min_converged_vpu: 0.5,
            reg_control: RegControlConfig::default(),
            storage_control: StorageControlConfig::default(),
            explicit_pv: Vec::new(),
            explicit_storage: Vec::new(),
            explicit_generator: Vec::new(),
            redisp_pv: Vec::new(),
            redisp_storage: Vec::new(),
            redisp_gen: Vec::new(),
            metrics: MetricsConfig::default(),
            monitors: MonitorsConfig::default(),
            hca: SearchConfig::default(),
            upgrades: UpgradeCatalog::default(),
        }
    }
}

/// Regulator-control policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegControlConfig {
    /// Disable every regulator control.
    pub disable_all: bool,
    /// Regulator controls to disable by name.
    pub disable_list: Vec<String>,
    /// Regulator control name to a tap-schedule CSV. The control is
    /// disabled and its winding tap follows the schedule in sequence mode.
    pub regulator_shape: BTreeMap<String, PathBuf>,
}

/// Storage replacement policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageControlConfig {
    /// Storage name to the load shape its proxy load follows.
    pub storage_shape: BTreeMap<String, String>,
}

/// A resource injected before the baseline solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExplicitResource {
    pub bus: String,
    pub kw: f64,
    pub kva: f64,
    #[serde(default)]
    pub kwh: Option<f64>,
    #[serde(default)]
    pub name: Option<String>,
}

/// A new rating for an existing device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Redispatch {
    pub name: String,
    pub kw: f64,
    pub kva: f64,
    #[serde(default)]
    pub kwh: Option<f64>,
}

/// Metric thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    pub vmin: f64,
    pub vmax: f64,
    /// Largest step-to-step change, per unit.
    pub vdiff: f64,
    /// Peak loading, percent of emergency rating.
    pub emerg: f64,
    /// Hours above normal rating.
    pub norm_hrs: f64,
    /// Minimum `[p_frac, q_frac]` of smallest to largest boundary flow.
    pub island: [f64; 2],
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            vmin: 0.95,
            vmax: 1.05,
            vdiff: 0.03,
            emerg: 100.0,
            norm_hrs: 0.0,
            island: [0.1, 0.1],
        }
    }
}

/// Per-category comparison tolerances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tolerances {
    pub voltage: f64,
    pub thermal: f64,
    /// Flow magnitude, kW or kvar, treated as zero for direction tests.
    pub island: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            voltage: 1e-6,
            thermal: 1e-6,
            island: 1e-3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub limits: Limits,
    pub tolerances: Tolerances,
    /// Metrics to enforce; all when empty. Exclusive with `exclude`.
    pub include: Vec<MetricId>,
    /// Metrics to skip. Exclusive with `include`.
    pub exclude: Vec<MetricId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorsConfig {
    pub volt_monitor_method: VoltMonitorMethod,
}

/// Search parameters of the HCA rounds and bisection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    /// Capacities below this are reported as zero, kW.
    pub kw_min: f64,
    /// Bisection stops once the bracket is narrower than this, kW.
    pub kw_tol: f64,
    /// Upward search stops growing at this size, kW.
    pub kw_max: f64,
    /// Sampling range for candidate sizes, kW.
    pub pv_kw_range: [f64; 2],
    /// kVA = kW / pf for sampled candidates.
    pub pf: f64,
    /// Storage energy is kW times one of these durations.
    pub bat_hours: Vec<f64>,
    pub bnd_strategy: BoundStrategy,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            kw_min: 30.0,
            kw_tol: 5.0,
            kw_max: 100_000.0,
            pv_kw_range: [50.0, 1000.0],
            pf: 0.8,
            bat_hours: vec![2.0, 4.0],
            bnd_strategy: BoundStrategy::default(),
        }
    }
}

/// Configuration error with field path and constraint description.
#[derive(Debug)]
pub struct ConfigError {
    /// Dotted field path (e.g., `"hca.kw_tol"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl From<ConfigError> for HcaError {
    fn from(e: ConfigError) -> Self {
        HcaError::Config(e.to_string())
    }
}

fn err(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError {
        field: field.to_string(),
        message: message.into(),
    }
}

impl HcaConfig {
    /// The trivial one-line feeder used for smoke runs.
    pub fn trivial() -> Self {
        Self::default()
    }

    /// A day of hourly sequence steps on the trivial feeder.
    pub fn trivial_sequence() -> Self {
        Self {
            hca_method: HcaMethod::Sequence,
            solnmode: SolveMode::Daily,
            ..Self::default()
        }
    }

    /// Available preset names.
    pub const PRESETS: &[&str] = &["trivial", "trivial_sequence"];

    /// Loads a configuration from a named preset.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the preset name is unknown.
    pub fn from_preset(name: &str) -> Result<Self, ConfigError> {
        match name {
            "trivial" => Ok(Self::trivial()),
            "trivial_sequence" => Ok(Self::trivial_sequence()),
            _ => Err(err(
                "preset",
                format!(
                    "unknown preset \"{name}\", available: {}",
                    Self::PRESETS.join(", ")
                ),
            )),
        }
    }

    /// Parses a configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| err("config", format!("cannot read \"{}\": {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Parses a configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid, contains unknown
    /// fields, or names an unknown `hca_method`.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| err("toml", e.to_string()))
    }

    /// Path of the base circuit file.
    pub fn model_path(&self) -> PathBuf {
        self.model_dir.join(format!("{}.toml", self.choice))
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.choice.trim().is_empty() {
            errors.push(err("choice", "must not be empty"));
        }
        if !(self.stepsize > 0.0) {
            errors.push(err("stepsize", "must be > 0"));
        }
        if self.numsteps == 0 {
            errors.push(err("numsteps", "must be > 0"));
        }
        if self.hca_method == HcaMethod::Sequence && self.end_time <= self.start_time {
            errors.push(err("end_time", "must be after start_time"));
        }
        if self.invpf == 0.0 || self.invpf.abs() > 1.0 {
            errors.push(err("invpf", "must be in [-1, 0) or (0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.res_pv_frac) {
            errors.push(err("res_pv_frac", "must be in [0.0, 1.0]"));
        }
        if !(0.0..1.0).contains(&self.min_converged_vpu) {
            errors.push(err("min_converged_vpu", "must be in [0.0, 1.0)"));
        }
        for (i, name) in self.remove_large_der.iter().enumerate() {
            if name.parse::<ElementRef>().is_err() {
                errors.push(err(
                    &format!("remove_large_der[{i}]"),
                    format!("expected `class.name`, got \"{name}\""),
                ));
            }
        }
        for (field, list) in [
            ("explicit_pv", &self.explicit_pv),
            ("explicit_storage", &self.explicit_storage),
            ("explicit_generator", &self.explicit_generator),
        ] {
            for (i, r) in list.iter().enumerate() {
                if r.kw < 0.0 || r.kva < 0.0 {
                    errors.push(err(&format!("{field}[{i}]"), "ratings must be >= 0"));
                }
            }
        }

        let m = &self.metrics;
        if !m.include.is_empty() && !m.exclude.is_empty() {
            errors.push(err(
                "metrics.include",
                "include and exclude are mutually exclusive",
            ));
        }
        if m.limits.vmin >= m.limits.vmax {
            errors.push(err("metrics.limits.vmin", "must be < metrics.limits.vmax"));
        }
        if m.limits.vdiff <= 0.0 {
            errors.push(err("metrics.limits.vdiff", "must be > 0"));
        }
        if m.limits.island.iter().any(|f| !(0.0..=1.0).contains(f)) {
            errors.push(err("metrics.limits.island", "fractions must be in [0.0, 1.0]"));
        }

        let h = &self.hca;
        if h.kw_min < 0.0 {
            errors.push(err("hca.kw_min", "must be >= 0"));
        }
        if !(h.kw_tol > 0.0) {
            errors.push(err("hca.kw_tol", "must be > 0"));
        }
        if h.kw_max <= h.kw_min {
            errors.push(err("hca.kw_max", "must be > hca.kw_min"));
        }
        if h.pv_kw_range[0] <= 0.0 || h.pv_kw_range[0] > h.pv_kw_range[1] {
            errors.push(err("hca.pv_kw_range", "must satisfy 0 < low <= high"));
        }
        if !(h.pf > 0.0 && h.pf <= 1.0) {
            errors.push(err("hca.pf", "must be in (0.0, 1.0]"));
        }
        if h.bat_hours.is_empty() || h.bat_hours.iter().any(|x| *x <= 0.0) {
            errors.push(err("hca.bat_hours", "must be a non-empty list of positive hours"));
        }
        match h.bnd_strategy {
            BoundStrategy::Multiply(f) if f <= 1.0 => {
                errors.push(err("hca.bnd_strategy", "multiply factor must be > 1"));
            }
            BoundStrategy::Add(d) if d <= 0.0 => {
                errors.push(err("hca.bnd_strategy", "add step must be > 0"));
            }
            _ => {}
        }

        errors.extend(self.upgrades.validate());
        errors
    }

    /// Validates and folds every problem into one [`HcaError::Config`].
    pub fn check(&self) -> Result<(), HcaError> {
        let errors = self.validate();
        if errors.is_empty() {
            return Ok(());
        }
        let joined: Vec<String> = errors.iter().map(ToString::to_string).collect();
        Err(HcaError::Config(joined.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let errors = HcaConfig::default().validate();
        assert!(errors.is_empty(), "defaults should be valid: {errors:?}");
    }

    #[test]
    fn all_presets_are_valid() {
        for name in HcaConfig::PRESETS {
            let cfg = HcaConfig::from_preset(name);
            assert!(cfg.is_ok(), "preset \"{name}\" should load");
            let errors = cfg.as_ref().map(|c| c.validate()).unwrap_or_default();
            assert!(errors.is_empty(), "preset \"{name}\" should be valid: {errors:?}");
        }
    }

    #[test]
    fn from_preset_unknown() {
        let e = HcaConfig::from_preset("nonexistent").expect_err("unknown preset");
        assert!(e.message.contains("unknown preset"));
    }

    #[test]
    fn full_toml_parses() {
        let toml = r#"
choice = "feeder_a"
hca_method = "sequence"
seed = 7
start_time = [0, 0]
end_time = [24, 0]
stepsize = 900
invmode = "volt_var"
res_pv_frac = 0.25
remove_large_der = ["generator.big1"]

[reg_control]
disable_list = ["reg1"]

[reg_control.regulator_shape]
reg2 = "shapes/reg2.csv"

[storage_control.storage_shape]
bess1 = "bess1_shape"

[[explicit_pv]]
bus = "b7"
kw = 250.0
kva = 300.0

[metrics]
include = ["voltage_vmax", "thermal_emerg"]

[metrics.limits]
vmax = 1.04
island = [0.2, 0.2]

[monitors]
volt_monitor_method = "all"

[hca]
kw_tol = 10.0
bnd_strategy = { add = 250.0 }
"#;
        let cfg = HcaConfig::from_toml_str(toml).expect("valid TOML should parse");
        assert_eq!(cfg.hca_method, HcaMethod::Sequence);
        assert_eq!(cfg.seed, Some(7));
        assert_eq!(cfg.end_time, SolverTime::new(24, 0.0));
        assert_eq!(cfg.invmode, InverterMode::VoltVar);
        assert_eq!(cfg.metrics.limits.vmax, 1.04);
        assert_eq!(cfg.metrics.limits.vmin, 0.95);
        assert_eq!(cfg.hca.bnd_strategy, BoundStrategy::Add(250.0));
        assert_eq!(cfg.monitors.volt_monitor_method, VoltMonitorMethod::All);
        assert_eq!(
            cfg.storage_control.storage_shape.get("bess1").map(String::as_str),
            Some("bess1_shape")
        );
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn unknown_method_fails_parsing() {
        assert!(HcaConfig::from_toml_str("hca_method = \"monte_carlo\"\n").is_err());
    }

    #[test]
    fn invalid_toml_unknown_field() {
        let toml = r#"
[hca]
kw_min = 30
bogus_field = true
"#;
        assert!(HcaConfig::from_toml_str(toml).is_err());
    }

    #[test]
    fn include_and_exclude_are_exclusive() {
        let mut cfg = HcaConfig::default();
        cfg.metrics.include = vec![MetricId::VoltageVmax];
        cfg.metrics.exclude = vec![MetricId::ThermalEmerg];
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "metrics.include"));
        assert!(matches!(cfg.check(), Err(HcaError::Config(_))));
    }

    #[test]
    fn validation_catches_bad_search_parameters() {
        let mut cfg = HcaConfig::default();
        cfg.hca.kw_tol = 0.0;
        cfg.hca.bnd_strategy = BoundStrategy::Multiply(1.0);
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "hca.kw_tol"));
        assert!(errors.iter().any(|e| e.field == "hca.bnd_strategy"));
    }

    #[test]
    fn validation_catches_bad_der_reference() {
        let mut cfg = HcaConfig::default();
        cfg.remove_large_der = vec!["no_dot".into()];
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.field == "remove_large_der[0]"));
    }

    #[test]
    fn bound_strategy_grows_and_shrinks() {
        assert_eq!(BoundStrategy::Multiply(2.0).grow(100.0), 200.0);
        assert_eq!(BoundStrategy::Multiply(2.0).shrink(100.0), 50.0);
        assert_eq!(BoundStrategy::Add(25.0).shrink(100.0), 75.0);
    }

    #[test]
    fn model_path_joins_choice() {
        let cfg = HcaConfig::default();
        assert_eq!(cfg.model_path(), PathBuf::from("circuits/trivial.toml"));
    }
}
