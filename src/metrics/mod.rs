//! Metric evaluator.
//!
//! Turns a [`SolveResult`] into a structured report of margins for three
//! categories (voltage, thermal, islanding). Margins are positive when
//! compliant and negative when violating. Once a baseline is frozen with
//! [`MetricEvaluator::set_base`], metrics that fail their absolute test get a
//! second chance against the baseline's framed limits.

pub mod baseline;
pub mod island;
pub mod thermal;
pub mod voltage;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{Limits, MetricsConfig, Tolerances};
use crate::error::{HcaError, Result};
use crate::graph::FeederGraph;
use crate::simulator::{ElementRef, SolveResult};

pub use baseline::Baseline;
pub use island::{IslandRow, IslandStats};
pub use thermal::ThermalStats;
pub use voltage::VoltStats;

/// Name prefix of the per-bus voltage monitors the engine places.
pub const VMON_PREFIX: &str = "vmon_";
/// Name prefix of the per-recloser power monitors the engine places.
pub const PMON_PREFIX: &str = "pmon_";

/// Metric category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricCategory {
    Voltage,
    Thermal,
    Island,
}

impl fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MetricCategory::Voltage => "voltage",
            MetricCategory::Thermal => "thermal",
            MetricCategory::Island => "island",
        })
    }
}

/// One enforceable metric, spelled `{category}_{metric}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricId {
    VoltageVmin,
    VoltageVmax,
    VoltageVdiff,
    ThermalEmerg,
    ThermalNormHrs,
    IslandPq,
}

impl MetricId {
    pub const ALL: [MetricId; 6] = [
        MetricId::VoltageVmin,
        MetricId::VoltageVmax,
        MetricId::VoltageVdiff,
        MetricId::ThermalEmerg,
        MetricId::ThermalNormHrs,
        MetricId::IslandPq,
    ];

    pub fn category(self) -> MetricCategory {
        match self {
            MetricId::VoltageVmin | MetricId::VoltageVmax | MetricId::VoltageVdiff => {
                MetricCategory::Voltage
            }
            MetricId::ThermalEmerg | MetricId::ThermalNormHrs => MetricCategory::Thermal,
            MetricId::IslandPq => MetricCategory::Island,
        }
    }

    /// Metric name within its category.
    pub fn metric(self) -> &'static str {
        match self {
            MetricId::VoltageVmin => "vmin",
            MetricId::VoltageVmax => "vmax",
            MetricId::VoltageVdiff => "vdiff",
            MetricId::ThermalEmerg => "emerg",
            MetricId::ThermalNormHrs => "norm_hrs",
            MetricId::IslandPq => "pq",
        }
    }
}

impl fmt::Display for MetricId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.category(), self.metric())
    }
}

/// Observed value of one row (monitor, branch) with the limit it is held to
/// and its violation integral.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatRow {
    pub observed: f64,
    pub limit: f64,
    #[serde(default)]
    pub integral: f64,
}

/// Pass flag and margins of one metric.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MetricOutcome {
    pub pass: bool,
    /// Worst margin across rows.
    pub margin: f64,
    /// Margin of every row, keyed by monitor, branch, or component.
    pub detail: BTreeMap<String, f64>,
}

impl MetricOutcome {
    fn from_rows(rows: impl IntoIterator<Item = (String, bool, f64)>) -> Self {
        let mut out = MetricOutcome {
            pass: true,
            margin: 0.0,
            detail: BTreeMap::new(),
        };
        let mut worst: Option<f64> = None;
        for (key, pass, margin) in rows {
            out.pass &= pass;
            worst = Some(worst.map_or(margin, |w| w.min(margin)));
            out.detail.insert(key, margin);
        }
        out.margin = worst.unwrap_or(0.0);
        out
    }

    /// Keys of failing rows, i.e. rows with a negative margin.
    pub fn failing(&self) -> impl Iterator<Item = &str> {
        self.detail
            .iter()
            .filter(|(_, m)| **m < 0.0)
            .map(|(k, _)| k.as_str())
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EvalReport {
    pub eval: BTreeMap<MetricId, MetricOutcome>,
}

impl EvalReport {
    /// The failing subset of `eval`.
    pub fn violation(&self) -> BTreeMap<MetricId, &MetricOutcome> {
        self.eval
            .iter()
            .filter(|(_, o)| !o.pass)
            .map(|(id, o)| (*id, o))
            .collect()
    }

    pub fn violation_count(&self) -> usize {
        self.eval.values().filter(|o| !o.pass).count()
    }

    pub fn has_violations(&self) -> bool {
        self.violation_count() > 0
    }

    /// Failing metrics as `"{category}_{metric}"` strings.
    pub fn violation_list(&self) -> Vec<String> {
        self.violation().keys().map(ToString::to_string).collect()
    }

    pub fn margin(&self, id: MetricId) -> Option<f64> {
        self.eval.get(&id).map(|o| o.margin)
    }

    /// Smallest margin over every evaluated metric.
    pub fn worst_margin(&self) -> Option<f64> {
        self.eval.values().map(|o| o.margin).reduce(f64::min)
    }
}

/// Lower-bound test with an integral fallback against the baseline.
fn lower_bound(row: &StatRow, base: Option<&StatRow>, tol: f64) -> (bool, f64) {
    let margin = row.observed - row.limit;
    if margin >= -tol {
        return (true, margin);
    }
    match base {
        Some(b) => {
            let m = row.observed - b.limit;
            integral_fallback(m, row.integral, b.integral, tol)
        }
        None => (false, margin),
    }
}

/// Upper-bound test with an integral fallback against the baseline.
fn upper_bound(row: &StatRow, base: Option<&StatRow>, tol: f64) -> (bool, f64) {
    let margin = row.limit - row.observed;
    if margin >= -tol {
        return (true, margin);
    }
    match base {
        Some(b) => {
            let m = b.limit - row.observed;
            integral_fallback(m, row.integral, b.integral, tol)
        }
        None => (false, margin),
    }
}

fn integral_fallback(extremum_margin: f64, integral: f64, base: f64, tol: f64) -> (bool, f64) {
    let integral_ok = integral <= base + tol;
    let pass = extremum_margin >= -tol && integral_ok;
    let margin = if integral_ok {
        extremum_margin
    } else {
        extremum_margin.min(base - integral)
    };
    (pass, margin)
}

/// Upper-bound test whose baseline fallback is the framed limit alone.
fn capped(row: &StatRow, base: Option<&StatRow>, tol: f64) -> (bool, f64) {
    let margin = row.limit - row.observed;
    if margin >= -tol {
        return (true, margin);
    }
    match base {
        Some(b) => {
            let m = b.limit - row.observed;
            (m >= -tol, m)
        }
        None => (false, margin),
    }
}

type RowTest = fn(&StatRow, Option<&StatRow>, f64) -> (bool, f64);

fn judge(
    rows: &BTreeMap<String, StatRow>,
    base: Option<&BTreeMap<String, StatRow>>,
    tol: f64,
    test: RowTest,
) -> MetricOutcome {
    MetricOutcome::from_rows(rows.iter().map(|(key, row)| {
        let b = base.and_then(|m| m.get(key));
        let (pass, margin) = test(row, b, tol);
        (key.clone(), pass, margin)
    }))
}

/// The metric evaluator with its frozen baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvaluator {
    limits: Limits,
    tolerances: Tolerances,
    selected: BTreeSet<MetricId>,
    baseline: Option<Baseline>,
    last_violation_list: Vec<String>,
}

impl MetricEvaluator {
    /// Builds an evaluator from the metrics section of the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`HcaError::Config`] when both `include` and `exclude` are
    /// non-empty.
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        if !config.include.is_empty() && !config.exclude.is_empty() {
            return Err(HcaError::Config(
                "metrics.include and metrics.exclude are mutually exclusive".into(),
            ));
        }
        let selected = if config.include.is_empty() {
            MetricId::ALL
                .into_iter()
                .filter(|id| !config.exclude.contains(id))
                .collect()
        } else {
            config.include.iter().copied().collect()
        };
        Ok(Self {
            limits: config.limits.clone(),
            tolerances: config.tolerances.clone(),
            selected,
            baseline: None,
            last_violation_list: Vec::new(),
        })
    }

    pub fn is_selected(&self, id: MetricId) -> bool {
        self.selected.contains(&id)
    }

    fn any_selected(&self, category: MetricCategory) -> bool {
        self.selected.iter().any(|id| id.category() == category)
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn baseline(&self) -> Option<&Baseline> {
        self.baseline.as_ref()
    }

    /// Freezes the baseline from the untouched feeder's result.
    ///
    /// # Errors
    ///
    /// Returns [`HcaError::BaselineFrozen`] if a baseline is already set.
    pub fn set_base(&mut self, graph: &FeederGraph, result: &SolveResult) -> Result<()> {
        if self.baseline.is_some() {
            return Err(HcaError::BaselineFrozen);
        }
        let base = Baseline::frame(graph, result, &self.limits, &self.tolerances);
        debug!(
            vmin_rows = base.volt_stats.min.len(),
            branches = base.thermal_stats.emerg.len(),
            "baseline frozen"
        );
        self.baseline = Some(base);
        Ok(())
    }

    /// Evaluates every selected metric on `result`.
    pub fn evaluate(&mut self, graph: &FeederGraph, result: &SolveResult) -> EvalReport {
        let mut report = EvalReport::default();
        let base = self.baseline.as_ref();

        if self.any_selected(MetricCategory::Voltage) {
            let stats = VoltStats::compute(result, &self.limits, false);
            let tol = self.tolerances.voltage;
            let bv = base.map(|b| &b.volt_stats);
            for (id, rows, brows, test) in [
                (
                    MetricId::VoltageVmin,
                    &stats.min,
                    bv.map(|b| &b.min),
                    lower_bound as RowTest,
                ),
                (
                    MetricId::VoltageVmax,
                    &stats.max,
                    bv.map(|b| &b.max),
                    upper_bound as RowTest,
                ),
                (
                    MetricId::VoltageVdiff,
                    &stats.diff,
                    bv.map(|b| &b.diff),
                    capped as RowTest,
                ),
            ] {
                if self.is_selected(id) {
                    report.eval.insert(id, judge(rows, brows, tol, test));
                }
            }
        }

        if self.any_selected(MetricCategory::Thermal) {
            let stats = ThermalStats::compute(result, &self.limits, false, self.tolerances.thermal);
            let tol = self.tolerances.thermal;
            let bt = base.map(|b| &b.thermal_stats);
            if self.is_selected(MetricId::ThermalEmerg) {
                let o = judge(&stats.emerg, bt.map(|b| &b.emerg), tol, capped);
                report.eval.insert(MetricId::ThermalEmerg, o);
            }
            if self.is_selected(MetricId::ThermalNormHrs) {
                let o = judge(&stats.norm_hrs, bt.map(|b| &b.norm_hrs), tol, capped);
                report.eval.insert(MetricId::ThermalNormHrs, o);
            }
        }

        if self.is_selected(MetricId::IslandPq) {
            let stats = IslandStats::compute(graph, result, &self.limits, &self.tolerances);
            report.eval.insert(MetricId::IslandPq, stats.outcome());
        }

        if report.has_violations() {
            self.last_violation_list = report.violation_list();
        }
        report
    }

    /// Violation kinds of the most recent failing evaluation.
    pub fn last_violation_list(&self) -> &[String] {
        &self.last_violation_list
    }

    /// Branches failing a thermal metric in `report`, worst first.
    pub fn get_thermal_branches(report: &EvalReport) -> Vec<ElementRef> {
        let mut rows: BTreeMap<ElementRef, f64> = BTreeMap::new();
        for id in [MetricId::ThermalEmerg, MetricId::ThermalNormHrs] {
            let Some(outcome) = report.eval.get(&id) else {
                continue;
            };
            for key in outcome.failing() {
                if let Ok(element) = key.parse::<ElementRef>() {
                    let m = outcome.detail[key];
                    let slot = rows.entry(element).or_insert(m);
                    *slot = slot.min(m);
                }
            }
        }
        let mut out: Vec<(ElementRef, f64)> = rows.into_iter().collect();
        out.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        out.into_iter().map(|(e, _)| e).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::test_results::{with_line_loading, with_voltages};
    use super::*;
    use crate::circuit::Circuit;
    use crate::config::MetricsConfig;
    use crate::simulator::ElementClass;

    fn graph() -> FeederGraph {
        let c = Circuit::from_toml_str(
            "name = \"m\"\n[source]\nbus = \"src\"\nbase_kv = 12.47\n\n[[lines]]\nname = \"l1\"\nbus1 = \"src\"\nbus2 = \"b1\"\n",
        )
        .expect("valid");
        FeederGraph::from_circuit(&c).expect("builds")
    }

    fn evaluator() -> MetricEvaluator {
        MetricEvaluator::new(&MetricsConfig::default()).expect("valid")
    }

    #[test]
    fn metric_ids_render_category_and_name() {
        assert_eq!(MetricId::VoltageVmax.to_string(), "voltage_vmax");
        assert_eq!(MetricId::ThermalNormHrs.to_string(), "thermal_norm_hrs");
        assert_eq!(MetricId::IslandPq.category(), MetricCategory::Island);
    }

    #[test]
    fn include_and_exclude_conflict() {
        let cfg = MetricsConfig {
            include: vec![MetricId::VoltageVmin],
            exclude: vec![MetricId::IslandPq],
            ..MetricsConfig::default()
        };
        assert!(matches!(MetricEvaluator::new(&cfg), Err(HcaError::Config(_))));
    }

    #[test]
    fn unselected_metrics_are_not_reported() {
        let cfg = MetricsConfig {
            include: vec![MetricId::VoltageVmin],
            ..MetricsConfig::default()
        };
        let mut ev = MetricEvaluator::new(&cfg).expect("valid");
        let r = with_voltages(&[("b1", &[1.2])]);
        let report = ev.evaluate(&graph(), &r);
        assert_eq!(report.eval.len(), 1);
        assert_eq!(report.violation_count(), 0);
    }

    #[test]
    fn overvoltage_is_a_violation_with_negative_margin() {
        let mut ev = evaluator();
        let r = with_voltages(&[("b1", &[1.05, 1.07, 1.06])]);
        let report = ev.evaluate(&graph(), &r);
        let vmax = report.margin(MetricId::VoltageVmax).expect("evaluated");
        assert!((vmax + 0.02).abs() < 1e-9);
        assert_eq!(report.violation_list(), vec!["voltage_vmax".to_string()]);
        assert_eq!(ev.last_violation_list(), ["voltage_vmax".to_string()]);
        assert!(report.margin(MetricId::VoltageVmin).expect("evaluated") > 0.0);
    }

    #[test]
    fn baseline_excuses_preexisting_undervoltage() {
        let mut ev = evaluator();
        let g = graph();
        ev.set_base(&g, &with_voltages(&[("b1", &[0.93, 0.94])]))
            .expect("first baseline");
        let same = ev.evaluate(&g, &with_voltages(&[("b1", &[0.93, 0.94])]));
        assert!(same.eval[&MetricId::VoltageVmin].pass);

        let worse = ev.evaluate(&g, &with_voltages(&[("b1", &[0.92, 0.94])]));
        assert!(!worse.eval[&MetricId::VoltageVmin].pass);
    }

    #[test]
    fn baseline_cannot_be_overwritten() {
        let mut ev = evaluator();
        let g = graph();
        let r = with_voltages(&[("b1", &[1.0])]);
        ev.set_base(&g, &r).expect("first");
        assert!(matches!(ev.set_base(&g, &r), Err(HcaError::BaselineFrozen)));
    }

    #[test]
    fn thermal_branches_are_listed_worst_first() {
        let mut ev = evaluator();
        let mut r = with_line_loading("hot", &[180.0], &[120.0]);
        let warm = with_line_loading("warm", &[150.0], &[105.0]);
        r.branches.extend(warm.branches);
        let report = ev.evaluate(&graph(), &r);
        assert!(!report.eval[&MetricId::ThermalEmerg].pass);
        let branches = MetricEvaluator::get_thermal_branches(&report);
        assert_eq!(
            branches,
            vec![
                ElementRef::new(ElementClass::Line, "hot"),
                ElementRef::new(ElementClass::Line, "warm"),
            ]
        );
    }

    #[test]
    fn report_serialises_with_metric_keys() {
        let mut ev = evaluator();
        let report = ev.evaluate(&graph(), &with_voltages(&[("b1", &[1.0])]));
        let json = serde_json::to_string(&report).expect("serialises");
        assert!(json.contains("\"voltage_vmin\""));
        let back: EvalReport = serde_json::from_str(&json).expect("parses");
        assert_eq!(back, report);
    }
}
