//! Upgrade catalog and the engine's upgrade operations.
//!
//! Every upgrade stages its solver edits in the ledger's `upgrade_pending`
//! buffer, mirrors them in the feeder graph, and logs an [`UpgradeRecord`]
//! keyed by element and step. The next commit moves the edits into
//! `history`.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ConfigError;
use crate::error::{HcaError, Result};
use crate::graph::BranchParams;
use crate::hca::{HcaEngine, UpgradeAction, UpgradeKey, UpgradeRecord};
use crate::metrics::{EvalReport, MetricEvaluator};
use crate::simulator::{Command, ElementClass, ElementRef, Props, Query, QueryReply, Simulator};

/// Prices, ladders, and bands available to the upgrade operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpgradeCatalog {
    /// Default reconductoring factor: length divided, ampacity multiplied.
    pub line_factor: f64,
    /// Overhead reconductoring cost per foot.
    pub oh_cost_per_ft: f64,
    /// Underground reconductoring cost per foot.
    pub ug_cost_per_ft: f64,
    /// Single-phase transformer sizes, kVA, ascending.
    pub kva_1ph: Vec<f64>,
    /// Three-phase transformer sizes, kVA, ascending.
    pub kva_3ph: Vec<f64>,
    /// Transformer replacement cost per added kVA.
    pub cost_per_kva: f64,
    /// Fixed fee for a tap or set point change.
    pub settings_fee: f64,
    pub min_tap: f64,
    pub max_tap: f64,
    /// Tap positions between `min_tap` and `max_tap`.
    pub num_taps: u32,
    /// Allowed regulator set points on the 120 V base, `[low, high]`.
    pub vreg_band: [f64; 2],
}

impl Default for UpgradeCatalog {
    fn default() -> Self {
        Self {
            line_factor: 2.0,
            oh_cost_per_ft: 60.0,
            ug_cost_per_ft: 180.0,
            kva_1ph: vec![
                10.0, 15.0, 25.0, 37.5, 50.0, 75.0, 100.0, 167.0, 250.0, 333.0, 500.0,
            ],
            kva_3ph: vec![
                45.0, 75.0, 112.5, 150.0, 225.0, 300.0, 500.0, 750.0, 1000.0, 1500.0, 2000.0,
                2500.0, 3000.0, 3750.0, 5000.0,
            ],
            cost_per_kva: 40.0,
            settings_fee: 500.0,
            min_tap: 0.9,
            max_tap: 1.1,
            num_taps: 32,
            vreg_band: [114.0, 126.0],
        }
    }
}

fn err(field: &str, message: &str) -> ConfigError {
    ConfigError {
        field: format!("upgrades.{field}"),
        message: message.to_string(),
    }
}

fn ascending(ladder: &[f64]) -> bool {
    !ladder.is_empty() && ladder.iter().all(|k| *k > 0.0) && ladder.windows(2).all(|w| w[0] < w[1])
}

impl UpgradeCatalog {
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        if self.line_factor <= 1.0 {
            errors.push(err("line_factor", "must be > 1"));
        }
        if self.oh_cost_per_ft < 0.0 || self.ug_cost_per_ft < 0.0 || self.cost_per_kva < 0.0 {
            errors.push(err("cost", "rates must be >= 0"));
        }
        if self.settings_fee < 0.0 {
            errors.push(err("settings_fee", "must be >= 0"));
        }
        if !ascending(&self.kva_1ph) {
            errors.push(err("kva_1ph", "must be a non-empty ascending list of positive sizes"));
        }
        if !ascending(&self.kva_3ph) {
            errors.push(err("kva_3ph", "must be a non-empty ascending list of positive sizes"));
        }
        if !(self.min_tap > 0.0 && self.min_tap < self.max_tap) {
            errors.push(err("min_tap", "must satisfy 0 < min_tap < max_tap"));
        }
        if self.num_taps == 0 {
            errors.push(err("num_taps", "must be > 0"));
        }
        if self.vreg_band[0] >= self.vreg_band[1] {
            errors.push(err("vreg_band", "must satisfy low < high"));
        }
        errors
    }

    /// Per-unit size of one tap position.
    pub fn tap_step(&self) -> f64 {
        (self.max_tap - self.min_tap) / f64::from(self.num_taps)
    }

    /// Size ladder for a transformer with `phases` phases.
    pub fn ladder(&self, phases: usize) -> &[f64] {
        if phases >= 3 { &self.kva_3ph } else { &self.kva_1ph }
    }

    /// Smallest catalog size strictly above `kva`.
    pub fn next_size(&self, kva: f64, phases: usize) -> Option<f64> {
        self.ladder(phases).iter().copied().find(|k| *k > kva + 1e-9)
    }
}

impl<S: Simulator> HcaEngine<S> {
    fn record_upgrade(&mut self, element: ElementRef, record: UpgradeRecord) -> UpgradeKey {
        let key = UpgradeKey {
            element,
            cnt: self.cnt,
        };
        self.data.upgrades.insert(key.clone(), record);
        key
    }

    /// Reconductors line `name`: its length is divided by `factor` and its
    /// ampacities multiplied by it. `None` takes the catalog factor.
    ///
    /// # Errors
    ///
    /// Returns [`HcaError::ElementNotFound`] for an unknown line and
    /// [`HcaError::Config`] for a factor not above one.
    pub fn upgrade_line(&mut self, name: &str, factor: Option<f64>) -> Result<UpgradeKey> {
        let factor = factor.unwrap_or(self.config.upgrades.line_factor);
        if !(factor > 1.0) {
            return Err(HcaError::Config(format!(
                "reconductor factor must be > 1, got {factor}"
            )));
        }
        let element = ElementRef::new(ElementClass::Line, name);
        let BranchParams::Line {
            length,
            units,
            normamps,
            emergamps,
            underground,
            ..
        } = self.graph.branch(&element)?.params
        else {
            return Err(HcaError::element_not_found("line", name));
        };
        let old = vec![normamps, emergamps];
        let new = vec![normamps * factor, emergamps * factor];
        let new_length = length / factor;

        // Priced on the conductor actually replaced.
        let feet = units.to_feet(length);
        let rate = if underground {
            self.config.upgrades.ug_cost_per_ft
        } else {
            self.config.upgrades.oh_cost_per_ft
        };
        let cmd = Command::edit(
            element.clone(),
            Props::new()
                .with("length", new_length)
                .with("normamps", new[0])
                .with("emergamps", new[1]),
        );
        self.ledger.push_upgrade(&mut self.sim, cmd)?;
        if let BranchParams::Line {
            length,
            normamps,
            emergamps,
            ..
        } = &mut self.graph.branch_mut(&element)?.params
        {
            *length = new_length;
            *normamps = new[0];
            *emergamps = new[1];
        }
        let record = UpgradeRecord {
            action: UpgradeAction::Reconductor,
            old,
            new,
            cost: feet * rate,
            length: Some(length),
            units: Some(units),
        };
        info!(line = name, factor, cost = record.cost, "line reconductored");
        Ok(self.record_upgrade(element, record))
    }

    /// Replaces every parallel leg of transformer `name` with the next
    /// catalog size of its phase count.
    ///
    /// # Errors
    ///
    /// Returns [`HcaError::ElementNotFound`] for an unknown transformer and
    /// [`HcaError::CatalogExhausted`] when a leg is already at the top of
    /// its ladder. No leg is changed in that case.
    pub fn upgrade_transformer(&mut self, name: &str) -> Result<Vec<UpgradeKey>> {
        let target = ElementRef::new(ElementClass::Transformer, name);
        let legs = self.graph.parallel_branches(&target)?;

        let mut plan = Vec::with_capacity(legs.len());
        for leg in &legs {
            let branch = self.graph.branch(leg)?;
            let BranchParams::Transformer { kvas, .. } = &branch.params else {
                return Err(HcaError::element_not_found("transformer", &leg.name));
            };
            let mut sized = Vec::with_capacity(kvas.len());
            for kva in kvas {
                let next = self.config.upgrades.next_size(*kva, branch.phases).ok_or(
                    HcaError::CatalogExhausted {
                        rating: *kva,
                        phases: branch.phases,
                    },
                )?;
                sized.push(next);
            }
            plan.push((leg.clone(), kvas.clone(), sized));
        }

        let mut keys = Vec::with_capacity(plan.len());
        for (leg, old, new) in plan {
            let added: f64 = new.iter().zip(&old).map(|(n, o)| n - o).sum::<f64>() / new.len().max(1) as f64;
            let emerg = new.first().copied().unwrap_or_default() * 1.5;
            let cmd = Command::edit(
                leg.clone(),
                Props::new().with("kvas", new.clone()).with("emerghkva", emerg),
            );
            self.ledger.push_upgrade(&mut self.sim, cmd)?;
            if let BranchParams::Transformer { kvas, .. } = &mut self.graph.branch_mut(&leg)?.params {
                kvas.clone_from(&new);
            }
            info!(transformer = %leg.name, old = ?old, new = ?new, "transformer upsized");
            let record = UpgradeRecord {
                action: UpgradeAction::Upsize,
                old,
                new,
                cost: added * self.config.upgrades.cost_per_kva,
                length: None,
                units: None,
            };
            keys.push(self.record_upgrade(leg, record));
        }
        Ok(keys)
    }

    /// Moves the winding-1 tap of transformer `name` by `steps` positions
    /// within the catalog band. Returns `None` when the tap is already at
    /// the band edge in that direction.
    pub fn upgrade_tap(&mut self, name: &str, steps: i32) -> Result<Option<UpgradeKey>> {
        let element = ElementRef::new(ElementClass::Transformer, name);
        let catalog = &self.config.upgrades;
        let (step, lo, hi, fee) = (catalog.tap_step(), catalog.min_tap, catalog.max_tap, catalog.settings_fee);
        let BranchParams::Transformer { taps, .. } = &self.graph.branch(&element)?.params else {
            return Err(HcaError::element_not_found("transformer", name));
        };
        let old = taps.first().copied().unwrap_or(1.0);
        let new = (old + f64::from(steps) * step).clamp(lo, hi);
        if (new - old).abs() < 1e-12 {
            warn!(transformer = name, tap = old, "tap already at the band edge");
            return Ok(None);
        }
        let cmd = Command::edit(
            element.clone(),
            Props::new().with("wdg", 1.0).with("tap", new),
        );
        self.ledger.push_upgrade(&mut self.sim, cmd)?;
        if let BranchParams::Transformer { taps, .. } = &mut self.graph.branch_mut(&element)?.params {
            match taps.first_mut() {
                Some(t) => *t = new,
                None => taps.push(new),
            }
        }
        info!(transformer = name, old, new, "tap moved");
        let record = UpgradeRecord {
            action: UpgradeAction::TapStep,
            old: vec![old],
            new: vec![new],
            cost: fee,
            length: None,
            units: None,
        };
        Ok(Some(self.record_upgrade(element, record)))
    }

    /// Shifts the forward and reverse set points of regulator control
    /// `name` by `volts` on the 120 V base, clamped to the catalog band.
    /// Returns `None` when nothing moves.
    pub fn upgrade_regulator(&mut self, name: &str, volts: i32) -> Result<Option<UpgradeKey>> {
        let element = ElementRef::new(ElementClass::RegControl, name);
        let props = match self.sim.query(&Query::RegControl(name.to_string()))? {
            QueryReply::Props { props, .. } => props,
            _ => return Err(HcaError::element_not_found("regcontrol", name)),
        };
        let [lo, hi] = self.config.upgrades.vreg_band;
        let shift = |v: f64| (v + f64::from(volts)).clamp(lo, hi);

        let old_fwd = props.num("vreg").unwrap_or(120.0);
        let new_fwd = shift(old_fwd);
        let mut old = vec![old_fwd];
        let mut new = vec![new_fwd];
        let mut edit = Props::new().with("vreg", new_fwd);
        if let Some(rev) = props.num("revvreg") {
            old.push(rev);
            new.push(shift(rev));
            edit.set("revvreg", shift(rev));
        }
        if old.iter().zip(&new).all(|(o, n)| (o - n).abs() < 1e-12) {
            warn!(regulator = name, vreg = old_fwd, "set point already at the band edge");
            return Ok(None);
        }
        self.ledger
            .push_upgrade(&mut self.sim, Command::edit(element.clone(), edit))?;
        info!(regulator = name, old = old_fwd, new = new_fwd, "set point shifted");
        let record = UpgradeRecord {
            action: UpgradeAction::Setpoint,
            old,
            new,
            cost: self.config.upgrades.settings_fee,
            length: None,
            units: None,
        };
        Ok(Some(self.record_upgrade(element, record)))
    }

    /// Upgrades every branch the report's thermal metrics flagged: lines
    /// are reconductored with the catalog factor, transformers upsized.
    pub fn upgrade_thermal(&mut self, report: &EvalReport) -> Result<Vec<UpgradeKey>> {
        let mut keys = Vec::new();
        let mut done: Vec<ElementRef> = Vec::new();
        for element in MetricEvaluator::get_thermal_branches(report) {
            if done.contains(&element) {
                continue;
            }
            match element.class {
                ElementClass::Line => keys.push(self.upgrade_line(&element.name, None)?),
                ElementClass::Transformer => {
                    let legs = self.graph.parallel_branches(&element)?;
                    keys.extend(self.upgrade_transformer(&element.name)?);
                    done.extend(legs);
                }
                _ => warn!(%element, "no upgrade for this element class"),
            }
            done.push(element);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{Circuit, LengthUnit};
    use crate::config::HcaConfig;
    use crate::hca::test_engines::{RADIAL, looped_engine, radial_engine};
    use crate::simulator::SweepSimulator;

    #[test]
    fn default_catalog_is_valid() {
        assert!(UpgradeCatalog::default().validate().is_empty());
        assert!((UpgradeCatalog::default().tap_step() - 0.00625).abs() < 1e-12);
    }

    #[test]
    fn validation_rejects_unsorted_ladders() {
        let catalog = UpgradeCatalog {
            kva_3ph: vec![500.0, 300.0],
            line_factor: 1.0,
            ..UpgradeCatalog::default()
        };
        let errors = catalog.validate();
        assert!(errors.iter().any(|e| e.field == "upgrades.kva_3ph"));
        assert!(errors.iter().any(|e| e.field == "upgrades.line_factor"));
    }

    #[test]
    fn next_size_walks_the_phase_ladder() {
        let c = UpgradeCatalog::default();
        assert_eq!(c.next_size(25.0, 1), Some(37.5));
        assert_eq!(c.next_size(500.0, 3), Some(750.0));
        assert_eq!(c.next_size(480.0, 3), Some(500.0));
        assert_eq!(c.next_size(5000.0, 3), None);
    }

    #[test]
    fn reconductor_doubles_ampacity_and_prices_the_length() {
        let mut engine = radial_engine(HcaConfig::trivial());
        let key = engine.upgrade_line("weak", Some(2.0)).expect("upgrades");
        let record = &engine.data().upgrades[&key];
        assert_eq!(record.action, UpgradeAction::Reconductor);
        assert_eq!(record.old, vec![1.0, 1.0]);
        assert_eq!(record.new, vec![2.0, 2.0]);
        assert_eq!(record.units, Some(LengthUnit::Mi));
        assert!((record.cost - 0.1 * 5280.0 * 60.0).abs() < 1e-6);
        assert_eq!(engine.ledger().upgrade_pending().len(), 1);

        match engine.graph().line("weak").expect("line").params {
            BranchParams::Line { length, normamps, .. } => {
                assert!((length - 0.05).abs() < 1e-12);
                assert_eq!(normamps, 2.0);
            }
            _ => panic!("line params expected"),
        }
        let reply = engine
            .simulator()
            .query(&Query::ElementProps(ElementRef::new(ElementClass::Line, "weak")))
            .expect("query");
        let QueryReply::Props { props, .. } = reply else {
            panic!("props expected");
        };
        assert_eq!(props.num("emergamps"), Some(2.0));
    }

    /// Reopens the engine's session on `circuit`, leaving its graph alone.
    fn swap_session(engine: &mut HcaEngine<SweepSimulator>, circuit: Circuit) {
        let path = engine.model_path.clone();
        engine.sim = SweepSimulator::new().with_model(path.clone(), circuit);
        engine.sim.compile(&path).expect("compiles");
    }

    #[test]
    fn failed_reconductor_leaves_the_graph_alone() {
        let mut engine = radial_engine(HcaConfig::trivial());
        let mut circuit = Circuit::from_toml_str(RADIAL).expect("valid");
        circuit.lines.retain(|l| l.name != "weak");
        swap_session(&mut engine, circuit);

        assert!(engine.upgrade_line("weak", Some(2.0)).is_err());
        match engine.graph().line("weak").expect("line").params {
            BranchParams::Line { length, normamps, .. } => {
                assert_eq!(length, 0.1);
                assert_eq!(normamps, 1.0);
            }
            _ => panic!("line params expected"),
        }
        assert!(engine.data().upgrades.is_empty());
        assert!(engine.ledger().upgrade_pending().is_empty());
    }

    #[test]
    fn failed_tap_step_leaves_the_graph_alone() {
        let mut config = HcaConfig::trivial();
        config.upgrades.num_taps = 4;
        let mut engine = looped_engine(config);
        let mut circuit =
            Circuit::from_toml_str(crate::graph::test_feeders::LOOPED).expect("valid");
        circuit.transformers.retain(|t| t.name != "t1a");
        swap_session(&mut engine, circuit);

        let t1a = ElementRef::new(ElementClass::Transformer, "t1a");
        let before = engine.graph().branch(&t1a).expect("t1a").params.clone();
        assert!(engine.upgrade_tap("t1a", 1).is_err());
        assert_eq!(engine.graph().branch(&t1a).expect("t1a").params, before);
        assert!(engine.data().upgrades.is_empty());
    }

    #[test]
    fn unknown_line_is_a_lookup_error() {
        let mut engine = radial_engine(HcaConfig::trivial());
        assert!(matches!(
            engine.upgrade_line("nope", None),
            Err(HcaError::ElementNotFound { .. })
        ));
        assert!(engine.data().upgrades.is_empty());
    }

    #[test]
    fn upsizing_moves_every_parallel_leg() {
        let mut engine = looped_engine(HcaConfig::trivial());
        let keys = engine.upgrade_transformer("t1a").expect("upsizes");
        assert_eq!(keys.len(), 2);
        for key in &keys {
            let record = &engine.data().upgrades[key];
            assert_eq!(record.old, vec![500.0, 500.0]);
            assert_eq!(record.new, vec![750.0, 750.0]);
            assert!(record.cost > 0.0);
        }
        assert_eq!(engine.ledger().upgrade_pending().len(), 2);
    }

    #[test]
    fn exhausted_ladder_changes_nothing() {
        let mut config = HcaConfig::trivial();
        config.upgrades.kva_3ph = vec![100.0, 500.0];
        let mut engine = looped_engine(config);
        assert!(matches!(
            engine.upgrade_transformer("t1b"),
            Err(HcaError::CatalogExhausted { phases: 3, .. })
        ));
        assert!(engine.ledger().upgrade_pending().is_empty());
    }

    #[test]
    fn tap_steps_stop_at_the_band() {
        let mut config = HcaConfig::trivial();
        config.upgrades.num_taps = 4;
        let mut engine = looped_engine(config);
        let key = engine.upgrade_tap("t1a", 1).expect("steps").expect("moved");
        let record = &engine.data().upgrades[&key];
        assert!((record.new[0] - 1.05).abs() < 1e-12);
        assert_eq!(record.cost, 500.0);
        assert!(engine.upgrade_tap("t1a", 1).expect("steps").is_some());
        assert!(engine.upgrade_tap("t1a", 1).expect("steps").is_none());
    }

    const REGULATED: &str = r#"
name = "regulated"

[source]
bus = "src"
base_kv = 12.47

[[transformers]]
name = "t_reg"
buses = ["src", "r1"]
kvs = [12.47, 12.47]
kvas = [5000.0, 5000.0]
xhl = 0.1

[[regulators]]
name = "reg1"
transformer = "t_reg"
vreg = 124.0
revvreg = 121.0

[[lines]]
name = "l1"
bus1 = "r1"
bus2 = "b1"
length = 1.0
units = "mi"
r1 = 0.3
x1 = 0.6

[[loads]]
name = "ld1"
bus = "b1"
kw = 300.0
"#;

    #[test]
    fn set_point_shift_is_clamped() {
        let config = HcaConfig::trivial();
        let circuit = Circuit::from_toml_str(REGULATED).expect("valid");
        let sim = SweepSimulator::new().with_model(config.model_path(), circuit.clone());
        let mut engine = HcaEngine::new(config, &circuit, sim).expect("engine");

        let key = engine.upgrade_regulator("reg1", 4).expect("shifts").expect("moved");
        let record = &engine.data().upgrades[&key];
        assert_eq!(record.old, vec![124.0, 121.0]);
        assert_eq!(record.new, vec![126.0, 125.0]);
        assert_eq!(record.action, UpgradeAction::Setpoint);

        engine.commit();
        let QueryReply::Props { props, .. } = engine
            .simulator()
            .query(&Query::RegControl("reg1".into()))
            .expect("query")
        else {
            panic!("props expected");
        };
        assert_eq!(props.num("vreg"), Some(126.0));
        assert!(matches!(
            engine.upgrade_regulator("ghost", 1),
            Err(HcaError::ElementNotFound { .. })
        ));
    }
}
