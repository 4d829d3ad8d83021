//! Edits applied once, before the baseline solve.

use tracing::{debug, info, warn};

use super::{HcaEngine, Resource, ResourceKey};
use crate::circuit::Circuit;
use crate::config::{ExplicitResource, Redispatch, VoltMonitorMethod};
use crate::error::{HcaError, Result};
use crate::graph::{Rating, ShuntClass};
use crate::io::shapes::RegulatorShape;
use crate::metrics::{PMON_PREFIX, VMON_PREFIX};
use crate::simulator::{Command, ElementClass, ElementRef, Props, Simulator};

/// Maps a removable element class onto its shunt class.
fn removable_class(class: ElementClass) -> Option<ShuntClass> {
    match class {
        ElementClass::PvSystem => Some(ShuntClass::PvSystem),
        ElementClass::Storage => Some(ShuntClass::Storage),
        ElementClass::Generator => Some(ShuntClass::Generator),
        _ => None,
    }
}

impl<S: Simulator> HcaEngine<S> {
    /// Applies the configured setup edits in order, commits them, and
    /// freezes the baseline from the resulting solve.
    pub(crate) fn setup(&mut self, circuit: &Circuit) -> Result<()> {
        if self.config.remove_all_pv {
            self.remove_all_pv()?;
        }
        self.remove_large_der()?;
        self.add_rooftop_pv(circuit)?;
        self.add_explicit_resources()?;
        self.apply_redispatches()?;
        self.attach_curves()?;
        self.apply_inverter_settings()?;
        self.disable_reg_controls(circuit)?;
        self.replace_storage()?;
        self.place_monitors()?;
        self.commit();

        let result = self.solve()?;
        if !result.converged {
            warn!("baseline solve did not converge");
        }
        self.evaluator.set_base(&self.graph, &result)?;
        let report = self.evaluator.evaluate(&self.graph, &result);
        info!(
            history = self.ledger.history().len(),
            violations = report.violation_count(),
            "baseline frozen"
        );
        self.last_report = Some(report);
        Ok(())
    }

    /// Takes a whole device off the feeder.
    fn remove_device(&mut self, class: ShuntClass, name: &str) -> Result<()> {
        let bus = self
            .graph
            .get_bus_of_shunt(class, name)
            .ok_or_else(|| HcaError::element_not_found(class.to_string(), name))?
            .to_string();
        let rating = self
            .graph
            .bus(&bus)?
            .shunts
            .iter()
            .find(|s| s.class == class && s.name == name)
            .map(|s| s.rating)
            .unwrap_or_default();
        let cmd = self.graph.remove_shunt(name, &bus, rating)?;
        self.ledger.push(&mut self.sim, cmd)
    }

    fn remove_all_pv(&mut self) -> Result<()> {
        let pvs = self.graph.shunts_of_class(ShuntClass::PvSystem);
        for (_, entry) in &pvs {
            self.remove_device(ShuntClass::PvSystem, &entry.name)?;
        }
        info!(count = pvs.len(), "existing PV removed");
        Ok(())
    }

    fn remove_large_der(&mut self) -> Result<()> {
        let names = self.config.remove_large_der.clone();
        for entry in &names {
            let element = entry.parse::<ElementRef>().map_err(HcaError::Config)?;
            let class = removable_class(element.class).ok_or_else(|| {
                HcaError::Config(format!("remove_large_der: `{entry}` is not a DER"))
            })?;
            self.remove_device(class, &element.name)?;
            debug!(element = %element, "large DER removed");
        }
        Ok(())
    }

    /// Gives a draw of residential loads a rooftop PV sized to the load.
    fn add_rooftop_pv(&mut self, circuit: &Circuit) -> Result<()> {
        let frac = self.config.res_pv_frac;
        if frac <= 0.0 {
            return Ok(());
        }
        let pf = self.config.hca.pf;
        let mut added = 0;
        for load in circuit.loads.iter().filter(|l| l.residential) {
            if !self.rng.chance(frac) {
                continue;
            }
            if self.graph.get_bus_of_shunt(ShuntClass::Load, &load.name).is_none() {
                continue;
            }
            let key = ResourceKey::new(Resource::Pv, &load.bus);
            let name = format!("{}_rooftop", load.name);
            self.inject(&key, &name, Rating::new(load.kw, load.kw / pf))?;
            added += 1;
        }
        info!(added, frac, "rooftop PV placed");
        Ok(())
    }

    fn add_explicit_resources(&mut self) -> Result<()> {
        let bat_hours = self.config.hca.bat_hours.first().copied().unwrap_or(4.0);
        let groups: [(Resource, Vec<ExplicitResource>); 3] = [
            (Resource::Pv, self.config.explicit_pv.clone()),
            (Resource::Bat, self.config.explicit_storage.clone()),
            (Resource::Der, self.config.explicit_generator.clone()),
        ];
        for (resource, items) in groups {
            for (i, item) in items.iter().enumerate() {
                let key = ResourceKey::new(resource, &item.bus);
                let name = item
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{resource}_{}_explicit{i}", item.bus));
                let mut rating = Rating::new(item.kw, item.kva);
                if resource == Resource::Bat {
                    rating = rating.with_kwh(item.kwh.unwrap_or(item.kw * bat_hours));
                }
                self.inject(&key, &name, rating)?;
                debug!(%key, device = %name, kw = item.kw, "explicit resource added");
            }
        }
        Ok(())
    }

    fn apply_redispatches(&mut self) -> Result<()> {
        let groups: [(ShuntClass, Vec<Redispatch>); 3] = [
            (ShuntClass::PvSystem, self.config.redisp_pv.clone()),
            (ShuntClass::Storage, self.config.redisp_storage.clone()),
            (ShuntClass::Generator, self.config.redisp_gen.clone()),
        ];
        for (class, items) in groups {
            for item in items {
                let mut rating = Rating::new(item.kw, item.kva);
                if let Some(kwh) = item.kwh {
                    rating = rating.with_kwh(kwh);
                }
                let cmd = self.graph.redispatch_shunt(class, &item.name, rating)?;
                self.ledger.push(&mut self.sim, cmd)?;
            }
        }
        Ok(())
    }

    fn attach_curves(&mut self) -> Result<()> {
        let curves = [
            (ShuntClass::PvSystem, self.config.pvcurve.clone()),
            (ShuntClass::Load, self.config.loadcurve.clone()),
        ];
        for (class, curve) in curves {
            let Some(curve) = curve else {
                continue;
            };
            for (_, entry) in self.graph.shunts_of_class(class) {
                self.push_edit(
                    ElementRef::new(class.element_class(), &entry.name),
                    Props::new().with("daily", curve.as_str()),
                )?;
            }
        }
        Ok(())
    }

    fn apply_inverter_settings(&mut self) -> Result<()> {
        let props = Props::new()
            .with("invmode", self.config.invmode.as_str())
            .with("pf", self.config.invpf);
        for (_, entry) in self.graph.shunts_of_class(ShuntClass::PvSystem) {
            self.push_edit(
                ElementRef::new(ElementClass::PvSystem, &entry.name),
                props.clone(),
            )?;
        }
        Ok(())
    }

    /// Disables regulator controls and loads the tap schedules that replace
    /// them.
    fn disable_reg_controls(&mut self, circuit: &Circuit) -> Result<()> {
        let policy = self.config.reg_control.clone();
        let mut names: Vec<String> = if policy.disable_all {
            self.active_elements(ElementClass::RegControl)?
        } else {
            policy.disable_list.clone()
        };
        for reg in policy.regulator_shape.keys() {
            if !names.contains(reg) {
                names.push(reg.clone());
            }
        }
        for name in &names {
            let cmd = Command::disable(ElementRef::new(ElementClass::RegControl, name));
            self.ledger.push(&mut self.sim, cmd)?;
        }
        for (reg, path) in &policy.regulator_shape {
            let def = circuit
                .regulators
                .iter()
                .find(|r| &r.name == reg)
                .ok_or_else(|| HcaError::element_not_found("regcontrol", reg))?;
            let shape = RegulatorShape::from_csv_path(reg, &def.transformer, path)?;
            self.reg_shapes.push(shape);
        }
        if !names.is_empty() {
            info!(
                disabled = names.len(),
                shaped = self.reg_shapes.len(),
                "regulator controls disabled"
            );
        }
        Ok(())
    }

    /// Swaps each shaped storage device for a load that follows the shape.
    ///
    /// The proxy carries the storage's rating as negative load, so a shape
    /// value of 1 is full discharge.
    fn replace_storage(&mut self) -> Result<()> {
        let shapes = self.config.storage_control.storage_shape.clone();
        for (storage, shape) in shapes {
            let bus = self
                .graph
                .get_bus_of_shunt(ShuntClass::Storage, &storage)
                .ok_or_else(|| HcaError::element_not_found("storage", &storage))?
                .to_string();
            let rating = self
                .graph
                .bus(&bus)?
                .shunts
                .iter()
                .find(|s| s.class == ShuntClass::Storage && s.name == storage)
                .map(|s| s.rating)
                .unwrap_or_default();
            self.remove_device(ShuntClass::Storage, &storage)?;

            let proxy = format!("{storage}_proxy");
            let phases = self.graph.bus(&bus)?.phases.max(1);
            let cmd = self.graph.add_shunt(
                ShuntClass::Load,
                &proxy,
                &bus,
                Rating::new(-rating.kw, rating.kva),
                Props::new().with("pf", 1.0).with("phases", phases as f64),
            )?;
            self.ledger.push(&mut self.sim, cmd)?;
            debug!(storage = %storage, proxy = %proxy, shape = %shape, "storage replaced by proxy load");
            self.proxies.insert(proxy, shape);
        }
        Ok(())
    }

    /// Places the voltage monitors and one power monitor per recloser.
    fn place_monitors(&mut self) -> Result<()> {
        let levels = self.graph.bfs_levels();
        let buses: Vec<String> = match self.config.monitors.volt_monitor_method {
            VoltMonitorMethod::Bfs => levels.iter().filter_map(|l| l.first().cloned()).collect(),
            VoltMonitorMethod::All => levels.into_iter().flatten().collect(),
            VoltMonitorMethod::None => Vec::new(),
        };

        let mut cmds = Vec::new();
        for bus in &buses {
            let feeding = self
                .graph
                .branches()
                .filter(|b| !b.open)
                .find(|b| b.bus2 == *bus)
                .or_else(|| self.graph.branches().filter(|b| !b.open).find(|b| b.bus1 == *bus));
            let Some(branch) = feeding else {
                debug!(bus = %bus, "no closed branch at bus, monitor skipped");
                continue;
            };
            let terminal = if branch.bus1 == *bus { 1.0 } else { 2.0 };
            cmds.push(Command::new_element(
                ElementRef::new(ElementClass::Monitor, format!("{VMON_PREFIX}{bus}")),
                Props::new()
                    .with("element", branch.element.to_string())
                    .with("terminal", terminal)
                    .with("mode", 0.0),
            ));
        }
        for branch in self.graph.boundary_reclosers() {
            let Some(device) = &branch.device else {
                continue;
            };
            cmds.push(Command::new_element(
                ElementRef::new(ElementClass::Monitor, format!("{PMON_PREFIX}{device}")),
                Props::new()
                    .with("element", branch.element.to_string())
                    .with("terminal", 1.0)
                    .with("mode", 1.0),
            ));
        }
        let count = cmds.len();
        self.ledger.push_all(&mut self.sim, cmds)?;
        debug!(count, "monitors placed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_engines::{looped_engine, radial_engine};
    use crate::circuit::Circuit;
    use crate::config::{ExplicitResource, HcaConfig, VoltMonitorMethod};
    use crate::graph::test_feeders::LOOPED;
    use crate::graph::ShuntClass;
    use crate::hca::HcaEngine;
    use crate::simulator::{ElementClass, SweepSimulator};

    fn monitors(engine: &HcaEngine<SweepSimulator>) -> Vec<String> {
        engine
            .active_elements(ElementClass::Monitor)
            .expect("query")
    }

    #[test]
    fn bfs_monitors_one_bus_per_level_plus_reclosers() {
        let engine = looped_engine(HcaConfig::trivial());
        let names = monitors(&engine);
        let levels = engine.graph().bfs_levels();
        let vmon = names.iter().filter(|n| n.starts_with("vmon_")).count();
        assert_eq!(vmon, levels.len());
        assert!(names.contains(&"pmon_rec1".to_string()));
    }

    #[test]
    fn monitor_method_none_places_only_power_monitors() {
        let mut config = HcaConfig::trivial();
        config.monitors.volt_monitor_method = VoltMonitorMethod::None;
        let engine = looped_engine(config);
        assert_eq!(monitors(&engine), vec!["pmon_rec1".to_string()]);
    }

    #[test]
    fn remove_all_pv_clears_the_inventory() {
        let mut config = HcaConfig::trivial();
        config.remove_all_pv = true;
        let engine = looped_engine(config);
        assert!(engine.graph().shunts_of_class(ShuntClass::PvSystem).is_empty());
        assert!(engine.ledger().pending().is_empty());
        assert!(engine.graph().aggregate_mismatches(1e-6).is_empty());
    }

    #[test]
    fn rooftop_pv_follows_residential_loads() {
        let mut config = HcaConfig::trivial();
        config.res_pv_frac = 1.0;
        let engine = radial_engine(config);
        assert_eq!(
            engine.graph().get_bus_of_shunt(ShuntClass::PvSystem, "ld1_rooftop"),
            Some("b1")
        );
    }

    #[test]
    fn explicit_storage_gets_energy_from_bat_hours() {
        let mut config = HcaConfig::trivial();
        config.explicit_storage.push(ExplicitResource {
            bus: "b1".into(),
            kw: 50.0,
            kva: 50.0,
            kwh: None,
            name: None,
        });
        let engine = radial_engine(config);
        let bus = engine.graph().bus("b1").expect("b1");
        assert_eq!(bus.total(ShuntClass::Storage).kwh, Some(100.0));
        assert_eq!(
            engine.graph().get_shunt_of_class_at("b1", ShuntClass::Storage),
            Some("bat_b1_explicit0")
        );
    }

    #[test]
    fn unknown_large_der_fails_setup() {
        let mut config = HcaConfig::trivial();
        config.remove_large_der.push("pvsystem.ghost".into());
        let circuit = Circuit::from_toml_str(LOOPED).expect("valid");
        let sim = SweepSimulator::new().with_model(config.model_path(), circuit.clone());
        assert!(HcaEngine::new(config, &circuit, sim).is_err());
    }
}
