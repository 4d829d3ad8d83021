//! Shunt inventory operations.
//!
//! Each mutation keeps a bus's shunt list and its per-class aggregates in
//! step and returns the solver command that mirrors it, so the caller can
//! route that command through the ledger.

use super::{FeederGraph, Rating, ShuntClass, ShuntEntry};
use crate::error::{HcaError, Result};
use crate::simulator::{Command, ElementRef, Props};

/// Ratings at or below this are treated as zero.
const ZERO_TOL: f64 = 1e-9;

impl FeederGraph {
    /// Attaches a new shunt to `bus`, ahead of existing entries.
    ///
    /// `extra` carries solver properties beyond the rating (power factor,
    /// phases, shapes). Returns the matching `New` command.
    ///
    /// # Errors
    ///
    /// Returns [`HcaError::BusNotFound`] for an unknown bus, or
    /// [`HcaError::Circuit`] if a shunt of the same class and name exists.
    pub fn add_shunt(
        &mut self,
        class: ShuntClass,
        name: &str,
        bus: &str,
        rating: Rating,
        extra: Props,
    ) -> Result<Command> {
        if let Some(at) = self.get_bus_of_shunt(class, name) {
            return Err(HcaError::Circuit(format!(
                "{class} `{name}` already attached at bus `{at}`"
            )));
        }
        let data = self.bus_mut(bus)?;
        data.shunts.insert(
            0,
            ShuntEntry {
                class,
                name: name.to_string(),
                rating,
            },
        );
        let total = data.total(class) + rating;
        data.totals.insert(class, total);

        let mut props = extra;
        props.set("bus1", bus);
        props.merge(&class.rating_props(&rating));
        Ok(Command::new_element(
            ElementRef::new(class.element_class(), name),
            props,
        ))
    }

    /// Takes `rating` off the shunt `name` at `bus`.
    ///
    /// The aggregate is decremented by `rating`, not by the entry's current
    /// value, so a delta added on top of an existing device can be backed out
    /// alone. The entry disappears once nothing is left of it and the device
    /// is disabled; otherwise it is edited down.
    pub fn remove_shunt(&mut self, name: &str, bus: &str, rating: Rating) -> Result<Command> {
        let data = self.bus_mut(bus)?;
        let pos = data
            .shunts
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| HcaError::element_not_found(format!("shunt at {bus}"), name))?;
        let class = data.shunts[pos].class;
        let remaining = data.shunts[pos].rating - rating;
        let total = data.total(class) - rating;
        data.totals.insert(class, total);
        let element = ElementRef::new(class.element_class(), name);
        if remaining.is_zero(ZERO_TOL) || remaining.kw < ZERO_TOL {
            data.shunts.remove(pos);
            if total.is_zero(ZERO_TOL) {
                data.totals.remove(&class);
            }
            Ok(Command::disable(element))
        } else {
            data.shunts[pos].rating = remaining;
            Ok(Command::edit(element, class.rating_props(&remaining)))
        }
    }

    /// Sets the rating of an existing shunt, adjusting its bus aggregate by
    /// the difference.
    pub fn redispatch_shunt(
        &mut self,
        class: ShuntClass,
        name: &str,
        rating: Rating,
    ) -> Result<Command> {
        let bus = self
            .get_bus_of_shunt(class, name)
            .ok_or_else(|| HcaError::element_not_found(class.to_string(), name))?
            .to_string();
        let data = self.bus_mut(&bus)?;
        let Some(entry) = data
            .shunts
            .iter_mut()
            .find(|s| s.class == class && s.name == name)
        else {
            return Err(HcaError::element_not_found(class.to_string(), name));
        };
        let delta = rating - entry.rating;
        entry.rating = rating;
        let total = data.total(class) + delta;
        data.totals.insert(class, total);
        Ok(Command::edit(
            ElementRef::new(class.element_class(), name),
            class.rating_props(&rating),
        ))
    }

    /// First shunt of `class` at `bus`.
    pub fn get_shunt_of_class_at(&self, bus: &str, class: ShuntClass) -> Option<&str> {
        self.bus(bus)
            .ok()?
            .shunts
            .iter()
            .find(|s| s.class == class)
            .map(|s| s.name.as_str())
    }

    /// Bus a shunt is attached to.
    pub fn get_bus_of_shunt(&self, class: ShuntClass, name: &str) -> Option<&str> {
        self.buses()
            .find(|b| b.shunts.iter().any(|s| s.class == class && s.name == name))
            .map(|b| b.name.as_str())
    }

    /// Every shunt of `class` with its bus, in bus order.
    pub fn shunts_of_class(&self, class: ShuntClass) -> Vec<(String, ShuntEntry)> {
        self.buses()
            .flat_map(|b| {
                b.shunts
                    .iter()
                    .filter(move |s| s.class == class)
                    .map(move |s| (b.name.clone(), s.clone()))
            })
            .collect()
    }

    /// Buses and classes whose aggregate differs from the sum of their
    /// entries by more than `tol`.
    pub fn aggregate_mismatches(&self, tol: f64) -> Vec<(String, ShuntClass)> {
        let mut out = Vec::new();
        for bus in self.buses() {
            for class in ShuntClass::ALL {
                if !bus.total(class).approx_eq(&bus.summed(class), tol) {
                    out.push((bus.name.clone(), class));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_feeders::looped;
    use super::*;

    fn graph() -> FeederGraph {
        FeederGraph::from_circuit(&looped()).expect("builds")
    }

    #[test]
    fn add_shunt_prepends_and_updates_aggregate() {
        let mut g = graph();
        let cmd = g
            .add_shunt(
                ShuntClass::PvSystem,
                "pv_b1_cnt1",
                "b1",
                Rating::new(100.0, 125.0),
                Props::new().with("pf", 1.0),
            )
            .expect("adds");
        assert_eq!(
            cmd.to_string(),
            "new pvsystem.pv_b1_cnt1 bus1=b1 kva=125 pf=1 pmpp=100"
        );
        let bus = g.bus("b1").expect("bus");
        assert_eq!(bus.class_tag(), "pvsystem");
        assert_eq!(bus.total(ShuntClass::PvSystem).kw, 100.0);
        assert!(g.aggregate_mismatches(1e-6).is_empty());
    }

    #[test]
    fn partial_removal_edits_then_full_removal_disables() {
        let mut g = graph();
        let cmd = g
            .remove_shunt("ld1", "b1", Rating::new(40.0, 40.0))
            .expect("removes part");
        assert!(matches!(cmd, Command::Edit { .. }));
        assert!((g.bus("b1").expect("b1").total(ShuntClass::Load).kw - 60.0).abs() < 1e-9);

        let rest = g.bus("b1").expect("b1").shunts[0].rating;
        let cmd = g.remove_shunt("ld1", "b1", rest).expect("removes rest");
        assert!(matches!(cmd, Command::Disable { .. }));
        assert_eq!(g.get_shunt_of_class_at("b1", ShuntClass::Load), None);
        assert!(g.aggregate_mismatches(1e-6).is_empty());
    }

    #[test]
    fn redispatch_moves_aggregate_by_delta() {
        let mut g = graph();
        g.redispatch_shunt(ShuntClass::PvSystem, "pv_lv", Rating::new(20.0, 60.0))
            .expect("redispatches");
        assert_eq!(g.bus("lv1").expect("lv1").total(ShuntClass::PvSystem).kw, 20.0);
        assert!(g.aggregate_mismatches(1e-6).is_empty());
    }

    #[test]
    fn reverse_lookup_and_duplicates() {
        let mut g = graph();
        assert_eq!(g.get_bus_of_shunt(ShuntClass::Load, "ld4"), Some("b4"));
        assert_eq!(g.get_bus_of_shunt(ShuntClass::PvSystem, "ld4"), None);
        let dup = g.add_shunt(
            ShuntClass::Load,
            "ld4",
            "b1",
            Rating::new(1.0, 1.0),
            Props::new(),
        );
        assert!(matches!(dup, Err(HcaError::Circuit(_))));
        assert!(g.remove_shunt("ghost", "b1", Rating::default()).is_err());
    }

    #[test]
    fn interleaved_operations_keep_aggregates_consistent() {
        let mut g = graph();
        for n in 0..5 {
            let name = format!("g{n}");
            g.add_shunt(
                ShuntClass::Generator,
                &name,
                "b3",
                Rating::new(10.0 + n as f64, 12.0),
                Props::new(),
            )
            .expect("adds");
            if n % 2 == 0 {
                g.remove_shunt(&name, "b3", Rating::new(3.0, 4.0)).expect("removes");
            }
        }
        g.redispatch_shunt(ShuntClass::Generator, "g1", Rating::new(1.0, 1.0))
            .expect("redispatches");
        assert!(g.aggregate_mismatches(1e-6).is_empty());
    }
}
