//! Annotated feeder graph.
//!
//! Buses are nodes and power-delivery elements are edges of an undirected
//! multigraph stored in a petgraph [`StableUnGraph`] arena, so removals
//! never invalidate the index handles held in the lookup maps. Every bus
//! carries its shunt inventory and per-class aggregates; see [`shunts`]
//! for the mutating operations and [`topology`] for component and
//! traversal queries.

pub mod shunts;
pub mod topology;
pub mod types;

use std::collections::{BTreeMap, VecDeque};

use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableUnGraph};
use petgraph::visit::{EdgeRef, NodeIndexable};
use serde::{Deserialize, Serialize};

use crate::circuit::{Circuit, ProtectionClass};
use crate::error::{HcaError, Result};
use crate::simulator::{ElementClass, ElementRef};

pub use types::{
    BranchClass, BranchData, BranchParams, BusData, Rating, SequenceView, ShuntClass, ShuntEntry,
};

/// The feeder's buses, branches, and shunt inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeederGraph {
    name: String,
    source: String,
    graph: StableUnGraph<BusData, BranchData>,
    buses: BTreeMap<String, NodeIndex>,
    branches: BTreeMap<ElementRef, EdgeIndex>,
}

impl FeederGraph {
    /// Builds the graph from a circuit description.
    ///
    /// # Errors
    ///
    /// Returns [`HcaError::Circuit`] when a branch or shunt names a bus
    /// that cannot be created or an element name is duplicated.
    pub fn from_circuit(circuit: &Circuit) -> Result<Self> {
        let mut g = Self {
            name: circuit.name.clone(),
            source: circuit.source.bus.clone(),
            graph: StableUnGraph::default(),
            buses: BTreeMap::new(),
            branches: BTreeMap::new(),
        };

        let src = g.ensure_bus(&circuit.source.bus);
        g.graph[src].phases = 3;
        g.graph[src].shunts.push(ShuntEntry {
            class: ShuntClass::Vsource,
            name: circuit.source.name.clone(),
            rating: Rating::default(),
        });

        for b in &circuit.buses {
            let idx = g.ensure_bus(&b.name);
            let bus = &mut g.graph[idx];
            bus.kv = b.kv;
            if let (Some(x), Some(y)) = (b.x, b.y) {
                bus.coords = Some((x, y));
            }
        }

        let device_of = |line: &str| {
            circuit
                .protection
                .iter()
                .filter(|p| p.line == line)
                .map(|p| (p.class, p.name.clone()))
                .max_by_key(|(class, _)| *class == ProtectionClass::Recloser)
        };

        for l in &circuit.lines {
            let device = device_of(&l.name);
            let class = match (&device, l.switch) {
                (Some((ProtectionClass::Recloser, _)), _) => BranchClass::Recloser,
                (_, true) => BranchClass::Switch,
                (Some((ProtectionClass::Fuse, _)), _) => BranchClass::Fuse,
                (Some((ProtectionClass::SwtControl, _)), _) => BranchClass::SwtControl,
                (None, false) => BranchClass::Line,
            };
            g.add_branch(BranchData {
                class,
                element: ElementRef::new(ElementClass::Line, &l.name),
                bus1: l.bus1.clone(),
                bus2: l.bus2.clone(),
                phases: l.phases,
                params: BranchParams::Line {
                    length: l.length,
                    units: l.units,
                    r1: l.r1,
                    x1: l.x1,
                    normamps: l.normamps,
                    emergamps: l.emergamps,
                    underground: l.underground,
                },
                open: l.switch && l.open,
                device: device.map(|(_, n)| n),
                sequence: SequenceView::default(),
            })?;
        }
        for r in &circuit.reactors {
            g.add_branch(BranchData {
                class: BranchClass::Reactor,
                element: ElementRef::new(ElementClass::Reactor, &r.name),
                bus1: r.bus1.clone(),
                bus2: r.bus2.clone(),
                phases: r.phases,
                params: BranchParams::Reactor { r: r.r, x: r.x },
                open: false,
                device: None,
                sequence: SequenceView::default(),
            })?;
        }
        for t in &circuit.transformers {
            let reg = circuit.regulators.iter().find(|r| r.transformer == t.name);
            g.add_branch(BranchData {
                class: if reg.is_some() {
                    BranchClass::Regulator
                } else {
                    BranchClass::Transformer
                },
                element: ElementRef::new(ElementClass::Transformer, &t.name),
                bus1: t.buses[0].clone(),
                bus2: t.buses[1].clone(),
                phases: t.phases,
                params: BranchParams::Transformer {
                    windings: t.buses.len(),
                    kvs: t.kvs.clone(),
                    kvas: t.kvas.clone(),
                    taps: t.taps.clone(),
                },
                open: false,
                device: reg.map(|r| r.name.clone()),
                sequence: SequenceView::default(),
            })?;
        }

        for l in &circuit.loads {
            let kva = l.kw / l.pf.abs().max(1e-6);
            g.attach(ShuntClass::Load, &l.name, &l.bus, l.phases, Rating::new(l.kw, kva))?;
        }
        for p in &circuit.pvsystems {
            let rating = Rating::new(p.kw, p.kva);
            g.attach(ShuntClass::PvSystem, &p.name, &p.bus, p.phases, rating)?;
        }
        for s in &circuit.storage {
            g.attach(
                ShuntClass::Storage,
                &s.name,
                &s.bus,
                s.phases,
                Rating::new(s.kw, s.kva).with_kwh(s.kwh),
            )?;
        }
        for gen_def in &circuit.generators {
            g.attach(
                ShuntClass::Generator,
                &gen_def.name,
                &gen_def.bus,
                gen_def.phases,
                Rating::new(gen_def.kw, gen_def.kva),
            )?;
        }
        for c in &circuit.capacitors {
            let rating = Rating::new(0.0, c.kvar);
            g.attach(ShuntClass::Capacitor, &c.name, &c.bus, c.phases, rating)?;
        }

        g.propagate_kv(circuit.source.base_kv);
        g.update_sequence_views();
        g.assign_components();
        Ok(g)
    }

    fn ensure_bus(&mut self, name: &str) -> NodeIndex {
        if let Some(&idx) = self.buses.get(name) {
            return idx;
        }
        let idx = self.graph.add_node(BusData::new(name));
        self.buses.insert(name.to_string(), idx);
        idx
    }

    fn add_branch(&mut self, data: BranchData) -> Result<()> {
        if self.branches.contains_key(&data.element) {
            return Err(HcaError::Circuit(format!("duplicate branch {}", data.element)));
        }
        let a = self.ensure_bus(&data.bus1);
        let b = self.ensure_bus(&data.bus2);
        for idx in [a, b] {
            let bus = &mut self.graph[idx];
            bus.phases = bus.phases.max(data.phases);
        }
        let element = data.element.clone();
        let e = self.graph.add_edge(a, b, data);
        self.branches.insert(element, e);
        Ok(())
    }

    /// Appends a circuit-defined shunt without emitting a command.
    fn attach(
        &mut self,
        class: ShuntClass,
        name: &str,
        bus: &str,
        phases: usize,
        rating: Rating,
    ) -> Result<()> {
        if self.get_bus_of_shunt(class, name).is_some() {
            return Err(HcaError::Circuit(format!("duplicate {class} `{name}`")));
        }
        let idx = self.ensure_bus(bus);
        let data = &mut self.graph[idx];
        data.phases = data.phases.max(phases);
        data.shunts.push(ShuntEntry {
            class,
            name: name.to_string(),
            rating,
        });
        let total = data.total(class) + rating;
        data.totals.insert(class, total);
        Ok(())
    }

    /// Assigns nominal kV by walking out from the source through transformer
    /// ratios. Buses with an explicit kV keep it.
    fn propagate_kv(&mut self, source_kv: f64) {
        let Some(&src) = self.buses.get(&self.source) else {
            return;
        };
        if self.graph[src].kv.is_none() {
            self.graph[src].kv = Some(source_kv);
        }
        let mut seen = vec![false; self.graph.node_bound()];
        seen[src.index()] = true;
        let mut queue = VecDeque::from([src]);
        while let Some(idx) = queue.pop_front() {
            let kv = self.graph[idx].kv.unwrap_or(source_kv);
            let here = self.graph[idx].name.clone();
            let mut next = Vec::new();
            for e in self.graph.edges(idx) {
                let other = if e.source() == idx { e.target() } else { e.source() };
                if seen[other.index()] {
                    continue;
                }
                let child_kv = match &e.weight().params {
                    BranchParams::Transformer { kvs, .. } if kvs.len() >= 2 => {
                        let (wp, wc) = if e.weight().bus1 == here { (0, 1) } else { (1, 0) };
                        if kvs[wp] > 0.0 { kv * kvs[wc] / kvs[wp] } else { kv }
                    }
                    _ => kv,
                };
                next.push((other, child_kv));
            }
            for (other, child_kv) in next {
                seen[other.index()] = true;
                let bus = &mut self.graph[other];
                if bus.kv.is_none() {
                    bus.kv = Some(child_kv);
                }
                queue.push_back(other);
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the bus the source is connected to.
    pub fn source_bus(&self) -> &str {
        &self.source
    }

    pub fn bus_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn branch_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Bus names in lexical order.
    pub fn bus_names(&self) -> impl Iterator<Item = &str> {
        self.buses.keys().map(String::as_str)
    }

    pub fn has_bus(&self, name: &str) -> bool {
        self.buses.contains_key(name)
    }

    /// # Errors
    ///
    /// Returns [`HcaError::BusNotFound`] for an unknown bus.
    pub fn bus(&self, name: &str) -> Result<&BusData> {
        self.buses
            .get(name)
            .map(|&idx| &self.graph[idx])
            .ok_or_else(|| HcaError::BusNotFound(name.to_string()))
    }

    fn bus_mut(&mut self, name: &str) -> Result<&mut BusData> {
        let idx = *self
            .buses
            .get(name)
            .ok_or_else(|| HcaError::BusNotFound(name.to_string()))?;
        Ok(&mut self.graph[idx])
    }

    pub fn buses(&self) -> impl Iterator<Item = &BusData> {
        self.buses.values().map(|&idx| &self.graph[idx])
    }

    /// # Errors
    ///
    /// Returns [`HcaError::ElementNotFound`] for an unknown element.
    pub fn branch(&self, element: &ElementRef) -> Result<&BranchData> {
        self.branches
            .get(element)
            .map(|&e| &self.graph[e])
            .ok_or_else(|| HcaError::element_not_found(element.class.to_string(), &element.name))
    }

    pub(crate) fn branch_mut(&mut self, element: &ElementRef) -> Result<&mut BranchData> {
        let e = *self.branches.get(element).ok_or_else(|| {
            HcaError::element_not_found(element.class.to_string(), &element.name)
        })?;
        Ok(&mut self.graph[e])
    }

    /// Branches ordered by element reference.
    pub fn branches(&self) -> impl Iterator<Item = &BranchData> {
        self.branches.values().map(|&e| &self.graph[e])
    }

    /// Looks up a line-class branch by solver name.
    pub fn line(&self, name: &str) -> Result<&BranchData> {
        self.branch(&ElementRef::new(ElementClass::Line, name))
    }

    /// Looks up a transformer-class branch by solver name.
    pub fn transformer(&self, name: &str) -> Result<&BranchData> {
        self.branch(&ElementRef::new(ElementClass::Transformer, name))
    }
}

#[cfg(test)]
pub(crate) mod test_feeders {
    //! Small circuits shared by the graph test modules.

    use crate::circuit::Circuit;

    pub(crate) const LOOPED: &str = r#"
name = "looped"

[source]
bus = "src"
base_kv = 12.47

[[lines]]
name = "trunk"
bus1 = "src"
bus2 = "b1"
length = 1.0
units = "mi"
r1 = 0.3
x1 = 0.6

[[lines]]
name = "tie"
bus1 = "b1"
bus2 = "b2"
length = 500
units = "ft"
r1 = 0.0001
x1 = 0.0001
switch = true
open = true

[[lines]]
name = "lat"
bus1 = "b1"
bus2 = "b3"
length = 0.5
units = "mi"
phases = 1
r1 = 0.5
x1 = 0.5

[[lines]]
name = "rec_line"
bus1 = "b3"
bus2 = "b4"
length = 0.2
units = "mi"
r1 = 0.3
x1 = 0.6

[[protection]]
name = "rec1"
class = "recloser"
line = "rec_line"

[[transformers]]
name = "t1a"
buses = ["b1", "lv1"]
kvs = [12.47, 0.48]
kvas = [500.0, 500.0]
taps = [1.0, 1.0]

[[transformers]]
name = "t1b"
buses = ["b1", "lv1"]
kvs = [12.47, 0.48]
kvas = [500.0, 500.0]
taps = [1.0, 1.0]

[[loads]]
name = "ld1"
bus = "b1"
kw = 100.0
residential = true

[[loads]]
name = "ld4"
bus = "b4"
kw = 40.0
phases = 1

[[pvsystems]]
name = "pv_lv"
bus = "lv1"
kw = 50.0
kva = 60.0
"#;

    pub(crate) fn looped() -> Circuit {
        Circuit::from_toml_str(LOOPED).expect("valid test circuit")
    }
}
