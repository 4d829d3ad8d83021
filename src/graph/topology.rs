//! Component decomposition and traversal queries.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use petgraph::unionfind::UnionFind;
use petgraph::visit::{EdgeRef, NodeIndexable};

use super::{BranchClass, BranchData, BranchParams, FeederGraph};
use crate::error::{HcaError, Result};
use crate::simulator::{Command, ElementClass, ElementRef};

impl FeederGraph {
    /// Recomputes every bus's component index with open switches and
    /// reclosers removed. Indices are numbered in bus-name order.
    pub(crate) fn assign_components(&mut self) {
        let mut uf = UnionFind::<usize>::new(self.graph.node_bound());
        for e in self.graph.edge_indices() {
            if self.graph[e].cuts_component() {
                continue;
            }
            if let Some((a, b)) = self.graph.edge_endpoints(e) {
                uf.union(a.index(), b.index());
            }
        }
        let mut ids: BTreeMap<usize, usize> = BTreeMap::new();
        let order: Vec<_> = self.buses.values().copied().collect();
        for idx in order {
            let root = uf.find(idx.index());
            let next = ids.len();
            let id = *ids.entry(root).or_insert(next);
            self.graph[idx].component = id;
        }
    }

    /// Component index of a bus.
    pub fn component_of(&self, bus: &str) -> Result<usize> {
        Ok(self.bus(bus)?.component)
    }

    /// Buses grouped by component index.
    pub fn components(&self) -> BTreeMap<usize, Vec<String>> {
        let mut out: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for bus in self.buses() {
            out.entry(bus.component).or_default().push(bus.name.clone());
        }
        out
    }

    /// Opens or closes a switching branch and reassigns components.
    ///
    /// # Errors
    ///
    /// Returns [`HcaError::Circuit`] when the branch is not a switch.
    pub fn set_open(&mut self, element: &ElementRef, open: bool) -> Result<Command> {
        let branch = self.branch_mut(element)?;
        if branch.class != BranchClass::Switch {
            return Err(HcaError::Circuit(format!("{element} is not a switch")));
        }
        branch.open = open;
        self.assign_components();
        Ok(if open {
            Command::Open {
                element: element.clone(),
            }
        } else {
            Command::Close {
                element: element.clone(),
            }
        })
    }

    /// Buses grouped by hop distance from the source over closed branches.
    /// Level 0 holds the source bus; each level is sorted by name.
    pub fn bfs_levels(&self) -> Vec<Vec<String>> {
        let Some(&src) = self.buses.get(&self.source) else {
            return Vec::new();
        };
        let mut depth = vec![usize::MAX; self.graph.node_bound()];
        depth[src.index()] = 0;
        let mut queue = VecDeque::from([src]);
        let mut levels: Vec<BTreeSet<String>> = Vec::new();
        while let Some(idx) = queue.pop_front() {
            let d = depth[idx.index()];
            if levels.len() <= d {
                levels.resize_with(d + 1, BTreeSet::new);
            }
            levels[d].insert(self.graph[idx].name.clone());
            for e in self.graph.edges(idx) {
                if e.weight().open {
                    continue;
                }
                let other = if e.source() == idx { e.target() } else { e.source() };
                if depth[other.index()] == usize::MAX {
                    depth[other.index()] = d + 1;
                    queue.push_back(other);
                }
            }
        }
        levels.into_iter().map(|l| l.into_iter().collect()).collect()
    }

    /// Three-phase buses eligible for new resources, the source bus
    /// excluded, in name order.
    pub fn three_phase_buses(&self) -> Vec<String> {
        self.buses()
            .filter(|b| b.phases >= 3 && b.name != self.source)
            .map(|b| b.name.clone())
            .collect()
    }

    /// Branches of the same element class sharing `element`'s bus pair,
    /// `element` itself included, in name order.
    pub fn parallel_branches(&self, element: &ElementRef) -> Result<Vec<ElementRef>> {
        let target = self.branch(element)?;
        let mut out: Vec<ElementRef> = self
            .branches()
            .filter(|b| b.element.class == element.class && same_pair(b, target))
            .map(|b| b.element.clone())
            .collect();
        out.sort();
        Ok(out)
    }

    /// Branches carrying a recloser, whose flows bound the components.
    pub fn boundary_reclosers(&self) -> Vec<&BranchData> {
        self.branches()
            .filter(|b| b.class == BranchClass::Recloser)
            .collect()
    }

    pub(crate) fn update_sequence_views(&mut self) {
        let mut pairs: BTreeMap<(String, String, ElementClass), usize> = BTreeMap::new();
        for b in self.branches() {
            *pairs.entry(pair_key(b)).or_default() += 1;
        }
        let indices: Vec<_> = self.branches.values().copied().collect();
        for e in indices {
            let b = &mut self.graph[e];
            let parallels = pairs.get(&pair_key(b)).copied().unwrap_or(1);
            b.sequence.parallels = parallels;
            b.sequence.length_mi = match &b.params {
                BranchParams::Line { length, units, .. } => units.to_miles(*length),
                _ => 0.0,
            };
            b.sequence.scale = if parallels > 1 {
                parallels as f64 / (parallels - 1) as f64
            } else {
                1.0
            };
        }
    }
}

fn pair_key(b: &BranchData) -> (String, String, ElementClass) {
    let (lo, hi) = if b.bus1 <= b.bus2 {
        (b.bus1.clone(), b.bus2.clone())
    } else {
        (b.bus2.clone(), b.bus1.clone())
    };
    (lo, hi, b.element.class)
}

fn same_pair(a: &BranchData, b: &BranchData) -> bool {
    (a.bus1 == b.bus1 && a.bus2 == b.bus2) || (a.bus1 == b.bus2 && a.bus2 == b.bus1)
}

#[cfg(test)]
mod tests {
    use super::super::test_feeders::looped;
    use super::*;

    fn graph() -> FeederGraph {
        FeederGraph::from_circuit(&looped()).expect("builds")
    }

    #[test]
    fn open_switch_and_recloser_split_components() {
        let g = graph();
        let comps = g.components();
        assert_eq!(comps.len(), 3);
        assert_ne!(
            g.component_of("b1").expect("b1"),
            g.component_of("b2").expect("b2")
        );
        assert_ne!(
            g.component_of("b3").expect("b3"),
            g.component_of("b4").expect("b4")
        );
        assert_eq!(
            g.component_of("src").expect("src"),
            g.component_of("lv1").expect("lv1")
        );
    }

    #[test]
    fn closing_the_tie_merges_components() {
        let mut g = graph();
        let tie = ElementRef::new(ElementClass::Line, "tie");
        let cmd = g.set_open(&tie, false).expect("closes");
        assert!(matches!(cmd, Command::Close { .. }));
        assert_eq!(g.components().len(), 2);
        let trunk = ElementRef::new(ElementClass::Line, "trunk");
        assert!(g.set_open(&trunk, true).is_err());
    }

    #[test]
    fn bfs_levels_skip_open_branches() {
        let g = graph();
        let levels = g.bfs_levels();
        assert_eq!(levels[0], vec!["src".to_string()]);
        assert_eq!(levels[1], vec!["b1".to_string()]);
        assert_eq!(levels[2], vec!["b3".to_string(), "lv1".to_string()]);
        assert!(!levels.iter().flatten().any(|b| b == "b2"));
    }

    #[test]
    fn candidate_buses_are_three_phase_and_not_source() {
        let g = graph();
        let buses = g.three_phase_buses();
        assert!(buses.contains(&"b1".to_string()));
        assert!(!buses.contains(&"src".to_string()));
        assert!(buses.contains(&"b4".to_string()));
    }

    #[test]
    fn parallel_transformers_share_sequence_scale() {
        let g = graph();
        let t1a = ElementRef::new(ElementClass::Transformer, "t1a");
        let legs = g.parallel_branches(&t1a).expect("found");
        assert_eq!(legs.len(), 2);
        let view = g.branch(&t1a).expect("t1a").sequence;
        assert_eq!(view.parallels, 2);
        assert_eq!(view.scale, 2.0);
        let trunk = g.line("trunk").expect("trunk").sequence;
        assert_eq!(trunk.parallels, 1);
        assert!((trunk.length_mi - 1.0).abs() < 1e-12);
    }
}
