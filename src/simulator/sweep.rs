//! In-process reference solver: balanced DistFlow backward/forward sweep.
//!
//! `SweepSimulator` interprets the same command language an external solver
//! would, builds a radial network from the enabled elements on every solve,
//! and runs the Baran-Wu branch-flow equations in per unit on a 1 MVA base.
//! Parallel branches between the same bus pair are combined and share flow
//! by admittance. Regulator controls step winding taps between sweeps.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{
    Command, ElementClass, ElementRef, MonitorTrace, Props, Query, QueryReply,
    SolveMode, SolveRequest, SolveResult, Simulator,
};
use crate::circuit::Circuit;
use crate::error::{HcaError, Result};
use crate::io::reports::{IntervalTotals, OverloadRecord, VoltageException};

/// Base power for the per-unit system, kVA.
const S_BASE_KVA: f64 = 1000.0;
const SQRT3: f64 = 1.732_050_807_568_877_2;
/// Regulator tap step, per unit.
const TAP_STEP: f64 = 0.006_25;
const TAP_MIN: f64 = 0.9;
const TAP_MAX: f64 = 1.1;
/// Buses below this base are reported as low-voltage.
const LV_KV: f64 = 1.0;

#[derive(Debug, Clone, PartialEq)]
struct Element {
    enabled: bool,
    closed: bool,
    props: Props,
}

/// Reference solver session.
#[derive(Debug, Clone)]
pub struct SweepSimulator {
    models: HashMap<PathBuf, Circuit>,
    elements: BTreeMap<ElementRef, Element>,
    /// Taps moved by regulator controls, keyed by transformer name.
    control_taps: BTreeMap<String, Vec<f64>>,
    last_monitors: BTreeMap<String, MonitorTrace>,
    last_converged: bool,
    max_iterations: usize,
    max_control_iterations: usize,
    tolerance: f64,
}

impl Default for SweepSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl SweepSimulator {
    pub fn new() -> Self {
        Self {
            models: HashMap::new(),
            elements: BTreeMap::new(),
            control_taps: BTreeMap::new(),
            last_monitors: BTreeMap::new(),
            last_converged: false,
            max_iterations: 100,
            max_control_iterations: 20,
            tolerance: 1e-10,
        }
    }

    /// Registers an in-memory circuit under `path`, so that `compile(path)`
    /// loads it without touching the filesystem.
    pub fn with_model(mut self, path: impl Into<PathBuf>, circuit: Circuit) -> Self {
        self.models.insert(path.into(), circuit);
        self
    }

    /// Caps the number of sweeps per solution point.
    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n.max(1);
        self
    }

    fn apply(&mut self, cmd: &Command) -> Result<()> {
        match cmd {
            Command::New { element, props } => {
                self.elements.insert(
                    element.clone(),
                    Element {
                        enabled: true,
                        closed: true,
                        props: props.clone(),
                    },
                );
            }
            Command::Edit { element, props } => {
                let el = self.elements.get_mut(element).ok_or_else(|| {
                    HcaError::element_not_found(element.class.to_string(), &element.name)
                })?;
                apply_edit(&mut el.props, props);
                if element.class == ElementClass::Transformer {
                    self.control_taps.remove(&element.name);
                }
            }
            Command::Enable { element } | Command::Disable { element } => {
                let el = self.elements.get_mut(element).ok_or_else(|| {
                    HcaError::element_not_found(element.class.to_string(), &element.name)
                })?;
                el.enabled = matches!(cmd, Command::Enable { .. });
            }
            Command::Open { element } | Command::Close { element } => {
                let el = self.elements.get_mut(element).ok_or_else(|| {
                    HcaError::element_not_found(element.class.to_string(), &element.name)
                })?;
                el.closed = matches!(cmd, Command::Close { .. });
            }
        }
        Ok(())
    }

    fn enabled(&self, class: ElementClass) -> impl Iterator<Item = (&ElementRef, &Element)> {
        self.elements
            .iter()
            .filter(move |(r, e)| r.class == class && e.enabled)
    }

    fn effective_taps(&self, name: &str, props: &Props) -> Vec<f64> {
        self.control_taps
            .get(name)
            .cloned()
            .or_else(|| props.list("taps").map(<[f64]>::to_vec))
            .unwrap_or_else(|| vec![1.0, 1.0])
    }

    fn build_network(&self) -> Result<Network> {
        let (src_ref, src) = self
            .enabled(ElementClass::Vsource)
            .next()
            .ok_or_else(|| HcaError::Solver("circuit has no enabled vsource".into()))?;
        let src_bus = src
            .props
            .text("bus1")
            .ok_or_else(|| HcaError::Solver(format!("{src_ref} has no bus1")))?
            .to_string();
        let src_kv = src.props.num("basekv").unwrap_or(12.47);
        let src_pu = src.props.num("pu").unwrap_or(1.0);

        let mut net = Network::default();
        net.source = net.bus_index(&src_bus);
        net.source_pu = src_pu;

        for class in [ElementClass::Line, ElementClass::Reactor] {
            for (r, e) in self.enabled(class) {
                let (Some(b1), Some(b2)) = (e.props.text("bus1"), e.props.text("bus2")) else {
                    warn!(element = %r, "branch without both terminals skipped");
                    continue;
                };
                let (bus1, bus2) = (net.bus_index(b1), net.bus_index(b2));
                let (r_ohm, x_ohm, kind) = if class == ElementClass::Line {
                    let len = e.props.num("length").unwrap_or(0.0);
                    (
                        e.props.num("r1").unwrap_or(0.0) * len,
                        e.props.num("x1").unwrap_or(0.0) * len,
                        BranchKind::Line {
                            normamps: e.props.num("normamps").unwrap_or(400.0),
                            emergamps: e.props.num("emergamps").unwrap_or(600.0),
                        },
                    )
                } else {
                    (
                        e.props.num("r").unwrap_or(0.0),
                        e.props.num("x").unwrap_or(0.0),
                        BranchKind::Reactor,
                    )
                };
                net.branches.push(BranchModel {
                    element: r.clone(),
                    bus1,
                    bus2,
                    usable: e.closed,
                    kind,
                    r_ohm,
                    x_ohm,
                    r_pu: 0.0,
                    x_pu: 0.0,
                    in_tree: false,
                });
            }
        }
        for (r, e) in self.enabled(ElementClass::Transformer) {
            let Some(buses) = e.props.names("buses") else {
                warn!(element = %r, "transformer without buses skipped");
                continue;
            };
            if buses.len() > 2 {
                debug!(element = %r, "only the first two windings are modelled");
            }
            if buses.len() < 2 {
                continue;
            }
            let kvs = e.props.list("kvs").map(<[f64]>::to_vec).unwrap_or_default();
            let kvas = e.props.list("kvas").map(<[f64]>::to_vec).unwrap_or_default();
            let kva = kvas.first().copied().unwrap_or(1000.0).max(1e-6);
            let emerg = e.props.num("emerghkva").unwrap_or(1.5 * kva);
            let (bus1, bus2) = (net.bus_index(&buses[0]), net.bus_index(&buses[1]));
            net.branches.push(BranchModel {
                element: r.clone(),
                bus1,
                bus2,
                usable: true,
                kind: BranchKind::Transformer {
                    kvs,
                    kva,
                    emerg_kva: emerg,
                    taps: self.effective_taps(&r.name, &e.props),
                },
                r_ohm: 0.0,
                x_ohm: 0.0,
                r_pu: e.props.num("%r").unwrap_or(1.0) / 100.0 * S_BASE_KVA / kva,
                x_pu: e.props.num("xhl").unwrap_or(2.0) / 100.0 * S_BASE_KVA / kva,
                in_tree: false,
            });
        }

        net.base_kv = vec![0.0; net.buses.len()];
        net.base_kv[net.source] = src_kv;
        net.build_tree()?;

        for (r, e) in self.elements.iter().filter(|(_, e)| e.enabled) {
            let kind = match r.class {
                ElementClass::Load => ShuntKind::Load,
                ElementClass::PvSystem => ShuntKind::Pv,
                ElementClass::Storage => ShuntKind::Storage,
                ElementClass::Generator => ShuntKind::Generator,
                ElementClass::Capacitor => ShuntKind::Capacitor,
                _ => continue,
            };
            let Some(bus) = e.props.text("bus1") else {
                continue;
            };
            let Some(&idx) = net.index.get(bus) else {
                warn!(element = %r, bus, "shunt on unknown bus ignored");
                continue;
            };
            net.shunts.push(ShuntModel {
                bus: idx,
                kind,
                props: e.props.clone(),
            });
        }

        for (r, e) in self.enabled(ElementClass::RegControl) {
            let Some(xf) = e.props.text("transformer") else {
                continue;
            };
            let Some(bi) = net.branches.iter().position(|b| {
                b.element.class == ElementClass::Transformer && b.element.name == xf
            }) else {
                warn!(element = %r, transformer = xf, "regulator on unknown transformer");
                continue;
            };
            net.regulators.push(RegModel {
                branch: bi,
                winding: e.props.num("winding").unwrap_or(2.0).max(1.0) as usize - 1,
                vreg: e.props.num("vreg").unwrap_or(120.0),
                band: e.props.num("band").unwrap_or(2.0),
                ptratio: e.props.num("ptratio"),
                revvreg: e.props.num("revvreg"),
            });
        }
        Ok(net)
    }

    fn record_monitors(&self, net: &Network, point: &PointSolution, out: &mut SolveResult) {
        for (r, e) in self.enabled(ElementClass::Monitor) {
            let Some(target) = e.props.text("element").and_then(|s| s.parse::<ElementRef>().ok())
            else {
                continue;
            };
            let terminal = e.props.num("terminal").unwrap_or(1.0) as usize;
            let mode = e.props.num("mode").unwrap_or(0.0) as u32;
            let Some(bi) = net.branches.iter().position(|b| b.element == target) else {
                continue;
            };
            let branch = &net.branches[bi];
            let bus = if terminal == 2 { branch.bus2 } else { branch.bus1 };
            let sign = if terminal == 2 { -1.0 } else { 1.0 };
            let trace = out
                .monitors
                .entry(r.name.clone())
                .or_insert_with(|| MonitorTrace {
                    element: target.clone(),
                    terminal,
                    mode,
                    channels: BTreeMap::new(),
                });
            let flow = point.flows[bi];
            if mode == 1 {
                push_channel(trace, "p_kw", sign * flow.p_kw);
                push_channel(trace, "q_kvar", sign * flow.q_kvar);
            } else {
                push_channel(trace, "v_pu", point.vpu(bus));
                push_channel(trace, "i_amps", flow.amps);
            }
        }
    }
}

fn push_channel(trace: &mut MonitorTrace, name: &str, value: f64) {
    trace.channels.entry(name.to_string()).or_default().push(value);
}

/// Applies edit properties, routing `wdg=`-scoped winding values into the
/// per-winding lists.
fn apply_edit(target: &mut Props, edit: &Props) {
    let winding = edit.num("wdg").map(|w| (w.max(1.0) as usize) - 1);
    for (key, value) in edit.iter() {
        if key == "wdg" {
            continue;
        }
        let list_key = match (winding, key.as_str()) {
            (Some(_), "tap") => Some("taps"),
            (Some(_), "kva") => Some("kvas"),
            (Some(_), "kv") => Some("kvs"),
            _ => None,
        };
        match (list_key, winding, value) {
            (Some(lk), Some(w), super::PropValue::Num(v)) => {
                let mut list = target.list(lk).map(<[f64]>::to_vec).unwrap_or_default();
                if list.len() <= w {
                    list.resize(w + 1, 1.0);
                }
                list[w] = *v;
                target.set(lk, list);
            }
            _ => target.set(key, value.clone()),
        }
    }
}

impl Simulator for SweepSimulator {
    fn compile(&mut self, model_path: &Path) -> Result<()> {
        let circuit = match self.models.get(model_path) {
            Some(c) => c.clone(),
            None => {
                let c = Circuit::from_toml_file(model_path)?;
                self.models.insert(model_path.to_path_buf(), c.clone());
                c
            }
        };
        self.elements.clear();
        self.control_taps.clear();
        self.last_monitors.clear();
        self.last_converged = false;
        self.execute(&circuit.to_commands())
    }

    fn execute(&mut self, commands: &[Command]) -> Result<()> {
        for cmd in commands {
            self.apply(cmd)?;
        }
        Ok(())
    }

    fn solve(&mut self, request: &SolveRequest) -> Result<SolveResult> {
        let mut net = self.build_network()?;
        let shapes = self.shapes();
        let step_hours = request.step_seconds / 3600.0;
        let mut out = SolveResult {
            converged: true,
            step_hours,
            ..SolveResult::default()
        };
        let mut peaks: BTreeMap<usize, (f64, f64, f64)> = BTreeMap::new();

        for k in 0..request.num_steps.max(1) {
            let hour = request.start.hours() + k as f64 * step_hours;
            let Some(point) = self.solve_point(&mut net, &shapes, request.mode, hour) else {
                warn!(hour, "sweep did not converge");
                out.converged = false;
                break;
            };
            out.times.push(hour + step_hours);
            for &b in &net.order {
                out.node_vpu
                    .entry(net.buses[b].clone())
                    .or_default()
                    .push(point.vpu(b));
            }
            let mut worst_normal = 0.0_f64;
            let mut worst_emerg = 0.0_f64;
            for (bi, branch) in net.branches.iter().enumerate() {
                let f = point.flows[bi];
                let trace = out.branches.entry(branch.element.clone()).or_default();
                trace.p_kw.push(f.p_kw);
                trace.q_kvar.push(f.q_kvar);
                trace.amps.push(f.amps);
                trace.pct_normal.push(f.pct_normal);
                trace.pct_emerg.push(f.pct_emerg);
                worst_normal = worst_normal.max(f.pct_normal);
                worst_emerg = worst_emerg.max(f.pct_emerg);
                let peak = peaks.entry(bi).or_insert((0.0, 0.0, 0.0));
                if f.pct_normal > peak.1 {
                    *peak = (f.amps, f.pct_normal, f.pct_emerg);
                }
            }
            self.record_monitors(&net, &point, &mut out);
            out.voltage_exceptions
                .push(voltage_exception(&net, &point, hour + step_hours));
            let source_kw = point.source_kw;
            let kwh = point.load_kw * step_hours;
            out.totals.push(IntervalTotals {
                time: hour + step_hours,
                kwh: source_kw * step_hours,
                peak_kw: source_kw,
                load_een: if worst_normal > 100.0 { kwh } else { 0.0 },
                load_ue: if worst_emerg > 100.0 { kwh } else { 0.0 },
            });
        }

        for (bi, (amps, pct_normal, pct_emerg)) in peaks {
            if pct_normal <= 100.0 {
                continue;
            }
            let branch = &net.branches[bi];
            let (norm, emerg) = branch.ratings_amps(&net);
            out.overloads.push(OverloadRecord {
                element: branch.element.to_string(),
                current: amps,
                pct_normal,
                pct_emerg,
                norm_amps: norm,
                emerg_amps: emerg,
            });
        }

        self.last_converged = out.converged;
        self.last_monitors = out.monitors.clone();
        Ok(out)
    }

    fn query(&self, query: &Query) -> Result<QueryReply> {
        Ok(match query {
            Query::ElementProps(r) => match self.elements.get(r) {
                Some(e) => QueryReply::Props {
                    enabled: e.enabled,
                    props: e.props.clone(),
                },
                None => QueryReply::Missing,
            },
            Query::BusBaseKv(bus) => {
                let net = self.build_network()?;
                match net.index.get(bus) {
                    Some(&i) if net.base_kv[i] > 0.0 => QueryReply::Number(net.base_kv[i]),
                    _ => QueryReply::Missing,
                }
            }
            Query::ParallelTransformers(name) => {
                let key = ElementRef::new(ElementClass::Transformer, name.as_str());
                let Some(target) = self.elements.get(&key) else {
                    return Ok(QueryReply::Missing);
                };
                let pair = sorted_pair(target.props.names("buses"));
                let names = self
                    .enabled(ElementClass::Transformer)
                    .filter(|(_, e)| sorted_pair(e.props.names("buses")) == pair)
                    .map(|(r, _)| r.name.clone())
                    .collect();
                QueryReply::Names(names)
            }
            Query::RegControl(name) => {
                let key = ElementRef::new(ElementClass::RegControl, name.as_str());
                match self.elements.get(&key) {
                    Some(e) => {
                        let mut props = e.props.clone();
                        if let Some(xf) = e.props.text("transformer") {
                            let xref = ElementRef::new(ElementClass::Transformer, xf);
                            if let Some(x) = self.elements.get(&xref) {
                                let w = e.props.num("winding").unwrap_or(2.0).max(1.0) as usize;
                                let taps = self.effective_taps(xf, &x.props);
                                if let Some(t) = taps.get(w - 1) {
                                    props.set("tap", *t);
                                }
                            }
                        }
                        QueryReply::Props {
                            enabled: e.enabled,
                            props,
                        }
                    }
                    None => QueryReply::Missing,
                }
            }
            Query::Monitor(name) => match self.last_monitors.get(name) {
                Some(t) => QueryReply::Trace(t.clone()),
                None => QueryReply::Missing,
            },
            Query::ActiveElements(class) => {
                QueryReply::Names(self.enabled(*class).map(|(r, _)| r.name.clone()).collect())
            }
        })
    }

    fn converged(&self) -> bool {
        self.last_converged
    }
}

fn sorted_pair(buses: Option<&[String]>) -> Vec<String> {
    let mut v: Vec<String> = buses.unwrap_or_default().iter().take(2).cloned().collect();
    v.sort();
    v
}

fn voltage_exception(net: &Network, point: &PointSolution, hour: f64) -> VoltageException {
    let mut mv = (f64::INFINITY, f64::NEG_INFINITY);
    let mut lv = (f64::INFINITY, f64::NEG_INFINITY);
    for &b in &net.order {
        let v = point.vpu(b);
        let slot = if net.base_kv[b] < LV_KV { &mut lv } else { &mut mv };
        slot.0 = slot.0.min(v);
        slot.1 = slot.1.max(v);
    }
    let finite = |x: f64| if x.is_finite() { x } else { 0.0 };
    VoltageException {
        hour,
        min_voltage: finite(mv.0),
        max_voltage: finite(mv.1),
        min_lv_voltage: finite(lv.0),
        max_lv_voltage: finite(lv.1),
    }
}

#[derive(Debug, Clone)]
struct LoadShape {
    interval: f64,
    mult: Vec<f64>,
}

impl SweepSimulator {
    fn shapes(&self) -> HashMap<String, LoadShape> {
        self.enabled(ElementClass::LoadShape)
            .map(|(r, e)| {
                (
                    r.name.clone(),
                    LoadShape {
                        interval: e.props.num("interval").unwrap_or(1.0).max(1e-9),
                        mult: e.props.list("mult").map(<[f64]>::to_vec).unwrap_or_default(),
                    },
                )
            })
            .collect()
    }

    fn solve_point(
        &mut self,
        net: &mut Network,
        shapes: &HashMap<String, LoadShape>,
        mode: SolveMode,
        hour: f64,
    ) -> Option<PointSolution> {
        let mut point = None;
        for _ in 0..=self.max_control_iterations {
            let p = net.sweep(shapes, mode, hour, self.max_iterations, self.tolerance)?;
            let moved = net.step_regulators(&p);
            point = Some(p);
            if !moved {
                break;
            }
        }
        for reg in &net.regulators {
            if let BranchKind::Transformer { taps, .. } = &net.branches[reg.branch].kind {
                self.control_taps
                    .insert(net.branches[reg.branch].element.name.clone(), taps.clone());
            }
        }
        point
    }
}

#[derive(Debug, Clone)]
enum BranchKind {
    Line { normamps: f64, emergamps: f64 },
    Reactor,
    Transformer {
        kvs: Vec<f64>,
        kva: f64,
        emerg_kva: f64,
        taps: Vec<f64>,
    },
}

#[derive(Debug, Clone)]
struct BranchModel {
    element: ElementRef,
    bus1: usize,
    bus2: usize,
    usable: bool,
    kind: BranchKind,
    r_ohm: f64,
    x_ohm: f64,
    r_pu: f64,
    x_pu: f64,
    in_tree: bool,
}

impl BranchModel {
    fn other(&self, bus: usize) -> usize {
        if self.bus1 == bus { self.bus2 } else { self.bus1 }
    }

    /// Normal and emergency ratings in amps at terminal 1.
    fn ratings_amps(&self, net: &Network) -> (f64, f64) {
        match &self.kind {
            BranchKind::Line {
                normamps,
                emergamps,
            } => (*normamps, *emergamps),
            BranchKind::Reactor => (f64::INFINITY, f64::INFINITY),
            BranchKind::Transformer { kva, emerg_kva, .. } => {
                let kv = net.base_kv[self.bus1].max(1e-9);
                (kva / (SQRT3 * kv), emerg_kva / (SQRT3 * kv))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShuntKind {
    Load,
    Pv,
    Storage,
    Generator,
    Capacitor,
}

#[derive(Debug, Clone)]
struct ShuntModel {
    bus: usize,
    kind: ShuntKind,
    props: Props,
}

#[derive(Debug, Clone)]
struct RegModel {
    branch: usize,
    winding: usize,
    vreg: f64,
    band: f64,
    ptratio: Option<f64>,
    revvreg: Option<f64>,
}

/// The edge group connecting a bus to its parent in the sweep tree.
#[derive(Debug, Clone)]
struct Link {
    parent: usize,
    legs: Vec<usize>,
    /// Admittance share of each leg.
    shares: Vec<f64>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Flow {
    p_kw: f64,
    q_kvar: f64,
    amps: f64,
    pct_normal: f64,
    pct_emerg: f64,
}

#[derive(Debug, Clone)]
struct PointSolution {
    v2: Vec<f64>,
    flows: Vec<Flow>,
    source_kw: f64,
    load_kw: f64,
}

impl PointSolution {
    fn vpu(&self, bus: usize) -> f64 {
        self.v2[bus].max(0.0).sqrt()
    }
}

#[derive(Debug, Clone, Default)]
struct Network {
    buses: Vec<String>,
    index: HashMap<String, usize>,
    base_kv: Vec<f64>,
    source: usize,
    source_pu: f64,
    order: Vec<usize>,
    links: Vec<Option<Link>>,
    children: Vec<Vec<usize>>,
    branches: Vec<BranchModel>,
    shunts: Vec<ShuntModel>,
    regulators: Vec<RegModel>,
}

impl Network {
    fn bus_index(&mut self, name: &str) -> usize {
        if let Some(&i) = self.index.get(name) {
            return i;
        }
        let i = self.buses.len();
        self.buses.push(name.to_string());
        self.index.insert(name.to_string(), i);
        i
    }

    /// Breadth-first tree from the source over usable branches. Parallel
    /// branches between a parent and child form one link; any other edge
    /// closing a loop is left out of the sweep.
    fn build_tree(&mut self) -> Result<()> {
        let n = self.buses.len();
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (bi, b) in self.branches.iter().enumerate() {
            if b.usable && b.bus1 != b.bus2 {
                adjacency[b.bus1].push(bi);
                adjacency[b.bus2].push(bi);
            }
        }
        self.links = vec![None; n];
        self.children = vec![Vec::new(); n];
        let mut seen = vec![false; n];
        let mut queue = VecDeque::from([self.source]);
        seen[self.source] = true;
        while let Some(bus) = queue.pop_front() {
            self.order.push(bus);
            let mut by_child: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
            for &bi in &adjacency[bus] {
                let other = self.branches[bi].other(bus);
                if !seen[other] {
                    by_child.entry(other).or_default().push(bi);
                }
            }
            for (child, legs) in by_child {
                seen[child] = true;
                let parent_kv = self.base_kv[bus];
                self.base_kv[child] = self.child_kv(legs[0], bus, parent_kv);
                for &bi in &legs {
                    self.branches[bi].in_tree = true;
                    let zb = parent_kv.powi(2) * 1000.0 / S_BASE_KVA;
                    let b = &mut self.branches[bi];
                    if !matches!(b.kind, BranchKind::Transformer { .. }) && zb > 0.0 {
                        b.r_pu = b.r_ohm / zb;
                        b.x_pu = b.x_ohm / zb;
                    }
                }
                let shares = self.admittance_shares(&legs);
                self.links[child] = Some(Link {
                    parent: bus,
                    legs,
                    shares,
                });
                self.children[bus].push(child);
                queue.push_back(child);
            }
        }
        if self.order.len() < n {
            debug!(
                isolated = n - self.order.len(),
                "buses not reachable from the source are left de-energised"
            );
        }
        Ok(())
    }

    fn child_kv(&self, branch: usize, parent: usize, parent_kv: f64) -> f64 {
        match &self.branches[branch].kind {
            BranchKind::Transformer { kvs, .. } if kvs.len() >= 2 => {
                let (wp, wc) = self.windings(branch, parent);
                if kvs[wp] > 0.0 {
                    parent_kv * kvs[wc] / kvs[wp]
                } else {
                    parent_kv
                }
            }
            _ => parent_kv,
        }
    }

    /// Winding indices on the parent and child side of a transformer.
    fn windings(&self, branch: usize, parent: usize) -> (usize, usize) {
        if self.branches[branch].bus1 == parent {
            (0, 1)
        } else {
            (1, 0)
        }
    }

    fn admittance_shares(&self, legs: &[usize]) -> Vec<f64> {
        let mags: Vec<f64> = legs
            .iter()
            .map(|&bi| {
                let b = &self.branches[bi];
                b.r_pu.hypot(b.x_pu)
            })
            .collect();
        let zero_legs = mags.iter().filter(|m| **m <= 1e-12).count();
        if zero_legs > 0 {
            return mags
                .iter()
                .map(|m| if *m <= 1e-12 { 1.0 / zero_legs as f64 } else { 0.0 })
                .collect();
        }
        let total: f64 = mags.iter().map(|m| 1.0 / m).sum();
        mags.iter().map(|m| (1.0 / m) / total).collect()
    }

    /// Equivalent series impedance of a link's parallel legs.
    fn link_impedance(&self, link: &Link) -> (f64, f64) {
        let (mut g, mut b) = (0.0, 0.0);
        for &bi in &link.legs {
            let br = &self.branches[bi];
            let z2 = br.r_pu.powi(2) + br.x_pu.powi(2);
            if z2 <= 1e-24 {
                return (0.0, 0.0);
            }
            g += br.r_pu / z2;
            b -= br.x_pu / z2;
        }
        let y2 = g * g + b * b;
        (g / y2, -b / y2)
    }

    /// Squared voltage ratio across a link, child over parent.
    fn link_ratio2(&self, link: &Link) -> f64 {
        let bi = link.legs[0];
        match &self.branches[bi].kind {
            BranchKind::Transformer { taps, .. } if taps.len() >= 2 => {
                let (wp, wc) = self.windings(bi, link.parent);
                (taps[wc] / taps[wp].max(1e-9)).powi(2)
            }
            _ => 1.0,
        }
    }

    fn shunt_injection(
        &self,
        shunt: &ShuntModel,
        shapes: &HashMap<String, LoadShape>,
        mode: SolveMode,
        hour: f64,
        v2: f64,
    ) -> (f64, f64) {
        let p = &shunt.props;
        let mult = shape_mult(shapes, p, mode, hour);
        match shunt.kind {
            ShuntKind::Load => {
                let kw = p.num("kw").unwrap_or(0.0) * mult;
                (kw, kw * pf_tan(p.num("pf").unwrap_or(1.0)))
            }
            ShuntKind::Pv => {
                let kva = p.num("kva").unwrap_or(0.0);
                let out = (p.num("pmpp").unwrap_or(0.0) * p.num("irradiance").unwrap_or(1.0)
                    * mult)
                    .clamp(0.0, kva.max(0.0));
                let q = inverter_q(p, out, kva, v2);
                (-out, -q)
            }
            ShuntKind::Storage => {
                let kva = p.num("kva").unwrap_or(0.0);
                let out = (p.num("kwrated").unwrap_or(0.0) * mult).clamp(-kva, kva);
                (-out, 0.0)
            }
            ShuntKind::Generator => {
                let kva = p.num("kva").unwrap_or(f64::INFINITY);
                let out = p.num("kw").unwrap_or(0.0).min(kva);
                (-out, -out * pf_tan(p.num("pf").unwrap_or(1.0)))
            }
            ShuntKind::Capacitor => (0.0, -p.num("kvar").unwrap_or(0.0) * v2),
        }
    }

    /// One converged branch-flow solution, or `None` on divergence.
    fn sweep(
        &self,
        shapes: &HashMap<String, LoadShape>,
        mode: SolveMode,
        hour: f64,
        max_iterations: usize,
        tolerance: f64,
    ) -> Option<PointSolution> {
        let n = self.buses.len();
        let v_src = self.source_pu * self.source_pu;
        let mut v2 = vec![v_src; n];
        let mut p_send = vec![0.0; n];
        let mut q_send = vec![0.0; n];

        for _ in 0..max_iterations {
            let mut bus_p = vec![0.0; n];
            let mut bus_q = vec![0.0; n];
            let mut load_kw = 0.0;
            for s in &self.shunts {
                let (pk, qk) = self.shunt_injection(s, shapes, mode, hour, v2[s.bus]);
                if s.kind == ShuntKind::Load {
                    load_kw += pk;
                }
                bus_p[s.bus] += pk / S_BASE_KVA;
                bus_q[s.bus] += qk / S_BASE_KVA;
            }

            for &child in self.order.iter().rev() {
                let Some(link) = &self.links[child] else {
                    continue;
                };
                let mut pr = bus_p[child];
                let mut qr = bus_q[child];
                for &gc in &self.children[child] {
                    pr += p_send[gc];
                    qr += q_send[gc];
                }
                let (r, x) = self.link_impedance(link);
                let vr = (v2[child] / self.link_ratio2(link)).max(1e-6);
                let l = (pr * pr + qr * qr) / vr;
                p_send[child] = pr + r * l;
                q_send[child] = qr + x * l;
            }

            let mut delta: f64 = 0.0;
            for &child in &self.order {
                let Some(link) = &self.links[child] else {
                    continue;
                };
                let vp = v2[link.parent];
                let (r, x) = self.link_impedance(link);
                let (ps, qs) = (p_send[child], q_send[child]);
                let v_mid = vp - 2.0 * (r * ps + x * qs) + (r * r + x * x) * (ps * ps + qs * qs) / vp;
                if !v_mid.is_finite() || v_mid <= 0.0 {
                    return None;
                }
                let new = v_mid * self.link_ratio2(link);
                delta = delta.max((new - v2[child]).abs());
                v2[child] = new;
            }
            if delta < tolerance {
                let flows = self.flows(&v2, &p_send, &q_send);
                let source_kw = self.children[self.source]
                    .iter()
                    .map(|&c| p_send[c])
                    .sum::<f64>()
                    * S_BASE_KVA
                    + bus_p[self.source] * S_BASE_KVA;
                return Some(PointSolution {
                    v2,
                    flows,
                    source_kw,
                    load_kw,
                });
            }
        }
        None
    }

    fn flows(&self, v2: &[f64], p_send: &[f64], q_send: &[f64]) -> Vec<Flow> {
        let mut flows = vec![Flow::default(); self.branches.len()];
        for &child in &self.order {
            let Some(link) = &self.links[child] else {
                continue;
            };
            for (&bi, &share) in link.legs.iter().zip(&link.shares) {
                let b = &self.branches[bi];
                let sign = if b.bus1 == link.parent { 1.0 } else { -1.0 };
                let p_kw = sign * p_send[child] * share * S_BASE_KVA;
                let q_kvar = sign * q_send[child] * share * S_BASE_KVA;
                let s_kva = p_kw.hypot(q_kvar);
                let kv = v2[b.bus1].max(0.0).sqrt() * self.base_kv[b.bus1];
                let amps = if kv > 0.0 { s_kva / (SQRT3 * kv) } else { 0.0 };
                let (pct_normal, pct_emerg) = match &b.kind {
                    BranchKind::Line {
                        normamps,
                        emergamps,
                    } => (100.0 * amps / normamps, 100.0 * amps / emergamps),
                    BranchKind::Reactor => (0.0, 0.0),
                    BranchKind::Transformer { kva, emerg_kva, .. } => {
                        (100.0 * s_kva / kva, 100.0 * s_kva / emerg_kva)
                    }
                };
                flows[bi] = Flow {
                    p_kw,
                    q_kvar,
                    amps,
                    pct_normal,
                    pct_emerg,
                };
            }
        }
        flows
    }

    /// Moves regulator taps one step toward their band. Returns whether any
    /// tap moved.
    fn step_regulators(&mut self, point: &PointSolution) -> bool {
        let mut moved = false;
        for reg in self.regulators.clone() {
            let branch = &self.branches[reg.branch];
            if !branch.in_tree {
                continue;
            }
            let bus = if reg.winding == 0 { branch.bus1 } else { branch.bus2 };
            let kv = self.base_kv[bus];
            let pt = reg.ptratio.unwrap_or(kv * 1000.0 / SQRT3 / 120.0).max(1e-9);
            let v_ctrl = point.vpu(bus) * kv * 1000.0 / SQRT3 / pt;
            let reverse = point.flows[reg.branch].p_kw < 0.0;
            let target = match (reverse, reg.revvreg) {
                (true, Some(rev)) => rev,
                _ => reg.vreg,
            };
            let step = if v_ctrl < target - reg.band / 2.0 {
                TAP_STEP
            } else if v_ctrl > target + reg.band / 2.0 {
                -TAP_STEP
            } else {
                continue;
            };
            if let BranchKind::Transformer { taps, .. } = &mut self.branches[reg.branch].kind {
                if let Some(t) = taps.get_mut(reg.winding) {
                    let new = (*t + step).clamp(TAP_MIN, TAP_MAX);
                    if (new - *t).abs() > 1e-12 {
                        *t = new;
                        moved = true;
                    }
                }
            }
        }
        moved
    }
}

fn pf_tan(pf: f64) -> f64 {
    let a = pf.abs().clamp(1e-6, 1.0);
    let t = (1.0 - a * a).sqrt() / a;
    if pf < 0.0 { -t } else { t }
}

/// Reactive output of an inverter, generator convention.
fn inverter_q(props: &Props, p_out: f64, kva: f64, v2: f64) -> f64 {
    let headroom = (kva * kva - p_out * p_out).max(0.0).sqrt();
    let q = match props.text("invmode").unwrap_or("constant_pf") {
        "unity" => 0.0,
        "volt_var" => volt_var_fraction(v2.max(0.0).sqrt()) * kva,
        _ => p_out * pf_tan(props.num("pf").unwrap_or(1.0)),
    };
    q.clamp(-headroom, headroom)
}

/// Piecewise-linear volt-var curve, fraction of rated kVA.
fn volt_var_fraction(v: f64) -> f64 {
    const CURVE: [(f64, f64); 4] = [(0.92, 0.44), (0.98, 0.0), (1.02, 0.0), (1.08, -0.44)];
    if v <= CURVE[0].0 {
        return CURVE[0].1;
    }
    for w in CURVE.windows(2) {
        let ((v0, q0), (v1, q1)) = (w[0], w[1]);
        if v <= v1 {
            return q0 + (q1 - q0) * (v - v0) / (v1 - v0);
        }
    }
    CURVE[3].1
}

fn shape_mult(shapes: &HashMap<String, LoadShape>, props: &Props, mode: SolveMode, hour: f64) -> f64 {
    let name = match mode {
        SolveMode::Snapshot => return 1.0,
        SolveMode::Daily => props.text("daily"),
        SolveMode::Yearly => props.text("yearly").or_else(|| props.text("daily")),
    };
    let Some(name) = name else {
        return 1.0;
    };
    let Some(shape) = shapes.get(name) else {
        warn!(shape = name, "unknown load shape, using multiplier 1.0");
        return 1.0;
    };
    if shape.mult.is_empty() {
        return 1.0;
    }
    let h = match mode {
        SolveMode::Daily => hour.rem_euclid(24.0),
        _ => hour.max(0.0),
    };
    let idx = (h / shape.interval + 1e-9).floor() as usize % shape.mult.len();
    shape.mult[idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::Circuit;
    use crate::simulator::SolverTime;

    const FEEDER: &str = r#"
name = "t"

[source]
bus = "src"
base_kv = 12.47
pu = 1.0

[[loadshapes]]
name = "flat_half"
mult = [0.5, 1.0]

[[lines]]
name = "l1"
bus1 = "src"
bus2 = "b1"
length = 2.0
units = "mi"
r1 = 0.3
x1 = 0.6
normamps = 100
emergamps = 150

[[loads]]
name = "ld1"
bus = "b1"
kw = 500.0
pf = 0.95
shape = "flat_half"
"#;

    fn sim() -> SweepSimulator {
        let c = Circuit::from_toml_str(FEEDER).expect("valid");
        let mut s = SweepSimulator::new().with_model("t.toml", c);
        s.compile(Path::new("t.toml")).expect("compiles");
        s
    }

    #[test]
    fn load_depresses_downstream_voltage() {
        let mut s = sim();
        let r = s.solve(&SolveRequest::snapshot()).expect("solves");
        assert!(r.converged);
        let v = r.node_vpu["b1"][0];
        assert!(v < 1.0 && v > 0.95, "v = {v}");
        let line = &r.branches[&ElementRef::new(ElementClass::Line, "l1")];
        assert!(line.p_kw[0] > 500.0, "losses flow through the source");
    }

    #[test]
    fn pv_injection_raises_voltage() {
        let mut s = sim();
        s.execute(&[Command::new_element(
            ElementRef::new(ElementClass::PvSystem, "pv1"),
            Props::new()
                .with("bus1", "b1")
                .with("pmpp", 3000.0)
                .with("kva", 3000.0),
        )])
        .expect("executes");
        let r = s.solve(&SolveRequest::snapshot()).expect("solves");
        assert!(r.node_vpu["b1"][0] > 1.0);
        assert!(r.branches[&ElementRef::new(ElementClass::Line, "l1")].p_kw[0] < 0.0);
    }

    #[test]
    fn daily_mode_follows_shape() {
        let mut s = sim();
        let req = SolveRequest {
            mode: SolveMode::Daily,
            start: SolverTime::new(0, 0.0),
            num_steps: 2,
            step_seconds: 3600.0,
        };
        let r = s.solve(&req).expect("solves");
        assert_eq!(r.times, vec![1.0, 2.0]);
        let v = &r.node_vpu["b1"];
        assert!(v[0] > v[1], "half load at hour 0 gives higher voltage");
    }

    #[test]
    fn disabled_and_missing_elements() {
        let mut s = sim();
        let ld = ElementRef::new(ElementClass::Load, "ld1");
        s.execute(&[Command::disable(ld.clone())]).expect("executes");
        let r = s.solve(&SolveRequest::snapshot()).expect("solves");
        assert!((r.node_vpu["b1"][0] - 1.0).abs() < 1e-9);
        let missing = Command::disable(ElementRef::new(ElementClass::Load, "nope"));
        assert!(s.execute(&[missing]).is_err());
    }

    #[test]
    fn overload_report_lists_hot_lines() {
        let mut s = sim();
        s.execute(&[Command::edit(
            ElementRef::new(ElementClass::Line, "l1"),
            Props::new().with("normamps", 10.0).with("emergamps", 20.0),
        )])
        .expect("executes");
        let r = s.solve(&SolveRequest::snapshot()).expect("solves");
        assert_eq!(r.overloads.len(), 1);
        assert_eq!(r.overloads[0].element, "line.l1");
        assert!(r.overloads[0].pct_emerg > 100.0);
    }

    #[test]
    fn winding_scoped_edit_updates_tap_list() {
        let mut props = Props::new().with("taps", vec![1.0, 1.0]);
        apply_edit(&mut props, &Props::new().with("wdg", 2.0).with("tap", 1.0125));
        assert_eq!(props.list("taps"), Some(&[1.0, 1.0125][..]));
    }

    #[test]
    fn volt_var_curve_is_piecewise_linear() {
        assert_eq!(volt_var_fraction(0.9), 0.44);
        assert_eq!(volt_var_fraction(1.0), 0.0);
        assert!((volt_var_fraction(1.05) + 0.22).abs() < 1e-12);
        assert_eq!(volt_var_fraction(1.2), -0.44);
    }
}
