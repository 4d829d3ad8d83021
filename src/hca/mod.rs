//! Hosting-capacity engine.
//!
//! [`HcaEngine`] owns one solver session, the feeder graph, the change-line
//! ledger, the metric evaluator, and the seeded stream. A round places a
//! resource at a bus, searches its capacity by bisection, and records the
//! outcome in [`PerStepData`]. Every edit goes through the ledger, so the
//! session can always be rebuilt from the base circuit plus `history`.
//!
//! Trials are undone with a rollback: the ledger drops its staged edits
//! and replays `history`, and the graph returns to its last committed copy.

pub mod bisect;
pub mod data;
pub mod parallel;
pub mod rng;
pub mod round;
pub mod sequence;
pub mod setup;
pub mod types;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::circuit::Circuit;
use crate::config::{HcaConfig, HcaMethod};
use crate::error::Result;
use crate::graph::{FeederGraph, Rating};
use crate::io::shapes::RegulatorShape;
use crate::ledger::Ledger;
use crate::metrics::{EvalReport, MetricEvaluator};
use crate::simulator::{
    Command, ElementClass, ElementRef, Props, SolveRequest, SolveResult, Simulator, SolverTime,
};

pub use bisect::BisectStep;
pub use data::PerStepData;
pub use parallel::{WindowRun, run_windows, split_windows};
pub use rng::{HcaRng, RngState};
pub use sequence::SequenceClock;
pub use types::{
    HcEntry, Resource, ResourceKey, RoundOptions, RoundOutcome, UpgradeAction, UpgradeKey,
    UpgradeRecord,
};

/// The engine over one feeder and one solver session.
pub struct HcaEngine<S: Simulator> {
    pub(crate) config: HcaConfig,
    pub(crate) model_path: PathBuf,
    pub(crate) sim: S,
    pub(crate) ledger: Ledger,
    pub(crate) graph: FeederGraph,
    /// The graph as of the last commit.
    pub(crate) checkpoint: FeederGraph,
    pub(crate) evaluator: MetricEvaluator,
    pub(crate) rng: HcaRng,
    pub(crate) data: PerStepData,
    pub(crate) visited: Vec<String>,
    pub(crate) exhausted: BTreeMap<Resource, BTreeSet<String>>,
    pub(crate) cnt: u64,
    pub(crate) time: SolverTime,
    pub(crate) reg_shapes: Vec<RegulatorShape>,
    /// Proxy load name to the shape it follows.
    pub(crate) proxies: BTreeMap<String, String>,
    pub(crate) last_report: Option<EvalReport>,
    /// Most recent evaluation that reported violations.
    pub(crate) last_failed: Option<EvalReport>,
    pub(crate) bisection_trace: Vec<BisectStep>,
}

impl<S: Simulator> HcaEngine<S> {
    /// Opens a session on `circuit`, applies the setup edits, and freezes
    /// the baseline.
    ///
    /// # Errors
    ///
    /// Returns [`HcaError::Config`](crate::error::HcaError::Config) when the
    /// configuration fails validation, and propagates circuit, solver, and
    /// lookup errors raised during setup.
    pub fn new(config: HcaConfig, circuit: &Circuit, sim: S) -> Result<Self> {
        let mut engine = Self::open(config, circuit, sim)?;
        engine.setup(circuit)?;
        Ok(engine)
    }

    /// Like [`HcaEngine::new`], reading the circuit from
    /// [`HcaConfig::model_path`].
    pub fn from_config(config: HcaConfig, sim: S) -> Result<Self> {
        let circuit = Circuit::from_toml_file(&config.model_path())?;
        Self::new(config, &circuit, sim)
    }

    /// An engine with a compiled session and no setup edits or baseline.
    pub(crate) fn open(config: HcaConfig, circuit: &Circuit, mut sim: S) -> Result<Self> {
        config.check()?;
        circuit.check()?;
        let model_path = config.model_path();
        let graph = FeederGraph::from_circuit(circuit)?;
        let evaluator = MetricEvaluator::new(&config.metrics)?;
        let rng = HcaRng::for_feeder(graph.name(), config.seed);
        let mut ledger = Ledger::new();
        ledger.reset(&mut sim, &model_path, true)?;
        info!(
            feeder = graph.name(),
            buses = graph.bus_count(),
            branches = graph.branch_count(),
            seed = rng.seed(),
            "engine opened"
        );
        Ok(Self {
            time: config.start_time,
            config,
            model_path,
            sim,
            ledger,
            checkpoint: graph.clone(),
            graph,
            evaluator,
            rng,
            data: PerStepData::default(),
            visited: Vec::new(),
            exhausted: BTreeMap::new(),
            cnt: 0,
            reg_shapes: Vec::new(),
            proxies: BTreeMap::new(),
            last_report: None,
            last_failed: None,
            bisection_trace: Vec::new(),
        })
    }

    /// Promotes staged edits into history and checkpoints the graph.
    pub(crate) fn commit(&mut self) {
        self.ledger.save_state();
        self.checkpoint = self.graph.clone();
    }

    /// Drops staged edits, replays history into a fresh session, and puts
    /// the graph back to the last commit.
    pub(crate) fn rollback(&mut self) -> Result<()> {
        self.ledger.reset(&mut self.sim, &self.model_path, true)?;
        self.graph = self.checkpoint.clone();
        Ok(())
    }

    /// Rebuilds the session from history plus the staged edits.
    ///
    /// # Errors
    ///
    /// Propagates solver errors from compiling or replaying.
    pub fn replay(&mut self) -> Result<()> {
        self.ledger.reset(&mut self.sim, &self.model_path, false)
    }

    /// Commits staged edits and solves the feeder as it now stands.
    pub fn solve_committed(&mut self) -> Result<SolveResult> {
        self.commit();
        self.solve()
    }

    fn solve_request(&self) -> SolveRequest {
        match self.config.hca_method {
            HcaMethod::TimeSeries => SolveRequest {
                mode: self.config.solnmode,
                start: self.config.start_time,
                num_steps: self.config.numsteps,
                step_seconds: self.config.stepsize,
            },
            HcaMethod::Sequence => SolveRequest {
                mode: self.config.solnmode,
                start: self.time,
                num_steps: 1,
                step_seconds: self.config.stepsize,
            },
        }
    }

    /// Stages presolve edits, solves, and clears them again.
    ///
    /// A solve that converges with some node below `min_converged_vpu` is
    /// returned as not converged.
    pub(crate) fn solve(&mut self) -> Result<SolveResult> {
        let result = match self.stage_presolve() {
            Ok(()) => {
                let request = self.solve_request();
                self.sim.solve(&request)
            }
            Err(e) => Err(e),
        };
        self.ledger.clear_presolve();
        let mut result = result?;
        if result.converged && !result.converged_above(self.config.min_converged_vpu) {
            warn!(
                min_vpu = result.min_vpu(),
                floor = self.config.min_converged_vpu,
                "solve converged to a collapsed voltage, treated as failed"
            );
            result.converged = false;
        }
        Ok(result)
    }

    /// Adds a resource of `key.resource` named `name` at `key.bus`.
    pub(crate) fn inject(&mut self, key: &ResourceKey, name: &str, rating: Rating) -> Result<()> {
        let extra = self.resource_props(key.resource, &key.bus)?;
        let cmd = self
            .graph
            .add_shunt(key.resource.shunt_class(), name, &key.bus, rating, extra)?;
        self.ledger.push(&mut self.sim, cmd)
    }

    /// Solver properties of a new resource beyond its rating.
    pub(crate) fn resource_props(&self, resource: Resource, bus: &str) -> Result<Props> {
        let phases = self.graph.bus(bus)?.phases.max(1);
        let mut props = Props::new().with("phases", phases as f64);
        match resource {
            Resource::Pv => {
                props.set("pf", self.config.invpf);
                props.set("invmode", self.config.invmode.as_str());
                if let Some(curve) = &self.config.pvcurve {
                    props.set("daily", curve.as_str());
                }
            }
            Resource::Bat => {}
            Resource::Der => props.set("pf", 1.0),
        }
        Ok(props)
    }

    /// Takes the most recently recorded capacity of `resource` back off
    /// `bus`.
    ///
    /// The amount comes from the `sij` history: the latest entry names the
    /// device added at that step and its rating. With no entry, or a zero
    /// one, nothing is removed and `None` is returned.
    pub fn remove_der(&mut self, resource: Resource, bus: &str) -> Result<Option<Rating>> {
        self.graph.bus(bus)?;
        let key = ResourceKey::new(resource, bus);
        let Some((added_at, rating)) = self.data.sij_at_or_before(&key, self.cnt) else {
            return Ok(None);
        };
        if rating.kw <= 0.0 {
            return Ok(None);
        }
        self.commit();
        let name = key.element_name(added_at, false);
        let cmd = self.graph.remove_shunt(&name, bus, rating)?;
        self.ledger.push(&mut self.sim, cmd)?;
        self.cnt += 1;
        self.data.record_sij(&key, self.cnt, Rating::default());
        let totals = self.stotal();
        self.data.stotal.insert(self.cnt, totals);
        info!(%key, device = %name, kw = rating.kw, "resource removed");
        Ok(Some(rating))
    }

    /// Installed capacity of each resource kind across the whole feeder.
    pub fn stotal(&self) -> BTreeMap<Resource, Rating> {
        Resource::ALL
            .into_iter()
            .map(|r| {
                let class = r.shunt_class();
                let total = self
                    .graph
                    .buses()
                    .fold(Rating::default(), |acc, b| acc + b.total(class));
                (r, total)
            })
            .collect()
    }

    pub fn config(&self) -> &HcaConfig {
        &self.config
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn graph(&self) -> &FeederGraph {
        &self.graph
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn evaluator(&self) -> &MetricEvaluator {
        &self.evaluator
    }

    pub fn simulator(&self) -> &S {
        &self.sim
    }

    pub fn data(&self) -> &PerStepData {
        &self.data
    }

    /// Step counter.
    pub fn cnt(&self) -> u64 {
        self.cnt
    }

    pub fn time(&self) -> SolverTime {
        self.time
    }

    pub fn rng_state(&self) -> RngState {
        self.rng.state()
    }

    /// Buses that have hosted a round, in first-visit order.
    pub fn visited(&self) -> &[String] {
        &self.visited
    }

    pub fn exhausted(&self, resource: Resource) -> Vec<&str> {
        self.exhausted
            .get(&resource)
            .map(|s| s.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn is_exhausted(&self, resource: Resource, bus: &str) -> bool {
        self.exhausted
            .get(&resource)
            .is_some_and(|s| s.contains(bus))
    }

    /// Headroom series of `resource` at `bus`, in step order.
    pub fn get_hc(&self, resource: Resource, bus: &str) -> Vec<(u64, &HcEntry)> {
        self.data.hc_series(&ResourceKey::new(resource, bus))
    }

    /// Latest capacity recorded for `resource` at `bus`.
    pub fn get_sij(&self, resource: Resource, bus: &str) -> Option<Rating> {
        self.data
            .sij_at_or_before(&ResourceKey::new(resource, bus), u64::MAX)
            .map(|(_, r)| r)
    }

    pub fn get_eval(&self, resource: Resource, bus: &str) -> Option<&BTreeMap<u64, EvalReport>> {
        self.data.eval.get(&ResourceKey::new(resource, bus))
    }

    /// Report of the most recent definitive solve.
    pub fn last_report(&self) -> Option<&EvalReport> {
        self.last_report.as_ref()
    }

    /// Most recent evaluation that reported violations.
    pub fn last_failed_report(&self) -> Option<&EvalReport> {
        self.last_failed.as_ref()
    }

    pub fn last_violation_list(&self) -> &[String] {
        self.evaluator.last_violation_list()
    }

    /// Bounds visited by the most recent bisection.
    pub fn bisection_trace(&self) -> &[BisectStep] {
        &self.bisection_trace
    }

    /// Edits the named element through the ledger, updating nothing in the
    /// graph.
    pub(crate) fn push_edit(&mut self, element: ElementRef, props: Props) -> Result<()> {
        self.ledger.push(&mut self.sim, Command::edit(element, props))
    }

    /// Names of enabled solver elements of `class`.
    pub(crate) fn active_elements(&self, class: ElementClass) -> Result<Vec<String>> {
        use crate::simulator::{Query, QueryReply};
        Ok(match self.sim.query(&Query::ActiveElements(class))? {
            QueryReply::Names(names) => names,
            _ => Vec::new(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_engines::radial_engine;
    use super::*;

    #[test]
    fn fresh_engine_has_baseline_and_empty_data() {
        let engine = radial_engine(HcaConfig::trivial());
        assert!(engine.evaluator().baseline().is_some());
        assert!(engine.data().is_empty());
        assert_eq!(engine.cnt(), 0);
        assert!(engine.stotal().values().all(|r| r.kw == 0.0));
        assert!(engine.ledger().pending().is_empty());
    }

    #[test]
    fn remove_der_without_history_is_a_no_op() {
        let mut engine = radial_engine(HcaConfig::trivial());
        let history = engine.ledger().history().len();
        assert_eq!(engine.remove_der(Resource::Pv, "b1").expect("runs"), None);
        assert_eq!(engine.ledger().history().len(), history);
        assert_eq!(engine.cnt(), 0);
    }

    #[test]
    fn remove_der_backs_out_the_recorded_capacity() {
        let mut engine = radial_engine(HcaConfig::trivial());
        let out = engine
            .hca_round(
                RoundOptions::new(Resource::Pv)
                    .at_bus("b1")
                    .with_sij(Rating::new(100.0, 125.0))
                    .hciter(false),
            )
            .expect("round");
        assert_eq!(out.sij.kw, 100.0);
        assert_eq!(engine.stotal()[&Resource::Pv].kw, 100.0);

        let removed = engine.remove_der(Resource::Pv, "b1").expect("runs");
        assert_eq!(removed.map(|r| r.kw), Some(100.0));
        assert_eq!(engine.stotal()[&Resource::Pv].kw, 0.0);
        assert_eq!(engine.get_sij(Resource::Pv, "b1").map(|r| r.kw), Some(0.0));
        assert_eq!(engine.remove_der(Resource::Pv, "b1").expect("runs"), None);
        assert!(engine.graph().aggregate_mismatches(1e-6).is_empty());
    }
}
