//! One hosting-capacity round.

use std::collections::BTreeSet;

use tracing::{info, warn};

use super::bisect::SearchParams;
use super::{HcEntry, HcaEngine, Resource, ResourceKey, RoundOptions, RoundOutcome};
use crate::error::{HcaError, Result};
use crate::graph::Rating;
use crate::simulator::Simulator;

impl<S: Simulator> HcaEngine<S> {
    /// Runs one round: places a resource, searches its capacity, and
    /// records the outcome at the current step.
    ///
    /// Staged edits of the previous round are committed first. A
    /// recalculating round leaves the feeder as it found it and keeps the
    /// step counter; its headroom is the full limit.
    ///
    /// # Errors
    ///
    /// Returns [`HcaError::BusNotFound`] for an unknown explicit bus,
    /// [`HcaError::NoCandidateBus`] when sampling finds nothing left, and
    /// propagates solver errors.
    pub fn hca_round(&mut self, opts: RoundOptions) -> Result<RoundOutcome> {
        self.commit();
        self.rollback()?;
        if !opts.recalculate {
            self.cnt += 1;
        }
        let cnt = self.cnt;
        let resource = opts.resource;

        let bus = match &opts.bus {
            Some(b) => {
                self.graph.bus(b)?;
                b.clone()
            }
            None => self.sample_bus(resource)?,
        };
        if !self.visited.contains(&bus) {
            self.visited.push(bus.clone());
        }
        let key = ResourceKey::new(resource, &bus);
        let sij = match opts.sij {
            Some(s) => s,
            None => self.sample_sij(&key),
        };
        let name = key.element_name(cnt, opts.recalculate);
        let params = SearchParams::for_round(&self.config.hca, &opts);
        info!(%key, cnt, kw = sij.kw, kva = sij.kva, "hca round");

        let first = self.try_capacity(&key, &name, sij)?;
        let zero = Rating::default();
        let mut violations = Vec::new();

        let (installed, hc) = if first.passed() {
            let limit = if opts.hciter {
                let (limit, v) = self.bisect(&key, &name, Some(sij), None, params)?;
                violations = v;
                limit
            } else {
                sij
            };
            let hc = if opts.recalculate {
                limit
            } else if limit.kw > sij.kw {
                limit - sij
            } else {
                zero
            };
            (sij, hc)
        } else {
            violations = first.violations();
            if opts.allow_violations {
                if let Some(report) = &first.report {
                    self.data.record_eval(&key, cnt, report.clone());
                }
            }
            let limit = if opts.hciter {
                let (limit, v) = self.bisect(&key, &name, None, Some(sij), params)?;
                if !v.is_empty() {
                    violations = v;
                }
                limit
            } else {
                zero
            };
            let installed = if opts.allow_violations { sij } else { limit };
            let hc = if opts.recalculate { limit } else { zero };
            (installed, hc)
        };

        // Definitive solve. A recalculating round evaluates its limit and
        // then backs it out again.
        let placed = if opts.recalculate { hc } else { installed };
        let final_trial = self.try_capacity(&key, &name, placed)?;
        if opts.recalculate {
            self.rollback()?;
        }
        let report = final_trial.report.clone();
        match &report {
            Some(r) => self.data.record_eval(&key, cnt, r.clone()),
            None => warn!(%key, cnt, "definitive solve did not converge"),
        }

        if !opts.recalculate {
            self.data.record_sij(&key, cnt, installed);
        }
        let hc_entry = HcEntry {
            hc,
            violations: violations.clone(),
        };
        if opts.hciter {
            self.data.record_hc(&key, cnt, hc_entry.clone());
        }

        let exhausted =
            (!first.passed() && opts.allow_violations) || (opts.hciter && hc.kw < params.kw_min);
        if exhausted {
            self.exhausted
                .entry(resource)
                .or_default()
                .insert(bus.clone());
        }
        let totals = self.stotal();
        self.data.stotal.insert(cnt, totals);
        let violation_count = report.as_ref().map_or(0, |r| r.violation_count());
        self.last_report = report;

        info!(
            %key,
            cnt,
            installed_kw = installed.kw,
            hc_kw = hc.kw,
            exhausted,
            violations = ?violations,
            "round finished"
        );
        Ok(RoundOutcome {
            key,
            cnt,
            sij: if opts.recalculate { zero } else { installed },
            hc: hc_entry,
            converged: first.converged && final_trial.converged,
            violation_count,
            exhausted,
        })
    }

    /// Draws a bus from the three-phase candidates and visited buses, less
    /// the buses exhausted for `resource`.
    fn sample_bus(&mut self, resource: Resource) -> Result<String> {
        let mut pool: BTreeSet<String> = self.graph.three_phase_buses().into_iter().collect();
        pool.extend(self.visited.iter().cloned());
        if let Some(done) = self.exhausted.get(&resource) {
            pool.retain(|b| !done.contains(b));
        }
        let pool: Vec<String> = pool.into_iter().collect();
        let i = self
            .rng
            .index(pool.len())
            .ok_or_else(|| HcaError::NoCandidateBus(resource.to_string()))?;
        Ok(pool[i].clone())
    }

    /// Draws a candidate size, capped by the latest headroom at the bus.
    fn sample_sij(&mut self, key: &ResourceKey) -> Rating {
        let search = &self.config.hca;
        let [lo, hi] = search.pv_kw_range;
        let pf = search.pf;
        let hours = search.bat_hours.clone();
        let mut kw = self.rng.uniform(lo, hi);
        let cap = self
            .data
            .hc_at_or_before(key, self.cnt)
            .map(|prev| prev.hc.kw)
            .filter(|kw| *kw > 0.0);
        if let Some(cap) = cap {
            kw = kw.min(cap);
        }
        let rating = Rating::new(kw, kw / pf);
        if key.resource == Resource::Bat {
            let h = self
                .rng
                .index(hours.len())
                .map_or(4.0, |i| hours[i]);
            return rating.with_kwh(kw * h);
        }
        rating
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_engines::radial_engine;
    use super::*;
    use crate::config::{BoundStrategy, HcaConfig};
    use crate::hca::bisect::NON_CONVERGED;
    use crate::metrics::MetricId;

    #[test]
    fn headroom_round_grows_past_the_candidate() {
        let mut engine = radial_engine(HcaConfig::trivial());
        let out = engine
            .hca_round(
                RoundOptions::new(Resource::Pv)
                    .at_bus("b1")
                    .with_sij(Rating::new(100.0, 125.0)),
            )
            .expect("round");
        assert_eq!(out.cnt, 1);
        assert!(out.converged);
        assert!(out.hc.hc.kw > 0.0);
        assert_eq!(out.violation_count, 0);
        assert!(!out.exhausted);
        let report = engine.last_report().expect("report");
        assert!(report.margin(MetricId::VoltageVmax).is_some_and(|m| m > 0.0));
        assert_eq!(engine.ledger().pending().len(), 1);
    }

    #[test]
    fn violating_round_without_search_discards_the_trial() {
        let mut engine = radial_engine(HcaConfig::trivial());
        let out = engine
            .hca_round(
                RoundOptions::new(Resource::Pv)
                    .at_bus("b2")
                    .with_sij(Rating::new(500.0, 625.0))
                    .hciter(false),
            )
            .expect("round");
        assert_eq!(out.sij.kw, 0.0);
        assert!(engine.ledger().pending().is_empty());
        assert!(engine.get_hc(Resource::Pv, "b2").is_empty());
        assert!(!engine.last_violation_list().is_empty());
    }

    #[test]
    fn allowed_violations_stay_installed_and_exhaust_the_bus() {
        let mut engine = radial_engine(HcaConfig::trivial());
        let out = engine
            .hca_round(
                RoundOptions::new(Resource::Der)
                    .at_bus("b2")
                    .with_sij(Rating::new(500.0, 500.0))
                    .allow_violations(true)
                    .hciter(false),
            )
            .expect("round");
        assert_eq!(out.sij.kw, 500.0);
        assert!(out.exhausted);
        assert!(out.violation_count > 0);
        assert!(engine.is_exhausted(Resource::Der, "b2"));
    }

    #[test]
    fn sampling_skips_exhausted_buses() {
        let mut engine = radial_engine(HcaConfig::trivial());
        engine
            .exhausted
            .entry(Resource::Pv)
            .or_default()
            .insert("b2".into());
        for _ in 0..20 {
            let bus = engine.sample_bus(Resource::Pv).expect("bus");
            assert_eq!(bus, "b1");
        }
        engine
            .exhausted
            .entry(Resource::Pv)
            .or_default()
            .insert("b1".into());
        assert!(matches!(
            engine.sample_bus(Resource::Pv),
            Err(HcaError::NoCandidateBus(_))
        ));
    }

    #[test]
    fn sampled_storage_carries_energy() {
        let mut engine = radial_engine(HcaConfig::trivial());
        let r = engine.sample_sij(&ResourceKey::new(Resource::Bat, "b1"));
        assert!((50.0..=1000.0).contains(&r.kw));
        let kwh = r.kwh.expect("energy");
        assert!((kwh - 2.0 * r.kw).abs() < 1e-9 || (kwh - 4.0 * r.kw).abs() < 1e-9);
    }

    #[test]
    fn small_violating_candidate_keeps_feasible_capacity() {
        let mut engine = radial_engine(HcaConfig::trivial());
        engine.upgrade_line("weak", Some(2.0)).expect("upgrades");
        let out = engine
            .hca_round(
                RoundOptions::new(Resource::Pv)
                    .at_bus("b2")
                    .with_sij(Rating::new(50.0, 62.5)),
            )
            .expect("round");
        assert!(out.sij.kw >= 30.0 && out.sij.kw < 50.0, "sij {}", out.sij.kw);
        assert!(!engine.bisection_trace().is_empty());
    }

    #[test]
    fn round_search_follows_its_own_strategy() {
        let mut engine = radial_engine(HcaConfig::trivial());
        engine
            .hca_round(
                RoundOptions::new(Resource::Pv)
                    .at_bus("b1")
                    .with_sij(Rating::new(100.0, 125.0))
                    .bnd_strategy(BoundStrategy::Add(40.0)),
            )
            .expect("round");
        let trace = engine.bisection_trace();
        assert_eq!(trace[0].trial, 140.0);
        for step in trace.iter().filter(|s| s.upper.is_none()) {
            let lower = step.lower.expect("upward steps carry a lower bound");
            assert!((step.trial - lower - 40.0).abs() < 1e-9);
        }
    }

    #[test]
    fn round_floor_override_decides_exhaustion() {
        let mut engine = radial_engine(HcaConfig::trivial());
        let out = engine
            .hca_round(
                RoundOptions::new(Resource::Pv)
                    .at_bus("b1")
                    .with_sij(Rating::new(100.0, 125.0))
                    .kw_min(1.0e6),
            )
            .expect("round");
        assert!(out.hc.hc.kw < 1.0e6);
        assert!(out.exhausted);
        assert!(engine.is_exhausted(Resource::Pv, "b1"));
    }

    #[test]
    fn collapsed_voltage_counts_as_a_violation() {
        let mut engine = radial_engine(HcaConfig::trivial());
        // No node reaches this floor, so every solve is downgraded.
        engine.config.min_converged_vpu = 1.5;
        let key = ResourceKey::new(Resource::Pv, "b1");
        let out = engine
            .hca_round(
                RoundOptions::new(Resource::Pv)
                    .at_bus("b1")
                    .with_sij(Rating::new(100.0, 125.0)),
            )
            .expect("round");
        assert!(!out.converged);
        assert_eq!(out.sij.kw, 0.0);
        assert_eq!(out.hc.hc.kw, 0.0);
        assert_eq!(out.hc.violations, vec![NON_CONVERGED.to_string()]);
        assert_eq!(out.violation_count, 0);

        let trace = engine.bisection_trace();
        assert!(!trace.is_empty());
        assert!(trace.iter().all(|s| !s.passed));
        assert!(trace.windows(2).all(|w| w[1].trial < w[0].trial));
        assert!(!engine.data().eval.contains_key(&key));
    }
}
