//! Resource kinds and the keys of the per-step maps.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::circuit::LengthUnit;
use crate::config::BoundStrategy;
use crate::graph::{Rating, ShuntClass};
use crate::simulator::ElementRef;

/// Kind of resource the engine can add.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resource {
    Pv,
    Bat,
    Der,
}

impl Resource {
    pub const ALL: [Resource; 3] = [Resource::Pv, Resource::Bat, Resource::Der];

    /// Shunt class the resource is modelled as.
    pub fn shunt_class(self) -> ShuntClass {
        match self {
            Resource::Pv => ShuntClass::PvSystem,
            Resource::Bat => ShuntClass::Storage,
            Resource::Der => ShuntClass::Generator,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Pv => "pv",
            Resource::Bat => "bat",
            Resource::Der => "der",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pv" => Ok(Resource::Pv),
            "bat" => Ok(Resource::Bat),
            "der" => Ok(Resource::Der),
            _ => Err(format!("unknown resource `{s}`, expected pv, bat or der")),
        }
    }
}

/// `(resource, bus)`; serialises as `"{resource}/{bus}"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceKey {
    pub resource: Resource,
    pub bus: String,
}

impl ResourceKey {
    pub fn new(resource: Resource, bus: impl Into<String>) -> Self {
        Self {
            resource,
            bus: bus.into(),
        }
    }

    /// Solver name of the resource added at step `cnt`.
    pub fn element_name(&self, cnt: u64, recalc: bool) -> String {
        let suffix = if recalc { "_recalc" } else { "" };
        format!("{}_{}_cnt{cnt}{suffix}", self.resource, self.bus)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.bus)
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let (resource, bus) = s
            .split_once('/')
            .ok_or_else(|| format!("expected `resource/bus`, got `{s}`"))?;
        Ok(Self::new(resource.parse()?, bus))
    }
}

impl From<ResourceKey> for String {
    fn from(k: ResourceKey) -> Self {
        k.to_string()
    }
}

/// Headroom found at a bus and the violations that bounded it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct HcEntry {
    pub hc: Rating,
    pub violations: Vec<String>,
}

/// `(element, cnt)`; serialises as `"{class}.{name}#{cnt}"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UpgradeKey {
    pub element: ElementRef,
    pub cnt: u64,
}

impl fmt::Display for UpgradeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.element, self.cnt)
    }
}

impl TryFrom<String> for UpgradeKey {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let (element, cnt) = s
            .rsplit_once('#')
            .ok_or_else(|| format!("expected `class.name#cnt`, got `{s}`"))?;
        Ok(Self {
            element: element.parse()?,
            cnt: cnt.parse().map_err(|e| format!("bad step in `{s}`: {e}"))?,
        })
    }
}

impl From<UpgradeKey> for String {
    fn from(k: UpgradeKey) -> Self {
        k.to_string()
    }
}

/// What an upgrade changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeAction {
    Reconductor,
    Upsize,
    TapStep,
    Setpoint,
}

/// One recorded upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeRecord {
    pub action: UpgradeAction,
    /// Ratings before: amps for lines, kVA per winding for transformers,
    /// tap for tap steps, volts for set points.
    pub old: Vec<f64>,
    pub new: Vec<f64>,
    pub cost: f64,
    #[serde(default)]
    pub length: Option<f64>,
    #[serde(default)]
    pub units: Option<LengthUnit>,
}

/// Arguments of one HCA round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundOptions {
    pub resource: Resource,
    pub bus: Option<String>,
    pub sij: Option<Rating>,
    pub allow_violations: bool,
    pub hciter: bool,
    pub recalculate: bool,
    /// Per-round replacements for the configured search limits.
    pub bnd_strategy: Option<BoundStrategy>,
    pub kw_tol: Option<f64>,
    pub kw_min: Option<f64>,
}

impl RoundOptions {
    /// A searching round at a random bus with a sampled size.
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            bus: None,
            sij: None,
            allow_violations: false,
            hciter: true,
            recalculate: false,
            bnd_strategy: None,
            kw_tol: None,
            kw_min: None,
        }
    }

    pub fn at_bus(mut self, bus: impl Into<String>) -> Self {
        self.bus = Some(bus.into());
        self
    }

    pub fn with_sij(mut self, sij: Rating) -> Self {
        self.sij = Some(sij);
        self
    }

    pub fn allow_violations(mut self, allow: bool) -> Self {
        self.allow_violations = allow;
        self
    }

    pub fn hciter(mut self, hciter: bool) -> Self {
        self.hciter = hciter;
        self
    }

    pub fn recalculate(mut self, recalculate: bool) -> Self {
        self.recalculate = recalculate;
        self
    }

    pub fn bnd_strategy(mut self, strategy: BoundStrategy) -> Self {
        self.bnd_strategy = Some(strategy);
        self
    }

    pub fn kw_tol(mut self, kw_tol: f64) -> Self {
        self.kw_tol = Some(kw_tol);
        self
    }

    pub fn kw_min(mut self, kw_min: f64) -> Self {
        self.kw_min = Some(kw_min);
        self
    }
}

/// What a round decided.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundOutcome {
    pub key: ResourceKey,
    pub cnt: u64,
    /// Capacity left installed at the bus by this round.
    pub sij: Rating,
    pub hc: HcEntry,
    pub converged: bool,
    pub violation_count: usize,
    pub exhausted: bool,
}

impl fmt::Display for RoundOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cnt={:>4} {:<16} sij={:>9.1} kW hc={:>9.1} kW violations={}",
            self.cnt,
            self.key.to_string(),
            self.sij.kw,
            self.hc.hc.kw,
            self.violation_count
        )?;
        if !self.converged {
            f.write_str(" [non-converged]")?;
        }
        if self.exhausted {
            f.write_str(" [exhausted]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::ElementClass;

    #[test]
    fn names_follow_resource_bus_counter() {
        let k = ResourceKey::new(Resource::Pv, "b7");
        assert_eq!(k.element_name(3, false), "pv_b7_cnt3");
        assert_eq!(k.element_name(3, true), "pv_b7_cnt3_recalc");
        assert_eq!(Resource::Bat.shunt_class(), ShuntClass::Storage);
    }

    #[test]
    fn keys_round_trip_through_strings() {
        let k = ResourceKey::new(Resource::Der, "bus/with/slash");
        let back = ResourceKey::try_from(String::from(k.clone())).expect("parses");
        assert_eq!(back, k);

        let u = UpgradeKey {
            element: ElementRef::new(ElementClass::Line, "l#1"),
            cnt: 4,
        };
        let back = UpgradeKey::try_from(u.to_string()).expect("parses");
        assert_eq!(back, u);
        assert!("Solar".parse::<Resource>().is_err());
    }
}
