//! Node and edge payloads of the feeder graph.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

use crate::circuit::LengthUnit;
use crate::simulator::{ElementClass, ElementRef, Props};

/// Class of a shunt device attached to a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShuntClass {
    Load,
    PvSystem,
    Storage,
    Generator,
    Capacitor,
    Vsource,
}

impl ShuntClass {
    pub const ALL: [ShuntClass; 6] = [
        ShuntClass::Load,
        ShuntClass::PvSystem,
        ShuntClass::Storage,
        ShuntClass::Generator,
        ShuntClass::Capacitor,
        ShuntClass::Vsource,
    ];

    pub fn element_class(self) -> ElementClass {
        match self {
            ShuntClass::Load => ElementClass::Load,
            ShuntClass::PvSystem => ElementClass::PvSystem,
            ShuntClass::Storage => ElementClass::Storage,
            ShuntClass::Generator => ElementClass::Generator,
            ShuntClass::Capacitor => ElementClass::Capacitor,
            ShuntClass::Vsource => ElementClass::Vsource,
        }
    }

    /// Solver properties carrying a rating of this class.
    pub fn rating_props(self, rating: &Rating) -> Props {
        match self {
            ShuntClass::Load => Props::new().with("kw", rating.kw),
            ShuntClass::PvSystem => Props::new()
                .with("pmpp", rating.kw)
                .with("kva", rating.kva),
            ShuntClass::Storage => Props::new()
                .with("kwrated", rating.kw)
                .with("kva", rating.kva)
                .with("kwhrated", rating.kwh.unwrap_or(0.0)),
            ShuntClass::Generator => Props::new().with("kw", rating.kw).with("kva", rating.kva),
            ShuntClass::Capacitor => Props::new().with("kvar", rating.kva),
            ShuntClass::Vsource => Props::new(),
        }
    }
}

impl fmt::Display for ShuntClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.element_class().solver_name())
    }
}

/// A device rating. `kwh` is only meaningful for storage.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rating {
    pub kw: f64,
    pub kva: f64,
    #[serde(default)]
    pub kwh: Option<f64>,
}

impl Rating {
    pub fn new(kw: f64, kva: f64) -> Self {
        Self { kw, kva, kwh: None }
    }

    pub fn with_kwh(mut self, kwh: f64) -> Self {
        self.kwh = Some(kwh);
        self
    }

    /// Scales every field by the same factor.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            kw: self.kw * factor,
            kva: self.kva * factor,
            kwh: self.kwh.map(|e| e * factor),
        }
    }

    /// Whether every field is within `tol` of zero.
    pub fn is_zero(&self, tol: f64) -> bool {
        self.kw.abs() <= tol && self.kva.abs() <= tol && self.kwh.is_none_or(|e| e.abs() <= tol)
    }

    pub fn approx_eq(&self, other: &Rating, tol: f64) -> bool {
        (self.kw - other.kw).abs() <= tol
            && (self.kva - other.kva).abs() <= tol
            && (self.kwh.unwrap_or(0.0) - other.kwh.unwrap_or(0.0)).abs() <= tol
    }
}

fn add_opt(a: Option<f64>, b: Option<f64>, sign: f64) -> Option<f64> {
    match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0.0) + sign * b.unwrap_or(0.0)),
    }
}

impl Add for Rating {
    type Output = Rating;

    fn add(self, rhs: Rating) -> Rating {
        Rating {
            kw: self.kw + rhs.kw,
            kva: self.kva + rhs.kva,
            kwh: add_opt(self.kwh, rhs.kwh, 1.0),
        }
    }
}

impl Sub for Rating {
    type Output = Rating;

    fn sub(self, rhs: Rating) -> Rating {
        Rating {
            kw: self.kw - rhs.kw,
            kva: self.kva - rhs.kva,
            kwh: add_opt(self.kwh, rhs.kwh, -1.0),
        }
    }
}

/// One shunt attached to a bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShuntEntry {
    pub class: ShuntClass,
    pub name: String,
    pub rating: Rating,
}

/// Bus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusData {
    pub name: String,
    /// Nominal line-to-line voltage, kV.
    pub kv: Option<f64>,
    pub phases: usize,
    pub shunts: Vec<ShuntEntry>,
    pub totals: BTreeMap<ShuntClass, Rating>,
    pub coords: Option<(f64, f64)>,
    pub component: usize,
}

impl BusData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kv: None,
            phases: 0,
            shunts: Vec::new(),
            totals: BTreeMap::new(),
            coords: None,
            component: 0,
        }
    }

    /// The class of the first shunt entry, or `"bus"`.
    pub fn class_tag(&self) -> String {
        self.shunts
            .first()
            .map_or_else(|| "bus".to_string(), |s| s.class.to_string())
    }

    pub fn total(&self, class: ShuntClass) -> Rating {
        self.totals.get(&class).copied().unwrap_or_default()
    }

    /// Sum of entry ratings of `class`, recomputed from the shunt list.
    pub fn summed(&self, class: ShuntClass) -> Rating {
        self.shunts
            .iter()
            .filter(|s| s.class == class)
            .fold(Rating::default(), |acc, s| acc + s.rating)
    }
}

/// Branch class as seen by topology and upgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchClass {
    Line,
    Transformer,
    Regulator,
    Switch,
    Reactor,
    Fuse,
    Recloser,
    SwtControl,
}

/// Class-specific electrical parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BranchParams {
    Line {
        length: f64,
        units: LengthUnit,
        r1: f64,
        x1: f64,
        normamps: f64,
        emergamps: f64,
        underground: bool,
    },
    Transformer {
        windings: usize,
        kvs: Vec<f64>,
        kvas: Vec<f64>,
        taps: Vec<f64>,
    },
    Reactor {
        r: f64,
        x: f64,
    },
}

/// Sequence-component view used for contingency screening.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SequenceView {
    /// Branches sharing this branch's bus pair, itself included.
    pub parallels: usize,
    pub length_mi: f64,
    /// Flow scaling when one parallel leg is lost.
    pub scale: f64,
}

impl Default for SequenceView {
    fn default() -> Self {
        Self {
            parallels: 1,
            length_mi: 0.0,
            scale: 1.0,
        }
    }
}

/// Branch payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchData {
    pub class: BranchClass,
    /// The solver element modelling the branch.
    pub element: ElementRef,
    pub bus1: String,
    pub bus2: String,
    pub phases: usize,
    pub params: BranchParams,
    /// Open state; only switching branches are ever open.
    pub open: bool,
    /// Name of the protective device or regulator control attached.
    pub device: Option<String>,
    pub sequence: SequenceView,
}

impl BranchData {
    pub fn name(&self) -> &str {
        &self.element.name
    }

    pub fn length_feet(&self) -> Option<f64> {
        match &self.params {
            BranchParams::Line { length, units, .. } => Some(units.to_feet(*length)),
            _ => None,
        }
    }

    /// Whether this branch partitions the feeder into islands.
    pub fn cuts_component(&self) -> bool {
        self.class == BranchClass::Recloser || (self.class == BranchClass::Switch && self.open)
    }
}
