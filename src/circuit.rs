//! Serde model of a feeder circuit description.
//!
//! A circuit file is a TOML document with one table array per element
//! class. The feeder graph is built from these tables, and the solver
//! session loads the same circuit through [`Circuit::to_commands`].

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HcaError, Result};
use crate::simulator::{Command, ElementClass, ElementRef, Props};

/// Length unit of a line's `length` and per-unit impedances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthUnit {
    Mi,
    #[default]
    Kft,
    Km,
    M,
    Ft,
    In,
    None,
}

impl LengthUnit {
    /// Feet per one unit. `None` lengths are taken as miles.
    pub fn feet(self) -> f64 {
        match self {
            LengthUnit::Mi | LengthUnit::None => 5280.0,
            LengthUnit::Kft => 1000.0,
            LengthUnit::Km => 3280.839_895,
            LengthUnit::M => 3.280_839_895,
            LengthUnit::Ft => 1.0,
            LengthUnit::In => 1.0 / 12.0,
        }
    }

    pub fn to_feet(self, length: f64) -> f64 {
        length * self.feet()
    }

    pub fn to_miles(self, length: f64) -> f64 {
        self.to_feet(length) / 5280.0
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LengthUnit::Mi => "mi",
            LengthUnit::Kft => "kft",
            LengthUnit::Km => "km",
            LengthUnit::M => "m",
            LengthUnit::Ft => "ft",
            LengthUnit::In => "in",
            LengthUnit::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "mi" => LengthUnit::Mi,
            "kft" => LengthUnit::Kft,
            "km" => LengthUnit::Km,
            "m" => LengthUnit::M,
            "ft" => LengthUnit::Ft,
            "in" => LengthUnit::In,
            "none" => LengthUnit::None,
            _ => return None,
        })
    }
}

fn default_source_name() -> String {
    "source".to_string()
}

fn one() -> f64 {
    1.0
}

fn three() -> usize {
    3
}

fn default_pf() -> f64 {
    0.95
}

fn default_interval() -> f64 {
    1.0
}

fn default_taps() -> Vec<f64> {
    vec![1.0, 1.0]
}

fn default_winding() -> usize {
    2
}

fn default_vreg() -> f64 {
    120.0
}

fn default_band() -> f64 {
    2.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceDef {
    #[serde(default = "default_source_name")]
    pub name: String,
    pub bus: String,
    pub base_kv: f64,
    #[serde(default = "one")]
    pub pu: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadShapeDef {
    pub name: String,
    #[serde(default = "default_interval")]
    pub interval_hours: f64,
    pub mult: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LineDef {
    pub name: String,
    pub bus1: String,
    pub bus2: String,
    #[serde(default = "three")]
    pub phases: usize,
    #[serde(default)]
    pub length: f64,
    #[serde(default)]
    pub units: LengthUnit,
    /// Positive-sequence resistance, ohms per length unit.
    #[serde(default)]
    pub r1: f64,
    /// Positive-sequence reactance, ohms per length unit.
    #[serde(default)]
    pub x1: f64,
    #[serde(default = "default_normamps")]
    pub normamps: f64,
    #[serde(default = "default_emergamps")]
    pub emergamps: f64,
    #[serde(default)]
    pub switch: bool,
    #[serde(default)]
    pub open: bool,
    #[serde(default)]
    pub underground: bool,
}

fn default_normamps() -> f64 {
    400.0
}

fn default_emergamps() -> f64 {
    600.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReactorDef {
    pub name: String,
    pub bus1: String,
    pub bus2: String,
    #[serde(default = "three")]
    pub phases: usize,
    #[serde(default)]
    pub r: f64,
    #[serde(default)]
    pub x: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformerDef {
    pub name: String,
    pub buses: Vec<String>,
    pub kvs: Vec<f64>,
    pub kvas: Vec<f64>,
    #[serde(default = "three")]
    pub phases: usize,
    /// Leakage reactance in percent on the winding-1 base.
    #[serde(default = "default_xhl")]
    pub xhl: f64,
    /// Total winding resistance in percent.
    #[serde(default = "default_pct_r")]
    pub pct_r: f64,
    #[serde(default = "default_taps")]
    pub taps: Vec<f64>,
    #[serde(default)]
    pub emerghkva: Option<f64>,
}

fn default_xhl() -> f64 {
    2.0
}

fn default_pct_r() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegulatorDef {
    pub name: String,
    pub transformer: String,
    #[serde(default = "default_winding")]
    pub winding: usize,
    #[serde(default = "default_vreg")]
    pub vreg: f64,
    #[serde(default = "default_band")]
    pub band: f64,
    #[serde(default)]
    pub ptratio: Option<f64>,
    #[serde(default)]
    pub revvreg: Option<f64>,
}

/// Protective devices that turn their monitored line into a switching edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionClass {
    Fuse,
    Recloser,
    SwtControl,
}

impl ProtectionClass {
    pub fn element_class(self) -> ElementClass {
        match self {
            ProtectionClass::Fuse => ElementClass::Fuse,
            ProtectionClass::Recloser => ElementClass::Recloser,
            ProtectionClass::SwtControl => ElementClass::SwtControl,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtectionDef {
    pub name: String,
    pub class: ProtectionClass,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadDef {
    pub name: String,
    pub bus: String,
    pub kw: f64,
    #[serde(default = "default_pf")]
    pub pf: f64,
    #[serde(default = "three")]
    pub phases: usize,
    #[serde(default)]
    pub residential: bool,
    #[serde(default)]
    pub shape: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PvDef {
    pub name: String,
    pub bus: String,
    pub kw: f64,
    pub kva: f64,
    #[serde(default = "one")]
    pub pf: f64,
    #[serde(default = "three")]
    pub phases: usize,
    #[serde(default)]
    pub shape: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageDef {
    pub name: String,
    pub bus: String,
    pub kw: f64,
    pub kva: f64,
    pub kwh: f64,
    #[serde(default = "three")]
    pub phases: usize,
    #[serde(default)]
    pub shape: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorDef {
    pub name: String,
    pub bus: String,
    pub kw: f64,
    pub kva: f64,
    #[serde(default = "one")]
    pub pf: f64,
    #[serde(default = "three")]
    pub phases: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapacitorDef {
    pub name: String,
    pub bus: String,
    pub kvar: f64,
    #[serde(default = "three")]
    pub phases: usize,
}

/// Optional bus metadata: coordinates and an explicit voltage base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BusDef {
    pub name: String,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub kv: Option<f64>,
}

/// A complete feeder circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Circuit {
    pub name: String,
    pub source: SourceDef,
    #[serde(default)]
    pub loadshapes: Vec<LoadShapeDef>,
    #[serde(default)]
    pub lines: Vec<LineDef>,
    #[serde(default)]
    pub reactors: Vec<ReactorDef>,
    #[serde(default)]
    pub transformers: Vec<TransformerDef>,
    #[serde(default)]
    pub regulators: Vec<RegulatorDef>,
    #[serde(default)]
    pub protection: Vec<ProtectionDef>,
    #[serde(default)]
    pub loads: Vec<LoadDef>,
    #[serde(default)]
    pub pvsystems: Vec<PvDef>,
    #[serde(default)]
    pub storage: Vec<StorageDef>,
    #[serde(default)]
    pub generators: Vec<GeneratorDef>,
    #[serde(default)]
    pub capacitors: Vec<CapacitorDef>,
    #[serde(default)]
    pub buses: Vec<BusDef>,
}

impl Circuit {
    /// Parses a circuit from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            HcaError::Circuit(format!("cannot read \"{}\": {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a circuit from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let circuit: Circuit = toml::from_str(s)?;
        circuit.check()?;
        Ok(circuit)
    }

    /// Structural checks the TOML schema cannot express.
    pub fn check(&self) -> Result<()> {
        for t in &self.transformers {
            let n = t.buses.len();
            if n < 2 || t.kvs.len() != n || t.kvas.len() != n || t.taps.len() != n {
                return Err(HcaError::Circuit(format!(
                    "transformer `{}`: buses, kvs, kvas and taps must have one entry per winding (>= 2)",
                    t.name
                )));
            }
        }
        for p in &self.protection {
            if !self.lines.iter().any(|l| l.name == p.line) {
                return Err(HcaError::Circuit(format!(
                    "{} `{}` monitors unknown line `{}`",
                    p.class.element_class(),
                    p.name,
                    p.line
                )));
            }
        }
        for r in &self.regulators {
            if !self.transformers.iter().any(|t| t.name == r.transformer) {
                return Err(HcaError::Circuit(format!(
                    "regcontrol `{}` references unknown transformer `{}`",
                    r.name, r.transformer
                )));
            }
        }
        Ok(())
    }

    /// Renders the circuit as the ordered command list a solver session
    /// executes on compile.
    pub fn to_commands(&self) -> Vec<Command> {
        let mut cmds = Vec::new();
        let s = &self.source;
        cmds.push(Command::new_element(
            ElementRef::new(ElementClass::Vsource, &s.name),
            Props::new()
                .with("bus1", s.bus.as_str())
                .with("basekv", s.base_kv)
                .with("pu", s.pu),
        ));
        for shape in &self.loadshapes {
            cmds.push(Command::new_element(
                ElementRef::new(ElementClass::LoadShape, &shape.name),
                Props::new()
                    .with("interval", shape.interval_hours)
                    .with("mult", shape.mult.clone()),
            ));
        }
        for l in &self.lines {
            cmds.push(Command::new_element(
                ElementRef::new(ElementClass::Line, &l.name),
                Props::new()
                    .with("bus1", l.bus1.as_str())
                    .with("bus2", l.bus2.as_str())
                    .with("phases", l.phases as f64)
                    .with("length", l.length)
                    .with("units", l.units.as_str())
                    .with("r1", l.r1)
                    .with("x1", l.x1)
                    .with("normamps", l.normamps)
                    .with("emergamps", l.emergamps)
                    .with("switch", l.switch),
            ));
        }
        for r in &self.reactors {
            cmds.push(Command::new_element(
                ElementRef::new(ElementClass::Reactor, &r.name),
                Props::new()
                    .with("bus1", r.bus1.as_str())
                    .with("bus2", r.bus2.as_str())
                    .with("phases", r.phases as f64)
                    .with("r", r.r)
                    .with("x", r.x),
            ));
        }
        for t in &self.transformers {
            let mut props = Props::new()
                .with("buses", t.buses.clone())
                .with("kvs", t.kvs.clone())
                .with("kvas", t.kvas.clone())
                .with("taps", t.taps.clone())
                .with("phases", t.phases as f64)
                .with("xhl", t.xhl)
                .with("%r", t.pct_r);
            if let Some(e) = t.emerghkva {
                props.set("emerghkva", e);
            }
            cmds.push(Command::new_element(
                ElementRef::new(ElementClass::Transformer, &t.name),
                props,
            ));
        }
        for r in &self.regulators {
            let mut props = Props::new()
                .with("transformer", r.transformer.as_str())
                .with("winding", r.winding as f64)
                .with("vreg", r.vreg)
                .with("band", r.band);
            if let Some(pt) = r.ptratio {
                props.set("ptratio", pt);
            }
            if let Some(rev) = r.revvreg {
                props.set("revvreg", rev);
            }
            cmds.push(Command::new_element(
                ElementRef::new(ElementClass::RegControl, &r.name),
                props,
            ));
        }
        for p in &self.protection {
            cmds.push(Command::new_element(
                ElementRef::new(p.class.element_class(), &p.name),
                Props::new().with("monitoredobj", format!("line.{}", p.line)),
            ));
        }
        for l in &self.loads {
            let mut props = Props::new()
                .with("bus1", l.bus.as_str())
                .with("kw", l.kw)
                .with("pf", l.pf)
                .with("phases", l.phases as f64);
            if let Some(shape) = &l.shape {
                props.set("daily", shape.as_str());
            }
            cmds.push(Command::new_element(
                ElementRef::new(ElementClass::Load, &l.name),
                props,
            ));
        }
        for pv in &self.pvsystems {
            let mut props = Props::new()
                .with("bus1", pv.bus.as_str())
                .with("pmpp", pv.kw)
                .with("kva", pv.kva)
                .with("pf", pv.pf)
                .with("phases", pv.phases as f64);
            if let Some(shape) = &pv.shape {
                props.set("daily", shape.as_str());
            }
            cmds.push(Command::new_element(
                ElementRef::new(ElementClass::PvSystem, &pv.name),
                props,
            ));
        }
        for st in &self.storage {
            let mut props = Props::new()
                .with("bus1", st.bus.as_str())
                .with("kwrated", st.kw)
                .with("kva", st.kva)
                .with("kwhrated", st.kwh)
                .with("phases", st.phases as f64);
            if let Some(shape) = &st.shape {
                props.set("daily", shape.as_str());
            }
            cmds.push(Command::new_element(
                ElementRef::new(ElementClass::Storage, &st.name),
                props,
            ));
        }
        for g in &self.generators {
            cmds.push(Command::new_element(
                ElementRef::new(ElementClass::Generator, &g.name),
                Props::new()
                    .with("bus1", g.bus.as_str())
                    .with("kw", g.kw)
                    .with("kva", g.kva)
                    .with("pf", g.pf)
                    .with("phases", g.phases as f64),
            ));
        }
        for c in &self.capacitors {
            cmds.push(Command::new_element(
                ElementRef::new(ElementClass::Capacitor, &c.name),
                Props::new()
                    .with("bus1", c.bus.as_str())
                    .with("kvar", c.kvar)
                    .with("phases", c.phases as f64),
            ));
        }
        for l in self.lines.iter().filter(|l| l.switch && l.open) {
            cmds.push(Command::Open {
                element: ElementRef::new(ElementClass::Line, &l.name),
            });
        }
        cmds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name = "mini"

[source]
bus = "src"
base_kv = 12.47

[[lines]]
name = "l1"
bus1 = "src"
bus2 = "b1"
length = 1.0
units = "mi"
r1 = 0.3
x1 = 0.6

[[loads]]
name = "ld1"
bus = "b1"
kw = 100.0
"#;

    #[test]
    fn parses_minimal_circuit_with_defaults() {
        let c = Circuit::from_toml_str(MINIMAL).expect("valid circuit");
        assert_eq!(c.source.name, "source");
        assert_eq!(c.lines[0].units, LengthUnit::Mi);
        assert_eq!(c.lines[0].normamps, 400.0);
        assert_eq!(c.loads[0].pf, 0.95);
    }

    #[test]
    fn commands_start_with_source() {
        let c = Circuit::from_toml_str(MINIMAL).expect("valid circuit");
        let cmds = c.to_commands();
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0].element().class, ElementClass::Vsource);
        assert!(cmds[1].to_string().starts_with("new line.l1 "));
    }

    #[test]
    fn rejects_unknown_fields() {
        let bad = format!("{MINIMAL}\nbogus = 1\n");
        assert!(Circuit::from_toml_str(&bad).is_err());
    }

    #[test]
    fn rejects_protection_on_unknown_line() {
        let bad = format!(
            "{MINIMAL}\n[[protection]]\nname = \"r1\"\nclass = \"recloser\"\nline = \"nope\"\n"
        );
        assert!(matches!(
            Circuit::from_toml_str(&bad),
            Err(HcaError::Circuit(_))
        ));
    }

    #[test]
    fn length_units_convert_to_miles() {
        assert!((LengthUnit::Kft.to_miles(5.28) - 1.0).abs() < 1e-12);
        assert!((LengthUnit::Ft.to_feet(10.0) - 10.0).abs() < 1e-12);
    }
}
