//! Typed solver edit commands.
//!
//! Every change the engine makes to a solver session is one of these
//! commands. They render to the solver's text form through `Display`, are
//! serialisable for snapshots, and are the unit the ledger records.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Solver-side element classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementClass {
    Vsource,
    Line,
    Transformer,
    Reactor,
    RegControl,
    Load,
    PvSystem,
    Storage,
    Generator,
    Capacitor,
    Monitor,
    LoadShape,
    Fuse,
    Recloser,
    SwtControl,
}

impl ElementClass {
    /// All classes in solver declaration order.
    pub const ALL: [ElementClass; 15] = [
        ElementClass::Vsource,
        ElementClass::LoadShape,
        ElementClass::Line,
        ElementClass::Reactor,
        ElementClass::Transformer,
        ElementClass::RegControl,
        ElementClass::Fuse,
        ElementClass::Recloser,
        ElementClass::SwtControl,
        ElementClass::Load,
        ElementClass::PvSystem,
        ElementClass::Storage,
        ElementClass::Generator,
        ElementClass::Capacitor,
        ElementClass::Monitor,
    ];

    /// The class name as the solver spells it.
    pub fn solver_name(self) -> &'static str {
        match self {
            ElementClass::Vsource => "vsource",
            ElementClass::Line => "line",
            ElementClass::Transformer => "transformer",
            ElementClass::Reactor => "reactor",
            ElementClass::RegControl => "regcontrol",
            ElementClass::Load => "load",
            ElementClass::PvSystem => "pvsystem",
            ElementClass::Storage => "storage",
            ElementClass::Generator => "generator",
            ElementClass::Capacitor => "capacitor",
            ElementClass::Monitor => "monitor",
            ElementClass::LoadShape => "loadshape",
            ElementClass::Fuse => "fuse",
            ElementClass::Recloser => "recloser",
            ElementClass::SwtControl => "swtcontrol",
        }
    }
}

impl fmt::Display for ElementClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.solver_name())
    }
}

impl FromStr for ElementClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        ElementClass::ALL
            .into_iter()
            .find(|c| c.solver_name() == lower)
            .ok_or_else(|| format!("unknown element class `{s}`"))
    }
}

/// A fully qualified element name, `class.name`.
///
/// Serialises as its `class.name` string so it can key JSON maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ElementRef {
    pub class: ElementClass,
    pub name: String,
}

impl ElementRef {
    pub fn new(class: ElementClass, name: impl Into<String>) -> Self {
        Self {
            class,
            name: name.into(),
        }
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.class, self.name)
    }
}

impl FromStr for ElementRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (class, name) = s
            .split_once('.')
            .ok_or_else(|| format!("expected `class.name`, got `{s}`"))?;
        Ok(Self::new(class.parse()?, name))
    }
}

impl TryFrom<String> for ElementRef {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ElementRef> for String {
    fn from(r: ElementRef) -> Self {
        r.to_string()
    }
}

/// A single property value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropValue {
    Num(f64),
    Bool(bool),
    Text(String),
    List(Vec<f64>),
    Names(Vec<String>),
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropValue::Num(v) => write!(f, "{v}"),
            PropValue::Bool(b) => f.write_str(if *b { "yes" } else { "no" }),
            PropValue::Text(s) => f.write_str(s),
            PropValue::List(vs) => {
                let items: Vec<String> = vs.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", items.join(" "))
            }
            PropValue::Names(ns) => write!(f, "[{}]", ns.join(" ")),
        }
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        PropValue::Num(v)
    }
}

impl From<bool> for PropValue {
    fn from(v: bool) -> Self {
        PropValue::Bool(v)
    }
}

impl From<&str> for PropValue {
    fn from(v: &str) -> Self {
        PropValue::Text(v.to_string())
    }
}

impl From<String> for PropValue {
    fn from(v: String) -> Self {
        PropValue::Text(v)
    }
}

impl From<Vec<f64>> for PropValue {
    fn from(v: Vec<f64>) -> Self {
        PropValue::List(v)
    }
}

impl From<Vec<String>> for PropValue {
    fn from(v: Vec<String>) -> Self {
        PropValue::Names(v)
    }
}

/// Ordered element properties. Keys are lowercase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Props(BTreeMap<String, PropValue>);

impl Props {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<PropValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<PropValue>) {
        self.0.insert(key.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&PropValue> {
        self.0.get(key)
    }

    /// Numeric value; booleans read as 1/0.
    pub fn num(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            PropValue::Num(v) => Some(*v),
            PropValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            PropValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        match self.0.get(key)? {
            PropValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            PropValue::Bool(b) => Some(*b),
            PropValue::Num(v) => Some(*v != 0.0),
            PropValue::Text(s) => match s.as_str() {
                "yes" | "true" | "y" => Some(true),
                "no" | "false" | "n" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn list(&self, key: &str) -> Option<&[f64]> {
        match self.0.get(key)? {
            PropValue::List(vs) => Some(vs.as_slice()),
            _ => None,
        }
    }

    pub fn names(&self, key: &str) -> Option<&[String]> {
        match self.0.get(key)? {
            PropValue::Names(ns) => Some(ns.as_slice()),
            _ => None,
        }
    }

    /// Overlays `other` on top of `self`.
    pub fn merge(&mut self, other: &Props) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropValue)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One solver edit command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Command {
    /// Declares a new element.
    New { element: ElementRef, props: Props },
    /// Changes properties of an existing element.
    Edit { element: ElementRef, props: Props },
    Enable { element: ElementRef },
    Disable { element: ElementRef },
    /// Opens a switching branch.
    Open { element: ElementRef },
    /// Closes a switching branch.
    Close { element: ElementRef },
}

impl Command {
    pub fn new_element(element: ElementRef, props: Props) -> Self {
        Command::New { element, props }
    }

    pub fn edit(element: ElementRef, props: Props) -> Self {
        Command::Edit { element, props }
    }

    pub fn disable(element: ElementRef) -> Self {
        Command::Disable { element }
    }

    pub fn enable(element: ElementRef) -> Self {
        Command::Enable { element }
    }

    /// The element this command targets.
    pub fn element(&self) -> &ElementRef {
        match self {
            Command::New { element, .. }
            | Command::Edit { element, .. }
            | Command::Enable { element }
            | Command::Disable { element }
            | Command::Open { element }
            | Command::Close { element } => element,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (verb, element, props) = match self {
            Command::New { element, props } => ("new", element, Some(props)),
            Command::Edit { element, props } => ("edit", element, Some(props)),
            Command::Enable { element } => ("enable", element, None),
            Command::Disable { element } => ("disable", element, None),
            Command::Open { element } => ("open", element, None),
            Command::Close { element } => ("close", element, None),
        };
        write!(f, "{verb} {element}")?;
        if let Some(props) = props {
            for (k, v) in props.iter() {
                write!(f, " {k}={v}")?;
            }
        }
        Ok(())
    }
}
