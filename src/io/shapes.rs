//! Prerecorded regulator tap schedules.
//!
//! A schedule is a CSV indexed by `(hour, second)` with one row per change:
//!
//! ```text
//! hour,second,wdg,tap_pu
//! 0,0,2,1.0
//! 6,0,2,1.0125
//! ```
//!
//! The tap in force at time `t` is the one of the last row at or before
//! `t`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::reports::{read_table, read_table_path};
use crate::error::{HcaError, Result};
use crate::simulator::SolverTime;

/// One row of a tap schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TapPoint {
    pub hour: u32,
    pub second: f64,
    /// Winding the tap applies to, 1-based.
    pub wdg: usize,
    pub tap_pu: f64,
}

impl TapPoint {
    pub fn time(&self) -> SolverTime {
        SolverTime::new(self.hour, self.second)
    }
}

/// A tap schedule bound to the transformer its regulator controls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegulatorShape {
    pub regulator: String,
    pub transformer: String,
    points: Vec<TapPoint>,
}

impl RegulatorShape {
    /// Builds a shape, sorting points by time.
    ///
    /// # Errors
    ///
    /// Returns [`HcaError::Circuit`] for an empty schedule or a winding
    /// number of zero.
    pub fn new(
        regulator: impl Into<String>,
        transformer: impl Into<String>,
        mut points: Vec<TapPoint>,
    ) -> Result<Self> {
        let regulator = regulator.into();
        if points.is_empty() {
            return Err(HcaError::Circuit(format!(
                "tap schedule for `{regulator}` has no rows"
            )));
        }
        if points.iter().any(|p| p.wdg == 0) {
            return Err(HcaError::Circuit(format!(
                "tap schedule for `{regulator}` names winding 0"
            )));
        }
        points.sort_by(|a, b| a.time().total_seconds().total_cmp(&b.time().total_seconds()));
        Ok(Self {
            regulator,
            transformer: transformer.into(),
            points,
        })
    }

    /// Reads the schedule at `path`.
    pub fn from_csv_path(
        regulator: impl Into<String>,
        transformer: impl Into<String>,
        path: &Path,
    ) -> Result<Self> {
        Self::new(regulator, transformer, read_table_path(path)?)
    }

    /// Parses a schedule from CSV text.
    pub fn from_csv_str(
        regulator: impl Into<String>,
        transformer: impl Into<String>,
        text: &str,
    ) -> Result<Self> {
        Self::new(regulator, transformer, read_table(text.as_bytes())?)
    }

    pub fn points(&self) -> &[TapPoint] {
        &self.points
    }

    /// The row in force at `t`, or `None` before the first row.
    pub fn tap_at(&self, t: SolverTime) -> Option<&TapPoint> {
        let secs = t.total_seconds();
        self.points
            .iter()
            .take_while(|p| p.time().total_seconds() <= secs + 1e-9)
            .last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEDULE: &str = "hour,second,wdg,tap_pu\n6,0,2,1.0125\n0,0,2,1.0\n12,1800,2,0.99375\n";

    #[test]
    fn lookup_takes_last_row_at_or_before() {
        let shape = RegulatorShape::from_csv_str("reg1", "t_reg", SCHEDULE).expect("parses");
        assert_eq!(shape.points()[0].hour, 0);
        assert_eq!(shape.tap_at(SolverTime::new(0, 0.0)).map(|p| p.tap_pu), Some(1.0));
        assert_eq!(shape.tap_at(SolverTime::new(6, 0.0)).map(|p| p.tap_pu), Some(1.0125));
        assert_eq!(shape.tap_at(SolverTime::new(12, 0.0)).map(|p| p.tap_pu), Some(1.0125));
        assert_eq!(
            shape.tap_at(SolverTime::new(13, 0.0)).map(|p| p.tap_pu),
            Some(0.99375)
        );
    }

    #[test]
    fn empty_or_bad_winding_is_rejected() {
        assert!(RegulatorShape::from_csv_str("r", "t", "hour,second,wdg,tap_pu\n").is_err());
        assert!(RegulatorShape::from_csv_str("r", "t", "hour,second,wdg,tap_pu\n0,0,0,1.0\n").is_err());
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reg1.csv");
        std::fs::write(&path, SCHEDULE).expect("writes");
        let shape = RegulatorShape::from_csv_path("reg1", "t_reg", &path).expect("reads");
        assert_eq!(shape.points().len(), 3);
    }
}
