//! Solver report tables: voltage exceptions, overloads, and interval totals.
//!
//! The column names follow the solver's own CSV reports so that tables
//! produced by an external simulator can be read back unchanged.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::simulator::SolveResult;

pub const VOLTAGE_EXCEPTIONS_FILE: &str = "voltage_exceptions.csv";
pub const OVERLOADS_FILE: &str = "overloads.csv";
pub const TOTALS_FILE: &str = "totals.csv";

/// Extreme voltages seen during one reporting interval, indexed by `Hour`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltageException {
    #[serde(rename = "Hour")]
    pub hour: f64,
    #[serde(rename = "Min Voltage")]
    pub min_voltage: f64,
    #[serde(rename = "Max Voltage")]
    pub max_voltage: f64,
    /// Extremes over low-voltage (secondary) buses; zero when there are none.
    #[serde(rename = "MinLV Voltage")]
    pub min_lv_voltage: f64,
    #[serde(rename = "MaxLV Voltage")]
    pub max_lv_voltage: f64,
}

/// Peak loading of one power-delivery element that exceeded its normal rating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverloadRecord {
    #[serde(rename = "Element")]
    pub element: String,
    #[serde(rename = "Current")]
    pub current: f64,
    #[serde(rename = "%Normal")]
    pub pct_normal: f64,
    #[serde(rename = "%Emerg")]
    pub pct_emerg: f64,
    #[serde(rename = "NormAmps")]
    pub norm_amps: f64,
    #[serde(rename = "EmergAmps")]
    pub emerg_amps: f64,
}

/// Energy totals for one solution interval, indexed by `Time` (hours).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalTotals {
    #[serde(rename = "Time")]
    pub time: f64,
    #[serde(rename = "kWh")]
    pub kwh: f64,
    #[serde(rename = "Peak kW")]
    pub peak_kw: f64,
    /// Energy served while any element exceeded its normal rating.
    #[serde(rename = "LoadEEN")]
    pub load_een: f64,
    /// Energy served while any element exceeded its emergency rating.
    #[serde(rename = "LoadUE")]
    pub load_ue: f64,
}

/// Reads a solver CSV table from any reader. Surrounding whitespace in
/// headers and fields is ignored.
pub fn read_table<T: DeserializeOwned>(reader: impl Read) -> Result<Vec<T>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);
    let mut rows = Vec::new();
    for record in rdr.deserialize() {
        rows.push(record?);
    }
    Ok(rows)
}

/// Reads a solver CSV table from a file.
pub fn read_table_path<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)?;
    read_table(io::BufReader::new(file))
}

/// Writes rows as a CSV table with a header line.
pub fn write_table<T: Serialize>(rows: &[T], writer: impl Write) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes rows to a CSV file at `path`.
pub fn write_table_path<T: Serialize>(rows: &[T], path: &Path) -> Result<()> {
    let file = File::create(path)?;
    write_table(rows, io::BufWriter::new(file))
}

/// Writes the three report tables of `result` into `dir`, creating it if
/// needed.
pub fn write_reports(result: &SolveResult, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    write_table_path(&result.voltage_exceptions, &dir.join(VOLTAGE_EXCEPTIONS_FILE))?;
    write_table_path(&result.overloads, &dir.join(OVERLOADS_FILE))?;
    write_table_path(&result.totals, &dir.join(TOTALS_FILE))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_solver_overload_report_with_padding() {
        let raw = "Element, Current, %Normal, %Emerg, NormAmps, EmergAmps\n\
                   \"Line.l1\", 410.5, 102.6, 85.5, 400, 480\n";
        let rows: Vec<OverloadRecord> = read_table(raw.as_bytes()).expect("parses");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].element, "Line.l1");
        assert!((rows[0].pct_normal - 102.6).abs() < 1e-12);
    }

    #[test]
    fn reads_voltage_exceptions_by_hour() {
        let raw = "Hour,Min Voltage,Max Voltage,MinLV Voltage,MaxLV Voltage\n\
                   1,0.97,1.04,0,0\n2,0.96,1.06,0,0\n";
        let rows: Vec<VoltageException> = read_table(raw.as_bytes()).expect("parses");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].max_voltage, 1.06);
    }

    #[test]
    fn written_totals_keep_solver_headers() {
        let rows = vec![IntervalTotals {
            time: 1.0,
            kwh: 12.0,
            peak_kw: 12.0,
            load_een: 0.0,
            load_ue: 0.0,
        }];
        let mut buf = Vec::new();
        write_table(&rows, &mut buf).expect("writes");
        let text = String::from_utf8(buf).expect("utf-8");
        assert_eq!(
            text.lines().next(),
            Some("Time,kWh,Peak kW,LoadEEN,LoadUE")
        );
    }
}
