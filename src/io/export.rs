//! CSV export of hosting-capacity results.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::error::Result;
use crate::hca::PerStepData;

/// Column header of the headroom export.
const HC_HEADER: &str = "resource,bus,cnt,sij_kw,sij_kva,hc_kw,hc_kva,violations";

/// Column header of the upgrade export.
const UPGRADE_HEADER: &str = "element,cnt,action,old,new,cost,length,units";

fn join(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format!("{v:.4}"))
        .collect::<Vec<_>>()
        .join(";")
}

/// Writes one row per recorded headroom entry, ordered by resource, bus,
/// then step. `sij` is the capacity installed at that bus as of the step.
///
/// # Errors
///
/// Returns [`HcaError::Csv`](crate::error::HcaError::Csv) if writing fails.
pub fn write_hc_csv(data: &PerStepData, writer: impl Write) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);
    wtr.write_record(HC_HEADER.split(','))?;

    for (key, steps) in &data.hc {
        for (cnt, entry) in steps {
            let sij = data
                .sij_at_or_before(key, *cnt)
                .map(|(_, r)| r)
                .unwrap_or_default();
            wtr.write_record(&[
                key.resource.to_string(),
                key.bus.clone(),
                cnt.to_string(),
                format!("{:.4}", sij.kw),
                format!("{:.4}", sij.kva),
                format!("{:.4}", entry.hc.kw),
                format!("{:.4}", entry.hc.kva),
                entry.violations.join(";"),
            ])?;
        }
    }

    wtr.flush()?;
    Ok(())
}

/// Writes the headroom export to `path`.
pub fn export_hc_csv(data: &PerStepData, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    write_hc_csv(data, io::BufWriter::new(file))
}

/// Writes one row per recorded upgrade, in element then step order.
pub fn write_upgrades_csv(data: &PerStepData, writer: impl Write) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new().from_writer(writer);
    wtr.write_record(UPGRADE_HEADER.split(','))?;
    for (key, record) in &data.upgrades {
        let action = serde_json::to_value(record.action)?;
        wtr.write_record(&[
            key.element.to_string(),
            key.cnt.to_string(),
            action.as_str().unwrap_or_default().to_string(),
            join(&record.old),
            join(&record.new),
            format!("{:.2}", record.cost),
            record.length.map(|l| format!("{l:.4}")).unwrap_or_default(),
            record.units.map(|u| u.as_str().to_string()).unwrap_or_default(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
