//! Tabular area summary output

use crate::core::area::{AreaRecord, AreaSummary};
use crate::types::{VerdeError, VerdeResult};
use csv::{Reader, Writer};
use std::fmt::Write as _;
use std::path::Path;

/// Write the area summary as CSV, one row per category plus `total`
pub fn write_area_summary<P: AsRef<Path>>(summary: &AreaSummary, path: P) -> VerdeResult<()> {
    let path = path.as_ref();
    log::info!("Writing area summary: {}", path.display());

    let mut wtr = Writer::from_path(path).map_err(|e| VerdeError::write(path, e.to_string()))?;
    for record in summary.to_records() {
        wtr.serialize(record)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Read back a summary written by [`write_area_summary`]
pub fn read_area_summary<P: AsRef<Path>>(path: P) -> VerdeResult<Vec<AreaRecord>> {
    let path = path.as_ref();
    let mut rdr = Reader::from_path(path).map_err(|e| VerdeError::read(path, e.to_string()))?;
    let mut records = Vec::new();
    for record in rdr.deserialize() {
        records.push(record?);
    }
    Ok(records)
}

/// Fixed-width table for terminal output
pub fn format_area_table(summary: &AreaSummary) -> String {
    let mut out = String::new();
    let unit = summary.unit().symbol();

    let _ = writeln!(out, "Area summary ({}, pixel area {:.2} m2)", summary.crs(), summary.pixel_area_m2());
    let _ = writeln!(out, "{:<10} {:>12} {:>16} {:>9}", "category", "pixels", format!("area ({})", unit), "percent");
    for record in summary.to_records() {
        let _ = writeln!(
            out,
            "{:<10} {:>12} {:>16.4} {:>8.2}%",
            record.category, record.pixel_count, record.area, record.percent_of_valid
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::area::{aggregate_area, AreaUnit};
    use crate::types::{Crs, GeoTransform, Raster};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn summary() -> AreaSummary {
        let gt = GeoTransform::north_up(500_000.0, 4_600_000.0, 100.0, 100.0);
        let crs = Crs::from_epsg(32618).unwrap();
        let mask = Raster::new(array![[0u8, 1], [2, 255]], gt, crs.clone(), Some(255.0)).unwrap();
        aggregate_area(&mask, &crs, AreaUnit::Hectares).unwrap()
    }

    #[test]
    fn test_csv_columns_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        write_area_summary(&summary(), &path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(header, "category,pixel_count,area,unit,percent_of_valid,crs,pixel_area_m2");

        let records = read_area_summary(&path).unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[3].category, "total");
        assert_eq!(records[3].pixel_count, 3);
        assert_abs_diff_eq!(records[3].area, 3.0, epsilon = 1e-9);
        assert_eq!(records[1].crs, "EPSG:32618");
    }

    #[test]
    fn test_table_lists_every_category() {
        let table = format_area_table(&summary());
        for category in ["no_change", "gain", "loss", "total"] {
            assert!(table.contains(category), "missing {} in\n{}", category, table);
        }
        assert!(table.contains("area (ha)"));
    }
}
