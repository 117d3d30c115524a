use crate::core::change_detection::{ChangeClass, ClassCounts};
use crate::core::reproject::{default_grid, warp, ResamplingMethod};
use crate::types::{CoordinateSystem, Crs, Raster, VerdeError, VerdeResult};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Output unit for areas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AreaUnit {
    SquareMetres,
    Hectares,
    SquareKilometres,
}

impl AreaUnit {
    /// Square metres per unit
    pub fn square_metres(self) -> f64 {
        match self {
            AreaUnit::SquareMetres => 1.0,
            AreaUnit::Hectares => 10_000.0,
            AreaUnit::SquareKilometres => 1_000_000.0,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            AreaUnit::SquareMetres => "m2",
            AreaUnit::Hectares => "ha",
            AreaUnit::SquareKilometres => "km2",
        }
    }
}

impl Default for AreaUnit {
    fn default() -> Self {
        AreaUnit::Hectares
    }
}

impl std::fmt::Display for AreaUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

impl std::str::FromStr for AreaUnit {
    type Err = VerdeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "m2" | "sqm" | "square_metres" | "square_meters" => Ok(AreaUnit::SquareMetres),
            "ha" | "hectares" => Ok(AreaUnit::Hectares),
            "km2" | "sqkm" | "square_kilometres" | "square_kilometers" => Ok(AreaUnit::SquareKilometres),
            _ => Err(VerdeError::InvalidParameter(format!(
                "Invalid area unit: {}. Must be one of: m2, ha, km2",
                s
            ))),
        }
    }
}

/// Area of one change category
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CategoryArea {
    pub class: ChangeClass,
    pub pixel_count: usize,
    pub area: f64,
}

/// One row of the tabular area summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaRecord {
    pub category: String,
    pub pixel_count: usize,
    pub area: f64,
    pub unit: String,
    pub percent_of_valid: f64,
    pub crs: String,
    pub pixel_area_m2: f64,
}

/// Per-category areas of a change mask under a metric CRS.
///
/// Built once by [`aggregate_area`] and read-only afterwards. The total is
/// the ordered sum of the category areas, so the breakdown always adds up.
#[derive(Debug, Clone, Serialize)]
pub struct AreaSummary {
    categories: Vec<CategoryArea>,
    total_area: f64,
    valid_pixels: usize,
    invalid_pixels: usize,
    unit: AreaUnit,
    crs: String,
    pixel_area_m2: f64,
}

impl AreaSummary {
    fn from_counts(counts: &ClassCounts, pixel_area_m2: f64, unit: AreaUnit, crs: &Crs) -> Self {
        let pixel_area = pixel_area_m2 / unit.square_metres();
        let categories: Vec<CategoryArea> = ChangeClass::VALID
            .iter()
            .map(|&class| {
                let pixel_count = counts.get(class);
                CategoryArea {
                    class,
                    pixel_count,
                    area: pixel_count as f64 * pixel_area,
                }
            })
            .collect();
        let total_area = categories.iter().map(|c| c.area).sum();

        Self {
            categories,
            total_area,
            valid_pixels: counts.valid(),
            invalid_pixels: counts.invalid,
            unit,
            crs: crs.definition().to_string(),
            pixel_area_m2,
        }
    }

    /// Categories in report order (no_change, gain, loss)
    pub fn categories(&self) -> &[CategoryArea] {
        &self.categories
    }

    pub fn area(&self, class: ChangeClass) -> f64 {
        self.categories
            .iter()
            .find(|c| c.class == class)
            .map_or(0.0, |c| c.area)
    }

    pub fn pixel_count(&self, class: ChangeClass) -> usize {
        self.categories
            .iter()
            .find(|c| c.class == class)
            .map_or(0, |c| c.pixel_count)
    }

    /// Share of the valid area in `class`, in percent (0 when nothing is valid)
    pub fn percent_of_valid(&self, class: ChangeClass) -> f64 {
        if self.total_area > 0.0 {
            self.area(class) / self.total_area * 100.0
        } else {
            0.0
        }
    }

    pub fn total_area(&self) -> f64 {
        self.total_area
    }

    pub fn valid_pixels(&self) -> usize {
        self.valid_pixels
    }

    pub fn invalid_pixels(&self) -> usize {
        self.invalid_pixels
    }

    pub fn unit(&self) -> AreaUnit {
        self.unit
    }

    /// Definition of the metric CRS the areas were measured in
    pub fn crs(&self) -> &str {
        &self.crs
    }

    pub fn pixel_area_m2(&self) -> f64 {
        self.pixel_area_m2
    }

    /// One record per category followed by a `total` record
    pub fn to_records(&self) -> Vec<AreaRecord> {
        let mut records: Vec<AreaRecord> = self
            .categories
            .iter()
            .map(|c| AreaRecord {
                category: c.class.label().to_string(),
                pixel_count: c.pixel_count,
                area: c.area,
                unit: self.unit.symbol().to_string(),
                percent_of_valid: self.percent_of_valid(c.class),
                crs: self.crs.clone(),
                pixel_area_m2: self.pixel_area_m2,
            })
            .collect();

        records.push(AreaRecord {
            category: "total".to_string(),
            pixel_count: self.valid_pixels,
            area: self.total_area,
            unit: self.unit.symbol().to_string(),
            percent_of_valid: if self.valid_pixels > 0 { 100.0 } else { 0.0 },
            crs: self.crs.clone(),
            pixel_area_m2: self.pixel_area_m2,
        });
        records
    }
}

/// Metres per linear unit of a projected CRS; anything else is `InvalidCrs`
pub fn linear_unit_metres(crs: &Crs) -> VerdeResult<f64> {
    match crs.coordinate_system()? {
        CoordinateSystem::Projected { metres_per_unit } if metres_per_unit.is_finite() && metres_per_unit > 0.0 => {
            Ok(metres_per_unit)
        }
        CoordinateSystem::Projected { metres_per_unit } => Err(VerdeError::InvalidCrs(format!(
            "{} reports an unusable linear unit ({} m)",
            crs, metres_per_unit
        ))),
        CoordinateSystem::Geographic => Err(VerdeError::InvalidCrs(format!(
            "{} is geographic; area from pixel counts needs a projected CRS with linear units",
            crs
        ))),
        CoordinateSystem::Other => Err(VerdeError::InvalidCrs(format!("{} is not a projected CRS", crs))),
    }
}

/// Area per change category of `mask`, measured in `target_crs`.
///
/// The mask is reprojected (nearest neighbour) when it is not already in
/// the target CRS. Geographic and non-projected targets fail with
/// `InvalidCrs`.
pub fn aggregate_area(mask: &Raster<u8>, target_crs: &Crs, unit: AreaUnit) -> VerdeResult<AreaSummary> {
    let metres_per_unit = linear_unit_metres(target_crs)?;

    let measured: Cow<Raster<u8>> = if mask.crs().is_same(target_crs)? {
        Cow::Borrowed(mask)
    } else {
        log::info!("Reprojecting change mask from {} to {} for area measurement", mask.crs(), target_crs);
        let grid = default_grid(mask, target_crs)?;
        Cow::Owned(warp(mask, &grid, ResamplingMethod::Nearest)?)
    };

    let counts = ClassCounts::from_codes(measured.data().iter());
    let pixel_area_m2 = measured.geo_transform().cell_area() * metres_per_unit * metres_per_unit;
    log::debug!("Pixel area in {}: {:.4} m2", target_crs, pixel_area_m2);

    let summary = AreaSummary::from_counts(&counts, pixel_area_m2, unit, target_crs);

    log::info!(
        "Area aggregation completed: total {:.4} {} over {} valid pixels",
        summary.total_area(),
        unit,
        summary.valid_pixels()
    );
    for category in summary.categories() {
        log::info!(
            "  {}: {:.4} {} ({:.2}%)",
            category.class,
            category.area,
            unit,
            summary.percent_of_valid(category.class)
        );
    }

    Ok(summary)
}
