//! Area-of-interest polygons from GeoJSON

use crate::types::{BoundingBox, Crs, VerdeError, VerdeResult};
use geojson::{GeoJson, Geometry, Value};
use std::path::Path;

/// Closed ring of (x, y) vertices
pub type Ring = Vec<(f64, f64)>;

/// Exterior ring followed by any holes
pub type Polygon = Vec<Ring>;

/// Polygon geometry used to crop rasters before processing.
/// GeoJSON coordinates are WGS84 longitude/latitude (EPSG:4326).
#[derive(Debug, Clone)]
pub struct AreaOfInterest {
    polygons: Vec<Polygon>,
    crs: Crs,
}

impl AreaOfInterest {
    pub fn new(polygons: Vec<Polygon>, crs: Crs) -> VerdeResult<Self> {
        if polygons.is_empty() {
            return Err(VerdeError::InvalidParameter("AOI has no polygons".to_string()));
        }
        for polygon in &polygons {
            match polygon.first() {
                Some(exterior) if exterior.len() >= 3 => {}
                _ => {
                    return Err(VerdeError::InvalidParameter(
                        "AOI polygon exterior ring needs at least three vertices".to_string(),
                    ))
                }
            }
        }
        Ok(Self { polygons, crs })
    }

    pub fn polygons(&self) -> &[Polygon] {
        &self.polygons
    }

    pub fn crs(&self) -> &Crs {
        &self.crs
    }

    pub fn bounds(&self) -> Option<BoundingBox> {
        BoundingBox::from_points(
            self.polygons
                .iter()
                .filter_map(|p| p.first())
                .flat_map(|ring| ring.iter().copied()),
        )
    }

    /// Even-odd containment over every ring of every polygon, so holes
    /// are excluded.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.polygons.iter().any(|polygon| {
            polygon
                .iter()
                .filter(|ring| ring_contains(ring, x, y))
                .count()
                % 2
                == 1
        })
    }

    /// Same AOI with every vertex mapped through `f`
    pub fn map_vertices<F>(&self, crs: Crs, mut f: F) -> VerdeResult<Self>
    where
        F: FnMut(&mut [f64], &mut [f64]),
    {
        let mut polygons = Vec::with_capacity(self.polygons.len());
        for polygon in &self.polygons {
            let mut rings = Vec::with_capacity(polygon.len());
            for ring in polygon {
                let mut xs: Vec<f64> = ring.iter().map(|p| p.0).collect();
                let mut ys: Vec<f64> = ring.iter().map(|p| p.1).collect();
                f(&mut xs, &mut ys);
                if xs.iter().chain(ys.iter()).any(|v| !v.is_finite()) {
                    return Err(VerdeError::InvalidCrs(format!(
                        "AOI vertices cannot be represented in {}",
                        crs
                    )));
                }
                rings.push(xs.into_iter().zip(ys).collect());
            }
            polygons.push(rings);
        }
        Self::new(polygons, crs)
    }
}

fn ring_contains(ring: &[(f64, f64)], x: f64, y: f64) -> bool {
    let mut inside = false;
    let n = ring.len();
    if n < 3 {
        return false;
    }
    let mut j = n - 1;
    for i in 0..n {
        let (xi, yi) = ring[i];
        let (xj, yj) = ring[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}

/// Read polygons from a GeoJSON FeatureCollection, Feature or bare geometry
pub fn read_aoi<P: AsRef<Path>>(path: P) -> VerdeResult<AreaOfInterest> {
    let path = path.as_ref();
    log::info!("Reading AOI from: {}", path.display());

    let text = std::fs::read_to_string(path).map_err(|e| VerdeError::read(path, e.to_string()))?;
    let geojson: GeoJson = text
        .parse()
        .map_err(|e: geojson::Error| VerdeError::read(path, format!("invalid GeoJSON: {}", e)))?;

    let mut polygons = Vec::new();
    match geojson {
        GeoJson::FeatureCollection(collection) => {
            for feature in collection.features {
                let geometry = feature
                    .geometry
                    .ok_or_else(|| VerdeError::read(path, "feature without geometry"))?;
                collect_polygons(&geometry, &mut polygons).map_err(|reason| VerdeError::read(path, reason))?;
            }
        }
        GeoJson::Feature(feature) => {
            let geometry = feature
                .geometry
                .ok_or_else(|| VerdeError::read(path, "feature without geometry"))?;
            collect_polygons(&geometry, &mut polygons).map_err(|reason| VerdeError::read(path, reason))?;
        }
        GeoJson::Geometry(geometry) => {
            collect_polygons(&geometry, &mut polygons).map_err(|reason| VerdeError::read(path, reason))?;
        }
    }

    log::debug!("AOI contains {} polygon(s)", polygons.len());
    AreaOfInterest::new(polygons, Crs::from_epsg(4326)?).map_err(|e| VerdeError::read(path, e.to_string()))
}

fn collect_polygons(geometry: &Geometry, out: &mut Vec<Polygon>) -> Result<(), String> {
    match &geometry.value {
        Value::Polygon(rings) => out.push(convert_rings(rings)?),
        Value::MultiPolygon(polygons) => {
            for rings in polygons {
                out.push(convert_rings(rings)?);
            }
        }
        Value::GeometryCollection(geometries) => {
            for g in geometries {
                collect_polygons(g, out)?;
            }
        }
        other => {
            return Err(format!(
                "unsupported AOI geometry type {}; expected Polygon or MultiPolygon",
                geometry_type(other)
            ))
        }
    }
    Ok(())
}

fn geometry_type(value: &Value) -> &'static str {
    match value {
        Value::Point(_) => "Point",
        Value::MultiPoint(_) => "MultiPoint",
        Value::LineString(_) => "LineString",
        Value::MultiLineString(_) => "MultiLineString",
        Value::Polygon(_) => "Polygon",
        Value::MultiPolygon(_) => "MultiPolygon",
        Value::GeometryCollection(_) => "GeometryCollection",
    }
}

fn convert_rings(rings: &[Vec<Vec<f64>>]) -> Result<Polygon, String> {
    rings
        .iter()
        .map(|ring| {
            ring.iter()
                .map(|position| match position.as_slice() {
                    [x, y, ..] => Ok((*x, *y)),
                    _ => Err("position with fewer than two coordinates".to_string()),
                })
                .collect()
        })
        .collect()
}
