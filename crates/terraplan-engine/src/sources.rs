//! Catalog of raw source units (elevation tiles, point-cloud archives).

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use terraplan_core::{BoundingBox, PlanError, Statistic};

/// One raw data unit covering a geographic region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceUnit {
    /// Storage path of the unit
    pub file: String,
    /// WGS84 extent
    pub region: BoundingBox,
    /// Download location if the unit can be derived on demand
    #[serde(default)]
    pub url: Option<String>,
    /// Unit is a point cloud that must be rasterized first
    #[serde(default)]
    pub compute_from_points: bool,
}

impl SourceUnit {
    /// Storage path of the unit after statistics at `resolution`.
    pub fn derived_path(&self, stat: Statistic, resolution: f64) -> String {
        format!("{}_{}_{}", self.file, stat.name(), resolution)
    }
}

#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// Units intersecting any of `regions` whose path matches `data_re`,
    /// ordered by path.
    async fn units_for(
        &self,
        regions: &[BoundingBox],
        data_re: &str,
    ) -> Result<Vec<SourceUnit>, PlanError>;
}

/// In-memory catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    units: Vec<SourceUnit>,
}

impl StaticCatalog {
    pub fn new(units: Vec<SourceUnit>) -> Self {
        Self { units }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Load units from a JSON array.
    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        serde_json::from_str(json)
            .map(Self::new)
            .map_err(|e| PlanError::config(format!("invalid source catalog: {}", e)))
    }
}

#[async_trait]
impl SourceCatalog for StaticCatalog {
    async fn units_for(
        &self,
        regions: &[BoundingBox],
        data_re: &str,
    ) -> Result<Vec<SourceUnit>, PlanError> {
        let pattern = Regex::new(data_re)
            .map_err(|e| PlanError::config(format!("invalid data_re '{}': {}", data_re, e)))?;

        let matched: BTreeMap<&str, &SourceUnit> = self
            .units
            .iter()
            .filter(|unit| pattern.is_match(&unit.file))
            .filter(|unit| regions.iter().any(|region| region.intersects(&unit.region)))
            .map(|unit| (unit.file.as_str(), unit))
            .collect();

        Ok(matched.into_values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use terraplan_core::Crs;

    fn unit(file: &str, lat: f64, lon: f64) -> SourceUnit {
        SourceUnit {
            file: file.to_string(),
            region: BoundingBox::new(lat, lon, lat + 1.0, lon + 1.0, Crs::Wgs84),
            url: None,
            compute_from_points: false,
        }
    }

    #[tokio::test]
    async fn filters_by_region_and_pattern() {
        let catalog = StaticCatalog::new(vec![
            unit("srtm/N50E007.tif", 50.0, 7.0),
            unit("srtm/N51E007.tif", 51.0, 7.0),
            unit("lidar/N50E007.laz", 50.0, 7.0),
        ]);
        let region = BoundingBox::new(50.865, 7.119, 50.867, 7.121, Crs::Wgs84);

        let all = catalog.units_for(&[region], ".*").await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].file, "lidar/N50E007.laz");

        let srtm = catalog.units_for(&[region], "^srtm/").await.unwrap();
        assert_eq!(srtm.len(), 1);
        assert_eq!(srtm[0].file, "srtm/N50E007.tif");
    }

    #[tokio::test]
    async fn invalid_pattern_is_configuration_error() {
        let catalog = StaticCatalog::default();
        assert!(matches!(
            catalog.units_for(&[], "(").await,
            Err(PlanError::Configuration(_))
        ));
    }

    #[test]
    fn derived_path_names_statistic_and_resolution() {
        let u = unit("srtm/N50E007.tif", 50.0, 7.0);
        assert_eq!(u.derived_path(Statistic::Max, 0.3), "srtm/N50E007.tif_max_0.3");
    }
}
