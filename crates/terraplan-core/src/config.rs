//! Planner limits and request defaults.

use crate::error::PlanError;
use crate::models::MarginBox;
use crate::split::{PartitionKey, SplitPolicy};
use crate::weather::WeatherProduct;
use serde::{Deserialize, Serialize};

/// Configuration passed explicitly into the composer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Largest raster (in mesh cells) a single sample stage may produce
    pub max_raster_cells: u64,
    pub split: SplitPolicy,
    /// Default neighborhood for route sampling, meters
    pub route_margin: MarginBox,
    pub route_multiplier: f64,
    /// Neighborhood used when reading raster values at route points
    pub point_query_margin: MarginBox,
    pub point_query_multiplier: f64,
    /// Mesh step for point queries, meters
    pub point_query_step: f64,
    /// Geohash characters naming the cell of an irradiance source
    pub irradiance_hash_length: usize,
    /// Geohash characters naming the cell of a reanalysis source
    pub reanalysis_hash_length: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_raster_cells: 100_000_000,
            split: SplitPolicy::default(),
            route_margin: MarginBox::new(-50.0, -50.0, 50.0, 50.0),
            route_multiplier: 3.0,
            point_query_margin: MarginBox::new(-1.0, -1.0, 1.0, 1.0),
            point_query_multiplier: 1000.0,
            point_query_step: 1.0,
            irradiance_hash_length: 5,
            reanalysis_hash_length: 3,
        }
    }
}

impl PlannerConfig {
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.max_raster_cells == 0 {
            return Err(PlanError::config("max_raster_cells must be positive"));
        }
        if self.split.max_waypoints == 0 {
            return Err(PlanError::config("split.max_waypoints must be positive"));
        }
        self.route_margin.validate()?;
        self.point_query_margin.validate()?;
        if !(self.point_query_step.is_finite() && self.point_query_step > 0.0) {
            return Err(PlanError::config("point_query_step must be positive"));
        }
        for (name, length) in [
            ("irradiance_hash_length", self.irradiance_hash_length),
            ("reanalysis_hash_length", self.reanalysis_hash_length),
        ] {
            if !(1..=12).contains(&length) {
                return Err(PlanError::config(format!("{} must be between 1 and 12", name)));
            }
        }
        Ok(())
    }

    pub fn weather_hash_length(&self, product: WeatherProduct) -> usize {
        match product {
            WeatherProduct::Irradiance => self.irradiance_hash_length,
            WeatherProduct::Reanalysis => self.reanalysis_hash_length,
        }
    }

    /// Split policy for weather routes: region buckets never get finer than
    /// the product's source cells.
    pub fn weather_split(&self, product: WeatherProduct) -> SplitPolicy {
        let cell = self.weather_hash_length(product);
        let mut policy = self.split.clone();
        for key in &mut policy.partition_by {
            if let PartitionKey::Region { precision } = key {
                *precision = (*precision).min(cell);
            }
        }
        policy
    }

    /// Reject a raster of `height_m x width_m` meters sampled at `step` if it
    /// exceeds [`Self::max_raster_cells`].
    pub fn check_raster_size(&self, height_m: f64, width_m: f64, step: f64) -> Result<(), PlanError> {
        let cells = (height_m / step).ceil().max(1.0) * (width_m / step).ceil().max(1.0);
        if cells > self.max_raster_cells as f64 {
            return Err(PlanError::config(format!(
                "requested raster of {:.0}x{:.0} m at step {} has {:.0} cells; limit is {}",
                height_m, width_m, step, cells, self.max_raster_cells
            )));
        }
        Ok(())
    }
}
