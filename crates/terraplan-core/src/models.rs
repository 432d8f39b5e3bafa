//! Core data models for planning requests.

use crate::error::PlanError;
use crate::spatial::{to_mercator, utm_zone};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coordinate reference system tag carried by every box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Crs {
    /// EPSG:4326, degrees
    Wgs84,
    /// EPSG:3857, meters
    WebMercator,
    Utm { zone: u8, north: bool },
    Epsg(u32),
}

impl Crs {
    pub fn epsg(&self) -> u32 {
        match self {
            Crs::Wgs84 => 4326,
            Crs::WebMercator => 3857,
            Crs::Utm { zone, north: true } => 32600 + *zone as u32,
            Crs::Utm { zone, north: false } => 32700 + *zone as u32,
            Crs::Epsg(code) => *code,
        }
    }

    /// True if coordinates are expressed in meters.
    pub fn is_metric(&self) -> bool {
        !matches!(self, Crs::Wgs84 | Crs::Epsg(4326))
    }
}

/// Axis-aligned extent `(min_y, min_x, max_y, max_x)`.
///
/// Geographic boxes follow the request ordering
/// `[lat_min, lon_min, lat_max, lon_max]`; metric boxes use northing for `y`
/// and easting for `x`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_y: f64,
    pub min_x: f64,
    pub max_y: f64,
    pub max_x: f64,
    pub crs: Crs,
}

impl BoundingBox {
    pub fn new(min_y: f64, min_x: f64, max_y: f64, max_x: f64, crs: Crs) -> Self {
        Self {
            min_y,
            min_x,
            max_y,
            max_x,
            crs,
        }
    }

    /// Build a WGS84 box from `[lat_min, lon_min, lat_max, lon_max]`.
    pub fn from_lat_lon(extent: [f64; 4]) -> Result<Self, PlanError> {
        let [min_lat, min_lon, max_lat, max_lon] = extent;
        if extent.iter().any(|v| !v.is_finite()) {
            return Err(PlanError::config(format!("box {:?} is not finite", extent)));
        }
        if min_lat > max_lat || min_lon > max_lon {
            return Err(PlanError::config(format!(
                "box {:?} must be [lat_min, lon_min, lat_max, lon_max]",
                extent
            )));
        }
        if !(-90.0..=90.0).contains(&min_lat) || !(-90.0..=90.0).contains(&max_lat) {
            return Err(PlanError::config(format!("box {:?} has invalid latitude", extent)));
        }
        Ok(Self::new(min_lat, min_lon, max_lat, max_lon, Crs::Wgs84))
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.min_y, self.min_x, self.max_y, self.max_x]
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Center as `(y, x)`.
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_y + self.max_y) / 2.0,
            (self.min_x + self.max_x) / 2.0,
        )
    }

    /// True if `other` lies fully inside `self`. Boxes in different reference
    /// systems never contain each other.
    pub fn contains(&self, other: &BoundingBox) -> bool {
        self.crs == other.crs
            && other.min_y >= self.min_y
            && other.min_x >= self.min_x
            && other.max_y <= self.max_y
            && other.max_x <= self.max_x
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.crs == other.crs
            && other.min_y <= self.max_y
            && other.max_y >= self.min_y
            && other.min_x <= self.max_x
            && other.max_x >= self.min_x
    }

    /// Smallest box containing both. The result keeps `self`'s reference
    /// system; callers only union boxes of the same system.
    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox::new(
            self.min_y.min(other.min_y),
            self.min_x.min(other.min_x),
            self.max_y.max(other.max_y),
            self.max_x.max(other.max_x),
            self.crs,
        )
    }

    /// Approximate metric size `(height_m, width_m)` of a geographic box.
    pub fn approx_size_m(&self) -> (f64, f64) {
        if self.crs.is_metric() {
            return (self.height(), self.width());
        }
        let mean_lat = ((self.min_y + self.max_y) / 2.0).to_radians();
        let height = self.height() * 111_320.0;
        let width = self.width() * 111_320.0 * mean_lat.cos().max(0.01);
        (height, width)
    }
}

/// Required sampling neighborhood around each waypoint, in meters:
/// `(south, west, north, east)` offsets relative to the point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarginBox {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl MarginBox {
    pub fn new(south: f64, west: f64, north: f64, east: f64) -> Self {
        Self {
            south,
            west,
            north,
            east,
        }
    }

    pub fn from_array(offsets: [f64; 4]) -> Self {
        Self::new(offsets[0], offsets[1], offsets[2], offsets[3])
    }

    pub fn validate(&self) -> Result<(), PlanError> {
        let values = [self.south, self.west, self.north, self.east];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(PlanError::config(format!("margin box {:?} is not finite", values)));
        }
        if self.south > self.north || self.west > self.east {
            return Err(PlanError::config(format!(
                "margin box {:?} must be [south, west, north, east]",
                values
            )));
        }
        Ok(())
    }

    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    /// Margin box placed around a metric point.
    pub fn around(&self, x_m: f64, y_m: f64) -> BoundingBox {
        BoundingBox::new(
            y_m + self.south,
            x_m + self.west,
            y_m + self.north,
            x_m + self.east,
            Crs::WebMercator,
        )
    }
}

/// Optional per-waypoint attributes carried through to per-cluster compute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaypointAttributes {
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
    /// Default global horizontal irradiance
    #[serde(default)]
    pub ghi: Option<f64>,
    /// Default diffuse horizontal irradiance
    #[serde(default)]
    pub dhi: Option<f64>,
}

/// One route sample point.
///
/// `index` is the position in the original input and is used to restore route
/// order after clusters are processed independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub index: usize,
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub attributes: WaypointAttributes,
    /// Web Mercator easting
    pub x_m: f64,
    /// Web Mercator northing
    pub y_m: f64,
}

impl Waypoint {
    pub fn new(index: usize, lat: f64, lon: f64) -> Result<Self, PlanError> {
        Self::with_attributes(index, lat, lon, WaypointAttributes::default())
    }

    pub fn with_attributes(
        index: usize,
        lat: f64,
        lon: f64,
        attributes: WaypointAttributes,
    ) -> Result<Self, PlanError> {
        if !lat.is_finite() || !lon.is_finite() || !(-90.0..=90.0).contains(&lat) {
            return Err(PlanError::config(format!(
                "waypoint {} has invalid coordinates ({}, {})",
                index, lat, lon
            )));
        }
        let (x_m, y_m) = to_mercator(lat, lon);
        Ok(Self {
            index,
            lat,
            lon,
            attributes,
            x_m,
            y_m,
        })
    }
}

/// Style of a rendered grayscale image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStyle {
    Plain,
    Normalized,
    Hillshade,
}

/// Data representation flowing between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Representation {
    /// Array plus mesh metadata
    RawSample,
    /// Georeferenced single-band raster
    GeoRaster,
    Image(ImageStyle),
}

impl Representation {
    pub fn name(&self) -> &'static str {
        match self {
            Representation::RawSample => "pickle",
            Representation::GeoRaster => "geotiff",
            Representation::Image(ImageStyle::Plain) => "png",
            Representation::Image(ImageStyle::Normalized) => "pngnormalize",
            Representation::Image(ImageStyle::Hillshade) => "pnghillshade",
        }
    }
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Representation {
    type Err = PlanError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pickle" | "raw-sample" => Ok(Representation::RawSample),
            "geotiff" | "geospatial-raster" => Ok(Representation::GeoRaster),
            "png" => Ok(Representation::Image(ImageStyle::Plain)),
            "pngnormalize" => Ok(Representation::Image(ImageStyle::Normalized)),
            "pnghillshade" | "hillshaded-image" => Ok(Representation::Image(ImageStyle::Hillshade)),
            other => Err(PlanError::config(format!(
                "invalid output type '{}'; choices: pickle, geotiff, png, pngnormalize, pnghillshade",
                other
            ))),
        }
    }
}

/// Statistic computed when sampling point-cloud sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Statistic {
    Max,
    Min,
    Count,
    Mean,
    Idw,
    Stdev,
}

impl Statistic {
    pub fn name(&self) -> &'static str {
        match self {
            Statistic::Max => "max",
            Statistic::Min => "min",
            Statistic::Count => "count",
            Statistic::Mean => "mean",
            Statistic::Idw => "idw",
            Statistic::Stdev => "stdev",
        }
    }
}

impl FromStr for Statistic {
    type Err = PlanError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "max" => Ok(Statistic::Max),
            "min" => Ok(Statistic::Min),
            "count" => Ok(Statistic::Count),
            "mean" => Ok(Statistic::Mean),
            "idw" => Ok(Statistic::Idw),
            "stdev" => Ok(Statistic::Stdev),
            other => Err(PlanError::config(format!(
                "invalid stat = {}; allowed values: max, min, count, mean, idw, stdev",
                other
            ))),
        }
    }
}

/// Coordinate system requested for the sampling mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshCrs {
    /// Pick the UTM zone of the region being sampled
    Utm,
    Epsg(u32),
}

impl MeshCrs {
    /// Resolve to a concrete reference system for the given WGS84 region.
    pub fn resolve(&self, region: &BoundingBox) -> Crs {
        match self {
            MeshCrs::Utm => {
                let (lat, lon) = region.center();
                let (zone, north) = utm_zone(lat, lon);
                Crs::Utm { zone, north }
            }
            MeshCrs::Epsg(4326) => Crs::Wgs84,
            MeshCrs::Epsg(3857) => Crs::WebMercator,
            MeshCrs::Epsg(code) => Crs::Epsg(*code),
        }
    }
}

impl FromStr for MeshCrs {
    type Err = PlanError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.eq_ignore_ascii_case("utm") {
            return Ok(MeshCrs::Utm);
        }
        value
            .parse::<u32>()
            .map(MeshCrs::Epsg)
            .map_err(|_| PlanError::config(format!("invalid mesh type '{}'", value)))
    }
}

/// Parameters shared by every sampling request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleParams {
    /// Regular expression selecting datasets
    pub data_re: String,
    pub stat: Statistic,
    /// Point-cloud resolution used when deriving raw units
    pub resolution: f64,
    /// Mesh step in meters
    pub step: f64,
    pub mesh: MeshCrs,
}

impl Default for SampleParams {
    fn default() -> Self {
        Self {
            data_re: ".*".to_string(),
            stat: Statistic::Max,
            resolution: 0.3,
            step: 1.0,
            mesh: MeshCrs::Utm,
        }
    }
}

impl SampleParams {
    pub fn validate(&self) -> Result<(), PlanError> {
        if !(self.resolution.is_finite() && self.resolution > 0.0) {
            return Err(PlanError::config(format!(
                "invalid resolution = {}",
                self.resolution
            )));
        }
        if !(self.step.is_finite() && self.step > 0.0) {
            return Err(PlanError::config(format!("invalid step = {}", self.step)));
        }
        Ok(())
    }
}
