//! Weather products and the source files they are sampled from.
//!
//! Weather data is retrieved in fixed source files before any sampling. An
//! irradiance source covers one geohash cell for one ISO week, a reanalysis
//! source one cell for one day. Requests list the sources their points or box
//! touch so each source is fetched at most once, however many requests need
//! it.

use crate::error::PlanError;
use crate::models::{BoundingBox, Waypoint};
use crate::spatial::{geohash, geohash_cell_size};
use crate::table::parse_time;
use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeatherProduct {
    /// Surface solar radiation time series
    Irradiance,
    /// Hourly reanalysis fields
    Reanalysis,
}

impl WeatherProduct {
    pub fn name(&self) -> &'static str {
        match self {
            WeatherProduct::Irradiance => "irradiance",
            WeatherProduct::Reanalysis => "reanalysis",
        }
    }

    pub fn default_variables(&self) -> Vec<String> {
        let names: &[&str] = match self {
            WeatherProduct::Irradiance => &["GHI", "DHI"],
            WeatherProduct::Reanalysis => &[
                "10m_u_component_of_wind",
                "10m_v_component_of_wind",
                "2m_temperature",
            ],
        };
        names.iter().map(|name| name.to_string()).collect()
    }

    /// Source period containing `time`.
    fn period(&self, time: DateTime<Utc>) -> String {
        match self {
            WeatherProduct::Irradiance => {
                let week = time.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            WeatherProduct::Reanalysis => time.format("%Y-%m-%d").to_string(),
        }
    }
}

impl FromStr for WeatherProduct {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "irradiance" => Ok(WeatherProduct::Irradiance),
            "reanalysis" => Ok(WeatherProduct::Reanalysis),
            other => Err(PlanError::config(format!("unknown weather product '{}'", other))),
        }
    }
}

/// Inclusive UTC time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Every day touched by the range, as midnight timestamps.
    pub fn days(&self) -> Vec<DateTime<Utc>> {
        let mut days = Vec::new();
        let mut day = self.start.date_naive();
        let last = self.end.date_naive();
        while day <= last {
            days.push(day.and_time(chrono::NaiveTime::MIN).and_utc());
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        days
    }
}

/// `start/end` or a single instant, both as `%Y-%m-%d_%H:%M:%S`.
impl FromStr for TimeRange {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = match s.split_once('/') {
            Some((start, end)) => (parse_time(start)?, parse_time(end)?),
            None => {
                let at = parse_time(s)?;
                (at, at)
            }
        };
        if end < start {
            return Err(PlanError::config(format!("time range '{}' ends before it starts", s)));
        }
        Ok(Self { start, end })
    }
}

/// Sampling interval such as `20minutes` or `1hour`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeStep {
    pub seconds: i64,
}

impl TimeStep {
    pub fn as_duration(&self) -> Duration {
        Duration::seconds(self.seconds)
    }
}

impl FromStr for TimeStep {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| PlanError::config(format!("time step '{}' has no unit", s)))?;
        let (count, unit) = s.split_at(split);
        let count: i64 = count
            .parse()
            .map_err(|_| PlanError::config(format!("time step '{}' has no count", s)))?;
        let unit_secs = match unit.trim_end_matches('s') {
            "second" => 1,
            "minute" => 60,
            "hour" => 3600,
            "day" => 86_400,
            other => {
                return Err(PlanError::config(format!("unknown time step unit '{}'", other)))
            }
        };
        if count <= 0 {
            return Err(PlanError::config("time step must be positive"));
        }
        Ok(Self {
            seconds: count * unit_secs,
        })
    }
}

impl fmt::Display for TimeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}seconds", self.seconds)
    }
}

/// One retrievable weather source file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WeatherSource {
    pub product: WeatherProduct,
    /// Geohash cell of the source
    pub region: String,
    /// ISO week (`2019-W27`) or date (`2019-07-01`)
    pub period: String,
}

impl WeatherSource {
    /// Storage path the retrieved source is written to.
    pub fn output_path(&self) -> String {
        format!("weather/{}/{}/{}.nc", self.product.name(), self.region, self.period)
    }
}

/// Distinct sources needed to sample `waypoints`, in sorted order.
///
/// Every waypoint needs a time.
pub fn route_sources(
    product: WeatherProduct,
    waypoints: &[Waypoint],
    hash_length: usize,
) -> Result<Vec<WeatherSource>, PlanError> {
    let mut sources = BTreeSet::new();
    for wp in waypoints {
        let time = wp.attributes.time.ok_or_else(|| {
            PlanError::config(format!("waypoint {} has no time for {} data", wp.index, product.name()))
        })?;
        sources.insert(WeatherSource {
            product,
            region: geohash(wp.lat, wp.lon, hash_length),
            period: product.period(time),
        });
    }
    Ok(sources.into_iter().collect())
}

/// Distinct sources covering every cell of `region` on every day of `range`.
pub fn box_sources(
    product: WeatherProduct,
    region: &BoundingBox,
    range: &TimeRange,
    hash_length: usize,
) -> Vec<WeatherSource> {
    let (cell_lat, cell_lon) = geohash_cell_size(hash_length);
    let axis = |min: f64, max: f64, step: f64| {
        let mut values = Vec::new();
        let mut value = min;
        while value < max {
            values.push(value);
            value += step;
        }
        values.push(max);
        values
    };

    let mut cells = BTreeSet::new();
    for lat in axis(region.min_y, region.max_y, cell_lat) {
        for lon in axis(region.min_x, region.max_x, cell_lon) {
            cells.insert(geohash(lat, lon, hash_length));
        }
    }

    let mut sources = BTreeSet::new();
    for day in range.days() {
        for cell in &cells {
            sources.insert(WeatherSource {
                product,
                region: cell.clone(),
                period: product.period(day),
            });
        }
    }
    sources.into_iter().collect()
}

/// What a weather sample stage reads out of its sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WeatherSampleSpec {
    /// Time series over a box
    Box {
        product: WeatherProduct,
        region: BoundingBox,
        range: TimeRange,
        step: TimeStep,
        variables: Vec<String>,
        sources: Vec<String>,
    },
    /// Values at every waypoint's own time
    Route {
        product: WeatherProduct,
        waypoints: Vec<Waypoint>,
        variables: Vec<String>,
        sources: Vec<String>,
    },
}
