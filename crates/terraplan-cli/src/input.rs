//! Parsing of command-line request arguments.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::path::Path;
use terraplan_core::{
    read_route_tsv, read_times_tsv, BoundingBox, Cluster, FilterSpec, MarginBox, PlanError,
    TimeSample, Waypoint,
};
use terraplan_engine::StaticCatalog;

fn parse_four(value: &str, what: &str) -> Result<[f64; 4], PlanError> {
    let numbers = value
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| PlanError::config(format!("{} '{}' is not numeric", what, value)))?;
    numbers
        .try_into()
        .map_err(|_| PlanError::config(format!("{} '{}' needs four values", what, value)))
}

/// `lat_min,lon_min,lat_max,lon_max`
pub fn parse_box(value: &str) -> Result<BoundingBox, PlanError> {
    BoundingBox::from_lat_lon(parse_four(value, "box")?)
}

/// `south,west,north,east` offsets in meters
pub fn parse_margin(value: &str) -> Result<MarginBox, PlanError> {
    let margin = MarginBox::from_array(parse_four(value, "margin")?);
    margin.validate()?;
    Ok(margin)
}

/// `type:size`, e.g. `median:5`
pub fn parse_filter(value: &str) -> Result<FilterSpec, PlanError> {
    let (filter_type, size) = value
        .split_once(':')
        .ok_or_else(|| PlanError::config(format!("filter '{}' must be type:size", value)))?;
    let size = size
        .parse::<usize>()
        .map_err(|_| PlanError::config(format!("invalid filter size '{}'", size)))?;
    Ok(FilterSpec {
        filter_type: filter_type.to_string(),
        size,
    })
}

pub fn read_route(path: &Path) -> Result<Vec<Waypoint>> {
    let file = File::open(path).with_context(|| format!("opening route {}", path.display()))?;
    Ok(read_route_tsv(file)?)
}

/// Read an irradiance time series with `timestr`, `ghi` and `dhi` columns.
pub fn read_times(path: &Path) -> Result<Vec<TimeSample>> {
    let file =
        File::open(path).with_context(|| format!("opening time series {}", path.display()))?;
    Ok(read_times_tsv(file)?)
}

/// Comma-separated variable names; empty for the product defaults.
pub fn parse_variables(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

pub fn read_catalog(path: &Path) -> Result<StaticCatalog> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading catalog {}", path.display()))?;
    Ok(StaticCatalog::from_json(&json)?)
}

/// Printable summary of one cluster.
#[derive(Debug, Serialize)]
pub struct ClusterSummary {
    #[serde(rename = "box")]
    pub extent: [f64; 4],
    pub members: Vec<usize>,
}

impl From<&Cluster> for ClusterSummary {
    fn from(cluster: &Cluster) -> Self {
        Self {
            extent: cluster.box_geographic.as_array(),
            members: cluster.member_indices(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_box_in_request_order() {
        let b = parse_box("50.865, 7.119,50.867,7.121").unwrap();
        assert_eq!(b.as_array(), [50.865, 7.119, 50.867, 7.121]);
        assert!(parse_box("50.865,7.119,50.867").is_err());
        assert!(parse_box("50.867,7.119,50.865,7.121").is_err());
    }

    #[test]
    fn parses_margin_and_filter() {
        let m = parse_margin("-50,-50,50,50").unwrap();
        assert_eq!(m.width(), 100.0);
        assert!(parse_margin("50,-50,-50,50").is_err());

        let f = parse_filter("median:5").unwrap();
        assert_eq!(f.filter_type, "median");
        assert_eq!(f.size, 5);
        assert!(parse_filter("median").is_err());
    }

    #[test]
    fn reads_route_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "latitude\tlongitude").unwrap();
        writeln!(file, "50.865\t7.119").unwrap();
        writeln!(file, "50.866\t7.120").unwrap();

        let route = read_route(file.path()).unwrap();
        assert_eq!(route.len(), 2);
        assert_eq!(route[1].index, 1);
    }

    #[test]
    fn reads_time_series_and_variables() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timestr\tghi\tdhi").unwrap();
        writeln!(file, "2019-07-01_10:00:00\t800\t100").unwrap();

        let times = read_times(file.path()).unwrap();
        assert_eq!(times.len(), 1);
        assert_eq!(times[0].dhi, 100.0);

        assert_eq!(parse_variables("GHI, DHI"), vec!["GHI", "DHI"]);
        assert!(parse_variables("").is_empty());
    }
}
