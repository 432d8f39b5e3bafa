//! Route files and per-waypoint result tables.
//!
//! Routes arrive as tab-separated files with at least `latitude` and
//! `longitude` columns; `ghi`, `dhi` and `timestr` are optional. Route results
//! are tables with one row per waypoint, keyed by the waypoint's original
//! index so that independently computed parts can be merged back into route
//! order.

use crate::error::PlanError;
use crate::models::{Waypoint, WaypointAttributes};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

/// Timestamp format used by route files, e.g. `2020-07-01_06:00:00`.
pub const TIME_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

pub fn parse_time(value: &str) -> Result<DateTime<Utc>, PlanError> {
    NaiveDateTime::parse_from_str(value.trim(), TIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|err| PlanError::config(format!("invalid time '{}': {}", value, err)))
}

fn parse_optional_f64(value: Option<&str>, column: &str, row: usize) -> Result<Option<f64>, PlanError> {
    match value.map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => text.parse::<f64>().map(Some).map_err(|_| {
            PlanError::config(format!("row {}: invalid {} value '{}'", row, column, text))
        }),
    }
}

/// Read a tab-separated route file.
pub fn read_route_tsv<R: Read>(reader: R) -> Result<Vec<Waypoint>, PlanError> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr
        .headers()
        .map_err(|err| PlanError::config(format!("cannot read route header: {}", err)))?
        .clone();
    let column = |name: &str| headers.iter().position(|h| h == name);
    let (Some(lat_col), Some(lon_col)) = (column("latitude"), column("longitude")) else {
        return Err(PlanError::config(
            "route file must have 'latitude' and 'longitude' columns",
        ));
    };
    let ghi_col = column("ghi");
    let dhi_col = column("dhi");
    let time_col = column("timestr");

    let mut waypoints = Vec::new();
    for (index, record) in rdr.records().enumerate() {
        let record = record
            .map_err(|err| PlanError::config(format!("row {}: {}", index, err)))?;
        let lat = parse_optional_f64(record.get(lat_col), "latitude", index)?
            .ok_or_else(|| PlanError::config(format!("row {}: missing latitude", index)))?;
        let lon = parse_optional_f64(record.get(lon_col), "longitude", index)?
            .ok_or_else(|| PlanError::config(format!("row {}: missing longitude", index)))?;

        let time = match time_col.and_then(|col| record.get(col)) {
            Some(text) if !text.trim().is_empty() => Some(parse_time(text)?),
            _ => None,
        };
        let attributes = WaypointAttributes {
            time,
            ghi: parse_optional_f64(ghi_col.and_then(|c| record.get(c)), "ghi", index)?,
            dhi: parse_optional_f64(dhi_col.and_then(|c| record.get(c)), "dhi", index)?,
        };
        waypoints.push(Waypoint::with_attributes(index, lat, lon, attributes)?);
    }

    Ok(waypoints)
}

/// One step of an irradiance time series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSample {
    pub time: DateTime<Utc>,
    pub ghi: f64,
    pub dhi: f64,
}

/// Read a tab-separated time series with `timestr`, `ghi` and `dhi` columns.
pub fn read_times_tsv<R: Read>(reader: R) -> Result<Vec<TimeSample>, PlanError> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr
        .headers()
        .map_err(|err| PlanError::config(format!("cannot read time series header: {}", err)))?
        .clone();
    let column = |name: &str| headers.iter().position(|h| h == name);
    let (Some(time_col), Some(ghi_col), Some(dhi_col)) =
        (column("timestr"), column("ghi"), column("dhi"))
    else {
        return Err(PlanError::config(
            "time series must have 'timestr', 'ghi' and 'dhi' columns",
        ));
    };

    let mut samples = Vec::new();
    for (row, record) in rdr.records().enumerate() {
        let record = record.map_err(|err| PlanError::config(format!("row {}: {}", row, err)))?;
        let time = parse_time(record.get(time_col).unwrap_or_default())?;
        let ghi = parse_optional_f64(record.get(ghi_col), "ghi", row)?
            .ok_or_else(|| PlanError::config(format!("row {}: missing ghi", row)))?;
        let dhi = parse_optional_f64(record.get(dhi_col), "dhi", row)?
            .ok_or_else(|| PlanError::config(format!("row {}: missing dhi", row)))?;
        samples.push(TimeSample { time, ghi, dhi });
    }
    if samples.is_empty() {
        return Err(PlanError::config("time series has no rows"));
    }
    Ok(samples)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRow {
    pub index: usize,
    pub latitude: f64,
    pub longitude: f64,
    pub values: BTreeMap<String, f64>,
}

impl RouteRow {
    pub fn for_waypoint(waypoint: &Waypoint) -> Self {
        Self {
            index: waypoint.index,
            latitude: waypoint.lat,
            longitude: waypoint.lon,
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, column: &str, value: f64) -> Self {
        self.values.insert(column.to_string(), value);
        self
    }
}

/// Per-waypoint results of a route request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteTable {
    pub rows: Vec<RouteRow>,
}

impl RouteTable {
    pub fn new(rows: Vec<RouteRow>) -> Self {
        Self { rows }
    }

    /// Concatenate partial tables and restore original waypoint order.
    ///
    /// A waypoint index present in two parts means the parts were not a
    /// partition of the route; that is reported instead of picking one.
    pub fn merge<I>(parts: I) -> Result<RouteTable, PlanError>
    where
        I: IntoIterator<Item = RouteTable>,
    {
        let mut rows: Vec<RouteRow> = parts.into_iter().flat_map(|part| part.rows).collect();
        rows.sort_by_key(|row| row.index);
        if let Some(pair) = rows.windows(2).find(|pair| pair[0].index == pair[1].index) {
            return Err(PlanError::stage(
                "merge",
                format!("waypoint {} appears in more than one part", pair[0].index),
            ));
        }
        Ok(RouteTable { rows })
    }

    pub fn indices(&self) -> Vec<usize> {
        self.rows.iter().map(|row| row.index).collect()
    }

    /// Read a table written by [`Self::write_tsv`]. Empty cells are absent
    /// values.
    pub fn read_tsv<R: Read>(reader: R) -> Result<RouteTable, PlanError> {
        let mut rdr = csv::ReaderBuilder::new().delimiter(b'\t').from_reader(reader);
        let headers = rdr
            .headers()
            .map_err(|e| PlanError::stage("merge", e))?
            .clone();
        if headers.len() < 3
            || &headers[0] != "index"
            || &headers[1] != "latitude"
            || &headers[2] != "longitude"
        {
            return Err(PlanError::stage(
                "merge",
                "route table must start with index, latitude, longitude",
            ));
        }

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record.map_err(|e| PlanError::stage("merge", e))?;
            let field = |i: usize| record.get(i).unwrap_or_default();
            let number = |i: usize| {
                field(i).parse::<f64>().map_err(|_| {
                    PlanError::stage("merge", format!("invalid {} '{}'", &headers[i], field(i)))
                })
            };
            let index = field(0)
                .parse::<usize>()
                .map_err(|_| PlanError::stage("merge", format!("invalid index '{}'", field(0))))?;

            let mut values = BTreeMap::new();
            for column in 3..headers.len() {
                if !field(column).is_empty() {
                    values.insert(headers[column].to_string(), number(column)?);
                }
            }
            rows.push(RouteRow {
                index,
                latitude: number(1)?,
                longitude: number(2)?,
                values,
            });
        }
        Ok(RouteTable { rows })
    }

    /// Write as a tab-separated table with one column per value name.
    pub fn write_tsv<W: Write>(&self, writer: W) -> Result<(), PlanError> {
        let columns: BTreeSet<&String> = self.rows.iter().flat_map(|r| r.values.keys()).collect();
        let mut wtr = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);

        let mut header = vec!["index".to_string(), "latitude".to_string(), "longitude".to_string()];
        header.extend(columns.iter().map(|c| c.to_string()));
        wtr.write_record(&header).map_err(|e| PlanError::stage("merge", e))?;

        for row in &self.rows {
            let mut record = vec![
                row.index.to_string(),
                row.latitude.to_string(),
                row.longitude.to_string(),
            ];
            for column in &columns {
                record.push(
                    row.values
                        .get(*column)
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                );
            }
            wtr.write_record(&record).map_err(|e| PlanError::stage("merge", e))?;
        }
        wtr.flush().map_err(|e| PlanError::stage("merge", e))?;
        Ok(())
    }
}
