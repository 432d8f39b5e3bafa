//! Splitting oversized route requests into independently cached parts.
//!
//! A whole route call is one cache unit, so one changed point in a long route
//! would invalidate everything computed for it. Splitting by region and
//! calendar period keeps unchanged parts cached, and the waypoint ceiling
//! bounds the work behind a single key.

use crate::models::Waypoint;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::spatial::geohash;

/// Component of a cache-partition bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum PartitionKey {
    /// Geohash prefix of the waypoint
    Region { precision: usize },
    Month,
    /// ISO week
    Week,
    Date,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitPolicy {
    /// Most waypoints handled by one sub-request
    pub max_waypoints: usize,
    pub partition_by: Vec<PartitionKey>,
    /// Most distinct buckets one sub-request may span
    pub max_buckets: usize,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        Self {
            max_waypoints: 3000,
            partition_by: vec![
                PartitionKey::Region { precision: 4 },
                PartitionKey::Month,
                PartitionKey::Week,
                PartitionKey::Date,
            ],
            max_buckets: 1,
        }
    }
}

fn bucket_component(
    key: &PartitionKey,
    waypoint: &Waypoint,
    default_time: Option<DateTime<Utc>>,
) -> String {
    let time = waypoint.attributes.time.or(default_time);
    match (key, time) {
        (PartitionKey::Region { precision }, _) => geohash(waypoint.lat, waypoint.lon, *precision),
        (PartitionKey::Month, Some(time)) => format!("{}-{:02}", time.year(), time.month()),
        (PartitionKey::Week, Some(time)) => {
            let week = time.iso_week();
            format!("{}-W{:02}", week.year(), week.week())
        }
        (PartitionKey::Date, Some(time)) => time.format("%Y-%m-%d").to_string(),
        (_, None) => "-".to_string(),
    }
}

/// Bucket label of a waypoint under `policy`.
pub fn bucket_of(
    waypoint: &Waypoint,
    policy: &SplitPolicy,
    default_time: Option<DateTime<Utc>>,
) -> String {
    policy
        .partition_by
        .iter()
        .map(|key| bucket_component(key, waypoint, default_time))
        .collect::<Vec<_>>()
        .join("/")
}

/// True if the route must be split before planning.
pub fn needs_split(
    waypoints: &[Waypoint],
    policy: &SplitPolicy,
    default_time: Option<DateTime<Utc>>,
) -> bool {
    if waypoints.len() > policy.max_waypoints.max(1) {
        return true;
    }
    let mut buckets: Vec<String> = waypoints
        .iter()
        .map(|wp| bucket_of(wp, policy, default_time))
        .collect();
    buckets.sort();
    buckets.dedup();
    buckets.len() > policy.max_buckets.max(1)
}

/// Split a route into sub-requests.
///
/// Returns the route unchanged as a single part when no split is needed.
/// Otherwise waypoints are grouped by bucket (in bucket-label order) and each
/// bucket is chunked into at most `max_waypoints` points, keeping input order
/// inside a chunk. Waypoints keep their original `index`, so merged outputs
/// can be re-sorted into route order.
pub fn split_route(
    waypoints: &[Waypoint],
    policy: &SplitPolicy,
    default_time: Option<DateTime<Utc>>,
) -> Vec<Vec<Waypoint>> {
    if waypoints.is_empty() {
        return Vec::new();
    }
    if !needs_split(waypoints, policy, default_time) {
        return vec![waypoints.to_vec()];
    }

    let mut buckets: BTreeMap<String, Vec<Waypoint>> = BTreeMap::new();
    for wp in waypoints {
        buckets
            .entry(bucket_of(wp, policy, default_time))
            .or_default()
            .push(wp.clone());
    }

    let max = policy.max_waypoints.max(1);
    buckets
        .into_values()
        .flat_map(|bucket| {
            bucket
                .chunks(max)
                .map(|chunk| chunk.to_vec())
                .collect::<Vec<_>>()
        })
        .collect()
}
