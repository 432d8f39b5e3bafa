//! Route clustering into shared fetch regions.
//!
//! Each waypoint needs a metric neighborhood (its margin box) sampled around
//! it. Sampling one raster per waypoint repeats most of the work for dense
//! routes, so nearby waypoints are grouped into clusters whose raster covers
//! every member's margin box while staying within a bounded extent.
//!
//! Margin boxes live in an R-tree (`rstar`), so each seed finds its captured
//! neighbours with one containment query instead of a pairwise scan.

use crate::error::PlanError;
use crate::models::{BoundingBox, MarginBox, Waypoint};
use crate::spatial::mercator_box_to_wgs84;
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

/// Group of nearby waypoints sampled from one raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    /// Tight union of the members' margin boxes (Web Mercator)
    pub box_metric: BoundingBox,
    /// `box_metric` reprojected to WGS84
    pub box_geographic: BoundingBox,
    /// Members ordered by original input index
    pub members: Vec<Waypoint>,
}

impl Cluster {
    pub fn member_indices(&self) -> Vec<usize> {
        self.members.iter().map(|wp| wp.index).collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
struct MarginEntry {
    /// Position in the input slice
    position: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for MarginEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

fn to_envelope(bbox: &BoundingBox) -> AABB<[f64; 2]> {
    AABB::from_corners([bbox.min_x, bbox.min_y], [bbox.max_x, bbox.max_y])
}

/// Search extent for a seed: its margin box dilated on every side by
/// `multiplier - 1` margin widths (heights for the north/south sides).
fn search_envelope(seed: &BoundingBox, margin: &MarginBox, multiplier: f64) -> AABB<[f64; 2]> {
    let grow = multiplier - 1.0;
    let grow_x = grow * margin.width();
    let grow_y = grow * margin.height();
    AABB::from_corners(
        [seed.min_x - grow_x, seed.min_y - grow_y],
        [seed.max_x + grow_x, seed.max_y + grow_y],
    )
}

/// Partition waypoints into the fewest greedy clusters.
///
/// # Arguments
/// * `waypoints` - Route points; `index` fields are carried into the output
/// * `margin` - Required neighborhood around each point in meters
/// * `multiplier` - Bound on cluster growth; values below 1 are clamped to 1
///
/// # Returns
/// Clusters in seed order (seeds are visited in input order). The result is
/// fully determined by the inputs.
pub fn cluster_route(
    waypoints: &[Waypoint],
    margin: &MarginBox,
    multiplier: f64,
) -> Result<Vec<Cluster>, PlanError> {
    margin.validate()?;
    let multiplier = if multiplier.is_finite() {
        multiplier.max(1.0)
    } else {
        1.0
    };

    let margins: Vec<BoundingBox> = waypoints
        .iter()
        .map(|wp| margin.around(wp.x_m, wp.y_m))
        .collect();

    let mut tree = RTree::bulk_load(
        margins
            .iter()
            .enumerate()
            .map(|(position, bbox)| MarginEntry {
                position,
                envelope: to_envelope(bbox),
            })
            .collect(),
    );

    let mut assigned = vec![false; waypoints.len()];
    let mut clusters = Vec::new();

    for seed in 0..waypoints.len() {
        if assigned[seed] {
            continue;
        }

        let search = search_envelope(&margins[seed], margin, multiplier);
        let captured: Vec<MarginEntry> = tree.locate_in_envelope(&search).cloned().collect();

        // The search envelope never shrinks below the seed's own margin box, so
        // the seed is always among the captured entries.
        let mut box_metric = margins[seed];
        let mut positions = Vec::with_capacity(captured.len());
        for entry in &captured {
            box_metric = box_metric.union(&margins[entry.position]);
            positions.push(entry.position);
            tree.remove(entry);
        }
        for &position in &positions {
            assigned[position] = true;
        }

        let mut members: Vec<Waypoint> = positions
            .into_iter()
            .map(|position| waypoints[position].clone())
            .collect();
        members.sort_by_key(|wp| wp.index);

        clusters.push(Cluster {
            box_geographic: mercator_box_to_wgs84(&box_metric),
            box_metric,
            members,
        });
    }

    Ok(clusters)
}

/// Geographic extent covering every cluster.
pub fn union_box(clusters: &[Cluster]) -> Option<BoundingBox> {
    let mut iter = clusters.iter();
    let first = iter.next()?.box_geographic;
    Some(iter.fold(first, |acc, cluster| acc.union(&cluster.box_geographic)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;

    fn route(points: &[(f64, f64)]) -> Vec<Waypoint> {
        points
            .iter()
            .enumerate()
            .map(|(idx, (lat, lon))| Waypoint::new(idx, *lat, *lon).unwrap())
            .collect()
    }

    fn random_route(seed: u64, n: usize) -> Vec<Waypoint> {
        let mut rng = StdRng::seed_from_u64(seed);
        let points: Vec<(f64, f64)> = (0..n)
            .map(|_| {
                (
                    50.86 + rng.random_range(0.0..0.01),
                    7.11 + rng.random_range(0.0..0.01),
                )
            })
            .collect();
        route(&points)
    }

    #[test]
    fn close_points_merge_and_far_point_stays_alone() {
        let waypoints = route(&[(50.865, 7.119), (50.8651, 7.1191), (50.900, 7.200)]);
        let margin = MarginBox::new(-5.0, -5.0, 5.0, 5.0);

        let clusters = cluster_route(&waypoints, &margin, 3.0).unwrap();

        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].member_indices(), vec![0, 1]);
        assert_eq!(clusters[1].member_indices(), vec![2]);
    }

    #[test]
    fn multiplier_below_one_only_merges_coincident_points() {
        let waypoints = route(&[(50.865, 7.119), (50.865, 7.119), (50.8651, 7.1191)]);
        let margin = MarginBox::new(-5.0, -5.0, 5.0, 5.0);

        let clusters = cluster_route(&waypoints, &margin, 0.2).unwrap();

        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].member_indices(), vec![0, 1]);
        assert_eq!(clusters[1].member_indices(), vec![2]);
    }

    #[test]
    fn isolated_waypoint_is_singleton() {
        let waypoints = route(&[(50.865, 7.119)]);
        let margin = MarginBox::new(-50.0, -50.0, 50.0, 50.0);

        let clusters = cluster_route(&waypoints, &margin, 3.0).unwrap();

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].box_metric, margin.around(waypoints[0].x_m, waypoints[0].y_m));
    }

    #[test]
    fn empty_route_has_no_clusters() {
        let margin = MarginBox::new(-5.0, -5.0, 5.0, 5.0);
        assert!(cluster_route(&[], &margin, 3.0).unwrap().is_empty());
        assert!(union_box(&[]).is_none());
    }

    #[test]
    fn inverted_margin_is_configuration_error() {
        let waypoints = route(&[(50.865, 7.119)]);
        let margin = MarginBox::new(5.0, -5.0, -5.0, 5.0);
        assert!(matches!(
            cluster_route(&waypoints, &margin, 3.0),
            Err(PlanError::Configuration(_))
        ));
    }

    #[test]
    fn clusters_partition_the_route() {
        let waypoints = random_route(7, 400);
        let margin = MarginBox::new(-50.0, -50.0, 50.0, 50.0);

        let clusters = cluster_route(&waypoints, &margin, 3.0).unwrap();

        let mut seen = HashSet::new();
        let mut total = 0;
        for cluster in &clusters {
            for index in cluster.member_indices() {
                assert!(seen.insert(index), "waypoint {index} assigned twice");
                total += 1;
            }
        }
        assert_eq!(total, waypoints.len());
        assert!(clusters.len() < waypoints.len());
    }

    #[test]
    fn cluster_box_contains_member_margins_and_stays_bounded() {
        let waypoints = random_route(11, 300);
        let margin = MarginBox::new(-20.0, -30.0, 20.0, 30.0);
        let multiplier = 4.0;

        let clusters = cluster_route(&waypoints, &margin, multiplier).unwrap();

        let max_width = (2.0 * multiplier - 1.0) * margin.width() + 1e-6;
        let max_height = (2.0 * multiplier - 1.0) * margin.height() + 1e-6;
        for cluster in &clusters {
            for wp in &cluster.members {
                assert!(cluster.box_metric.contains(&margin.around(wp.x_m, wp.y_m)));
            }
            assert!(cluster.box_metric.width() <= max_width);
            assert!(cluster.box_metric.height() <= max_height);
        }
    }

    #[test]
    fn clustering_is_deterministic() {
        let waypoints = random_route(23, 250);
        let margin = MarginBox::new(-50.0, -50.0, 50.0, 50.0);

        let first = cluster_route(&waypoints, &margin, 3.0).unwrap();
        let second = cluster_route(&waypoints, &margin, 3.0).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn geographic_box_matches_metric_box() {
        let waypoints = route(&[(50.865, 7.119), (50.8651, 7.1191)]);
        let margin = MarginBox::new(-5.0, -5.0, 5.0, 5.0);

        let clusters = cluster_route(&waypoints, &margin, 3.0).unwrap();
        let geo = clusters[0].box_geographic;

        assert_eq!(geo.crs, crate::models::Crs::Wgs84);
        for wp in &clusters[0].members {
            assert!(wp.lat > geo.min_y && wp.lat < geo.max_y);
            assert!(wp.lon > geo.min_x && wp.lon < geo.max_x);
        }
        let all = union_box(&clusters).unwrap();
        assert!(all.contains(&geo));
    }
}
