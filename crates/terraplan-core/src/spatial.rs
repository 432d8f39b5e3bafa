//! Projection math for clustering and mesh selection.
//!
//! Waypoints are clustered in spherical Web Mercator (EPSG:3857) so that
//! margin boxes can be expressed in meters, and results are reported back in
//! WGS84 (EPSG:4326). Sampling meshes use UTM zones chosen from the region.

use crate::models::{BoundingBox, Crs};

/// Radius of the Web Mercator sphere in meters.
pub const MERCATOR_RADIUS_M: f64 = 6_378_137.0;

/// Latitude beyond which Web Mercator is undefined.
pub const MERCATOR_MAX_LAT: f64 = 85.051_128_779_806_6;

const GEOHASH_ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Project WGS84 coordinates to Web Mercator.
///
/// # Returns
/// `(x_m, y_m)`: easting and northing in meters
pub fn to_mercator(lat: f64, lon: f64) -> (f64, f64) {
    let lat = lat.clamp(-MERCATOR_MAX_LAT, MERCATOR_MAX_LAT);
    let x = MERCATOR_RADIUS_M * lon.to_radians();
    let y = MERCATOR_RADIUS_M
        * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0)
            .tan()
            .ln();
    (x, y)
}

/// Inverse of [`to_mercator`].
///
/// # Returns
/// `(lat, lon)` in decimal degrees
pub fn from_mercator(x_m: f64, y_m: f64) -> (f64, f64) {
    let lon = (x_m / MERCATOR_RADIUS_M).to_degrees();
    let lat = (2.0 * (y_m / MERCATOR_RADIUS_M).exp().atan() - std::f64::consts::FRAC_PI_2)
        .to_degrees();
    (lat, lon)
}

/// Reproject a Web Mercator box to WGS84 by transforming its corners.
///
/// Mercator is conformal and axis-aligned, so the corner transform is exact
/// for the extent.
pub fn mercator_box_to_wgs84(metric: &BoundingBox) -> BoundingBox {
    let (min_lat, min_lon) = from_mercator(metric.min_x, metric.min_y);
    let (max_lat, max_lon) = from_mercator(metric.max_x, metric.max_y);
    BoundingBox::new(min_lat, min_lon, max_lat, max_lon, Crs::Wgs84)
}

/// UTM zone covering a WGS84 location, including the Norway and Svalbard
/// exceptions.
///
/// # Returns
/// `(zone, north)` where `zone` is in `1..=60`
pub fn utm_zone(lat: f64, lon: f64) -> (u8, bool) {
    let lon = (lon + 180.0).rem_euclid(360.0) - 180.0;
    let mut zone = (((lon + 180.0) / 6.0).floor() as i32 + 1).clamp(1, 60);

    if (56.0..64.0).contains(&lat) && (3.0..12.0).contains(&lon) {
        zone = 32;
    }
    if (72.0..84.0).contains(&lat) {
        zone = match lon {
            l if (0.0..9.0).contains(&l) => 31,
            l if (9.0..21.0).contains(&l) => 33,
            l if (21.0..33.0).contains(&l) => 35,
            l if (33.0..42.0).contains(&l) => 37,
            _ => zone,
        };
    }

    (zone as u8, lat >= 0.0)
}

/// Encode a location as a geohash of the given precision.
///
/// Used as the region component of request-splitting buckets, so nearby
/// waypoints share a prefix.
pub fn geohash(lat: f64, lon: f64, precision: usize) -> String {
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);
    let mut hash = String::with_capacity(precision);
    let mut bits = 0u8;
    let mut bit_count = 0;
    let mut even = true;

    while hash.len() < precision {
        let (range, value) = if even {
            (&mut lon_range, lon)
        } else {
            (&mut lat_range, lat)
        };
        let mid = (range.0 + range.1) / 2.0;
        bits <<= 1;
        if value >= mid {
            bits |= 1;
            range.0 = mid;
        } else {
            range.1 = mid;
        }
        even = !even;
        bit_count += 1;

        if bit_count == 5 {
            hash.push(GEOHASH_ALPHABET[bits as usize] as char);
            bits = 0;
            bit_count = 0;
        }
    }

    hash
}

/// Height and width in degrees of a geohash cell of `precision` characters.
pub fn geohash_cell_size(precision: usize) -> (f64, f64) {
    let bits = 5 * precision as i32;
    let lon_bits = (bits + 1) / 2;
    let lat_bits = bits / 2;
    (180.0 / 2f64.powi(lat_bits), 360.0 / 2f64.powi(lon_bits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mercator_round_trips_through_inverse() {
        let (x, y) = to_mercator(50.865, 7.119);
        let (lat, lon) = from_mercator(x, y);
        assert!((lat - 50.865).abs() < 1e-9);
        assert!((lon - 7.119).abs() < 1e-9);
    }

    #[test]
    fn mercator_origin_is_null_island() {
        let (x, y) = to_mercator(0.0, 0.0);
        assert!(x.abs() < 1e-9);
        assert!(y.abs() < 1e-9);
    }

    #[test]
    fn mercator_stretches_latitude_away_from_equator() {
        // 0.0001 degree north at ~51N is ~17.6 m in Mercator, ~11.1 m on the ground
        let (_, y1) = to_mercator(50.865, 7.119);
        let (_, y2) = to_mercator(50.8651, 7.119);
        let dy = y2 - y1;
        assert!((dy - 17.63).abs() < 0.05, "dy = {dy}");
    }

    #[test]
    fn utm_zone_for_bonn() {
        assert_eq!(utm_zone(50.865, 7.119), (32, true));
    }

    #[test]
    fn utm_zone_handles_southern_hemisphere_and_norway() {
        assert_eq!(utm_zone(-33.9, 18.4), (34, false));
        assert_eq!(utm_zone(60.0, 5.0), (32, true));
        assert_eq!(utm_zone(78.0, 15.0), (33, true));
    }

    #[test]
    fn geohash_matches_reference_value() {
        // Reference value from the geohash.org encoding of 57.64911, 10.40744
        assert_eq!(geohash(57.64911, 10.40744, 11), "u4pruydqqvj");
    }

    #[test]
    fn geohash_cells_alternate_axes() {
        assert_eq!(geohash_cell_size(1), (45.0, 45.0));
        assert_eq!(geohash_cell_size(2), (5.625, 11.25));
    }

    #[test]
    fn geohash_prefix_is_shared_by_neighbours() {
        let a = geohash(50.865, 7.119, 4);
        let b = geohash(50.8651, 7.1191, 4);
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
    }
}
