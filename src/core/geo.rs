//! Geographic math - validated coordinates, haversine distance and bounding boxes.
//!
//! Distances are great-circle distances on a sphere of radius 6371 km. The
//! bounding box is only a pre-filter for storage queries; exact filtering always
//! uses [`distance_km`].

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};

/// Mean Earth radius used for all distance calculations
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Kilometres per degree of latitude on the same sphere
const KM_PER_DEGREE: f64 = EARTH_RADIUS_KM * std::f64::consts::PI / 180.0;

/// A validated latitude/longitude pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
}

impl Coordinate {
    /// Builds a coordinate, rejecting values outside `[-90, 90]` x `[-180, 180]`.
    ///
    /// # Errors
    /// Returns [`Error::InvalidCoordinate`] for out-of-range or non-finite input.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self> {
        let valid = latitude.is_finite()
            && longitude.is_finite()
            && (-90.0..=90.0).contains(&latitude)
            && (-180.0..=180.0).contains(&longitude);
        if valid {
            Ok(Self {
                latitude,
                longitude,
            })
        } else {
            Err(Error::InvalidCoordinate {
                latitude,
                longitude,
            })
        }
    }

    /// Latitude in decimal degrees
    #[must_use]
    pub const fn latitude(&self) -> f64 {
        self.latitude
    }

    /// Longitude in decimal degrees
    #[must_use]
    pub const fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Haversine distance to `other` in kilometres
    #[must_use]
    pub fn distance_km(&self, other: &Self) -> f64 {
        distance_km(self, other)
    }
}

/// Great-circle distance between two coordinates in kilometres.
///
/// The longitude delta is normalised into `[-180, 180]` so points on either side
/// of the antimeridian are measured the short way round, and the haversine term
/// is clamped to `[0, 1]` to keep `asin` defined for near-antipodal or polar
/// inputs where rounding can push it slightly out of range.
#[must_use]
pub fn distance_km(a: &Coordinate, b: &Coordinate) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = lat2 - lat1;
    let dlon = normalize_longitude_delta(b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let h = h.clamp(0.0, 1.0);

    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

fn normalize_longitude_delta(delta: f64) -> f64 {
    // +180 maps to -180, which is the same meridian
    (delta + 180.0).rem_euclid(360.0) - 180.0
}

/// An inclusive longitude interval in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LongitudeRange {
    /// Western edge
    pub min: f64,
    /// Eastern edge
    pub max: f64,
}

/// A conservative rectangle around a point that contains every coordinate within
/// a given radius. Used to narrow storage scans before exact distance filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundingBox {
    /// Southern edge
    pub min_latitude: f64,
    /// Northern edge
    pub max_latitude: f64,
    /// Longitude intervals to match; empty means every longitude
    pub longitude_ranges: Vec<LongitudeRange>,
}

impl BoundingBox {
    /// Computes the box around `center` covering `radius_km`.
    ///
    /// When the box reaches a pole every longitude qualifies. When it crosses the
    /// antimeridian the longitude constraint is split into two ranges.
    #[must_use]
    pub fn around(center: &Coordinate, radius_km: f64) -> Self {
        let lat_delta = radius_km / KM_PER_DEGREE;
        let min_latitude = center.latitude - lat_delta;
        let max_latitude = center.latitude + lat_delta;

        if min_latitude <= -90.0 || max_latitude >= 90.0 {
            return Self {
                min_latitude: min_latitude.max(-90.0),
                max_latitude: max_latitude.min(90.0),
                longitude_ranges: Vec::new(),
            };
        }

        // widest point of the box is the edge closest to a pole
        let widest = min_latitude.abs().max(max_latitude.abs()).to_radians();
        let lon_delta = lat_delta / widest.cos();
        if lon_delta >= 180.0 {
            return Self {
                min_latitude,
                max_latitude,
                longitude_ranges: Vec::new(),
            };
        }

        let west = center.longitude - lon_delta;
        let east = center.longitude + lon_delta;
        let longitude_ranges = if west < -180.0 {
            vec![
                LongitudeRange {
                    min: west + 360.0,
                    max: 180.0,
                },
                LongitudeRange {
                    min: -180.0,
                    max: east,
                },
            ]
        } else if east > 180.0 {
            vec![
                LongitudeRange {
                    min: west,
                    max: 180.0,
                },
                LongitudeRange {
                    min: -180.0,
                    max: east - 360.0,
                },
            ]
        } else {
            vec![LongitudeRange {
                min: west,
                max: east,
            }]
        };

        Self {
            min_latitude,
            max_latitude,
            longitude_ranges,
        }
    }

    /// Whether the coordinate falls inside the box
    #[must_use]
    pub fn contains(&self, point: &Coordinate) -> bool {
        let lat_ok = (self.min_latitude..=self.max_latitude).contains(&point.latitude);
        let lon_ok = self.longitude_ranges.is_empty()
            || self
                .longitude_ranges
                .iter()
                .any(|range| (range.min..=range.max).contains(&point.longitude));
        lat_ok && lon_ok
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn coord(lat: f64, lon: f64) -> Coordinate {
        Coordinate::new(lat, lon).unwrap()
    }

    #[test]
    fn test_coordinate_validation() {
        assert!(Coordinate::new(90.0, 180.0).is_ok());
        assert!(Coordinate::new(-90.0, -180.0).is_ok());
        assert!(matches!(
            Coordinate::new(90.5, 0.0),
            Err(Error::InvalidCoordinate { .. })
        ));
        assert!(matches!(
            Coordinate::new(0.0, -180.1),
            Err(Error::InvalidCoordinate { .. })
        ));
        assert!(Coordinate::new(f64::NAN, 0.0).is_err());
        assert!(Coordinate::new(0.0, f64::INFINITY).is_err());
    }

    #[test]
    fn test_distance_same_point() {
        let p = coord(-1.2921, 36.8219);
        assert!(p.distance_km(&p).abs() < 1e-9);
    }

    #[test]
    fn test_distance_nyc_to_la() {
        let nyc = coord(40.7128, -74.0060);
        let la = coord(34.0522, -118.2437);
        // NYC to LA is ~3944 km
        assert!((nyc.distance_km(&la) - 3944.0).abs() < 10.0);
    }

    #[test]
    fn test_distance_is_symmetric() {
        let a = coord(51.5074, -0.1278);
        let b = coord(48.8566, 2.3522);
        assert!((a.distance_km(&b) - b.distance_km(&a)).abs() < 1e-9);
    }

    #[test]
    fn test_distance_across_antimeridian() {
        let west = coord(0.0, 179.9);
        let east = coord(0.0, -179.9);
        // 0.2 degrees of longitude at the equator
        let expected = 0.2 * KM_PER_DEGREE;
        assert!((west.distance_km(&east) - expected).abs() < 0.01);
    }

    #[test]
    fn test_distance_near_poles() {
        let a = coord(89.999, 0.0);
        let b = coord(89.999, 180.0);
        let d = a.distance_km(&b);
        // 0.002 degrees over the pole
        assert!((d - 0.002 * KM_PER_DEGREE).abs() < 0.01);

        let north = coord(90.0, 0.0);
        let south = coord(-90.0, 0.0);
        let half = north.distance_km(&south);
        assert!((half - std::f64::consts::PI * EARTH_RADIUS_KM).abs() < 1e-6);
        assert!(!half.is_nan());
    }

    #[test]
    fn test_antipodal_points_do_not_produce_nan() {
        let a = coord(0.0, 0.0);
        let b = coord(0.0, 180.0);
        let d = a.distance_km(&b);
        assert!(d.is_finite());
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_KM).abs() < 1e-6);
    }

    #[test]
    fn test_bounding_box_contains_points_within_radius() {
        let center = coord(-1.2921, 36.8219);
        let bbox = BoundingBox::around(&center, 5.0);
        assert_eq!(bbox.longitude_ranges.len(), 1);
        assert!(bbox.contains(&center));
        // ~4.4 km north-east
        assert!(bbox.contains(&coord(-1.2641, 36.8459)));
        // ~55 km away
        assert!(!bbox.contains(&coord(-0.8, 36.8219)));
    }

    #[test]
    fn test_bounding_box_splits_at_antimeridian() {
        let center = coord(10.0, 179.95);
        let bbox = BoundingBox::around(&center, 20.0);
        assert_eq!(bbox.longitude_ranges.len(), 2);
        assert!(bbox.contains(&coord(10.0, -179.95)));
        assert!(bbox.contains(&coord(10.0, 179.9)));
        assert!(!bbox.contains(&coord(10.0, 0.0)));
    }

    #[test]
    fn test_bounding_box_over_pole_has_no_longitude_constraint() {
        let center = coord(89.95, 10.0);
        let bbox = BoundingBox::around(&center, 20.0);
        assert!(bbox.longitude_ranges.is_empty());
        assert!(bbox.contains(&coord(89.95, -170.0)));
    }
}
