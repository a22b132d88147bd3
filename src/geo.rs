//! Geospatial value types and distance math.
//!
//! Distances are always computed and stored in meters; `DistanceUnit` handles
//! conversion at the API boundary. Bounds that cross the antimeridian
//! (west > east) are treated as two longitude ranges throughout.

use serde::{Deserialize, Serialize};

/// Mean Earth radius in meters (IUGG).
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude for the planar approximation.
const METERS_PER_DEGREE: f64 = 111_120.0;

/// A WGS84 point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub lat: f64,
    pub lng: f64,
}

impl Point {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Whether latitude/longitude are within their valid ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Great-circle distance to `other` in meters (Haversine).
    pub fn haversine_distance(&self, other: &Point) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlng = (other.lng - self.lng).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
        EARTH_RADIUS_M * c
    }

    /// Flat-earth distance in meters: degree lengths scaled by the latitude
    /// cosine. Cheaper than Haversine and close enough below ~100 km.
    pub fn planar_distance(&self, other: &Point) -> f64 {
        let mean_lat = ((self.lat + other.lat) / 2.0).to_radians();
        let dy = (other.lat - self.lat) * METERS_PER_DEGREE;
        let dx = (other.lng - self.lng) * METERS_PER_DEGREE * mean_lat.cos();
        (dx * dx + dy * dy).sqrt()
    }

    /// Initial bearing toward `other` in degrees, 0..360 clockwise from north.
    pub fn bearing_to(&self, other: &Point) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlng = (other.lng - self.lng).to_radians();

        let y = dlng.sin() * lat2.cos();
        let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlng.cos();
        (y.atan2(x).to_degrees() + 360.0) % 360.0
    }

    /// Bounding box containing every point within `radius_m` meters.
    ///
    /// Latitude is clamped at the poles. When the box spills over the
    /// antimeridian the returned bounds have west > east; near the poles the
    /// longitude span degenerates to the full -180..180 range.
    pub fn bounding_box(&self, radius_m: f64) -> Bounds {
        let dlat = radius_m / METERS_PER_DEGREE;
        let north = (self.lat + dlat).min(90.0);
        let south = (self.lat - dlat).max(-90.0);

        let cos_lat = self.lat.to_radians().cos();
        if cos_lat.abs() < 1e-6 {
            return Bounds { north, south, east: 180.0, west: -180.0 };
        }

        let dlng = radius_m / (METERS_PER_DEGREE * cos_lat);
        if dlng >= 180.0 {
            return Bounds { north, south, east: 180.0, west: -180.0 };
        }

        Bounds {
            north,
            south,
            east: wrap_lng(self.lng + dlng),
            west: wrap_lng(self.lng - dlng),
        }
    }
}

/// Wrap a longitude into -180..=180.
fn wrap_lng(lng: f64) -> f64 {
    let mut l = (lng + 180.0) % 360.0;
    if l < 0.0 {
        l += 360.0;
    }
    l - 180.0
}

/// 16-wind compass cardinal for a bearing in degrees.
pub fn bearing_cardinal(bearing: f64) -> &'static str {
    const WINDS: [&str; 16] = [
        "N", "NNE", "NE", "ENE", "E", "ESE", "SE", "SSE", "S", "SSW", "SW", "WSW", "W", "WNW",
        "NW", "NNW",
    ];
    let normalized = ((bearing % 360.0) + 360.0) % 360.0;
    let idx = ((normalized / 22.5) + 0.5) as usize % 16;
    WINDS[idx]
}

/// An axis-aligned geographic bounding box. `west > east` means the box
/// crosses the antimeridian and covers two longitude ranges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Bounds {
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Self {
        Self { north, south, east, west }
    }

    pub fn crosses_antimeridian(&self) -> bool {
        self.west > self.east
    }

    pub fn contains(&self, point: &Point) -> bool {
        if point.lat < self.south || point.lat > self.north {
            return false;
        }
        if self.crosses_antimeridian() {
            point.lng >= self.west || point.lng <= self.east
        } else {
            point.lng >= self.west && point.lng <= self.east
        }
    }

    /// Whether two boxes overlap, honoring the antimeridian split on either.
    pub fn intersects(&self, other: &Bounds) -> bool {
        if self.south > other.north || self.north < other.south {
            return false;
        }
        lng_ranges(self)
            .iter()
            .any(|a| lng_ranges(other).iter().any(|b| a.0 <= b.1 && b.0 <= a.1))
    }

    /// Center of the box; for dateline-crossing boxes the center longitude is
    /// wrapped back into range.
    pub fn center(&self) -> Point {
        let lat = (self.north + self.south) / 2.0;
        let lng = if self.crosses_antimeridian() {
            wrap_lng((self.west + self.east + 360.0) / 2.0)
        } else {
            (self.west + self.east) / 2.0
        };
        Point::new(lat, lng)
    }
}

/// Longitude ranges covered by a bounds: one normally, two across the seam.
fn lng_ranges(b: &Bounds) -> Vec<(f64, f64)> {
    if b.crosses_antimeridian() {
        vec![(b.west, 180.0), (-180.0, b.east)]
    } else {
        vec![(b.west, b.east)]
    }
}

/// Unit used for caller-facing distances. Internally everything is meters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceUnit {
    #[default]
    #[serde(alias = "meters")]
    M,
    #[serde(alias = "kilometers")]
    Km,
    #[serde(alias = "miles")]
    Mi,
}

impl DistanceUnit {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "m" | "meters" => Some(Self::M),
            "km" | "kilometers" => Some(Self::Km),
            "mi" | "miles" => Some(Self::Mi),
            _ => None,
        }
    }

    pub fn to_meters(&self, value: f64) -> f64 {
        match self {
            Self::M => value,
            Self::Km => value * 1000.0,
            Self::Mi => value * 1609.344,
        }
    }

    pub fn from_meters(&self, meters: f64) -> f64 {
        match self {
            Self::M => meters,
            Self::Km => meters / 1000.0,
            Self::Mi => meters / 1609.344,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_known_distance() {
        // Portland -> Seattle, roughly 233 km
        let portland = Point::new(45.5152, -122.6784);
        let seattle = Point::new(47.6062, -122.3321);
        let d = portland.haversine_distance(&seattle);
        assert!((d - 233_000.0).abs() < 5_000.0, "got {}", d);
    }

    #[test]
    fn test_haversine_zero_for_same_point() {
        let p = Point::new(10.0, 20.0);
        assert_eq!(p.haversine_distance(&p), 0.0);
    }

    #[test]
    fn test_planar_close_to_haversine_at_short_range() {
        let a = Point::new(45.5152, -122.6784);
        let b = Point::new(45.5231, -122.6765);
        let h = a.haversine_distance(&b);
        let p = a.planar_distance(&b);
        assert!((h - p).abs() / h < 0.01, "haversine {} planar {}", h, p);
    }

    #[test]
    fn test_bearing_cardinal_points() {
        let origin = Point::new(0.0, 0.0);
        assert!((origin.bearing_to(&Point::new(1.0, 0.0)) - 0.0).abs() < 0.1);
        assert!((origin.bearing_to(&Point::new(0.0, 1.0)) - 90.0).abs() < 0.1);
        assert!((origin.bearing_to(&Point::new(-1.0, 0.0)) - 180.0).abs() < 0.1);
        assert!((origin.bearing_to(&Point::new(0.0, -1.0)) - 270.0).abs() < 0.1);
    }

    #[test]
    fn test_bearing_cardinal_names() {
        assert_eq!(bearing_cardinal(0.0), "N");
        assert_eq!(bearing_cardinal(45.0), "NE");
        assert_eq!(bearing_cardinal(90.0), "E");
        assert_eq!(bearing_cardinal(180.0), "S");
        assert_eq!(bearing_cardinal(270.0), "W");
        assert_eq!(bearing_cardinal(359.0), "N");
    }

    #[test]
    fn test_bounding_box_contains_radius() {
        let center = Point::new(45.5152, -122.6784);
        let bbox = center.bounding_box(5_000.0);
        // A point 3 km north must be inside
        let north = Point::new(45.5152 + 3_000.0 / 111_120.0, -122.6784);
        assert!(bbox.contains(&north));
        assert!(bbox.north > bbox.south);
    }

    #[test]
    fn test_bounding_box_wraps_dateline() {
        let center = Point::new(0.0, 179.9);
        let bbox = center.bounding_box(50_000.0);
        assert!(bbox.crosses_antimeridian(), "bbox {:?}", bbox);
        assert!(bbox.contains(&Point::new(0.0, -179.9)));
        assert!(bbox.contains(&Point::new(0.0, 179.8)));
        assert!(!bbox.contains(&Point::new(0.0, 0.0)));
    }

    #[test]
    fn test_bounding_box_near_pole_spans_all_longitudes() {
        let bbox = Point::new(89.9, 0.0).bounding_box(100_000.0);
        assert!(bbox.contains(&Point::new(89.95, 179.0)));
        assert!(bbox.contains(&Point::new(89.95, -179.0)));
    }

    #[test]
    fn test_bounds_contains_antimeridian() {
        let b = Bounds::new(10.0, -10.0, -170.0, 170.0);
        assert!(b.contains(&Point::new(0.0, 179.0)));
        assert!(b.contains(&Point::new(0.0, -179.0)));
        assert!(!b.contains(&Point::new(0.0, 0.0)));
        assert!(!b.contains(&Point::new(20.0, 179.0)));
    }

    #[test]
    fn test_bounds_intersects_across_seam() {
        let seam = Bounds::new(10.0, -10.0, -170.0, 170.0);
        let east_side = Bounds::new(5.0, -5.0, -175.0, -180.0);
        let far_away = Bounds::new(5.0, -5.0, 10.0, 0.0);
        assert!(seam.intersects(&east_side));
        assert!(!seam.intersects(&far_away));
    }

    #[test]
    fn test_distance_unit_conversions() {
        assert_eq!(DistanceUnit::Km.to_meters(5.0), 5000.0);
        assert!((DistanceUnit::Mi.to_meters(1.0) - 1609.344).abs() < 1e-9);
        assert_eq!(DistanceUnit::Km.from_meters(2500.0), 2.5);
        assert_eq!(DistanceUnit::parse("KM"), Some(DistanceUnit::Km));
        assert_eq!(DistanceUnit::parse("bogus"), None);
    }
}
