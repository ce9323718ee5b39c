//! Geographic coordinates and great-circle distance.
//!
//! Distance is only ever used as a comparison key when ranking candidate
//! servers, so relative ordering matters more than absolute precision.

use crate::errors::SpeedTestError;
use serde::Serialize;

/// Mean Earth radius in kilometers.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// A validated latitude/longitude pair.
///
/// Construction rejects out-of-range coordinates, so every `Location`
/// in circulation is valid and [`Location::distance_km`] is infallible.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    /// Create a location, rejecting coordinates outside
    /// [-90, 90] latitude or [-180, 180] longitude.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, SpeedTestError> {
        if !(-90.0..=90.0).contains(&latitude)
            || !(-180.0..=180.0).contains(&longitude)
        {
            return Err(SpeedTestError::InvalidLocation { latitude, longitude });
        }

        Ok(Self { latitude, longitude })
    }

    /// Great-circle distance to `other` in kilometers, via the
    /// haversine formula.
    pub fn distance_km(&self, other: &Location) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

        EARTH_RADIUS_KM * c
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_distance_to_self_is_zero() {
        let here = Location::new(37.77, -122.42).unwrap();
        assert!(here.distance_km(&here).abs() < 1e-9);
    }

    #[test]
    fn test_quarter_great_circle() {
        let a = Location::new(0.0, 0.0).unwrap();
        let b = Location::new(0.0, 90.0).unwrap();
        // Earth radius 6371 km * pi/2
        let expected = 6371.0 * std::f64::consts::FRAC_PI_2;
        assert!((a.distance_km(&b) - expected).abs() < 0.1);
        assert!((a.distance_km(&b) - 10007.5).abs() < 0.5);
    }

    #[test]
    fn test_known_city_pair() {
        // London <-> New York, roughly 5570 km.
        let london = Location::new(51.5074, -0.1278).unwrap();
        let new_york = Location::new(40.7128, -74.0060).unwrap();
        let distance = london.distance_km(&new_york);
        assert!(distance > 5500.0 && distance < 5650.0);
    }

    #[test]
    fn test_rejects_out_of_range_latitude() {
        assert!(Location::new(90.1, 0.0).is_err());
        assert!(Location::new(-91.0, 0.0).is_err());
    }

    #[test]
    fn test_rejects_out_of_range_longitude() {
        assert!(Location::new(0.0, 180.5).is_err());
        assert!(Location::new(0.0, -200.0).is_err());
    }

    #[test]
    fn test_boundary_coordinates_are_valid() {
        assert!(Location::new(90.0, 180.0).is_ok());
        assert!(Location::new(-90.0, -180.0).is_ok());
    }

    proptest! {
        #[test]
        fn prop_distance_is_symmetric(
            lat1 in -90.0f64..=90.0,
            lon1 in -180.0f64..=180.0,
            lat2 in -90.0f64..=90.0,
            lon2 in -180.0f64..=180.0,
        ) {
            let a = Location::new(lat1, lon1).unwrap();
            let b = Location::new(lat2, lon2).unwrap();
            prop_assert!((a.distance_km(&b) - b.distance_km(&a)).abs() < 1e-6);
        }

        #[test]
        fn prop_distance_is_non_negative_and_bounded(
            lat1 in -90.0f64..=90.0,
            lon1 in -180.0f64..=180.0,
            lat2 in -90.0f64..=90.0,
            lon2 in -180.0f64..=180.0,
        ) {
            let a = Location::new(lat1, lon1).unwrap();
            let b = Location::new(lat2, lon2).unwrap();
            let d = a.distance_km(&b);
            // No two points on the sphere are further apart than half
            // the circumference.
            prop_assert!(d >= 0.0);
            prop_assert!(d <= 6371.0 * std::f64::consts::PI + 1e-6);
        }
    }
}
