use serde::{Deserialize, Serialize};

use crate::error::InfrastructureError;

/// Geographic position of a node or a client, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GeoCoordinates {
    pub latitude: f64,
    pub longitude: f64,
}

const EARTH_RADIUS_KM: f64 = 6371.0;

impl GeoCoordinates {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, InfrastructureError> {
        let coordinates = GeoCoordinates { latitude, longitude };
        coordinates.validate()?;
        Ok(coordinates)
    }

    /// Latitude must lie in [-90, 90], longitude in [-180, 180], both
    /// inclusive.
    pub fn validate(&self) -> Result<(), InfrastructureError> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(InfrastructureError::LatitudeOutOfRange(self.latitude));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(InfrastructureError::LongitudeOutOfRange(self.longitude));
        }
        Ok(())
    }

    /// Great-circle distance to `other` (haversine).
    pub fn distance_km(&self, other: &GeoCoordinates) -> f64 {
        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = (other.latitude - self.latitude).to_radians();
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_values_are_valid() {
        assert!(GeoCoordinates::new(90.0, 180.0).is_ok());
        assert!(GeoCoordinates::new(-90.0, -180.0).is_ok());
    }

    #[test]
    fn out_of_range_rejected() {
        assert!(matches!(
            GeoCoordinates::new(90.0001, 0.0),
            Err(InfrastructureError::LatitudeOutOfRange(_))
        ));
        assert!(matches!(
            GeoCoordinates::new(0.0, -180.0001),
            Err(InfrastructureError::LongitudeOutOfRange(_))
        ));
    }

    #[test]
    fn distance_is_symmetric_and_zero_on_self() {
        let rome = GeoCoordinates { latitude: 41.9, longitude: 12.5 };
        let oslo = GeoCoordinates { latitude: 59.9, longitude: 10.7 };
        assert!(rome.distance_km(&rome) < 1e-9);
        let d1 = rome.distance_km(&oslo);
        let d2 = oslo.distance_km(&rome);
        assert!((d1 - d2).abs() < 1e-9);
        // Rome-Oslo is right around 2000 km.
        assert!(d1 > 1900.0 && d1 < 2100.0, "got {}", d1);
    }
}
