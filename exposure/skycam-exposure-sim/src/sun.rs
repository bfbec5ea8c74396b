//! Approximate solar elevation from declination and hour angle.

use chrono::{DateTime, Datelike, Timelike, Utc};
use skycam_ci::SunElevation;

/// Sun position for a fixed site. Good to a degree or so, which is plenty
/// for choosing a solar period.
#[derive(Debug, Clone, Copy)]
pub struct SolarPosition {
    latitude_deg: f64,
    longitude_deg: f64,
}

impl SolarPosition {
    pub fn new(latitude_deg: f64, longitude_deg: f64) -> Self {
        Self {
            latitude_deg,
            longitude_deg,
        }
    }

    pub fn elevation(&self, timestamp: DateTime<Utc>) -> f64 {
        let day = timestamp.ordinal() as f64;
        let declination = -23.44_f64.to_radians() * (360.0 / 365.0 * (day + 10.0)).to_radians().cos();

        // equation of time, minutes
        let b = (360.0 / 365.0 * (day - 81.0)).to_radians();
        let eot = 9.87 * (2.0 * b).sin() - 7.53 * b.cos() - 1.5 * b.sin();

        let utc_hours = timestamp.num_seconds_from_midnight() as f64 / 3600.0;
        let solar_time = utc_hours + self.longitude_deg / 15.0 + eot / 60.0;
        let hour_angle = (15.0 * (solar_time - 12.0)).to_radians();

        let lat = self.latitude_deg.to_radians();
        let sin_elev =
            lat.sin() * declination.sin() + lat.cos() * declination.cos() * hour_angle.cos();
        sin_elev.clamp(-1.0, 1.0).asin().to_degrees()
    }
}

impl SunElevation for SolarPosition {
    fn elevation_degrees(&self, timestamp: DateTime<Utc>) -> Option<f64> {
        Some(self.elevation(timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn equator_at_equinox() {
        let sun = SolarPosition::new(0.0, 0.0);
        assert!(sun.elevation(at("2025-03-20T12:00:00Z")) > 85.0);
        assert!(sun.elevation(at("2025-03-20T00:00:00Z")) < -80.0);
        let morning = sun.elevation(at("2025-03-20T06:10:00Z"));
        assert!(morning.abs() < 3.0, "{morning}");
    }

    #[test]
    fn polar_night_and_midnight_sun() {
        // Tromsø
        let sun = SolarPosition::new(69.65, 18.96);
        for hour in 0..24 {
            let ts = at("2025-12-21T00:00:00Z") + chrono::Duration::hours(hour);
            assert!(sun.elevation(ts) < 0.0, "hour {hour}");
            let ts = at("2025-06-21T00:00:00Z") + chrono::Duration::hours(hour);
            assert!(sun.elevation(ts) > 0.0, "hour {hour}");
        }
    }
}
