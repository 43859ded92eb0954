use crate::models::GeoPoint;

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.latitude.to_radians().cos() * b.latitude.to_radians().cos() * (d_lon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Distance as shown to users and compared against radius filters: one decimal.
pub fn distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
    (haversine_km(a, b) * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const FRANKFURT: GeoPoint = GeoPoint { latitude: 50.1109, longitude: 8.6821 };
    const BERLIN: GeoPoint = GeoPoint { latitude: 52.5200, longitude: 13.4050 };

    #[test]
    fn frankfurt_to_berlin() {
        let d = distance_km(FRANKFURT, BERLIN);
        assert!((400.0..=450.0).contains(&d), "got {d}");
    }

    #[test]
    fn rounds_to_one_decimal() {
        let d = distance_km(FRANKFURT, BERLIN);
        assert_eq!((d * 10.0).round() / 10.0, d);
    }

    fn point() -> impl Strategy<Value = GeoPoint> {
        (-90.0f64..=90.0, -180.0f64..=180.0).prop_map(|(lat, lon)| GeoPoint::new(lat, lon))
    }

    proptest! {
        #[test]
        fn distance_is_symmetric(a in point(), b in point()) {
            prop_assert_eq!(distance_km(a, b), distance_km(b, a));
        }

        #[test]
        fn distance_to_self_is_zero(a in point()) {
            prop_assert_eq!(distance_km(a, a), 0.0);
        }

        #[test]
        fn distance_is_bounded_by_half_circumference(a in point(), b in point()) {
            let d = haversine_km(a, b);
            prop_assert!(d >= 0.0);
            prop_assert!(d <= std::f64::consts::PI * EARTH_RADIUS_KM + 1e-6);
        }
    }
}
