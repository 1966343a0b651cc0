use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const EARTH_RADIUS_KM: f64 = 6371.0;
pub const DEFAULT_CINEMA_COUNT: usize = 10;
/// Mock entries land within ±half of this many degrees of the origin on each axis.
const MOCK_SPREAD_DEG: f64 = 0.05;

const CINEMA_CHAINS: [&str; 10] = [
    "Cinemark",
    "AMC",
    "Regal",
    "Cinépolis",
    "UCI Cinemas",
    "Kinoplex",
    "Moviecom",
    "Cinesystem",
    "GNC Cinemas",
    "Cineart",
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, LocationError> {
        if !latitude.is_finite() || !longitude.is_finite() {
            return Err(LocationError::Unavailable(
                "coordinates must be finite".to_string(),
            ));
        }
        if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
            return Err(LocationError::Unavailable(format!(
                "coordinates out of range: {latitude}, {longitude}"
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }
}

/// Great-circle distance in kilometres.
pub fn haversine_km(a: Coordinates, b: Coordinates) -> f64 {
    if a == b {
        return 0.0;
    }
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * h.clamp(0.0, 1.0).sqrt().asin();
    EARTH_RADIUS_KM * c
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CinemaEntry {
    pub id: u32,
    pub name: String,
    pub address: String,
    pub distance_km: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub phone: String,
    pub rating: f64,
}

/// Demo cinemas scattered around `origin`, nearest first.
pub fn generate_mock_cinemas<R: Rng + ?Sized>(
    origin: Coordinates,
    count: usize,
    rng: &mut R,
) -> Vec<CinemaEntry> {
    let mut cinemas: Vec<CinemaEntry> = (0..count)
        .map(|index| {
            let chain = CINEMA_CHAINS[index % CINEMA_CHAINS.len()];
            let n = index as u32 + 1;
            let latitude = origin.latitude + (rng.gen::<f64>() - 0.5) * MOCK_SPREAD_DEG;
            let longitude = origin.longitude + (rng.gen::<f64>() - 0.5) * MOCK_SPREAD_DEG;
            let distance_km = haversine_km(
                origin,
                Coordinates {
                    latitude,
                    longitude,
                },
            );
            let rating = ((3.5 + rng.gen::<f64>() * 1.5) * 10.0).round() / 10.0;

            CinemaEntry {
                id: n,
                name: format!("{chain} - Shopping Center {n}"),
                address: format!("{} Main Street, Downtown", 1000 + index * 100),
                distance_km,
                latitude,
                longitude,
                phone: format!("(555) {}-{}", 100 + index, 1000 + index),
                rating,
            }
        })
        .collect();
    cinemas.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
    cinemas
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocationError {
    #[error("Permission to access location was denied")]
    PermissionDenied,

    #[error("Location unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Granted,
    Denied,
}

#[async_trait]
pub trait LocationProvider: Send + Sync {
    async fn request_permission(&self) -> Permission;
    async fn current_position(&self) -> Result<Coordinates, LocationError>;
}

/// A reading the shell already took on the device (or its refusal).
#[derive(Debug, Clone, Copy)]
pub enum ReportedLocation {
    Position(Coordinates),
    Denied,
}

#[async_trait]
impl LocationProvider for ReportedLocation {
    async fn request_permission(&self) -> Permission {
        match self {
            ReportedLocation::Position(_) => Permission::Granted,
            ReportedLocation::Denied => Permission::Denied,
        }
    }

    async fn current_position(&self) -> Result<Coordinates, LocationError> {
        match self {
            ReportedLocation::Position(c) => Ok(*c),
            ReportedLocation::Denied => Err(LocationError::PermissionDenied),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NearbyCinemas {
    pub origin: Coordinates,
    pub cinemas: Vec<CinemaEntry>,
}

/// Asks for permission before touching the position; a refusal is reported
/// as [`LocationError::PermissionDenied`], never as a lookup failure.
pub async fn find_nearby<R: Rng + ?Sized>(
    provider: &dyn LocationProvider,
    count: usize,
    rng: &mut R,
) -> Result<NearbyCinemas, LocationError> {
    if provider.request_permission().await == Permission::Denied {
        return Err(LocationError::PermissionDenied);
    }
    let origin = provider.current_position().await?;
    let cinemas = generate_mock_cinemas(origin, count, rng);
    info!(
        "Generated {} cinemas around {:.4}, {:.4}",
        cinemas.len(),
        origin.latitude,
        origin.longitude
    );
    Ok(NearbyCinemas { origin, cinemas })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn at(latitude: f64, longitude: f64) -> Coordinates {
        Coordinates::new(latitude, longitude).unwrap()
    }

    #[test]
    fn same_point_is_zero() {
        let p = at(-23.5505, -46.6333);
        assert_eq!(haversine_km(p, p), 0.0);
    }

    #[test]
    fn london_to_paris() {
        let d = haversine_km(at(51.5074, -0.1278), at(48.8566, 2.3522));
        assert!((d - 343.5).abs() < 10.0, "got {d}");
    }

    #[test]
    fn antipodes_are_half_the_circumference() {
        let d = haversine_km(at(0.0, 0.0), at(0.0, 180.0));
        assert!((d - std::f64::consts::PI * EARTH_RADIUS_KM).abs() < 1.0);
    }

    #[test]
    fn rejects_invalid_coordinates() {
        assert!(Coordinates::new(91.0, 0.0).is_err());
        assert!(Coordinates::new(0.0, -181.0).is_err());
        assert!(Coordinates::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn mock_cinemas_are_sorted_and_in_range() {
        let origin = at(40.7128, -74.0060);
        let mut rng = StdRng::seed_from_u64(7);
        let cinemas = generate_mock_cinemas(origin, DEFAULT_CINEMA_COUNT, &mut rng);

        assert_eq!(cinemas.len(), 10);
        assert!(cinemas
            .windows(2)
            .all(|w| w[0].distance_km <= w[1].distance_km));
        for c in &cinemas {
            assert!((3.5..=5.0).contains(&c.rating), "rating {}", c.rating);
            assert!((c.latitude - origin.latitude).abs() <= 0.025 + 1e-9);
            assert!((c.longitude - origin.longitude).abs() <= 0.025 + 1e-9);
            assert!(c.distance_km >= 0.0 && c.distance_km < 4.0);
        }
        let mut ids: Vec<u32> = cinemas.iter().map(|c| c.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn mock_cinema_fields_follow_index() {
        let mut rng = StdRng::seed_from_u64(1);
        let cinemas = generate_mock_cinemas(at(0.0, 0.0), 12, &mut rng);
        let third = cinemas.iter().find(|c| c.id == 3).unwrap();
        assert_eq!(third.name, "Regal - Shopping Center 3");
        assert_eq!(third.address, "1200 Main Street, Downtown");
        assert_eq!(third.phone, "(555) 102-1002");
        let eleventh = cinemas.iter().find(|c| c.id == 11).unwrap();
        assert!(eleventh.name.starts_with("Cinemark - "));
    }

    #[test]
    fn same_seed_same_cinemas() {
        let origin = at(48.1351, 11.5820);
        let a = generate_mock_cinemas(origin, 5, &mut StdRng::seed_from_u64(42));
        let b = generate_mock_cinemas(origin, 5, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn denied_permission_is_distinct() {
        let mut rng = StdRng::seed_from_u64(3);
        let err = find_nearby(&ReportedLocation::Denied, 5, &mut rng)
            .await
            .unwrap_err();
        assert_eq!(err, LocationError::PermissionDenied);
    }

    #[tokio::test]
    async fn position_failure_is_not_permission_denied() {
        struct Broken;

        #[async_trait]
        impl LocationProvider for Broken {
            async fn request_permission(&self) -> Permission {
                Permission::Granted
            }
            async fn current_position(&self) -> Result<Coordinates, LocationError> {
                Err(LocationError::Unavailable("gps timeout".to_string()))
            }
        }

        let mut rng = StdRng::seed_from_u64(3);
        let err = find_nearby(&Broken, 5, &mut rng).await.unwrap_err();
        assert_eq!(err, LocationError::Unavailable("gps timeout".to_string()));
    }

    #[tokio::test]
    async fn finds_nearby_for_reported_position() {
        let origin = at(-22.9068, -43.1729);
        let mut rng = StdRng::seed_from_u64(9);
        let nearby = find_nearby(&ReportedLocation::Position(origin), 4, &mut rng)
            .await
            .unwrap();
        assert_eq!(nearby.origin, origin);
        assert_eq!(nearby.cinemas.len(), 4);
    }

    proptest! {
        #[test]
        fn haversine_is_symmetric(
            lat1 in -90.0f64..=90.0, lon1 in -180.0f64..=180.0,
            lat2 in -90.0f64..=90.0, lon2 in -180.0f64..=180.0,
        ) {
            let a = at(lat1, lon1);
            let b = at(lat2, lon2);
            let ab = haversine_km(a, b);
            let ba = haversine_km(b, a);
            prop_assert!(ab >= 0.0);
            prop_assert!((ab - ba).abs() < 1e-9);
            prop_assert_eq!(haversine_km(a, a), 0.0);
        }
    }
}
