//! Altitude resolution
//!
//! The remote endpoint sanity-checks reported altitudes, so every visit
//! carries a plausible one. Known values are cached per rounded point;
//! misses go to an external elevation service when configured, and fall
//! back to a random value inside the configured band otherwise.

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AltitudeConfig;
use crate::geo::{round_coords, Point};

#[derive(Debug, thiserror::Error)]
pub enum AltitudeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("elevation service returned no result")]
    Empty,
}

/// External elevation lookup.
#[async_trait]
pub trait AltitudeProvider: Send + Sync {
    async fn fetch(&self, point: Point) -> Result<f64, AltitudeError>;
}

/// HTTP client for an open-elevation style lookup endpoint.
pub struct ElevationClient {
    http: reqwest::Client,
    url: String,
}

impl ElevationClient {
    pub fn new(url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            http,
            url: url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct ElevationResult {
    elevation: f64,
}

#[derive(Debug, serde::Deserialize)]
struct ElevationResponse {
    results: Vec<ElevationResult>,
}

#[async_trait]
impl AltitudeProvider for ElevationClient {
    async fn fetch(&self, point: Point) -> Result<f64, AltitudeError> {
        let resp = self
            .http
            .get(&self.url)
            .query(&[("locations", format!("{:.6},{:.6}", point.0, point.1))])
            .send()
            .await?
            .error_for_status()?;
        let body: ElevationResponse = resp.json().await?;
        body.results
            .first()
            .map(|r| r.elevation)
            .ok_or(AltitudeError::Empty)
    }
}

/// Shared altitude cache keyed by rounded point.
#[derive(Debug)]
pub struct AltitudeCache {
    store: DashMap<(i64, i64), f64>,
    fallback: (f64, f64),
}

impl AltitudeCache {
    pub fn new(config: &AltitudeConfig) -> Self {
        Self {
            store: DashMap::new(),
            fallback: (config.fallback_min, config.fallback_max),
        }
    }

    pub fn get(&self, point: Point) -> Option<f64> {
        self.store.get(&round_coords(point, 3)).map(|v| *v)
    }

    pub fn insert(&self, point: Point, altitude: f64) {
        self.store.insert(round_coords(point, 3), altitude);
    }

    /// Resolve an altitude for a point: cache, then provider, then the
    /// random fallback band. Provider failures are logged and fall
    /// through; a visit never fails on altitude lookup.
    pub async fn resolve(&self, point: Point, provider: Option<&dyn AltitudeProvider>) -> f64 {
        if let Some(cached) = self.get(point) {
            return cached;
        }
        if let Some(provider) = provider {
            match provider.fetch(point).await {
                Ok(altitude) => {
                    debug!(lat = point.0, lon = point.1, altitude, "Fetched altitude");
                    self.insert(point, altitude);
                    return altitude;
                }
                Err(e) => {
                    warn!(error = %e, "Altitude lookup failed, using fallback");
                }
            }
        }
        let altitude = rand::thread_rng().gen_range(self.fallback.0..=self.fallback.1);
        self.insert(point, altitude);
        altitude
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_rounds_nearby_points_together() {
        let cache = AltitudeCache::new(&AltitudeConfig::default());
        cache.insert((40.7128, -74.0060), 17.0);
        assert_eq!(cache.get((40.71284, -74.00603)), Some(17.0));
        assert_eq!(cache.get((40.72, -74.0060)), None);
    }

    #[test]
    fn fallback_stays_in_band() {
        let config = AltitudeConfig {
            url: None,
            fallback_min: 100.0,
            fallback_max: 110.0,
        };
        let cache = AltitudeCache::new(&config);
        let altitude = tokio_test::block_on(cache.resolve((1.0, 2.0), None));
        assert!((100.0..=110.0).contains(&altitude));
        // second resolve hits the cache and returns the same value
        let again = tokio_test::block_on(cache.resolve((1.0, 2.0), None));
        assert!((altitude - again).abs() < f64::EPSILON);
    }
}
