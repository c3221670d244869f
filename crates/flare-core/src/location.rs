//! Validated geographic fixes.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::LocationError;

/// A validated, timestamped geographic fix.
///
/// Value object: construction validates every numeric field, and a
/// constructed record never changes. The client timestamp is wall-clock time
/// as reported by the device and is opaque to the server beyond the
/// per-participant monotonicity guard; staleness is judged against
/// `observed_at`, the monotonic time of ingest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationRecord {
    latitude: f64,
    longitude: f64,
    accuracy_m: f64,
    client_timestamp: DateTime<Utc>,
    observed_at: Instant,
    speed_mps: Option<f64>,
    heading_deg: Option<f64>,
    altitude_m: Option<f64>,
}

fn finite(field: &'static str, value: f64) -> Result<f64, LocationError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(LocationError::NonFinite { field, value })
    }
}

impl LocationRecord {
    /// Construct a record from a raw fix, stamping the ingest time.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError`] if any field is non-finite, latitude is
    /// outside `[-90, 90]`, longitude is outside `[-180, 180]`, or accuracy
    /// is negative. The boundary values themselves are accepted.
    pub fn new(
        latitude: f64,
        longitude: f64,
        accuracy_m: f64,
        client_timestamp: DateTime<Utc>,
    ) -> Result<Self, LocationError> {
        let latitude = finite("latitude", latitude)?;
        let longitude = finite("longitude", longitude)?;
        let accuracy_m = finite("accuracy", accuracy_m)?;

        if !(-90.0..=90.0).contains(&latitude) {
            return Err(LocationError::LatitudeOutOfRange(latitude));
        }
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(LocationError::LongitudeOutOfRange(longitude));
        }
        if accuracy_m < 0.0 {
            return Err(LocationError::NegativeAccuracy(accuracy_m));
        }

        Ok(Self {
            latitude,
            longitude,
            accuracy_m,
            client_timestamp,
            observed_at: Instant::now(),
            speed_mps: None,
            heading_deg: None,
            altitude_m: None,
        })
    }

    /// Attach optional motion fields to the fix.
    ///
    /// # Errors
    ///
    /// Returns [`LocationError::NonFinite`] if any present value is NaN or
    /// infinite.
    pub fn with_motion(
        mut self,
        speed_mps: Option<f64>,
        heading_deg: Option<f64>,
        altitude_m: Option<f64>,
    ) -> Result<Self, LocationError> {
        self.speed_mps = speed_mps.map(|v| finite("speed", v)).transpose()?;
        self.heading_deg = heading_deg.map(|v| finite("heading", v)).transpose()?;
        self.altitude_m = altitude_m.map(|v| finite("altitude", v)).transpose()?;
        Ok(self)
    }

    /// Latitude in decimal degrees.
    #[must_use]
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    /// Longitude in decimal degrees.
    #[must_use]
    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Horizontal accuracy in meters.
    #[must_use]
    pub fn accuracy_m(&self) -> f64 {
        self.accuracy_m
    }

    /// Wall-clock timestamp reported by the client.
    #[must_use]
    pub fn client_timestamp(&self) -> DateTime<Utc> {
        self.client_timestamp
    }

    /// Monotonic time at which the server ingested the fix.
    #[must_use]
    pub fn observed_at(&self) -> Instant {
        self.observed_at
    }

    /// Speed over ground in meters per second, if reported.
    #[must_use]
    pub fn speed_mps(&self) -> Option<f64> {
        self.speed_mps
    }

    /// Heading in degrees clockwise from true north, if reported.
    #[must_use]
    pub fn heading_deg(&self) -> Option<f64> {
        self.heading_deg
    }

    /// Altitude in meters above the reference ellipsoid, if reported.
    #[must_use]
    pub fn altitude_m(&self) -> Option<f64> {
        self.altitude_m
    }

    /// Time elapsed since the server ingested the fix.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.observed_at.elapsed()
    }

    /// Whether the fix is older than the given TTL.
    ///
    /// Stale records are excluded from initial snapshots and eligible for
    /// garbage collection.
    #[must_use]
    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.age() > ttl
    }
}
