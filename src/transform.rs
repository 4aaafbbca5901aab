//! Mapping of decoded entities onto the indexed document schema.

use crate::hasher::Fingerprinted;
use crate::types::{VehiclePosition, VehiclePositionEntity};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// Document written to the search store, one per novel entity.
///
/// `@timestamp` is when the vehicle reported its position, not when it was
/// ingested; the ingestion time is always in `event.ingested`.
///
/// ```json
/// {
///   "@timestamp": "2024-09-16T15:20:00Z",
///   "id": "1",
///   "isDeleted": false,
///   "hash": "<sha256 hex>",
///   "location": { "lat": 38.9, "lon": -77.03 },
///   "vehicle": { "trip": {...}, "position": {...}, "vehicle": {...}, ... },
///   "event": { "original": "<canonical json>", "ingested": "..." }
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDocument {
    /// Vehicle-reported time, or ingestion time when the feed omits it.
    #[serde(rename = "@timestamp")]
    pub timestamp: String,
    pub id: String,
    pub is_deleted: bool,
    /// Entity fingerprint, also used as the document `_id`.
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    pub vehicle: VehiclePosition,
    pub event: EventFields,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    pub lat: f32,
    pub lon: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventFields {
    /// Canonical JSON of the source entity.
    pub original: String,
    pub ingested: String,
}

/// Build the document for an entity.
pub fn transform(
    entity: VehiclePositionEntity,
    fingerprinted: Fingerprinted,
    ingested_at: DateTime<Utc>,
) -> OutputDocument {
    let ingested = format_timestamp(ingested_at);
    let timestamp = entity
        .vehicle
        .timestamp
        .and_then(format_unix_timestamp)
        .unwrap_or_else(|| ingested.clone());

    OutputDocument {
        timestamp,
        location: geo_point(&entity.vehicle),
        id: entity.id,
        is_deleted: entity.is_deleted,
        hash: fingerprinted.fingerprint.to_hex(),
        vehicle: entity.vehicle,
        event: EventFields {
            original: fingerprinted.canonical,
            ingested,
        },
    }
}

// (0, 0) is what a receiver without a fix reports
fn geo_point(vehicle: &VehiclePosition) -> Option<GeoPoint> {
    let pos = vehicle.position;
    if pos.latitude == 0.0 || pos.longitude == 0.0 {
        return None;
    }
    if !(-90.0..=90.0).contains(&pos.latitude) || !(-180.0..=180.0).contains(&pos.longitude) {
        return None;
    }
    Some(GeoPoint {
        lat: pos.latitude,
        lon: pos.longitude,
    })
}

/// Format POSIX seconds as `2015-01-01T12:10:30Z`.
pub fn format_unix_timestamp(secs: u64) -> Option<String> {
    let secs = i64::try_from(secs).ok()?;
    DateTime::<Utc>::from_timestamp(secs, 0).map(format_timestamp)
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
