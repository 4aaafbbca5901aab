//! Content fingerprints for vehicle position entities.
//!
//! An entity is rendered to JSON with every object's keys sorted, and the
//! SHA-256 of that string is its fingerprint. The rendering only depends on
//! the entity's values, so the same observation hashes the same in every
//! process, and any field change produces a different hash.

use crate::types::{VehiclePosition, VehiclePositionEntity};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 content hash of an entity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub const LEN: usize = 32;

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Hash an already canonical string.
    pub fn of(canonical: &str) -> Self {
        Self(Sha256::digest(canonical.as_bytes()).into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", &self.to_hex()[..12])
    }
}

/// An entity's canonical JSON together with its fingerprint.
#[derive(Debug, Clone)]
pub struct Fingerprinted {
    pub fingerprint: Fingerprint,
    /// Canonical JSON that was hashed, kept as the document's `event.original`.
    pub canonical: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalEntity<'a> {
    id: &'a str,
    // Unset in the feed means absent, matching the protobuf JSON mapping
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    is_deleted: bool,
    vehicle: &'a VehiclePosition,
}

/// Fingerprint an entity.
pub fn fingerprint(entity: &VehiclePositionEntity) -> Result<Fingerprinted, serde_json::Error> {
    let canonical = canonical_json(entity)?;
    Ok(Fingerprinted {
        fingerprint: Fingerprint::of(&canonical),
        canonical,
    })
}

/// Render the canonical JSON form of an entity.
pub fn canonical_json(entity: &VehiclePositionEntity) -> Result<String, serde_json::Error> {
    // Round-trip through text so f32 fields keep their shortest rendering
    let rendered = serde_json::to_string(&CanonicalEntity {
        id: &entity.id,
        is_deleted: entity.is_deleted,
        vehicle: &entity.vehicle,
    })?;
    let value: Value = serde_json::from_str(&rendered)?;
    serde_json::to_string(&sort_keys(value))
}

// serde_json's map keeps insertion order when `preserve_order` is enabled
// anywhere in the build, so sort explicitly.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::with_capacity(entries.len());
            for (k, v) in entries {
                sorted.insert(k, sort_keys(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Position, VehicleDescriptor, VehicleStopStatus};

    fn entity() -> VehiclePositionEntity {
        VehiclePositionEntity {
            id: "1".into(),
            is_deleted: false,
            vehicle: VehiclePosition {
                trip: None,
                position: Position {
                    latitude: 38.9,
                    longitude: -77.03,
                    bearing: Some(90.0),
                    ..Default::default()
                },
                current_stop_sequence: Some(3),
                current_status: Some(VehicleStopStatus::StoppedAt),
                timestamp: Some(1_726_500_000),
                congestion_level: None,
                stop_id: None,
                vehicle: VehicleDescriptor {
                    id: "7001".into(),
                    ..Default::default()
                },
                occupancy_status: None,
                occupancy_percentage: None,
            },
        }
    }

    #[test]
    fn test_identical_entities_hash_identically() {
        let a = fingerprint(&entity()).unwrap();
        let b = fingerprint(&entity()).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.canonical, b.canonical);
    }

    #[test]
    fn test_any_change_changes_hash() {
        let base = fingerprint(&entity()).unwrap().fingerprint;

        let mut moved = entity();
        moved.vehicle.position.latitude = 38.91;
        assert_ne!(fingerprint(&moved).unwrap().fingerprint, base);

        let mut status = entity();
        status.vehicle.current_status = Some(VehicleStopStatus::InTransitTo);
        assert_ne!(fingerprint(&status).unwrap().fingerprint, base);

        let mut later = entity();
        later.vehicle.timestamp = Some(1_726_500_030);
        assert_ne!(fingerprint(&later).unwrap().fingerprint, base);

        let mut deleted = entity();
        deleted.is_deleted = true;
        assert_ne!(fingerprint(&deleted).unwrap().fingerprint, base);
    }

    #[test]
    fn test_canonical_keys_sorted() {
        let canonical = canonical_json(&entity()).unwrap();
        assert!(canonical.starts_with(r#"{"id":"1","vehicle":{"currentStatus""#));
        let pos = canonical.find("\"position\"").unwrap();
        let veh = canonical.rfind("\"vehicle\"").unwrap();
        assert!(pos < veh);
    }

    #[test]
    fn test_deleted_flag_only_rendered_when_set() {
        let live = canonical_json(&entity()).unwrap();
        assert!(!live.contains("isDeleted"));

        let mut deleted = entity();
        deleted.is_deleted = true;
        let canonical = canonical_json(&deleted).unwrap();
        assert!(canonical.starts_with(r#"{"id":"1","isDeleted":true,"vehicle":"#));
    }

    #[test]
    fn test_hex_rendering() {
        let fp = Fingerprint::of("");
        assert_eq!(
            fp.to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(fp.to_string().len(), 64);
    }
}
