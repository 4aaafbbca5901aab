//! GTFS-realtime feed decoder.
//!
//! Turns the raw bytes of one feed snapshot into validated
//! [`VehiclePositionEntity`] values. Only a broken envelope fails the decode;
//! individual entities that cannot be used are reported as skipped so that
//! one bad vehicle never costs the rest of the snapshot.

use crate::gtfs;
use crate::types::{
    CongestionLevel, FeedHeader, Incrementality, OccupancyStatus, Position, ScheduleRelationship,
    TripDescriptor, VehicleDescriptor, VehiclePosition, VehiclePositionEntity, VehicleStopStatus,
};
use prost::Message;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Empty feed payload")]
    Empty,
    #[error("Server returned non-protobuf content: {0}")]
    ServerResponse(String),
    #[error("Protobuf decode failed: {0}")]
    Protobuf(#[from] prost::DecodeError),
}

/// Why an entity was left out of a decoded feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Trip update, alert or other non-vehicle entity.
    NoVehiclePayload,
    MissingPosition,
    MissingVehicleId,
    NonFiniteCoordinates,
    /// The entity itself is not valid protobuf.
    Malformed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoVehiclePayload => "no vehicle payload",
            Self::MissingPosition => "missing position",
            Self::MissingVehicleId => "missing vehicle id",
            Self::NonFiniteCoordinates => "non-finite coordinates",
            Self::Malformed => "malformed entity",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedEntity {
    pub entity_id: String,
    pub reason: SkipReason,
}

/// Result of decoding one snapshot.
#[derive(Debug, Clone)]
pub struct DecodedFeed {
    pub header: FeedHeader,
    /// Usable entities, in feed order.
    pub entities: Vec<VehiclePositionEntity>,
    pub skipped: Vec<SkippedEntity>,
}

/// Decode a feed snapshot.
pub fn decode(data: &[u8]) -> Result<DecodedFeed, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }

    // Error pages come back with a 200 from some operators
    if data.starts_with(b"<!") || data.starts_with(b"<html") || data.starts_with(b"{") {
        let text = String::from_utf8_lossy(&data[..data.len().min(500)]);
        return Err(DecodeError::ServerResponse(text.into_owned()));
    }

    let message = gtfs::RawFeedMessage::decode(data)?;

    let header = FeedHeader {
        gtfs_realtime_version: message.header.gtfs_realtime_version,
        incrementality: message.header.incrementality.map(Incrementality::from),
        timestamp: message.header.timestamp,
    };

    let mut entities = Vec::with_capacity(message.entity.len());
    let mut skipped = Vec::new();

    for (index, raw) in message.entity.iter().enumerate() {
        let entity = match gtfs::FeedEntity::decode(raw.as_slice()) {
            Ok(entity) => entity,
            Err(e) => {
                let entity_id = gtfs::FeedEntityId::decode(raw.as_slice())
                    .ok()
                    .and_then(|e| e.id)
                    .unwrap_or_else(|| format!("#{index}"));
                tracing::debug!("Skipping entity {}: {}", entity_id, e);
                skipped.push(SkippedEntity {
                    entity_id,
                    reason: SkipReason::Malformed,
                });
                continue;
            }
        };

        let entity_id = entity.id.clone();
        match convert_entity(entity) {
            Ok(e) => entities.push(e),
            Err(reason) => {
                tracing::debug!("Skipping entity {}: {}", entity_id, reason);
                skipped.push(SkippedEntity { entity_id, reason });
            }
        }
    }

    Ok(DecodedFeed {
        header,
        entities,
        skipped,
    })
}

fn convert_entity(entity: gtfs::FeedEntity) -> Result<VehiclePositionEntity, SkipReason> {
    let vehicle = entity.vehicle.ok_or(SkipReason::NoVehiclePayload)?;
    let position = vehicle.position.ok_or(SkipReason::MissingPosition)?;

    if !position.latitude.is_finite() || !position.longitude.is_finite() {
        return Err(SkipReason::NonFiniteCoordinates);
    }

    let descriptor = vehicle.vehicle.ok_or(SkipReason::MissingVehicleId)?;
    let vehicle_id = descriptor
        .id
        .filter(|id| !id.is_empty())
        .ok_or(SkipReason::MissingVehicleId)?;

    Ok(VehiclePositionEntity {
        id: entity.id,
        is_deleted: entity.is_deleted.unwrap_or(false),
        vehicle: VehiclePosition {
            trip: vehicle.trip.map(convert_trip),
            position: Position {
                latitude: position.latitude,
                longitude: position.longitude,
                bearing: position.bearing.filter(|b| b.is_finite()),
                odometer: position.odometer.filter(|o| o.is_finite()),
                speed: position.speed.filter(|s| s.is_finite()),
            },
            current_stop_sequence: vehicle.current_stop_sequence,
            current_status: vehicle.current_status.map(VehicleStopStatus::from),
            timestamp: vehicle.timestamp,
            congestion_level: vehicle.congestion_level.map(CongestionLevel::from),
            stop_id: vehicle.stop_id,
            vehicle: VehicleDescriptor {
                id: vehicle_id,
                label: descriptor.label,
                license_plate: descriptor.license_plate,
            },
            occupancy_status: vehicle.occupancy_status.map(OccupancyStatus::from),
            occupancy_percentage: vehicle.occupancy_percentage,
        },
    })
}

fn convert_trip(trip: gtfs::TripDescriptor) -> TripDescriptor {
    TripDescriptor {
        trip_id: trip.trip_id,
        route_id: trip.route_id,
        direction_id: trip.direction_id,
        schedule_relationship: trip.schedule_relationship.map(ScheduleRelationship::from),
        start_date: trip.start_date,
        start_time: trip.start_time,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn wire_entity(id: &str, vehicle_id: &str, lat: f32, lon: f32) -> gtfs::FeedEntity {
        gtfs::FeedEntity {
            id: id.to_string(),
            is_deleted: None,
            vehicle: Some(gtfs::VehiclePosition {
                trip: Some(gtfs::TripDescriptor {
                    trip_id: Some(format!("trip-{vehicle_id}")),
                    route_id: Some("RED".into()),
                    direction_id: Some(0),
                    schedule_relationship: Some(0),
                    start_date: Some("20240916".into()),
                    start_time: None,
                }),
                position: Some(gtfs::Position {
                    latitude: lat,
                    longitude: lon,
                    bearing: Some(180.0),
                    odometer: None,
                    speed: None,
                }),
                current_stop_sequence: Some(4),
                current_status: Some(2),
                timestamp: Some(1_726_500_000),
                congestion_level: None,
                stop_id: Some("A01".into()),
                vehicle: Some(gtfs::VehicleDescriptor {
                    id: Some(vehicle_id.to_string()),
                    label: Some(format!("Car {vehicle_id}")),
                    license_plate: None,
                }),
                occupancy_status: None,
                occupancy_percentage: None,
            }),
        }
    }

    pub(crate) fn encode_feed(entities: Vec<gtfs::FeedEntity>) -> Vec<u8> {
        gtfs::FeedMessage {
            header: gtfs::FeedHeader {
                gtfs_realtime_version: "2.0".into(),
                incrementality: Some(0),
                timestamp: Some(1_726_500_010),
            },
            entity: entities,
        }
        .encode_to_vec()
    }

    #[test]
    fn test_decode_valid_feed() {
        let data = encode_feed(vec![
            wire_entity("1", "7001", 38.9, -77.03),
            wire_entity("2", "7002", 38.8, -77.1),
        ]);

        let feed = decode(&data).unwrap();
        assert_eq!(feed.header.gtfs_realtime_version, "2.0");
        assert_eq!(feed.header.incrementality, Some(Incrementality::FullDataset));
        assert_eq!(feed.entities.len(), 2);
        assert!(feed.skipped.is_empty());

        let first = &feed.entities[0];
        assert_eq!(first.id, "1");
        assert_eq!(first.vehicle_id(), "7001");
        assert_eq!(first.vehicle.current_status, Some(VehicleStopStatus::InTransitTo));
        assert_eq!(
            first.vehicle.trip.as_ref().and_then(|t| t.schedule_relationship),
            Some(ScheduleRelationship::Scheduled)
        );
    }

    #[test]
    fn test_bad_entity_does_not_drop_batch() {
        let mut no_position = wire_entity("2", "7002", 0.0, 0.0);
        if let Some(v) = no_position.vehicle.as_mut() {
            v.position = None;
        }
        let mut no_vehicle_id = wire_entity("3", "7003", 38.0, -77.0);
        if let Some(v) = no_vehicle_id.vehicle.as_mut() {
            v.vehicle = Some(gtfs::VehicleDescriptor::default());
        }
        let alert_only = gtfs::FeedEntity {
            id: "4".into(),
            is_deleted: None,
            vehicle: None,
        };

        let data = encode_feed(vec![
            wire_entity("1", "7001", 38.9, -77.03),
            no_position,
            no_vehicle_id,
            alert_only,
            wire_entity("5", "7005", 38.7, -77.2),
        ]);

        let feed = decode(&data).unwrap();
        let ids: Vec<_> = feed.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["1", "5"]);

        let reasons: Vec<_> = feed.skipped.iter().map(|s| s.reason).collect();
        assert_eq!(
            reasons,
            [
                SkipReason::MissingPosition,
                SkipReason::MissingVehicleId,
                SkipReason::NoVehiclePayload
            ]
        );
    }

    #[test]
    fn test_malformed_entity_does_not_drop_batch() {
        let mut data = encode_feed(vec![
            wire_entity("1", "7001", 38.9, -77.03),
            wire_entity("2", "7002", 38.8, -77.1),
        ]);
        // Entity "3" whose vehicle (field 4) is sent as a varint
        data.extend_from_slice(&[0x12, 0x05, 0x0a, 0x01, b'3', 0x20, 0x01]);

        let feed = decode(&data).unwrap();
        let ids: Vec<_> = feed.entities.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, ["1", "2"]);
        assert_eq!(
            feed.skipped,
            [SkippedEntity {
                entity_id: "3".into(),
                reason: SkipReason::Malformed,
            }]
        );
    }

    #[test]
    fn test_non_finite_coordinates_skipped() {
        let data = encode_feed(vec![wire_entity("1", "7001", f32::NAN, -77.0)]);
        let feed = decode(&data).unwrap();
        assert!(feed.entities.is_empty());
        assert_eq!(feed.skipped[0].reason, SkipReason::NonFiniteCoordinates);
    }

    #[test]
    fn test_deleted_flag_carried() {
        let mut entity = wire_entity("1", "7001", 38.9, -77.03);
        entity.is_deleted = Some(true);
        let feed = decode(&encode_feed(vec![entity])).unwrap();
        assert!(feed.entities[0].is_deleted);
    }

    #[test]
    fn test_corrupt_envelope_rejected() {
        assert!(matches!(decode(&[]), Err(DecodeError::Empty)));
        assert!(matches!(
            decode(b"<html>Service Unavailable</html>"),
            Err(DecodeError::ServerResponse(_))
        ));
        // Field 1, length-delimited, claims 100 bytes but only 2 follow
        assert!(matches!(
            decode(&[0x0a, 0x64, 0x01, 0x02]),
            Err(DecodeError::Protobuf(_))
        ));
    }
}
