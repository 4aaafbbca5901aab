//! Core data types for vehicle position tracking.
//!
//! These are the decoded, validated forms of the GTFS-realtime messages in
//! [`crate::gtfs`]. Their `Serialize` output is the nested `vehicle` object of
//! an indexed document, with field names and enum spellings matching the
//! protobuf JSON mapping that the index templates were written against.

use serde::{Serialize, Serializer};
use std::fmt;

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident = $value:literal => $label:literal,)+ }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
            /// Value not known to this schema revision.
            Unknown(i32),
        }

        impl $name {
            pub const fn as_i32(&self) -> i32 {
                match self {
                    $(Self::$variant => $value,)+
                    Self::Unknown(v) => *v,
                }
            }

            /// Protobuf enum name, or `None` for values outside the schema.
            pub const fn name(&self) -> Option<&'static str> {
                match self {
                    $(Self::$variant => Some($label),)+
                    Self::Unknown(_) => None,
                }
            }
        }

        impl From<i32> for $name {
            fn from(v: i32) -> Self {
                match v {
                    $($value => Self::$variant,)+
                    other => Self::Unknown(other),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self.name() {
                    Some(name) => f.write_str(name),
                    None => write!(f, "{}", self.as_i32()),
                }
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                match self.name() {
                    Some(name) => serializer.serialize_str(name),
                    None => serializer.serialize_i32(self.as_i32()),
                }
            }
        }
    };
}

wire_enum! {
    /// Where the vehicle is relative to `current_stop_sequence`.
    VehicleStopStatus {
        IncomingAt = 0 => "INCOMING_AT",
        StoppedAt = 1 => "STOPPED_AT",
        InTransitTo = 2 => "IN_TRANSIT_TO",
    }
}

wire_enum! {
    CongestionLevel {
        UnknownCongestionLevel = 0 => "UNKNOWN_CONGESTION_LEVEL",
        RunningSmoothly = 1 => "RUNNING_SMOOTHLY",
        StopAndGo = 2 => "STOP_AND_GO",
        Congestion = 3 => "CONGESTION",
        SevereCongestion = 4 => "SEVERE_CONGESTION",
    }
}

wire_enum! {
    /// Passenger load reported by the vehicle.
    OccupancyStatus {
        Empty = 0 => "EMPTY",
        ManySeatsAvailable = 1 => "MANY_SEATS_AVAILABLE",
        FewSeatsAvailable = 2 => "FEW_SEATS_AVAILABLE",
        StandingRoomOnly = 3 => "STANDING_ROOM_ONLY",
        CrushedStandingRoomOnly = 4 => "CRUSHED_STANDING_ROOM_ONLY",
        Full = 5 => "FULL",
        NotAcceptingPassengers = 6 => "NOT_ACCEPTING_PASSENGERS",
        NoDataAvailable = 7 => "NO_DATA_AVAILABLE",
        NotBoardable = 8 => "NOT_BOARDABLE",
    }
}

wire_enum! {
    /// Relation between a trip and the static schedule.
    ScheduleRelationship {
        Scheduled = 0 => "SCHEDULED",
        Added = 1 => "ADDED",
        Unscheduled = 2 => "UNSCHEDULED",
        Canceled = 3 => "CANCELED",
        Replacement = 5 => "REPLACEMENT",
        Duplicated = 6 => "DUPLICATED",
        Deleted = 7 => "DELETED",
    }
}

wire_enum! {
    Incrementality {
        FullDataset = 0 => "FULL_DATASET",
        Differential = 1 => "DIFFERENTIAL",
    }
}

/// Feed header of a decoded snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedHeader {
    pub gtfs_realtime_version: String,
    pub incrementality: Option<Incrementality>,
    /// Snapshot creation time, POSIX seconds.
    pub timestamp: Option<u64>,
}

/// One vehicle position within a feed snapshot.
///
/// Only entities that carry a vehicle payload with a position and a vehicle
/// id make it this far; everything else is skipped by the decoder.
#[derive(Debug, Clone, PartialEq)]
pub struct VehiclePositionEntity {
    /// Feed entity id.
    pub id: String,
    /// Set when the feed marks the entity as removed.
    pub is_deleted: bool,
    pub vehicle: VehiclePosition,
}

impl VehiclePositionEntity {
    pub fn vehicle_id(&self) -> &str {
        &self.vehicle.vehicle.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehiclePosition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip: Option<TripDescriptor>,
    pub position: Position,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_stop_sequence: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<VehicleStopStatus>,
    /// Vehicle-reported measurement time, POSIX seconds.
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_u64_string"
    )]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub congestion_level: Option<CongestionLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_id: Option<String>,
    pub vehicle: VehicleDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupancy_status: Option<OccupancyStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub occupancy_percentage: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TripDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schedule_relationship: Option<ScheduleRelationship>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleDescriptor {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_plate: Option<String>,
}

/// WGS-84 position. Coordinates are always finite.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub latitude: f32,
    pub longitude: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub odometer: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,
}

// The protobuf JSON mapping renders 64-bit integers as strings.
fn serialize_u64_string<S: Serializer>(value: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(v) => serializer.collect_str(v),
        None => serializer.serialize_none(),
    }
}
