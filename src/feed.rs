use compact_str::CompactString;
use serde::{Deserialize, Deserializer, Serialize};

// GTFS-realtime model, narrowed to the fields the pipeline reads.
// JSON feeds disagree on spelling (trip_id vs tripId, stop_time_update vs
// stopTimeUpdate) and some vendors encode timestamps as strings, so every
// numeric timestamp goes through a lenient deserializer.

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedMessage {
    #[serde(default)]
    pub header: Option<FeedHeader>,
    #[serde(default)]
    pub entity: Vec<FeedEntity>,
}

// Some vendors wrap the FeedMessage in a {"response": ...} envelope.
#[derive(Debug, Deserialize)]
pub struct VendorEnvelope {
    pub response: FeedMessage,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedHeader {
    #[serde(default, alias = "gtfsRealtimeVersion")]
    pub gtfs_realtime_version: Option<String>,
    #[serde(default, deserialize_with = "u64_lenient")]
    pub timestamp: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedEntity {
    #[serde(default)]
    pub id: CompactString,
    #[serde(default, alias = "isDeleted")]
    pub is_deleted: Option<bool>,
    #[serde(default)]
    pub vehicle: Option<VehiclePosition>,
    #[serde(default, alias = "tripUpdate")]
    pub trip_update: Option<TripUpdate>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VehiclePosition {
    #[serde(default)]
    pub trip: Option<TripDescriptor>,
    #[serde(default)]
    pub vehicle: Option<VehicleDescriptor>,
    #[serde(default)]
    pub position: Option<Position>,
    #[serde(default, deserialize_with = "u64_lenient")]
    pub timestamp: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TripDescriptor {
    #[serde(default, alias = "tripId")]
    pub trip_id: Option<CompactString>,
    #[serde(default, alias = "routeId")]
    pub route_id: Option<CompactString>,
    #[serde(default, alias = "startDate")]
    pub start_date: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleDescriptor {
    #[serde(default)]
    pub id: Option<CompactString>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub bearing: Option<f64>,
    #[serde(default)]
    pub speed: Option<f64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TripUpdate {
    #[serde(default)]
    pub trip: Option<TripDescriptor>,
    #[serde(default, alias = "stopTimeUpdate")]
    pub stop_time_update: Vec<StopTimeUpdate>,
    #[serde(default, deserialize_with = "u64_lenient")]
    pub timestamp: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StopTimeUpdate {
    #[serde(default, alias = "stopId")]
    pub stop_id: Option<CompactString>,
    #[serde(default)]
    pub arrival: Option<StopTimeEvent>,
    #[serde(default)]
    pub departure: Option<StopTimeEvent>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StopTimeEvent {
    #[serde(default, deserialize_with = "i64_lenient")]
    pub time: Option<i64>,
    #[serde(default)]
    pub delay: Option<i32>,
}

impl FeedEntity {
    pub fn vehicle_id(&self) -> Option<&CompactString> {
        self.vehicle.as_ref()?.vehicle.as_ref()?.id.as_ref()
    }

    pub fn position(&self) -> Option<&Position> {
        self.vehicle.as_ref()?.position.as_ref()
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.vehicle.as_ref()?.timestamp
    }

    pub fn trip_id(&self) -> Option<&str> {
        self.vehicle
            .as_ref()?
            .trip
            .as_ref()?
            .trip_id
            .as_deref()
    }

    pub fn route_id(&self) -> Option<&str> {
        self.vehicle
            .as_ref()?
            .trip
            .as_ref()?
            .route_id
            .as_deref()
    }
}

impl FeedMessage {
    // Alerts, occupancy, congestion etc. are dropped here; the pipeline
    // never reads them.
    pub fn from_protobuf(msg: gtfs_realtime::FeedMessage) -> Self {
        FeedMessage {
            header: Some(FeedHeader {
                gtfs_realtime_version: Some(msg.header.gtfs_realtime_version),
                timestamp: msg.header.timestamp,
            }),
            entity: msg.entity.into_iter().map(convert_entity).collect(),
        }
    }
}

fn convert_entity(e: gtfs_realtime::FeedEntity) -> FeedEntity {
    FeedEntity {
        id: CompactString::from(e.id),
        is_deleted: e.is_deleted,
        vehicle: e.vehicle.map(|v| VehiclePosition {
            trip: v.trip.map(convert_trip),
            vehicle: v.vehicle.map(|d| VehicleDescriptor {
                id: d.id.map(CompactString::from),
                label: d.label,
            }),
            position: v.position.map(|p| Position {
                latitude: p.latitude as f64,
                longitude: p.longitude as f64,
                bearing: p.bearing.map(|b| b as f64),
                speed: p.speed.map(|s| s as f64),
            }),
            timestamp: v.timestamp,
        }),
        trip_update: e.trip_update.map(|tu| TripUpdate {
            trip: Some(convert_trip(tu.trip)),
            stop_time_update: tu
                .stop_time_update
                .into_iter()
                .map(|stu| StopTimeUpdate {
                    stop_id: stu.stop_id.map(CompactString::from),
                    arrival: stu.arrival.map(|ev| StopTimeEvent {
                        time: ev.time,
                        delay: ev.delay,
                    }),
                    departure: stu.departure.map(|ev| StopTimeEvent {
                        time: ev.time,
                        delay: ev.delay,
                    }),
                })
                .collect(),
            timestamp: tu.timestamp,
        }),
    }
}

fn convert_trip(t: gtfs_realtime::TripDescriptor) -> TripDescriptor {
    TripDescriptor {
        trip_id: t.trip_id.map(CompactString::from),
        route_id: t.route_id.map(CompactString::from),
        start_date: t.start_date,
    }
}

// Vendors sometimes serialize protobuf uint64 fields as JSON strings.

fn u64_lenient<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(u64),
        Str(String),
    }
    Ok(match Option::<NumOrStr>::deserialize(deserializer)? {
        None => None,
        Some(NumOrStr::Num(n)) => Some(n),
        Some(NumOrStr::Str(s)) => s.parse().ok(),
    })
}

fn i64_lenient<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(i64),
        Str(String),
    }
    Ok(match Option::<NumOrStr>::deserialize(deserializer)? {
        None => None,
        Some(NumOrStr::Num(n)) => Some(n),
        Some(NumOrStr::Str(s)) => s.parse().ok(),
    })
}
