use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use std::path::Path;

// Per-network config.json. A minimal config only needs GTFSRealtimeAPI;
// everything else has defaults.
#[derive(Clone, Debug, Deserialize)]
pub struct NetworkConfig {
    #[serde(rename = "GTFSRealtimeAPI")]
    pub gtfs_realtime_api: GtfsRealtimeApi,
    #[serde(rename = "trainFilter", default)]
    pub train_filter: Option<TrainFilter>,
    #[serde(rename = "processingOptions", default)]
    pub processing_options: ProcessingOptions,
    #[serde(default)]
    pub stops: Option<FileRef>,
    #[serde(rename = "trackBlocks", default)]
    pub track_blocks: Option<FileRef>,
    #[serde(rename = "LEDRailsAPI", default)]
    pub led_rails_api: Option<LedRailsApiConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GtfsRealtimeApi {
    pub url: Vec<String>,
    #[serde(rename = "tripsUrl", default)]
    pub trips_url: Vec<String>,
    #[serde(rename = "keyHeader", default)]
    pub key_header: Option<String>,
    #[serde(rename = "fetchIntervalSeconds", default = "default_fetch_interval")]
    pub fetch_interval_seconds: u64,
    #[serde(default)]
    pub format: FeedFormat,
    #[serde(default)]
    pub protocol: FeedProtocol,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
#[serde(from = "String")]
pub enum FeedFormat {
    #[default]
    FeedMessage,
    // Vendor envelope {"response": FeedMessage}
    Vendor,
}

impl From<String> for FeedFormat {
    fn from(s: String) -> Self {
        if s == "FeedMessage" {
            FeedFormat::FeedMessage
        } else {
            FeedFormat::Vendor
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
#[serde(from = "String")]
pub enum FeedProtocol {
    Protobuf,
    #[default]
    Json,
}

impl From<String> for FeedProtocol {
    fn from(s: String) -> Self {
        if s.eq_ignore_ascii_case("protobuf") {
            FeedProtocol::Protobuf
        } else {
            FeedProtocol::Json
        }
    }
}

// The two filter variants are mutually exclusive; entityID wins if a
// config carries both.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TrainFilter {
    #[serde(rename = "entityID", default)]
    pub entity_id: Option<EntityIdRange>,
    #[serde(rename = "trip_ID", default)]
    pub trip_id: Option<TripIdFilter>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EntityIdRange {
    pub start: u64,
    pub end: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TripIdFilter {
    #[serde(default)]
    pub includes: Vec<String>,
    #[serde(default)]
    pub excludes: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProcessingOptions {
    #[serde(rename = "pairTrains")]
    pub pair_trains: bool,
    #[serde(rename = "cacheGTFS")]
    pub cache_gtfs: bool,
    #[serde(rename = "cacheIntervalSeconds")]
    pub cache_interval_seconds: u64,
    // Maximum vehicle timestamp age, in seconds, for a train to be rendered.
    #[serde(rename = "displayThreshold")]
    pub display_threshold: u64,
    #[serde(rename = "removeStaleVehiclesHours")]
    pub remove_stale_vehicles_hours: Option<f64>,
    // Weight of the previous position when both old and new reported
    // speeds are at or below smoothingSpeedThreshold.
    #[serde(rename = "positionSmoothingFactor")]
    pub position_smoothing_factor: f64,
    #[serde(rename = "smoothingSpeedThreshold")]
    pub smoothing_speed_threshold: f64,
    #[serde(rename = "stopDepartureWindowMinutes")]
    pub stop_departure_window_minutes: i64,
    #[serde(rename = "pairBreakDistanceMeters")]
    pub pair_break_distance_meters: f64,
    #[serde(rename = "trainLengthMeters")]
    pub train_length_meters: f64,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        Self {
            pair_trains: false,
            cache_gtfs: false,
            cache_interval_seconds: 30,
            display_threshold: 300,
            remove_stale_vehicles_hours: None,
            position_smoothing_factor: 0.95,
            smoothing_speed_threshold: 0.0,
            stop_departure_window_minutes: 10,
            pair_break_distance_meters: 2000.0,
            train_length_meters: 150.0,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct FileRef {
    #[serde(rename = "fileName")]
    pub file_name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LedRailsApiConfig {
    #[serde(rename = "APIVersions")]
    pub api_versions: Vec<ApiVersionConfig>,
    #[serde(rename = "randomizeTimeOffset", default)]
    pub randomize_time_offset: bool,
    // Declaration order is the color-id assignment order.
    pub colors: IndexMap<String, [u8; 3]>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ApiVersionConfig {
    pub version: String,
    #[serde(rename = "blockRemap", default)]
    pub block_remap: Vec<BlockRemapRule>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
pub struct BlockRemapRule {
    pub start: u32,
    pub end: u32,
    pub offset: i32,
}

fn default_fetch_interval() -> u64 {
    20
}

pub fn load_network_config(path: &Path) -> Result<NetworkConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "GTFSRealtimeAPI": {
                "url": ["https://api.example.com/vehiclelocations"],
                "tripsUrl": ["https://api.example.com/tripupdates"],
                "keyHeader": "Ocp-Apim-Subscription-Key",
                "fetchIntervalSeconds": 20,
                "format": "FeedMessage",
                "protocol": "protobuf"
            },
            "trainFilter": {"trip_ID": {"includes": ["EAST", "WEST"], "excludes": ["BUS"]}},
            "processingOptions": {
                "pairTrains": true,
                "cacheGTFS": true,
                "displayThreshold": 300
            },
            "trackBlocks": {"fileName": "trackBlocks.kml"},
            "stops": {"fileName": "stops.txt"},
            "LEDRailsAPI": {
                "APIVersions": [
                    {"version": "v1"},
                    {"version": "v2", "blockRemap": [{"start": 300, "end": 399, "offset": -100}]}
                ],
                "randomizeTimeOffset": true,
                "colors": {"EAST": [0, 255, 0], "WEST": [255, 0, 0], "STH": [0, 0, 255]}
            }
        }"#;
        let cfg: NetworkConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.gtfs_realtime_api.protocol, FeedProtocol::Protobuf);
        assert_eq!(cfg.gtfs_realtime_api.format, FeedFormat::FeedMessage);
        assert!(cfg.processing_options.pair_trains);
        assert_eq!(cfg.processing_options.cache_interval_seconds, 30, "default applied");
        let led = cfg.led_rails_api.unwrap();
        assert_eq!(led.api_versions.len(), 2);
        assert_eq!(led.api_versions[1].block_remap[0].offset, -100);
        let routes: Vec<&String> = led.colors.keys().collect();
        assert_eq!(routes, ["EAST", "WEST", "STH"], "declaration order preserved");
    }

    #[test]
    fn test_minimal_config_defaults() {
        let json = r#"{"GTFSRealtimeAPI": {"url": ["https://feed.example.com"]}}"#;
        let cfg: NetworkConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.gtfs_realtime_api.fetch_interval_seconds, 20);
        assert_eq!(cfg.gtfs_realtime_api.protocol, FeedProtocol::Json);
        assert_eq!(cfg.processing_options.display_threshold, 300);
        assert_eq!(cfg.processing_options.position_smoothing_factor, 0.95);
        assert!(cfg.train_filter.is_none());
        assert!(cfg.led_rails_api.is_none());
    }

    #[test]
    fn test_vendor_format() {
        let json = r#"{"GTFSRealtimeAPI": {"url": ["u"], "format": "response"}}"#;
        let cfg: NetworkConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.gtfs_realtime_api.format, FeedFormat::Vendor);
    }
}
