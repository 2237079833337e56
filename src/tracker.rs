use crate::config::ProcessingOptions;
use crate::feed::FeedEntity;
use crate::geometry::{bearing_difference, haversine_distance, initial_bearing};
use crate::track_blocks::{TrackBlock, TrackBlockMap};
use compact_str::CompactString;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// Route string recorded when the feed reports no route id.
pub const OUT_OF_SERVICE: &str = "OUT-OF-SERVICE";

// Bearing updates are suppressed outside this speed band: stationary
// trains jitter, implausible speeds mean the fix is bad.
const BEARING_MIN_SPEED: f64 = 4.0;
const BEARING_MAX_SPEED: f64 = 55.0;

// Long-lived record for one physical vehicle. Created on first sighting,
// dropped when the vehicle is evicted from the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainInfo {
    pub train_id: CompactString,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,
    // current_block is a block map key, a platform number, or an alt
    // block. previous_block == Some(0) is the wire sentinel for "unknown
    // predecessor".
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_block: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_block: Option<u32>,
    pub route: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trip_id: Option<CompactString>,
    #[serde(default)]
    pub stops: Vec<StopEta>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopEta {
    pub stop_id: CompactString,
    pub departure_time: i64,
}

// Brings the roster in line with this cycle's filtered train entities.
pub fn sync_roster(
    roster: &mut Vec<TrainInfo>,
    trains: &[FeedEntity],
    opts: &ProcessingOptions,
    now: u64,
) {
    // A vehicle evicted from the store takes its roster entry with it.
    let live_ids: HashSet<&str> = trains
        .iter()
        .filter_map(|e| e.vehicle_id().map(|id| id.as_str()))
        .collect();
    roster.retain(|t| live_ids.contains(t.train_id.as_str()));

    for entity in trains {
        let Some(vehicle_id) = entity.vehicle_id() else {
            continue;
        };
        let Some(position) = entity.position() else {
            continue;
        };
        let timestamp = entity.timestamp().unwrap_or(0);
        let route = match entity.route_id() {
            Some(r) if !r.is_empty() => r.to_string(),
            _ => OUT_OF_SERVICE.to_string(),
        };

        if let Some(idx) = roster.iter().position(|t| t.train_id == *vehicle_id) {
            let train = &mut roster[idx];
            if train.lat == position.latitude && train.lon == position.longitude {
                continue;
            }

            let (old_lat, old_lon) = (train.lat, train.lon);
            let effective_speed = match position.speed {
                Some(reported) => {
                    let threshold = opts.smoothing_speed_threshold;
                    let stationary = reported <= threshold
                        && train.speed.is_some_and(|old| old <= threshold);
                    if stationary {
                        // A stopped train's GPS wanders; bleed the new fix in
                        // slowly instead of jumping to it.
                        let f = opts.position_smoothing_factor;
                        train.lat = f * train.lat + (1.0 - f) * position.latitude;
                        train.lon = f * train.lon + (1.0 - f) * position.longitude;
                    } else {
                        train.lat = position.latitude;
                        train.lon = position.longitude;
                    }
                    reported
                }
                None => {
                    let distance =
                        haversine_distance(old_lat, old_lon, position.latitude, position.longitude);
                    let dt = timestamp.saturating_sub(train.timestamp);
                    train.lat = position.latitude;
                    train.lon = position.longitude;
                    if dt > 0 {
                        distance / dt as f64
                    } else {
                        train.speed.unwrap_or(0.0)
                    }
                }
            };

            if effective_speed > BEARING_MIN_SPEED && effective_speed < BEARING_MAX_SPEED {
                train.bearing = position.bearing.or_else(|| {
                    Some(initial_bearing(old_lat, old_lon, train.lat, train.lon))
                });
            }

            train.speed = Some(effective_speed);
            train.timestamp = timestamp;
            train.route = route;
            train.trip_id = entity.trip_id().map(Into::into);
            merge_stops(&mut train.stops, entity, opts, now);
        } else {
            let mut train = TrainInfo {
                train_id: vehicle_id.clone(),
                lat: position.latitude,
                lon: position.longitude,
                timestamp,
                speed: position.speed,
                bearing: position.bearing,
                current_block: None,
                previous_block: None,
                route,
                trip_id: entity.trip_id().map(Into::into),
                stops: Vec::new(),
            };
            merge_stops(&mut train.stops, entity, opts, now);
            roster.push(train);
        }
    }
}

// Upsert by stop id, then prune stops whose departure fell out of the
// window. departure_time == 0 means "timing unknown" and is kept.
fn merge_stops(stops: &mut Vec<StopEta>, entity: &FeedEntity, opts: &ProcessingOptions, now: u64) {
    if let Some(trip_update) = &entity.trip_update {
        for stu in &trip_update.stop_time_update {
            let Some(stop_id) = &stu.stop_id else {
                continue;
            };
            let Some(departure) = stu.departure.as_ref().and_then(|d| d.time) else {
                continue;
            };
            match stops.iter_mut().find(|s| s.stop_id == *stop_id) {
                Some(existing) => existing.departure_time = departure,
                None => stops.push(StopEta {
                    stop_id: stop_id.clone(),
                    departure_time: departure,
                }),
            }
        }
    }

    let cutoff = now as i64 - opts.stop_departure_window_minutes * 60;
    stops.retain(|s| s.departure_time == 0 || s.departure_time >= cutoff);
}

// Assigns every roster train to at most one block. Runs after sync,
// before LED generation.
pub fn assign_blocks(
    roster: &mut [TrainInfo],
    blocks: &TrackBlockMap,
    invisible: &mut HashSet<CompactString>,
    display_threshold: u64,
    now: u64,
) {
    let display_cutoff = now.saturating_sub(display_threshold);

    for train in roster.iter_mut() {
        // Staleness: a dead fix or an old report unmaps the train entirely.
        if (train.lat == 0.0 && train.lon == 0.0) || train.timestamp < display_cutoff {
            train.current_block = None;
            train.previous_block = None;
            continue;
        }

        // Sticky: still inside the current block means no search.
        if let Some(current) = train.current_block {
            if let Some(owner) = blocks.polygon_owner(current) {
                if owner.permits_route(&train.route) && owner.contains(train.lat, train.lon) {
                    train.previous_block = Some(current);
                    continue;
                }
            }
        }

        // Search in the map's canonical order; first hit wins.
        let prior = train.current_block;
        let mut assigned = None;
        for block in blocks.iter() {
            if !block.permits_route(&train.route) {
                continue;
            }
            if !block.contains(train.lat, train.lon) {
                continue;
            }
            assigned = Some(resolve_platform(block, train));
            break;
        }

        match assigned {
            Some(block_number) => {
                train.previous_block = Some(prior.unwrap_or(0));
                train.current_block = Some(block_number);
            }
            None => {
                if prior.is_some() {
                    debug!("Train {} left block {:?}", train.train_id, prior);
                }
                train.current_block = None;
                train.previous_block = None;
            }
        }
    }

    resolve_block_conflicts(roster, blocks, invisible);
}

// Platform disambiguation: upcoming stop id first, then approach bearing,
// then the bare default. Falls back to the block's own number when no
// platform matches.
fn resolve_platform(block: &TrackBlock, train: &TrainInfo) -> u32 {
    let Some(platforms) = &block.platforms else {
        return block.block_number;
    };

    for platform in platforms {
        if !platform.permits_route(&train.route) {
            continue;
        }
        if let Some(stop_ids) = &platform.stop_ids {
            if train
                .stops
                .iter()
                .any(|s| stop_ids.iter().any(|id| id == s.stop_id.as_str()))
            {
                return platform.block_number;
            }
        }
    }

    if let Some(train_bearing) = train.bearing {
        for platform in platforms {
            if !platform.is_default || !platform.permits_route(&train.route) {
                continue;
            }
            if let Some(platform_bearing) = platform.bearing {
                if bearing_difference(platform_bearing, train_bearing) <= 90.0 {
                    return platform.block_number;
                }
            }
        }
    }

    for platform in platforms {
        if platform.is_default
            && platform.bearing.is_none()
            && platform.permits_route(&train.route)
        {
            return platform.block_number;
        }
    }

    block.block_number
}

// At most one visible train per block: the first (by route order,
// OUT-OF-SERVICE last) keeps the block, the second takes the alt block if
// there is one, the rest go invisible for this cycle.
fn resolve_block_conflicts(
    roster: &mut [TrainInfo],
    blocks: &TrackBlockMap,
    invisible: &mut HashSet<CompactString>,
) {
    for block in blocks.iter() {
        let mut occupants: Vec<(usize, String)> = roster
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                t.current_block == Some(block.block_number)
                    && !invisible.contains(t.train_id.as_str())
            })
            .map(|(i, t)| (i, t.route.clone()))
            .collect();
        if occupants.len() <= 1 {
            continue;
        }

        occupants.sort_by_key(|(_, route)| (route.as_str() == OUT_OF_SERVICE, route.clone()));

        let mut overflow = occupants[1..].iter();
        if let Some((second, _)) = overflow.next() {
            match block.alt_block {
                Some(alt) => roster[*second].current_block = Some(alt),
                None => {
                    invisible.insert(roster[*second].train_id.clone());
                }
            }
        }
        for (extra, _) in overflow {
            invisible.insert(roster[*extra].train_id.clone());
        }
    }
}
