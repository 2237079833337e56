use crate::config::ProcessingOptions;
use crate::feed::FeedEntity;
use crate::geometry::{bearing_difference, haversine_distance};
use compact_str::CompactString;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

const MIN_PAIR_SPEED: f64 = 3.0; // m/s
const MAX_IMPLIED_SPEED: f64 = 35.0; // m/s
const MAX_SPEED_DIFF: f64 = 3.0; // m/s
const MAX_BEARING_DIFF: f64 = 5.0; // degrees
const MAX_POSITION_AGE_SECS: u64 = 30;

// Two physical units coupled and operating as one train. The criteria
// snapshot is kept for diagnostics and survives restarts via the cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainPair {
    pub pair_key: String,
    pub vehicle_ids: [CompactString; 2],
    pub detected_at: u64,
    pub distance_m: f64,
    pub speed_diff: f64,
    pub bearing_diff: f64,
}

// Break phase, then detect phase, then invisibility election. Pairing is
// greedy, not transitive: a vehicle joins at most one pair per cycle.
pub fn update_pairs(
    pairs: &mut Vec<TrainPair>,
    trains: &[FeedEntity],
    opts: &ProcessingOptions,
    now: u64,
) -> HashSet<CompactString> {
    let by_id = index_by_vehicle(trains);

    // Break phase. Members of existing pairs leave the candidate pool
    // whether or not the pair survives.
    let mut consumed: HashSet<CompactString> = HashSet::new();
    pairs.retain(|pair| {
        consumed.insert(pair.vehicle_ids[0].clone());
        consumed.insert(pair.vehicle_ids[1].clone());

        let (Some(a), Some(b)) = (
            by_id.get(pair.vehicle_ids[0].as_str()),
            by_id.get(pair.vehicle_ids[1].as_str()),
        ) else {
            return true;
        };
        let (Some(pa), Some(pb)) = (a.position(), b.position()) else {
            return true;
        };
        if !has_real_position(pa.latitude, pa.longitude)
            || !has_real_position(pb.latitude, pb.longitude)
        {
            return true;
        }
        let distance = haversine_distance(pa.latitude, pa.longitude, pb.latitude, pb.longitude);
        if distance > opts.pair_break_distance_meters {
            info!(
                "Breaking pair {} at {:.0} m apart",
                pair.pair_key, distance
            );
            return false;
        }
        true
    });

    // Detect phase.
    let candidates: Vec<&FeedEntity> = trains
        .iter()
        .filter(|e| {
            let Some(id) = e.vehicle_id() else {
                return false;
            };
            if consumed.contains(id) {
                return false;
            }
            let Some(position) = e.position() else {
                return false;
            };
            if !has_real_position(position.latitude, position.longitude) {
                return false;
            }
            if position.speed.is_none_or(|s| s < MIN_PAIR_SPEED) {
                return false;
            }
            now.saturating_sub(e.timestamp().unwrap_or(0)) <= MAX_POSITION_AGE_SECS
        })
        .collect();

    let mut used = vec![false; candidates.len()];
    for i in 0..candidates.len() {
        if used[i] {
            continue;
        }
        for j in (i + 1)..candidates.len() {
            if used[j] {
                continue;
            }
            if let Some(pair) = try_pair(candidates[i], candidates[j], opts, now) {
                info!(
                    "Detected coupled pair {} ({:.0} m, Δv {:.1} m/s)",
                    pair.pair_key, pair.distance_m, pair.speed_diff
                );
                pairs.push(pair);
                used[i] = true;
                used[j] = true;
                break;
            }
        }
    }

    select_invisible(pairs, &by_id)
}

fn try_pair(
    a: &FeedEntity,
    b: &FeedEntity,
    opts: &ProcessingOptions,
    now: u64,
) -> Option<TrainPair> {
    let (id_a, id_b) = (a.vehicle_id()?, b.vehicle_id()?);
    let (pa, pb) = (a.position()?, b.position()?);

    // Positions are reported per unit, so a coupled pair can legitimately be
    // up to two train lengths apart after the GPS offset is removed.
    let raw = haversine_distance(pa.latitude, pa.longitude, pb.latitude, pb.longitude);
    let distance = (raw - 2.0 * opts.train_length_meters).max(0.0);
    if distance > 2.0 * opts.train_length_meters {
        return None;
    }

    // NaN when both distance and Δt are zero, which compares false below and
    // passes; infinite when only Δt is zero, which rejects.
    let dt = (a.timestamp().unwrap_or(0) as f64 - b.timestamp().unwrap_or(0) as f64).abs();
    let implied_speed = distance / dt;
    if implied_speed > MAX_IMPLIED_SPEED {
        return None;
    }

    let speed_diff = (pa.speed.unwrap_or(0.0) - pb.speed.unwrap_or(0.0)).abs();
    if speed_diff > MAX_SPEED_DIFF {
        return None;
    }

    let bearing_diff = match (pa.bearing, pb.bearing) {
        (Some(ba), Some(bb)) => {
            let diff = bearing_difference(ba, bb);
            if diff > MAX_BEARING_DIFF {
                return None;
            }
            diff
        }
        _ => 0.0,
    };

    if let (Some(ra), Some(rb)) = (a.route_id(), b.route_id()) {
        if !ra.is_empty() && !rb.is_empty() && ra != rb {
            return None;
        }
    }

    let (first, second) = if id_a <= id_b { (id_a, id_b) } else { (id_b, id_a) };
    Some(TrainPair {
        pair_key: format!("{}-{}", first, second),
        vehicle_ids: [first.clone(), second.clone()],
        detected_at: now,
        distance_m: distance,
        speed_diff,
        bearing_diff,
    })
}

// Hide the member without a route; when neither or both have one, hide
// the second id of the sorted pair.
fn select_invisible(
    pairs: &[TrainPair],
    by_id: &HashMap<&str, &FeedEntity>,
) -> HashSet<CompactString> {
    let mut invisible = HashSet::new();
    for pair in pairs {
        let route_a = by_id
            .get(pair.vehicle_ids[0].as_str())
            .and_then(|e| e.route_id())
            .unwrap_or("");
        let route_b = by_id
            .get(pair.vehicle_ids[1].as_str())
            .and_then(|e| e.route_id())
            .unwrap_or("");

        let hidden = if route_a.is_empty() && !route_b.is_empty() {
            &pair.vehicle_ids[0]
        } else {
            &pair.vehicle_ids[1]
        };
        invisible.insert(hidden.clone());
    }
    invisible
}

fn index_by_vehicle(trains: &[FeedEntity]) -> HashMap<&str, &FeedEntity> {
    trains
        .iter()
        .filter_map(|e| e.vehicle_id().map(|id| (id.as_str(), e)))
        .collect()
}

fn has_real_position(lat: f64, lon: f64) -> bool {
    lat != 0.0 || lon != 0.0
}
