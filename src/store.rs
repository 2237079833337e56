use crate::config::TrainFilter;
use crate::feed::FeedEntity;
use compact_str::CompactString;
use log::{debug, info};
use std::collections::HashMap;

// vehicle.vehicle.id -> FeedEntity, newest wins. Vehicles missing from a
// cycle persist until evicted.
#[derive(Clone, Debug, Default)]
pub struct EntityStore {
    entities: HashMap<CompactString, FeedEntity>,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entities(entities: HashMap<CompactString, FeedEntity>) -> Self {
        Self { entities }
    }

    pub fn merge(&mut self, incoming: Vec<FeedEntity>) {
        for entity in incoming {
            let Some(vehicle_id) = entity.vehicle_id().cloned() else {
                continue;
            };
            if entity.is_deleted == Some(true) {
                self.entities.remove(&vehicle_id);
                continue;
            }
            match self.entities.get(&vehicle_id) {
                Some(existing)
                    if existing.timestamp().unwrap_or(0) > entity.timestamp().unwrap_or(0) =>
                {
                    debug!("Skipping older update for vehicle {}", vehicle_id);
                }
                _ => {
                    self.entities.insert(vehicle_id, entity);
                }
            }
        }
    }

    pub fn evict_stale(&mut self, now_ms: u64, max_age_hours: f64) -> usize {
        let cutoff_ms = now_ms.saturating_sub((max_age_hours * 3_600_000.0) as u64);
        let before = self.entities.len();
        self.entities
            .retain(|_, e| e.timestamp().unwrap_or(0) * 1000 >= cutoff_ms);
        let evicted = before - self.entities.len();
        if evicted > 0 {
            info!("Evicted {} stale vehicles", evicted);
        }
        evicted
    }

    pub fn entities(&self) -> impl Iterator<Item = &FeedEntity> {
        self.entities.values()
    }

    pub fn to_map(&self) -> &HashMap<CompactString, FeedEntity> {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

// An absent or empty filter passes everything through: every entity is
// treated as a train.
pub fn filter_trains(store: &EntityStore, filter: Option<&TrainFilter>) -> Vec<FeedEntity> {
    store
        .entities()
        .filter(|e| is_train(e, filter))
        .cloned()
        .collect()
}

fn is_train(entity: &FeedEntity, filter: Option<&TrainFilter>) -> bool {
    let Some(filter) = filter else {
        return true;
    };

    if let Some(range) = &filter.entity_id {
        return match entity.id.parse::<u64>() {
            Ok(id) => id >= range.start && id <= range.end,
            Err(_) => false,
        };
    }

    if let Some(trip_filter) = &filter.trip_id {
        let trip_id = entity.trip_id().unwrap_or("");
        if trip_filter
            .excludes
            .iter()
            .any(|pattern| trip_id.contains(pattern.as_str()))
        {
            return false;
        }
        if trip_filter.includes.is_empty() {
            return true;
        }
        return trip_filter
            .includes
            .iter()
            .any(|pattern| trip_id.contains(pattern.as_str()));
    }

    true
}
