use crate::config::{self, NetworkConfig};
use crate::feed::FeedEntity;
use crate::led::{LedOutput, LedRailsApi};
use crate::pairs::{self, TrainPair};
use crate::store::{self, EntityStore};
use crate::stops::{self, StopsMap};
use crate::track_blocks::{self, TrackBlockMap};
use crate::tracker::{self, TrainInfo};
use crate::{cache, fetcher};
use anyhow::{Context, Result};
use chrono::Utc;
use compact_str::CompactString;
use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

pub const CACHE_ENTITIES: &str = "entities";
pub const CACHE_TRAIN_PAIRS: &str = "trainPairs";

// One rail network: immutable config and loaded data, the mutable
// pipeline state behind the tick mutex, and the published snapshot the
// HTTP handlers read. Networks share nothing with each other.
pub struct Network {
    pub id: String,
    // URL mount segment, "<id-lower>-ltm"
    pub mount: String,
    pub config: NetworkConfig,
    pub track_blocks: TrackBlockMap,
    pub stops: Option<StopsMap>,
    pub api_key: Option<String>,
    pub cache_root: PathBuf,
    pub started_at: u64,
    client: reqwest::Client,
    state: Mutex<NetworkState>,
    published: RwLock<Arc<Published>>,
    last_attempt_epoch: AtomicU64,
}

struct NetworkState {
    entities: EntityStore,
    pairs: Vec<TrainPair>,
    roster: Vec<TrainInfo>,
    led_apis: Vec<LedRailsApi>,
    last_eviction_ms: u64,
}

// Snapshot swapped in whole at the end of each tick, so HTTP readers
// never observe a partially generated output.
#[derive(Default)]
pub struct Published {
    pub outputs: HashMap<String, LedOutput>,
    pub roster: Vec<TrainInfo>,
    pub entities: HashMap<CompactString, FeedEntity>,
    pub trains: Vec<FeedEntity>,
    pub last_success: Option<u64>,
}

impl Network {
    // Builds a network from its railNetworks/<ID>/ directory. Any missing
    // required input is an error; the caller skips the network and keeps
    // the process alive.
    pub fn from_dir(dir: &Path, cache_root: &Path) -> Result<Self> {
        let id = dir
            .file_name()
            .and_then(|n| n.to_str())
            .context("network directory has no name")?
            .to_string();
        let config = config::load_network_config(&dir.join("config.json"))?;

        let track_blocks = match &config.track_blocks {
            Some(file) => track_blocks::load_track_blocks(&dir.join(&file.file_name))?,
            None => TrackBlockMap::new(),
        };
        let stops = match &config.stops {
            Some(file) => Some(stops::load_stops(&dir.join(&file.file_name))?),
            None => None,
        };

        // The env var carrying the feed key is named after the network.
        let api_key = std::env::var(&id).ok();
        if config.gtfs_realtime_api.key_header.is_some() && api_key.is_none() {
            warn!("[{}] keyHeader configured but env var {} is not set", id, id);
        }

        let mount = format!("{}-ltm", id.to_lowercase());
        let opts = &config.processing_options;
        let led_apis = match &config.led_rails_api {
            Some(led_cfg) => led_cfg
                .api_versions
                .iter()
                .map(|version| {
                    LedRailsApi::from_config(
                        led_cfg,
                        version,
                        &mount,
                        opts.display_threshold,
                        config.gtfs_realtime_api.fetch_interval_seconds,
                    )
                })
                .collect(),
            None => Vec::new(),
        };

        let mut state = NetworkState {
            entities: EntityStore::new(),
            pairs: Vec::new(),
            roster: Vec::new(),
            led_apis,
            last_eviction_ms: 0,
        };

        if opts.cache_gtfs {
            match cache::load::<HashMap<CompactString, FeedEntity>>(cache_root, &id, CACHE_ENTITIES)
            {
                Ok(Some(entities)) => {
                    info!("[{}] Restored {} cached vehicles", id, entities.len());
                    state.entities = EntityStore::from_entities(entities);
                }
                Ok(None) => {}
                Err(e) => warn!("[{}] Ignoring unreadable entity cache: {:#}", id, e),
            }
            match cache::load::<Vec<TrainPair>>(cache_root, &id, CACHE_TRAIN_PAIRS) {
                Ok(Some(pairs)) => {
                    info!("[{}] Restored {} cached train pairs", id, pairs.len());
                    state.pairs = pairs;
                }
                Ok(None) => {}
                Err(e) => warn!("[{}] Ignoring unreadable pair cache: {:#}", id, e),
            }
        }

        info!(
            "[{}] Loaded {} track blocks, {} stops, {} board revisions",
            id,
            track_blocks.len(),
            stops.as_ref().map_or(0, |s| s.len()),
            state.led_apis.len()
        );

        Ok(Network {
            id,
            mount,
            config,
            track_blocks,
            stops,
            api_key,
            cache_root: cache_root.to_path_buf(),
            started_at: Utc::now().timestamp() as u64,
            client: reqwest::Client::new(),
            state: Mutex::new(state),
            published: RwLock::new(Arc::new(Published::default())),
            last_attempt_epoch: AtomicU64::new(0),
        })
    }

    // One cycle: fetch -> filter -> pair -> sync -> assign -> generate ->
    // publish. A tick that outlives the interval makes the next firing a
    // no-op instead of overlapping.
    pub async fn tick(&self) {
        let Ok(mut guard) = self.state.try_lock() else {
            warn!("[{}] Previous tick still running, skipping this one", self.id);
            return;
        };
        let state = &mut *guard;

        let now_ms = Utc::now().timestamp_millis() as u64;
        let now = now_ms / 1000;
        self.last_attempt_epoch.store(now, Ordering::Relaxed);

        let opts = &self.config.processing_options;

        let incoming = fetcher::fetch_feeds(
            &self.client,
            &self.config.gtfs_realtime_api,
            self.api_key.as_deref(),
        )
        .await;
        state.entities.merge(incoming);

        if let Some(hours) = opts.remove_stale_vehicles_hours {
            let interval_ms = (hours * 3_600_000.0) as u64;
            if now_ms.saturating_sub(state.last_eviction_ms) >= interval_ms {
                state.entities.evict_stale(now_ms, hours);
                state.last_eviction_ms = now_ms;
            }
        }

        let trains = store::filter_trains(&state.entities, self.config.train_filter.as_ref());

        let mut invisible = if opts.pair_trains {
            pairs::update_pairs(&mut state.pairs, &trains, opts, now)
        } else {
            HashSet::new()
        };

        tracker::sync_roster(&mut state.roster, &trains, opts, now);
        tracker::assign_blocks(
            &mut state.roster,
            &self.track_blocks,
            &mut invisible,
            opts.display_threshold,
            now,
        );

        for api in &mut state.led_apis {
            api.generate(&state.roster, &invisible, now_ms);
        }

        info!(
            "[{}] Tick complete: {} entities, {} trains, {} tracked, {} invisible",
            self.id,
            state.entities.len(),
            trains.len(),
            state.roster.len(),
            invisible.len()
        );

        let published = Published {
            outputs: state
                .led_apis
                .iter()
                .map(|api| (api.version.clone(), api.output.clone()))
                .collect(),
            roster: state.roster.clone(),
            entities: state.entities.to_map().clone(),
            trains,
            last_success: Some(now),
        };
        *self.published.write().unwrap() = Arc::new(published);
    }

    pub fn snapshot(&self) -> Arc<Published> {
        self.published.read().unwrap().clone()
    }

    pub fn last_attempt(&self) -> Option<u64> {
        match self.last_attempt_epoch.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub async fn save_caches(&self) {
        let state = self.state.lock().await;
        if let Err(e) = cache::save(
            &self.cache_root,
            &self.id,
            CACHE_ENTITIES,
            state.entities.to_map(),
        ) {
            warn!("[{}] Failed to save entity cache: {:#}", self.id, e);
        }
        if let Err(e) = cache::save(&self.cache_root, &self.id, CACHE_TRAIN_PAIRS, &state.pairs) {
            warn!("[{}] Failed to save pair cache: {:#}", self.id, e);
        }
    }

    pub fn status(&self) -> serde_json::Value {
        let snapshot = self.snapshot();
        let now = Utc::now().timestamp() as u64;
        serde_json::json!({
            "status": if snapshot.last_success.is_some() { "ok" } else { "waiting for first update" },
            "epoch": now,
            "uptime": now.saturating_sub(self.started_at),
            "refreshInterval": self.config.gtfs_realtime_api.fetch_interval_seconds,
            "trackBlocks": self.track_blocks.len(),
            "entities": snapshot.entities.len(),
            "trackedTrains": snapshot.roster.len(),
        })
    }
}
