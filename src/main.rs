use anyhow::{Context, Result, bail};
use dashmap::DashMap;
use log::{error, info};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use warp::Filter;
use warp::http::StatusCode;
use warp::path::Tail;

mod cache;
mod config;
mod feed;
mod fetcher;
mod geometry;
mod led;
mod network;
mod pairs;
mod stops;
mod store;
mod track_blocks;
mod tracker;

use network::Network;

const RAIL_NETWORKS_DIR: &str = "./railNetworks";
const CACHE_DIR: &str = "./cache";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    // 1. Discover and load networks. A broken network is skipped loudly;
    // zero loadable networks is the only fatal startup condition.
    let networks = discover_networks(Path::new(RAIL_NETWORKS_DIR), Path::new(CACHE_DIR))?;

    // 2. Per-network update and cache timers.
    for entry in networks.iter() {
        spawn_network_loops(entry.value().clone());
    }

    // 3. HTTP server. Every endpoint reads the latest published snapshot,
    // never the in-flight tick state.
    let networks_filter = {
        let networks = networks.clone();
        warp::any().map(move || networks.clone()).boxed()
    };
    let routes = warp::get()
        .and(warp::path::param::<String>())
        .and(warp::path::tail())
        .and(networks_filter)
        .and_then(handle_network_request);

    let server_port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse()
        .expect("Invalid PORT env variable");
    info!("Server running at http://localhost:{}", server_port);
    warp::serve(routes).run(([0, 0, 0, 0], server_port)).await;
    Ok(())
}

fn discover_networks(
    root: &Path,
    cache_root: &Path,
) -> Result<Arc<DashMap<String, Arc<Network>>>> {
    let entries = std::fs::read_dir(root)
        .with_context(|| format!("reading network root {}", root.display()))?;

    let networks: Arc<DashMap<String, Arc<Network>>> = Arc::new(DashMap::new());
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        match Network::from_dir(&dir, cache_root) {
            Ok(network) => {
                info!("[{}] Mounted at /{}/", network.id, network.mount);
                networks.insert(network.mount.clone(), Arc::new(network));
            }
            Err(e) => error!("Skipping network {}: {:#}", dir.display(), e),
        }
    }

    if networks.is_empty() {
        bail!("no rail networks loaded from {}", root.display());
    }
    Ok(networks)
}

fn spawn_network_loops(network: Arc<Network>) {
    let interval = network
        .config
        .gtfs_realtime_api
        .fetch_interval_seconds
        .max(1);

    // Update loop. Each tick runs in its own task so a panic is contained
    // and the timer keeps firing; overlap is prevented inside tick().
    {
        let network = network.clone();
        tokio::spawn(async move {
            loop {
                let run = tokio::spawn({
                    let network = network.clone();
                    async move { network.tick().await }
                });
                if let Err(e) = run.await {
                    error!("[{}] Tick aborted: {}", network.id, e);
                }
                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
        });
    }

    // Cache loop, sleep then save.
    if network.config.processing_options.cache_gtfs {
        let cache_interval = network
            .config
            .processing_options
            .cache_interval_seconds
            .max(1);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(cache_interval)).await;
                network.save_caches().await;
            }
        });
    }
}

async fn handle_network_request(
    mount: String,
    tail: Tail,
    networks: Arc<DashMap<String, Arc<Network>>>,
) -> Result<Box<dyn warp::Reply>, warp::Rejection> {
    let Some(network) = networks.get(&mount).map(|n| n.value().clone()) else {
        return Err(warp::reject::not_found());
    };
    let snapshot = network.snapshot();

    match tail.as_str() {
        "status" => Ok(Box::new(warp::reply::json(&network.status()))),
        "api/vehicles" => Ok(Box::new(warp::reply::json(&snapshot.entities))),
        "api/vehicles/trains" => Ok(Box::new(warp::reply::json(&snapshot.trains))),
        "api/trackedtrains" => Ok(Box::new(warp::reply::json(&snapshot.roster))),
        "api/stops" => match &network.stops {
            Some(stops) => Ok(Box::new(warp::reply::json(stops))),
            None => Err(warp::reject::not_found()),
        },
        path => {
            let Some(version) = path.strip_suffix(".json") else {
                return Err(warp::reject::not_found());
            };
            if snapshot.last_success.is_none() {
                let body = serde_json::json!({
                    "status": "unavailable",
                    "reason": "no update cycle has completed yet",
                    "lastAttempt": network.last_attempt(),
                });
                return Ok(Box::new(warp::reply::with_status(
                    warp::reply::json(&body),
                    StatusCode::SERVICE_UNAVAILABLE,
                )));
            }
            match snapshot.outputs.get(version) {
                Some(output) => Ok(Box::new(warp::reply::json(output))),
                None => Err(warp::reject::not_found()),
            }
        }
    }
}
