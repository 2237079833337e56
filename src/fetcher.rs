use crate::config::{FeedFormat, FeedProtocol, GtfsRealtimeApi};
use crate::feed::{FeedEntity, FeedMessage, VendorEnvelope};
use anyhow::{Context, Result, bail};
use futures::future::join_all;
use log::{error, warn};
use prost::Message;
use std::collections::HashMap;
use std::time::Duration;

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

// Fetches every configured feed concurrently. Individual failures are
// logged and skipped; a bad URL never aborts the cycle or its siblings.
pub async fn fetch_feeds(
    client: &reqwest::Client,
    api: &GtfsRealtimeApi,
    api_key: Option<&str>,
) -> Vec<FeedEntity> {
    let mut entities = fetch_group(client, &api.url, api, api_key).await;

    if !api.trips_url.is_empty() {
        let trips = fetch_group(client, &api.trips_url, api, api_key).await;
        merge_trip_updates(&mut entities, trips);
    }
    entities
}

async fn fetch_group(
    client: &reqwest::Client,
    urls: &[String],
    api: &GtfsRealtimeApi,
    api_key: Option<&str>,
) -> Vec<FeedEntity> {
    let requests = urls.iter().map(|url| fetch_bytes(client, url, api, api_key));
    let results = join_all(requests).await;

    let mut entities = Vec::new();
    for (url, result) in urls.iter().zip(results) {
        match result {
            Err(e) => warn!("Feed fetch failed for {}: {:#}", url, e),
            Ok(bytes) => match decode_feed(&bytes, api.protocol, api.format) {
                Ok(msg) => entities.extend(msg.entity),
                Err(e) => error!("Discarding undecodable feed from {}: {:#}", url, e),
            },
        }
    }
    entities
}

async fn fetch_bytes(
    client: &reqwest::Client,
    url: &str,
    api: &GtfsRealtimeApi,
    api_key: Option<&str>,
) -> Result<Vec<u8>> {
    let accept = match api.protocol {
        FeedProtocol::Protobuf => "application/x-protobuf",
        FeedProtocol::Json => "application/json",
    };
    let mut request = client
        .get(url)
        .timeout(FETCH_TIMEOUT)
        .header("accept", accept);
    if let (Some(header), Some(key)) = (api.key_header.as_deref(), api_key) {
        request = request.header(header, key);
    }

    let response = request.send().await.context("request failed")?;
    if !response.status().is_success() {
        bail!("HTTP {}", response.status());
    }
    Ok(response.bytes().await.context("reading body")?.to_vec())
}

pub fn decode_feed(bytes: &[u8], protocol: FeedProtocol, format: FeedFormat) -> Result<FeedMessage> {
    match protocol {
        FeedProtocol::Protobuf => {
            let msg = gtfs_realtime::FeedMessage::decode(bytes).context("protobuf decode")?;
            Ok(FeedMessage::from_protobuf(msg))
        }
        FeedProtocol::Json => match format {
            FeedFormat::FeedMessage => {
                serde_json::from_slice(bytes).context("JSON FeedMessage decode")
            }
            FeedFormat::Vendor => {
                let envelope: VendorEnvelope =
                    serde_json::from_slice(bytes).context("vendor envelope decode")?;
                Ok(envelope.response)
            }
        },
    }
}

// Copies each trip entity's stop time updates onto the position entity
// with the same id. Replace, not merge.
pub fn merge_trip_updates(positions: &mut [FeedEntity], trips: Vec<FeedEntity>) {
    let mut by_id: HashMap<_, _> = trips
        .into_iter()
        .filter(|t| t.trip_update.is_some())
        .map(|t| (t.id.clone(), t))
        .collect();

    for position in positions.iter_mut() {
        if let Some(trip_entity) = by_id.remove(&position.id) {
            position.trip_update = trip_entity.trip_update;
        }
    }
}
