use anyhow::{Context, Result};
use compact_str::CompactString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

// One row of a GTFS stops.txt, only the columns the endpoint serves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stop {
    pub stop_id: CompactString,
    #[serde(default)]
    pub stop_name: Option<String>,
    #[serde(default)]
    pub stop_lat: Option<f64>,
    #[serde(default)]
    pub stop_lon: Option<f64>,
}

pub type StopsMap = HashMap<CompactString, Stop>;

pub fn load_stops(path: &Path) -> Result<StopsMap> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("reading {}", path.display()))?;

    let mut stops = StopsMap::new();
    for record in reader.deserialize() {
        let stop: Stop = record.context("parsing stops row")?;
        stops.insert(stop.stop_id.clone(), stop);
    }
    Ok(stops)
}
