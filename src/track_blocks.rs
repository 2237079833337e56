use crate::geometry::LatLon;
use anyhow::{Context, Result};
use indexmap::IndexMap;
use log::{debug, warn};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

// A polygonal region of the rail map addressing one LED on the display
// board. Immutable after load.
#[derive(Clone, Debug)]
pub struct TrackBlock {
    pub block_number: u32,
    // paired LED for two-train situations, parsed from +NNN in the name
    pub alt_block: Option<u32>,
    pub name: String,
    // blocks named with a run of 3+ letters are searched before plain ones
    pub priority: bool,
    pub routes: Option<Vec<String>>,
    pub polygon: Vec<LatLon>,
    pub platforms: Option<Vec<Platform>>,
}

#[derive(Clone, Debug)]
pub struct Platform {
    pub block_number: u32,
    pub stop_ids: Option<Vec<String>>,
    pub is_default: bool,
    pub bearing: Option<f64>,
    pub routes: Option<Vec<String>>,
}

impl TrackBlock {
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        crate::geometry::is_point_in_polygon(lat, lon, &self.polygon)
    }

    // Route filters match by substring inclusion, not equality.
    pub fn permits_route(&self, route: &str) -> bool {
        routes_permit(&self.routes, route)
    }
}

impl Platform {
    pub fn permits_route(&self, route: &str) -> bool {
        routes_permit(&self.routes, route)
    }
}

pub fn routes_permit(routes: &Option<Vec<String>>, route: &str) -> bool {
    match routes {
        Some(list) if !list.is_empty() => list.iter().any(|r| route.contains(r.as_str())),
        _ => true,
    }
}

// Block lookup plus the canonical iteration order the assignment search
// depends on: blocks with route filters first, then priority blocks,
// insertion order within groups.
pub struct TrackBlockMap {
    blocks: IndexMap<u32, TrackBlock>,
}

impl TrackBlockMap {
    pub fn new() -> Self {
        Self {
            blocks: IndexMap::new(),
        }
    }

    pub fn from_blocks(mut blocks: Vec<TrackBlock>) -> Self {
        // Stable sort: ties keep the file order.
        blocks.sort_by_key(|b| {
            let has_routes = b.routes.as_ref().is_some_and(|r| !r.is_empty());
            (!has_routes, !b.priority)
        });

        let mut map = IndexMap::new();
        for block in blocks {
            if map.contains_key(&block.block_number) {
                warn!(
                    "Duplicate track block {} ({}), keeping the first definition",
                    block.block_number, block.name
                );
                continue;
            }
            map.insert(block.block_number, block);
        }
        Self { blocks: map }
    }

    // Resolves a block number that may be a platform number or an alt
    // block back to the block whose polygon it lives in.
    pub fn polygon_owner(&self, block_number: u32) -> Option<&TrackBlock> {
        if let Some(b) = self.blocks.get(&block_number) {
            return Some(b);
        }
        self.blocks.values().find(|b| {
            b.alt_block == Some(block_number)
                || b.platforms
                    .as_ref()
                    .is_some_and(|ps| ps.iter().any(|p| p.block_number == block_number))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackBlock> {
        self.blocks.values()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

// KML structure: Document -> Folder -> Placemark. Placemarks carry the
// polygon either directly in <coordinates> or nested in a <Polygon>.

#[derive(Debug, Default, Deserialize)]
struct KmlRoot {
    #[serde(rename = "Document", default)]
    document: Option<KmlDocument>,
    #[serde(rename = "Folder", default)]
    folders: Vec<KmlFolder>,
    #[serde(rename = "Placemark", default)]
    placemarks: Vec<KmlPlacemark>,
}

#[derive(Debug, Default, Deserialize)]
struct KmlDocument {
    #[serde(rename = "Folder", default)]
    folders: Vec<KmlFolder>,
    #[serde(rename = "Placemark", default)]
    placemarks: Vec<KmlPlacemark>,
}

#[derive(Debug, Default, Deserialize)]
struct KmlFolder {
    #[serde(rename = "Placemark", default)]
    placemarks: Vec<KmlPlacemark>,
}

#[derive(Debug, Default, Deserialize)]
struct KmlPlacemark {
    name: Option<String>,
    description: Option<String>,
    #[serde(rename = "Polygon")]
    polygon: Option<KmlPolygon>,
    coordinates: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct KmlPolygon {
    #[serde(rename = "outerBoundaryIs")]
    outer: Option<KmlBoundary>,
}

#[derive(Debug, Default, Deserialize)]
struct KmlBoundary {
    #[serde(rename = "LinearRing")]
    ring: Option<KmlRing>,
}

#[derive(Debug, Default, Deserialize)]
struct KmlRing {
    coordinates: Option<String>,
}

impl KmlPlacemark {
    fn coordinates(&self) -> Option<&str> {
        if let Some(c) = &self.coordinates {
            return Some(c);
        }
        self.polygon
            .as_ref()?
            .outer
            .as_ref()?
            .ring
            .as_ref()?
            .coordinates
            .as_deref()
    }
}

pub fn load_track_blocks(path: &Path) -> Result<TrackBlockMap> {
    let xml = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    parse_track_blocks(&xml)
}

pub fn parse_track_blocks(xml: &str) -> Result<TrackBlockMap> {
    let root: KmlRoot = quick_xml::de::from_str(xml).context("parsing track block KML")?;

    let mut placemarks: Vec<&KmlPlacemark> = Vec::new();
    placemarks.extend(root.placemarks.iter());
    for folder in &root.folders {
        placemarks.extend(folder.placemarks.iter());
    }
    if let Some(doc) = &root.document {
        placemarks.extend(doc.placemarks.iter());
        for folder in &doc.folders {
            placemarks.extend(folder.placemarks.iter());
        }
    }

    let mut blocks = Vec::new();
    for placemark in placemarks {
        if let Some(block) = parse_placemark(placemark) {
            blocks.push(block);
        }
    }
    Ok(TrackBlockMap::from_blocks(blocks))
}

fn parse_placemark(placemark: &KmlPlacemark) -> Option<TrackBlock> {
    let name = placemark.name.as_deref().unwrap_or("").trim().to_string();

    let num_re = Regex::new(r"\d+").unwrap();
    let alt_re = Regex::new(r"\+(\d+)").unwrap();
    let routes_re = Regex::new(r"\[([^\]]*)\]").unwrap();
    let priority_re = Regex::new(r"[A-Za-z]{3,}").unwrap();

    let Some(block_number) = num_re
        .find(&name)
        .and_then(|m| m.as_str().parse::<u32>().ok())
    else {
        warn!("Placemark '{}' has no block number, skipping", name);
        return None;
    };

    let alt_block = alt_re
        .captures(&name)
        .and_then(|c| c[1].parse::<u32>().ok());
    let routes = routes_re
        .captures(&name)
        .map(|c| split_route_list(&c[1]));
    let priority = priority_re.is_match(&name);

    let polygon = placemark
        .coordinates()
        .map(parse_coordinates)
        .unwrap_or_default();
    if polygon.len() < 3 {
        warn!(
            "Placemark '{}' has {} polygon vertices, block will never match",
            name,
            polygon.len()
        );
    }

    let platforms = placemark
        .description
        .as_deref()
        .map(|d| parse_platforms(d, &name))
        .filter(|p| !p.is_empty());

    Some(TrackBlock {
        block_number,
        alt_block,
        name,
        priority,
        routes,
        polygon,
        platforms,
    })
}

// KML coordinates are whitespace-separated lon,lat[,alt] triples.
fn parse_coordinates(raw: &str) -> Vec<LatLon> {
    let mut vertices = Vec::new();
    for token in raw.split_whitespace() {
        let mut parts = token.split(',');
        let lon = parts.next().and_then(|v| v.trim().parse::<f64>().ok());
        let lat = parts.next().and_then(|v| v.trim().parse::<f64>().ok());
        match (lat, lon) {
            (Some(lat), Some(lon)) => vertices.push(LatLon { lat, lon }),
            _ => warn!("Unparseable coordinate tuple '{}'", token),
        }
    }
    vertices
}

// One description line per platform: the first field is the platform's
// block number, the rest are detected by shape. Quoted or semicolon
// separated values are stop ids, "Default" marks the fallback platform,
// NNNdeg is an approach bearing, [...] is a route filter.
fn parse_platforms(description: &str, block_name: &str) -> Vec<Platform> {
    let num_re = Regex::new(r"\d+").unwrap();
    let mut platforms: Vec<Platform> = Vec::new();

    for line in description.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields = split_fields(line);
        if fields.is_empty() {
            continue;
        }

        let Some(block_number) = num_re
            .find(&fields[0])
            .and_then(|m| m.as_str().parse::<u32>().ok())
        else {
            warn!(
                "Platform line '{}' in block '{}' has no block number, skipping",
                line, block_name
            );
            continue;
        };

        let mut platform = Platform {
            block_number,
            stop_ids: None,
            is_default: false,
            bearing: None,
            routes: None,
        };

        for field in fields.iter().skip(1) {
            if field == "Default" {
                platform.is_default = true;
            } else if field.starts_with('[') && field.ends_with(']') {
                platform.routes = Some(split_route_list(&field[1..field.len() - 1]));
            } else if let Some(bearing) = parse_bearing(field) {
                platform.bearing = Some(bearing);
            } else if field.contains('"') || field.contains(';') {
                let ids: Vec<String> = field
                    .split(';')
                    .map(|s| s.trim().trim_matches('"').to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                if !ids.is_empty() {
                    platform.stop_ids = Some(ids);
                }
            } else {
                debug!(
                    "Unrecognized platform field '{}' in block '{}'",
                    field, block_name
                );
            }
        }

        if platforms.iter().any(|p| p.block_number == block_number) {
            warn!(
                "Duplicate platform block number {} in block '{}'",
                block_number, block_name
            );
        }
        platforms.push(platform);
    }

    validate_bearings(&platforms, block_name);
    platforms
}

// Platform bearings within one block describe the two directions of the
// same piece of track, so they must be equal or opposite.
fn validate_bearings(platforms: &[Platform], block_name: &str) {
    let bearings: Vec<f64> = platforms.iter().filter_map(|p| p.bearing).collect();
    for (i, a) in bearings.iter().enumerate() {
        for b in &bearings[i + 1..] {
            let diff = crate::geometry::bearing_difference(*a, *b);
            if diff > 0.01 && (diff - 180.0).abs() > 0.01 {
                warn!(
                    "Platform bearings {} and {} in block '{}' are neither equal nor opposite",
                    a, b, block_name
                );
            }
        }
    }
}

fn parse_bearing(field: &str) -> Option<f64> {
    let raw = field.strip_suffix("deg")?;
    let value: f64 = raw.trim().parse().ok()?;
    Some(((value % 360.0) + 360.0) % 360.0)
}

fn split_route_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// Comma split that leaves [...] groups intact.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut depth = 0u32;
    for ch in line.chars() {
        match ch {
            '[' => {
                depth += 1;
                current.push(ch);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => {
                fields.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(ch),
        }
    }
    fields.push(current.trim().to_string());
    fields.retain(|f| !f.is_empty());
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_KML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<kml xmlns="http://www.opengis.net/kml/2.2">
  <Document>
    <Folder>
      <Placemark>
        <name>101 BRITOMART</name>
        <description>303,"S3";"S31"
304,"S4",Default,90deg,[EAST]</description>
        <Polygon><outerBoundaryIs><LinearRing><coordinates>
          174.76,-36.85,0 174.77,-36.85,0 174.77,-36.84,0 174.76,-36.84,0
        </coordinates></LinearRing></outerBoundaryIs></Polygon>
      </Placemark>
      <Placemark>
        <name>200+201 [EAST,WEST]</name>
        <Polygon><outerBoundaryIs><LinearRing><coordinates>
          174.80,-36.90 174.81,-36.90 174.81,-36.89 174.80,-36.89
        </coordinates></LinearRing></outerBoundaryIs></Polygon>
      </Placemark>
      <Placemark>
        <name>45</name>
        <Polygon><outerBoundaryIs><LinearRing><coordinates>
          174.70,-36.80 174.71,-36.80 174.71,-36.79 174.70,-36.79
        </coordinates></LinearRing></outerBoundaryIs></Polygon>
      </Placemark>
      <Placemark>
        <name>no digits here</name>
      </Placemark>
    </Folder>
  </Document>
</kml>"#;

    fn block_by_number(map: &TrackBlockMap, n: u32) -> &TrackBlock {
        map.iter().find(|b| b.block_number == n).unwrap()
    }

    #[test]
    fn test_parse_sample_kml() {
        let map = parse_track_blocks(SAMPLE_KML).unwrap();
        assert_eq!(map.len(), 3, "placemark without digits is skipped");

        let station = block_by_number(&map, 101);
        assert!(station.priority, "BRITOMART is a letter run");
        assert_eq!(station.alt_block, None);
        assert_eq!(station.polygon.len(), 4);
        let platforms = station.platforms.as_ref().unwrap();
        assert_eq!(platforms.len(), 2);
        assert_eq!(platforms[0].block_number, 303);
        assert_eq!(
            platforms[0].stop_ids.as_ref().unwrap(),
            &vec!["S3".to_string(), "S31".to_string()]
        );
        assert!(!platforms[0].is_default);
        assert_eq!(platforms[1].block_number, 304);
        assert!(platforms[1].is_default);
        assert_eq!(platforms[1].bearing, Some(90.0));
        assert_eq!(platforms[1].routes.as_ref().unwrap(), &vec!["EAST".to_string()]);

        let double = block_by_number(&map, 200);
        assert_eq!(double.alt_block, Some(201));
        assert_eq!(
            double.routes.as_ref().unwrap(),
            &vec!["EAST".to_string(), "WEST".to_string()]
        );
        assert!(!double.priority);

        let plain = block_by_number(&map, 45);
        assert!(!plain.priority);
        assert!(plain.routes.is_none());
    }

    #[test]
    fn test_iteration_order_contract() {
        let map = parse_track_blocks(SAMPLE_KML).unwrap();
        let order: Vec<u32> = map.iter().map(|b| b.block_number).collect();
        // Routed block first, then priority, then the rest in file order.
        assert_eq!(order, vec![200, 101, 45]);
    }

    #[test]
    fn test_polygon_owner_resolution() {
        let map = parse_track_blocks(SAMPLE_KML).unwrap();
        assert_eq!(map.polygon_owner(101).unwrap().block_number, 101);
        assert_eq!(map.polygon_owner(303).unwrap().block_number, 101, "platform");
        assert_eq!(map.polygon_owner(201).unwrap().block_number, 200, "alt block");
        assert!(map.polygon_owner(999).is_none());
    }

    #[test]
    fn test_bearing_normalization() {
        assert_eq!(parse_bearing("-90deg"), Some(270.0));
        assert_eq!(parse_bearing("450deg"), Some(90.0));
        assert_eq!(parse_bearing("90deg"), Some(90.0));
        assert_eq!(parse_bearing("Default"), None);
        assert_eq!(parse_bearing("degrees"), None);
    }

    #[test]
    fn test_split_fields_keeps_brackets() {
        let fields = split_fields("304,\"S4\",Default,[EAST,WEST],90deg");
        assert_eq!(fields, vec!["304", "\"S4\"", "Default", "[EAST,WEST]", "90deg"]);
    }

    #[test]
    fn test_route_substring_matching() {
        let routes = Some(vec!["EAST".to_string()]);
        assert!(routes_permit(&routes, "EAST-201"));
        assert!(!routes_permit(&routes, "WEST-101"));
        assert!(routes_permit(&None, "anything"));
        assert!(routes_permit(&Some(vec![]), "anything"));
    }
}
