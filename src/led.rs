use crate::config::{ApiVersionConfig, BlockRemapRule, LedRailsApiConfig};
use crate::tracker::TrainInfo;
use compact_str::CompactString;
use indexmap::IndexMap;
use log::error;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// b is [previous, current] block, c a color id, t the animation offset in
// seconds within the update window. Field names are fixed by the firmware.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedUpdate {
    pub b: [u32; 2],
    pub c: u32,
    pub t: u64,
}

// The wire payload one board revision polls.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedOutput {
    pub version: String,
    pub timestamp: u64,
    pub update: u64,
    pub colors: IndexMap<u32, [u8; 3]>,
    pub updates: Vec<LedUpdate>,
}

// Generator state for one board revision of one network.
#[derive(Clone, Debug)]
pub struct LedRailsApi {
    pub version: String,
    pub url: String,
    pub route_to_color_id: IndexMap<String, u32>,
    pub block_remap: Vec<BlockRemapRule>,
    pub display_threshold: u64,
    pub randomize_time_offset: bool,
    pub update_interval: u64,
    pub output: LedOutput,
}

impl LedRailsApi {
    // Color ids are dense, 0-based, assigned in the declaration order of
    // the config colors map.
    pub fn from_config(
        cfg: &LedRailsApiConfig,
        version_cfg: &ApiVersionConfig,
        mount: &str,
        display_threshold: u64,
        update_interval: u64,
    ) -> Self {
        let mut route_to_color_id = IndexMap::new();
        let mut colors = IndexMap::new();
        for (i, (route, rgb)) in cfg.colors.iter().enumerate() {
            route_to_color_id.insert(route.clone(), i as u32);
            colors.insert(i as u32, *rgb);
        }

        LedRailsApi {
            version: version_cfg.version.clone(),
            url: format!("/{}/{}.json", mount, version_cfg.version),
            route_to_color_id,
            block_remap: version_cfg.block_remap.clone(),
            display_threshold,
            randomize_time_offset: cfg.randomize_time_offset,
            update_interval,
            output: LedOutput {
                version: version_cfg.version.clone(),
                timestamp: 0,
                update: update_interval,
                colors,
                updates: Vec::new(),
            },
        }
    }

    // Rebuilds output.updates from the roster. Stale, invisible, or not
    // fully assigned trains stay off the board.
    pub fn generate(
        &mut self,
        roster: &[TrainInfo],
        invisible: &HashSet<CompactString>,
        now_ms: u64,
    ) {
        self.output.updates.clear();

        let now = now_ms.div_ceil(1000);
        let display_cutoff = now.saturating_sub(self.display_threshold);
        let update_time = now.saturating_sub(self.update_interval);
        let mut rng = rand::thread_rng();

        for train in roster {
            if train.timestamp < display_cutoff {
                continue;
            }
            if invisible.contains(train.train_id.as_str()) {
                continue;
            }
            let (Some(current), Some(previous)) = (train.current_block, train.previous_block)
            else {
                continue;
            };

            let Some(&color) = self.route_to_color_id.get(train.route.as_str()) else {
                error!(
                    "No color mapping for route '{}', dropping train {} from {}",
                    train.route, train.train_id, self.version
                );
                continue;
            };

            let t = if self.randomize_time_offset {
                if previous == current || self.update_interval < 2 {
                    0
                } else {
                    rng.gen_range(1..self.update_interval)
                }
            } else {
                train.timestamp.saturating_sub(update_time)
            };

            self.output.updates.push(LedUpdate {
                b: [previous, current],
                c: color,
                t,
            });
        }

        if !self.block_remap.is_empty() {
            for update in &mut self.output.updates {
                update.b[0] = remap_block(&self.block_remap, update.b[0]);
                update.b[1] = remap_block(&self.block_remap, update.b[1]);
            }
        }

        // Monotone per board revision even if the clock steps back.
        self.output.timestamp = self.output.timestamp.max(now);
    }
}

// First matching range rule wins; unmatched block numbers pass through.
pub fn remap_block(rules: &[BlockRemapRule], block: u32) -> u32 {
    for rule in rules {
        if block >= rule.start && block <= rule.end {
            return (block as i64 + rule.offset as i64).max(0) as u32;
        }
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW_MS: u64 = 1_700_000_000_000;
    const NOW: u64 = 1_700_000_000;

    fn api_config(randomize: bool) -> LedRailsApiConfig {
        let colors: IndexMap<String, [u8; 3]> = IndexMap::from([
            ("WEST".to_string(), [255, 0, 0]),
            ("EAST".to_string(), [0, 255, 0]),
            ("STH".to_string(), [0, 0, 255]),
        ]);
        LedRailsApiConfig {
            api_versions: vec![ApiVersionConfig {
                version: "v1".to_string(),
                block_remap: vec![],
            }],
            randomize_time_offset: randomize,
            colors,
        }
    }

    fn api(randomize: bool) -> LedRailsApi {
        let cfg = api_config(randomize);
        LedRailsApi::from_config(&cfg, &cfg.api_versions[0], "at-ltm", 300, 20)
    }

    fn train(id: &str, route: &str, prev: u32, curr: u32, timestamp: u64) -> TrainInfo {
        TrainInfo {
            train_id: id.into(),
            lat: -36.846,
            lon: 174.765,
            timestamp,
            speed: Some(10.0),
            bearing: None,
            current_block: Some(curr),
            previous_block: Some(prev),
            route: route.to_string(),
            trip_id: None,
            stops: Vec::new(),
        }
    }

    #[test]
    fn test_color_ids_dense_in_declaration_order() {
        let api = api(false);
        assert_eq!(api.route_to_color_id.get("WEST"), Some(&0));
        assert_eq!(api.route_to_color_id.get("EAST"), Some(&1));
        assert_eq!(api.route_to_color_id.get("STH"), Some(&2));
        assert_eq!(api.output.colors.get(&1), Some(&[0, 255, 0]));
        assert_eq!(api.output.colors.len(), 3);
    }

    #[test]
    fn test_generate_single_train() {
        let mut api = api(false);
        let roster = vec![train("A", "EAST", 0, 101, NOW)];
        api.generate(&roster, &HashSet::new(), NOW_MS);

        assert_eq!(api.output.timestamp, NOW);
        assert_eq!(api.output.update, 20);
        assert_eq!(api.output.updates.len(), 1);
        let u = &api.output.updates[0];
        assert_eq!(u.b, [0, 101]);
        assert_eq!(u.c, 1, "EAST is color id 1");
        assert!(u.t <= 20);
    }

    #[test]
    fn test_generate_skips_unknown_route() {
        let mut api = api(false);
        let roster = vec![
            train("A", "EAST", 0, 101, NOW),
            train("B", "FERRY", 0, 102, NOW),
        ];
        api.generate(&roster, &HashSet::new(), NOW_MS);
        assert_eq!(api.output.updates.len(), 1, "unmapped route dropped");
    }

    #[test]
    fn test_generate_skips_invisible_stale_and_unassigned() {
        let mut api = api(false);
        let mut unassigned = train("C", "EAST", 0, 101, NOW);
        unassigned.current_block = None;
        let roster = vec![
            train("A", "EAST", 0, 101, NOW),
            train("B", "EAST", 0, 102, NOW - 3600),
            unassigned,
        ];
        let invisible: HashSet<_> = [CompactString::from("A")].into();
        api.generate(&roster, &invisible, NOW_MS);
        assert!(api.output.updates.is_empty());
    }

    #[test]
    fn test_time_offset_clamped_to_window() {
        let mut api1 = api(false);
        // Reported 5 seconds into the 20 second window.
        let roster = vec![train("A", "EAST", 100, 101, NOW - 15)];
        api1.generate(&roster, &HashSet::new(), NOW_MS);
        assert_eq!(api1.output.updates[0].t, 5);

        // Older than the whole window clamps to zero.
        let mut api2 = api(false);
        let roster = vec![train("A", "EAST", 100, 101, NOW - 120)];
        api2.generate(&roster, &HashSet::new(), NOW_MS);
        assert_eq!(api2.output.updates[0].t, 0);
    }

    #[test]
    fn test_randomized_offset_bounds() {
        let mut api = api(true);
        for _ in 0..50 {
            let roster = vec![train("A", "EAST", 100, 101, NOW)];
            api.generate(&roster, &HashSet::new(), NOW_MS);
            let t = api.output.updates[0].t;
            assert!((1..=19).contains(&t), "got {}", t);
        }

        // Same block on both sides means no animation: offset 0.
        let roster = vec![train("A", "EAST", 101, 101, NOW)];
        api.generate(&roster, &HashSet::new(), NOW_MS);
        assert_eq!(api.output.updates[0].t, 0);
    }

    #[test]
    fn test_block_remap() {
        let cfg = api_config(false);
        let version = ApiVersionConfig {
            version: "v2".to_string(),
            block_remap: vec![BlockRemapRule {
                start: 300,
                end: 399,
                offset: -100,
            }],
        };
        let mut api = LedRailsApi::from_config(&cfg, &version, "at-ltm", 300, 20);
        let roster = vec![train("A", "EAST", 301, 302, NOW)];
        api.generate(&roster, &HashSet::new(), NOW_MS);
        assert_eq!(api.output.updates[0].b, [201, 202]);
    }

    #[test]
    fn test_remap_first_rule_wins_and_passthrough() {
        let rules = vec![
            BlockRemapRule {
                start: 300,
                end: 399,
                offset: -100,
            },
            BlockRemapRule {
                start: 350,
                end: 450,
                offset: 1000,
            },
        ];
        assert_eq!(remap_block(&rules, 350), 250, "first matching rule wins");
        assert_eq!(remap_block(&rules, 440), 1440);
        assert_eq!(remap_block(&rules, 10), 10, "unmatched passes through");
    }

    #[test]
    fn test_remap_idempotent_when_ranges_disjoint() {
        let rules = vec![BlockRemapRule {
            start: 300,
            end: 399,
            offset: -100,
        }];
        let once = remap_block(&rules, 301);
        assert_eq!(remap_block(&rules, once), once, "output outside input range");
    }

    #[test]
    fn test_timestamp_monotone() {
        let mut api = api(false);
        api.generate(&[], &HashSet::new(), NOW_MS);
        let first = api.output.timestamp;
        api.generate(&[], &HashSet::new(), NOW_MS - 5_000);
        assert!(api.output.timestamp >= first, "timestamp never goes backwards");
    }

    #[test]
    fn test_output_json_round_trip() {
        let mut api = api(false);
        let roster = vec![train("A", "EAST", 0, 101, NOW)];
        api.generate(&roster, &HashSet::new(), NOW_MS);

        let json = serde_json::to_string(&api.output).unwrap();
        let back: LedOutput = serde_json::from_str(&json).unwrap();
        assert_eq!(api.output, back);
    }

    #[test]
    fn test_wire_field_names() {
        let mut api = api(false);
        let roster = vec![train("A", "EAST", 0, 101, NOW)];
        api.generate(&roster, &HashSet::new(), NOW_MS);

        let value: serde_json::Value = serde_json::to_value(&api.output).unwrap();
        assert!(value.get("version").is_some());
        assert!(value.get("timestamp").is_some());
        assert!(value.get("update").is_some());
        assert!(value["colors"].get("0").is_some(), "color keys are integers");
        let update = &value["updates"][0];
        assert!(update.get("b").is_some());
        assert!(update.get("c").is_some());
        assert!(update.get("t").is_some());
    }
}
