//! Measurement points along the beam axis.
//!
//! Every station along X is combined with each cross-section probe, and the
//! resulting point is snapped to the nearest mesh node. Node IDs change with
//! every re-mesh, so a map is only valid for the mesh it was built on.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::expr;
use crate::models::{SectionGeometry, SensorReading};
use crate::spatial::SpatialNodeIndex;

pub const DEFAULT_STATION_STEP: f64 = 10.0;
const MIN_STATION_STEP: f64 = 1.0;
const STATION_TOLERANCE: f64 = 1e-6;

/// User-defined probe; `y` and `z` are expressions over section symbols.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeDefinition {
    pub name: String,
    pub y: String,
    pub z: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorPoint {
    pub node_id: usize,
    pub station: f64,
    pub probe: String,
    /// Requested location before snapping
    pub target: [f64; 3],
}

/// Probe key → resolved node.
pub type SensorMap = BTreeMap<String, SensorPoint>;

/// Fixed probes, as (name, y, z) in section coordinates.
pub fn catalogue_probes(g: &SectionGeometry) -> Vec<(&'static str, f64, f64)> {
    let b = g.profile_width;
    let h = g.profile_height;
    vec![
        ("center", 0.0, g.plate_thickness / 2.0),
        ("weld_left", -(b - g.flange_thickness) / 2.0, 0.0),
        ("weld_right", (b - g.flange_thickness) / 2.0, 0.0),
        ("web_mid", 0.0, -h + g.web_thickness / 2.0),
        ("flange_tip", b / 2.0, -h),
    ]
}

/// Stations `0, step, 2·step, …` through `length` inclusive.
pub fn stations(length: f64, step: f64) -> Vec<f64> {
    let step = if step < MIN_STATION_STEP {
        DEFAULT_STATION_STEP
    } else {
        step
    };
    let mut out = Vec::new();
    if length <= 0.0 {
        out.push(0.0);
        return out;
    }
    let mut i = 0usize;
    loop {
        let x = i as f64 * step;
        if x > length + STATION_TOLERANCE {
            break;
        }
        out.push(x.min(length));
        i += 1;
    }
    if out.last().map_or(true, |last| (length - last).abs() > STATION_TOLERANCE) {
        out.push(length);
    }
    out
}

/// `"<station>_<probe>"`, station printed without a trailing `.0`.
pub fn sensor_key(station: f64, probe: &str) -> String {
    format!("{}_{}", format_station(station), probe)
}

fn format_station(station: f64) -> String {
    let rounded = (station * 1000.0).round() / 1000.0;
    if rounded.fract() == 0.0 {
        format!("{}", rounded as i64)
    } else {
        format!("{}", rounded)
    }
}

/// Split a key back into (station, probe name).
pub fn parse_sensor_key(key: &str) -> Option<(f64, &str)> {
    let (station, probe) = key.split_once('_')?;
    let station = station.parse::<f64>().ok()?;
    if probe.is_empty() {
        return None;
    }
    Some((station, probe))
}

pub struct SensorMapBuilder<'a> {
    index: &'a SpatialNodeIndex,
}

impl<'a> SensorMapBuilder<'a> {
    pub fn new(index: &'a SpatialNodeIndex) -> Self {
        Self { index }
    }

    pub fn build(
        &self,
        length: f64,
        geometry: &SectionGeometry,
        user_probes: &[ProbeDefinition],
        station_step: f64,
    ) -> SensorMap {
        let mut map = SensorMap::new();
        if !self.index.is_loaded() {
            tracing::warn!("Node index not loaded; sensor map is empty");
            return map;
        }

        let symbols = geometry.symbols(length);
        let mut probes: Vec<(String, f64, f64)> = catalogue_probes(geometry)
            .into_iter()
            .map(|(name, y, z)| (name.to_string(), y, z))
            .collect();
        for probe in user_probes {
            if probes.iter().any(|(name, _, _)| name == &probe.name) {
                tracing::warn!("Skipping probe '{}': name already in use", probe.name);
                continue;
            }
            let y = expr::evaluate(&probe.y, &symbols);
            let z = expr::evaluate(&probe.z, &symbols);
            match (y, z) {
                (Ok(y), Ok(z)) => probes.push((probe.name.clone(), y, z)),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!("Skipping probe '{}': {}", probe.name, e);
                }
            }
        }

        for station in stations(length, station_step) {
            for (name, y, z) in &probes {
                let Some(node_id) = self.index.nearest_node(station, *y, *z) else {
                    continue;
                };
                map.insert(
                    sensor_key(station, name),
                    SensorPoint {
                        node_id,
                        station,
                        probe: name.clone(),
                        target: [station, *y, *z],
                    },
                );
            }
        }

        tracing::info!(
            "Sensor map: {} points over {} probes",
            map.len(),
            probes.len()
        );
        map
    }
}

/// Readings grouped by probe name, each group ordered by station.
pub fn group_by_probe(readings: &[SensorReading]) -> BTreeMap<String, Vec<SensorReading>> {
    let mut groups: BTreeMap<String, Vec<SensorReading>> = BTreeMap::new();
    for reading in readings {
        if let Some((_, probe)) = parse_sensor_key(&reading.key) {
            groups.entry(probe.to_string()).or_default().push(reading.clone());
        }
    }
    for group in groups.values_mut() {
        group.sort_by(|a, b| a.station.total_cmp(&b.station));
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> SectionGeometry {
        SectionGeometry {
            profile_height: 100.0,
            profile_width: 50.0,
            web_thickness: 6.0,
            flange_thickness: 8.0,
            plate_thickness: 10.0,
            plate_width: 200.0,
        }
    }

    #[test]
    fn test_stations_exact_multiple() {
        assert_eq!(stations(1000.0, 250.0), vec![0.0, 250.0, 500.0, 750.0, 1000.0]);
    }

    #[test]
    fn test_stations_clamp_small_step() {
        let s = stations(30.0, 0.0);
        assert_eq!(s, vec![0.0, 10.0, 20.0, 30.0]);
        assert_eq!(stations(30.0, 0.5), s);
    }

    #[test]
    fn test_stations_always_sample_length() {
        assert_eq!(stations(1000.0, 300.0), vec![0.0, 300.0, 600.0, 900.0, 1000.0]);
        let s = stations(1.0, 0.1 + 0.2 + 0.7);
        assert_eq!(s.last().copied(), Some(1.0));
    }

    #[test]
    fn test_key_round_trip() {
        assert_eq!(sensor_key(250.0, "weld_left"), "250_weld_left");
        assert_eq!(sensor_key(12.5, "center"), "12.5_center");
        assert_eq!(parse_sensor_key("250_weld_left"), Some((250.0, "weld_left")));
        assert_eq!(parse_sensor_key("center"), None);
    }

    #[test]
    fn test_build_skips_bad_user_probe() {
        let mut nodes = Vec::new();
        let mut id = 1;
        for x in [0.0, 500.0, 1000.0] {
            for (y, z) in [(0.0, 5.0), (-21.0, 0.0), (21.0, 0.0), (0.0, -97.0), (25.0, -100.0), (0.0, -50.0)] {
                nodes.push((id, [x, y, z]));
                id += 1;
            }
        }
        let index = SpatialNodeIndex::from_nodes(nodes);
        let probes = vec![
            ProbeDefinition { name: "mid_depth".into(), y: "0".into(), z: "-h/2".into() },
            ProbeDefinition { name: "broken".into(), y: "b +".into(), z: "0".into() },
        ];
        let map = SensorMapBuilder::new(&index).build(1000.0, &geometry(), &probes, 500.0);

        assert_eq!(map.len(), 3 * 6);
        assert!(!map.keys().any(|k| k.ends_with("broken")));
        assert_eq!(map["0_center"].node_id, 1);
        assert_eq!(map["500_mid_depth"].node_id, 12);
        assert_eq!(map["1000_flange_tip"].node_id, 17);
    }

    #[test]
    fn test_catalogue_names_win_over_user_definitions() {
        let index = SpatialNodeIndex::from_nodes(vec![(1, [0.0, 0.0, 5.0]), (2, [0.0, 25.0, -100.0])]);
        let probes = vec![
            ProbeDefinition { name: "center".into(), y: "b/2".into(), z: "-h".into() },
            ProbeDefinition { name: "tip".into(), y: "b/2".into(), z: "-h".into() },
            ProbeDefinition { name: "tip".into(), y: "0".into(), z: "tp/2".into() },
        ];
        let map = SensorMapBuilder::new(&index).build(0.0, &geometry(), &probes, 100.0);

        assert_eq!(map["0_center"].node_id, 1);
        assert_eq!(map["0_center"].target, [0.0, 0.0, 5.0]);
        assert_eq!(map["0_tip"].node_id, 2);
        assert_eq!(map.len(), 6);
    }

    #[test]
    fn test_unloaded_index_builds_empty_map() {
        let index = SpatialNodeIndex::new();
        let map = SensorMapBuilder::new(&index).build(100.0, &geometry(), &[], 50.0);
        assert!(map.is_empty());
    }

    #[test]
    fn test_group_by_probe_orders_stations() {
        let reading = |key: &str, station: f64| SensorReading {
            key: key.to_string(),
            node_id: 1,
            station,
            displacement: [0.0; 3],
            displacement_magnitude: 0.0,
            von_mises: 0.0,
        };
        let readings = vec![
            reading("500_center", 500.0),
            reading("0_center", 0.0),
            reading("0_web_mid", 0.0),
        ];
        let groups = group_by_probe(&readings);
        let stations: Vec<f64> = groups["center"].iter().map(|r| r.station).collect();
        assert_eq!(stations, vec![0.0, 500.0]);
        assert_eq!(groups["web_mid"].len(), 1);
    }
}
