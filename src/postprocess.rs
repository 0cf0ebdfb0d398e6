//! Derived quantities from a scanned report: nodal stress, reaction sums,
//! end rotation, interface shear and sensor readings.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::error::FeaResult;
use crate::mesh::{groups, MeshConnectivity, NodeGroups};
use crate::models::{
    InterfaceShearPoint, IterationResult, NodeStress, ReactionSummary, SensorReading,
    StressTensor,
};
use crate::parser::RawReport;
use crate::sensors::SensorMap;
use crate::spatial::SpatialNodeIndex;

/// Smallest transverse separation for which a rotation is estimated.
pub const MIN_ROTATION_BASE: f64 = 1e-6;

/// Node ID → IDs of the elements containing it.
pub type NodeAdjacency = HashMap<usize, Vec<usize>>;

pub fn build_adjacency(mesh: &MeshConnectivity) -> NodeAdjacency {
    let mut adjacency: NodeAdjacency = HashMap::new();
    for element in &mesh.elements {
        for node in &element.nodes {
            adjacency.entry(*node).or_default().push(element.id);
        }
    }
    adjacency
}

/// Average the element tensors around every node, then take von Mises of
/// the averaged tensor. Element tensors are the mean over their
/// integration points. Nodes without stressed neighbours get zero stress.
pub fn average_nodal_stress(
    node_ids: &[usize],
    adjacency: &NodeAdjacency,
    element_stresses: &BTreeMap<usize, Vec<StressTensor>>,
) -> BTreeMap<usize, NodeStress> {
    let element_means: HashMap<usize, StressTensor> = element_stresses
        .iter()
        .map(|(id, points)| (*id, StressTensor::mean(points)))
        .collect();

    node_ids
        .iter()
        .map(|&node_id| {
            let tensor = adjacency
                .get(&node_id)
                .map(|elements| StressTensor::mean(elements.iter().filter_map(|e| element_means.get(e))))
                .unwrap_or_default();
            (
                node_id,
                NodeStress {
                    node_id,
                    tensor,
                    von_mises: tensor.von_mises(),
                },
            )
        })
        .collect()
}

/// ΣF over the support nodes and Σ r × F about the global origin.
pub fn sum_reactions(
    support: &[usize],
    reactions: &BTreeMap<usize, [f64; 3]>,
    index: &SpatialNodeIndex,
) -> ReactionSummary {
    let mut summary = ReactionSummary::default();
    for node in support {
        let Some(f) = reactions.get(node) else {
            continue;
        };
        for i in 0..3 {
            summary.force[i] += f[i];
        }
        if let Some(r) = index.coordinates(*node) {
            summary.moment[0] += r[1] * f[2] - r[2] * f[1];
            summary.moment[1] += r[2] * f[0] - r[0] * f[2];
            summary.moment[2] += r[0] * f[1] - r[1] * f[0];
        }
    }
    summary
}

/// Torsional rotation of the loaded end from the two load-face nodes with
/// extreme Y: atan(Δuz / Δy). Zero when the nodes are too close.
pub fn rotation_estimate(
    load_face: &[usize],
    displacements: &BTreeMap<usize, [f64; 3]>,
    index: &SpatialNodeIndex,
) -> f64 {
    let mut low: Option<(usize, [f64; 3])> = None;
    let mut high: Option<(usize, [f64; 3])> = None;
    for node in load_face {
        let Some(c) = index.coordinates(*node) else {
            continue;
        };
        if low.map_or(true, |(_, l)| c[1] < l[1]) {
            low = Some((*node, c));
        }
        if high.map_or(true, |(_, h)| c[1] > h[1]) {
            high = Some((*node, c));
        }
    }
    let (Some((low_id, low_c)), Some((high_id, high_c))) = (low, high) else {
        return 0.0;
    };
    let base = high_c[1] - low_c[1];
    if base < MIN_ROTATION_BASE {
        return 0.0;
    }
    let uz = |id: usize| displacements.get(&id).map_or(0.0, |u| u[2]);
    ((uz(high_id) - uz(low_id)) / base).atan()
}

/// Shear magnitude √(τxz² + τyz²) along the interface, ordered by X.
pub fn interface_shear(
    interface: &[usize],
    nodal: &BTreeMap<usize, NodeStress>,
    index: &SpatialNodeIndex,
) -> Vec<InterfaceShearPoint> {
    let mut points: Vec<InterfaceShearPoint> = interface
        .iter()
        .filter_map(|&node_id| {
            let x = index.coordinates(node_id)?[0];
            let t = nodal.get(&node_id).map(|s| s.tensor).unwrap_or_default();
            Some(InterfaceShearPoint {
                node_id,
                x,
                shear: (t.sxz * t.sxz + t.syz * t.syz).sqrt(),
            })
        })
        .collect();
    points.sort_by(|a, b| a.x.total_cmp(&b.x).then(a.node_id.cmp(&b.node_id)));
    points
}

pub fn sensor_readings(
    sensors: &SensorMap,
    displacements: &BTreeMap<usize, [f64; 3]>,
    nodal: &BTreeMap<usize, NodeStress>,
) -> Vec<SensorReading> {
    sensors
        .iter()
        .map(|(key, point)| {
            let u = displacements.get(&point.node_id).copied().unwrap_or_default();
            SensorReading {
                key: key.clone(),
                node_id: point.node_id,
                station: point.station,
                displacement: u,
                displacement_magnitude: (u[0] * u[0] + u[1] * u[1] + u[2] * u[2]).sqrt(),
                von_mises: nodal.get(&point.node_id).map_or(0.0, |s| s.von_mises),
            }
        })
        .collect()
}

/// Turns a report into an [`IterationResult`] for one mesh.
pub struct ResultsParser<'a> {
    pub connectivity: &'a MeshConnectivity,
    pub groups: &'a NodeGroups,
    pub index: &'a SpatialNodeIndex,
    pub sensors: &'a SensorMap,
}

impl<'a> ResultsParser<'a> {
    pub fn parse(&self, report_path: &Path) -> FeaResult<IterationResult> {
        let raw = RawReport::load(report_path, groups::SUPPORT)?;
        Ok(self.evaluate(&raw))
    }

    pub fn evaluate(&self, raw: &RawReport) -> IterationResult {
        let empty = Vec::new();
        let group = |name: &str| self.groups.get(name).unwrap_or(&empty);

        let adjacency = build_adjacency(self.connectivity);
        let nodal = average_nodal_stress(&self.connectivity.node_ids, &adjacency, &raw.element_stresses);

        let (max_von_mises, max_von_mises_node) = nodal
            .values()
            .fold((0.0_f64, None), |(max, node), s| {
                if s.von_mises > max {
                    (s.von_mises, Some(s.node_id))
                } else {
                    (max, node)
                }
            });

        let max_displacement = raw
            .displacements
            .values()
            .map(|u| (u[0] * u[0] + u[1] * u[1] + u[2] * u[2]).sqrt())
            .fold(0.0_f64, f64::max);

        let interface = interface_shear(group(groups::INTERFACE), &nodal, self.index);
        let max_interface_shear = interface.iter().map(|p| p.shear).fold(0.0_f64, f64::max);

        let converged = max_von_mises > 0.0;
        if !converged {
            tracing::warn!("Report yielded no positive von Mises stress; treating as not converged");
        }

        IterationResult {
            node_count: self.connectivity.node_ids.len(),
            max_von_mises,
            max_von_mises_node,
            max_displacement,
            buckling_factors: raw.buckling_factors.clone(),
            reactions: sum_reactions(group(groups::SUPPORT), &raw.reactions, self.index),
            rotation: rotation_estimate(group(groups::LOAD), &raw.displacements, self.index),
            sensors: sensor_readings(self.sensors, &raw.displacements, &nodal),
            max_interface_shear,
            interface_shear: interface,
            converged,
            ..Default::default()
        }
    }
}
