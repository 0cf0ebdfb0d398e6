//! Nearest-node lookup over the mesh node table

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use rayon::prelude::*;

/// Below this many nodes the linear scan is used directly.
const PARALLEL_THRESHOLD: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct SpatialNodeIndex {
    ids: Vec<usize>,
    coords: Vec<[f64; 3]>,
    by_id: HashMap<usize, [f64; 3]>,
}

impl SpatialNodeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a node table. A missing or malformed table leaves the index
    /// unloaded; check [`is_loaded`](Self::is_loaded) before querying.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => {
                let index = Self::from_table(&content);
                if !index.is_loaded() {
                    tracing::warn!("Node table {:?} contained no usable rows", path);
                }
                index
            }
            Err(e) => {
                tracing::warn!("Failed to read node table {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Parse `ID, X, Y, Z` rows after one header line. Comma, semicolon and
    /// whitespace separators are accepted. Any malformed row, including a
    /// non-finite coordinate, invalidates the whole table.
    pub fn from_table(content: &str) -> Self {
        let mut index = Self::default();
        for line in content.lines().skip(1) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line
                .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                .filter(|t| !t.is_empty())
                .collect();
            if fields.len() < 4 {
                return Self::default();
            }
            let parsed = (
                fields[0].parse::<f64>().ok().filter(|v| *v >= 0.0 && v.fract() == 0.0),
                fields[1].parse::<f64>(),
                fields[2].parse::<f64>(),
                fields[3].parse::<f64>(),
            );
            match parsed {
                (Some(id), Ok(x), Ok(y), Ok(z)) if x.is_finite() && y.is_finite() && z.is_finite() => {
                    let id = id as usize;
                    index.ids.push(id);
                    index.coords.push([x, y, z]);
                    index.by_id.insert(id, [x, y, z]);
                }
                _ => return Self::default(),
            }
        }
        index
    }

    pub fn from_nodes(nodes: impl IntoIterator<Item = (usize, [f64; 3])>) -> Self {
        let mut index = Self::default();
        for (id, xyz) in nodes {
            index.ids.push(id);
            index.coords.push(xyz);
            index.by_id.insert(id, xyz);
        }
        index
    }

    pub fn is_loaded(&self) -> bool {
        !self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn coordinates(&self, id: usize) -> Option<[f64; 3]> {
        self.by_id.get(&id).copied()
    }

    pub fn max_id(&self) -> Option<usize> {
        self.ids.iter().copied().max()
    }

    /// Closest node to `(x, y, z)`; ties go to the earliest node in the table.
    pub fn nearest_node(&self, x: f64, y: f64, z: f64) -> Option<usize> {
        let target = [x, y, z];
        let best = if self.coords.len() >= PARALLEL_THRESHOLD {
            self.nearest_parallel(target)
        } else {
            self.nearest_linear(target)
        };
        best.map(|idx| self.ids[idx])
    }

    /// Sequential scan, strict `<` so the first minimum wins.
    pub fn nearest_linear(&self, target: [f64; 3]) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (idx, c) in self.coords.iter().enumerate() {
            let d2 = squared_distance(c, &target);
            match best {
                Some((_, best_d2)) if d2 >= best_d2 => {}
                _ => best = Some((idx, d2)),
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Parallel squared-distance reduction. Ties compare on storage index so
    /// the result matches [`nearest_linear`](Self::nearest_linear) exactly.
    pub fn nearest_parallel(&self, target: [f64; 3]) -> Option<usize> {
        self.coords
            .par_iter()
            .enumerate()
            .map(|(idx, c)| (squared_distance(c, &target), idx))
            .reduce_with(|a, b| {
                if b.0 < a.0 || (b.0 == a.0 && b.1 < a.1) {
                    b
                } else {
                    a
                }
            })
            .map(|(_, idx)| idx)
    }
}

fn squared_distance(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx * dx + dy * dy + dz * dz
}
