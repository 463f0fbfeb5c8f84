/* Generic tree structures for storage of spatial data.
Copyright (C) 2023  Alexander Pyattaev

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

//! Settings used during the tree building process.

use crate::coords::TreeType;
use crate::error::{BuildError, IoContext, Result};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::Path;

/// Sampling method used for selecting points kept by a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMethod {
    /// Subdivides space into smaller cells and picks points nearest to their centers.
    #[default]
    CellCenter,
    /// Picks points with Poisson-disk method.
    PoissonDisk,
}

pub const ROOT_NODE_SUBDIVISION_RANGE: RangeInclusive<u32> = 16..=128;
pub const THREAD_COUNT_RANGE: RangeInclusive<usize> = 1..=32;
pub const MAX_TREE_DEPTH_RANGE: RangeInclusive<usize> = 1..=32;

/// All settings for node tree generation.
///
/// Loadable from TOML; missing keys take the defaults below.
/// ```
/// # use pointcloud_tree::*;
/// let settings = BuildSettings::from_toml_str(r#"
///     tree_type = "quadtree"
///     sampling = "poisson_disk"
///     thread_count = 4
/// "#).unwrap();
/// assert_eq!(settings.tree_type, TreeType::Quadtree);
/// assert_eq!(settings.root_node_subdivision, 64);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSettings {
    /// Internal data structure that should be used by the tree.
    pub tree_type: TreeType,

    /// Sampling method that should be used by the tree.
    pub sampling: SamplingMethod,

    /// Distance between points in root node, relative to bounds. 64 means size/64 distance.
    pub root_node_subdivision: u32,

    /// Nodes receiving fewer points than this in one pass become leaves.
    pub node_branch_threshold: usize,

    /// Depth (root is 0) at which nodes stop being processed. A node at this depth is kept
    /// only if it became a leaf directly, otherwise its points are discarded.
    pub max_tree_depth: usize,

    /// If set, nodes whose sampling distance falls below this value are discarded and
    /// points of newly created leaves are thinned to this spacing.
    pub min_point_distance: Option<f64>,

    /// Amount of worker threads used for building the tree.
    /// Note: each thread allocates its own buffers.
    pub thread_count: usize,

    /// Amount of points stored in a single chunk.
    /// Affects per-thread memory requirements during processing.
    pub chunk_size: usize,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            tree_type: TreeType::Octree,
            sampling: SamplingMethod::CellCenter,
            root_node_subdivision: 64,
            node_branch_threshold: 64 * 64 * 8,
            max_tree_depth: 12,
            min_point_distance: None,
            thread_count: 8,
            chunk_size: 8_000_000,
        }
    }
}

impl BuildSettings {
    /// Parses settings from TOML text and validates them.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let settings: Self = toml::from_str(text)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads settings from a TOML file and validates them.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).at(path)?;
        Self::from_toml_str(&text)
    }

    /// Checks all values, returning the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if !ROOT_NODE_SUBDIVISION_RANGE.contains(&self.root_node_subdivision) {
            return Err(BuildError::config(format!(
                "root_node_subdivision must be within {ROOT_NODE_SUBDIVISION_RANGE:?}, got {}",
                self.root_node_subdivision
            )));
        }
        if !THREAD_COUNT_RANGE.contains(&self.thread_count) {
            return Err(BuildError::config(format!(
                "thread_count must be within {THREAD_COUNT_RANGE:?}, got {}",
                self.thread_count
            )));
        }
        if !MAX_TREE_DEPTH_RANGE.contains(&self.max_tree_depth) {
            return Err(BuildError::config(format!(
                "max_tree_depth must be within {MAX_TREE_DEPTH_RANGE:?}, got {}",
                self.max_tree_depth
            )));
        }
        if self.chunk_size == 0 || self.chunk_size > crate::point::max_array_size() {
            return Err(BuildError::config(format!(
                "chunk_size must be within 1..={}, got {}",
                crate::point::max_array_size(),
                self.chunk_size
            )));
        }
        // a full buffer must always go to a temp file, else a child could be finalized twice
        if self.node_branch_threshold == 0 || self.node_branch_threshold > self.chunk_size {
            return Err(BuildError::config(format!(
                "node_branch_threshold must be within 1..=chunk_size ({}), got {}",
                self.chunk_size, self.node_branch_threshold
            )));
        }
        if let Some(d) = self.min_point_distance {
            if !(d.is_finite() && d > 0.0) {
                return Err(BuildError::config(format!(
                    "min_point_distance must be a positive number, got {d}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        BuildSettings::default().validate().unwrap();
    }

    #[test]
    fn rejects_out_of_range() {
        let mut s = BuildSettings::default();
        s.thread_count = 0;
        assert!(matches!(s.validate(), Err(BuildError::Config(_))));

        let mut s = BuildSettings::default();
        s.root_node_subdivision = 8;
        assert!(matches!(s.validate(), Err(BuildError::Config(_))));

        let mut s = BuildSettings::default();
        s.chunk_size = 1000;
        s.node_branch_threshold = 1001;
        assert!(matches!(s.validate(), Err(BuildError::Config(_))));

        let mut s = BuildSettings::default();
        s.min_point_distance = Some(-1.0);
        assert!(matches!(s.validate(), Err(BuildError::Config(_))));
    }

    #[test]
    fn parse_toml() {
        let s = BuildSettings::from_toml_str(
            r#"
            sampling = "cell_center"
            chunk_size = 1000
            node_branch_threshold = 500
            min_point_distance = 0.01
            "#,
        )
        .unwrap();
        assert_eq!(s.chunk_size, 1000);
        assert_eq!(s.min_point_distance, Some(0.01));
        assert_eq!(s.tree_type, TreeType::Octree);

        assert!(matches!(
            BuildSettings::from_toml_str("no_such_key = 1"),
            Err(BuildError::Settings(_))
        ));
        // parses but fails validation
        assert!(matches!(
            BuildSettings::from_toml_str("thread_count = 64"),
            Err(BuildError::Config(_))
        ));
    }
}
