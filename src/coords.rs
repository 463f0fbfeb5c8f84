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

//! Contains the bounding box type and the two tree layouts, Octree and Quadtree, together with
//! the geometry used to split a node into its children.

use duplicate::duplicate_item;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Index of the vertical axis. Quadtrees never split along it.
pub const VERTICAL_AXIS: usize = 1;

/// Axis aligned bounding box in world space. Upper bounds are inclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Bounds {
    #[inline]
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Self { min, max }
    }

    /// An inverted box that any call to `encapsulate` will replace.
    pub fn empty() -> Self {
        Self {
            min: [f64::INFINITY; 3],
            max: [f64::NEG_INFINITY; 3],
        }
    }

    pub fn from_center_size(center: [f64; 3], size: [f64; 3]) -> Self {
        let half = size.map(|s| 0.5 * s);
        Self {
            min: std::array::from_fn(|i| center[i] - half[i]),
            max: std::array::from_fn(|i| center[i] + half[i]),
        }
    }

    #[inline]
    pub fn center(&self) -> [f64; 3] {
        std::array::from_fn(|i| 0.5 * (self.min[i] + self.max[i]))
    }

    #[inline]
    pub fn size(&self) -> [f64; 3] {
        std::array::from_fn(|i| self.max[i] - self.min[i])
    }

    /// half of the size
    #[inline]
    pub fn extents(&self) -> [f64; 3] {
        self.size().map(|s| 0.5 * s)
    }

    /// Shorter of the two horizontal dimensions (x and z).
    #[inline]
    pub fn min_horizontal_size(&self) -> f64 {
        let size = self.size();
        size[0].min(size[2])
    }

    /// true if min <= max on every axis
    pub fn is_valid(&self) -> bool {
        (0..3).all(|i| self.min[i] <= self.max[i])
    }

    #[inline]
    pub fn contains(&self, position: [f64; 3]) -> bool {
        (0..3).all(|i| position[i] >= self.min[i] && position[i] <= self.max[i])
    }

    pub fn encapsulate_point(&mut self, position: [f64; 3]) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(position[i]);
            self.max[i] = self.max[i].max(position[i]);
        }
    }

    /// Grows this box to cover `other`. Empty boxes are ignored.
    pub fn encapsulate(&mut self, other: &Bounds) {
        if !other.is_valid() {
            return;
        }
        self.encapsulate_point(other.min);
        self.encapsulate_point(other.max);
    }

    /// Returns a copy grown by `margin` on every side.
    pub fn expanded(&self, margin: f64) -> Self {
        Self {
            min: self.min.map(|v| v - margin),
            max: self.max.map(|v| v + margin),
        }
    }

    /// Snaps both corners to the closest multiple of `step` measured from `origin`, so that
    /// the box tightly encompasses its voxelized space.
    pub fn rounded_to_grid(&self, origin: [f64; 3], step: f64) -> Self {
        let round = |v: f64, o: f64| ((v - o) / step).round() * step + o;
        Self {
            min: std::array::from_fn(|i| round(self.min[i], origin[i])),
            max: std::array::from_fn(|i| round(self.max[i], origin[i])),
        }
    }
}

/// Internal data structure of a tree. Selects a [`TreeLayout`] at run time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TreeType {
    #[default]
    Octree,
    Quadtree,
}

impl TreeType {
    /// the number of child nodes a node can have in the tree.
    pub fn max_children(self) -> usize {
        match self {
            TreeType::Octree => Octree::MAX_CHILDREN,
            TreeType::Quadtree => Quadtree::MAX_CHILDREN,
        }
    }

    pub fn child_index(self, bounds: &Bounds, position: [f64; 3]) -> u8 {
        match self {
            TreeType::Octree => Octree::child_index(bounds, position),
            TreeType::Quadtree => Quadtree::child_index(bounds, position),
        }
    }

    pub fn child_bounds(self, bounds: &Bounds, index: u8) -> Bounds {
        match self {
            TreeType::Octree => Octree::child_bounds(bounds, index),
            TreeType::Quadtree => Quadtree::child_bounds(bounds, index),
        }
    }
}

/// Split geometry of a tree. There are exactly two implementations, [`Octree`] and [`Quadtree`].
///
/// Child index bits are assigned in order of `SPLIT_AXES`: bit `i` is set when the position is
/// at or above the node center along axis `SPLIT_AXES[i]`.
pub trait TreeLayout: Copy + Clone + Debug + Default + Send + Sync + 'static {
    /// Axes along which a node is halved.
    const SPLIT_AXES: &'static [usize];

    /// the number of child nodes a node can have in the tree.
    const MAX_CHILDREN: usize = 1 << Self::SPLIT_AXES.len();

    const TREE_TYPE: TreeType;

    /// Returns index of the child whose bounds contain given position.
    #[inline]
    fn child_index(bounds: &Bounds, position: [f64; 3]) -> u8 {
        let center = bounds.center();
        let mut result = 0u8;
        for (bit, &axis) in Self::SPLIT_AXES.iter().enumerate() {
            if position[axis] >= center[axis] {
                result |= 1 << bit;
            }
        }
        result
    }

    /// Returns bounds of the child with given index. Children exactly partition the parent,
    /// axes that are not split keep the parent's extent.
    fn child_bounds(bounds: &Bounds, index: u8) -> Bounds {
        debug_assert!((index as usize) < Self::MAX_CHILDREN);
        let center = bounds.center();
        let mut child = *bounds;
        for (bit, &axis) in Self::SPLIT_AXES.iter().enumerate() {
            if index & (1 << bit) != 0 {
                child.min[axis] = center[axis];
            } else {
                child.max[axis] = center[axis];
            }
        }
        child
    }
}

/// Layout splitting every node into 8 octants.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Octree;

/// Layout splitting every node into 4 quadrants on the horizontal plane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Quadtree;

#[duplicate_item(
    layout       tree_type              axes;
    [Octree]     [TreeType::Octree]     [[0, 1, 2]];
    [Quadtree]   [TreeType::Quadtree]   [[0, 2]];
)]
impl TreeLayout for layout {
    const SPLIT_AXES: &'static [usize] = &axes;
    const TREE_TYPE: TreeType = tree_type;
}
