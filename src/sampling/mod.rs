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

//! Point sampling policies. A policy decides which points a node keeps for itself and which
//! ones are pushed one level deeper.

use crate::coords::Bounds;
use crate::point::Point;
use crate::record::NodeRecord;
use crate::settings::{BuildSettings, SamplingMethod};

pub mod cell_center;
pub use cell_center::CellCenterPointCollection;

pub mod poisson;
pub use poisson::PoissonDiskPointCollection;

/// Outcome of offering a point to a [`PointCollection`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Placement {
    /// The point is kept by this node.
    Accepted,
    /// The point is kept, and the previous occupant of its cell was evicted.
    /// The evicted point must be passed to a child.
    Replaced(Point),
    /// The point is not kept and must be passed to a child.
    Rejected,
}

/// Stateful per-node point filter.
///
/// `update_for_node` must be called before any `try_add_point`, and `clear_state` between
/// nodes, otherwise geometry of unrelated subtrees leaks into each other.
pub trait PointCollection: Send {
    /// Stores settings and bounds of the whole tree.
    fn initialize(&mut self, settings: &BuildSettings, root_bounds: &Bounds);

    /// Recomputes node-relative caches, deriving spacing from node size.
    fn update_for_node(&mut self, record: &NodeRecord);

    /// Recomputes node-relative caches with explicit spacing.
    /// If `align` is set, the spacing is taken from the root's halving ladder instead: the root
    /// spacing is halved until it no longer exceeds twice `min_distance`.
    fn update_for_node_with(&mut self, record: &NodeRecord, min_distance: f64, align: bool);

    /// Drops all accepted points.
    fn clear_state(&mut self);

    fn try_add_point(&mut self, point: Point) -> Placement;

    /// Copy of all currently accepted points.
    fn to_vec(&self) -> Vec<Point>;

    /// Number of currently accepted points.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spacing in use for the current node.
    fn min_distance(&self) -> f64;
}

/// Creates collection implementing given sampling method.
pub fn collection_for(method: SamplingMethod) -> Box<dyn PointCollection> {
    match method {
        SamplingMethod::CellCenter => Box::new(CellCenterPointCollection::default()),
        SamplingMethod::PoissonDisk => Box::new(PoissonDiskPointCollection::default()),
    }
}

/// Upper limit of grid cells along one axis, keeps flat cell indices within `u64`.
pub(crate) const MAX_CELLS_PER_AXIS: u64 = 1 << 20;

/// Cells needed to cover `size` with cells of `step`, clamped to `1..=MAX_CELLS_PER_AXIS`.
/// Degenerate input (zero or non-finite step) yields a single cell.
#[inline]
pub(crate) fn cell_count(size: f64, step: f64) -> u64 {
    let cells = (size / step).ceil();
    if cells.is_finite() && cells >= 1.0 {
        (cells as u64).min(MAX_CELLS_PER_AXIS)
    } else {
        1
    }
}

/// Spacing used by a node with given bounds.
#[inline]
pub(crate) fn node_spacing(bounds: &Bounds, root_node_subdivision: u32) -> f64 {
    bounds.min_horizontal_size() / root_node_subdivision as f64
}

/// Spacing from the root's halving ladder closest to (but not below half of) `target`.
pub(crate) fn aligned_spacing(
    root_bounds: &Bounds,
    root_node_subdivision: u32,
    target: f64,
) -> f64 {
    let mut distance = node_spacing(root_bounds, root_node_subdivision);
    while 0.5 * distance > target {
        distance *= 0.5;
    }
    distance
}
