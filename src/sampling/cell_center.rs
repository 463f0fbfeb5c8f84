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

//! Filtering based on distance from centers of subdivided cells.

use super::{aligned_spacing, cell_count, node_spacing, Placement, PointCollection};
use crate::coords::Bounds;
use crate::point::Point;
use crate::record::NodeRecord;
use crate::settings::BuildSettings;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Keeps at most one point per grid cell: the one nearest to the cell's center.
///
/// The node is covered by a grid of cubic cells with edge `min_distance`, snapped to the
/// root's minimum corner so that neighbouring nodes share cell boundaries.
#[derive(Debug, Default)]
pub struct CellCenterPointCollection {
    root_bounds: Bounds,
    root_node_subdivision: u32,

    aligned_bounds: Bounds,
    cells_per_axis: [u64; 3],
    cell_step: f64,

    /// flat cell index -> index into `points`
    slots: HashMap<u64, usize>,
    /// accepted points in order of first occupation of their cell
    points: Vec<Point>,
}

impl CellCenterPointCollection {
    /// Returns flat index and center of the cell covering given position.
    #[inline]
    fn locate(&self, position: [f64; 3]) -> (u64, [f64; 3]) {
        let mut cell = [0u64; 3];
        for i in 0..3 {
            let rel = (position[i] - self.aligned_bounds.min[i]) / self.cell_step;
            // upper bounds are inclusive, so the last cell on each axis also takes points there
            cell[i] = (rel.floor().max(0.0) as u64).min(self.cells_per_axis[i] - 1);
        }
        let [nx, ny, _] = self.cells_per_axis;
        let flat = cell[0] + cell[1] * nx + cell[2] * nx * ny;
        let center = std::array::from_fn(|i| {
            self.aligned_bounds.min[i] + self.cell_step * (cell[i] as f64 + 0.5)
        });
        (flat, center)
    }

    pub fn cells_per_axis(&self) -> [u64; 3] {
        self.cells_per_axis
    }
}

impl PointCollection for CellCenterPointCollection {
    fn initialize(&mut self, settings: &BuildSettings, root_bounds: &Bounds) {
        self.root_bounds = *root_bounds;
        self.root_node_subdivision = settings.root_node_subdivision;
    }

    fn update_for_node(&mut self, record: &NodeRecord) {
        let min_distance = node_spacing(&record.bounds, self.root_node_subdivision);
        self.update_for_node_with(record, min_distance, false);
    }

    fn update_for_node_with(&mut self, record: &NodeRecord, min_distance: f64, align: bool) {
        let step = if align {
            aligned_spacing(&self.root_bounds, self.root_node_subdivision, min_distance)
        } else {
            min_distance
        };

        self.cell_step = step;
        self.aligned_bounds = record.bounds.rounded_to_grid(self.root_bounds.min, step);
        let size = self.aligned_bounds.size();
        self.cells_per_axis = size.map(|s| cell_count(s, step));
    }

    fn clear_state(&mut self) {
        self.slots.clear();
        self.points.clear();
    }

    fn try_add_point(&mut self, point: Point) -> Placement {
        let (cell, center) = self.locate(point.position);

        match self.slots.entry(cell) {
            // Cell is empty - place new point there
            Entry::Vacant(e) => {
                e.insert(self.points.len());
                self.points.push(point);
                Placement::Accepted
            }
            // Cell is already occupied, the point closer to the center stays
            Entry::Occupied(e) => {
                let current = &mut self.points[*e.get()];
                if point.distance_squared(center) < current.distance_squared(center) {
                    Placement::Replaced(std::mem::replace(current, point))
                } else {
                    Placement::Rejected
                }
            }
        }
    }

    fn to_vec(&self) -> Vec<Point> {
        self.points.clone()
    }

    fn len(&self) -> usize {
        self.points.len()
    }

    fn min_distance(&self) -> f64 {
        self.cell_step
    }
}
