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

//! Filtering based on Poisson-disk method.

use super::{aligned_spacing, cell_count, node_spacing, Placement, PointCollection};
use crate::coords::Bounds;
use crate::point::Point;
use crate::record::NodeRecord;
use crate::settings::BuildSettings;
use std::collections::HashMap;

/// Ratio between the lookup cell size and the minimum distance.
pub const CELL_MULTIPLIER: f64 = 8.0;

/// Accepts a point only if no accepted point lies closer than `min_distance`.
///
/// Accepted points are bucketed in a coarse grid (cells of roughly `min_distance * 8`), so a
/// conflict can only come from the 3x3x3 block of cells around the candidate. Rejected points
/// are never retried, they are always handed to a child.
#[derive(Debug, Default)]
pub struct PoissonDiskPointCollection {
    root_bounds: Bounds,
    root_node_subdivision: u32,

    node_bounds: Bounds,
    cells_per_axis: [usize; 3],
    cell_step: [f64; 3],
    min_distance: f64,
    min_distance_squared: f64,

    /// flat cell index -> indices into `points`
    grid: HashMap<usize, Vec<u32>>,
    /// accepted points in order of acceptance
    points: Vec<Point>,
}

impl PoissonDiskPointCollection {
    #[inline]
    fn cell_coords(&self, position: [f64; 3]) -> [usize; 3] {
        std::array::from_fn(|i| {
            let rel = (position[i] - self.node_bounds.min[i]) / self.cell_step[i];
            (rel.floor().max(0.0) as usize).min(self.cells_per_axis[i] - 1)
        })
    }

    #[inline]
    fn flat_index(&self, [x, y, z]: [usize; 3]) -> usize {
        x * self.cells_per_axis[1] * self.cells_per_axis[2] + y * self.cells_per_axis[2] + z
    }

    fn conflicts(&self, point: &Point, cell: [usize; 3]) -> bool {
        let Some(bucket) = self.grid.get(&self.flat_index(cell)) else {
            return false;
        };
        bucket.iter().any(|&idx| {
            self.points[idx as usize].distance_squared(point.position) < self.min_distance_squared
        })
    }
}

impl PointCollection for PoissonDiskPointCollection {
    fn initialize(&mut self, settings: &BuildSettings, root_bounds: &Bounds) {
        self.root_bounds = *root_bounds;
        self.root_node_subdivision = settings.root_node_subdivision;
    }

    fn update_for_node(&mut self, record: &NodeRecord) {
        let min_distance = node_spacing(&record.bounds, self.root_node_subdivision);
        self.update_for_node_with(record, min_distance, false);
    }

    fn update_for_node_with(&mut self, record: &NodeRecord, min_distance: f64, align: bool) {
        let min_distance = if align {
            aligned_spacing(&self.root_bounds, self.root_node_subdivision, min_distance)
        } else {
            min_distance
        };

        self.min_distance = min_distance;
        self.min_distance_squared = min_distance * min_distance;
        self.node_bounds = record.bounds;

        let size = record.bounds.size();
        for i in 0..3 {
            self.cells_per_axis[i] = cell_count(size[i], min_distance * CELL_MULTIPLIER) as usize;
            self.cell_step[i] = size[i] / self.cells_per_axis[i] as f64;
        }
    }

    fn clear_state(&mut self) {
        self.grid.clear();
        self.points.clear();
    }

    fn try_add_point(&mut self, point: Point) -> Placement {
        let [x, y, z] = self.cell_coords(point.position);
        let span = |c: usize, n: usize| c.saturating_sub(1)..=(c + 1).min(n - 1);
        let [nx, ny, nz] = self.cells_per_axis;

        for i in span(x, nx) {
            for j in span(y, ny) {
                for k in span(z, nz) {
                    if self.conflicts(&point, [i, j, k]) {
                        return Placement::Rejected;
                    }
                }
            }
        }

        let index = self.flat_index([x, y, z]);
        self.grid
            .entry(index)
            .or_default()
            .push(self.points.len() as u32);
        self.points.push(point);
        Placement::Accepted
    }

    fn to_vec(&self) -> Vec<Point> {
        self.points.clone()
    }

    fn len(&self) -> usize {
        self.points.len()
    }

    fn min_distance(&self) -> f64 {
        self.min_distance
    }
}
