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

//! Synthetic point clouds for tests and benchmarks.

use crate::coords::Bounds;
use crate::point::Point;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Yields `count` points distributed uniformly within `bounds`, with random colors.
/// Same seed gives the same sequence.
pub fn uniform_points(bounds: Bounds, count: usize, seed: u64) -> impl Iterator<Item = Point> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..count).map(move |_| {
        let position = std::array::from_fn(|i| {
            if bounds.min[i] < bounds.max[i] {
                rng.random_range(bounds.min[i]..bounds.max[i])
            } else {
                bounds.min[i]
            }
        });
        Point::new(position, rng.random::<u32>() | 0xff00_0000)
    })
}
