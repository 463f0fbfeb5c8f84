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

//! Fixed-size point record shared by every buffer and file of the builder.

use bytemuck::{Pod, Zeroable};

/// A single point of the cloud as it is stored in memory and on disk.
///
/// Byte layout (native endian, 32 bytes, no implicit padding):
///
/// | offset | size | field      |
/// |--------|------|------------|
/// | 0      | 24   | `position` |
/// | 24     | 4    | `color`    |
/// | 28     | 4    | `reserved` |
///
/// Since the record is plain old data, chunk and node files are nothing but
/// arrays of it and can be memory mapped and byte-copied directly.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Point {
    /// World space position. Y is the vertical axis.
    pub position: [f64; 3],
    /// Packed color or intensity, opaque to the tree builder.
    pub color: u32,
    /// Keeps the record 8-byte aligned without implicit padding.
    pub reserved: u32,
}

/// Size of one point record in bytes.
pub const POINT_SIZE: usize = std::mem::size_of::<Point>();

const _: () = assert!(POINT_SIZE == 32, "point record layout changed");

impl Point {
    #[inline]
    pub fn new(position: [f64; 3], color: u32) -> Self {
        Self {
            position,
            color,
            reserved: 0,
        }
    }

    /// squared euclidean distance to given position
    #[inline]
    pub fn distance_squared(&self, other: [f64; 3]) -> f64 {
        self.position
            .iter()
            .zip(other)
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }
}

/// Returns maximum amount of points accepted by a single intake call.
/// Mirrors the ~2GB ceiling on a single contiguous allocation.
pub const fn max_array_size() -> usize {
    2000 * 1024 * 1024 / POINT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout() {
        assert_eq!(POINT_SIZE, 32);
        assert_eq!(std::mem::align_of::<Point>(), 8);

        let p = Point::new([1.0, 2.0, 3.0], 0xAABBCCDD);
        let bytes = bytemuck::bytes_of(&p);
        assert_eq!(&bytes[0..8], &1.0f64.to_ne_bytes());
        assert_eq!(&bytes[16..24], &3.0f64.to_ne_bytes());
        assert_eq!(&bytes[24..28], &0xAABBCCDDu32.to_ne_bytes());
        assert_eq!(&bytes[28..32], &[0, 0, 0, 0]);
    }

    #[test]
    fn distance() {
        let p = Point::new([1.0, 1.0, 1.0], 0);
        assert_eq!(p.distance_squared([1.0, 3.0, 1.0]), 4.0);
        assert_eq!(p.distance_squared(p.position), 0.0);
    }
}
