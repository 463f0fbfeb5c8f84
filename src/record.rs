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

//! Node records: persistent identity and metadata of a single tree node.

use crate::coords::{Bounds, TreeLayout};
use serde::{Deserialize, Serialize};

/// Identifier used to mark root node of a tree.
pub const ROOT_NODE_IDENTIFIER: &str = "r";

/// Metadata of one tree node.
///
/// The identifier encodes the full path from the root: a child's identifier is always its
/// parent's identifier followed by one child index digit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub identifier: String,
    pub bounds: Bounds,
    /// Points stored in this node's file. 0 until the node is finalized.
    pub point_count: u64,
}

impl NodeRecord {
    pub fn new(identifier: impl Into<String>, bounds: Bounds, point_count: u64) -> Self {
        Self {
            identifier: identifier.into(),
            bounds,
            point_count,
        }
    }

    pub fn root(bounds: Bounds) -> Self {
        Self::new(ROOT_NODE_IDENTIFIER, bounds, 0)
    }

    /// Creates record of the child with given index, with bounds split according to the layout.
    pub fn create_child<L: TreeLayout>(&self, index: u8) -> Self {
        Self {
            identifier: child_identifier(&self.identifier, index),
            bounds: L::child_bounds(&self.bounds, index),
            point_count: 0,
        }
    }

    /// Root is at depth 0.
    #[inline]
    pub fn depth(&self) -> usize {
        self.identifier.len() - ROOT_NODE_IDENTIFIER.len()
    }

    pub fn is_root(&self) -> bool {
        self.identifier == ROOT_NODE_IDENTIFIER
    }

    /// Identifier of the parent node, None for the root.
    pub fn parent_identifier(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.identifier.get(..self.identifier.len() - 1)
    }
}

/// Builds identifier of a child with given index.
#[inline]
pub fn child_identifier(parent: &str, index: u8) -> String {
    debug_assert!(index < 10);
    let mut id = String::with_capacity(parent.len() + 1);
    id.push_str(parent);
    id.push(char::from(b'0' + index));
    id
}
