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

//! Tree manifest written next to the node files once a build completes.

use crate::coords::TreeType;
use crate::error::{IoContext, Result};
use crate::record::{NodeRecord, ROOT_NODE_IDENTIFIER};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Metadata of a whole tree: its type and one record per node file.
///
/// Nodes are kept ordered by depth, then by identifier, so parents always come before their
/// children.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexData {
    pub tree_type: TreeType,
    pub nodes: Vec<NodeRecord>,
}

impl IndexData {
    pub fn new(tree_type: TreeType, nodes: impl IntoIterator<Item = NodeRecord>) -> Self {
        let mut nodes: Vec<NodeRecord> = nodes.into_iter().collect();
        nodes.sort_by(|a, b| {
            (a.identifier.len(), &a.identifier).cmp(&(b.identifier.len(), &b.identifier))
        });
        Self { tree_type, nodes }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = BufWriter::new(File::create(path).at(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush().at(path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = BufReader::new(File::open(path).at(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn get(&self, identifier: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.identifier == identifier)
    }

    pub fn root(&self) -> Option<&NodeRecord> {
        self.get(ROOT_NODE_IDENTIFIER)
    }

    /// Direct children of the node with given identifier.
    pub fn children_of<'a>(&'a self, identifier: &'a str) -> impl Iterator<Item = &'a NodeRecord> {
        self.nodes
            .iter()
            .filter(move |n| n.parent_identifier() == Some(identifier))
    }

    /// Number of nodes without children.
    pub fn leaf_count(&self) -> usize {
        let parents: HashSet<&str> = self
            .nodes
            .iter()
            .filter_map(|n| n.parent_identifier())
            .collect();
        self.nodes
            .iter()
            .filter(|n| !parents.contains(n.identifier.as_str()))
            .count()
    }

    /// Sum of points over all node files.
    pub fn total_points(&self) -> u64 {
        self.nodes.iter().map(|n| n.point_count).sum()
    }
}
