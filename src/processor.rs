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

//! Node processor: one worker's computation for a single node.
//!
//! A pass over a node loads every chunk file waiting for it, lets the sampling policy pick
//! the points the node keeps, and routes the rest into per-child buffers. Children that got
//! few enough points become leaves right away; the others are written as chunk files and
//! handed back to the dispatcher for their own pass.

use crate::coords::{Bounds, TreeLayout};
use crate::error::{BuildError, IoContext, Result};
use crate::point::Point;
use crate::record::NodeRecord;
use crate::sampling::{collection_for, CellCenterPointCollection, Placement, PointCollection};
use crate::settings::BuildSettings;
use crate::storage::{self, OutputLayout};
use arrayvec::ArrayVec;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, debug_span, warn};

/// Maximal child count of any layout.
pub const MAX_CHILDREN: usize = 8;

/// Result of processing one node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeOutput {
    /// Processed node with its final point count.
    pub node: NodeRecord,
    /// Children created during the pass. Children with `point_count == 0` still wait for
    /// their own pass.
    pub children: Vec<NodeRecord>,
    /// True if the node was dropped (too deep or too dense) instead of being processed.
    pub discarded: bool,
}

/// Anything a worker can run on an assigned node.
pub trait ProcessNode: Send + 'static {
    fn process(&mut self, record: NodeRecord) -> Result<NodeOutput>;
}

/// Point counters shared by all processors of one build.
#[derive(Debug, Default)]
pub struct BuildCounters {
    finished: AtomicU64,
    discarded: AtomicU64,
}

impl BuildCounters {
    /// Points that reached their final place (or were discarded).
    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }

    /// Points dropped because of depth or density limits.
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    #[inline]
    fn add_finished(&self, count: usize) {
        self.finished.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    fn add_discarded(&self, count: usize) {
        self.discarded.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Per-child state of the current pass.
#[derive(Debug, Default)]
struct ChildSlot {
    /// points waiting to be flushed
    buffer: Vec<Point>,
    /// number of chunk files written for this child so far
    tmp_files: usize,
    /// index of the child's record in `NodeProcessor::children`, once created
    record: Option<usize>,
}

/// Processor building trees with layout `L`. Owns all buffers of one worker, so its memory use
/// is bounded by `chunk_size * (1 + L::MAX_CHILDREN)` points regardless of input size.
pub struct NodeProcessor<L: TreeLayout> {
    settings: BuildSettings,
    layout: OutputLayout,
    counters: Arc<BuildCounters>,

    collection: Box<dyn PointCollection>,
    /// thins points of new leaves when `min_point_distance` is set
    leaf_filter: CellCenterPointCollection,

    input: Vec<Point>,
    slots: ArrayVec<ChildSlot, MAX_CHILDREN>,
    children: Vec<NodeRecord>,

    _layout: PhantomData<L>,
}

impl<L: TreeLayout> NodeProcessor<L> {
    pub fn new(
        settings: &BuildSettings,
        layout: OutputLayout,
        root_bounds: &Bounds,
        counters: Arc<BuildCounters>,
    ) -> Self {
        let mut collection = collection_for(settings.sampling);
        collection.initialize(settings, root_bounds);
        let mut leaf_filter = CellCenterPointCollection::default();
        leaf_filter.initialize(settings, root_bounds);

        Self {
            settings: settings.clone(),
            layout,
            counters,
            collection,
            leaf_filter,
            input: Vec::new(),
            slots: (0..L::MAX_CHILDREN).map(|_| ChildSlot::default()).collect(),
            children: Vec::new(),
            _layout: PhantomData,
        }
    }

    /// Clears internal state left by the previous pass.
    fn clear_state(&mut self) {
        self.collection.clear_state();
        self.leaf_filter.clear_state();
        self.children.clear();
        for slot in self.slots.iter_mut() {
            slot.buffer.clear();
            slot.tmp_files = 0;
            slot.record = None;
        }
    }

    /// True if the node lies beyond the configured depth or density limits.
    fn should_discard(&self, record: &NodeRecord) -> bool {
        record.depth() >= self.settings.max_tree_depth
            || self
                .settings
                .min_point_distance
                .is_some_and(|d| self.collection.min_distance() < d)
    }

    /// Removes all chunk files of a discarded node, counting their points as discarded.
    fn discard_input(&mut self, record: &NodeRecord) -> Result<()> {
        let mut total = 0;
        let mut n = 0;
        loop {
            let path = self.layout.chunk_path(&record.identifier, n);
            if !path.exists() {
                break;
            }
            let count = storage::point_count(&path)?;
            std::fs::remove_file(&path).at(&path)?;
            self.counters.add_finished(count);
            self.counters.add_discarded(count);
            total += count;
            n += 1;
        }
        warn!(id = %record.identifier, depth = record.depth(), points = total, "node discarded");
        Ok(())
    }

    /// Passes given point to one of the children. Child is chosen based on point's position.
    fn pass_point_to_child(&mut self, record: &NodeRecord, point: Point) -> Result<()> {
        let index = L::child_index(&record.bounds, point.position) as usize;
        let chunk_size = self.settings.chunk_size;
        let slot = &mut self.slots[index];

        if slot.record.is_none() {
            self.children.push(record.create_child::<L>(index as u8));
            slot.record = Some(self.children.len() - 1);
        }
        if slot.buffer.capacity() == 0 {
            slot.buffer.reserve_exact(chunk_size);
        }

        slot.buffer.push(point);
        if slot.buffer.len() >= chunk_size {
            self.flush_child(index)?;
        }
        Ok(())
    }

    /// Flushes points buffered for given child. Writes a final leaf file if the child was never
    /// flushed to a chunk file before and holds fewer points than the branch threshold,
    /// otherwise appends a new chunk file for a later pass.
    fn flush_child(&mut self, index: usize) -> Result<()> {
        let slot = &mut self.slots[index];
        let child = slot
            .record
            .and_then(|i| self.children.get_mut(i))
            .ok_or_else(|| {
                BuildError::Internal(format!("child {index} flushed without a record"))
            })?;

        let final_leaf =
            slot.tmp_files == 0 && slot.buffer.len() < self.settings.node_branch_threshold;

        if final_leaf {
            let received = slot.buffer.len();
            let path = self.layout.node_path(&child.identifier);

            let kept = match self.settings.min_point_distance {
                Some(distance) => {
                    self.leaf_filter.clear_state();
                    self.leaf_filter.update_for_node_with(child, distance, true);
                    for &point in &slot.buffer {
                        self.leaf_filter.try_add_point(point);
                    }
                    let data = self.leaf_filter.to_vec();
                    storage::write_points(&path, &data)?;
                    data.len()
                }
                None => {
                    storage::write_points(&path, &slot.buffer)?;
                    received
                }
            };

            child.point_count = kept as u64;
            self.counters.add_finished(received);
            self.counters.add_discarded(received - kept);
            debug!(id = %child.identifier, points = kept, "leaf finalized");
        } else {
            let path = self.layout.chunk_path(&child.identifier, slot.tmp_files);
            slot.tmp_files += 1;
            storage::write_points(&path, &slot.buffer)?;
            debug!(id = %child.identifier, points = slot.buffer.len(), "chunk flushed");
        }

        slot.buffer.clear();
        Ok(())
    }
}

impl<L: TreeLayout> ProcessNode for NodeProcessor<L> {
    /// Loops over all points waiting for given node and assigns them either to the node or
    /// to one of its children.
    fn process(&mut self, mut record: NodeRecord) -> Result<NodeOutput> {
        let _span = debug_span!("node", id = %record.identifier).entered();

        self.clear_state();
        self.collection.update_for_node(&record);

        if self.should_discard(&record) {
            self.discard_input(&record)?;
            return Ok(NodeOutput {
                node: record,
                children: Vec::new(),
                discarded: true,
            });
        }

        let mut input = std::mem::take(&mut self.input);
        let mut n = 0;
        loop {
            // Load previously saved chunk files. If there is no next file, the node is done.
            let path = self.layout.chunk_path(&record.identifier, n);
            if !path.exists() {
                break;
            }
            storage::read_points_into(&path, &mut input)?;
            std::fs::remove_file(&path).at(&path)?;
            n += 1;

            let mut finished = 0;
            for &point in &input {
                match self.collection.try_add_point(point) {
                    Placement::Accepted => finished += 1,
                    Placement::Replaced(evicted) => self.pass_point_to_child(&record, evicted)?,
                    Placement::Rejected => self.pass_point_to_child(&record, point)?,
                }
            }
            self.counters.add_finished(finished);
        }
        self.input = input;

        // Work is finished, make sure to flush all children data...
        for index in 0..self.slots.len() {
            if !self.slots[index].buffer.is_empty() {
                self.flush_child(index)?;
            }
        }

        // ...and data of this node
        let data = self.collection.to_vec();
        record.point_count = data.len() as u64;
        storage::write_points(&self.layout.node_path(&record.identifier), &data)?;
        debug!(
            chunks = n,
            kept = data.len(),
            children = self.children.len(),
            "node processed"
        );

        Ok(NodeOutput {
            node: record,
            children: std::mem::take(&mut self.children),
            discarded: false,
        })
    }
}
