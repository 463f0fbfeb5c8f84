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

//! Dispatcher: point intake, work distribution over worker threads and the node record table.

use crate::coords::{Bounds, Octree, Quadtree, TreeType};
use crate::error::{BuildError, IoContext, Result};
use crate::index::IndexData;
use crate::point::{max_array_size, Point};
use crate::processor::{BuildCounters, NodeOutput, NodeProcessor};
use crate::record::{NodeRecord, ROOT_NODE_IDENTIFIER};
use crate::settings::BuildSettings;
use crate::storage::{self, OutputLayout};
use crate::worker::{WorkStatus, Worker, POLL_INTERVAL};
use slab::Slab;
use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, info_span, warn};

/// Snapshot of a running build, passed to the progress callback once per polling iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BuildProgress {
    pub busy_workers: usize,
    pub worker_count: usize,
    pub finished_points: u64,
    pub total_points: u64,
}

impl BuildProgress {
    /// Finished share of all points, in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total_points == 0 {
            return 1.0;
        }
        (self.finished_points as f64 / self.total_points as f64).min(1.0)
    }
}

/// Point totals of a finished build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PointCountResults {
    /// Points registered through `add_point` / `add_chunk`.
    pub total: u64,
    /// Points written to node files.
    pub used: u64,
    /// Points dropped by depth and density limits.
    pub discarded: u64,
}

/// Builds one tree out of points registered through [`add_point`](Self::add_point) and
/// [`add_chunk`](Self::add_chunk).
///
/// Registered points are buffered in memory and spilled to disk in chunks of
/// `chunk_size` points. [`process_points`](Self::process_points) then starts
/// `thread_count` workers and hands them nodes until the whole tree is built.
pub struct Dispatcher {
    settings: BuildSettings,
    layout: OutputLayout,

    /// intake buffer, never holds more than `chunk_size` points
    points: Vec<Point>,
    root_tmp_files: usize,
    total_points: u64,
    discarded_points: u64,
    /// set once a build consumed the registered points, the next intake starts from zero
    consumed: bool,

    records: Slab<NodeRecord>,
    slots: HashMap<String, usize>,
    queue: VecDeque<NodeRecord>,
}

impl Dispatcher {
    /// Validates settings and prepares the output directory: node and index files of a previous
    /// build are deleted and the temporary directory is recreated empty.
    pub fn new(output_path: impl Into<PathBuf>, settings: BuildSettings) -> Result<Self> {
        settings.validate()?;
        let layout = OutputLayout::new(output_path);
        layout.prepare()?;
        info!(
            output = %layout.output_dir().display(),
            tree_type = ?settings.tree_type,
            threads = settings.thread_count,
            "dispatcher created"
        );

        Ok(Self {
            points: Vec::with_capacity(settings.chunk_size),
            settings,
            layout,
            root_tmp_files: 0,
            total_points: 0,
            discarded_points: 0,
            consumed: false,
            records: Slab::new(),
            slots: HashMap::new(),
            queue: VecDeque::new(),
        })
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    /// Registers a single point. Point should use world-space coordinates.
    pub fn add_point(&mut self, point: Point) -> Result<()> {
        self.start_intake();
        self.points.push(point);
        self.total_points += 1;
        if self.points.len() >= self.settings.chunk_size {
            self.flush_intake()?;
        }
        Ok(())
    }

    /// Registers multiple points. Points should use world-space coordinates.
    ///
    /// Slices longer than [`max_array_size`] are rejected before anything is written.
    pub fn add_chunk(&mut self, points: &[Point]) -> Result<()> {
        if points.len() > max_array_size() {
            return Err(BuildError::config(format!(
                "chunk of {} points exceeds maximal array size of {}",
                points.len(),
                max_array_size()
            )));
        }
        for chunk in points.chunks(self.settings.chunk_size) {
            self.add_chunk_internal(chunk)?;
        }
        Ok(())
    }

    /// Registers up to `chunk_size` points. Full chunks go straight to disk, smaller ones fill
    /// the intake buffer.
    fn add_chunk_internal(&mut self, chunk: &[Point]) -> Result<()> {
        let chunk_size = self.settings.chunk_size;
        if chunk.len() > chunk_size {
            return Err(BuildError::Internal(format!(
                "chunk of {} points exceeds chunk size {chunk_size}",
                chunk.len()
            )));
        }
        self.start_intake();
        self.total_points += chunk.len() as u64;

        if chunk.len() == chunk_size {
            return self.write_root_chunk(chunk);
        }

        let free = chunk_size - self.points.len();
        let (first, second) = chunk.split_at(chunk.len().min(free));
        self.points.extend_from_slice(first);
        if self.points.len() == chunk_size {
            self.flush_intake()?;
        }
        self.points.extend_from_slice(second);
        Ok(())
    }

    /// Forgets the counts of a finished build before new points are registered.
    fn start_intake(&mut self) {
        if self.consumed {
            self.total_points = 0;
            self.discarded_points = 0;
            self.consumed = false;
        }
    }

    fn flush_intake(&mut self) -> Result<()> {
        if self.points.is_empty() {
            return Ok(());
        }
        let points = std::mem::take(&mut self.points);
        let result = self.write_root_chunk(&points);
        self.points = points;
        self.points.clear();
        result
    }

    fn write_root_chunk(&mut self, points: &[Point]) -> Result<()> {
        if self.root_tmp_files == 0 {
            // removed by a previous build
            let tmp = self.layout.tmp_dir();
            std::fs::create_dir_all(tmp).at(tmp)?;
        }
        let path = self.layout.chunk_path(ROOT_NODE_IDENTIFIER, self.root_tmp_files);
        self.root_tmp_files += 1;
        storage::write_points(&path, points)?;
        debug!(points = points.len(), file = %path.display(), "root chunk flushed");
        Ok(())
    }

    /// Builds tree of all registered points and stores it in the output directory.
    ///
    /// `bounds` must contain every registered point. Returns `Ok(true)` once the tree and its
    /// index are written.
    pub fn process_points(&mut self, bounds: Bounds) -> Result<bool> {
        self.process_points_with(bounds, |_| ControlFlow::Continue(()))
    }

    /// Same as [`process_points`](Self::process_points), calling `on_progress` on every polling
    /// iteration. Returning [`ControlFlow::Break`] cancels the build: workers finish their
    /// current node, no index is written and `Ok(false)` is returned. Finalized node files
    /// are left in place.
    pub fn process_points_with<F>(&mut self, bounds: Bounds, mut on_progress: F) -> Result<bool>
    where
        F: FnMut(&BuildProgress) -> ControlFlow<()>,
    {
        if !bounds.is_valid() {
            return Err(BuildError::config(format!("invalid tree bounds {bounds:?}")));
        }
        // node spacing is derived from the horizontal size, it must not collapse to zero
        let horizontal = bounds.min_horizontal_size();
        if !(horizontal.is_finite() && horizontal > 0.0) {
            return Err(BuildError::config(format!(
                "tree bounds {bounds:?} must have a positive finite horizontal size"
            )));
        }
        self.start_intake();
        let _span = info_span!("process_points", total = self.total_points).entered();

        // Make sure all points are flushed to disk - buffers are ignored during build
        self.flush_intake()?;
        // node files of an earlier build on this dispatcher
        self.layout.remove_node_files()?;

        self.records.clear();
        self.slots.clear();
        self.queue.clear();
        let root = NodeRecord::root(bounds);
        self.insert_record(root.clone())?;

        let counters = Arc::new(BuildCounters::default());
        let mut workers = self.spawn_workers(&bounds, &counters)?;
        info!(workers = workers.len(), points = self.total_points, "workers started");

        let mut result = match workers[0].assign_work(root) {
            Ok(()) => self.build_loop(&mut workers, &counters, &mut on_progress),
            Err(e) => Err(e),
        };

        // Whether the build finished, failed or was cancelled, stop all worker threads
        for worker in &workers {
            worker.stop_work();
        }
        for worker in &mut workers {
            if let Err(e) = worker.join() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        self.discarded_points = counters.discarded();
        self.root_tmp_files = 0;
        self.consumed = true;

        match result {
            Ok(true) => {
                let index = IndexData::new(
                    self.settings.tree_type,
                    self.records.iter().map(|(_, r)| r.clone()),
                );
                index.save(self.layout.index_path())?;
                self.layout.remove_tmp()?;
                let counts = self.point_count_results();
                info!(
                    nodes = index.nodes.len(),
                    used = counts.used,
                    discarded = counts.discarded,
                    "tree build finished"
                );
                Ok(true)
            }
            Ok(false) => {
                warn!("tree build cancelled");
                self.remove_tmp_best_effort();
                Ok(false)
            }
            Err(e) => {
                self.remove_tmp_best_effort();
                Err(e)
            }
        }
    }

    fn spawn_workers(&self, bounds: &Bounds, counters: &Arc<BuildCounters>) -> Result<Vec<Worker>> {
        (0..self.settings.thread_count)
            .map(|i| {
                let layout = self.layout.clone();
                let counters = counters.clone();
                match self.settings.tree_type {
                    TreeType::Octree => Worker::spawn(
                        i,
                        NodeProcessor::<Octree>::new(&self.settings, layout, bounds, counters),
                    ),
                    TreeType::Quadtree => Worker::spawn(
                        i,
                        NodeProcessor::<Quadtree>::new(&self.settings, layout, bounds, counters),
                    ),
                }
            })
            .collect()
    }

    /// Polls workers until all work is done (`Ok(true)`) or the callback cancels (`Ok(false)`).
    fn build_loop<F>(
        &mut self,
        workers: &mut [Worker],
        counters: &BuildCounters,
        on_progress: &mut F,
    ) -> Result<bool>
    where
        F: FnMut(&BuildProgress) -> ControlFlow<()>,
    {
        loop {
            let mut busy = 0;
            for worker in workers.iter_mut() {
                if !worker.is_alive() {
                    let index = worker.index();
                    let err = match worker.join() {
                        Err(e @ BuildError::WorkerDied { .. }) => e,
                        Err(e) => BuildError::WorkerDied {
                            index,
                            reason: e.to_string(),
                        },
                        Ok(()) => BuildError::WorkerDied {
                            index,
                            reason: "thread exited while build was running".to_string(),
                        },
                    };
                    error!("{err}");
                    return Err(err);
                }

                if worker.status() != WorkStatus::Idle {
                    busy += 1;
                    continue;
                }

                // Worker is idle - it might have results, and is ready to accept work
                if let Some(output) = worker.pull_results() {
                    self.harvest(output)?;
                }
                if let Some(record) = self.queue.pop_front() {
                    worker.assign_work(record)?;
                    busy += 1;
                }
            }

            if busy == 0 {
                return Ok(true);
            }

            let progress = BuildProgress {
                busy_workers: busy,
                worker_count: workers.len(),
                finished_points: counters.finished(),
                total_points: self.total_points,
            };
            if on_progress(&progress).is_break() {
                return Ok(false);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Stores results of one processed node and queues its unfinished children.
    fn harvest(&mut self, output: NodeOutput) -> Result<()> {
        let NodeOutput {
            node,
            children,
            discarded,
        } = output;

        let Some(&slot) = self.slots.get(&node.identifier) else {
            return Err(BuildError::Internal(format!(
                "results for unknown node {}",
                node.identifier
            )));
        };

        if discarded {
            self.slots.remove(&node.identifier);
            self.records.remove(slot);
            return Ok(());
        }
        self.records[slot] = node;

        for child in children {
            if child.point_count == 0 {
                self.queue.push_back(child.clone());
            }
            self.insert_record(child)?;
        }
        Ok(())
    }

    fn insert_record(&mut self, record: NodeRecord) -> Result<()> {
        if self.slots.contains_key(&record.identifier) {
            return Err(BuildError::Internal(format!(
                "node {} created twice",
                record.identifier
            )));
        }
        let identifier = record.identifier.clone();
        let slot = self.records.insert(record);
        self.slots.insert(identifier, slot);
        Ok(())
    }

    fn remove_tmp_best_effort(&self) {
        if let Err(e) = self.layout.remove_tmp() {
            warn!("failed to remove temporary files: {e}");
        }
    }

    /// Point totals of the last build, or of the points registered since then.
    pub fn point_count_results(&self) -> PointCountResults {
        PointCountResults {
            total: self.total_points,
            used: self.total_points - self.discarded_points,
            discarded: self.discarded_points,
        }
    }

    /// Records of all nodes of the last build, in no particular order.
    pub fn records(&self) -> impl Iterator<Item = &NodeRecord> {
        self.records.iter().map(|(_, r)| r)
    }

    /// Record of the node with given identifier.
    pub fn record(&self, identifier: &str) -> Option<&NodeRecord> {
        self.slots.get(identifier).and_then(|&slot| self.records.get(slot))
    }
}
