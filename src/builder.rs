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

//! Front end of the build: merges bounds of all point sources and drives a [`Dispatcher`].

use crate::coords::Bounds;
use crate::dispatcher::{Dispatcher, PointCountResults};
use crate::error::{BuildError, Result};
use crate::point::Point;
use crate::settings::BuildSettings;
use std::path::PathBuf;
use tracing::{info, warn};

/// Margin added on every side of the merged source bounds.
pub const BOUNDS_MARGIN: f64 = 0.1;

/// A source of points, e.g. a decoder of one input file.
pub trait PointProducer {
    /// Bounds of all points this producer will emit.
    fn bounds(&self) -> Result<Bounds>;

    /// Feeds all points into the dispatcher. Returns false if the producer was cancelled.
    fn convert_points(&mut self, dispatcher: &mut Dispatcher) -> Result<bool>;
}

impl<P: PointProducer + ?Sized> PointProducer for Box<P> {
    fn bounds(&self) -> Result<Bounds> {
        (**self).bounds()
    }

    fn convert_points(&mut self, dispatcher: &mut Dispatcher) -> Result<bool> {
        (**self).convert_points(dispatcher)
    }
}

/// Producer serving points already held in memory.
#[derive(Clone, Debug, Default)]
pub struct VecProducer {
    points: Vec<Point>,
}

impl VecProducer {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }
}

impl From<Vec<Point>> for VecProducer {
    fn from(points: Vec<Point>) -> Self {
        Self::new(points)
    }
}

impl PointProducer for VecProducer {
    fn bounds(&self) -> Result<Bounds> {
        let mut bounds = Bounds::empty();
        for p in &self.points {
            bounds.encapsulate_point(p.position);
        }
        Ok(bounds)
    }

    fn convert_points(&mut self, dispatcher: &mut Dispatcher) -> Result<bool> {
        dispatcher.add_chunk(&self.points)?;
        Ok(true)
    }
}

/// Bounds covering all producers, grown by [`BOUNDS_MARGIN`].
pub fn merged_bounds<P: PointProducer>(producers: &[P]) -> Result<Bounds> {
    let mut bounds = Bounds::empty();
    for producer in producers {
        bounds.encapsulate(&producer.bounds()?);
    }
    if !bounds.is_valid() {
        return Err(BuildError::config("point sources contain no points"));
    }
    Ok(bounds.expanded(BOUNDS_MARGIN))
}

/// Builds a tree of all points emitted by `producers` into `output`.
///
/// Returns point totals of the finished tree, or `None` if a producer cancelled the import.
///
/// ```no_run
/// use pointcloud_tree::{build_node_tree, BuildSettings, Point, VecProducer};
///
/// let points = vec![Point::new([0.0, 1.0, 2.0], 0xff00ff); 100];
/// let mut producers = [VecProducer::new(points)];
/// let counts = build_node_tree(&BuildSettings::default(), "out", &mut producers).unwrap();
/// assert_eq!(counts.map(|c| c.total), Some(100));
/// ```
pub fn build_node_tree<P: PointProducer>(
    settings: &BuildSettings,
    output: impl Into<PathBuf>,
    producers: &mut [P],
) -> Result<Option<PointCountResults>> {
    if producers.is_empty() {
        return Err(BuildError::config("no point sources given"));
    }
    let bounds = merged_bounds(producers)?;
    let mut dispatcher = Dispatcher::new(output, settings.clone())?;

    for producer in producers.iter_mut() {
        if !producer.convert_points(&mut dispatcher)? {
            info!("import cancelled");
            if let Err(e) = dispatcher.layout().remove_tmp() {
                warn!("failed to remove temporary files: {e}");
            }
            return Ok(None);
        }
    }

    if !dispatcher.process_points(bounds)? {
        return Ok(None);
    }
    let counts = dispatcher.point_count_results();
    info!(
        "tree build finished, used points: {}/{} ({} discarded on low tree levels)",
        counts.used, counts.total, counts.discarded
    );
    Ok(Some(counts))
}
