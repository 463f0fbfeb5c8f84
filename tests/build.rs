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

use pointcloud_tree::storage::read_points;
use pointcloud_tree::*;
use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;
use std::path::Path;

fn settings(tree_type: TreeType, sampling: SamplingMethod) -> BuildSettings {
    BuildSettings {
        tree_type,
        sampling,
        root_node_subdivision: 16,
        node_branch_threshold: 500,
        chunk_size: 2_000,
        thread_count: 4,
        ..Default::default()
    }
}

fn cube(size: f64) -> Bounds {
    Bounds::new([0.0; 3], [size; 3])
}

fn build(output: &Path, settings: &BuildSettings, bounds: Bounds, points: &[Point]) -> Dispatcher {
    let mut d = Dispatcher::new(output, settings.clone()).unwrap();
    d.add_chunk(points).unwrap();
    assert!(d.process_points(bounds).unwrap());
    d
}

/// Checks the output directory against its index and returns the points of all node files.
fn check_tree(output: &Path) -> (IndexData, Vec<Point>) {
    let index = IndexData::load(output.join("index.pcindex")).unwrap();
    assert!(!output.join("tmp").exists(), "temporary files must be removed");

    let mut ids = HashSet::new();
    let mut all = Vec::new();
    for node in &index.nodes {
        assert!(ids.insert(node.identifier.as_str()), "duplicate {}", node.identifier);
        assert!(node.identifier.starts_with(ROOT_NODE_IDENTIFIER));
        if let Some(parent) = node.parent_identifier() {
            let digit = node.identifier.as_bytes()[node.identifier.len() - 1];
            assert!(digit.is_ascii_digit());
            assert!(((digit - b'0') as usize) < index.tree_type.max_children());
            let parent = index.get(parent).expect("parent listed in index");
            assert!(parent.point_count > 0);
        }

        let points = read_points(&output.join(format!("{}.pcnode", node.identifier))).unwrap();
        assert_eq!(points.len() as u64, node.point_count, "{}", node.identifier);
        for p in &points {
            assert!(
                node.bounds.contains(p.position),
                "{} outside {}",
                p.position[0],
                node.identifier
            );
        }
        all.extend(points);
    }

    // every node file is listed
    let files = std::fs::read_dir(output)
        .unwrap()
        .filter_map(|e| {
            let path = e.unwrap().path();
            (path.extension()? == NODE_FILE_EXTENSION).then_some(path)
        })
        .count();
    assert_eq!(files, index.nodes.len());

    (index, all)
}

fn sorted_colors(points: &[Point]) -> Vec<u32> {
    let mut c: Vec<u32> = points.iter().map(|p| p.color).collect();
    c.sort_unstable();
    c
}

/// Gives every point a unique color so the output can be matched against the input.
fn tagged(points: impl Iterator<Item = Point>) -> Vec<Point> {
    points
        .enumerate()
        .map(|(i, mut p)| {
            p.color = i as u32;
            p
        })
        .collect()
}

#[test]
fn every_point_lands_in_exactly_one_node() {
    for tree_type in [TreeType::Octree, TreeType::Quadtree] {
        for sampling in [SamplingMethod::CellCenter, SamplingMethod::PoissonDisk] {
            let dir = tempfile::tempdir().unwrap();
            let bounds = cube(100.0);
            let points = tagged(uniform_points(bounds, 30_000, 11));
            let d = build(dir.path(), &settings(tree_type, sampling), bounds, &points);

            let (index, stored) = check_tree(dir.path());
            assert_eq!(index.tree_type, tree_type);
            assert_eq!(sorted_colors(&stored), sorted_colors(&points));
            assert_eq!(index.total_points(), 30_000);
            assert!(index.nodes.len() > 1 + tree_type.max_children());

            let counts = d.point_count_results();
            assert_eq!(
                counts,
                PointCountResults {
                    total: 30_000,
                    used: 30_000,
                    discarded: 0
                }
            );
            assert_eq!(d.records().count(), index.nodes.len());
        }
    }
}

#[test]
fn single_thread_builds_are_identical() {
    let s = BuildSettings {
        thread_count: 1,
        ..settings(TreeType::Octree, SamplingMethod::PoissonDisk)
    };
    let bounds = cube(50.0);
    let points: Vec<Point> = uniform_points(bounds, 20_000, 3).collect();

    let a = tempfile::tempdir().unwrap();
    let b = tempfile::tempdir().unwrap();
    build(a.path(), &s, bounds, &points);
    build(b.path(), &s, bounds, &points);

    let ia = IndexData::load(a.path().join("index.pcindex")).unwrap();
    let ib = IndexData::load(b.path().join("index.pcindex")).unwrap();
    assert_eq!(ia, ib);
    for node in &ia.nodes {
        let name = format!("{}.pcnode", node.identifier);
        assert_eq!(
            std::fs::read(a.path().join(&name)).unwrap(),
            std::fs::read(b.path().join(&name)).unwrap(),
            "{name}"
        );
    }
}

#[test]
fn root_children_split_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let bounds = Bounds::new([-50.0, 0.0, -50.0], [50.0, 20.0, 50.0]);
    let points: Vec<Point> = uniform_points(bounds, 50_000, 5).collect();

    let s = settings(TreeType::Octree, SamplingMethod::CellCenter);
    build(dir.path(), &s, bounds, &points);
    let (index, _) = check_tree(dir.path());

    let root = index.root().unwrap();
    assert_eq!(root.bounds, bounds);
    let children: Vec<&NodeRecord> = index.children_of("r").collect();
    assert_eq!(children.len(), 8);
    for c in children {
        let digit = c.identifier.as_bytes()[1] - b'0';
        assert_eq!(c.bounds, Octree::child_bounds(&bounds, digit));
    }

    // quadtree children keep the full height
    let dir = tempfile::tempdir().unwrap();
    let s = settings(TreeType::Quadtree, SamplingMethod::CellCenter);
    build(dir.path(), &s, bounds, &points);
    let (index, _) = check_tree(dir.path());
    for c in index.children_of("r") {
        assert_eq!(c.bounds.min[VERTICAL_AXIS], 0.0);
        assert_eq!(c.bounds.max[VERTICAL_AXIS], 20.0);
    }
}

#[test]
fn too_deep_nodes_are_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let s = BuildSettings {
        max_tree_depth: 3,
        node_branch_threshold: 10,
        chunk_size: 100,
        ..settings(TreeType::Octree, SamplingMethod::CellCenter)
    };
    // identical points: every level keeps one, the rest sinks down
    let points = vec![Point::new([1.0; 3], 7); 1_000];
    let d = build(dir.path(), &s, cube(64.0), &points);

    let (index, _) = check_tree(dir.path());
    let ids: Vec<&str> = index.nodes.iter().map(|n| n.identifier.as_str()).collect();
    assert_eq!(ids, ["r", "r0", "r00"]);
    assert_eq!(
        d.point_count_results(),
        PointCountResults {
            total: 1_000,
            used: 3,
            discarded: 997
        }
    );
    assert!(d.record("r000").is_none());
}

#[test]
fn depth_limit_of_one_keeps_only_root() {
    let dir = tempfile::tempdir().unwrap();
    let s = BuildSettings {
        max_tree_depth: 1,
        node_branch_threshold: 10,
        chunk_size: 100,
        thread_count: 1,
        ..settings(TreeType::Octree, SamplingMethod::CellCenter)
    };
    let points = vec![Point::new([1.0; 3], 7); 100];
    let d = build(dir.path(), &s, cube(64.0), &points);

    let (index, _) = check_tree(dir.path());
    let ids: Vec<&str> = index.nodes.iter().map(|n| n.identifier.as_str()).collect();
    assert_eq!(ids, ["r"]);
    assert_eq!(d.point_count_results().discarded, 99);
}

#[test]
fn min_point_distance_limits_density() {
    let dir = tempfile::tempdir().unwrap();
    let s = BuildSettings {
        min_point_distance: Some(1.0),
        ..settings(TreeType::Octree, SamplingMethod::CellCenter)
    };
    let bounds = cube(64.0);
    let points: Vec<Point> = uniform_points(bounds, 40_000, 9).collect();
    let d = build(dir.path(), &s, bounds, &points);

    let (index, stored) = check_tree(dir.path());
    let counts = d.point_count_results();
    assert_eq!(counts.total, 40_000);
    assert!(counts.discarded > 0);
    assert_eq!(counts.used + counts.discarded, counts.total);
    assert_eq!(index.total_points(), counts.used);
    assert_eq!(stored.len() as u64, counts.used);

    // root spacing is 4, halved per level: nothing below spacing 1 survives
    assert!(index.nodes.iter().all(|n| n.identifier.len() <= 4));
}

#[test]
fn cancelled_build_leaves_no_index() {
    let dir = tempfile::tempdir().unwrap();
    let s = BuildSettings {
        node_branch_threshold: 100,
        chunk_size: 1_000,
        ..settings(TreeType::Octree, SamplingMethod::CellCenter)
    };
    let bounds = cube(100.0);
    let points: Vec<Point> = uniform_points(bounds, 20_000, 1).collect();

    let mut d = Dispatcher::new(dir.path(), s).unwrap();
    d.add_chunk(&points).unwrap();
    let mut calls = 0;
    let done = d
        .process_points_with(bounds, |progress| {
            calls += 1;
            assert_eq!(progress.worker_count, 4);
            assert!(progress.busy_workers >= 1);
            assert_eq!(progress.total_points, 20_000);
            ControlFlow::Break(())
        })
        .unwrap();

    assert!(!done);
    assert_eq!(calls, 1);
    assert!(!dir.path().join("index.pcindex").exists());
    assert!(!dir.path().join("tmp").exists());
}

#[test]
fn progress_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let bounds = cube(100.0);
    let points: Vec<Point> = uniform_points(bounds, 20_000, 2).collect();

    let s = settings(TreeType::Quadtree, SamplingMethod::CellCenter);
    let mut d = Dispatcher::new(dir.path(), s).unwrap();
    d.add_chunk(&points).unwrap();
    let mut last = 0;
    let done = d
        .process_points_with(bounds, |progress| {
            assert!(progress.finished_points >= last);
            assert!(progress.fraction() <= 1.0);
            last = progress.finished_points;
            ControlFlow::Continue(())
        })
        .unwrap();
    assert!(done);
    check_tree(dir.path());
}

#[test]
fn broken_chunk_file_fails_the_build() {
    let dir = tempfile::tempdir().unwrap();
    let s = BuildSettings {
        chunk_size: 100,
        node_branch_threshold: 50,
        ..settings(TreeType::Octree, SamplingMethod::CellCenter)
    };
    let bounds = cube(10.0);
    let points: Vec<Point> = uniform_points(bounds, 300, 4).collect();

    let mut d = Dispatcher::new(dir.path(), s).unwrap();
    d.add_chunk(&points).unwrap();
    // three full chunks are on disk, append a file that is not a whole number of points
    std::fs::write(d.layout().chunk_path(ROOT_NODE_IDENTIFIER, 3), [0u8; 7]).unwrap();

    match d.process_points(bounds) {
        Err(BuildError::WorkerDied { index, reason }) => {
            assert_eq!(index, 0);
            assert!(reason.contains("not a point file"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!dir.path().join("index.pcindex").exists());
    assert!(!dir.path().join("tmp").exists());
}

#[test]
fn rejects_invalid_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let s = settings(TreeType::Octree, SamplingMethod::CellCenter);
    let mut d = Dispatcher::new(dir.path(), s).unwrap();
    assert!(matches!(d.process_points(Bounds::empty()), Err(BuildError::Config(_))));
}

#[test]
fn rejects_flat_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let s = BuildSettings {
        thread_count: 1,
        ..settings(TreeType::Octree, SamplingMethod::PoissonDisk)
    };
    let bounds = Bounds::new([0.0; 3], [10.0, 10.0, 0.0]);
    let mut d = Dispatcher::new(dir.path(), s).unwrap();
    d.add_chunk(&uniform_points(bounds, 500, 3).collect::<Vec<_>>()).unwrap();

    assert!(matches!(d.process_points(bounds), Err(BuildError::Config(_))));
    assert!(!dir.path().join("index.pcindex").exists());
    assert!(!dir.path().join("r.pcnode").exists());

    // a flat horizontal extent on x is rejected as well, vertical flatness is fine
    let flat_x = Bounds::new([5.0, 0.0, 0.0], [5.0, 10.0, 10.0]);
    assert!(matches!(d.process_points(flat_x), Err(BuildError::Config(_))));
    let flat_y = Bounds::new([0.0, 0.0, 0.0], [10.0, 0.0, 10.0]);
    let s = BuildSettings {
        thread_count: 1,
        ..settings(TreeType::Quadtree, SamplingMethod::PoissonDisk)
    };
    let mut d = Dispatcher::new(dir.path(), s).unwrap();
    d.add_chunk(&uniform_points(flat_y, 500, 3).collect::<Vec<_>>()).unwrap();
    assert!(d.process_points(flat_y).unwrap());
    check_tree(dir.path());
}

#[test]
fn new_build_replaces_old_output() {
    let dir = tempfile::tempdir().unwrap();
    let bounds = cube(100.0);
    let s = settings(TreeType::Octree, SamplingMethod::CellCenter);
    build(dir.path(), &s, bounds, &uniform_points(bounds, 30_000, 1).collect::<Vec<_>>());
    build(dir.path(), &s, bounds, &uniform_points(bounds, 300, 1).collect::<Vec<_>>());

    let (index, stored) = check_tree(dir.path());
    assert_eq!(stored.len(), 300);
    assert_eq!(index.total_points(), 300);
}

#[test]
fn builds_from_toml_settings_and_producers() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("tree.toml");
    std::fs::write(
        &config,
        r#"
tree_type = "quadtree"
sampling = "poisson_disk"
root_node_subdivision = 32
node_branch_threshold = 1000
chunk_size = 5000
thread_count = 3
"#,
    )
    .unwrap();
    let s = BuildSettings::load(&config).unwrap();
    assert_eq!(s.tree_type, TreeType::Quadtree);

    let output = dir.path().join("out");
    let a = Bounds::new([0.0; 3], [10.0; 3]);
    let b = Bounds::new([20.0, 0.0, 0.0], [30.0, 5.0, 10.0]);
    let mut producers = [
        VecProducer::new(uniform_points(a, 8_000, 1).collect()),
        VecProducer::new(uniform_points(b, 4_000, 2).collect()),
    ];
    let expected_bounds = merged_bounds(&producers).unwrap();
    let counts = build_node_tree(&s, &output, &mut producers).unwrap().unwrap();
    assert_eq!(counts.total, 12_000);
    assert_eq!(counts.used, 12_000);

    let (index, stored) = check_tree(&output);
    assert_eq!(stored.len(), 12_000);
    let root = index.root().unwrap();
    assert_eq!(root.bounds, expected_bounds);
    assert!(Bounds::new([0.0; 3], [30.0, 10.0, 10.0])
        .expanded(BOUNDS_MARGIN)
        .contains(root.bounds.max));
}

#[test]
fn chunked_intake_matches_single_points() {
    let bounds = cube(20.0);
    let points: Vec<Point> = uniform_points(bounds, 7_777, 8).collect();
    let s = BuildSettings {
        thread_count: 1,
        ..settings(TreeType::Octree, SamplingMethod::CellCenter)
    };

    let a = tempfile::tempdir().unwrap();
    build(a.path(), &s, bounds, &points);

    let b = tempfile::tempdir().unwrap();
    let mut d = Dispatcher::new(b.path(), s).unwrap();
    for p in &points {
        d.add_point(*p).unwrap();
    }
    assert!(d.process_points(bounds).unwrap());

    let (ia, pa) = check_tree(a.path());
    let (ib, pb) = check_tree(b.path());
    assert_eq!(ia, ib);
    assert_eq!(pa, pb);
}

#[test]
fn second_build_starts_over() {
    let dir = tempfile::tempdir().unwrap();
    let s = settings(TreeType::Octree, SamplingMethod::CellCenter);
    let bounds = cube(64.0);
    let points: Vec<Point> = uniform_points(bounds, 20_000, 11).collect();
    let mut d = build(dir.path(), &s, bounds, &points);
    assert!(d.records().count() > 1);

    // counts stay readable until new points arrive
    assert_eq!(d.point_count_results().total, 20_000);
    let few = vec![Point::new([3.0; 3], 1), Point::new([40.0; 3], 2)];
    d.add_chunk(&few).unwrap();
    assert_eq!(d.point_count_results().total, 2);
    assert!(d.process_points(bounds).unwrap());

    let (index, stored) = check_tree(dir.path());
    let ids: Vec<&str> = index.nodes.iter().map(|n| n.identifier.as_str()).collect();
    assert_eq!(ids, ["r"]);
    assert_eq!(stored.len(), 2);
    assert!(!dir.path().join("r0.pcnode").exists());
    assert_eq!(d.point_count_results(), PointCountResults { total: 2, used: 2, discarded: 0 });
}

/// Full scale run: 10 million points in a 100 m cube, 4 threads, 1 M point chunks.
#[test]
#[ignore = "heavy: ~320 MB of point data"]
fn ten_million_points() {
    let dir = tempfile::tempdir().unwrap();
    let bounds = cube(100.0);
    let s = BuildSettings {
        tree_type: TreeType::Octree,
        sampling: SamplingMethod::CellCenter,
        root_node_subdivision: 64,
        node_branch_threshold: 64 * 64 * 8,
        chunk_size: 1_000_000,
        thread_count: 4,
        ..Default::default()
    };

    let mut d = Dispatcher::new(dir.path(), s).unwrap();
    let mut batch = Vec::with_capacity(100_000);
    for p in uniform_points(bounds, 10_000_000, 42) {
        batch.push(p);
        if batch.len() == batch.capacity() {
            d.add_chunk(&batch).unwrap();
            batch.clear();
        }
    }
    d.add_chunk(&batch).unwrap();
    assert!(d.process_points(bounds).unwrap());

    let (index, stored) = check_tree(dir.path());
    assert_eq!(stored.len(), 10_000_000);
    assert_eq!(index.total_points(), 10_000_000);
    assert_eq!(d.point_count_results().discarded, 0);

    let root = index.root().unwrap();
    assert_eq!(root.bounds, bounds);
    let children: Vec<&NodeRecord> = index.children_of(ROOT_NODE_IDENTIFIER).collect();
    assert_eq!(children.len(), 8);
    for c in children {
        let digit = c.identifier.as_bytes()[1] - b'0';
        assert_eq!(c.bounds, Octree::child_bounds(&root.bounds, digit));
    }

    let mut per_depth: HashMap<usize, u64> = HashMap::new();
    for n in &index.nodes {
        *per_depth.entry(n.depth()).or_default() += n.point_count;
    }
    assert_eq!(per_depth.values().sum::<u64>(), 10_000_000);
    assert!(per_depth.len() > 2);
}
