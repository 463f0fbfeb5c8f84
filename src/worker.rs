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

//! Long-lived worker threads, each owning one node processor.

use crate::error::{BuildError, Result};
use crate::processor::{NodeOutput, ProcessNode};
use crate::record::NodeRecord;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// How long an idle worker sleeps before checking for new work.
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Lifecycle of a worker between two nodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkStatus {
    /// Waiting for work. Results of the previous node may still be pending.
    Idle,
    /// Work was assigned but not picked up by the thread yet.
    Queued,
    Busy,
}

#[derive(Debug)]
struct WorkState {
    status: WorkStatus,
    record: Option<NodeRecord>,
    output: Option<NodeOutput>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<WorkState>,
    stop: AtomicBool,
}

/// Handle to a worker thread. Dropping it stops and joins the thread.
#[derive(Debug)]
pub struct Worker {
    index: usize,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Worker {
    /// Starts a new thread running `processor` on every node assigned to it.
    pub fn spawn<P: ProcessNode>(index: usize, processor: P) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(WorkState {
                status: WorkStatus::Idle,
                record: None,
                output: None,
            }),
            stop: AtomicBool::new(false),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("tree-worker-{index}"))
            .spawn(move || {
                let result = work_loop(&thread_shared, processor);
                if let Err(e) = &result {
                    error!(worker = index, "worker failed: {e}");
                }
                result
            })
            .map_err(|e| BuildError::WorkerDied {
                index,
                reason: format!("failed to start thread: {e}"),
            })?;

        Ok(Self {
            index,
            shared,
            handle: Some(handle),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> WorkStatus {
        self.shared.state.lock().status
    }

    /// Hands a node to this worker. Only legal while the worker is idle and its previous
    /// results were pulled.
    pub fn assign_work(&self, record: NodeRecord) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.status != WorkStatus::Idle || state.output.is_some() {
            return Err(BuildError::WorkerNotIdle {
                index: self.index,
                status: state.status,
            });
        }
        debug!(worker = self.index, id = %record.identifier, "work assigned");
        state.record = Some(record);
        state.status = WorkStatus::Queued;
        Ok(())
    }

    /// Takes results of the last processed node, if the worker is idle and has any.
    pub fn pull_results(&self) -> Option<NodeOutput> {
        let mut state = self.shared.state.lock();
        if state.status != WorkStatus::Idle {
            return None;
        }
        state.record = None;
        state.output.take()
    }

    /// Asks the thread to exit. A node in progress is finished first.
    pub fn stop_work(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Waits for the thread to exit and returns the result of its loop.
    /// A panic in the processor is reported as [`BuildError::WorkerDied`].
    pub fn join(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(result) => result,
            Err(payload) => Err(BuildError::WorkerDied {
                index: self.index,
                reason: panic_message(payload.as_ref()),
            }),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop_work();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn work_loop<P: ProcessNode>(shared: &Shared, mut processor: P) -> Result<()> {
    while !shared.stop.load(Ordering::Acquire) {
        let record = {
            let mut state = shared.state.lock();
            if state.status == WorkStatus::Queued {
                state.status = WorkStatus::Busy;
                state.record.clone()
            } else {
                None
            }
        };

        let Some(record) = record else {
            thread::sleep(POLL_INTERVAL);
            continue;
        };

        // errors end the thread with status left at Busy
        let output = processor.process(record)?;

        let mut state = shared.state.lock();
        state.output = Some(output);
        state.status = WorkStatus::Idle;
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::Bounds;
    use std::time::Instant;

    /// Marks every node as holding a single point.
    struct Echo;

    impl ProcessNode for Echo {
        fn process(&mut self, mut record: NodeRecord) -> Result<NodeOutput> {
            record.point_count = 1;
            Ok(NodeOutput {
                node: record,
                children: Vec::new(),
                discarded: false,
            })
        }
    }

    struct Failing;

    impl ProcessNode for Failing {
        fn process(&mut self, record: NodeRecord) -> Result<NodeOutput> {
            Err(BuildError::config(format!("cannot process {}", record.identifier)))
        }
    }

    struct Panicking;

    impl ProcessNode for Panicking {
        fn process(&mut self, _record: NodeRecord) -> Result<NodeOutput> {
            panic!("processor exploded");
        }
    }

    fn root() -> NodeRecord {
        NodeRecord::root(Bounds::new([0.0; 3], [1.0; 3]))
    }

    fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> T {
        let start = Instant::now();
        loop {
            if let Some(v) = f() {
                return v;
            }
            assert!(start.elapsed() < Duration::from_secs(10), "timed out");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn processes_assigned_work() {
        let mut w = Worker::spawn(0, Echo).unwrap();
        assert_eq!(w.status(), WorkStatus::Idle);
        assert!(w.pull_results().is_none());

        w.assign_work(root()).unwrap();
        let out = wait_for(|| w.pull_results());
        assert_eq!(out.node.identifier, "r");
        assert_eq!(out.node.point_count, 1);
        assert_eq!(w.status(), WorkStatus::Idle);

        // second node on the same worker
        w.assign_work(root().create_child::<crate::coords::Octree>(5)).unwrap();
        let out = wait_for(|| w.pull_results());
        assert_eq!(out.node.identifier, "r5");

        assert!(w.is_alive());
        w.stop_work();
        w.join().unwrap();
        assert!(!w.is_alive());
    }

    #[test]
    fn rejects_work_while_not_idle() {
        let w = Worker::spawn(3, Echo).unwrap();
        w.assign_work(root()).unwrap();
        // either still queued/busy, or idle with unpulled results
        match w.assign_work(root()) {
            Err(BuildError::WorkerNotIdle { index, .. }) => assert_eq!(index, 3),
            other => panic!("unexpected {other:?}"),
        }
        wait_for(|| w.pull_results());
        w.assign_work(root()).unwrap();
    }

    #[test]
    fn processor_error_ends_thread() {
        let mut w = Worker::spawn(1, Failing).unwrap();
        w.assign_work(root()).unwrap();
        wait_for(|| (!w.is_alive()).then_some(()));
        assert_eq!(w.status(), WorkStatus::Busy);
        assert!(matches!(w.join(), Err(BuildError::Config(_))));
    }

    #[test]
    fn panic_is_reported() {
        let mut w = Worker::spawn(2, Panicking).unwrap();
        w.assign_work(root()).unwrap();
        wait_for(|| (!w.is_alive()).then_some(()));
        match w.join() {
            Err(BuildError::WorkerDied { index, reason }) => {
                assert_eq!(index, 2);
                assert!(reason.contains("exploded"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
