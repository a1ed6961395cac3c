// Copyright 2026 ferry Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fmt::Debug, future::Future, pin::Pin, sync::Arc};

use generational_arena::{Arena, Index};
use parking_lot::Mutex;

use crate::spawn::Spawner;

/// A unit of work accepted by [`WorkScheduler`].
pub type Work = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkState {
    Pending,
    Running,
}

struct Node {
    work: Option<Work>,
    state: WorkState,
    prev: Option<Index>,
    next: Option<Index>,
}

/// All work items live in one arena. Pending items are additionally linked into the pending list, running items are
/// not linked anywhere. Completed and cancelled items are removed from the arena, so a stale handle never resolves.
struct State {
    nodes: Arena<Node>,
    head: Option<Index>,
    tail: Option<Index>,
    pending: usize,
    running: usize,
}

impl State {
    fn unlink(&mut self, index: Index) {
        let (prev, next) = {
            let node = &self.nodes[index];
            (node.prev, node.next)
        };

        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }

        let node = &mut self.nodes[index];
        node.prev = None;
        node.next = None;
    }

    fn link_front(&mut self, index: Index) {
        let head = self.head;
        {
            let node = &mut self.nodes[index];
            node.prev = None;
            node.next = head;
        }
        match head {
            Some(head) => self.nodes[head].prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
    }

    fn link_back(&mut self, index: Index) {
        let tail = self.tail;
        {
            let node = &mut self.nodes[index];
            node.prev = tail;
            node.next = None;
        }
        match tail {
            Some(tail) => self.nodes[tail].next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
    }

    /// Walk the pending list and the arena and check the bookkeeping agrees.
    #[cfg(test)]
    fn validate(&self) {
        let mut linked = 0;
        let mut cursor = self.head;
        let mut prev = None;
        while let Some(index) = cursor {
            let node = &self.nodes[index];
            assert_eq!(node.state, WorkState::Pending);
            assert_eq!(node.prev, prev);
            linked += 1;
            prev = cursor;
            cursor = node.next;
        }
        assert_eq!(prev, self.tail);
        assert_eq!(linked, self.pending);

        let running = self
            .nodes
            .iter()
            .filter(|(_, node)| node.state == WorkState::Running)
            .count();
        assert_eq!(running, self.running);
        assert_eq!(self.nodes.len(), self.pending + self.running);
    }
}

struct Inner {
    name: String,
    max_concurrent: usize,
    spawner: Spawner,
    state: Mutex<State>,
}

/// Bounded-concurrency FIFO work scheduler.
///
/// At most `max_concurrent` work items run at the same time, the rest wait in a pending queue. A pending item can be
/// cancelled or promoted to the head of the queue through its [`WorkHandle`]. A running item can neither be cancelled
/// nor promoted, it always runs to completion.
///
/// The state lock is only held for list bookkeeping, never while a work item runs.
#[derive(Clone)]
pub struct WorkScheduler {
    inner: Arc<Inner>,
}

impl Debug for WorkScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("WorkScheduler")
            .field("name", &self.inner.name)
            .field("max_concurrent", &self.inner.max_concurrent)
            .field("pending", &state.pending)
            .field("running", &state.running)
            .finish()
    }
}

impl WorkScheduler {
    /// Default concurrency limit.
    pub const DEFAULT_MAX_CONCURRENT: usize = 8;

    /// Create a scheduler that runs its work on `spawner` with at most `max_concurrent` items in flight.
    ///
    /// `max_concurrent` is clamped to at least 1.
    pub fn new(name: impl Into<String>, max_concurrent: usize, spawner: Spawner) -> Self {
        let inner = Inner {
            name: name.into(),
            max_concurrent: max_concurrent.max(1),
            spawner,
            state: Mutex::new(State {
                nodes: Arena::new(),
                head: None,
                tail: None,
                pending: 0,
                running: 0,
            }),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Name of the scheduler, used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Concurrency limit.
    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Count of work items waiting to run.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending
    }

    /// Count of work items currently running.
    pub fn running_len(&self) -> usize {
        self.inner.state.lock().running
    }

    /// Enqueue a work item, at the tail of the pending queue or at its head if `add_to_front` is set, and start work
    /// if the scheduler is below its concurrency limit.
    pub fn enqueue<F>(&self, work: F, add_to_front: bool) -> WorkHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let index = {
            let mut state = self.inner.state.lock();
            let index = state.nodes.insert(Node {
                work: Some(Box::pin(work)),
                state: WorkState::Pending,
                prev: None,
                next: None,
            });
            if add_to_front {
                state.link_front(index);
            } else {
                state.link_back(index);
            }
            state.pending += 1;
            index
        };

        let handle = WorkHandle {
            index,
            scheduler: self.clone(),
        };
        self.start_next();
        handle
    }

    fn start_next(&self) {
        loop {
            let (index, work) = {
                let mut state = self.inner.state.lock();
                if state.running >= self.inner.max_concurrent {
                    return;
                }
                let Some(index) = state.head else {
                    return;
                };
                state.unlink(index);
                state.pending -= 1;
                state.running += 1;
                let node = &mut state.nodes[index];
                node.state = WorkState::Running;
                let work = node.work.take();
                (index, work)
            };

            tracing::trace!(scheduler = %self.inner.name, ?index, "start work");

            let guard = FinishGuard {
                scheduler: self.clone(),
                index,
            };
            // The task handle is dropped on purpose, completion is observed through the guard.
            drop(self.inner.spawner.spawn(async move {
                let _guard = guard;
                if let Some(work) = work {
                    work.await;
                }
            }));
        }
    }

    fn finish(&self, index: Index) {
        {
            let mut state = self.inner.state.lock();
            let removed = state.nodes.remove(index);
            debug_assert!(matches!(removed, Some(Node { state: WorkState::Running, .. })));
            state.running -= 1;
        }
        tracing::trace!(scheduler = %self.inner.name, ?index, "finish work");
        self.start_next();
    }

    fn cancel(&self, index: Index) -> bool {
        let work = {
            let mut state = self.inner.state.lock();
            match state.nodes.get(index).map(|node| node.state) {
                Some(WorkState::Pending) => {
                    state.unlink(index);
                    state.pending -= 1;
                    state.nodes.remove(index).and_then(|node| node.work)
                }
                _ => return false,
            }
        };
        // Drop the future outside of the lock, it may own arbitrary resources.
        drop(work);
        true
    }

    fn promote(&self, index: Index) {
        let mut state = self.inner.state.lock();
        if let Some(WorkState::Pending) = state.nodes.get(index).map(|node| node.state) {
            if state.head != Some(index) {
                state.unlink(index);
                state.link_front(index);
            }
        }
    }

    fn is_running(&self, index: Index) -> bool {
        let state = self.inner.state.lock();
        matches!(state.nodes.get(index).map(|node| node.state), Some(WorkState::Running))
    }

    fn is_pending(&self, index: Index) -> bool {
        let state = self.inner.state.lock();
        matches!(state.nodes.get(index).map(|node| node.state), Some(WorkState::Pending))
    }
}

struct FinishGuard {
    scheduler: WorkScheduler,
    index: Index,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.scheduler.finish(self.index);
    }
}

/// Caller-facing reference to an enqueued work item.
#[derive(Clone)]
pub struct WorkHandle {
    index: Index,
    scheduler: WorkScheduler,
}

impl Debug for WorkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkHandle")
            .field("scheduler", &self.scheduler.inner.name)
            .field("index", &self.index)
            .finish()
    }
}

impl WorkHandle {
    /// Remove the work item if it has not started yet.
    ///
    /// Returns `true` if the item was pending and will never run, `false` if it is running or has already finished.
    pub fn cancel(&self) -> bool {
        self.scheduler.cancel(self.index)
    }

    /// Move the work item to the head of the pending queue. No-op if it is running or finished.
    pub fn promote(&self) {
        self.scheduler.promote(self.index)
    }

    /// Returns `true` while the work item is running.
    pub fn is_running(&self) -> bool {
        self.scheduler.is_running(self.index)
    }

    /// Returns `true` while the work item waits in the pending queue.
    pub fn is_pending(&self) -> bool {
        self.scheduler.is_pending(self.index)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use itertools::Itertools;
    use tokio::sync::{mpsc, oneshot};

    use super::*;

    fn scheduler(max_concurrent: usize) -> WorkScheduler {
        WorkScheduler::new("test", max_concurrent, Spawner::current())
    }

    /// Work that reports `id` on start and waits for its gate before finishing.
    fn gated(id: usize, started: mpsc::UnboundedSender<usize>) -> (impl Future<Output = ()>, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let work = async move {
            started.send(id).unwrap();
            let _ = rx.await;
        };
        (work, tx)
    }

    async fn wait_idle(scheduler: &WorkScheduler) {
        for _ in 0..200 {
            if scheduler.pending_len() == 0 && scheduler.running_len() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("scheduler did not become idle: {scheduler:?}");
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_bounded_concurrency_fifo() {
        let scheduler = scheduler(2);
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();

        let mut gates = vec![];
        let mut handles = vec![];
        for id in 0..5 {
            let (work, gate) = gated(id, started_tx.clone());
            handles.push(scheduler.enqueue(work, false));
            gates.push(gate);
        }

        let first = [started_rx.recv().await.unwrap(), started_rx.recv().await.unwrap()];
        assert_eq!(first.iter().copied().sorted().collect_vec(), vec![0, 1]);
        assert_eq!(scheduler.running_len(), 2);
        assert_eq!(scheduler.pending_len(), 3);
        scheduler.inner.state.lock().validate();

        assert!(handles[0].is_running());
        assert!(handles[2].is_pending());

        let mut order = vec![];
        for gate in gates {
            gate.send(()).unwrap();
            if let Ok(Some(id)) = tokio::time::timeout(Duration::from_millis(200), started_rx.recv()).await {
                order.push(id);
            }
        }
        assert_eq!(order, vec![2, 3, 4]);

        wait_idle(&scheduler).await;
        scheduler.inner.state.lock().validate();
        assert!(!handles[0].is_running());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_cancel_pending_and_running() {
        let scheduler = scheduler(1);
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();

        let (w0, g0) = gated(0, started_tx.clone());
        let (w1, _g1) = gated(1, started_tx.clone());
        let (w2, g2) = gated(2, started_tx.clone());

        let h0 = scheduler.enqueue(w0, false);
        let h1 = scheduler.enqueue(w1, false);
        let h2 = scheduler.enqueue(w2, false);

        assert_eq!(started_rx.recv().await.unwrap(), 0);

        // Running work can't be cancelled, pending work can.
        assert!(!h0.cancel());
        assert!(h1.cancel());
        assert!(!h1.cancel());
        assert!(!h1.is_pending());
        scheduler.inner.state.lock().validate();

        g0.send(()).unwrap();
        assert_eq!(started_rx.recv().await.unwrap(), 2);
        g2.send(()).unwrap();

        wait_idle(&scheduler).await;
        assert!(!h2.cancel());
        assert!(started_rx.try_recv().is_err());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_promote_and_front_insert() {
        let scheduler = scheduler(1);
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();

        let (w0, g0) = gated(0, started_tx.clone());
        let h0 = scheduler.enqueue(w0, false);
        assert_eq!(started_rx.recv().await.unwrap(), 0);

        let mut gates = vec![];
        let mut handles = vec![];
        for id in 1..4 {
            let (work, gate) = gated(id, started_tx.clone());
            handles.push(scheduler.enqueue(work, false));
            gates.push(gate);
        }
        let (w4, g4) = gated(4, started_tx.clone());
        scheduler.enqueue(w4, true);
        gates.push(g4);

        // Pending order is now [4, 1, 2, 3]; promote 3 to get [3, 4, 1, 2].
        handles[2].promote();
        // Promoting running work is a no-op.
        h0.promote();
        scheduler.inner.state.lock().validate();

        g0.send(()).unwrap();
        let mut order = vec![];
        for _ in 0..4 {
            let id = started_rx.recv().await.unwrap();
            order.push(id);
            // Release whichever work just started.
            let gate = match id {
                4 => gates.remove(gates.len() - 1),
                id => std::mem::replace(&mut gates[id - 1], oneshot::channel().0),
            };
            let _ = gate.send(());
        }
        assert_eq!(order, vec![3, 4, 1, 2]);
        wait_idle(&scheduler).await;
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_panicking_work_releases_slot() {
        let scheduler = scheduler(1);
        let (tx, rx) = oneshot::channel();

        scheduler.enqueue(async { panic!("work panicked") }, false);
        scheduler.enqueue(
            async move {
                tx.send(()).unwrap();
            },
            false,
        );

        tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        wait_idle(&scheduler).await;
        scheduler.inner.state.lock().validate();
    }
}
