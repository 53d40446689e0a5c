//! Three-lane priority queue feeding the batcher.
//!
//! Draining consumes strictly high → normal → low, FIFO within a lane. Under
//! sustained high-priority pressure the low lane starves; that is the
//! intended prioritization semantics, mitigated by capacity planning rather
//! than by aging.
//!
//! Arrivals bump a monotonic sequence and wake waiters, so the batcher never
//! misses an enqueue that lands between a drain and a wait.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

use crate::task::Priority;

#[derive(Debug, Error)]
#[error("queue is full (depth {depth})")]
pub struct QueueFull {
    pub depth: usize,
}

/// What the queue actually holds; task bodies stay in the store.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task_id: String,
    pub priority: Priority,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LaneDepths {
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

/// The lane bookkeeping, kept free of async so ordering properties are
/// directly testable.
#[derive(Default)]
struct Lanes {
    high: VecDeque<QueuedTask>,
    normal: VecDeque<QueuedTask>,
    low: VecDeque<QueuedTask>,
}

impl Lanes {
    fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    /// Append to the task's lane; returns the lane depth after insertion.
    fn push(&mut self, task: QueuedTask) -> usize {
        let lane = match task.priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        };
        lane.push_back(task);
        lane.len()
    }

    /// Remove up to `n` tasks from the first non-empty lane at or above
    /// `floor`. One call never crosses a lane boundary: while any high task
    /// is queued, a drain yields high tasks only.
    fn drain_up_to(&mut self, n: usize, floor: Priority) -> Vec<QueuedTask> {
        let eligible = match floor {
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        };
        for lane in [&mut self.high, &mut self.normal, &mut self.low].into_iter().take(eligible) {
            if lane.is_empty() {
                continue;
            }
            let take = n.min(lane.len());
            return lane.drain(..take).collect();
        }
        Vec::new()
    }

    fn drain_all(&mut self) -> Vec<QueuedTask> {
        let mut drained = Vec::with_capacity(self.len());
        for lane in [&mut self.high, &mut self.normal, &mut self.low] {
            drained.extend(lane.drain(..));
        }
        drained
    }

    fn depths(&self) -> LaneDepths {
        LaneDepths { high: self.high.len(), normal: self.normal.len(), low: self.low.len() }
    }
}

pub struct PriorityQueue {
    lanes: Mutex<Lanes>,
    max_depth: usize,
    arrival_seq: AtomicU64,
    arrivals: Notify,
}

impl PriorityQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            max_depth,
            arrival_seq: AtomicU64::new(0),
            arrivals: Notify::new(),
        }
    }

    /// Append one task; fails when the total queued count is at the cap.
    /// Returns the task's position within its lane.
    pub async fn enqueue(&self, task: QueuedTask) -> Result<usize, QueueFull> {
        let position = {
            let mut lanes = self.lanes.lock().await;
            if lanes.len() >= self.max_depth {
                return Err(QueueFull { depth: self.max_depth });
            }
            lanes.push(task)
        };
        self.wake();
        Ok(position)
    }

    /// Append a group atomically: either every task fits under the cap or
    /// none is enqueued.
    pub async fn enqueue_many(&self, tasks: Vec<QueuedTask>) -> Result<(), QueueFull> {
        {
            let mut lanes = self.lanes.lock().await;
            if lanes.len() + tasks.len() > self.max_depth {
                return Err(QueueFull { depth: self.max_depth });
            }
            for task in tasks {
                lanes.push(task);
            }
        }
        self.wake();
        Ok(())
    }

    /// Drain up to `n` tasks of priority `floor` or better; see
    /// [`Lanes::drain_up_to`] for the single-lane rule.
    pub async fn drain_up_to(&self, n: usize, floor: Priority) -> Vec<QueuedTask> {
        self.lanes.lock().await.drain_up_to(n, floor)
    }

    /// Empty the queue entirely (shutdown path).
    pub async fn drain_all(&self) -> Vec<QueuedTask> {
        self.lanes.lock().await.drain_all()
    }

    pub async fn len(&self) -> usize {
        self.lanes.lock().await.len()
    }

    pub async fn depths(&self) -> LaneDepths {
        self.lanes.lock().await.depths()
    }

    /// Last observed arrival sequence; pair with [`Self::await_arrival`].
    pub fn arrival_seq(&self) -> u64 {
        self.arrival_seq.load(Ordering::Acquire)
    }

    /// Block until the queue is non-empty.
    pub async fn wait_nonempty(&self) {
        loop {
            let notified = self.arrivals.notified();
            if self.len().await > 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait until the arrival sequence advances past `last_seen` or the
    /// timeout elapses. Returns the latest observed sequence either way.
    pub async fn await_arrival(&self, last_seen: u64, timeout: Duration) -> u64 {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.arrival_seq();
            if current > last_seen {
                return current;
            }
            let notified = self.arrivals.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.arrival_seq();
            }
        }
    }

    fn wake(&self) {
        self.arrival_seq.fetch_add(1, Ordering::Release);
        self.arrivals.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(id: &str, priority: Priority) -> QueuedTask {
        QueuedTask { task_id: id.to_string(), priority }
    }

    #[tokio::test]
    async fn drains_never_cross_a_lane_boundary() {
        let queue = PriorityQueue::new(100);
        queue.enqueue(queued("l1", Priority::Low)).await.unwrap();
        queue.enqueue(queued("n1", Priority::Normal)).await.unwrap();
        queue.enqueue(queued("h1", Priority::High)).await.unwrap();
        queue.enqueue(queued("h2", Priority::High)).await.unwrap();
        queue.enqueue(queued("n2", Priority::Normal)).await.unwrap();

        // While high tasks are queued a drain yields only high tasks, even
        // with room to spare.
        let first = queue.drain_up_to(10, Priority::Low).await;
        let ids: Vec<&str> = first.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, ["h1", "h2"]);

        let second = queue.drain_up_to(10, Priority::Low).await;
        let ids: Vec<&str> = second.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, ["n1", "n2"]);

        let third = queue.drain_up_to(10, Priority::Low).await;
        assert_eq!(third[0].task_id, "l1");
    }

    #[tokio::test]
    async fn drain_is_fifo_within_a_lane() {
        let queue = PriorityQueue::new(100);
        for i in 0..5 {
            queue.enqueue(queued(&format!("n{i}"), Priority::Normal)).await.unwrap();
        }
        let first = queue.drain_up_to(2, Priority::Low).await;
        let second = queue.drain_up_to(10, Priority::Low).await;
        assert_eq!(first[0].task_id, "n0");
        assert_eq!(first[1].task_id, "n1");
        assert_eq!(second[0].task_id, "n2");
    }

    #[tokio::test]
    async fn high_preempts_even_when_normal_arrived_first() {
        let queue = PriorityQueue::new(100);
        queue.enqueue(queued("n1", Priority::Normal)).await.unwrap();
        queue.enqueue(queued("h1", Priority::High)).await.unwrap();

        let drained = queue.drain_up_to(1, Priority::Low).await;
        assert_eq!(drained[0].task_id, "h1");
    }

    #[tokio::test]
    async fn floor_excludes_lower_lanes() {
        let queue = PriorityQueue::new(100);
        queue.enqueue(queued("n1", Priority::Normal)).await.unwrap();
        queue.enqueue(queued("l1", Priority::Low)).await.unwrap();

        // A high-seeded batch tops up with high arrivals only.
        assert!(queue.drain_up_to(10, Priority::High).await.is_empty());
        queue.enqueue(queued("h1", Priority::High)).await.unwrap();
        let drained = queue.drain_up_to(10, Priority::High).await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].task_id, "h1");
    }

    #[tokio::test]
    async fn cap_rejects_with_queue_full() {
        let queue = PriorityQueue::new(3);
        for i in 0..3 {
            queue.enqueue(queued(&format!("t{i}"), Priority::Normal)).await.unwrap();
        }
        let err = queue.enqueue(queued("t3", Priority::Normal)).await.unwrap_err();
        assert_eq!(err.depth, 3);
    }

    #[tokio::test]
    async fn enqueue_many_is_all_or_nothing() {
        let queue = PriorityQueue::new(3);
        queue.enqueue(queued("t0", Priority::Normal)).await.unwrap();

        let group =
            (1..4).map(|i| queued(&format!("t{i}"), Priority::Normal)).collect::<Vec<_>>();
        assert!(queue.enqueue_many(group).await.is_err());
        assert_eq!(queue.len().await, 1);

        let group =
            (1..3).map(|i| queued(&format!("t{i}"), Priority::Normal)).collect::<Vec<_>>();
        queue.enqueue_many(group).await.unwrap();
        assert_eq!(queue.len().await, 3);
    }

    #[tokio::test]
    async fn await_arrival_sees_new_enqueue() {
        let queue = std::sync::Arc::new(PriorityQueue::new(10));
        let seq = queue.arrival_seq();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.await_arrival(seq, Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(queued("t", Priority::Normal)).await.unwrap();

        let advanced = waiter.await.unwrap();
        assert!(advanced > seq);
    }

    #[tokio::test]
    async fn await_arrival_times_out_quietly() {
        let queue = PriorityQueue::new(10);
        let seq = queue.arrival_seq();
        let after = queue.await_arrival(seq, Duration::from_millis(20)).await;
        assert_eq!(after, seq);
    }

    #[tokio::test]
    async fn depths_track_lanes() {
        let queue = PriorityQueue::new(10);
        queue.enqueue(queued("h", Priority::High)).await.unwrap();
        queue.enqueue(queued("l", Priority::Low)).await.unwrap();
        let depths = queue.depths().await;
        assert_eq!((depths.high, depths.normal, depths.low), (1, 0, 1));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn rank(priority: Priority) -> u8 {
            match priority {
                Priority::High => 0,
                Priority::Normal => 1,
                Priority::Low => 2,
            }
        }

        fn arb_priority() -> impl Strategy<Value = Priority> {
            prop_oneof![
                Just(Priority::High),
                Just(Priority::Normal),
                Just(Priority::Low),
            ]
        }

        proptest! {
            /// Fully draining any enqueue sequence yields all high tasks,
            /// then all normal, then all low, FIFO within each class.
            #[test]
            fn full_drain_is_sorted_by_lane_then_fifo(
                priorities in proptest::collection::vec(arb_priority(), 0..64)
            ) {
                let mut lanes = Lanes::default();
                for (i, priority) in priorities.iter().enumerate() {
                    lanes.push(QueuedTask { task_id: format!("t{i}"), priority: *priority });
                }

                let mut drained = Vec::new();
                loop {
                    let chunk = lanes.drain_up_to(7, Priority::Low);
                    if chunk.is_empty() {
                        break;
                    }
                    drained.extend(chunk);
                }

                prop_assert_eq!(drained.len(), priorities.len());
                // Lane order is non-decreasing across the whole drain.
                for pair in drained.windows(2) {
                    prop_assert!(rank(pair[0].priority) <= rank(pair[1].priority));
                }
                // FIFO within each lane: original indices increase.
                for class in [Priority::High, Priority::Normal, Priority::Low] {
                    let indices: Vec<usize> = drained
                        .iter()
                        .filter(|t| t.priority == class)
                        .map(|t| t.task_id[1..].parse().unwrap())
                        .collect();
                    prop_assert!(indices.windows(2).all(|w| w[0] < w[1]));
                }
            }

            /// A drain never returns tasks below the requested floor.
            #[test]
            fn floor_is_respected(
                priorities in proptest::collection::vec(arb_priority(), 0..32),
                floor in arb_priority(),
            ) {
                let mut lanes = Lanes::default();
                for (i, priority) in priorities.iter().enumerate() {
                    lanes.push(QueuedTask { task_id: format!("t{i}"), priority: *priority });
                }
                let drained = lanes.drain_up_to(64, floor);
                for task in &drained {
                    prop_assert!(rank(task.priority) <= rank(floor));
                }
            }
        }
    }
}
