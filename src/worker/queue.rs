//! Pending-task storage for the worker process.
//!
//! The queue is shared between the dispatcher thread and all worker threads.
//! Priorities are served strictly high-to-low; within one priority a rotating
//! cursor alternates between the kinds present there so no kind can starve
//! another; within one kind tasks are FIFO. Main-thread-only kinds flow
//! through the same cursor as everything else: a pool thread finding such a
//! task selected waits for the dispatcher to take it, and the dispatcher
//! waits its turn behind pool work the cursor ordered first. Dispatch order
//! is therefore a property of the queue alone, not of how messages happened
//! to arrive.
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::protocol::{TaskId, TaskKind, TaskPayload};

/// A task as it sits in the worker, id plus payload.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: TaskId,
    pub payload: TaskPayload,
}

/// FIFOs for one priority level with the round-robin cursor.
struct PriorityBucket {
    priority: u8,
    fifos: Vec<(TaskKind, VecDeque<QueuedTask>)>,
    cursor: usize,
}

impl PriorityBucket {
    fn push(&mut self, task: QueuedTask) {
        let kind = task.payload.kind();
        let fifo = self
            .fifos
            .iter_mut()
            .find(|(k, _)| *k == kind)
            .map(|(_, fifo)| fifo)
            .expect("kind registered for this priority");
        fifo.push_back(task);
    }
}

/// The `(bucket, fifo)` the dequeue algorithm has chosen next, with its kind.
#[derive(Debug, Clone, Copy)]
struct Selected {
    bucket: usize,
    fifo: usize,
    kind: TaskKind,
}

struct QueueState {
    should_quit: bool,
    /// Buckets ordered from highest to lowest priority.
    buckets: Vec<PriorityBucket>,
}

impl QueueState {
    /// The next task per strict priority and the per-level rotation, without
    /// removing it.
    fn selection(&self) -> Option<Selected> {
        for (bi, bucket) in self.buckets.iter().enumerate() {
            let n = bucket.fifos.len();
            for step in 0..n {
                let fi = (bucket.cursor + step) % n;
                if !bucket.fifos[fi].1.is_empty() {
                    return Some(Selected {
                        bucket: bi,
                        fifo: fi,
                        kind: bucket.fifos[fi].0,
                    });
                }
            }
        }
        None
    }

    /// Remove the selected task and advance the cursor one slot past it.
    fn pop_selected(&mut self, sel: Selected) -> QueuedTask {
        let bucket = &mut self.buckets[sel.bucket];
        let task = bucket.fifos[sel.fifo]
            .1
            .pop_front()
            .expect("selected fifo is non-empty");
        bucket.cursor = (sel.fifo + 1) % bucket.fifos.len();
        task
    }

    fn has_main_thread_task(&self) -> bool {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.fifos.iter())
            .any(|(kind, fifo)| kind.main_thread_only() && !fifo.is_empty())
    }
}

/// Thread-safe priority queue for the worker process.
///
/// `push` and the blocking `next` are the hot path; `filter` and `shutdown`
/// are control operations issued by the dispatcher thread.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl TaskQueue {
    /// Build the queue with one FIFO per `(priority, kind)` pair. The kind
    /// set is closed, so the shape is fixed at construction.
    pub fn new() -> Self {
        let mut priorities: Vec<u8> = TaskKind::ALL.iter().map(|k| k.priority()).collect();
        priorities.sort_unstable_by(|a, b| b.cmp(a));
        priorities.dedup();

        let buckets = priorities
            .into_iter()
            .map(|priority| PriorityBucket {
                priority,
                fifos: TaskKind::ALL
                    .iter()
                    .filter(|k| k.priority() == priority)
                    .map(|k| (*k, VecDeque::new()))
                    .collect(),
                cursor: 0,
            })
            .collect();

        Self {
            state: Mutex::new(QueueState {
                should_quit: false,
                buckets,
            }),
            ready: Condvar::new(),
        }
    }

    /// Enqueue a task and wake every waiter: a push can change the selection
    /// for the pool and the dispatcher alike.
    pub fn push(&self, task: QueuedTask) {
        let mut state = self.state.lock().expect("task queue lock poisoned");
        let priority = task.payload.priority();
        state
            .buckets
            .iter_mut()
            .find(|b| b.priority == priority)
            .expect("bucket exists for every declared priority")
            .push(task);
        drop(state);
        self.ready.notify_all();
    }

    /// Blocking dequeue for pool threads. The cursor's order is binding: a
    /// selected main-thread-only task is left in place and the caller waits
    /// until the dispatcher has taken it. Returns `None` once
    /// [`TaskQueue::shutdown`] has been called, which is the pool thread's
    /// signal to exit.
    pub fn next(&self) -> Option<QueuedTask> {
        let mut state = self.state.lock().expect("task queue lock poisoned");
        loop {
            if state.should_quit {
                return None;
            }
            if let Some(sel) = state.selection() {
                if !sel.kind.main_thread_only() {
                    let task = state.pop_selected(sel);
                    drop(state);
                    self.ready.notify_all();
                    return Some(task);
                }
            }
            state = self.ready.wait(state).expect("task queue lock poisoned");
        }
    }

    /// Dequeue for the dispatcher thread: the next main-thread-only task, at
    /// its cursor turn. Blocks while such a task is queued but the cursor
    /// has pool work ahead of it; returns `None` once no main-thread task is
    /// queued, or on shutdown.
    pub fn next_main_thread(&self) -> Option<QueuedTask> {
        let mut state = self.state.lock().expect("task queue lock poisoned");
        loop {
            if state.should_quit || !state.has_main_thread_task() {
                return None;
            }
            if let Some(sel) = state.selection() {
                if sel.kind.main_thread_only() {
                    let task = state.pop_selected(sel);
                    drop(state);
                    self.ready.notify_all();
                    return Some(task);
                }
            }
            state = self.ready.wait(state).expect("task queue lock poisoned");
        }
    }

    /// Remove queued tasks of the given kinds whose payload fails `keep`.
    /// Runs under the queue lock so a removed task can never be dequeued
    /// concurrently. Returns how many tasks were dropped.
    pub fn filter<F>(&self, kinds: &[TaskKind], keep: F) -> usize
    where
        F: Fn(&TaskPayload) -> bool,
    {
        let mut state = self.state.lock().expect("task queue lock poisoned");
        let mut removed = 0;
        for bucket in &mut state.buckets {
            for (kind, fifo) in &mut bucket.fifos {
                if !kinds.contains(kind) {
                    continue;
                }
                let before = fifo.len();
                fifo.retain(|task| keep(&task.payload));
                removed += before - fifo.len();
            }
        }
        drop(state);
        // A removal can unblock a pool thread waiting behind a cancelled
        // main-thread task.
        self.ready.notify_all();
        removed
    }

    /// Number of queued tasks across all buckets.
    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("task queue lock poisoned");
        state
            .buckets
            .iter()
            .flat_map(|b| b.fifos.iter())
            .map(|(_, fifo)| fifo.len())
            .sum()
    }

    /// Whether no task is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set the terminal flag and wake every waiter.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("task queue lock poisoned");
        state.should_quit = true;
        drop(state);
        self.ready.notify_all();
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
