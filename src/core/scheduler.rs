use crate::core::errors::Result;
use log::trace;
use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::rc::Rc;

type Task = Box<dyn FnOnce() -> Result<()>>;

/// Identifier of a scheduled task, used for cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

struct ScheduledTask {
    due: u64,
    sequence_num: u64,
    task: Task,
}

impl PartialEq for ScheduledTask {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence_num == other.sequence_num
    }
}

impl Eq for ScheduledTask {}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (BinaryHeap is max-heap by default)
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.sequence_num.cmp(&self.sequence_num))
    }
}

struct SchedulerState {
    queue: RefCell<BinaryHeap<ScheduledTask>>,
    cancelled: RefCell<HashSet<u64>>,
    sequence_counter: Cell<u64>,
    /// Virtual clock in milliseconds
    now: Cell<u64>,
}

/// Cooperative single-threaded task scheduler with a virtual millisecond clock.
///
/// All packet delivery in a network happens synchronously; the scheduler only
/// carries deferred work: asynchronous completions of process functions and
/// the termination debounce. Tasks due at the same time run in the order they
/// were scheduled.
#[derive(Clone)]
pub struct Scheduler {
    state: Rc<SchedulerState>,
}

impl Scheduler {
    /// Create a new scheduler with its clock at zero
    pub fn new() -> Self {
        Self {
            state: Rc::new(SchedulerState {
                queue: RefCell::new(BinaryHeap::new()),
                cancelled: RefCell::new(HashSet::new()),
                sequence_counter: Cell::new(0),
                now: Cell::new(0),
            }),
        }
    }

    /// Current virtual time in milliseconds
    pub fn now(&self) -> u64 {
        self.state.now.get()
    }

    /// Run a task on the next turn, after everything already due now
    pub fn defer(&self, task: impl FnOnce() -> Result<()> + 'static) -> TaskId {
        self.schedule(0, task)
    }

    /// Run a task once `delay_ms` of virtual time has elapsed
    pub fn schedule(&self, delay_ms: u64, task: impl FnOnce() -> Result<()> + 'static) -> TaskId {
        let sequence_num = self.state.sequence_counter.get();
        self.state.sequence_counter.set(sequence_num + 1);
        self.state.queue.borrow_mut().push(ScheduledTask {
            due: self.now() + delay_ms,
            sequence_num,
            task: Box::new(task),
        });
        TaskId(sequence_num)
    }

    /// Cancel a task that has not run yet
    pub fn cancel(&self, id: TaskId) {
        self.state.cancelled.borrow_mut().insert(id.0);
    }

    /// Number of tasks waiting to run, cancelled ones excluded
    pub fn pending(&self) -> usize {
        let cancelled = self.state.cancelled.borrow();
        self.state
            .queue
            .borrow()
            .iter()
            .filter(|t| !cancelled.contains(&t.sequence_num))
            .count()
    }

    /// Check if there are any tasks remaining
    pub fn has_tasks(&self) -> bool {
        self.pending() > 0
    }

    /// Due time of the next live task
    pub fn peek_next_due(&self) -> Option<u64> {
        let cancelled = self.state.cancelled.borrow();
        self.state
            .queue
            .borrow()
            .iter()
            .filter(|t| !cancelled.contains(&t.sequence_num))
            .map(|t| t.due)
            .min()
    }

    fn pop_live(&self, deadline: Option<u64>) -> Option<ScheduledTask> {
        let mut queue = self.state.queue.borrow_mut();
        let mut cancelled = self.state.cancelled.borrow_mut();
        loop {
            let next = queue.peek()?;
            if deadline.map_or(false, |d| next.due > d) {
                return None;
            }
            let next = queue.pop()?;
            if cancelled.remove(&next.sequence_num) {
                continue;
            }
            return Some(next);
        }
    }

    fn run_task(&self, scheduled: ScheduledTask) -> Result<()> {
        if scheduled.due > self.now() {
            self.state.now.set(scheduled.due);
        }
        trace!(target: "rflow::scheduler", "running task {} at {}ms", scheduled.sequence_num, self.now());
        (scheduled.task)()
    }

    /// Run the next task. Returns false when nothing was left to run.
    pub fn step(&self) -> Result<bool> {
        match self.pop_live(None) {
            Some(task) => {
                self.run_task(task)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run tasks until the queue is empty, returning how many ran.
    ///
    /// The first failing task aborts the run and its error is returned.
    pub fn run_until_idle(&self) -> Result<usize> {
        let mut steps = 0;
        while self.step()? {
            steps += 1;
        }
        Ok(steps)
    }

    /// Run every task due up to `deadline` and move the clock there
    pub fn advance_to(&self, deadline: u64) -> Result<usize> {
        let mut steps = 0;
        while let Some(task) = self.pop_live(Some(deadline)) {
            self.run_task(task)?;
            steps += 1;
        }
        if deadline > self.now() {
            self.state.now.set(deadline);
        }
        Ok(steps)
    }

    /// Advance the clock by `ms`, running everything that falls due
    pub fn advance_by(&self, ms: u64) -> Result<usize> {
        self.advance_to(self.now() + ms)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
