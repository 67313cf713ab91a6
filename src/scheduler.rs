//! A single-threaded event loop providing the "next tick" every settlement
//! and every reaction is deferred to.
//!
//! Each thread owns its own loop. Ready tasks run in FIFO order; timers run
//! once their deadline has passed and no ready task is waiting. Nothing runs
//! until the loop is driven with [`run`], [`run_for`], [`block_on`] or
//! [`block_on_timeout`].
//!
//! # Examples
//!
//! ```
//! use pf_future::scheduler;
//! use std::{cell::RefCell, rc::Rc, time::Duration};
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let (a, b) = (seen.clone(), seen.clone());
//! scheduler::defer_after(Duration::from_millis(5), move || a.borrow_mut().push("timer"));
//! scheduler::defer(move || b.borrow_mut().push("tick"));
//! assert!(seen.borrow().is_empty());
//!
//! scheduler::run();
//! assert_eq!(*seen.borrow(), vec!["tick", "timer"]);
//! ```
use std::{
    cell::RefCell,
    cmp::Ordering,
    collections::{BinaryHeap, VecDeque},
    future::Future,
    pin::pin,
    task::{Context, Poll},
    thread,
    time::{Duration, Instant},
};

use log::trace;

use crate::Error;

type Task = Box<dyn FnOnce()>;

thread_local! {
    static EVENT_LOOP: RefCell<EventLoop> = RefCell::new(EventLoop::default());
}

#[derive(Default)]
struct EventLoop {
    ready: VecDeque<Task>,
    timers: BinaryHeap<Timer>,
    sequence: u64,
}

struct Timer {
    deadline: Instant,
    sequence: u64,
    task: Task,
}

// `BinaryHeap` is a max-heap: the earliest deadline must compare greatest.
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timer {}

enum Next {
    Run(Task),
    Wait(Instant),
    Idle,
}

impl EventLoop {
    fn next(&mut self, now: Instant) -> Next {
        if let Some(task) = self.ready.pop_front() {
            return Next::Run(task);
        }
        match self.timers.peek() {
            Some(timer) if timer.deadline <= now => match self.timers.pop() {
                Some(timer) => Next::Run(timer.task),
                None => Next::Idle,
            },
            Some(timer) => Next::Wait(timer.deadline),
            None => Next::Idle,
        }
    }
}

/// Outcome of a single attempt to make progress.
enum Turn {
    Ran,
    Idle,
    Expired,
}

fn turn(limit: Option<Instant>) -> Turn {
    loop {
        let next = EVENT_LOOP.with(|event_loop| event_loop.borrow_mut().next(Instant::now()));
        match next {
            Next::Run(task) => {
                task();
                return Turn::Ran;
            }
            Next::Idle => return Turn::Idle,
            Next::Wait(deadline) => {
                let now = Instant::now();
                if let Some(limit) = limit {
                    if limit <= deadline {
                        if now < limit {
                            thread::sleep(limit - now);
                        }
                        return Turn::Expired;
                    }
                }
                if now < deadline {
                    thread::sleep(deadline - now);
                }
            }
        }
    }
}

/// Schedules `task` to run on a later turn of this thread's event loop.
pub fn defer(task: impl FnOnce() + 'static) {
    EVENT_LOOP.with(|event_loop| event_loop.borrow_mut().ready.push_back(Box::new(task)));
}

/// Schedules `task` to run once `delay` has elapsed, never sooner than the
/// next turn.
///
/// A delay too large to be represented as an [`Instant`] never comes due, so
/// the task is dropped without running.
pub fn defer_after(delay: Duration, task: impl FnOnce() + 'static) {
    let Some(deadline) = Instant::now().checked_add(delay) else {
        trace!("timer delay {delay:?} never comes due, dropping task");
        return;
    };
    EVENT_LOOP.with(|event_loop| {
        let mut event_loop = event_loop.borrow_mut();
        event_loop.sequence += 1;
        let timer = Timer {
            deadline,
            sequence: event_loop.sequence,
            task: Box::new(task),
        };
        event_loop.timers.push(timer);
    });
}

/// Number of tasks and timers waiting on this thread's loop.
pub fn pending_tasks() -> usize {
    EVENT_LOOP.with(|event_loop| {
        let event_loop = event_loop.borrow();
        event_loop.ready.len() + event_loop.timers.len()
    })
}

/// Drives the loop until no ready task and no timer remain.
///
/// Returns how many tasks were run.
pub fn run() -> usize {
    let mut ran = 0;
    while let Turn::Ran = turn(None) {
        ran += 1;
    }
    trace!("event loop idle after {ran} tasks");
    ran
}

/// Like [`run`], but gives up once `limit` has elapsed. A limit past what an
/// [`Instant`] can represent is unbounded.
pub fn run_for(limit: Duration) -> usize {
    let Some(deadline) = Instant::now().checked_add(limit) else {
        return run();
    };
    let mut ran = 0;
    while Instant::now() < deadline {
        match turn(Some(deadline)) {
            Turn::Ran => ran += 1,
            Turn::Idle | Turn::Expired => break,
        }
    }
    trace!("event loop stopped after {ran} tasks");
    ran
}

/// Polls `future` to completion, driving the event loop between polls.
///
/// Fails with [`Error::Stalled`] if the loop runs out of work while the future
/// is still pending: on a single thread nothing could settle it any more.
pub fn block_on<F: Future>(future: F) -> Result<F::Output, Error> {
    drive(future, None)
}

/// Like [`block_on`], but fails with [`Error::TimedOut`] once `limit` has
/// elapsed. A limit past what an [`Instant`] can represent is unbounded.
pub fn block_on_timeout<F: Future>(future: F, limit: Duration) -> Result<F::Output, Error> {
    drive(future, Instant::now().checked_add(limit))
}

fn drive<F: Future>(future: F, limit: Option<Instant>) -> Result<F::Output, Error> {
    let mut future = pin!(future);
    let mut cx = Context::from_waker(futures::task::noop_waker_ref());
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return Ok(output);
        }
        if let Some(limit) = limit {
            if Instant::now() >= limit {
                return Err(Error::TimedOut);
            }
        }
        match turn(limit) {
            Turn::Ran => {}
            Turn::Idle => return Err(Error::Stalled),
            Turn::Expired => return Err(Error::TimedOut),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_defer_runs_in_fifo_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        for i in 0..5 {
            let seen = seen.clone();
            defer(move || seen.borrow_mut().push(i));
        }
        assert_eq!(pending_tasks(), 5);
        assert_eq!(run(), 5);
        assert_eq!(*seen.borrow(), vec![0, 1, 2, 3, 4]);
        assert_eq!(pending_tasks(), 0);
    }

    #[test]
    fn test_tasks_can_defer_more_tasks() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let outer = seen.clone();
        defer(move || {
            outer.borrow_mut().push("outer");
            let inner = outer.clone();
            defer(move || inner.borrow_mut().push("inner"));
        });
        run();
        assert_eq!(*seen.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_timers_fire_by_deadline() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        for (delay, label) in [(20, "slow"), (5, "fast"), (5, "fast-second")] {
            let seen = seen.clone();
            defer_after(Duration::from_millis(delay), move || seen.borrow_mut().push(label));
        }
        run();
        assert_eq!(*seen.borrow(), vec!["fast", "fast-second", "slow"]);
    }

    #[test]
    fn test_run_for_stops_at_limit() {
        let fired = Rc::new(RefCell::new(false));
        let flag = fired.clone();
        defer_after(Duration::from_secs(60), move || *flag.borrow_mut() = true);

        let started = Instant::now();
        run_for(Duration::from_millis(20));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!*fired.borrow());
        assert_eq!(pending_tasks(), 1);
    }

    #[test]
    fn test_block_on_ready_future() {
        assert_eq!(block_on(async { 7 }), Ok(7));
    }

    #[test]
    fn test_block_on_stalls_on_idle_loop() {
        assert_eq!(block_on(std::future::pending::<()>()), Err(Error::Stalled));
    }

    #[test]
    fn test_defer_after_unrepresentable_delay_never_runs() {
        let fired = Rc::new(RefCell::new(false));
        let flag = fired.clone();
        defer_after(Duration::MAX, move || *flag.borrow_mut() = true);
        assert_eq!(pending_tasks(), 0);
        assert_eq!(run(), 0);
        assert!(!*fired.borrow());
    }

    #[test]
    fn test_run_for_unbounded_limit() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let timer = seen.clone();
        defer_after(Duration::from_millis(5), move || timer.borrow_mut().push("timer"));
        let tick = seen.clone();
        defer(move || tick.borrow_mut().push("tick"));
        assert_eq!(run_for(Duration::MAX), 2);
        assert_eq!(*seen.borrow(), vec!["tick", "timer"]);
    }

    #[test]
    fn test_block_on_timeout_unbounded_limit() {
        assert_eq!(block_on_timeout(async { 1 }, Duration::MAX), Ok(1));
        assert_eq!(
            block_on_timeout(std::future::pending::<()>(), Duration::MAX),
            Err(Error::Stalled)
        );
    }

    #[test]
    fn test_block_on_timeout_expires() {
        defer_after(Duration::from_secs(60), || {});
        let result = block_on_timeout(std::future::pending::<()>(), Duration::from_millis(10));
        assert_eq!(result, Err(Error::TimedOut));
    }
}
