//! The deferred value itself: a write-once state cell, its two reaction
//! queues and the `then` family built on top of them.
use std::{cell::RefCell, fmt, rc::Rc};

use log::trace;

use crate::{
    resolution::{resolve_promise, Resolution, Visited},
    scheduler, Error,
};

type Reactions<V> = Vec<Box<dyn FnOnce(V)>>;

#[derive(Debug)]
enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

struct Inner<T, E> {
    state: State<T, E>,
    fulfill_reactions: Reactions<T>,
    reject_reactions: Reactions<E>,
}

type Shared<T, E> = Rc<RefCell<Inner<T, E>>>;

/// A value that becomes available, or fails, on a later turn of the event
/// loop.
///
/// A `Future` is a handle: clones refer to the same state cell. Its outcome is
/// only observable through [`then`](Future::then) and the methods built on it,
/// and reactions always run asynchronously, even when the outcome is already
/// known.
///
/// # Examples
///
/// ```
/// use pf_future::{scheduler, Error, Future};
///
/// let answer = Future::<i32>::new(|resolve, _reject| {
///     resolve.resolve(40);
///     Ok(())
/// })
/// .map(|value| value + 2);
///
/// assert_eq!(scheduler::block_on(answer.settled()), Ok(Ok(42)));
///
/// let failed = Future::<i32>::reject(Error::rejected("boom")).map(|value| value + 2);
/// assert_eq!(
///     scheduler::block_on(failed.settled()),
///     Ok(Err(Error::rejected("boom")))
/// );
/// ```
pub struct Future<T, E = Error> {
    inner: Shared<T, E>,
}

impl<T, E> Clone for Future<T, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T, E> fmt::Debug for Future<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.try_borrow() {
            Ok(inner) => match inner.state {
                State::Pending => "pending",
                State::Fulfilled(_) => "fulfilled",
                State::Rejected(_) => "rejected",
            },
            Err(_) => "settling",
        };
        f.debug_struct("Future").field("state", &state).finish()
    }
}

/// The fulfillment capability handed to an executor.
pub struct Resolve<T, E> {
    inner: Shared<T, E>,
}

/// The rejection capability handed to an executor.
pub struct Reject<T, E> {
    inner: Shared<T, E>,
}

impl<T, E> Clone for Resolve<T, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T, E> Clone for Reject<T, E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T, E> fmt::Debug for Resolve<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolve").finish_non_exhaustive()
    }
}

impl<T, E> fmt::Debug for Reject<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reject").finish_non_exhaustive()
    }
}

impl<T, E> Future<T, E> {
    fn pending() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                state: State::Pending,
                fulfill_reactions: Vec::new(),
                reject_reactions: Vec::new(),
            })),
        }
    }

    /// Identity of the state cell, shared by every clone of this handle.
    pub(crate) fn id(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }

    pub(crate) fn capabilities(&self) -> (Resolve<T, E>, Reject<T, E>) {
        (
            Resolve { inner: self.inner.clone() },
            Reject { inner: self.inner.clone() },
        )
    }
}

impl<T, E> Future<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Creates a future and runs `executor` synchronously with its settle
    /// capabilities. An `Err` returned by the executor rejects the future.
    pub fn new<F>(executor: F) -> Self
    where
        F: FnOnce(Resolve<T, E>, Reject<T, E>) -> Result<(), E>,
    {
        let future = Self::pending();
        let (resolve, reject) = future.capabilities();
        if let Err(reason) = executor(resolve, reject.clone()) {
            reject.reject(reason);
        }
        future
    }

    /// A future fulfilled with `value` on a later turn.
    pub fn resolve(value: T) -> Self {
        Self::new(|resolve, _| {
            resolve.resolve(value);
            Ok(())
        })
    }

    /// A future that takes on the eventual outcome of `future`.
    pub fn adopt(future: Future<T, E>) -> Self {
        Self::new(|resolve, _| {
            resolve.adopt(future);
            Ok(())
        })
    }

    /// A future settled by running `resolution` through the full unwrap
    /// algorithm, so foreign thenables are honored as well.
    pub fn resolve_with(resolution: Resolution<T, E>) -> Self {
        let future = Self::pending();
        future.settle_with(Ok(resolution));
        future
    }

    /// A future rejected with `reason` on a later turn.
    pub fn reject(reason: E) -> Self {
        Self::new(|_, reject| {
            reject.reject(reason);
            Ok(())
        })
    }

    /// Registers a reaction pair on this future.
    ///
    /// Exactly one of the two callbacks runs, on a later turn than this call.
    pub(crate) fn subscribe<F, R>(&self, on_fulfilled: F, on_rejected: R)
    where
        F: FnOnce(T) + 'static,
        R: FnOnce(E) + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let settled = match &inner.state {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(reason) => Some(Err(reason.clone())),
        };
        match settled {
            None => {
                inner.fulfill_reactions.push(Box::new(on_fulfilled));
                inner.reject_reactions.push(Box::new(on_rejected));
            }
            Some(Ok(value)) => {
                drop(inner);
                scheduler::defer(move || on_fulfilled(value));
            }
            Some(Err(reason)) => {
                drop(inner);
                scheduler::defer(move || on_rejected(reason));
            }
        }
    }

    /// Returns a future for the result of applying the matching handler to
    /// this future's outcome.
    ///
    /// Whatever a handler returns is unwrapped (nested futures and foreign
    /// thenables included) before the returned future settles. A handler
    /// returning `Err` rejects the returned future with that reason.
    pub fn then<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Future<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
        R: FnOnce(E) -> Result<Resolution<U, E>, E> + 'static,
    {
        let next = Future::<U, E>::pending();
        let fulfilled = next.clone();
        let rejected = next.clone();
        self.subscribe(
            move |value| fulfilled.settle_with(on_fulfilled(value)),
            move |reason| rejected.settle_with(on_rejected(reason)),
        );
        next
    }

    /// [`then`](Future::then) without a rejection handler: rejections pass
    /// through untouched and `on_fulfilled` is never called for them.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Future<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<Resolution<U, E>, E> + 'static,
    {
        self.then(on_fulfilled, Err)
    }

    /// [`and_then`](Future::and_then) for handlers producing a plain value.
    pub fn map<U, F>(&self, f: F) -> Future<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        self.and_then(move |value| Ok(Resolution::Value(f(value))))
    }

    /// [`then`](Future::then) without a fulfillment handler: values pass
    /// through untouched.
    pub fn catch<R>(&self, on_rejected: R) -> Future<T, E>
    where
        R: FnOnce(E) -> Result<Resolution<T, E>, E> + 'static,
    {
        self.then(|value| Ok(Resolution::Value(value)), on_rejected)
    }

    fn settle_with(&self, outcome: Result<Resolution<T, E>, E>) {
        let (resolve, reject) = self.capabilities();
        match outcome {
            Ok(resolution) => resolve_promise(resolution, resolve, reject, Visited::seeded(self)),
            Err(reason) => reject.reject(reason),
        }
    }
}

impl<T, E> Resolve<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Fulfills the future with `value` on a later turn, unless it has
    /// settled by then.
    pub fn resolve(&self, value: T) {
        let inner = self.inner.clone();
        scheduler::defer(move || {
            let reactions = {
                let mut inner = inner.borrow_mut();
                if !matches!(inner.state, State::Pending) {
                    trace!("ignoring resolve of an already settled future");
                    return;
                }
                inner.state = State::Fulfilled(value.clone());
                inner.reject_reactions.clear();
                std::mem::take(&mut inner.fulfill_reactions)
            };
            trace!("future fulfilled, running {} reactions", reactions.len());
            for reaction in reactions {
                reaction(value.clone());
            }
        });
    }

    /// Makes the future follow `future`: it settles however `future` does.
    ///
    /// Adopting the future this capability belongs to rejects it with
    /// [`Error::CircularReference`].
    pub fn adopt(&self, future: Future<T, E>) {
        let reject = Reject { inner: self.inner.clone() };
        if Rc::ptr_eq(&self.inner, &future.inner) {
            reject.reject(Error::CircularReference.into());
            return;
        }
        let resolve = self.clone();
        future.subscribe(
            move |value| resolve.resolve(value),
            move |reason| reject.reject(reason),
        );
    }
}

impl<T, E> Reject<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Rejects the future with `reason` on a later turn, unless it has
    /// settled by then.
    pub fn reject(&self, reason: E) {
        let inner = self.inner.clone();
        scheduler::defer(move || {
            let reactions = {
                let mut inner = inner.borrow_mut();
                if !matches!(inner.state, State::Pending) {
                    trace!("ignoring reject of an already settled future");
                    return;
                }
                inner.state = State::Rejected(reason.clone());
                inner.fulfill_reactions.clear();
                std::mem::take(&mut inner.reject_reactions)
            };
            trace!("future rejected, running {} reactions", reactions.len());
            for reaction in reactions {
                reaction(reason.clone());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn outcome<T: Clone + 'static>(future: &Future<T>) -> Rc<RefCell<Option<Result<T, Error>>>> {
        let slot = Rc::new(RefCell::new(None));
        let (fulfilled, rejected) = (slot.clone(), slot.clone());
        future.subscribe(
            move |value| *fulfilled.borrow_mut() = Some(Ok(value)),
            move |reason| *rejected.borrow_mut() = Some(Err(reason)),
        );
        slot
    }

    #[test]
    fn test_executor_runs_synchronously() {
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let _future = Future::<()>::new(move |_, _| {
            flag.set(true);
            Ok(())
        });
        assert!(ran.get());
    }

    #[test]
    fn test_settlement_is_deferred() {
        let future = Future::<i32>::new(|resolve, _| {
            resolve.resolve(1);
            Ok(())
        });
        assert!(matches!(future.inner.borrow().state, State::Pending));
        scheduler::run();
        assert!(matches!(future.inner.borrow().state, State::Fulfilled(1)));
    }

    #[test]
    fn test_executor_error_rejects() {
        let future = Future::<i32>::new(|_, _| Err(Error::rejected("executor failed")));
        let slot = outcome(&future);
        scheduler::run();
        assert_eq!(*slot.borrow(), Some(Err(Error::rejected("executor failed"))));
    }

    #[test]
    fn test_first_settlement_wins() {
        let future = Future::<i32>::new(|resolve, reject| {
            resolve.resolve(1);
            reject.reject(Error::rejected("late"));
            resolve.resolve(2);
            Ok(())
        });
        let slot = outcome(&future);
        scheduler::run();
        assert_eq!(*slot.borrow(), Some(Ok(1)));
    }

    #[test]
    fn test_reactions_drained_once() {
        let future = Future::<i32>::resolve(5);
        let calls = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let calls = calls.clone();
            future.subscribe(move |_| calls.set(calls.get() + 1), |_| {});
        }
        scheduler::run();
        assert_eq!(calls.get(), 3);
        let inner = future.inner.borrow();
        assert!(inner.fulfill_reactions.is_empty());
        assert!(inner.reject_reactions.is_empty());
    }

    #[test]
    fn test_adopting_itself_rejects() {
        let future = Future::<i32>::new(|_, _| Ok(()));
        let (resolve, _) = future.capabilities();
        resolve.adopt(future.clone());
        let slot = outcome(&future);
        scheduler::run();
        assert_eq!(*slot.borrow(), Some(Err(Error::CircularReference)));
    }

    #[test]
    fn test_debug_shows_state() {
        let future = Future::<i32>::reject(Error::rejected("no"));
        assert_eq!(format!("{future:?}"), "Future { state: \"pending\" }");
        scheduler::run();
        assert_eq!(format!("{future:?}"), "Future { state: \"rejected\" }");
    }
}
