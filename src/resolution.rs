//! Reduces whatever a reaction hands back (a plain value, a native
//! [`Future`] or a foreign [`Thenable`]) to exactly one settle call.
use std::{
    cell::{Cell, RefCell},
    collections::HashSet,
    fmt,
    rc::Rc,
};

use log::{debug, trace};

use crate::{
    future::{Reject, Resolve},
    Error, Future,
};

/// What a handler produced, to be unwrapped before the derived future settles.
pub enum Resolution<T, E> {
    Value(T),
    Future(Future<T, E>),
    Thenable(Rc<dyn Thenable<T, E>>),
}

impl<T, E> Resolution<T, E> {
    /// Wraps a foreign thenable.
    pub fn thenable(thenable: impl Thenable<T, E> + 'static) -> Self {
        Resolution::Thenable(Rc::new(thenable))
    }

    fn id(&self) -> Option<usize> {
        match self {
            Resolution::Value(_) => None,
            Resolution::Future(future) => Some(future.id()),
            Resolution::Thenable(thenable) => Some(Rc::as_ptr(thenable) as *const () as usize),
        }
    }
}

impl<T, E> From<Future<T, E>> for Resolution<T, E> {
    fn from(future: Future<T, E>) -> Self {
        Resolution::Future(future)
    }
}

impl<T, E> Clone for Resolution<T, E>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        match self {
            Resolution::Value(value) => Resolution::Value(value.clone()),
            Resolution::Future(future) => Resolution::Future(future.clone()),
            Resolution::Thenable(thenable) => Resolution::Thenable(thenable.clone()),
        }
    }
}

impl<T: fmt::Debug, E> fmt::Debug for Resolution<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Resolution::Future(future) => f.debug_tuple("Future").field(future).finish(),
            Resolution::Thenable(_) => f.write_str("Thenable(..)"),
        }
    }
}

/// Result of looking up a thenable's `then` capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThenProbe<T> {
    /// `then` is callable; the object is treated as a foreign thenable.
    Callable,
    /// `then` is absent or not callable; the object is an ordinary value.
    Plain(T),
}

/// Any foreign object speaking the `then(on_fulfilled, on_rejected)` protocol.
///
/// Implementations need not be well behaved: continuations called more than
/// once, or both of them called, only count the first time.
pub trait Thenable<T, E> {
    /// Reads the `then` capability. An `Err` rejects the pending future.
    fn probe(&self) -> Result<ThenProbe<T>, E> {
        Ok(ThenProbe::Callable)
    }

    /// Invokes `then`. An `Err` rejects the pending future unless one of the
    /// continuations was already called.
    fn then(
        &self,
        on_fulfilled: OnFulfilled<T, E>,
        on_rejected: OnRejected<T, E>,
    ) -> Result<(), E>;
}

/// Identity-keyed set of futures and thenables already being unwrapped by
/// one chain, shared by reference across the whole chain.
///
/// Handles are retained so an address cannot be recycled while the chain is
/// still walking. A thenable that stores its [`OnFulfilled`] therefore forms
/// an `Rc` cycle with this set (thenable → continuation → set → thenable).
/// The cycle is broken when the thenable drops the continuation after
/// calling it; a thenable that keeps it and never settles leaks both.
pub(crate) struct Visited<T, E> {
    shared: Rc<RefCell<VisitedSet<T, E>>>,
}

struct VisitedSet<T, E> {
    ids: HashSet<usize>,
    retained: Vec<Resolution<T, E>>,
}

impl<T, E> Clone for Visited<T, E> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T: Clone, E> Visited<T, E> {
    /// A set that already holds the future being resolved, so a handler
    /// handing that same future back is caught.
    pub(crate) fn seeded(future: &Future<T, E>) -> Self {
        let visited = Self {
            shared: Rc::new(RefCell::new(VisitedSet {
                ids: HashSet::new(),
                retained: Vec::new(),
            })),
        };
        visited.insert(&Resolution::Future(future.clone()));
        visited
    }

    fn contains(&self, id: usize) -> bool {
        self.shared.borrow().ids.contains(&id)
    }

    fn insert(&self, x: &Resolution<T, E>) {
        if let Some(id) = x.id() {
            let mut set = self.shared.borrow_mut();
            if set.ids.insert(id) {
                set.retained.push(x.clone());
            }
        }
    }
}

/// Fulfillment continuation handed to [`Thenable::then`].
///
/// Thenables that hold on to it until they settle should release it
/// afterwards; it keeps the whole unwrap chain, the thenable included, alive.
pub struct OnFulfilled<T, E> {
    called: Rc<Cell<bool>>,
    resolve: Resolve<T, E>,
    reject: Reject<T, E>,
    visited: Visited<T, E>,
}

/// Rejection continuation handed to [`Thenable::then`].
pub struct OnRejected<T, E> {
    called: Rc<Cell<bool>>,
    reject: Reject<T, E>,
}

impl<T, E> Clone for OnFulfilled<T, E> {
    fn clone(&self) -> Self {
        Self {
            called: self.called.clone(),
            resolve: self.resolve.clone(),
            reject: self.reject.clone(),
            visited: self.visited.clone(),
        }
    }
}

impl<T, E> Clone for OnRejected<T, E> {
    fn clone(&self) -> Self {
        Self {
            called: self.called.clone(),
            reject: self.reject.clone(),
        }
    }
}

impl<T, E> fmt::Debug for OnFulfilled<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnFulfilled").field("called", &self.called.get()).finish()
    }
}

impl<T, E> fmt::Debug for OnRejected<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnRejected").field("called", &self.called.get()).finish()
    }
}

impl<T, E> OnFulfilled<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Continues unwrapping with `y`, which may itself be a future or thenable.
    pub fn call(&self, y: Resolution<T, E>) {
        if self.called.replace(true) {
            trace!("thenable settled more than once, ignoring fulfillment");
            return;
        }
        resolve_promise(y, self.resolve.clone(), self.reject.clone(), self.visited.clone());
    }

    /// Shorthand for `call(Resolution::Value(value))`.
    pub fn fulfill(&self, value: T) {
        self.call(Resolution::Value(value));
    }
}

impl<T, E> OnRejected<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Rejects with `reason` as-is; rejection reasons are never unwrapped.
    pub fn call(&self, reason: E) {
        if self.called.replace(true) {
            trace!("thenable settled more than once, ignoring rejection");
            return;
        }
        self.reject.reject(reason);
    }
}

/// Settles through `resolve` or `reject` according to `x`, chasing nested
/// futures and thenables until a plain value or a rejection turns up.
///
/// Meeting a future or thenable already in `visited` rejects with
/// [`Error::CircularReference`] instead of waiting on itself forever.
pub(crate) fn resolve_promise<T, E>(
    x: Resolution<T, E>,
    resolve: Resolve<T, E>,
    reject: Reject<T, E>,
    visited: Visited<T, E>,
) where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    if let Some(id) = x.id() {
        if visited.contains(id) {
            debug!("circular reference while resolving a future");
            reject.reject(Error::CircularReference.into());
            return;
        }
    }

    match x {
        Resolution::Value(value) => resolve.resolve(value),
        Resolution::Future(ref future) => {
            visited.insert(&x);
            // Fulfillment values of a native future are already plain.
            future.subscribe(
                move |value| resolve.resolve(value),
                move |reason| reject.reject(reason),
            );
        }
        Resolution::Thenable(ref thenable) => match thenable.probe() {
            Err(reason) => reject.reject(reason),
            Ok(ThenProbe::Plain(value)) => resolve.resolve(value),
            Ok(ThenProbe::Callable) => {
                visited.insert(&x);
                let called = Rc::new(Cell::new(false));
                let on_fulfilled = OnFulfilled {
                    called: called.clone(),
                    resolve,
                    reject: reject.clone(),
                    visited,
                };
                let on_rejected = OnRejected {
                    called: called.clone(),
                    reject: reject.clone(),
                };
                if let Err(reason) = thenable.then(on_fulfilled, on_rejected) {
                    if called.replace(true) {
                        trace!("thenable raised after settling, ignoring");
                    } else {
                        reject.reject(reason);
                    }
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler;

    struct Later(i32);

    impl Thenable<i32, Error> for Later {
        fn then(
            &self,
            on_fulfilled: OnFulfilled<i32, Error>,
            _: OnRejected<i32, Error>,
        ) -> Result<(), Error> {
            let value = self.0;
            scheduler::defer(move || on_fulfilled.fulfill(value));
            Ok(())
        }
    }

    fn settle(x: Resolution<i32, Error>) -> Result<i32, Error> {
        let future = Future::resolve_with(x);
        scheduler::block_on(future.settled()).unwrap_or_else(Err)
    }

    #[test]
    fn test_plain_value() {
        assert_eq!(settle(Resolution::Value(3)), Ok(3));
    }

    #[test]
    fn test_native_future() {
        assert_eq!(settle(Future::resolve(4).into()), Ok(4));
    }

    #[test]
    fn test_foreign_thenable() {
        assert_eq!(settle(Resolution::thenable(Later(5))), Ok(5));
    }

    struct Stored {
        continuation: RefCell<Option<OnFulfilled<i32, Error>>>,
    }

    impl Thenable<i32, Error> for Stored {
        fn then(
            &self,
            on_fulfilled: OnFulfilled<i32, Error>,
            _: OnRejected<i32, Error>,
        ) -> Result<(), Error> {
            *self.continuation.borrow_mut() = Some(on_fulfilled);
            Ok(())
        }
    }

    #[test]
    fn test_stored_continuation_released_after_settling() {
        let thenable = Rc::new(Stored { continuation: RefCell::new(None) });
        let weak = Rc::downgrade(&thenable);
        let future = Future::resolve_with(Resolution::Thenable(thenable.clone()));
        scheduler::run();

        // Pending: the stored continuation keeps the thenable reachable.
        drop(thenable);
        let thenable = weak.upgrade().expect("held by the pending chain");
        let continuation = thenable.continuation.borrow_mut().take();
        drop(thenable);
        if let Some(continuation) = continuation {
            continuation.fulfill(6);
        }

        assert_eq!(scheduler::block_on(future.settled()), Ok(Ok(6)));
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_visited_tracks_identity_not_value() {
        let a = Future::<i32>::resolve(1);
        let b = Future::<i32>::resolve(1);
        let visited = Visited::seeded(&a);
        assert!(visited.contains(a.id()));
        assert!(visited.contains(a.clone().id()));
        assert!(!visited.contains(b.id()));
        scheduler::run();
    }

    #[test]
    fn test_visited_is_shared_between_clones() {
        let a = Future::<i32>::resolve(1);
        let b = Future::<i32>::resolve(2);
        let visited = Visited::seeded(&a);
        visited.clone().insert(&Resolution::Future(b.clone()));
        assert!(visited.contains(b.id()));
        assert_eq!(visited.shared.borrow().retained.len(), 2);
        scheduler::run();
    }
}
