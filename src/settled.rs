use std::cell::RefCell;
use std::future::IntoFuture;
use std::rc::Rc;
use std::{future::Future as StdFuture, pin::Pin, task::{Context, Poll, Waker}};

use crate::{Error, Future};

/// Awaitable view of a [`Future`]'s outcome. Every poller gets woken once the
/// future settles, and every one of them receives a copy of the outcome.
///
/// Only the event loop settles futures, so drive it with
/// [`scheduler::block_on`](crate::scheduler::block_on) or alongside
/// [`scheduler::run`](crate::scheduler::run).
///
/// # Examples
///
/// ```
/// use pf_future::{scheduler, Future};
///
/// let future = Future::<&str>::resolve("🍓");
/// let settled = scheduler::block_on(async move { future.await });
/// assert_eq!(settled, Ok(Ok("🍓")));
/// ```
pub struct Settled<T, E> {
    shared: Rc<RefCell<Shared<T, E>>>,
}

impl<T, E> Clone for Settled<T, E> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T, E> std::fmt::Debug for Settled<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.borrow();
        f.debug_struct("Settled")
            .field("ready", &shared.value.is_some())
            .field("wakers", &shared.wakers.len())
            .finish()
    }
}

struct Shared<T, E> {
    value: Option<Result<T, E>>,
    wakers: Vec<Waker>,
}

impl<T, E> Shared<T, E> {
    fn complete(&mut self, value: Result<T, E>) {
        self.value = Some(value);
        for waker in self.wakers.drain(..) {
            waker.wake()
        }
    }
}

impl<T, E> Future<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Returns an awaitable that completes with this future's outcome.
    pub fn settled(&self) -> Settled<T, E> {
        let shared = Rc::new(RefCell::new(Shared {
            value: None,
            wakers: vec![],
        }));
        let (fulfilled, rejected) = (shared.clone(), shared.clone());
        self.subscribe(
            move |value| fulfilled.borrow_mut().complete(Ok(value)),
            move |reason| rejected.borrow_mut().complete(Err(reason)),
        );
        Settled { shared }
    }
}

impl<T, E> IntoFuture for Future<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    type Output = Result<T, E>;
    type IntoFuture = Settled<T, E>;

    fn into_future(self) -> Self::IntoFuture {
        self.settled()
    }
}

impl<T: Clone, E: Clone> StdFuture for Settled<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.borrow_mut();
        match shared.value {
            Some(ref value) => Poll::Ready(value.clone()),
            None => {
                if !shared.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
                    shared.wakers.push(cx.waker().clone());
                }
                Poll::Pending
            }
        }
    }
}
