use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use crate::{Error, Future};

impl<T, E> Future<T, E>
where
    T: Clone + 'static,
    E: Clone + From<Error> + 'static,
{
    /// Fulfills with every input's value, in input order, once all of them
    /// have fulfilled. Rejects with the first rejection; the remaining inputs
    /// keep running but their outcomes are ignored.
    ///
    /// An empty input fulfills with an empty `Vec`.
    ///
    /// # Examples
    ///
    /// ```
    /// use pf_future::{scheduler, Future};
    ///
    /// let inputs = vec![Future::resolve(1), Future::resolve(2), Future::resolve(3)];
    /// let all = Future::<i32>::all(inputs);
    /// assert_eq!(scheduler::block_on(all.settled()), Ok(Ok(vec![1, 2, 3])));
    /// ```
    pub fn all<I>(futures: I) -> Future<Vec<T>, E>
    where
        I: IntoIterator<Item = Future<T, E>>,
    {
        let futures: Vec<_> = futures.into_iter().collect();
        Future::new(move |resolve, reject| {
            let total = futures.len();
            if total == 0 {
                resolve.resolve(Vec::new());
                return Ok(());
            }
            let results = Rc::new(RefCell::new(vec![None; total]));
            let completed = Rc::new(Cell::new(0));
            for (index, future) in futures.into_iter().enumerate() {
                let results = results.clone();
                let completed = completed.clone();
                let resolve = resolve.clone();
                let reject = reject.clone();
                future.subscribe(
                    move |value| {
                        results.borrow_mut()[index] = Some(value);
                        completed.set(completed.get() + 1);
                        if completed.get() == total {
                            let values = results.take().into_iter().flatten().collect();
                            resolve.resolve(values);
                        }
                    },
                    move |reason| reject.reject(reason),
                );
            }
            Ok(())
        })
    }

    /// Settles like whichever input settles first, on either channel.
    ///
    /// An empty input never settles.
    pub fn race<I>(futures: I) -> Future<T, E>
    where
        I: IntoIterator<Item = Future<T, E>>,
    {
        let futures: Vec<_> = futures.into_iter().collect();
        Future::new(move |resolve, reject| {
            for future in futures {
                let resolve = resolve.clone();
                let reject = reject.clone();
                future.subscribe(
                    move |value| resolve.resolve(value),
                    move |reason| reject.reject(reason),
                );
            }
            Ok(())
        })
    }
}
