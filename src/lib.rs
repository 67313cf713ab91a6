//! Promise/A+ style deferred values for a single-threaded event loop.
//!
//! A [`Future`] is created by an executor receiving its [`Resolve`] and
//! [`Reject`] capabilities, or by one of the factories ([`Future::resolve`],
//! [`Future::reject`], [`Future::all`], [`Future::race`]). Reactions attached
//! with [`Future::then`] run on a later turn of the [`scheduler`], and
//! whatever they return is unwrapped (nested futures and foreign
//! [`Thenable`]s included) before the derived future settles.
//!
//! # Examples
//!
//! ```
//! use pf_future::{scheduler, Future, Resolution};
//!
//! let nested = Future::<&str>::resolve("x")
//!     .and_then(|x| Ok(Resolution::Future(Future::adopt(Future::resolve(x)))))
//!     .map(|x| x.to_uppercase());
//!
//! assert_eq!(scheduler::block_on(nested.settled()), Ok(Ok(String::from("X"))));
//! ```
mod combinators;
mod error;
mod future;
mod resolution;
pub mod scheduler;
mod settled;

pub use error::Error;
pub use future::{Future, Reject, Resolve};
pub use resolution::{OnFulfilled, OnRejected, Resolution, ThenProbe, Thenable};
pub use settled::Settled;
