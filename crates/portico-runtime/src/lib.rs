//! Controller runtime for Portico
//!
//! Change feeds fill the [`cache`]; the [`router`] turns cache notifications
//! into keys on the [`queue`]; the [`worker`] pool drains the queue through a
//! [`Reconciler`]. [`Controller`] wires the pieces together.

#![deny(missing_docs)]

pub mod cache;
pub mod controller;
pub mod feed;
pub mod queue;
pub mod router;
pub mod worker;

pub use cache::{Handler, Notification, ObjectCache, Store};
pub use controller::{Controller, ControllerConfig};
pub use feed::{ChangeFeed, ChannelFeed, FeedEvent, FeedSender};
pub use queue::{ItemExponentialBackoff, RateLimiter, WorkQueue};
pub use router::EventRouter;
pub use worker::{Reconciler, RetryDecision, WorkerPool};
