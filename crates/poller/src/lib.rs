//! Staggered liveness polling.
//!
//! [`StatusPoller`] spreads one request per target across a cycle budget,
//! keeps at most one request in flight per egress lane, derives live
//! transitions against its in-memory view and hands every definite result
//! to the [`writer`] task, which batches them into the store and drives the
//! load balancer.

pub mod error;
pub mod poller;
pub mod schedule;
pub mod source;
pub mod writer;

pub use error::PollError;
pub use poller::{PollerSettings, StatusPoller};
pub use source::{HttpStatusSource, StatusSource};
pub use writer::{LiveUpdate, WriteBuffer, Writer};
