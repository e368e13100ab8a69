//! Batch notification dispatch and completion tracking.
//!
//! The planner fans a request out as one broker message per recipient. Delivery
//! workers send each item, persist its record and count it down in the counter
//! store. Whoever takes the count to zero hands the task to the finalizer,
//! which calls back exactly once. Tasks that never reach zero are completed by
//! the reconciliation sweep, which runs on one instance at a time through the
//! single-runner scheduler.

pub mod broker;
pub mod counter;
pub mod finalizer;
pub mod memory;
pub mod message;
pub mod planner;
pub mod reaper;
pub mod reconcile;
pub mod scheduler;
pub mod store;
pub mod testing;
pub mod worker;
