//! Resumable workflow engine core.
//!
//! This crate contains the "brain" of the engine, split the same way the
//! runtime is layered:
//! - `store` -- persistent state store port and the in-process implementation
//! - `lock` -- leased mutual-exclusion built on the store
//! - `queue` -- persisted subject queue, mutated only under the lock
//! - `environment` -- the observed/acted-upon environment boundary
//! - `resolver` -- pure mapping from (checkpoint, live location) to next step
//! - `executor` -- step executor trait, outcomes, and the ordered registry
//! - `retry` -- one error taxonomy, one retry/backoff policy
//! - `poller` -- bounded polling of an external message channel
//! - `verification` -- the external verification channel boundary
//! - `controller` -- the resolve/execute/classify/persist loop
//!
//! Depends only on `stepline-types`; storage and HTTP implementations live
//! in `stepline-infra`.

pub mod controller;
pub mod environment;
pub mod executor;
pub mod lock;
pub mod poller;
pub mod queue;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod verification;
