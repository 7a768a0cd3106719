//! Shared domain types for Stepline.
//!
//! This crate contains the core domain types used across the Stepline engine:
//! Subject, WorkflowState, step outcomes, the error taxonomy, and engine
//! configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, thiserror.

pub mod config;
pub mod error;
pub mod state;
pub mod subject;
