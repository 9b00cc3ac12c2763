//! Core domain types
//!
//! The job model shared by the state machine, the gateway and the manager
//! services. Jobs form a two-level tree: a root job owns its subjobs and
//! subjobs refer back to it by id only.

pub mod backend;
pub mod files;
pub mod job;
pub mod resubmit;
pub mod status;
pub mod time;
