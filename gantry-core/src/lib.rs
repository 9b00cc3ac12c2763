//! Gantry Core
//!
//! Core types and the job lifecycle state machine for the Gantry grid job manager.
//!
//! This crate contains:
//! - Domain types: Job, JobStatus, backend state, output files, timestamps
//! - State: the transition graph, transition hooks and the `StateMachine`
//! - DTOs: job descriptions and read-only snapshots shared with other crates

pub mod domain;
pub mod dto;
pub mod error;
pub mod state;

pub use domain::job::{Job, JobRef};
pub use domain::status::JobStatus;
pub use error::{HookSignal, JobStatusError};
pub use state::{Hook, StateMachine, TransitionGraph, TransitionHooks, UpdateOptions};
