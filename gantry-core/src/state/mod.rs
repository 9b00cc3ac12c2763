//! Job lifecycle state machine
//!
//! - `graph`: the table of legal transitions and the hooks attached to them
//! - `machine`: `StateMachine::update_status`, master aggregation and forced transitions

pub mod graph;
pub mod machine;

pub use graph::{Hook, Transition, TransitionGraph};
pub use machine::{
    AGGREGATION_PRIORITY, NoopHooks, StateMachine, TransitionHooks, UpdateOptions,
};
