//! Transition graph
//!
//! The explicit table of legal `(from, to)` status pairs. Each edge carries a
//! human-readable cause and optionally the hook to run before the new status
//! is committed. Self-transitions are always legal and never listed.

use std::collections::BTreeMap;

use crate::domain::status::JobStatus;
use crate::error::GraphError;

/// Callbacks attached to transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// About to contact the backend
    MonitorSubmitting,
    /// Accepted by the backend
    MonitorSubmitted,
    /// Submission abandoned; workspace released and subjobs dropped
    RollbackToNew,
    MonitorFailed,
    MonitorKilled,
    /// Resolve output files of a completed job
    Postprocess,
    /// Resolve output files of a job that failed while completing
    PostprocessFailed,
}

/// One edge of the graph
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub cause: &'static str,
    pub hook: Option<Hook>,
}

/// Directed graph of legal status transitions
#[derive(Debug, Clone, Default)]
pub struct TransitionGraph {
    states: BTreeMap<JobStatus, Vec<Transition>>,
}

/// Builder for the edges leaving one state
pub struct StateEdges<'a> {
    graph: &'a mut TransitionGraph,
    from: JobStatus,
}

impl StateEdges<'_> {
    pub fn edge(self, to: JobStatus, cause: &'static str, hook: Option<Hook>) -> Self {
        let from = self.from;
        self.graph
            .states
            .entry(from)
            .or_default()
            .push(Transition { from, to, cause, hook });
        self
    }
}

impl TransitionGraph {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Declares `from` as a state and returns a builder for its edges
    pub fn state(&mut self, from: JobStatus) -> StateEdges<'_> {
        self.states.entry(from).or_default();
        StateEdges { graph: self, from }
    }

    /// The standard job lifecycle
    pub fn standard() -> Self {
        use Hook::*;
        use JobStatus::*;

        let mut graph = Self::empty();

        graph
            .state(New)
            .edge(Submitting, "submit() called", Some(MonitorSubmitting))
            .edge(Removed, "job removed", None);
        graph
            .state(Submitting)
            .edge(New, "submission failed", Some(RollbackToNew))
            .edge(Submitted, "accepted by the backend", Some(MonitorSubmitted))
            .edge(Unknown, "forced remove or lost during submission", None)
            .edge(Failed, "submission failed", Some(MonitorFailed));
        graph
            .state(Submitted)
            .edge(Running, "job started", None)
            .edge(Killed, "kill() called", Some(MonitorKilled))
            .edge(Unknown, "forced remove", None)
            .edge(Failed, "failed before running", Some(MonitorFailed))
            .edge(Submitting, "resubmit() called", None)
            .edge(Completing, "job finished, collecting output", None)
            .edge(Completed, "job finished", Some(Postprocess));
        graph
            .state(Running)
            .edge(Completing, "job finished, collecting output", None)
            .edge(Completed, "job finished", Some(Postprocess))
            .edge(Failed, "job failed", Some(MonitorFailed))
            .edge(Killed, "kill() called", Some(MonitorKilled))
            .edge(Unknown, "forced remove", None)
            .edge(Submitting, "resubmit() called", None)
            .edge(Submitted, "rescheduled by the backend", None);
        graph
            .state(Completing)
            .edge(Completed, "output collected", Some(Postprocess))
            .edge(Failed, "output collection failed", Some(PostprocessFailed))
            .edge(Killed, "kill() called while parked", Some(MonitorKilled))
            .edge(Unknown, "forced remove", None)
            .edge(Submitting, "resubmit() called", None)
            .edge(Submitted, "rescheduled by the backend", None);
        graph
            .state(Killed)
            .edge(Removed, "job removed", None)
            .edge(Failed, "forced failed", None)
            .edge(Submitting, "resubmit() called", None)
            .edge(Submitted, "rescheduled by the backend", None);
        graph
            .state(Failed)
            .edge(Removed, "job removed", None)
            .edge(Submitting, "resubmit() called", None)
            .edge(Completed, "output recovered", Some(Postprocess))
            .edge(Submitted, "rescheduled by the backend", None);
        graph
            .state(Completed)
            .edge(Removed, "job removed", None)
            .edge(Failed, "failed post-processing", None)
            .edge(Submitting, "resubmit() called", None)
            .edge(Submitted, "rescheduled by the backend", None);
        graph.state(Incomplete).edge(Removed, "job removed", None);
        graph.state(Unknown).edge(Removed, "job removed", None);
        graph.state(Template).edge(Removed, "job removed", None);
        graph.state(Removed);

        graph
    }

    /// The edge from `from` to `to`, if the graph lists one
    pub fn lookup(&self, from: JobStatus, to: JobStatus) -> Option<&Transition> {
        self.states
            .get(&from)
            .and_then(|edges| edges.iter().find(|t| t.to == to))
    }

    pub fn is_allowed(&self, from: JobStatus, to: JobStatus) -> bool {
        from == to || self.lookup(from, to).is_some()
    }

    /// Every edge, grouped by source state
    pub fn transitions(&self) -> impl Iterator<Item = &Transition> {
        self.states.values().flatten()
    }

    /// Checks the table for completeness
    pub fn validate(&self) -> Result<(), GraphError> {
        for status in JobStatus::ALL {
            if !self.states.contains_key(&status) {
                return Err(GraphError::MissingState(status));
            }
        }

        for edges in self.states.values() {
            for (i, edge) in edges.iter().enumerate() {
                if edges[..i].iter().any(|other| other.to == edge.to) {
                    return Err(GraphError::DuplicateEdge {
                        from: edge.from,
                        to: edge.to,
                    });
                }
            }
        }

        if self.lookup(JobStatus::Template, JobStatus::Submitting).is_some() {
            return Err(GraphError::TemplateSubmittable);
        }

        if self
            .states
            .get(&JobStatus::Removed)
            .is_some_and(|edges| !edges.is_empty())
        {
            return Err(GraphError::RemovedHasExits);
        }

        if self.lookup(JobStatus::New, JobStatus::Submitting).is_none() {
            return Err(GraphError::NewNotSubmittable);
        }

        Ok(())
    }
}
