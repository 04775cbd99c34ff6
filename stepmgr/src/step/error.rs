/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structured error types for step operations.
//!
//! Every variant is a distinct surfaced kind the RPC layer maps to its
//! own wire code, so callers can tell "try again later"
//! ([`StepError::NodesBusy`]) from "this request can never be satisfied
//! from this allocation"
//! ([`StepError::RequestedNodeConfigUnavailable`]) without parsing
//! message text.
//!
//! Validation failures are returned before any state is touched;
//! failures after a step record exists are fully unwound by the
//! lifecycle controller before the error is surfaced.

use thiserror::Error;

use crate::bitmap::BitmapError;
use crate::pack::PackError;
use crate::plugins::checkpoint::CkptError;
use crate::plugins::gres::GresError;
use crate::plugins::switch::SwitchError;

/// Top-level error type for every public step operation.
#[derive(Debug, Error)]
pub enum StepError {
    /// No such job or step.
    #[error("invalid job or step id")]
    InvalidJobId,

    /// The job already finished.
    #[error("job {0} already completed")]
    AlreadyDone(u32),

    /// The operation requires a running job.
    #[error("job {0} is still pending")]
    JobPending(u32),

    /// Signals require the job to be in the running state.
    #[error("job {0} is not running — no update performed")]
    TransitionStateNoUpdate(u32),

    /// The caller may not operate on this job's steps.
    #[error("uid {uid} may not act on job {job_id}")]
    AccessDenied { uid: u32, job_id: u32 },

    /// The operation is administratively unavailable in this state
    /// (e.g. checkpoint of a suspended job).
    #[error("operation disabled for job {0} in its current state")]
    Disabled(u32),

    /// A batch step was requested against a still-pending parent.
    #[error("batch step already pending for job {0}")]
    DuplicateJobId(u32),

    /// The task distribution is not accepted for this request.
    #[error("invalid task distribution")]
    BadDist,

    /// A string field exceeds its bound.
    #[error("field '{field}' exceeds {limit} bytes")]
    PathnameTooLong { field: &'static str, limit: usize },

    /// `num_tasks` is zero or exceeds `nodes × max_tasks_per_node`.
    #[error("invalid task count {num_tasks} for {node_cnt} node(s)")]
    BadTaskCount { num_tasks: u32, node_cnt: u32 },

    /// `max_nodes < min_nodes`.
    #[error("invalid node count: max {max} < min {min}")]
    InvalidNodeCount { min: u32, max: u32 },

    /// Capacity exists but is temporarily held by other steps.
    #[error("requested nodes are busy")]
    NodesBusy,

    /// Some of the job's nodes are down or not yet booted.
    #[error("required node is not available")]
    NodeNotAvail,

    /// The request can never be satisfied from this job's allocation.
    #[error("requested node configuration is not available")]
    RequestedNodeConfigUnavailable,

    /// The memory request cannot be met on a required node.
    #[error("memory request unsatisfiable on a required node")]
    InvalidTaskMemory,

    /// The GRES request is malformed or unsatisfiable on a required
    /// node.
    #[error("GRES request invalid or unsatisfiable: {0}")]
    InvalidGres(#[from] GresError),

    /// More CPUs requested than `max_nodes` nodes can supply.
    #[error("cpu count {cpu_count} needs more than max_nodes={max_nodes} node(s)")]
    TooManyRequestedCpus { cpu_count: u32, max_nodes: u32 },

    /// The step time limit exceeds the partition maximum and
    /// enforcement is on.
    #[error("time limit {requested} exceeds partition maximum {max}")]
    InvalidTimeLimit { requested: u32, max: u32 },

    /// The switch plugin rejected the step.
    #[error("interconnect failure: {0}")]
    InterconnectFailure(#[from] SwitchError),

    /// The job's step-id space is exhausted.
    #[error("job {0} has no step ids left")]
    TooManySteps(u32),

    /// The job prolog is still running; the first step must wait.
    #[error("prolog still running for job {0}")]
    PrologRunning(u32),

    /// A checkpoint plugin operation failed.
    #[error("checkpoint failure: {0}")]
    Checkpoint(#[from] CkptError),

    /// Dumped state failed to load back.
    #[error("corrupt step state: {0}")]
    Corrupt(String),
}

impl From<PackError> for StepError {
    fn from(e: PackError) -> Self {
        StepError::Corrupt(e.to_string())
    }
}

impl From<BitmapError> for StepError {
    fn from(e: BitmapError) -> Self {
        StepError::Corrupt(e.to_string())
    }
}
