/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Agent queue contract.
//!
//! Outbound per-node RPCs never block the step manager: they are
//! posted to an external agent that serialises, sends, and retries
//! them asynchronously.  Every request carries `retry = 1` — one
//! resend is the agent's business, further recovery is the caller's.

use std::sync::Mutex;

use tracing::debug;

use crate::plugins::checkpoint::CkptOp;

/// Message payloads the step manager dispatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMessage {
    /// Deliver a signal to a step's tasks on the target nodes.
    SignalTasks {
        job_id: u32,
        step_id: u32,
        signal: u32,
    },
    /// Forcefully terminate a step's tasks on the target nodes.
    TerminateTasks { job_id: u32, step_id: u32 },
    /// A step ran past its time limit; nodes must kill it.
    KillTimelimit {
        job_id: u32,
        step_id: u32,
        uid: u32,
        nodes: String,
        start_time: i64,
    },
    /// Drive a checkpoint operation on the step's tasks.
    CheckpointTasks {
        job_id: u32,
        step_id: u32,
        op: CkptOp,
        timestamp: i64,
    },
    /// Notify the step's client (srun) at its rendezvous endpoint.
    SrunStepSignal {
        host: String,
        port: u16,
        job_id: u32,
        step_id: u32,
        signal: u32,
    },
}

/// One queued outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub retry: u16,
    /// Target nodes in hostlist form (or the client host for srun
    /// notifications).
    pub hostlist: String,
    pub node_count: u32,
    pub message: AgentMessage,
}

impl AgentRequest {
    pub fn new(hostlist: String, node_count: u32, message: AgentMessage) -> Self {
        Self {
            retry: 1,
            hostlist,
            node_count,
            message,
        }
    }
}

/// The agent queue contract.
pub trait AgentQueue: Send + Sync {
    fn queue(&self, req: AgentRequest);
}

/// Default wiring: log and drop.
pub struct NullAgent;

impl AgentQueue for NullAgent {
    fn queue(&self, req: AgentRequest) {
        debug!(hostlist = %req.hostlist, message = ?req.message, "agent request dropped (no agent)");
    }
}

/// Captures every queued request — the test double embedders assert
/// dispatch behaviour with.
#[derive(Default)]
pub struct RecordingAgent {
    sent: Mutex<Vec<AgentRequest>>,
}

impl RecordingAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything queued so far.
    pub fn sent(&self) -> Vec<AgentRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

impl AgentQueue for RecordingAgent {
    fn queue(&self, req: AgentRequest) {
        self.sent.lock().unwrap().push(req);
    }
}

// Tests keep their own Arc and hand a clone to the plugin bundle.
impl AgentQueue for std::sync::Arc<RecordingAgent> {
    fn queue(&self, req: AgentRequest) {
        self.as_ref().queue(req);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
