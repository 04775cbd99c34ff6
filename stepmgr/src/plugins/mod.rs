/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Outbound plugin contracts.
//!
//! The step manager never talks to hardware, interconnects, or
//! databases directly — it calls these traits.  Each contract ships a
//! `none/` implementation (the default wiring when no real plugin is
//! loaded) so the manager is fully operational out of the box, plus a
//! recording agent queue for embedders' tests.
//!
//! Handle ownership: opaque per-step handles (switch, checkpoint) are
//! owned by the step record as boxed trait objects and released by
//! dropping them after their release method has run.

pub mod acct;
pub mod agent;
pub mod checkpoint;
pub mod gres;
pub mod switch;

pub use acct::{AcctStorage, Jobacct, NullAcct};
pub use agent::{AgentMessage, AgentQueue, AgentRequest, NullAgent, RecordingAgent};
pub use checkpoint::{CheckJobInfo, CheckpointPlugin, CkptError, CkptOp, NoneCheckpoint};
pub use gres::{CountGres, GresError, GresList, GresPlugin, NoneGres};
pub use switch::{NoneSwitch, SwitchError, SwitchJobInfo, SwitchPlugin};

/// The full plugin bundle a [`crate::step::lifecycle::StepManager`]
/// operates through.
pub struct Plugins {
    pub gres: Box<dyn GresPlugin>,
    pub switch: Box<dyn SwitchPlugin>,
    pub checkpoint: Box<dyn CheckpointPlugin>,
    pub acct: Box<dyn AcctStorage>,
    pub agent: Box<dyn AgentQueue>,
}

impl Plugins {
    /// All-`none` wiring with the given agent queue.
    pub fn with_agent(agent: Box<dyn AgentQueue>) -> Self {
        Self {
            gres: Box::new(NoneGres),
            switch: Box::new(NoneSwitch),
            checkpoint: Box::new(NoneCheckpoint),
            acct: Box::new(NullAcct),
            agent,
        }
    }
}

impl Default for Plugins {
    fn default() -> Self {
        Self::with_agent(Box::new(NullAgent))
    }
}
