/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Interconnect (switch) plugin contract.
//!
//! A step that spans nodes may need fabric state programmed before its
//! tasks can communicate.  The plugin hands out one opaque handle per
//! step; the handle is built from the step's layout, serialised with
//! the step, and released (fully or per node range) as nodes complete.

use thiserror::Error;

use crate::pack::{PackError, Packer, Unpacker};
use crate::step::layout::StepLayout;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SwitchError {
    /// The fabric could not be programmed for this layout.
    #[error("switch window allocation failed: {0}")]
    BuildFailed(String),

    /// Packed switch state did not unpack.
    #[error("corrupt switch state: {0}")]
    Corrupt(#[from] PackError),
}

/// Opaque per-step interconnect state.
pub trait SwitchJobInfo: Send {
    /// Program fabric state for the step's layout.
    fn build(&mut self, layout: &StepLayout, network: &str) -> Result<(), SwitchError>;

    /// Serialise for step-state dump.
    fn pack(&self, p: &mut Packer);

    /// Release all fabric state (last node reported).
    fn step_complete(&mut self, nodes: &str);

    /// Release fabric state for a completed node range only.
    fn step_part_comp(&mut self, nodes: &str);

    /// Re-register state after a controller restart.
    fn step_allocated(&mut self, nodes: &str);
}

/// The switch plugin contract.
pub trait SwitchPlugin: Send + Sync {
    fn alloc_jobinfo(&self) -> Box<dyn SwitchJobInfo>;

    fn unpack_jobinfo(&self, u: &mut Unpacker) -> Result<Box<dyn SwitchJobInfo>, SwitchError>;

    /// Whether the plugin supports releasing per-node-range state
    /// before the whole step completes.
    fn part_comp(&self) -> bool;
}

// ── switch/none ───────────────────────────────────────────────────────────────

/// No interconnect state to manage; every operation succeeds.
pub struct NoneSwitch;

#[derive(Debug, Default)]
pub struct NoneSwitchJobInfo {
    built: bool,
}

impl SwitchJobInfo for NoneSwitchJobInfo {
    fn build(&mut self, _layout: &StepLayout, _network: &str) -> Result<(), SwitchError> {
        self.built = true;
        Ok(())
    }

    fn pack(&self, p: &mut Packer) {
        p.pack_bool(self.built);
    }

    fn step_complete(&mut self, _nodes: &str) {
        self.built = false;
    }

    fn step_part_comp(&mut self, _nodes: &str) {}

    fn step_allocated(&mut self, _nodes: &str) {
        self.built = true;
    }
}

impl SwitchPlugin for NoneSwitch {
    fn alloc_jobinfo(&self) -> Box<dyn SwitchJobInfo> {
        Box::new(NoneSwitchJobInfo::default())
    }

    fn unpack_jobinfo(&self, u: &mut Unpacker) -> Result<Box<dyn SwitchJobInfo>, SwitchError> {
        let built = u.unpack_bool()?;
        Ok(Box::new(NoneSwitchJobInfo { built }))
    }

    fn part_comp(&self) -> bool {
        false
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
