/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Checkpoint plugin contract.

use thiserror::Error;

use crate::pack::{PackError, Packer, Unpacker};

/// Operations a checkpoint request may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CkptOp {
    Disable,
    Enable,
    Create,
    Vacate,
    Restart,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CkptError {
    /// The operation is not valid in the step's current state.
    #[error("checkpoint operation not permitted: {0}")]
    NotPermitted(String),

    /// Packed checkpoint state did not unpack.
    #[error("corrupt checkpoint state: {0}")]
    Corrupt(#[from] PackError),
}

/// Opaque per-step checkpoint state.
pub trait CheckJobInfo: Send {
    fn pack(&self, p: &mut Packer);

    /// Perform a checkpoint operation; `now` stamps begin/complete
    /// times inside the plugin's own state.
    fn op(&mut self, op: CkptOp, ckpt_dir: &str, now: i64) -> Result<(), CkptError>;

    /// Whole-step checkpoint completion callback.
    fn comp(&mut self, error_code: u32, error_msg: &str, now: i64);

    /// Per-task checkpoint completion callback.
    fn task_comp(&mut self, task_id: u32, error_code: u32, now: i64);
}

/// The checkpoint plugin contract.
pub trait CheckpointPlugin: Send + Sync {
    fn alloc_jobinfo(&self) -> Box<dyn CheckJobInfo>;

    fn unpack_jobinfo(&self, u: &mut Unpacker) -> Result<Box<dyn CheckJobInfo>, CkptError>;
}

// ── checkpoint/none ───────────────────────────────────────────────────────────

/// No checkpoint support; operations succeed and record nothing.
pub struct NoneCheckpoint;

#[derive(Debug, Default)]
pub struct NoneCheckJobInfo {
    disabled: bool,
}

impl CheckJobInfo for NoneCheckJobInfo {
    fn pack(&self, p: &mut Packer) {
        p.pack_bool(self.disabled);
    }

    fn op(&mut self, op: CkptOp, _ckpt_dir: &str, _now: i64) -> Result<(), CkptError> {
        match op {
            CkptOp::Disable => self.disabled = true,
            CkptOp::Enable => self.disabled = false,
            CkptOp::Create | CkptOp::Vacate | CkptOp::Restart => {
                if self.disabled {
                    return Err(CkptError::NotPermitted(
                        "checkpointing disabled for this step".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn comp(&mut self, _error_code: u32, _error_msg: &str, _now: i64) {}

    fn task_comp(&mut self, _task_id: u32, _error_code: u32, _now: i64) {}
}

impl CheckpointPlugin for NoneCheckpoint {
    fn alloc_jobinfo(&self) -> Box<dyn CheckJobInfo> {
        Box::new(NoneCheckJobInfo::default())
    }

    fn unpack_jobinfo(&self, u: &mut Unpacker) -> Result<Box<dyn CheckJobInfo>, CkptError> {
        let disabled = u.unpack_bool()?;
        Ok(Box::new(NoneCheckJobInfo { disabled }))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
