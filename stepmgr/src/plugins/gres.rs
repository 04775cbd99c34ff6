/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Generic consumable resource (GRES) accounting contract.
//!
//! The plugin owns both sides of the ledger: the job's per-node totals
//! and the per-step requests carved out of them.  The step manager only
//! moves opaque [`GresList`] values around and asks the plugin three
//! questions: is this request valid, how many CPUs does GRES leave
//! usable on a node, and (de)allocate for a step.

use std::any::Any;

use thiserror::Error;
use tracing::{debug, info};

use crate::pack::{PackError, Packer, Unpacker};
use crate::NO_VAL64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GresError {
    /// The request string did not parse.
    #[error("malformed GRES request: '{0}'")]
    Malformed(String),

    /// A GRES was requested but no plugin that understands it is
    /// loaded.
    #[error("GRES '{0}' is not supported by the loaded plugin")]
    Unsupported(String),

    /// A required node cannot satisfy the step's GRES request.
    #[error("insufficient GRES on node {0}")]
    Insufficient(usize),

    /// Allocation bookkeeping underflowed or overflowed.
    #[error("GRES accounting inconsistency on node {node}: {detail}")]
    Accounting { node: usize, detail: String },

    /// Packed GRES state did not unpack.
    #[error("corrupt GRES state: {0}")]
    Corrupt(#[from] PackError),
}

/// Opaque per-job or per-step plugin state.
pub trait GresState: Any + Send + std::fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Ordered collection of plugin states (one entry per GRES kind).
pub type GresList = Vec<Box<dyn GresState>>;

/// The GRES plugin contract.
pub trait GresPlugin: Send + Sync {
    /// Validate a step's GRES request string against the job's GRES
    /// list and build the step-side state.
    fn state_validate(&self, request: &str, job_list: &GresList) -> Result<GresList, GresError>;

    /// CPUs usable on job-local node `node_inx` given the step's GRES
    /// request.  [`NO_VAL64`] means "GRES does not constrain this
    /// node".  With `ignore_alloc` the plugin disregards what running
    /// steps currently hold (the "total" view); without it, current
    /// step allocations are honoured (the "avail" view).
    fn step_test(
        &self,
        step_list: &GresList,
        job_list: &GresList,
        node_inx: usize,
        ignore_alloc: bool,
    ) -> u64;

    /// Debit the job's ledger for one node of a starting step.
    fn step_alloc(
        &self,
        step_list: &mut GresList,
        job_list: &mut GresList,
        node_inx: usize,
        cpus: u32,
    ) -> Result<(), GresError>;

    /// Return everything a step holds to the job's ledger.
    fn step_dealloc(
        &self,
        step_list: &mut GresList,
        job_list: &mut GresList,
    ) -> Result<(), GresError>;

    /// Serialise step-side state.
    fn pack_state(&self, list: &GresList, p: &mut Packer);

    /// Inverse of [`pack_state`](Self::pack_state).
    fn unpack_state(&self, u: &mut Unpacker) -> Result<GresList, GresError>;

    /// Log the state at debug level.
    fn state_log(&self, list: &GresList, job_id: u32, step_id: u32);
}

// ── gres/none ─────────────────────────────────────────────────────────────────

/// Default wiring: no GRES plugin loaded.  Empty requests succeed with
/// empty state; any concrete request is unsupported.
pub struct NoneGres;

impl GresPlugin for NoneGres {
    fn state_validate(&self, request: &str, _job_list: &GresList) -> Result<GresList, GresError> {
        if request.is_empty() {
            Ok(Vec::new())
        } else {
            Err(GresError::Unsupported(request.to_string()))
        }
    }

    fn step_test(
        &self,
        _step_list: &GresList,
        _job_list: &GresList,
        _node_inx: usize,
        _ignore_alloc: bool,
    ) -> u64 {
        NO_VAL64
    }

    fn step_alloc(
        &self,
        _step_list: &mut GresList,
        _job_list: &mut GresList,
        _node_inx: usize,
        _cpus: u32,
    ) -> Result<(), GresError> {
        Ok(())
    }

    fn step_dealloc(
        &self,
        _step_list: &mut GresList,
        _job_list: &mut GresList,
    ) -> Result<(), GresError> {
        Ok(())
    }

    fn pack_state(&self, _list: &GresList, p: &mut Packer) {
        p.pack_u32(0);
    }

    fn unpack_state(&self, u: &mut Unpacker) -> Result<GresList, GresError> {
        let cnt = u.unpack_u32()?;
        if cnt != 0 {
            return Err(GresError::Unsupported(format!("{cnt} packed GRES record(s)")));
        }
        Ok(Vec::new())
    }

    fn state_log(&self, _list: &GresList, _job_id: u32, _step_id: u32) {}
}

// ── gres/count ────────────────────────────────────────────────────────────────

/// Job-side state of one counted GRES kind: per-node totals and the
/// amounts live steps currently hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountJobState {
    pub name: String,
    pub total: Vec<u64>,
    pub used: Vec<u64>,
}

impl GresState for CountJobState {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Step-side state: the per-node count requested, and what has been
/// allocated so far as `(node_inx, count)` pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountStepState {
    pub name: String,
    pub per_node: u64,
    pub allocated: Vec<(u32, u64)>,
}

impl GresState for CountStepState {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A plain counted-resource accountant, e.g. `gpu:2` meaning two of
/// `gpu` on every step node.  Doubles as the reference implementation
/// the test suite drives GRES paths with.
pub struct CountGres;

impl CountGres {
    fn job_state<'a>(list: &'a GresList, name: &str) -> Option<&'a CountJobState> {
        list.iter()
            .filter_map(|s| s.as_any().downcast_ref::<CountJobState>())
            .find(|s| s.name == name)
    }

    fn job_state_mut<'a>(list: &'a mut GresList, name: &str) -> Option<&'a mut CountJobState> {
        list.iter_mut()
            .filter_map(|s| s.as_any_mut().downcast_mut::<CountJobState>())
            .find(|s| s.name == name)
    }
}

impl GresPlugin for CountGres {
    /// Request form: `name:count`, or bare `name` meaning one per node.
    fn state_validate(&self, request: &str, job_list: &GresList) -> Result<GresList, GresError> {
        if request.is_empty() {
            return Ok(Vec::new());
        }
        let mut out: GresList = Vec::new();
        for item in request.split(',') {
            let (name, count) = match item.split_once(':') {
                Some((n, c)) => (
                    n,
                    c.parse::<u64>()
                        .map_err(|_| GresError::Malformed(item.to_string()))?,
                ),
                None => (item, 1),
            };
            if name.is_empty() {
                return Err(GresError::Malformed(item.to_string()));
            }
            if Self::job_state(job_list, name).is_none() {
                return Err(GresError::Unsupported(name.to_string()));
            }
            out.push(Box::new(CountStepState {
                name: name.to_string(),
                per_node: count,
                allocated: Vec::new(),
            }));
        }
        Ok(out)
    }

    fn step_test(
        &self,
        step_list: &GresList,
        job_list: &GresList,
        node_inx: usize,
        ignore_alloc: bool,
    ) -> u64 {
        for state in step_list {
            let Some(req) = state.as_any().downcast_ref::<CountStepState>() else {
                continue;
            };
            if req.per_node == 0 {
                continue;
            }
            let Some(job) = Self::job_state(job_list, &req.name) else {
                return 0;
            };
            let total = job.total.get(node_inx).copied().unwrap_or(0);
            let used = if ignore_alloc {
                0
            } else {
                job.used.get(node_inx).copied().unwrap_or(0)
            };
            if total.saturating_sub(used) < req.per_node {
                return 0;
            }
        }
        // all-or-nothing: a counted GRES never splits CPUs
        NO_VAL64
    }

    fn step_alloc(
        &self,
        step_list: &mut GresList,
        job_list: &mut GresList,
        node_inx: usize,
        _cpus: u32,
    ) -> Result<(), GresError> {
        for state in step_list.iter_mut() {
            let Some(req) = state.as_any_mut().downcast_mut::<CountStepState>() else {
                continue;
            };
            let name = req.name.clone();
            let per_node = req.per_node;
            let job = Self::job_state_mut(job_list, &name).ok_or_else(|| {
                GresError::Accounting {
                    node: node_inx,
                    detail: format!("job has no '{name}' state"),
                }
            })?;
            let used = job.used.get_mut(node_inx).ok_or(GresError::Accounting {
                node: node_inx,
                detail: "node index out of range".to_string(),
            })?;
            *used = used.saturating_add(per_node);
            req.allocated.push((node_inx as u32, per_node));
            debug!(
                gres = %name,
                node_inx,
                count = per_node,
                "GRES allocated to step"
            );
        }
        Ok(())
    }

    fn step_dealloc(
        &self,
        step_list: &mut GresList,
        job_list: &mut GresList,
    ) -> Result<(), GresError> {
        for state in step_list.iter_mut() {
            let Some(req) = state.as_any_mut().downcast_mut::<CountStepState>() else {
                continue;
            };
            let name = req.name.clone();
            for (node_inx, count) in req.allocated.drain(..) {
                if let Some(job) = Self::job_state_mut(job_list, &name) {
                    if let Some(used) = job.used.get_mut(node_inx as usize) {
                        *used = used.saturating_sub(count);
                    }
                }
            }
        }
        Ok(())
    }

    fn pack_state(&self, list: &GresList, p: &mut Packer) {
        let counted: Vec<&CountStepState> = list
            .iter()
            .filter_map(|s| s.as_any().downcast_ref::<CountStepState>())
            .collect();
        p.pack_u32(counted.len() as u32);
        for s in counted {
            p.pack_str(&s.name);
            p.pack_u64(s.per_node);
            p.pack_u32(s.allocated.len() as u32);
            for (node, count) in &s.allocated {
                p.pack_u32(*node);
                p.pack_u64(*count);
            }
        }
    }

    fn unpack_state(&self, u: &mut Unpacker) -> Result<GresList, GresError> {
        let cnt = u.unpack_u32()?;
        let mut out: GresList = Vec::with_capacity(cnt as usize);
        for _ in 0..cnt {
            let name = u.unpack_str()?;
            let per_node = u.unpack_u64()?;
            let alloc_cnt = u.unpack_u32()?;
            let mut allocated = Vec::with_capacity(alloc_cnt as usize);
            for _ in 0..alloc_cnt {
                let node = u.unpack_u32()?;
                let count = u.unpack_u64()?;
                allocated.push((node, count));
            }
            out.push(Box::new(CountStepState {
                name,
                per_node,
                allocated,
            }));
        }
        Ok(out)
    }

    fn state_log(&self, list: &GresList, job_id: u32, step_id: u32) {
        for state in list {
            if let Some(s) = state.as_any().downcast_ref::<CountStepState>() {
                info!(
                    job_id,
                    step_id,
                    gres = %s.name,
                    per_node = s.per_node,
                    allocated = ?s.allocated,
                    "GRES step state"
                );
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
