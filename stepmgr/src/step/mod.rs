/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Step records and the per-job record store.
//!
//! A step is identified by `(job_id, step_id)`; ids are handed out by
//! a per-job monotone counter and never reused, so within one job the
//! creation order is always the id order.  The job exclusively owns
//! its records; a record reaches back to its job only through the
//! job-local node indices baked into its bitmaps.

pub mod cores;
pub mod error;
pub mod info;
pub mod layout;
pub mod lifecycle;
pub mod select;
pub mod state;

use crate::bitmap::Bitmap;
use crate::job::Job;
use crate::plugins::acct::Jobacct;
use crate::plugins::checkpoint::CheckJobInfo;
use crate::plugins::gres::GresList;
use crate::plugins::switch::SwitchJobInfo;
use crate::{BATCH_STEP_ID, INFINITE, MAX_STEP_ID, NO_VAL};

use error::StepError;
use layout::{StepLayout, TaskDist};

/// Registered-step lifecycle: running until the first node reports
/// completion, completing until the last one does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepState {
    #[default]
    Running,
    Completing,
}

/// One live step of a job.
pub struct StepRecord {
    pub step_id: u32,
    pub state: StepState,
    /// Nodes the step may use; subset of the job's node bitmap.
    /// Absent only for the batch step.
    pub step_node_bitmap: Option<Bitmap>,
    /// Cores this step holds, as per-job offsets into the job's core
    /// bitmap.
    pub core_bitmap_job: Option<Bitmap>,
    /// Zero means the request was task-count-driven.
    pub cpus_per_task: u16,
    pub cpu_count: u32,
    /// MB per CPU; zero when the step reserves no memory.
    pub mem_per_cpu: u64,
    pub num_tasks: u32,
    pub task_dist: TaskDist,
    pub plane_size: u16,
    /// Materialised task placement; absent for the batch step.
    pub layout: Option<StepLayout>,
    /// Whether the step reserves CPUs (vs overcommitting them).
    pub exclusive: bool,
    /// Survive node failure instead of being killed.
    pub no_kill: bool,
    /// Minutes, or [`INFINITE`].
    pub time_limit: u32,
    pub start_time: i64,
    pub pre_sus_time: i64,
    pub tot_sus_time: i64,
    pub ckpt_time: i64,
    /// Minutes between automatic checkpoints; zero disables them.
    pub ckpt_interval: u16,
    pub ckpt_dir: String,
    pub exit_code: i32,
    /// One bit per step node, set as each node reports completion.
    /// Allocated lazily by the first partial-completion.
    pub exit_node_bitmap: Option<Bitmap>,
    pub switch_job: Option<Box<dyn SwitchJobInfo>>,
    pub check_job: Option<Box<dyn CheckJobInfo>>,
    pub gres: String,
    pub gres_list: GresList,
    /// `NO_VAL` disables reservation, zero derives the count from the
    /// layout.
    pub resv_port_cnt: u32,
    pub resv_ports: String,
    pub resv_port_array: Vec<u16>,
    /// Client (srun) rendezvous endpoint.
    pub host: String,
    pub port: u16,
    pub name: String,
    pub network: String,
    pub batch_step: bool,
    /// Uid that issued a kill, if any; `NO_VAL` otherwise.
    pub requid: u32,
    pub jobacct: Jobacct,
}

impl StepRecord {
    fn new(step_id: u32) -> Self {
        Self {
            step_id,
            state: StepState::Running,
            step_node_bitmap: None,
            core_bitmap_job: None,
            cpus_per_task: 0,
            cpu_count: 0,
            mem_per_cpu: 0,
            num_tasks: 0,
            task_dist: TaskDist::default(),
            plane_size: 0,
            layout: None,
            exclusive: false,
            no_kill: false,
            time_limit: INFINITE,
            start_time: 0,
            pre_sus_time: 0,
            tot_sus_time: 0,
            ckpt_time: 0,
            ckpt_interval: 0,
            ckpt_dir: String::new(),
            exit_code: 0,
            exit_node_bitmap: None,
            switch_job: None,
            check_job: None,
            gres: String::new(),
            gres_list: Vec::new(),
            resv_port_cnt: NO_VAL,
            resv_ports: String::new(),
            resv_port_array: Vec::new(),
            host: String::new(),
            port: 0,
            name: String::new(),
            network: String::new(),
            batch_step: false,
            requid: NO_VAL,
            jobacct: Jobacct::default(),
        }
    }

    /// Node count of the step (zero for the batch step).
    pub fn node_count(&self) -> usize {
        self.step_node_bitmap.as_ref().map_or(0, Bitmap::count)
    }

    /// `true` once the step is distributed cyclically.
    pub fn cyclic_alloc(&self) -> bool {
        matches!(self.task_dist, TaskDist::Cyclic)
    }
}

impl std::fmt::Debug for StepRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRecord")
            .field("step_id", &self.step_id)
            .field("state", &self.state)
            .field("nodes", &self.step_node_bitmap)
            .field("num_tasks", &self.num_tasks)
            .field("cpu_count", &self.cpu_count)
            .field("exclusive", &self.exclusive)
            .field("batch_step", &self.batch_step)
            .finish_non_exhaustive()
    }
}

/// A step creation request as the RPC layer hands it over.
///
/// Sentinels follow the wire conventions: [`NO_VAL`] means "not
/// specified", [`INFINITE`] on `min_nodes` means "every available
/// node".
#[derive(Debug, Clone)]
pub struct StepCreateRequest {
    pub job_id: u32,
    pub user_id: u32,
    pub min_nodes: u32,
    pub max_nodes: u32,
    /// [`NO_VAL`] derives the count from `cpu_count` or the node
    /// count.
    pub num_tasks: u32,
    pub cpu_count: u32,
    /// MB per CPU; zero reserves no memory.
    pub mem_per_cpu: u64,
    pub gres: String,
    pub node_list: Option<String>,
    /// Skip this many of the job's first nodes; [`NO_VAL`] means
    /// unspecified (idle nodes are preferred instead).
    pub relative: u32,
    pub task_dist: TaskDist,
    pub plane_size: u16,
    pub exclusive: bool,
    pub overcommit: bool,
    pub immediate: bool,
    pub no_kill: bool,
    /// Minutes; zero or [`INFINITE`] means unlimited.
    pub time_limit: u32,
    pub ckpt_interval: u16,
    pub ckpt_dir: String,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub network: String,
    /// [`NO_VAL`] disables port reservation, zero derives the count
    /// from the layout.
    pub resv_port_cnt: u32,
}

impl Default for StepCreateRequest {
    fn default() -> Self {
        Self {
            job_id: 0,
            user_id: 0,
            min_nodes: 1,
            max_nodes: 0,
            num_tasks: NO_VAL,
            cpu_count: 0,
            mem_per_cpu: 0,
            gres: String::new(),
            node_list: None,
            relative: NO_VAL,
            task_dist: TaskDist::default(),
            plane_size: 0,
            exclusive: false,
            overcommit: false,
            immediate: false,
            no_kill: false,
            time_limit: 0,
            ckpt_interval: 0,
            ckpt_dir: String::new(),
            host: String::new(),
            port: 0,
            name: String::new(),
            network: String::new(),
            resv_port_cnt: NO_VAL,
        }
    }
}

/// Filter for bulk step deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepFilter {
    All,
    /// Only steps that never acquired interconnect state.
    NoSwitchOnly,
}

// ── Per-job record store ──────────────────────────────────────────────────────

impl Job {
    /// Allocate a record with the next step id (or the batch sentinel)
    /// and register it.
    ///
    /// # Errors
    /// [`StepError::TooManySteps`] once the id space is exhausted —
    /// ids are never reused, so this job can run no further steps.
    pub fn create_step_record(&mut self, batch: bool) -> Result<&mut StepRecord, StepError> {
        let step_id = if batch {
            BATCH_STEP_ID
        } else {
            if self.next_step_id >= MAX_STEP_ID {
                return Err(StepError::TooManySteps(self.job_id));
            }
            let id = self.next_step_id;
            self.next_step_id += 1;
            id
        };
        self.steps.push(StepRecord::new(step_id));
        Ok(self.steps.last_mut().unwrap())
    }

    /// Look up a step; [`NO_VAL`] means "any" and returns the first
    /// step in creation order.
    pub fn find_step(&self, step_id: u32) -> Option<&StepRecord> {
        if step_id == NO_VAL {
            return self.steps.first();
        }
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Mutable variant of [`find_step`](Self::find_step).
    pub fn find_step_mut(&mut self, step_id: u32) -> Option<&mut StepRecord> {
        if step_id == NO_VAL {
            return self.steps.first_mut();
        }
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Unregister and return a record without releasing anything it
    /// holds; resource release is the lifecycle controller's job.
    pub(crate) fn remove_step_record(&mut self, step_id: u32) -> Option<StepRecord> {
        let pos = self.steps.iter().position(|s| s.step_id == step_id)?;
        Some(self.steps.remove(pos))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
