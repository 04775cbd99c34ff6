/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Parent-job view.
//!
//! The controller's job table owns the real job records; the step
//! manager reads this projection and mutates only what step accounting
//! touches: the resource-view debit counters, the step list, the
//! `next_step_id` counter, and the bookkeeping timestamps.  Every
//! public operation runs under the controller's global job write-lock.

pub mod resources;

use bitflags::bitflags;

use crate::bitmap::Bitmap;
use crate::plugins::gres::GresList;
use crate::step::StepRecord;
use crate::INFINITE;

use resources::JobResources;

/// Lifecycle state of the parent job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JobState {
    Pending,
    #[default]
    Running,
    Suspended,
    Finished,
}

bitflags! {
    /// Transient job-state flags, orthogonal to [`JobState`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct JobTransFlags: u32 {
        /// Allocated nodes are still booting / being configured.
        const CONFIGURING = 1 << 0;
        /// The job prolog has not finished on all nodes yet.
        const PROLOG_RUNNING = 1 << 1;
    }
}

/// The parent allocation steps are carved out of.
#[derive(Debug)]
pub struct Job {
    pub job_id: u32,
    pub user_id: u32,
    pub state: JobState,
    pub trans_flags: JobTransFlags,
    /// Nodes allocated to the job, over the global node table.
    pub node_bitmap: Bitmap,
    pub resources: JobResources,
    pub gres: String,
    pub gres_list: GresList,
    /// Live step records, in creation order.
    pub steps: Vec<StepRecord>,
    pub next_step_id: u32,
    /// Minutes, or [`INFINITE`].
    pub time_limit: u32,
    pub start_time: i64,
    pub end_time: i64,
    /// Last suspend or resume timestamp (zero before the first).
    pub suspend_time: i64,
    pub pre_sus_time: i64,
    pub tot_sus_time: i64,
    pub partition: String,
    /// Partition's maximum step/job time limit in minutes, or
    /// [`INFINITE`].
    pub partition_max_time: u32,
    pub account: String,
    pub name: String,
    pub network: String,
    /// Front-end deployments funnel all per-node traffic through this
    /// host.
    pub batch_host: String,
    /// Highest exit code any of the job's steps returned.
    pub derived_exit_code: i32,
    /// Bumped on every mutation; external snapshots use it for change
    /// detection.
    pub last_update: i64,
}

impl Job {
    pub fn new(job_id: u32, user_id: u32, node_bitmap: Bitmap, resources: JobResources) -> Self {
        assert_eq!(
            node_bitmap.count(),
            resources.nhosts(),
            "job resource view must cover exactly the allocated nodes"
        );
        Self {
            job_id,
            user_id,
            state: JobState::Running,
            trans_flags: JobTransFlags::empty(),
            node_bitmap,
            resources,
            gres: String::new(),
            gres_list: Vec::new(),
            steps: Vec::new(),
            next_step_id: 0,
            time_limit: INFINITE,
            start_time: 0,
            end_time: 0,
            suspend_time: 0,
            pre_sus_time: 0,
            tot_sus_time: 0,
            partition: String::new(),
            partition_max_time: INFINITE,
            account: String::new(),
            name: String::new(),
            network: String::new(),
            batch_host: String::new(),
            derived_exit_code: 0,
            last_update: 0,
        }
    }

    /// Job-local index of a global node index: the node's position
    /// within the job's node bitmap.  `None` when the node is not
    /// allocated to this job.
    pub fn node_local_index(&self, global_inx: usize) -> Option<usize> {
        if !self.node_bitmap.test(global_inx) {
            return None;
        }
        Some(
            self.node_bitmap
                .iter_set()
                .take_while(|&b| b < global_inx)
                .count(),
        )
    }

    /// Iterate `(job_local_inx, global_inx)` over the job's nodes.
    pub fn nodes(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.node_bitmap.iter_set().enumerate()
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    /// Stamp the change-detection timestamp.
    pub fn touch(&mut self, now: i64) {
        self.last_update = self.last_update.max(now);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
