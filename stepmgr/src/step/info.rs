/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Step-info snapshots for queries.
//!
//! A response carries the snapshot time, a record count, and one flat
//! record per matching step.  The count is written as a placeholder
//! first and patched once iteration finishes, so a single pass builds
//! the whole response.

use bytes::Bytes;

use crate::config::StepmgrConfig;
use crate::hostlist;
use crate::job::{Job, JobState};
use crate::node::NodeTable;
use crate::pack::Packer;
use crate::step::error::StepError;
use crate::step::StepRecord;
use crate::NO_VAL;

/// Show-flags bit: include other users' steps.
pub const SHOW_ALL: u16 = 1 << 0;

/// Pack one step's info record.
///
/// On front-end deployments the task count and node list report the
/// *job's* allocation: the steps all appear to run on the batch host,
/// so the step-level placement is meaningless to clients.
pub fn pack_step_info(
    job: &Job,
    step: &StepRecord,
    config: &StepmgrConfig,
    table: &NodeTable,
    now: i64,
    p: &mut Packer,
) {
    p.pack_u32(job.job_id);
    p.pack_u32(step.step_id);
    p.pack_u16(step.ckpt_interval);
    p.pack_u32(job.user_id);

    let (task_cnt, node_list) = if config.front_end {
        (
            job.resources.cpus.iter().sum::<u32>(),
            hostlist::ranged_string(&job.node_bitmap, table),
        )
    } else {
        (
            step.layout.as_ref().map_or(0, |l| l.task_cnt),
            step.layout
                .as_ref()
                .map(|l| l.node_list.clone())
                .unwrap_or_default(),
        )
    };
    p.pack_u32(step.cpu_count);
    p.pack_u32(task_cnt);
    p.pack_u32(step.time_limit);
    p.pack_time(step.start_time);
    p.pack_time(run_time(job, step, now));

    p.pack_str(&job.partition);
    p.pack_str(&step.resv_ports);
    p.pack_str(&node_list);
    p.pack_str(&step.name);
    p.pack_str(&step.network);
    p.pack_str(
        &step
            .step_node_bitmap
            .as_ref()
            .map(|m| m.fmt_ranges())
            .unwrap_or_default(),
    );
    p.pack_str(&step.ckpt_dir);
    p.pack_str(&step.gres);
}

/// Wall-clock run time excluding suspension.
fn run_time(job: &Job, step: &StepRecord, now: i64) -> i64 {
    if job.state == JobState::Suspended {
        step.pre_sus_time
    } else {
        let base = step.start_time.max(job.suspend_time);
        step.pre_sus_time + (now - base).max(0)
    }
}

/// Build a step-info response over `jobs`.
///
/// `job_id`/`step_id` of [`NO_VAL`] match everything; a concrete pair
/// that matches nothing is [`StepError::InvalidJobId`].  Without
/// [`SHOW_ALL`], only the requesting uid's jobs are visible.
#[allow(clippy::too_many_arguments)]
pub fn pack_info_response(
    jobs: &[&Job],
    job_id: u32,
    step_id: u32,
    uid: u32,
    show_flags: u16,
    config: &StepmgrConfig,
    table: &NodeTable,
    now: i64,
) -> Result<Bytes, StepError> {
    let mut p = Packer::new();
    p.pack_time(now);
    let count_mark = p.mark();
    p.pack_u32(0);

    let mut count = 0u32;
    for job in jobs {
        if job_id != NO_VAL && job.job_id != job_id {
            continue;
        }
        if show_flags & SHOW_ALL == 0 && job.user_id != uid && uid != 0 {
            continue;
        }
        for step in &job.steps {
            if step_id != NO_VAL && step.step_id != step_id {
                continue;
            }
            pack_step_info(job, step, config, table, now, &mut p);
            count += 1;
        }
    }
    p.patch_u32(count_mark, count);

    if count == 0 && (job_id != NO_VAL || step_id != NO_VAL) {
        return Err(StepError::InvalidJobId);
    }
    Ok(p.finish())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
