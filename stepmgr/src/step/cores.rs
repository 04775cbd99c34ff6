/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Core painting.
//!
//! An exclusive step claims concrete `(socket, core)` cells out of the
//! job's core bitmap, one node at a time.  The first pass takes only
//! free cells; if demand is still unmet a second pass over-subscribes
//! cells the job owns regardless of who holds them.  Over-subscribed
//! cells stay step-private — they are never marked in the job's used
//! shadow, so sibling accounting is unaffected.
//!
//! The second pass starts at a process-wide round-robin cursor so
//! repeated over-subscription spreads across cores instead of piling
//! onto core 0.

use tracing::debug;

use crate::bitmap::Bitmap;
use crate::job::resources::JobResources;

/// Non-exclusive paint: the step shares every core the job owns on
/// this node.
pub(crate) fn use_job_cores(step_map: &mut Bitmap, res: &JobResources, node_inx: usize) {
    let Some(job_cores) = res.core_bitmap.as_ref() else {
        return;
    };
    let (lo, hi) = res.node_core_range(node_inx);
    for bit in lo..=hi {
        if job_cores.test(bit) {
            step_map.set(bit);
        }
    }
}

/// Exclusive paint for one node.
///
/// `last_core_inx` is the process-wide over-subscription cursor owned
/// by the lifecycle controller.
pub(crate) fn pick_step_cores(
    step_map: &mut Bitmap,
    res: &mut JobResources,
    node_inx: usize,
    task_cnt: u32,
    cpus_per_task: u16,
    last_core_inx: &mut usize,
) {
    if res.core_bitmap.is_none() {
        return;
    }
    let sockets = res.sockets_per_node[node_inx] as usize;
    let cores = res.cores_per_socket[node_inx] as usize;
    let node_cores = sockets * cores;
    let base = res.node_core_offset(node_inx);
    let offset = |sock: usize, core: usize| base + sock * cores + core;
    let mut cpu_cnt = task_cnt as usize * cpus_per_task.max(1) as usize;

    // disjoint field borrows: the owned map is read, the shadow written
    let (Some(job_cores), Some(used)) =
        (res.core_bitmap.as_ref(), res.core_bitmap_used.as_mut())
    else {
        return;
    };

    // whole-node demand: take every core the job owns here
    if cpu_cnt >= node_cores {
        for bit in base..base + node_cores {
            if job_cores.test(bit) {
                step_map.set(bit);
                used.set(bit);
            }
        }
        return;
    }

    // first pass: free cells only, outer-core / inner-socket order
    for core in 0..cores {
        for sock in 0..sockets {
            let bit = offset(sock, core);
            if job_cores.test(bit) && !used.test(bit) {
                used.set(bit);
                step_map.set(bit);
                cpu_cnt -= 1;
                if cpu_cnt == 0 {
                    return;
                }
            }
        }
    }

    // second pass: over-subscribe, starting past the cursor; cells this
    // step already holds are skipped and the used shadow is untouched
    debug!(node_inx, remaining = cpu_cnt, "over-subscribing cores");
    let start = (*last_core_inx + 1) % cores;
    for i in 0..cores {
        let core = (start + i) % cores;
        for sock in 0..sockets {
            let bit = offset(sock, core);
            if job_cores.test(bit) && !step_map.test(bit) {
                step_map.set(bit);
                *last_core_inx = core;
                cpu_cnt -= 1;
                if cpu_cnt == 0 {
                    return;
                }
            }
        }
    }
}

/// Return a completed step's cores to the job.
///
/// Only exclusive steps marked the used shadow, so only they clear it;
/// the step's own bitmap is consumed either way.
pub(crate) fn release_step_cores(
    core_bitmap_job: &mut Option<Bitmap>,
    exclusive: bool,
    res: &mut JobResources,
) {
    if let Some(map) = core_bitmap_job.take() {
        if exclusive {
            if let Some(used) = res.core_bitmap_used.as_mut() {
                used.and_not(&map);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
