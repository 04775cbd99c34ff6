/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Node selection for step creation.
//!
//! [`pick_step_nodes`] chooses a subset of the parent job's nodes that
//! satisfies a step request across all five axes at once: node count,
//! per-node CPUs, per-node memory, GRES, and the exclusivity policy.
//!
//! Two regimes:
//! * **exclusive** — the step reserves CPUs, so selection counts what
//!   sibling steps already hold and distinguishes "busy right now"
//!   ([`StepError::NodesBusy`]) from "never possible"
//!   ([`StepError::RequestedNodeConfigUnavailable`]).
//! * **non-exclusive** — CPUs are shared; memory and GRES still gate
//!   per-node usability, idle nodes are preferred, and a `relative`
//!   offset or explicit node list overrides the preference.

use tracing::{debug, info};

use crate::bitmap::Bitmap;
use crate::hostlist;
use crate::job::{Job, JobTransFlags};
use crate::node::NodeTable;
use crate::plugins::gres::{GresError, GresList, GresPlugin};
use crate::step::error::StepError;
use crate::step::StepCreateRequest;
use crate::{INFINITE, NO_VAL, NO_VAL64};

/// Per-node usability computed by the memory/GRES filter: the CPU
/// count a node can actually give this step, in both the "right now"
/// and the "ignoring running steps" views.
struct UsableCpus {
    avail: Vec<u32>,
    total: Vec<u32>,
}

/// Select nodes for a step.  Returns a bitmap over the global node
/// table, always a subset of the job's allocation.
///
/// `now` stamps the job `end_time` extension when the first step finds
/// its nodes still booting.
pub fn pick_step_nodes(
    job: &mut Job,
    req: &StepCreateRequest,
    cpus_per_task: u32,
    table: &NodeTable,
    gres_plugin: &dyn GresPlugin,
    step_gres: &GresList,
    now: i64,
) -> Result<Bitmap, StepError> {
    let up = table.up_nodes();
    let mut nodes_avail = job.node_bitmap.clone();
    nodes_avail.and(&up);

    // first-step pre-flight: every allocated node must have booted
    if job.steps.is_empty() {
        let mut unbooted = table.not_booted();
        unbooted.and(&job.node_bitmap);
        if unbooted.any() {
            if job.time_limit != INFINITE {
                // keep the allocation alive while the nodes boot
                job.end_time = now + job.time_limit as i64 * 60;
            }
            info!(
                job_id = job.job_id,
                waiting = %unbooted,
                "first step blocked on node boot"
            );
            return Err(StepError::NodesBusy);
        }
        job.trans_flags.remove(JobTransFlags::CONFIGURING);
    }

    if req.exclusive {
        pick_exclusive(
            job, req, cpus_per_task, &nodes_avail, table, gres_plugin, step_gres,
        )
    } else {
        pick_shared(job, req, table, &up, nodes_avail, gres_plugin, step_gres)
    }
}

// ── Branch A: exclusive steps ─────────────────────────────────────────────────

fn pick_exclusive(
    job: &Job,
    req: &StepCreateRequest,
    cpus_per_task: u32,
    nodes_avail: &Bitmap,
    table: &NodeTable,
    gres_plugin: &dyn GresPlugin,
    step_gres: &GresList,
) -> Result<Bitmap, StepError> {
    let res = &job.resources;
    let min_nodes = if req.min_nodes == INFINITE || req.min_nodes == 0 {
        1
    } else {
        req.min_nodes
    };
    // an unspecified task count only constrains the node count
    let target_tasks: u64 = if req.num_tasks == NO_VAL {
        0
    } else {
        req.num_tasks as u64
    };

    let required = match &req.node_list {
        Some(nl) if !nl.is_empty() => Some(parse_required(job, nl, nodes_avail, table)?),
        _ => None,
    };

    let mut picked = Bitmap::new(nodes_avail.len());
    let mut tasks_picked = 0u64;
    let mut total_tasks = 0u64;
    let mut nodes_picked = 0u32;

    for (j, g) in job.nodes() {
        if !nodes_avail.test(g) {
            continue;
        }

        let mut avail_cpus = res.cpus[j].saturating_sub(res.cpus_used[j]) as u64;
        let mut total_cpus = res.cpus[j] as u64;

        if req.mem_per_cpu > 0 && res.has_memory() {
            let free = res.memory_allocated[j].saturating_sub(res.memory_used[j]);
            avail_cpus = avail_cpus.min(free / req.mem_per_cpu);
            total_cpus = total_cpus.min(res.memory_allocated[j] / req.mem_per_cpu);
        }

        if !step_gres.is_empty() {
            let total_gres = gres_plugin.step_test(step_gres, &job.gres_list, j, true);
            let avail_gres = gres_plugin.step_test(step_gres, &job.gres_list, j, false);
            if total_gres != NO_VAL64 {
                total_cpus = total_cpus.min(total_gres);
            }
            if avail_gres != NO_VAL64 {
                avail_cpus = avail_cpus.min(avail_gres);
            }
        }

        let (avail_tasks, node_total_tasks) = if cpus_per_task > 0 {
            (
                avail_cpus / cpus_per_task as u64,
                total_cpus / cpus_per_task as u64,
            )
        } else {
            (avail_cpus, total_cpus)
        };
        total_tasks += node_total_tasks;

        let is_required = required.as_ref().is_some_and(|r| r.test(g));
        if avail_tasks == 0 && !is_required {
            continue;
        }
        if !is_required
            && target_tasks > 0
            && tasks_picked >= target_tasks
            && nodes_picked >= min_nodes
        {
            continue;
        }
        if !is_required && target_tasks == 0 && nodes_picked >= min_nodes {
            continue;
        }

        picked.set(g);
        nodes_picked += 1;
        tasks_picked += avail_tasks;
    }

    debug!(
        job_id = job.job_id,
        tasks_picked,
        total_tasks,
        picked = %picked,
        "exclusive selection"
    );

    if tasks_picked >= target_tasks && nodes_picked >= min_nodes {
        Ok(picked)
    } else if total_tasks >= target_tasks.max(1) {
        Err(StepError::NodesBusy)
    } else {
        Err(StepError::RequestedNodeConfigUnavailable)
    }
}

// ── Branch B: shared (non-exclusive) steps ────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn pick_shared(
    job: &Job,
    req: &StepCreateRequest,
    table: &NodeTable,
    up: &Bitmap,
    mut nodes_avail: Bitmap,
    gres_plugin: &dyn GresPlugin,
    step_gres: &GresList,
) -> Result<Bitmap, StepError> {
    let res = &job.resources;

    // per-node usability when memory or GRES constrain
    let constrain_mem = req.mem_per_cpu > 0 && res.has_memory();
    let constrain_gres = !step_gres.is_empty();
    let mut usable: Option<UsableCpus> = None;
    if constrain_mem || constrain_gres {
        let mut avail = vec![0u32; res.nhosts()];
        let mut total = vec![0u32; res.nhosts()];
        for (j, g) in job.nodes() {
            let mut u = res.cpus[j] as u64;
            let mut t = res.cpus[j] as u64;
            let mut mem_zeroed = false;
            if constrain_mem {
                let free = res.memory_allocated[j].saturating_sub(res.memory_used[j]);
                let by_mem = free / req.mem_per_cpu;
                if by_mem < u {
                    u = by_mem;
                    mem_zeroed = u == 0;
                }
                t = t.min(res.memory_allocated[j] / req.mem_per_cpu);
            }
            if constrain_gres && u > 0 {
                let g_avail = gres_plugin.step_test(step_gres, &job.gres_list, j, false);
                if g_avail != NO_VAL64 && g_avail < u {
                    u = g_avail;
                    mem_zeroed = false;
                }
                let g_total = gres_plugin.step_test(step_gres, &job.gres_list, j, true);
                if g_total != NO_VAL64 {
                    t = t.min(g_total);
                }
            }
            avail[j] = u.min(u32::MAX as u64) as u32;
            total[j] = t.min(u32::MAX as u64) as u32;

            if avail[j] == 0 && nodes_avail.test(g) {
                // every node must satisfy an all-nodes request
                if req.min_nodes == INFINITE {
                    return Err(if mem_zeroed {
                        StepError::InvalidTaskMemory
                    } else {
                        StepError::InvalidGres(GresError::Insufficient(j))
                    });
                }
                nodes_avail.clear(g);
            }
        }
        usable = Some(UsableCpus { avail, total });
    }

    // an explicit node list pins those nodes into the pick
    let required = match &req.node_list {
        Some(nl) if !nl.is_empty() => Some(parse_required(job, nl, &nodes_avail, table)?),
        _ => None,
    };

    // nodes no sibling step currently occupies
    let mut idle = nodes_avail.clone();
    for step in &job.steps {
        if let Some(snb) = &step.step_node_bitmap {
            idle.and_not(snb);
        }
    }

    // a relative offset replaces the idle preference entirely
    let relative = if req.relative == NO_VAL {
        None
    } else {
        Some(req.relative as usize)
    };
    if let Some(rel) = relative {
        for g in job.node_bitmap.iter_set().take(rel) {
            if nodes_avail.test(g) {
                nodes_avail.clear(g);
            }
        }
        idle.and(&nodes_avail);
    }

    // "use every available node"
    if req.min_nodes == INFINITE {
        return Ok(nodes_avail);
    }

    let mut min_nodes = req.min_nodes.max(1);
    let max_nodes = req.max_nodes;

    // homogeneous allocations let a cpu_count raise the node floor
    if req.cpu_count > 0 && res.cpu_array_cnt() == 1 {
        let per_node = res.cpu_array_value[0].max(1);
        let derived = req.cpu_count.div_ceil(per_node);
        if derived > min_nodes {
            min_nodes = derived;
        }
        if max_nodes > 0 && max_nodes < derived {
            return Err(StepError::TooManyRequestedCpus {
                cpu_count: req.cpu_count,
                max_nodes,
            });
        }
    }

    let contrib = |j: usize| -> u64 {
        match &usable {
            Some(u) => u.avail[j] as u64,
            None => res.cpus[j] as u64,
        }
    };

    let mut picked = required.clone().unwrap_or_else(|| Bitmap::new(nodes_avail.len()));
    let mut picked_cpus: u64 = picked
        .iter_set()
        .filter_map(|g| job.node_local_index(g))
        .map(contrib)
        .sum();

    let satisfied = |picked: &Bitmap, cpus: u64| {
        picked.count() as u32 >= min_nodes && cpus >= req.cpu_count as u64
    };

    // greedy pick: idle first unless a relative offset was given, then
    // the remaining usable nodes; first-set order breaks ties
    let passes: Vec<Bitmap> = if relative.is_some() {
        vec![nodes_avail.clone()]
    } else {
        let mut busy = nodes_avail.clone();
        busy.and_not(&idle);
        vec![idle.clone(), busy]
    };
    'outer: for pass in &passes {
        for g in pass.iter_set() {
            if satisfied(&picked, picked_cpus) {
                break 'outer;
            }
            if picked.test(g) {
                continue;
            }
            if max_nodes > 0 && picked.count() as u32 >= max_nodes {
                break 'outer;
            }
            let Some(j) = job.node_local_index(g) else {
                continue;
            };
            let c = contrib(j);
            if c == 0 {
                continue;
            }
            picked.set(g);
            picked_cpus += c;
        }
    }

    if satisfied(&picked, picked_cpus) {
        debug!(
            job_id = job.job_id,
            picked = %picked,
            picked_cpus,
            "shared selection"
        );
        return Ok(picked);
    }

    // failure triage: blocked capacity → busy; down nodes → not
    // available; otherwise the allocation can never satisfy this
    let blocked_cpus: u64 = match &usable {
        Some(u) => job
            .nodes()
            .map(|(j, _)| u.total[j].saturating_sub(u.avail[j]) as u64)
            .sum(),
        None => 0,
    };
    let mut down = job.node_bitmap.clone();
    down.and_not(up);

    if req.cpu_count as u64 <= picked_cpus + blocked_cpus && blocked_cpus > 0 {
        Err(StepError::NodesBusy)
    } else if down.any() {
        Err(StepError::NodeNotAvail)
    } else {
        Err(StepError::RequestedNodeConfigUnavailable)
    }
}

/// Parse and verify an explicit node list: it must name only nodes of
/// the job's allocation that are currently usable.
///
/// The list may carry repetitions (arbitrary distribution); the
/// required *set* ignores them.
fn parse_required(
    job: &Job,
    node_list: &str,
    nodes_avail: &Bitmap,
    table: &NodeTable,
) -> Result<Bitmap, StepError> {
    let map = hostlist::parse(node_list, table)
        .map_err(|_| StepError::RequestedNodeConfigUnavailable)?;
    if !map.is_subset(&job.node_bitmap) {
        return Err(StepError::RequestedNodeConfigUnavailable);
    }
    if !map.is_subset(nodes_avail) {
        // allocated but down, booting, or filtered out right now
        return Err(StepError::NodeNotAvail);
    }
    Ok(map)
}

/// Sum the CPUs a node set offers.
///
/// `usable_cpu_cnt` overrides the job's per-node CPU counts when the
/// selector computed a filtered view; nodes outside the job fall back
/// to the node table per the fast-schedule setting.
pub fn count_cpus(
    job: &Job,
    picked: &Bitmap,
    usable_cpu_cnt: Option<&[u32]>,
    table: &NodeTable,
    fast_schedule: bool,
) -> u64 {
    let mut sum = 0u64;
    for g in picked.iter_set() {
        match job.node_local_index(g) {
            Some(j) => {
                sum += match usable_cpu_cnt {
                    Some(u) => u[j] as u64,
                    None if !job.resources.cpus.is_empty() => job.resources.cpus[j] as u64,
                    None => table.cpus(g, fast_schedule) as u64,
                };
            }
            None => sum += table.cpus(g, fast_schedule) as u64,
        }
    }
    sum
}

// ── Tests ─────────────────────────────────────────────────────────────────────
