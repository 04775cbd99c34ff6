/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Step layout planning.
//!
//! Once the selector has fixed the node set, the layout planner turns
//! `{num_tasks, cpus_per_task, task_dist, plane_size}` plus the
//! run-length `(cpus_per_node, reps)` capacity view into the concrete
//! placement: how many tasks each node hosts and which global task ids
//! land where.

use tracing::debug;

use crate::bitmap::Bitmap;
use crate::hostlist;
use crate::node::NodeTable;
use crate::step::error::StepError;

/// Task distribution policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskDist {
    /// One task per node round-robin, wrapping while capacity remains.
    #[default]
    Cyclic,
    /// Fill each node to capacity before moving to the next.
    Block,
    /// Block-cyclic: `plane_size` tasks per node per round.
    Plane,
    /// The request names the node of every task explicitly.
    Arbitrary,
}

impl TaskDist {
    /// Wire encoding used by state dump/load.
    pub fn to_wire(self) -> u16 {
        match self {
            TaskDist::Cyclic => 1,
            TaskDist::Block => 2,
            TaskDist::Plane => 3,
            TaskDist::Arbitrary => 4,
        }
    }

    pub fn from_wire(v: u16) -> Option<Self> {
        match v {
            1 => Some(TaskDist::Cyclic),
            2 => Some(TaskDist::Block),
            3 => Some(TaskDist::Plane),
            4 => Some(TaskDist::Arbitrary),
            _ => None,
        }
    }
}

/// Materialised placement of a step's tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLayout {
    /// Compressed hostlist of the step's nodes, in step-local order.
    pub node_list: String,
    pub node_cnt: u32,
    pub task_cnt: u32,
    /// Task count per step-local node.
    pub tasks: Vec<u32>,
    /// Global task ids hosted by each step-local node.
    pub tids: Vec<Vec<u32>>,
}

impl StepLayout {
    /// Highest per-node task count (drives derived port reservations).
    pub fn max_tasks_per_node(&self) -> u32 {
        self.tasks.iter().copied().max().unwrap_or(0)
    }
}

/// Build a step layout.
///
/// `cpus_per_node`/`cpu_count_reps` is the run-length capacity view in
/// step-local node order; `node_list` is the matching compressed
/// hostlist.  For [`TaskDist::Arbitrary`] the `node_list` instead names
/// the host of *every task* (with repetitions) and capacity is not
/// consulted.
///
/// Step-local node order is always ascending global index, whatever
/// order an arbitrary request listed its hosts in — the resource
/// debits and completion ranges walk the step's node bitmap and must
/// agree with `tasks[i]`.
#[allow(clippy::too_many_arguments)]
pub fn layout_create(
    node_list: &str,
    cpus_per_node: &[u32],
    cpu_count_reps: &[u32],
    num_tasks: u32,
    cpus_per_task: u16,
    task_dist: TaskDist,
    plane_size: u16,
    table: &NodeTable,
) -> Result<StepLayout, StepError> {
    if task_dist == TaskDist::Arbitrary {
        return layout_arbitrary(node_list, num_tasks, table);
    }

    // expand the run-length capacity view
    let mut cpus: Vec<u32> = Vec::new();
    for (&val, &reps) in cpus_per_node.iter().zip(cpu_count_reps) {
        for _ in 0..reps {
            cpus.push(val);
        }
    }
    let node_cnt = cpus.len() as u32;
    if node_cnt == 0 || num_tasks == 0 {
        return Err(StepError::BadTaskCount {
            num_tasks,
            node_cnt,
        });
    }

    // per-node task capacity; a task-count-driven request (cpus_per_task
    // of zero) is not capacity-limited
    let capacity: Vec<u32> = if cpus_per_task > 0 {
        cpus.iter().map(|&c| c / cpus_per_task as u32).collect()
    } else {
        vec![num_tasks; cpus.len()]
    };
    if capacity.iter().map(|&c| c as u64).sum::<u64>() < num_tasks as u64 {
        return Err(StepError::BadTaskCount {
            num_tasks,
            node_cnt,
        });
    }

    let tasks = match task_dist {
        TaskDist::Block => dist_block(&capacity, num_tasks),
        TaskDist::Cyclic => dist_rounds(&capacity, num_tasks, 1),
        TaskDist::Plane => {
            if plane_size == 0 {
                return Err(StepError::BadDist);
            }
            dist_rounds(&capacity, num_tasks, plane_size as u32)
        }
        TaskDist::Arbitrary => unreachable!(),
    };

    let tids = assign_tids(&tasks, task_dist, plane_size);
    debug!(
        node_list,
        num_tasks,
        ?task_dist,
        tasks = ?tasks,
        "step layout built"
    );
    Ok(StepLayout {
        node_list: node_list.to_string(),
        node_cnt,
        task_cnt: num_tasks,
        tasks,
        tids,
    })
}

/// Fill each node to capacity in order.
fn dist_block(capacity: &[u32], num_tasks: u32) -> Vec<u32> {
    let mut tasks = vec![0u32; capacity.len()];
    let mut left = num_tasks;
    for (t, &cap) in tasks.iter_mut().zip(capacity) {
        let take = left.min(cap);
        *t = take;
        left -= take;
        if left == 0 {
            break;
        }
    }
    tasks
}

/// Round-robin `chunk` tasks per node per round while capacity remains.
/// `chunk == 1` is the plain cyclic distribution.
fn dist_rounds(capacity: &[u32], num_tasks: u32, chunk: u32) -> Vec<u32> {
    let mut tasks = vec![0u32; capacity.len()];
    let mut left = num_tasks;
    while left > 0 {
        let mut placed_this_round = 0;
        for (t, &cap) in tasks.iter_mut().zip(capacity) {
            if *t >= cap {
                continue;
            }
            let take = chunk.min(cap - *t).min(left);
            *t += take;
            left -= take;
            placed_this_round += take;
            if left == 0 {
                break;
            }
        }
        if placed_this_round == 0 {
            // capacity exhausted; caller pre-checked, defensive exit
            break;
        }
    }
    tasks
}

/// Hand out global task ids in distribution order.
fn assign_tids(tasks: &[u32], task_dist: TaskDist, plane_size: u16) -> Vec<Vec<u32>> {
    let mut tids: Vec<Vec<u32>> = tasks.iter().map(|&t| Vec::with_capacity(t as usize)).collect();
    let mut next = 0u32;
    match task_dist {
        TaskDist::Block => {
            for (i, &t) in tasks.iter().enumerate() {
                for _ in 0..t {
                    tids[i].push(next);
                    next += 1;
                }
            }
        }
        TaskDist::Cyclic | TaskDist::Plane | TaskDist::Arbitrary => {
            let chunk = if task_dist == TaskDist::Plane {
                plane_size as u32
            } else {
                1
            };
            let total: u32 = tasks.iter().sum();
            while next < total {
                for (i, &t) in tasks.iter().enumerate() {
                    let have = tids[i].len() as u32;
                    if have >= t {
                        continue;
                    }
                    let take = chunk.min(t - have).min(total - next);
                    for _ in 0..take {
                        tids[i].push(next);
                        next += 1;
                    }
                    if next == total {
                        break;
                    }
                }
            }
        }
    }
    tids
}

/// Arbitrary distribution: `node_list` names the host of every task.
fn layout_arbitrary(
    node_list: &str,
    num_tasks: u32,
    table: &NodeTable,
) -> Result<StepLayout, StepError> {
    let hosts = hostlist::expand(node_list).map_err(|_| StepError::BadDist)?;
    if hosts.len() != num_tasks as usize {
        return Err(StepError::BadDist);
    }

    // resolve every task's host to its global node index
    let mut task_nodes = Vec::with_capacity(hosts.len());
    let mut map = Bitmap::new(table.len());
    for host in &hosts {
        let inx = table.lookup(host).ok_or(StepError::BadDist)?;
        task_nodes.push(inx);
        map.set(inx);
    }

    // distinct nodes in ascending index order, matching the node
    // bitmap walks everywhere else
    let order: Vec<usize> = map.iter_set().collect();
    let mut tasks = vec![0u32; order.len()];
    let mut tids: Vec<Vec<u32>> = vec![Vec::new(); order.len()];
    for (tid, inx) in task_nodes.iter().enumerate() {
        let pos = order.binary_search(inx).expect("node collected above");
        tasks[pos] += 1;
        tids[pos].push(tid as u32);
    }

    Ok(StepLayout {
        node_list: hostlist::ranged_string(&map, table),
        node_cnt: order.len() as u32,
        task_cnt: num_tasks,
        tasks,
        tids,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
