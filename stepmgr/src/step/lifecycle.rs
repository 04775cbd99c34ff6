/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Step lifecycle controller.
//!
//! [`StepManager`] is the public face of this crate: creation, signal
//! fan-out, partial and full completion, suspend/resume bookkeeping,
//! time-limit and checkpoint ticks, and the resource debits that keep
//! the parent job's accounting invariants true.
//!
//! All operations assume the caller holds the controller's global
//! job/step write-lock; none of them blocks.  Outbound per-node
//! traffic goes through the agent queue and is never awaited.
//!
//! Creation validates everything it can before the step record exists;
//! the only fallible work after registration is plugin allocation, and
//! every failure path there unwinds through
//! [`StepManager::delete_step_record`] so a failed create leaves no
//! trace.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::bitmap::Bitmap;
use crate::config::StepmgrConfig;
use crate::hostlist;
use crate::job::{resources::run_length, Job, JobState, JobTransFlags};
use crate::node::NodeTable;
use crate::plugins::acct::Jobacct;
use crate::plugins::agent::{AgentMessage, AgentRequest};
use crate::plugins::checkpoint::CkptOp;
use crate::plugins::Plugins;
use crate::step::cores::{pick_step_cores, release_step_cores, use_job_cores};
use crate::step::error::StepError;
use crate::step::layout::{layout_create, StepLayout, TaskDist};
use crate::step::select::pick_step_nodes;
use crate::step::{StepCreateRequest, StepFilter, StepRecord, StepState};
use crate::{INFINITE, MAX_STEP_ID, NO_VAL, NO_VAL64};

/// Signal number used for kills.
pub const SIGKILL: u32 = 9;

/// Longest accepted value for most request strings.
const MAX_STR_LEN: usize = 1024;
/// Longest accepted node list.
const MAX_NODE_LIST_LEN: usize = 65536;

/// Credentials for [`StepManager::update_step`].
#[derive(Debug, Clone, Default)]
pub struct UpdateAuth {
    pub uid: u32,
    /// Operator / administrator privilege.
    pub operator: bool,
    /// Accounts the uid coordinates.
    pub coord_accounts: Vec<String>,
}

/// The step lifecycle controller.
pub struct StepManager {
    config: Arc<StepmgrConfig>,
    nodes: Arc<NodeTable>,
    plugins: Plugins,
    /// Process-wide round-robin cursor for core over-subscription.
    last_core_inx: usize,
    /// Reserved-port pool over `config.resv_port_range`.
    ports_in_use: Bitmap,
}

impl StepManager {
    pub fn new(config: Arc<StepmgrConfig>, nodes: Arc<NodeTable>, plugins: Plugins) -> Self {
        let (lo, hi) = config.resv_port_range;
        let width = (hi as usize).saturating_sub(lo as usize) + 1;
        Self {
            config,
            nodes,
            plugins,
            last_core_inx: 0,
            ports_in_use: Bitmap::new(width),
        }
    }

    pub fn plugins(&self) -> &Plugins {
        &self.plugins
    }

    // ── Creation ──────────────────────────────────────────────────────────────

    /// Create a step (or the job's batch step) and return its id.
    pub fn create_step(
        &mut self,
        job: &mut Job,
        request: &StepCreateRequest,
        batch: bool,
        now: i64,
    ) -> Result<u32, StepError> {
        let mut req = request.clone();

        // parent state gates
        match job.state {
            JobState::Finished => return Err(StepError::AlreadyDone(job.job_id)),
            JobState::Pending if batch => return Err(StepError::DuplicateJobId(job.job_id)),
            JobState::Pending => return Err(StepError::JobPending(job.job_id)),
            JobState::Suspended => return Err(StepError::Disabled(job.job_id)),
            JobState::Running => {}
        }
        if job.steps.is_empty() && job.trans_flags.contains(JobTransFlags::PROLOG_RUNNING) {
            return Err(StepError::PrologRunning(job.job_id));
        }
        if req.user_id != job.user_id
            && req.user_id != 0
            && req.user_id != self.config.controller_uid
        {
            return Err(StepError::AccessDenied {
                uid: req.user_id,
                job_id: job.job_id,
            });
        }

        // bounded strings
        check_len("ckpt_dir", &req.ckpt_dir, MAX_STR_LEN)?;
        check_len("gres", &req.gres, MAX_STR_LEN)?;
        check_len("host", &req.host, MAX_STR_LEN)?;
        check_len("name", &req.name, MAX_STR_LEN)?;
        check_len("network", &req.network, MAX_STR_LEN)?;
        if let Some(nl) = &req.node_list {
            check_len("node_list", nl, MAX_NODE_LIST_LEN)?;
        }

        if req.min_nodes != INFINITE && req.max_nodes > 0 && req.max_nodes < req.min_nodes {
            return Err(StepError::InvalidNodeCount {
                min: req.min_nodes,
                max: req.max_nodes,
            });
        }

        if self.config.enforce_partition_limits
            && job.partition_max_time != INFINITE
            && req.time_limit != 0
            && req.time_limit != INFINITE
            && req.time_limit > job.partition_max_time
        {
            return Err(StepError::InvalidTimeLimit {
                requested: req.time_limit,
                max: job.partition_max_time,
            });
        }

        // distribution legality
        if req.task_dist == TaskDist::Arbitrary {
            if self.config.switch_type == "switch/elan" {
                // elan cannot express arbitrary placement
                debug!(job_id = job.job_id, "downgrading arbitrary distribution to block");
                req.task_dist = TaskDist::Block;
            } else if req.node_list.is_none() {
                return Err(StepError::BadDist);
            }
        }

        // overcommit policy
        if req.overcommit {
            if req.exclusive {
                // exclusive wins: one reserved CPU per task
                req.cpu_count = if req.num_tasks == NO_VAL {
                    0
                } else {
                    req.num_tasks
                };
                req.overcommit = false;
            } else {
                // relaxed CPU accounting: suppress all CPU checks
                req.cpu_count = 0;
            }
        }

        let cpus_per_task: u16 = if req.cpu_count > 0
            && req.num_tasks != NO_VAL
            && req.num_tasks > 0
            && req.cpu_count % req.num_tasks == 0
        {
            (req.cpu_count / req.num_tasks) as u16
        } else {
            0
        };

        let step_gres = self
            .plugins
            .gres
            .state_validate(&req.gres, &job.gres_list)?;

        if !batch && job.next_step_id >= MAX_STEP_ID {
            return Err(StepError::TooManySteps(job.job_id));
        }

        let mut picked = pick_step_nodes(
            job,
            &req,
            cpus_per_task as u32,
            &self.nodes,
            self.plugins.gres.as_ref(),
            &step_gres,
            now,
        )?;
        if batch {
            // the batch script runs on the allocation's first node only
            picked.pick_cnt(1);
        }
        let node_cnt = picked.count() as u32;

        let num_tasks = if batch {
            1
        } else if req.num_tasks == NO_VAL {
            if req.cpu_count > 0 {
                req.cpu_count
            } else {
                node_cnt
            }
        } else {
            req.num_tasks
        };
        if num_tasks == 0 || num_tasks > node_cnt * self.config.max_tasks_per_node {
            return Err(StepError::BadTaskCount {
                num_tasks,
                node_cnt,
            });
        }

        // a task count derived above may make the CPU shape exact now
        let cpus_per_task = if cpus_per_task == 0
            && req.cpu_count > 0
            && req.cpu_count % num_tasks == 0
        {
            (req.cpu_count / num_tasks) as u16
        } else {
            cpus_per_task
        };

        // materialise the layout before anything needs unwinding
        let layout = if batch {
            None
        } else {
            Some(self.build_layout(job, &req, &picked, &step_gres, num_tasks, cpus_per_task)?)
        };

        // reserved ports: explicit count, or peak tasks-per-node + 1
        let (resv_port_array, resv_ports) = if batch || req.resv_port_cnt == NO_VAL {
            (Vec::new(), String::new())
        } else {
            let cnt = if req.resv_port_cnt == 0 {
                layout.as_ref().map_or(0, StepLayout::max_tasks_per_node) + 1
            } else {
                req.resv_port_cnt
            };
            match self.alloc_ports(cnt) {
                Some(pair) => pair,
                None => {
                    warn!(job_id = job.job_id, cnt, "reserved-port pool exhausted");
                    return Err(StepError::NodesBusy);
                }
            }
        };

        // interconnect state
        let switch_job = match &layout {
            None => None,
            Some(l) => {
                let mut sw = self.plugins.switch.alloc_jobinfo();
                if let Err(e) = sw.build(l, &req.network) {
                    self.release_ports(&resv_port_array);
                    return Err(StepError::InterconnectFailure(e));
                }
                Some(sw)
            }
        };

        let check_job = Some(self.plugins.checkpoint.alloc_jobinfo());

        // registration — nothing below here fails
        let job_name = job.name.clone();
        let job_network = job.network.clone();
        let step_id = {
            let step = job
                .create_step_record(batch)
                .expect("step id availability checked above");
            step.step_node_bitmap = Some(picked.clone());
            step.cpus_per_task = cpus_per_task;
            step.cpu_count = req.cpu_count;
            step.mem_per_cpu = req.mem_per_cpu;
            step.num_tasks = num_tasks;
            step.task_dist = req.task_dist;
            step.plane_size = req.plane_size;
            step.layout = layout;
            step.exclusive = req.exclusive;
            step.no_kill = req.no_kill;
            step.time_limit = if req.time_limit == 0 {
                INFINITE
            } else {
                req.time_limit
            };
            step.start_time = now;
            step.ckpt_time = now;
            step.ckpt_interval = req.ckpt_interval;
            step.ckpt_dir = req.ckpt_dir.clone();
            step.switch_job = switch_job;
            step.check_job = check_job;
            step.gres = req.gres.clone();
            step.gres_list = step_gres;
            step.resv_port_cnt = req.resv_port_cnt;
            step.resv_ports = resv_ports;
            step.resv_port_array = resv_port_array;
            step.host = req.host.clone();
            step.port = req.port;
            step.name = if req.name.is_empty() {
                job_name
            } else {
                req.name.clone()
            };
            step.network = if req.network.is_empty() {
                job_network
            } else {
                req.network.clone()
            };
            step.batch_step = batch;
            step.step_id
        };

        if !batch {
            self.step_alloc_lps(job, step_id);
        }

        let step = job.find_step(step_id).expect("just registered");
        self.plugins.acct.step_start(job, step);
        self.plugins
            .gres
            .state_log(&step.gres_list, job.job_id, step_id);
        info!(
            job_id = job.job_id,
            step_id,
            nodes = %picked,
            num_tasks,
            exclusive = req.exclusive,
            batch,
            "step created"
        );
        job.touch(now);
        Ok(step_id)
    }

    /// Per-node usable CPUs for the chosen set, collapsed run-length,
    /// fed to the layout planner.
    fn build_layout(
        &self,
        job: &Job,
        req: &StepCreateRequest,
        picked: &Bitmap,
        step_gres: &crate::plugins::gres::GresList,
        num_tasks: u32,
        cpus_per_task: u16,
    ) -> Result<StepLayout, StepError> {
        let res = &job.resources;
        let mut usable: Vec<u32> = Vec::with_capacity(picked.count());
        for g in picked.iter_set() {
            let j = job
                .node_local_index(g)
                .ok_or(StepError::RequestedNodeConfigUnavailable)?;
            let mut u = if req.exclusive {
                res.cpus[j].saturating_sub(res.cpus_used[j]) as u64
            } else {
                res.cpus[j] as u64
            };
            if req.mem_per_cpu > 0 && res.has_memory() {
                let free = res.memory_allocated[j].saturating_sub(res.memory_used[j]);
                u = u.min(free / req.mem_per_cpu);
            }
            if !step_gres.is_empty() {
                let g_cpus = self
                    .plugins
                    .gres
                    .step_test(step_gres, &job.gres_list, j, false);
                if g_cpus != NO_VAL64 {
                    u = u.min(g_cpus);
                }
            }
            usable.push(u.min(u32::MAX as u64) as u32);
        }
        let (vals, reps) = run_length(&usable);

        let node_list = if req.task_dist == TaskDist::Arbitrary {
            req.node_list.clone().unwrap_or_default()
        } else {
            hostlist::ranged_string(picked, &self.nodes)
        };

        layout_create(
            &node_list,
            &vals,
            &reps,
            num_tasks,
            cpus_per_task,
            req.task_dist,
            req.plane_size,
            &self.nodes,
        )
    }

    // ── Resource debits ───────────────────────────────────────────────────────

    /// Debit the job-resource view for every node of a freshly created
    /// step: CPUs, memory, GRES, and painted cores.
    fn step_alloc_lps(&mut self, job: &mut Job, step_id: u32) {
        let job = &mut *job;
        let Some(pos) = job.steps.iter().position(|s| s.step_id == step_id) else {
            return;
        };
        let (snb, tasks, cpus_per_task, mem_per_cpu, exclusive) = {
            let step = &job.steps[pos];
            let (Some(snb), Some(layout)) = (&step.step_node_bitmap, &step.layout) else {
                return;
            };
            (
                snb.clone(),
                layout.tasks.clone(),
                step.cpus_per_task,
                step.mem_per_cpu,
                step.exclusive,
            )
        };

        let mut core_map = job
            .resources
            .core_bitmap
            .as_ref()
            .map(|cb| Bitmap::new(cb.len()));

        for (i, g) in snb.iter_set().enumerate() {
            let Some(j) = local_index(&job.node_bitmap, g) else {
                continue;
            };
            let res = &mut job.resources;
            let cpus_alloc = tasks[i] * cpus_per_task as u32;
            res.cpus_used[j] = res.cpus_used[j].saturating_add(cpus_alloc);
            if mem_per_cpu > 0 && res.has_memory() {
                res.memory_used[j] =
                    res.memory_used[j].saturating_add(cpus_alloc as u64 * mem_per_cpu);
            }
            if let Err(e) = self.plugins.gres.step_alloc(
                &mut job.steps[pos].gres_list,
                &mut job.gres_list,
                j,
                cpus_alloc,
            ) {
                error!(step_id, node_inx = j, %e, "GRES allocation failed");
            }
            if let Some(map) = core_map.as_mut() {
                let res = &mut job.resources;
                if exclusive {
                    pick_step_cores(map, res, j, tasks[i], cpus_per_task, &mut self.last_core_inx);
                } else {
                    use_job_cores(map, res, j);
                }
            }
            debug!(
                step_id,
                node_inx = j,
                cpus_alloc,
                cpus_used = job.resources.cpus_used[j],
                "step resources allocated"
            );
        }
        job.steps[pos].core_bitmap_job = core_map;
    }

    /// Return a completing step's debits.  Saturating in both
    /// directions: an underflow clamps to zero and logs.
    fn step_dealloc_lps(&mut self, job: &mut Job, step: &mut StepRecord) {
        if let (Some(layout), Some(snb)) = (step.layout.as_ref(), step.step_node_bitmap.as_ref())
        {
            for (i, g) in snb.iter_set().enumerate() {
                let Some(j) = local_index(&job.node_bitmap, g) else {
                    continue;
                };
                let res = &mut job.resources;
                let cpus_alloc = layout.tasks[i] * step.cpus_per_task as u32;
                if res.cpus_used[j] < cpus_alloc {
                    error!(
                        step_id = step.step_id,
                        node_inx = j,
                        cpus_used = res.cpus_used[j],
                        cpus_alloc,
                        "CPU underflow on step deallocation, clamping to zero"
                    );
                }
                res.cpus_used[j] = res.cpus_used[j].saturating_sub(cpus_alloc);
                if step.mem_per_cpu > 0 && res.has_memory() {
                    let mem = cpus_alloc as u64 * step.mem_per_cpu;
                    if res.memory_used[j] < mem {
                        error!(
                            step_id = step.step_id,
                            node_inx = j,
                            "memory underflow on step deallocation, clamping to zero"
                        );
                    }
                    res.memory_used[j] = res.memory_used[j].saturating_sub(mem);
                }
            }
        }
        if let Err(e) = self
            .plugins
            .gres
            .step_dealloc(&mut step.gres_list, &mut job.gres_list)
        {
            error!(step_id = step.step_id, %e, "GRES deallocation failed");
        }
        release_step_cores(&mut step.core_bitmap_job, step.exclusive, &mut job.resources);
    }

    // ── Deletion ──────────────────────────────────────────────────────────────

    /// Unregister a step and release what it still holds: interconnect
    /// state, checkpoint state, painted cores, reserved ports.  Resource
    /// debits must have been returned beforehand where they were taken.
    pub fn delete_step_record(&mut self, job: &mut Job, step_id: u32) -> Result<(), StepError> {
        let mut step = job
            .remove_step_record(step_id)
            .ok_or(StepError::InvalidJobId)?;
        self.release_step_state(job, &mut step);
        Ok(())
    }

    /// Delete all of a job's steps, optionally only the ones that never
    /// acquired interconnect state.
    pub fn delete_all_steps(&mut self, job: &mut Job, filter: StepFilter) {
        let ids: Vec<u32> = job
            .steps
            .iter()
            .filter(|s| match filter {
                StepFilter::All => true,
                StepFilter::NoSwitchOnly => s.switch_job.is_none(),
            })
            .map(|s| s.step_id)
            .collect();
        for id in ids {
            if let Some(mut step) = job.remove_step_record(id) {
                self.step_dealloc_lps(job, &mut step);
                self.release_step_state(job, &mut step);
            }
        }
    }

    fn release_step_state(&mut self, job: &mut Job, step: &mut StepRecord) {
        if let Some(sw) = step.switch_job.as_mut() {
            let nodes = step
                .layout
                .as_ref()
                .map(|l| l.node_list.clone())
                .unwrap_or_default();
            sw.step_complete(&nodes);
        }
        step.switch_job = None;
        step.check_job = None;
        release_step_cores(&mut step.core_bitmap_job, step.exclusive, &mut job.resources);
        let ports = std::mem::take(&mut step.resv_port_array);
        self.release_ports(&ports);
    }

    // ── Signals ───────────────────────────────────────────────────────────────

    /// Deliver a signal to a step's tasks on every step node.
    pub fn signal_step(
        &self,
        job: &mut Job,
        step_id: u32,
        signal: u32,
        uid: u32,
        now: i64,
    ) -> Result<(), StepError> {
        if job.state != JobState::Running {
            return Err(StepError::TransitionStateNoUpdate(job.job_id));
        }
        self.authorize(job, uid)?;
        let job_id = job.job_id;
        let front_end = self.config.front_end;
        let batch_host = job.batch_host.clone();
        let step = job.find_step_mut(step_id).ok_or(StepError::InvalidJobId)?;

        if signal == SIGKILL {
            step.requid = uid;
            if !step.host.is_empty() {
                self.plugins.agent.queue(AgentRequest::new(
                    step.host.clone(),
                    1,
                    AgentMessage::SrunStepSignal {
                        host: step.host.clone(),
                        port: step.port,
                        job_id,
                        step_id: step.step_id,
                        signal,
                    },
                ));
            }
        }

        let Some(snb) = step.step_node_bitmap.as_ref() else {
            return Ok(());
        };
        let node_count = snb.count() as u32;
        if node_count == 0 {
            return Ok(());
        }
        let hostlist = if front_end {
            batch_host
        } else {
            hostlist::ranged_string(snb, &self.nodes)
        };
        self.plugins.agent.queue(AgentRequest::new(
            hostlist,
            node_count,
            AgentMessage::SignalTasks {
                job_id,
                step_id: step.step_id,
                signal,
            },
        ));
        info!(job_id, step_id = step.step_id, signal, "step signalled");
        job.touch(now);
        Ok(())
    }

    /// Kill every step using `node_inx` (unless it opted to survive
    /// node failure).  Returns the number of steps signalled.
    pub fn kill_step_on_node(&self, job: &mut Job, node_inx: usize, now: i64) -> usize {
        let job_id = job.job_id;
        let node_name = self.nodes.name(node_inx).to_string();
        let mut found = 0;
        for step in &mut job.steps {
            let Some(snb) = step.step_node_bitmap.as_ref() else {
                continue;
            };
            if !snb.test(node_inx) || step.no_kill {
                continue;
            }
            info!(
                job_id,
                step_id = step.step_id,
                node = %node_name,
                "killing step on failed node"
            );
            self.plugins.agent.queue(AgentRequest::new(
                node_name.clone(),
                1,
                AgentMessage::SignalTasks {
                    job_id,
                    step_id: step.step_id,
                    signal: SIGKILL,
                },
            ));
            self.plugins.agent.queue(AgentRequest::new(
                node_name.clone(),
                1,
                AgentMessage::TerminateTasks {
                    job_id,
                    step_id: step.step_id,
                },
            ));
            if !step.host.is_empty() {
                self.plugins.agent.queue(AgentRequest::new(
                    step.host.clone(),
                    1,
                    AgentMessage::SrunStepSignal {
                        host: step.host.clone(),
                        port: step.port,
                        job_id,
                        step_id: step.step_id,
                        signal: SIGKILL,
                    },
                ));
            }
            found += 1;
        }
        if found > 0 {
            job.touch(now);
        }
        found
    }

    // ── Completion ────────────────────────────────────────────────────────────

    /// One contiguous node range `[first, last]` of a step reported
    /// completion.  Returns the number of nodes still outstanding.
    #[allow(clippy::too_many_arguments)]
    pub fn partial_complete(
        &mut self,
        job: &mut Job,
        step_id: u32,
        range_first: u32,
        range_last: u32,
        step_rc: i32,
        jobacct: &Jobacct,
        uid: u32,
        now: i64,
    ) -> Result<u32, StepError> {
        self.authorize(job, uid)?;
        let job_id = job.job_id;
        let part_comp = self.plugins.switch.part_comp();
        let node_table = Arc::clone(&self.nodes);
        let job_node_bitmap = job.node_bitmap.clone();
        let step = job.find_step_mut(step_id).ok_or(StepError::InvalidJobId)?;

        step.jobacct.aggregate(jobacct);
        if step.batch_step {
            step.exit_code = step.exit_code.max(step_rc);
            return Ok(0);
        }

        let node_cnt = step.node_count() as u32;
        if range_last >= node_cnt || range_first > range_last {
            return Err(StepError::Corrupt(format!(
                "completion range {range_first}-{range_last} exceeds {node_cnt} step node(s)"
            )));
        }

        step.state = StepState::Completing;
        let exit_map = step
            .exit_node_bitmap
            .get_or_insert_with(|| Bitmap::new(node_cnt as usize));
        exit_map.set_range(range_first as usize, range_last as usize);
        let rem = node_cnt - exit_map.count() as u32;
        step.exit_code = step.exit_code.max(step_rc);
        if rem == 0 {
            if let Some(sw) = step.switch_job.as_mut() {
                let nodes = step
                    .layout
                    .as_ref()
                    .map(|l| l.node_list.clone())
                    .unwrap_or_default();
                sw.step_complete(&nodes);
            }
        } else if part_comp {
            // translate the step-local range back into host names
            if let Some(snb) = step.step_node_bitmap.as_ref() {
                let mut range_map = Bitmap::new(job_node_bitmap.len());
                for (i, g) in snb.iter_set().enumerate() {
                    if i as u32 >= range_first && i as u32 <= range_last {
                        range_map.set(g);
                    }
                }
                let hosts = hostlist::ranged_string(&range_map, &node_table);
                if let Some(sw) = step.switch_job.as_mut() {
                    sw.step_part_comp(&hosts);
                }
            }
        }

        debug!(
            job_id,
            step_id = step.step_id,
            range_first,
            range_last,
            rem,
            "partial step completion"
        );
        job.touch(now);
        Ok(rem)
    }

    /// Final completion: stamp accounting, fold the exit code into the
    /// job, return every debit, delete the record.
    #[allow(clippy::too_many_arguments)]
    pub fn complete_step(
        &mut self,
        job: &mut Job,
        step_id: u32,
        step_rc: i32,
        jobacct: &Jobacct,
        uid: u32,
        now: i64,
    ) -> Result<(), StepError> {
        self.authorize(job, uid)?;
        let resolved = job
            .find_step(step_id)
            .map(|s| s.step_id)
            .ok_or(StepError::InvalidJobId)?;
        let mut step = job
            .remove_step_record(resolved)
            .expect("looked up just above");

        step.jobacct.aggregate(jobacct);
        step.exit_code = step.exit_code.max(step_rc);
        job.derived_exit_code = job.derived_exit_code.max(step.exit_code);

        self.step_dealloc_lps(job, &mut step);
        self.release_step_state(job, &mut step);
        self.plugins.acct.step_complete(job, &step);
        info!(
            job_id = job.job_id,
            step_id = resolved,
            exit_code = step.exit_code,
            "step completed"
        );
        job.touch(now);
        Ok(())
    }

    // ── Time limits, suspend/resume ───────────────────────────────────────────

    /// Periodic tick: dispatch a kill to every running step past its
    /// limit.  Suspended time does not count against the limit.
    pub fn check_time_limit(&self, job: &Job, now: i64) {
        if job.state != JobState::Running {
            return;
        }
        let job_id = job.job_id;
        for step in &job.steps {
            if step.state != StepState::Running {
                continue;
            }
            if step.time_limit == 0 || step.time_limit == INFINITE {
                continue;
            }
            let elapsed_min = ((now - step.start_time) - step.tot_sus_time) / 60;
            if elapsed_min < step.time_limit as i64 {
                continue;
            }
            let Some(snb) = step.step_node_bitmap.as_ref() else {
                continue;
            };
            let hosts = hostlist::ranged_string(snb, &self.nodes);
            info!(
                job_id,
                step_id = step.step_id,
                elapsed_min,
                limit = step.time_limit,
                "step exceeded time limit"
            );
            self.plugins.agent.queue(AgentRequest::new(
                hosts.clone(),
                snb.count() as u32,
                AgentMessage::KillTimelimit {
                    job_id,
                    step_id: step.step_id,
                    uid: job.user_id,
                    nodes: hosts,
                    start_time: step.start_time,
                },
            ));
        }
    }

    /// Suspend bookkeeping: bank the run time accumulated since the
    /// later of step start and the previous resume.
    pub fn suspend(&self, job: &mut Job, now: i64) {
        for step in &mut job.steps {
            let base = step.start_time.max(job.suspend_time);
            if now > base {
                step.pre_sus_time += now - base;
            }
        }
        job.suspend_time = now;
        job.touch(now);
    }

    /// Resume bookkeeping: bank the suspended time so time-limit checks
    /// and run-time reporting exclude it.
    pub fn resume(&self, job: &mut Job, now: i64) {
        for step in &mut job.steps {
            let base = job.suspend_time.max(step.start_time);
            if now > base {
                step.tot_sus_time += now - base;
            }
        }
        job.suspend_time = now;
        job.touch(now);
    }

    // ── Updates ───────────────────────────────────────────────────────────────

    /// Change the time limit of one step, or of every step when
    /// `step_id` is [`NO_VAL`].
    pub fn update_step(
        &self,
        job: &mut Job,
        step_id: u32,
        time_limit: u32,
        auth: &UpdateAuth,
        now: i64,
    ) -> Result<(), StepError> {
        let authorized = auth.operator || auth.coord_accounts.contains(&job.account);
        if !authorized {
            return Err(StepError::AccessDenied {
                uid: auth.uid,
                job_id: job.job_id,
            });
        }
        if step_id == NO_VAL {
            if job.steps.is_empty() {
                return Err(StepError::InvalidJobId);
            }
            for step in &mut job.steps {
                step.time_limit = time_limit;
            }
        } else {
            let step = job.find_step_mut(step_id).ok_or(StepError::InvalidJobId)?;
            step.time_limit = time_limit;
        }
        info!(job_id = job.job_id, step_id, time_limit, "step time limit updated");
        job.touch(now);
        Ok(())
    }

    // ── Checkpointing ─────────────────────────────────────────────────────────

    /// Drive a checkpoint operation on one step ([`NO_VAL`]: every
    /// step).
    pub fn checkpoint_step(
        &self,
        job: &mut Job,
        step_id: u32,
        op: CkptOp,
        now: i64,
    ) -> Result<(), StepError> {
        if job.state == JobState::Suspended {
            return Err(StepError::Disabled(job.job_id));
        }
        let job_id = job.job_id;
        let ids: Vec<u32> = if step_id == NO_VAL {
            job.steps.iter().map(|s| s.step_id).collect()
        } else {
            vec![
                job.find_step(step_id)
                    .map(|s| s.step_id)
                    .ok_or(StepError::InvalidJobId)?,
            ]
        };
        if ids.is_empty() {
            return Err(StepError::InvalidJobId);
        }
        for id in ids {
            let nodes = Arc::clone(&self.nodes);
            let step = job.find_step_mut(id).expect("collected above");
            let ckpt_dir = step.ckpt_dir.clone();
            if let Some(cj) = step.check_job.as_mut() {
                cj.op(op, &ckpt_dir, now)?;
            }
            if matches!(op, CkptOp::Create | CkptOp::Vacate) {
                step.ckpt_time = now;
                if let Some(snb) = step.step_node_bitmap.as_ref() {
                    let hosts = hostlist::ranged_string(snb, &nodes);
                    self.plugins.agent.queue(AgentRequest::new(
                        hosts,
                        snb.count() as u32,
                        AgentMessage::CheckpointTasks {
                            job_id,
                            step_id: id,
                            op,
                            timestamp: now,
                        },
                    ));
                }
            }
        }
        job.touch(now);
        Ok(())
    }

    /// Whole-step checkpoint completion callback.
    pub fn checkpoint_comp(
        &self,
        job: &mut Job,
        step_id: u32,
        error_code: u32,
        error_msg: &str,
        now: i64,
    ) -> Result<(), StepError> {
        let step = job.find_step_mut(step_id).ok_or(StepError::InvalidJobId)?;
        if let Some(cj) = step.check_job.as_mut() {
            cj.comp(error_code, error_msg, now);
        }
        Ok(())
    }

    /// Per-task checkpoint completion callback.
    pub fn checkpoint_task_comp(
        &self,
        job: &mut Job,
        step_id: u32,
        task_id: u32,
        error_code: u32,
        now: i64,
    ) -> Result<(), StepError> {
        let step = job.find_step_mut(step_id).ok_or(StepError::InvalidJobId)?;
        if let Some(cj) = step.check_job.as_mut() {
            cj.task_comp(task_id, error_code, now);
        }
        Ok(())
    }

    /// Periodic tick: fire the next automatic checkpoint for every
    /// running step whose interval elapsed.
    pub fn check_ckpt(&self, job: &mut Job, now: i64) {
        if job.state != JobState::Running {
            return;
        }
        let job_id = job.job_id;
        for step in &mut job.steps {
            if step.state != StepState::Running || step.ckpt_interval == 0 {
                continue;
            }
            if now < step.ckpt_time + step.ckpt_interval as i64 * 60 {
                continue;
            }
            let ckpt_dir = step.ckpt_dir.clone();
            if let Some(cj) = step.check_job.as_mut() {
                if let Err(e) = cj.op(CkptOp::Create, &ckpt_dir, now) {
                    warn!(job_id, step_id = step.step_id, %e, "periodic checkpoint failed");
                    continue;
                }
            }
            step.ckpt_time = now;
            if let Some(snb) = step.step_node_bitmap.as_ref() {
                let hosts = hostlist::ranged_string(snb, &self.nodes);
                self.plugins.agent.queue(AgentRequest::new(
                    hosts,
                    snb.count() as u32,
                    AgentMessage::CheckpointTasks {
                        job_id,
                        step_id: step.step_id,
                        op: CkptOp::Create,
                        timestamp: now,
                    },
                ));
            }
        }
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn authorize(&self, job: &Job, uid: u32) -> Result<(), StepError> {
        if uid == job.user_id || uid == 0 || uid == self.config.controller_uid {
            Ok(())
        } else {
            Err(StepError::AccessDenied {
                uid,
                job_id: job.job_id,
            })
        }
    }

    fn alloc_ports(&mut self, cnt: u32) -> Option<(Vec<u16>, String)> {
        if cnt == 0 {
            return Some((Vec::new(), String::new()));
        }
        let cnt = cnt as usize;
        let width = self.ports_in_use.len();
        if cnt > width {
            return None;
        }
        let (lo, _) = self.config.resv_port_range;
        let mut start = 0usize;
        while start + cnt <= width {
            match (start..start + cnt).find(|&b| self.ports_in_use.test(b)) {
                Some(taken) => start = taken + 1,
                None => {
                    self.ports_in_use.set_range(start, start + cnt - 1);
                    let ports: Vec<u16> =
                        (start..start + cnt).map(|b| lo + b as u16).collect();
                    let text = if cnt == 1 {
                        format!("{}", ports[0])
                    } else {
                        format!("{}-{}", ports[0], ports[cnt - 1])
                    };
                    return Some((ports, text));
                }
            }
        }
        None
    }

    fn release_ports(&mut self, ports: &[u16]) {
        let (lo, _) = self.config.resv_port_range;
        for &p in ports {
            let bit = (p - lo) as usize;
            if bit < self.ports_in_use.len() {
                self.ports_in_use.clear(bit);
            }
        }
    }
}

/// Job-local index of a global node bit: its position within the
/// job's node bitmap.
fn local_index(job_nodes: &Bitmap, global: usize) -> Option<usize> {
    if !job_nodes.test(global) {
        return None;
    }
    Some(job_nodes.iter_set().take_while(|&b| b < global).count())
}

fn check_len(field: &'static str, value: &str, limit: usize) -> Result<(), StepError> {
    if value.len() > limit {
        return Err(StepError::PathnameTooLong { field, limit });
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::resources::JobResources;
    use crate::node::NodeInfo;
    use crate::plugins::agent::RecordingAgent;
    use crate::plugins::switch::{SwitchError, SwitchJobInfo, SwitchPlugin};
    use crate::pack::{Packer, Unpacker};
    use crate::BATCH_STEP_ID;

    // ── Fixtures ──────────────────────────────────────────────────────────────

    fn table(n: usize, cpus: u32) -> Arc<NodeTable> {
        Arc::new(NodeTable::new(
            (0..n)
                .map(|i| NodeInfo::new(format!("tux{i}"), cpus))
                .collect(),
        ))
    }

    fn job(n: usize, cpus: u32) -> Job {
        let mut map = Bitmap::new(n);
        map.set_range(0, n - 1);
        Job::new(100, 1000, map, JobResources::new(vec![cpus; n]))
    }

    fn manager(nodes: Arc<NodeTable>) -> (StepManager, Arc<RecordingAgent>) {
        let agent = Arc::new(RecordingAgent::new());
        let plugins = Plugins::with_agent(Box::new(Arc::clone(&agent)));
        let mgr = StepManager::new(Arc::new(StepmgrConfig::default()), nodes, plugins);
        (mgr, agent)
    }

    /// `num_tasks` tasks at `cpus_per_task` CPUs each (exact cpu_count).
    fn request(num_tasks: u32, cpus_per_task: u32) -> StepCreateRequest {
        StepCreateRequest {
            user_id: 1000,
            num_tasks,
            cpu_count: num_tasks * cpus_per_task,
            ..Default::default()
        }
    }

    // ── Scenario: plain creation ──────────────────────────────────────────────

    #[test]
    fn create_distributes_tasks_and_debits_cpus() {
        let (mut mgr, _) = manager(table(2, 4));
        let mut j = job(2, 4);

        let id = mgr.create_step(&mut j, &request(4, 2), false, 1000).unwrap();
        assert_eq!(id, 0);

        let step = j.find_step(0).unwrap();
        assert_eq!(step.cpus_per_task, 2);
        let layout = step.layout.as_ref().unwrap();
        assert_eq!(layout.tasks, vec![2, 2]);
        assert_eq!(j.resources.cpus_used, vec![4, 4]);
    }

    // ── Scenario: exclusive contention ────────────────────────────────────────

    #[test]
    fn exclusive_steps_block_and_release() {
        let (mut mgr, _) = manager(table(2, 4));
        let mut j = job(2, 4);

        let mut first = request(4, 2);
        first.exclusive = true;
        let id = mgr.create_step(&mut j, &first, false, 1000).unwrap();

        let mut second = request(2, 1);
        second.exclusive = true;
        assert!(matches!(
            mgr.create_step(&mut j, &second, false, 1001),
            Err(StepError::NodesBusy)
        ));

        mgr.complete_step(&mut j, id, 0, &Jobacct::default(), 1000, 1002)
            .unwrap();
        assert_eq!(j.resources.cpus_used, vec![0, 0]);

        mgr.create_step(&mut j, &second, false, 1003).unwrap();
    }

    // ── Scenario: memory-driven selection ─────────────────────────────────────

    #[test]
    fn memory_reservation_limits_selection_and_debits() {
        let (mut mgr, _) = manager(table(4, 8));
        let mut map = Bitmap::new(4);
        map.set_range(0, 3);
        let res = JobResources::new(vec![8; 4]).with_memory(vec![8192; 4]);
        let mut j = Job::new(100, 1000, map, res);

        let req = StepCreateRequest {
            user_id: 1000,
            min_nodes: 1,
            cpu_count: 16,
            mem_per_cpu: 1024,
            ..Default::default()
        };
        let id = mgr.create_step(&mut j, &req, false, 1000).unwrap();

        let step = j.find_step(id).unwrap();
        assert_eq!(step.node_count(), 2);
        assert_eq!(step.num_tasks, 16); // defaulted from cpu_count
        assert_eq!(j.resources.cpus_used[0], 8);
        assert_eq!(j.resources.cpus_used[1], 8);
        assert_eq!(j.resources.memory_used[0], 8192);
        assert_eq!(j.resources.memory_used[1], 8192);
        assert_eq!(j.resources.cpus_used[2], 0);
    }

    // ── Scenario: time limit ──────────────────────────────────────────────────

    #[test]
    fn time_limit_fires_exactly_one_kill() {
        let (mut mgr, agent) = manager(table(2, 4));
        let mut j = job(2, 4);

        let mut req = request(2, 1);
        req.time_limit = 1;
        let id = mgr.create_step(&mut j, &req, false, 1000).unwrap();
        j.find_step_mut(id).unwrap().tot_sus_time = 120;
        agent.clear();

        // 180 wall seconds, 120 suspended: exactly one limit-minute elapsed
        mgr.check_time_limit(&j, 1000 + 180);
        let kills: Vec<_> = agent
            .sent()
            .into_iter()
            .filter(|r| matches!(r.message, AgentMessage::KillTimelimit { .. }))
            .collect();
        assert_eq!(kills.len(), 1);
        assert_eq!(kills[0].hostlist, "tux0");

        // one second short of the limit: nothing fires
        agent.clear();
        mgr.check_time_limit(&j, 1000 + 179);
        assert!(agent.sent().is_empty());
    }

    // ── Scenario: out-of-order partial completion ─────────────────────────────

    #[test]
    fn partial_complete_coalesces_out_of_order_ranges() {
        let (mut mgr, _) = manager(table(5, 4));
        let mut j = job(5, 4);

        let mut req = request(5, 1);
        req.min_nodes = 5;
        let id = mgr.create_step(&mut j, &req, false, 1000).unwrap();

        let rem = mgr
            .partial_complete(&mut j, id, 2, 4, 0, &Jobacct::default(), 1000, 1001)
            .unwrap();
        assert_eq!(rem, 2);

        let rem = mgr
            .partial_complete(&mut j, id, 0, 1, 3, &Jobacct::default(), 1000, 1002)
            .unwrap();
        assert_eq!(rem, 0);

        let step = j.find_step(id).unwrap();
        assert_eq!(step.exit_node_bitmap.as_ref().unwrap().fmt_ranges(), "0-4");
        assert_eq!(step.exit_code, 3);
    }

    #[test]
    fn partial_complete_is_idempotent() {
        let (mut mgr, _) = manager(table(5, 4));
        let mut j = job(5, 4);
        let mut req = request(5, 1);
        req.min_nodes = 5;
        let id = mgr.create_step(&mut j, &req, false, 1000).unwrap();

        for _ in 0..2 {
            mgr.partial_complete(&mut j, id, 2, 4, 0, &Jobacct::default(), 1000, 1001)
                .unwrap();
        }
        let step = j.find_step(id).unwrap();
        assert_eq!(step.exit_node_bitmap.as_ref().unwrap().fmt_ranges(), "2-4");
    }

    #[test]
    fn partial_complete_rejects_oversized_range() {
        let (mut mgr, _) = manager(table(2, 4));
        let mut j = job(2, 4);
        let id = mgr.create_step(&mut j, &request(2, 1), false, 1000).unwrap();
        assert!(mgr
            .partial_complete(&mut j, id, 0, 5, 0, &Jobacct::default(), 1000, 1001)
            .is_err());
    }

    #[test]
    fn arbitrary_distribution_debits_nodes_in_index_order() {
        let (mut mgr, _) = manager(table(3, 4));
        let mut j = job(3, 4);

        // hosts listed out of order: tasks 0 and 2 on tux2, task 1 on tux0
        let req = StepCreateRequest {
            user_id: 1000,
            num_tasks: 3,
            cpu_count: 3,
            task_dist: TaskDist::Arbitrary,
            node_list: Some("tux2,tux0,tux2".to_string()),
            ..Default::default()
        };
        let id = mgr.create_step(&mut j, &req, false, 1000).unwrap();

        let step = j.find_step(id).unwrap();
        assert_eq!(
            step.step_node_bitmap.as_ref().unwrap().fmt_ranges(),
            "0,2"
        );
        let layout = step.layout.as_ref().unwrap();
        assert_eq!(layout.node_list, "tux[0,2]");
        assert_eq!(layout.tasks, vec![1, 2]);
        assert_eq!(layout.tids, vec![vec![1], vec![0, 2]]);

        // debits land on the right nodes: one CPU on tux0, two on tux2
        assert_eq!(j.resources.cpus_used, vec![1, 0, 2]);

        mgr.complete_step(&mut j, id, 0, &Jobacct::default(), 1000, 1001)
            .unwrap();
        assert_eq!(j.resources.cpus_used, vec![0, 0, 0]);
    }

    // ── Boundaries ────────────────────────────────────────────────────────────

    #[test]
    fn overcommit_with_exclusive_coerces_to_one_cpu_per_task() {
        let (mut mgr, _) = manager(table(2, 4));
        let mut j = job(2, 4);
        let req = StepCreateRequest {
            user_id: 1000,
            num_tasks: 4,
            cpu_count: 999,
            overcommit: true,
            exclusive: true,
            ..Default::default()
        };
        let id = mgr.create_step(&mut j, &req, false, 1000).unwrap();
        let step = j.find_step(id).unwrap();
        assert_eq!(step.cpu_count, 4);
        assert_eq!(step.cpus_per_task, 1);
        assert_eq!(j.resources.cpus_used, vec![2, 2]);
    }

    #[test]
    fn plain_overcommit_suppresses_cpu_accounting() {
        let (mut mgr, _) = manager(table(1, 2));
        let mut j = job(1, 2);
        let req = StepCreateRequest {
            user_id: 1000,
            num_tasks: 8,
            cpu_count: 8,
            overcommit: true,
            ..Default::default()
        };
        let id = mgr.create_step(&mut j, &req, false, 1000).unwrap();
        let step = j.find_step(id).unwrap();
        assert_eq!(step.cpus_per_task, 0);
        assert_eq!(j.resources.cpus_used, vec![0]);
    }

    #[test]
    fn step_id_exhaustion_fails_with_too_many_steps() {
        let (mut mgr, _) = manager(table(2, 4));
        let mut j = job(2, 4);
        j.next_step_id = MAX_STEP_ID;
        assert!(matches!(
            mgr.create_step(&mut j, &request(2, 1), false, 1000),
            Err(StepError::TooManySteps(100))
        ));
    }

    #[test]
    fn invalid_node_count_is_rejected() {
        let (mut mgr, _) = manager(table(4, 4));
        let mut j = job(4, 4);
        let req = StepCreateRequest {
            user_id: 1000,
            min_nodes: 3,
            max_nodes: 2,
            ..Default::default()
        };
        assert!(matches!(
            mgr.create_step(&mut j, &req, false, 1000),
            Err(StepError::InvalidNodeCount { min: 3, max: 2 })
        ));
    }

    #[test]
    fn oversized_name_is_rejected() {
        let (mut mgr, _) = manager(table(2, 4));
        let mut j = job(2, 4);
        let mut req = request(2, 1);
        req.name = "x".repeat(1025);
        assert!(matches!(
            mgr.create_step(&mut j, &req, false, 1000),
            Err(StepError::PathnameTooLong { field: "name", .. })
        ));
        assert!(j.steps.is_empty());
    }

    #[test]
    fn time_limit_above_partition_max_is_rejected_when_enforced() {
        let nodes = table(2, 4);
        let agent = Arc::new(RecordingAgent::new());
        let mut cfg = StepmgrConfig::default();
        cfg.enforce_partition_limits = true;
        let mut mgr = StepManager::new(
            Arc::new(cfg),
            nodes,
            Plugins::with_agent(Box::new(Arc::clone(&agent))),
        );
        let mut j = job(2, 4);
        j.partition_max_time = 10;

        let mut req = request(2, 1);
        req.time_limit = 30;
        assert!(matches!(
            mgr.create_step(&mut j, &req, false, 1000),
            Err(StepError::InvalidTimeLimit {
                requested: 30,
                max: 10
            })
        ));
    }

    #[test]
    fn pending_and_finished_jobs_refuse_steps() {
        let (mut mgr, _) = manager(table(2, 4));
        let mut j = job(2, 4);

        j.state = JobState::Pending;
        assert!(matches!(
            mgr.create_step(&mut j, &request(1, 1), false, 1000),
            Err(StepError::JobPending(100))
        ));
        assert!(matches!(
            mgr.create_step(&mut j, &request(1, 1), true, 1000),
            Err(StepError::DuplicateJobId(100))
        ));

        j.state = JobState::Finished;
        assert!(matches!(
            mgr.create_step(&mut j, &request(1, 1), false, 1000),
            Err(StepError::AlreadyDone(100))
        ));
    }

    #[test]
    fn foreign_uid_is_denied() {
        let (mut mgr, _) = manager(table(2, 4));
        let mut j = job(2, 4);
        let mut req = request(1, 1);
        req.user_id = 2001;
        assert!(matches!(
            mgr.create_step(&mut j, &req, false, 1000),
            Err(StepError::AccessDenied { uid: 2001, .. })
        ));
    }

    #[test]
    fn prolog_gates_the_first_step_only() {
        let (mut mgr, _) = manager(table(2, 4));
        let mut j = job(2, 4);
        j.trans_flags |= JobTransFlags::PROLOG_RUNNING;
        assert!(matches!(
            mgr.create_step(&mut j, &request(1, 1), false, 1000),
            Err(StepError::PrologRunning(100))
        ));
    }

    // ── Unwind ────────────────────────────────────────────────────────────────

    struct FailingSwitch;
    struct FailingSwitchInfo;

    impl SwitchJobInfo for FailingSwitchInfo {
        fn build(&mut self, _layout: &StepLayout, _network: &str) -> Result<(), SwitchError> {
            Err(SwitchError::BuildFailed("no windows left".to_string()))
        }
        fn pack(&self, _p: &mut Packer) {}
        fn step_complete(&mut self, _nodes: &str) {}
        fn step_part_comp(&mut self, _nodes: &str) {}
        fn step_allocated(&mut self, _nodes: &str) {}
    }

    impl SwitchPlugin for FailingSwitch {
        fn alloc_jobinfo(&self) -> Box<dyn SwitchJobInfo> {
            Box::new(FailingSwitchInfo)
        }
        fn unpack_jobinfo(
            &self,
            _u: &mut Unpacker,
        ) -> Result<Box<dyn SwitchJobInfo>, SwitchError> {
            Ok(Box::new(FailingSwitchInfo))
        }
        fn part_comp(&self) -> bool {
            false
        }
    }

    #[test]
    fn interconnect_failure_leaves_no_trace() {
        let nodes = table(2, 4);
        let agent = Arc::new(RecordingAgent::new());
        let mut plugins = Plugins::with_agent(Box::new(Arc::clone(&agent)));
        plugins.switch = Box::new(FailingSwitch);
        let mut mgr = StepManager::new(Arc::new(StepmgrConfig::default()), nodes, plugins);
        let mut j = job(2, 4);

        let mut req = request(2, 1);
        req.resv_port_cnt = 0; // ports must be released on unwind too
        assert!(matches!(
            mgr.create_step(&mut j, &req, false, 1000),
            Err(StepError::InterconnectFailure(_))
        ));
        assert!(j.steps.is_empty());
        assert_eq!(j.resources.cpus_used, vec![0, 0]);
        assert_eq!(mgr.ports_in_use.count(), 0);
    }

    // ── Ports ─────────────────────────────────────────────────────────────────

    #[test]
    fn derived_port_reservation_covers_peak_tasks_plus_one() {
        let (mut mgr, _) = manager(table(2, 4));
        let mut j = job(2, 4);
        let mut req = request(4, 2); // 2 tasks per node
        req.resv_port_cnt = 0;
        let id = mgr.create_step(&mut j, &req, false, 1000).unwrap();
        let step = j.find_step(id).unwrap();
        assert_eq!(step.resv_port_array.len(), 3);
        assert_eq!(step.resv_ports, "12000-12002");

        mgr.complete_step(&mut j, id, 0, &Jobacct::default(), 1000, 1001)
            .unwrap();
        assert_eq!(mgr.ports_in_use.count(), 0);
    }

    // ── Signals ───────────────────────────────────────────────────────────────

    #[test]
    fn sigkill_records_requid_and_notifies_client() {
        let (mut mgr, agent) = manager(table(2, 4));
        let mut j = job(2, 4);
        let mut req = request(2, 1);
        req.host = "login1".to_string();
        req.port = 4500;
        let id = mgr.create_step(&mut j, &req, false, 1000).unwrap();
        agent.clear();

        mgr.signal_step(&mut j, id, SIGKILL, 1000, 1001).unwrap();
        assert_eq!(j.find_step(id).unwrap().requid, 1000);

        let sent = agent.sent();
        assert!(sent
            .iter()
            .any(|r| matches!(r.message, AgentMessage::SrunStepSignal { port: 4500, .. })));
        assert!(sent.iter().any(|r| matches!(
            r.message,
            AgentMessage::SignalTasks { signal: SIGKILL, .. }
        ) && r.hostlist == "tux0"));
    }

    #[test]
    fn signal_requires_running_job() {
        let (mut mgr, _) = manager(table(2, 4));
        let mut j = job(2, 4);
        let id = mgr.create_step(&mut j, &request(2, 1), false, 1000).unwrap();
        j.state = JobState::Suspended;
        assert!(matches!(
            mgr.signal_step(&mut j, id, 15, 1000, 1001),
            Err(StepError::TransitionStateNoUpdate(100))
        ));
    }

    #[test]
    fn kill_step_on_node_honours_no_kill() {
        let (mut mgr, agent) = manager(table(2, 4));
        let mut j = job(2, 4);

        let survivor = StepCreateRequest {
            user_id: 1000,
            min_nodes: 2,
            num_tasks: 2,
            cpu_count: 2,
            no_kill: true,
            ..Default::default()
        };
        mgr.create_step(&mut j, &survivor, false, 1000).unwrap();
        let mut victim = request(2, 1);
        victim.min_nodes = 2;
        mgr.create_step(&mut j, &victim, false, 1000).unwrap();
        agent.clear();

        let killed = mgr.kill_step_on_node(&mut j, 1, 1001);
        assert_eq!(killed, 1);
        let sent = agent.sent();
        assert!(sent
            .iter()
            .all(|r| r.hostlist == "tux1" || r.hostlist.is_empty()));
        assert!(sent
            .iter()
            .any(|r| matches!(r.message, AgentMessage::TerminateTasks { step_id: 1, .. })));
    }

    // ── Suspend / resume ──────────────────────────────────────────────────────

    #[test]
    fn suspend_resume_banks_time_correctly() {
        let (mut mgr, _) = manager(table(2, 4));
        let mut j = job(2, 4);
        let id = mgr.create_step(&mut j, &request(2, 1), false, 1000).unwrap();

        mgr.suspend(&mut j, 1060);
        assert_eq!(j.find_step(id).unwrap().pre_sus_time, 60);

        mgr.resume(&mut j, 1120);
        assert_eq!(j.find_step(id).unwrap().tot_sus_time, 60);

        mgr.suspend(&mut j, 1180);
        assert_eq!(j.find_step(id).unwrap().pre_sus_time, 120);
    }

    // ── Updates ───────────────────────────────────────────────────────────────

    #[test]
    fn update_step_requires_operator_or_coordinator() {
        let (mut mgr, _) = manager(table(2, 4));
        let mut j = job(2, 4);
        j.account = "physics".to_string();
        let id = mgr.create_step(&mut j, &request(2, 1), false, 1000).unwrap();

        let nobody = UpdateAuth {
            uid: 1000,
            ..Default::default()
        };
        assert!(mgr.update_step(&mut j, id, 5, &nobody, 1001).is_err());

        let coord = UpdateAuth {
            uid: 1000,
            operator: false,
            coord_accounts: vec!["physics".to_string()],
        };
        mgr.update_step(&mut j, id, 5, &coord, 1002).unwrap();
        assert_eq!(j.find_step(id).unwrap().time_limit, 5);

        let op = UpdateAuth {
            uid: 2,
            operator: true,
            coord_accounts: Vec::new(),
        };
        mgr.update_step(&mut j, NO_VAL, 7, &op, 1003).unwrap();
        assert_eq!(j.find_step(id).unwrap().time_limit, 7);
    }

    // ── Batch step ────────────────────────────────────────────────────────────

    #[test]
    fn batch_step_has_no_layout_and_no_debits() {
        let (mut mgr, _) = manager(table(2, 4));
        let mut j = job(2, 4);
        let id = mgr
            .create_step(&mut j, &request(NO_VAL, 0), true, 1000)
            .unwrap();
        assert_eq!(id, BATCH_STEP_ID);

        let step = j.find_step(BATCH_STEP_ID).unwrap();
        assert!(step.batch_step);
        assert!(step.layout.is_none());
        assert_eq!(step.node_count(), 1);
        assert_eq!(j.resources.cpus_used, vec![0, 0]);

        // batch partial completion just records the exit code
        let rem = mgr
            .partial_complete(&mut j, BATCH_STEP_ID, 0, 0, 7, &Jobacct::default(), 1000, 1001)
            .unwrap();
        assert_eq!(rem, 0);
        assert_eq!(j.find_step(BATCH_STEP_ID).unwrap().exit_code, 7);
        assert!(j.find_step(BATCH_STEP_ID).unwrap().exit_node_bitmap.is_none());
    }

    // ── Checkpoint ────────────────────────────────────────────────────────────

    #[test]
    fn periodic_checkpoint_fires_after_interval() {
        let (mut mgr, agent) = manager(table(2, 4));
        let mut j = job(2, 4);
        let mut req = request(2, 1);
        req.ckpt_interval = 1;
        let id = mgr.create_step(&mut j, &req, false, 1000).unwrap();
        agent.clear();

        mgr.check_ckpt(&mut j, 1030); // 30s: not yet
        assert!(agent.sent().is_empty());

        mgr.check_ckpt(&mut j, 1060);
        let sent = agent.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            sent[0].message,
            AgentMessage::CheckpointTasks {
                op: CkptOp::Create,
                ..
            }
        ));
        assert_eq!(j.find_step(id).unwrap().ckpt_time, 1060);
    }

    #[test]
    fn checkpoint_of_suspended_job_is_disabled() {
        let (mut mgr, _) = manager(table(2, 4));
        let mut j = job(2, 4);
        mgr.create_step(&mut j, &request(2, 1), false, 1000).unwrap();
        j.state = JobState::Suspended;
        assert!(matches!(
            mgr.checkpoint_step(&mut j, NO_VAL, CkptOp::Create, 1001),
            Err(StepError::Disabled(100))
        ));
    }

    // ── Conservation ──────────────────────────────────────────────────────────

    #[test]
    fn delete_all_steps_returns_every_debit() {
        let (mut mgr, _) = manager(table(4, 4));
        let mut j = job(4, 4);
        mgr.create_step(&mut j, &request(4, 2), false, 1000).unwrap();
        mgr.create_step(&mut j, &request(2, 1), false, 1001).unwrap();
        assert!(j.resources.cpus_used.iter().any(|&c| c > 0));

        mgr.delete_all_steps(&mut j, StepFilter::All);
        assert!(j.steps.is_empty());
        assert_eq!(j.resources.cpus_used, vec![0; 4]);
    }

    #[test]
    fn cpu_conservation_across_mixed_create_complete() {
        let (mut mgr, _) = manager(table(4, 4));
        let mut j = job(4, 4);

        let a = mgr.create_step(&mut j, &request(4, 1), false, 1000).unwrap();
        let b = mgr.create_step(&mut j, &request(2, 2), false, 1001).unwrap();

        // sum of live step debits equals the job's used counters
        let mut expect = vec![0u32; 4];
        for step in &j.steps {
            let layout = step.layout.as_ref().unwrap();
            for (i, g) in step.step_node_bitmap.as_ref().unwrap().iter_set().enumerate() {
                expect[g] += layout.tasks[i] * step.cpus_per_task as u32;
            }
        }
        assert_eq!(j.resources.cpus_used, expect);

        mgr.complete_step(&mut j, a, 0, &Jobacct::default(), 1000, 1002)
            .unwrap();
        mgr.complete_step(&mut j, b, 0, &Jobacct::default(), 1000, 1003)
            .unwrap();
        assert_eq!(j.resources.cpus_used, vec![0; 4]);
    }

    #[test]
    fn completion_folds_exit_code_into_job() {
        let (mut mgr, _) = manager(table(2, 4));
        let mut j = job(2, 4);
        let id = mgr.create_step(&mut j, &request(2, 1), false, 1000).unwrap();
        mgr.complete_step(&mut j, id, 9, &Jobacct::default(), 1000, 1001)
            .unwrap();
        assert_eq!(j.derived_exit_code, 9);
        assert!(j.find_step(id).is_none());
    }
}
