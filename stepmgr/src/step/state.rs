/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Step-state serialisation and crash recovery.
//!
//! Steps are dumped with the job state on every checkpoint of the
//! controller and reloaded on restart.  Two protocol versions are live
//! at once: [`ProtocolVersion::V2`] (current) carries packed GRES
//! state, [`ProtocolVersion::V1`] omits it and is otherwise
//! field-for-field identical.  Bitmaps cross the wire in textual
//! range form and are re-parsed on load.

use tracing::debug;

use crate::bitmap::Bitmap;
use crate::hostlist;
use crate::job::Job;
use crate::node::NodeTable;
use crate::pack::{Packer, ProtocolVersion, Unpacker};
use crate::plugins::Plugins;
use crate::step::error::StepError;
use crate::step::layout::{StepLayout, TaskDist};
use crate::step::{StepRecord, StepState};

/// Dump every step of a job: a count followed by the records.
pub fn dump_job_steps(job: &Job, plugins: &Plugins, version: ProtocolVersion, p: &mut Packer) {
    p.pack_u32(job.steps.len() as u32);
    for step in &job.steps {
        dump_step_state(step, plugins, version, p);
    }
}

/// Load every step of a job dumped by [`dump_job_steps`].
pub fn load_job_steps(
    job: &mut Job,
    plugins: &Plugins,
    table: &NodeTable,
    version: ProtocolVersion,
    u: &mut Unpacker,
) -> Result<(), StepError> {
    let count = u.unpack_u32()?;
    for _ in 0..count {
        load_step_state(job, plugins, table, version, u)?;
    }
    Ok(())
}

/// Serialise one step record.
pub fn dump_step_state(
    step: &StepRecord,
    plugins: &Plugins,
    version: ProtocolVersion,
    p: &mut Packer,
) {
    p.pack_u32(step.step_id);
    p.pack_u16(step.cyclic_alloc() as u16);
    p.pack_u16(step.port);
    p.pack_u16(step.ckpt_interval);
    p.pack_u16(step.cpus_per_task);
    p.pack_u32(step.resv_port_cnt);
    p.pack_u16(step.no_kill as u16);
    p.pack_u32(step.cpu_count);
    p.pack_u64(step.mem_per_cpu);
    p.pack_u32(step.exit_code as u32);

    match &step.exit_node_bitmap {
        Some(map) => {
            p.pack_bool(true);
            p.pack_str(&map.fmt_ranges());
            p.pack_u32(map.len() as u32);
        }
        None => p.pack_bool(false),
    }
    match &step.core_bitmap_job {
        Some(map) => {
            p.pack_bool(true);
            p.pack_u32(map.len() as u32);
            p.pack_str(&map.fmt_ranges());
        }
        None => p.pack_bool(false),
    }

    p.pack_u32(step.time_limit);
    p.pack_time(step.start_time);
    p.pack_time(step.pre_sus_time);
    p.pack_time(step.tot_sus_time);
    p.pack_time(step.ckpt_time);

    p.pack_str(&step.host);
    p.pack_str(&step.resv_ports);
    p.pack_str(&step.name);
    p.pack_str(&step.network);
    p.pack_str(&step.ckpt_dir);
    p.pack_str(&step.gres);
    if version >= ProtocolVersion::V2 {
        plugins.gres.pack_state(&step.gres_list, p);
    }

    p.pack_u16(step.batch_step as u16);
    if !step.batch_step {
        dump_layout(step.layout.as_ref(), step.task_dist, step.plane_size, p);
        match &step.switch_job {
            Some(sw) => {
                p.pack_bool(true);
                sw.pack(p);
            }
            None => p.pack_bool(false),
        }
    }
    match &step.check_job {
        Some(cj) => {
            p.pack_bool(true);
            cj.pack(p);
        }
        None => p.pack_bool(false),
    }
}

fn dump_layout(layout: Option<&StepLayout>, task_dist: TaskDist, plane_size: u16, p: &mut Packer) {
    let Some(layout) = layout else {
        p.pack_bool(false);
        return;
    };
    p.pack_bool(true);
    p.pack_str(&layout.node_list);
    p.pack_u32(layout.node_cnt);
    p.pack_u32(layout.task_cnt);
    p.pack_u16(task_dist.to_wire());
    p.pack_u16(plane_size);
    for t in &layout.tasks {
        p.pack_u32(*t);
    }
    for tids in &layout.tids {
        p.pack_u32(tids.len() as u32);
        for tid in tids {
            p.pack_u32(*tid);
        }
    }
}

/// Reload one step record, either populating an existing step with the
/// same id or registering a new one.  Returns the step id.
pub fn load_step_state(
    job: &mut Job,
    plugins: &Plugins,
    table: &NodeTable,
    version: ProtocolVersion,
    u: &mut Unpacker,
) -> Result<u32, StepError> {
    let step_id = u.unpack_u32()?;
    let cyclic_alloc = u.unpack_u16()?;
    if cyclic_alloc > 1 {
        return Err(StepError::Corrupt(format!(
            "cyclic_alloc value {cyclic_alloc} out of range"
        )));
    }
    let port = u.unpack_u16()?;
    let ckpt_interval = u.unpack_u16()?;
    let cpus_per_task = u.unpack_u16()?;
    let resv_port_cnt = u.unpack_u32()?;
    let no_kill = u.unpack_u16()?;
    if no_kill > 1 {
        return Err(StepError::Corrupt(format!(
            "no_kill value {no_kill} out of range"
        )));
    }
    let cpu_count = u.unpack_u32()?;
    let mem_per_cpu = u.unpack_u64()?;
    let exit_code = u.unpack_u32()? as i32;

    let exit_node_bitmap = if u.unpack_bool()? {
        let text = u.unpack_str()?;
        let bits = u.unpack_u32()? as usize;
        Some(Bitmap::parse_ranges(&text, bits)?)
    } else {
        None
    };
    let core_bitmap_job = if u.unpack_bool()? {
        let bits = u.unpack_u32()? as usize;
        let text = u.unpack_str()?;
        Some(Bitmap::parse_ranges(&text, bits)?)
    } else {
        None
    };

    let time_limit = u.unpack_u32()?;
    let start_time = u.unpack_time()?;
    let pre_sus_time = u.unpack_time()?;
    let tot_sus_time = u.unpack_time()?;
    let ckpt_time = u.unpack_time()?;

    let host = u.unpack_str()?;
    let resv_ports = u.unpack_str()?;
    let name = u.unpack_str()?;
    let network = u.unpack_str()?;
    let ckpt_dir = u.unpack_str()?;
    let gres = u.unpack_str()?;
    let gres_list = if version >= ProtocolVersion::V2 {
        plugins.gres.unpack_state(u).map_err(StepError::InvalidGres)?
    } else {
        Vec::new()
    };

    let batch_step = u.unpack_u16()? != 0;
    let (layout, task_dist, plane_size, switch_job) = if batch_step {
        (None, TaskDist::default(), 0, None)
    } else {
        let (layout, task_dist, plane_size) = load_layout(u)?;
        let switch_job = if u.unpack_bool()? {
            Some(
                plugins
                    .switch
                    .unpack_jobinfo(u)
                    .map_err(StepError::InterconnectFailure)?,
            )
        } else {
            None
        };
        (layout, task_dist, plane_size, switch_job)
    };
    let check_job = if u.unpack_bool()? {
        Some(
            plugins
                .checkpoint
                .unpack_jobinfo(u)
                .map_err(StepError::Checkpoint)?,
        )
    } else {
        None
    };

    // the node set is reconstructed from the layout's node list
    let step_node_bitmap = match &layout {
        Some(l) => Some(
            hostlist::parse(&l.node_list, table)
                .map_err(|e| StepError::Corrupt(e.to_string()))?,
        ),
        None => None,
    };

    // populate an existing record or register a new one with this id
    if job.find_step(step_id).is_none() {
        job.steps.push(StepRecord::new(step_id));
        if step_id < crate::MAX_STEP_ID && job.next_step_id <= step_id {
            job.next_step_id = step_id + 1;
        }
    }
    let step = job.find_step_mut(step_id).expect("inserted above");
    step.state = StepState::Running;
    step.port = port;
    step.ckpt_interval = ckpt_interval;
    step.cpus_per_task = cpus_per_task;
    step.resv_port_cnt = resv_port_cnt;
    step.no_kill = no_kill != 0;
    step.cpu_count = cpu_count;
    step.mem_per_cpu = mem_per_cpu;
    step.exit_code = exit_code;
    step.exit_node_bitmap = exit_node_bitmap;
    step.core_bitmap_job = core_bitmap_job;
    step.time_limit = time_limit;
    step.start_time = start_time;
    step.pre_sus_time = pre_sus_time;
    step.tot_sus_time = tot_sus_time;
    step.ckpt_time = ckpt_time;
    step.host = host;
    step.resv_ports = resv_ports;
    step.name = name;
    step.network = network;
    step.ckpt_dir = ckpt_dir;
    step.gres = gres;
    step.gres_list = gres_list;
    step.batch_step = batch_step;
    step.task_dist = task_dist;
    step.plane_size = plane_size;
    step.num_tasks = layout.as_ref().map_or(1, |l| l.task_cnt);
    step.layout = layout;
    step.switch_job = switch_job;
    step.check_job = check_job;
    step.step_node_bitmap = step_node_bitmap;

    debug!(job_id = job.job_id, step_id, "step state restored");
    Ok(step_id)
}

fn load_layout(u: &mut Unpacker) -> Result<(Option<StepLayout>, TaskDist, u16), StepError> {
    if !u.unpack_bool()? {
        return Ok((None, TaskDist::default(), 0));
    }
    let node_list = u.unpack_str()?;
    let node_cnt = u.unpack_u32()?;
    let task_cnt = u.unpack_u32()?;
    let dist_wire = u.unpack_u16()?;
    let task_dist = TaskDist::from_wire(dist_wire)
        .ok_or_else(|| StepError::Corrupt(format!("unknown task distribution {dist_wire}")))?;
    let plane_size = u.unpack_u16()?;
    let mut tasks = Vec::with_capacity(node_cnt as usize);
    for _ in 0..node_cnt {
        tasks.push(u.unpack_u32()?);
    }
    let mut tids = Vec::with_capacity(node_cnt as usize);
    for _ in 0..node_cnt {
        let n = u.unpack_u32()?;
        let mut ids = Vec::with_capacity(n as usize);
        for _ in 0..n {
            ids.push(u.unpack_u32()?);
        }
        tids.push(ids);
    }
    Ok((
        Some(StepLayout {
            node_list,
            node_cnt,
            task_cnt,
            tasks,
            tids,
        }),
        task_dist,
        plane_size,
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::resources::JobResources;
    use crate::node::{NodeInfo, NodeTable};
    use crate::pack::Packer;
    use crate::plugins::acct::Jobacct;
    use crate::step::lifecycle::StepManager;
    use crate::step::StepCreateRequest;
    use crate::config::StepmgrConfig;
    use crate::NO_VAL;
    use std::sync::Arc;

    fn table(n: usize) -> Arc<NodeTable> {
        Arc::new(NodeTable::new(
            (0..n).map(|i| NodeInfo::new(format!("tux{i}"), 4)).collect(),
        ))
    }

    fn job(n: usize) -> Job {
        let mut map = Bitmap::new(n);
        map.set_range(0, n - 1);
        Job::new(100, 1000, map, JobResources::new(vec![4; n]))
    }

    fn running_step(nodes: Arc<NodeTable>, j: &mut Job) -> (StepManager, u32) {
        let mut mgr = StepManager::new(
            Arc::new(StepmgrConfig::default()),
            nodes,
            Plugins::default(),
        );
        let req = StepCreateRequest {
            user_id: 1000,
            min_nodes: 2,
            num_tasks: 4,
            cpu_count: 4,
            time_limit: 30,
            host: "login1".to_string(),
            port: 4500,
            name: "mpi".to_string(),
            network: "ib0".to_string(),
            ..Default::default()
        };
        let id = mgr.create_step(j, &req, false, 5000).unwrap();
        (mgr, id)
    }

    fn assert_steps_match(a: &StepRecord, b: &StepRecord) {
        assert_eq!(a.step_id, b.step_id);
        assert_eq!(a.cpus_per_task, b.cpus_per_task);
        assert_eq!(a.cpu_count, b.cpu_count);
        assert_eq!(a.mem_per_cpu, b.mem_per_cpu);
        assert_eq!(a.num_tasks, b.num_tasks);
        assert_eq!(a.task_dist, b.task_dist);
        assert_eq!(a.exit_code, b.exit_code);
        assert_eq!(a.exit_node_bitmap, b.exit_node_bitmap);
        assert_eq!(a.core_bitmap_job, b.core_bitmap_job);
        assert_eq!(a.time_limit, b.time_limit);
        assert_eq!(a.start_time, b.start_time);
        assert_eq!(a.pre_sus_time, b.pre_sus_time);
        assert_eq!(a.tot_sus_time, b.tot_sus_time);
        assert_eq!(a.ckpt_time, b.ckpt_time);
        assert_eq!(a.host, b.host);
        assert_eq!(a.port, b.port);
        assert_eq!(a.name, b.name);
        assert_eq!(a.network, b.network);
        assert_eq!(a.gres, b.gres);
        assert_eq!(a.batch_step, b.batch_step);
        assert_eq!(a.layout, b.layout);
        assert_eq!(a.step_node_bitmap, b.step_node_bitmap);
        assert_eq!(a.no_kill, b.no_kill);
        assert_eq!(a.resv_port_cnt, b.resv_port_cnt);
        assert_eq!(a.resv_ports, b.resv_ports);
    }

    #[test]
    fn dump_load_round_trips_a_live_step() {
        let nodes = table(4);
        let mut j = job(4);
        let (_mgr, id) = running_step(Arc::clone(&nodes), &mut j);
        let plugins = Plugins::default();

        let mut p = Packer::new();
        dump_job_steps(&j, &plugins, ProtocolVersion::V2, &mut p);

        let mut restored = job(4);
        let mut u = Unpacker::new(p.finish());
        load_job_steps(&mut restored, &plugins, &nodes, ProtocolVersion::V2, &mut u).unwrap();

        assert_eq!(u.remaining(), 0);
        assert_steps_match(j.find_step(id).unwrap(), restored.find_step(id).unwrap());
        assert_eq!(restored.next_step_id, 1);
    }

    #[test]
    fn sparse_core_bitmap_survives_round_trip() {
        let nodes = table(2);
        let mut j = job(2);
        let (_mgr, id) = running_step(Arc::clone(&nodes), &mut j);

        // 1024-bit mask with every 7th bit set
        let mut mask = Bitmap::new(1024);
        for bit in (0..1024).step_by(7) {
            mask.set(bit);
        }
        j.find_step_mut(id).unwrap().core_bitmap_job = Some(mask.clone());

        let plugins = Plugins::default();
        let mut p = Packer::new();
        dump_step_state(j.find_step(id).unwrap(), &plugins, ProtocolVersion::V2, &mut p);

        let mut restored = job(2);
        let mut u = Unpacker::new(p.finish());
        let loaded_id =
            load_step_state(&mut restored, &plugins, &nodes, ProtocolVersion::V2, &mut u)
                .unwrap();

        assert_eq!(loaded_id, id);
        let back = restored.find_step(id).unwrap();
        assert_eq!(back.core_bitmap_job.as_ref().unwrap(), &mask);
    }

    #[test]
    fn exit_bitmap_and_exit_code_survive_round_trip() {
        let nodes = table(4);
        let mut j = job(4);
        let (mut mgr, id) = running_step(Arc::clone(&nodes), &mut j);
        mgr.partial_complete(&mut j, id, 0, 0, 3, &Jobacct::default(), 1000, 5001)
            .unwrap();

        let plugins = Plugins::default();
        let mut p = Packer::new();
        dump_step_state(j.find_step(id).unwrap(), &plugins, ProtocolVersion::V2, &mut p);

        let mut restored = job(4);
        let mut u = Unpacker::new(p.finish());
        load_step_state(&mut restored, &plugins, &nodes, ProtocolVersion::V2, &mut u).unwrap();

        let back = restored.find_step(id).unwrap();
        assert_eq!(back.exit_code, 3);
        assert_eq!(back.exit_node_bitmap.as_ref().unwrap().fmt_ranges(), "0");
    }

    #[test]
    fn v1_omits_gres_state_but_round_trips() {
        let nodes = table(2);
        let mut j = job(2);
        let (_mgr, id) = running_step(Arc::clone(&nodes), &mut j);
        let plugins = Plugins::default();

        let mut p = Packer::new();
        dump_step_state(j.find_step(id).unwrap(), &plugins, ProtocolVersion::V1, &mut p);
        let v1 = p.finish();

        let mut p = Packer::new();
        dump_step_state(j.find_step(id).unwrap(), &plugins, ProtocolVersion::V2, &mut p);
        let v2 = p.finish();
        // the only difference is the packed (empty) GRES state
        assert_eq!(v2.len(), v1.len() + 4);

        let mut restored = job(2);
        let mut u = Unpacker::new(v1);
        load_step_state(&mut restored, &plugins, &nodes, ProtocolVersion::V1, &mut u).unwrap();
        assert!(restored.find_step(id).is_some());
    }

    #[test]
    fn corrupt_flag_values_are_rejected() {
        let mut p = Packer::new();
        p.pack_u32(0); // step_id
        p.pack_u16(2); // cyclic_alloc out of range
        let mut restored = job(2);
        let plugins = Plugins::default();
        let nodes = table(2);
        let mut u = Unpacker::new(p.finish());
        assert!(matches!(
            load_step_state(&mut restored, &plugins, &nodes, ProtocolVersion::V2, &mut u),
            Err(StepError::Corrupt(_))
        ));
    }

    #[test]
    fn load_populates_existing_record_in_place() {
        let nodes = table(4);
        let mut j = job(4);
        let (_mgr, id) = running_step(Arc::clone(&nodes), &mut j);
        let plugins = Plugins::default();

        let mut p = Packer::new();
        dump_step_state(j.find_step(id).unwrap(), &plugins, ProtocolVersion::V2, &mut p);

        // reload over the same job: still exactly one record
        let mut u = Unpacker::new(p.finish());
        load_step_state(&mut j, &plugins, &nodes, ProtocolVersion::V2, &mut u).unwrap();
        assert_eq!(j.steps.len(), 1);
    }

    #[test]
    fn find_step_no_val_still_works_after_reload() {
        let nodes = table(4);
        let mut j = job(4);
        let (_mgr, id) = running_step(Arc::clone(&nodes), &mut j);
        let plugins = Plugins::default();

        let mut p = Packer::new();
        dump_job_steps(&j, &plugins, ProtocolVersion::V2, &mut p);
        let mut restored = job(4);
        let mut u = Unpacker::new(p.finish());
        load_job_steps(&mut restored, &plugins, &nodes, ProtocolVersion::V2, &mut u).unwrap();

        assert_eq!(restored.find_step(NO_VAL).unwrap().step_id, id);
    }
}
