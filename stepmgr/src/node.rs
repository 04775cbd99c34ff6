/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Read-mostly projection of the global node table.
//!
//! The surrounding controller owns the real node records; the step
//! manager only needs stable indices, names, CPU counts, and enough
//! state to tell usable nodes from powered-down or unresponsive ones.
//! Nodes are a dense `Vec` indexed by node number — all node sets in
//! this crate are bit-per-node [`Bitmap`]s over that index space.

use std::collections::HashMap;

use crate::bitmap::Bitmap;

/// Availability of one compute node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    /// Healthy and reachable.
    #[default]
    Up,
    /// Administratively or fatally down.
    Down,
    /// Powered down by energy saving; boots on demand.
    PoweredDown,
    /// Not responding to the controller.
    Unresponsive,
}

/// One node of the cluster as the step manager sees it.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub name: String,
    /// CPU count from the node's configuration line.
    pub config_cpus: u32,
    /// CPU count the node actually reported at registration.
    pub live_cpus: u32,
    pub state: NodeState,
}

impl NodeInfo {
    pub fn new(name: impl Into<String>, cpus: u32) -> Self {
        Self {
            name: name.into(),
            config_cpus: cpus,
            live_cpus: cpus,
            state: NodeState::Up,
        }
    }
}

/// Dense, index-stable table of all nodes.
#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: Vec<NodeInfo>,
    by_name: HashMap<String, usize>,
}

impl NodeTable {
    pub fn new(nodes: Vec<NodeInfo>) -> Self {
        let by_name = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();
        Self { nodes, by_name }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, inx: usize) -> Option<&NodeInfo> {
        self.nodes.get(inx)
    }

    pub fn name(&self, inx: usize) -> &str {
        &self.nodes[inx].name
    }

    /// Stable index for a node name.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Bitmap of nodes in [`NodeState::Up`].
    pub fn up_nodes(&self) -> Bitmap {
        let mut map = Bitmap::new(self.nodes.len());
        for (i, n) in self.nodes.iter().enumerate() {
            if n.state == NodeState::Up {
                map.set(i);
            }
        }
        map
    }

    /// Bitmap of nodes that are powered down or unresponsive — the set
    /// that blocks a job's first step until boot completes.
    pub fn not_booted(&self) -> Bitmap {
        let mut map = Bitmap::new(self.nodes.len());
        for (i, n) in self.nodes.iter().enumerate() {
            if matches!(n.state, NodeState::PoweredDown | NodeState::Unresponsive) {
                map.set(i);
            }
        }
        map
    }

    /// CPU count for a node, honouring the fast-schedule setting: with
    /// fast scheduling the configured count is authoritative, otherwise
    /// the live (registered) count is.
    pub fn cpus(&self, inx: usize, fast_schedule: bool) -> u32 {
        let n = &self.nodes[inx];
        if fast_schedule {
            n.config_cpus
        } else {
            n.live_cpus
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
