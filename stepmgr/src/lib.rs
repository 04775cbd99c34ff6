/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! stepmgr – cluster job-step manager
//!
//! Given a running parent job that already owns an allocation of nodes,
//! CPUs, cores, memory, and generic consumable resources (GRES), this
//! library carves out *steps* — the sub-allocations a user's parallel
//! program actually executes within — and releases them again while
//! preserving the parent's accounting invariants.
//!
//! ```text
//! RPC layer ──► StepManager ──► pick_step_nodes ──► step layout ──► core paint
//!                   │                 (select)        (layout)       (cores)
//!                   │
//!                   ├── job-resource debits (alloc/dealloc LPS)
//!                   ├── plugin contracts (gres / switch / checkpoint / acct / agent)
//!                   └── state dump/load + info packing
//! ```
//!
//! The caller (the surrounding controller) owns the job table and the
//! global write-lock; every public operation here assumes it is invoked
//! with that lock held and performs no blocking I/O of its own.

pub mod bitmap;
pub mod config;
pub mod hostlist;
pub mod job;
pub mod node;
pub mod pack;
pub mod plugins;
pub mod step;

/// 32-bit "no value" sentinel used across requests and wire formats.
pub const NO_VAL: u32 = 0xffff_fffe;

/// 64-bit "no value" sentinel.
pub const NO_VAL64: u64 = 0xffff_ffff_ffff_fffe;

/// 32-bit "unlimited" sentinel (`time_limit`, `min_nodes`).
pub const INFINITE: u32 = 0xffff_ffff;

/// Step ids are drawn from `[0, MAX_STEP_ID)`; everything above is
/// reserved for sentinels.
pub const MAX_STEP_ID: u32 = 0xffff_fff0;

/// Reserved step id naming the job's batch script.
pub const BATCH_STEP_ID: u32 = 0xffff_fffb;
