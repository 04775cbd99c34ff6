/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Accounting-storage plugin contract and the per-step usage record.

use tracing::debug;

use crate::job::Job;
use crate::step::StepRecord;

/// Aggregated resource usage for one step, merged from per-node
/// completion reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Jobacct {
    pub user_cpu_sec: u64,
    pub sys_cpu_sec: u64,
    /// Peak resident set across all tasks, in kilobytes.
    pub max_rss_kb: u64,
    /// Peak virtual size across all tasks, in kilobytes.
    pub max_vsize_kb: u64,
}

impl Jobacct {
    /// Fold another report in: CPU times add, peaks take the max.
    pub fn aggregate(&mut self, other: &Jobacct) {
        self.user_cpu_sec = self.user_cpu_sec.saturating_add(other.user_cpu_sec);
        self.sys_cpu_sec = self.sys_cpu_sec.saturating_add(other.sys_cpu_sec);
        self.max_rss_kb = self.max_rss_kb.max(other.max_rss_kb);
        self.max_vsize_kb = self.max_vsize_kb.max(other.max_vsize_kb);
    }
}

/// The accounting-storage plugin contract.
pub trait AcctStorage: Send + Sync {
    /// Record that a step started.
    fn step_start(&self, job: &Job, step: &StepRecord);

    /// Record a step's final usage and exit code.
    fn step_complete(&self, job: &Job, step: &StepRecord);
}

/// Default wiring: log only, store nothing.
pub struct NullAcct;

impl AcctStorage for NullAcct {
    fn step_start(&self, job: &Job, step: &StepRecord) {
        debug!(job_id = job.job_id, step_id = step.step_id, "acct: step start");
    }

    fn step_complete(&self, job: &Job, step: &StepRecord) {
        debug!(
            job_id = job.job_id,
            step_id = step.step_id,
            exit_code = step.exit_code,
            "acct: step complete"
        );
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_sums_cpu_and_maxes_peaks() {
        let mut acc = Jobacct {
            user_cpu_sec: 10,
            sys_cpu_sec: 1,
            max_rss_kb: 500,
            max_vsize_kb: 900,
        };
        acc.aggregate(&Jobacct {
            user_cpu_sec: 5,
            sys_cpu_sec: 2,
            max_rss_kb: 300,
            max_vsize_kb: 1200,
        });
        assert_eq!(acc.user_cpu_sec, 15);
        assert_eq!(acc.sys_cpu_sec, 3);
        assert_eq!(acc.max_rss_kb, 500);
        assert_eq!(acc.max_vsize_kb, 1200);
    }
}
