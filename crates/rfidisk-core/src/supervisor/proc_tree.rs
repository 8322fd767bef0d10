//! Process tree snapshots read from `/proc` through `procfs`.
//!
//! Launched applications often fork and exit their launcher (Steam, wrapper
//! scripts), so the tree under the root pid is recomputed on demand rather
//! than trusted from launch time. Processes are identified by pid plus start
//! time so a recycled pid is never mistaken for a tracked one.

use std::collections::{HashMap, HashSet};

/// The fields of `/proc/<pid>/stat` the supervisor cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub pid: u32,
    pub ppid: u32,
    pub pgrp: u32,
    /// Single-letter state code (`R`, `S`, `Z`, ...).
    pub state: char,
    /// Start time in clock ticks since boot.
    pub start_time: u64,
}

impl ProcStat {
    pub fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X')
    }

    #[cfg(target_os = "linux")]
    fn from_procfs(stat: &procfs::process::Stat) -> Option<Self> {
        Some(Self {
            pid: u32::try_from(stat.pid).ok()?,
            ppid: u32::try_from(stat.ppid).ok()?,
            pgrp: u32::try_from(stat.pgrp).ok()?,
            state: stat.state,
            start_time: stat.starttime,
        })
    }
}

/// Read the stat of a single process, `None` if it does not exist.
#[cfg(target_os = "linux")]
pub fn read_stat(pid: u32) -> Option<ProcStat> {
    let process = procfs::process::Process::new(i32::try_from(pid).ok()?).ok()?;
    let stat = process.stat().ok()?;
    ProcStat::from_procfs(&stat)
}

#[cfg(not(target_os = "linux"))]
pub fn read_stat(_pid: u32) -> Option<ProcStat> {
    None
}

/// A point-in-time view of every process on the system.
#[derive(Debug, Default, Clone)]
pub struct ProcSnapshot {
    procs: HashMap<u32, ProcStat>,
}

impl ProcSnapshot {
    /// Scan `/proc`. Processes that exit mid-scan are skipped.
    #[cfg(target_os = "linux")]
    pub fn capture() -> Self {
        let Ok(processes) = procfs::process::all_processes() else {
            return Self::default();
        };
        Self::from_stats(
            processes
                .flatten()
                .filter_map(|process| process.stat().ok())
                .filter_map(|stat| ProcStat::from_procfs(&stat)),
        )
    }

    #[cfg(not(target_os = "linux"))]
    pub fn capture() -> Self {
        Self::default()
    }

    pub fn from_stats(stats: impl IntoIterator<Item = ProcStat>) -> Self {
        Self {
            procs: stats.into_iter().map(|s| (s.pid, s)).collect(),
        }
    }

    pub fn get(&self, pid: u32) -> Option<&ProcStat> {
        self.procs.get(&pid)
    }

    /// All transitive children of `root`, excluding `root` itself.
    pub fn descendants_of(&self, root: u32) -> Vec<ProcStat> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for stat in self.procs.values() {
            children.entry(stat.ppid).or_default().push(stat.pid);
        }

        let mut out = Vec::new();
        let mut seen = HashSet::from([root]);
        let mut stack = vec![root];
        while let Some(pid) = stack.pop() {
            for &child in children.get(&pid).into_iter().flatten() {
                if seen.insert(child) {
                    if let Some(stat) = self.procs.get(&child) {
                        out.push(*stat);
                    }
                    stack.push(child);
                }
            }
        }
        out
    }

    /// Every process whose process group is `pgrp`.
    pub fn group_members(&self, pgrp: u32) -> Vec<ProcStat> {
        self.procs.values().filter(|s| s.pgrp == pgrp).copied().collect()
    }

    /// Members of the group created by a launch whose leader started at
    /// `leader_start`. Empty once the group id belongs to a different
    /// leader; members older than the launch are never part of it.
    pub fn launched_group(&self, pgrp: u32, leader_start: Option<u64>) -> Vec<ProcStat> {
        let Some(start) = leader_start else {
            return self.group_members(pgrp);
        };
        if self.procs.get(&pgrp).is_some_and(|leader| leader.start_time != start) {
            return Vec::new();
        }
        self.procs
            .values()
            .filter(|s| s.pgrp == pgrp && s.start_time >= start)
            .copied()
            .collect()
    }

    /// Whether `pid` exists with the given start time and is not a zombie.
    pub fn is_running(&self, pid: u32, start_time: u64) -> bool {
        self.procs
            .get(&pid)
            .is_some_and(|s| s.start_time == start_time && !s.is_zombie())
    }
}
