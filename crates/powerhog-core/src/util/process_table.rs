//! Process table access.
//!
//! Used for three things: confirming that powermetrics is still alive,
//! refusing to start a second daemon instance, and resolving the command line
//! behind generic interpreter names. The [`ProcessTable`] trait keeps the
//! callers testable without touching the real process list.

use std::ffi::OsStr;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System, UpdateKind};

pub trait ProcessTable: Send {
    /// Re-reads the process list. Lookups reflect the last refresh.
    fn refresh(&mut self);

    /// Whether at least one process with this exact name is running.
    fn is_running(&self, name: &str) -> bool;

    /// Number of processes with this name, not counting the current process.
    fn other_instances(&self, name: &str) -> usize;

    /// Full command line of `pid`, space separated.
    fn command_line(&self, pid: u32) -> Option<String>;
}

/// [`ProcessTable`] backed by the host's process list.
pub struct SystemProcessTable {
    system: System,
    own_pid: Option<Pid>,
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProcessTable {
    pub fn new() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing().with_processes(Self::refresh_kind()),
        );
        Self {
            system,
            own_pid: sysinfo::get_current_pid().ok(),
        }
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::OnlyIfNotSet)
    }
}

impl ProcessTable for SystemProcessTable {
    fn refresh(&mut self) {
        self.system
            .refresh_processes_specifics(ProcessesToUpdate::All, true, Self::refresh_kind());
    }

    fn is_running(&self, name: &str) -> bool {
        self.system
            .processes_by_exact_name(OsStr::new(name))
            .next()
            .is_some()
    }

    fn other_instances(&self, name: &str) -> usize {
        self.system
            .processes_by_exact_name(OsStr::new(name))
            .filter(|p| Some(p.pid()) != self.own_pid)
            // threads show up as processes on Linux
            .filter(|p| p.thread_kind().is_none())
            .count()
    }

    fn command_line(&self, pid: u32) -> Option<String> {
        let process = self.system.process(Pid::from_u32(pid))?;
        let cmd: Vec<String> = process
            .cmd()
            .iter()
            .map(|part| part.to_string_lossy().into_owned())
            .collect();
        if cmd.is_empty() {
            None
        } else {
            Some(cmd.join(" "))
        }
    }
}
