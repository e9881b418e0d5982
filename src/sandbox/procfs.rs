//! Minimal `/proc` scanner used to verify that a sandbox left nothing behind.

use std::fs;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub state: char,
    pub pgrp: i32,
    pub uid: Option<u32>,
}

impl ProcessInfo {
    /// Zombies hold no resources and cannot run any more
    pub fn is_alive(&self) -> bool {
        !matches!(self.state, 'Z' | 'X')
    }
}

/// Lists every process visible in `/proc`
///
/// Processes that exit during the scan are skipped.
pub fn list_processes() -> io::Result<Vec<ProcessInfo>> {
    list_processes_in(Path::new("/proc"))
}

fn list_processes_in(proc_root: &Path) -> io::Result<Vec<ProcessInfo>> {
    let mut processes = Vec::new();
    for entry in fs::read_dir(proc_root)? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        let Some((state, pgrp)) = parse_stat(&stat) else {
            continue;
        };
        let uid = fs::read_to_string(entry.path().join("status"))
            .ok()
            .and_then(|status| parse_uid(&status));
        processes.push(ProcessInfo {
            pid,
            state,
            pgrp,
            uid,
        });
    }
    Ok(processes)
}

/// Live pids whose process group is one of `groups`
pub fn live_in_groups(groups: &[i32]) -> io::Result<Vec<u32>> {
    Ok(list_processes()?
        .into_iter()
        .filter(|p| p.is_alive() && groups.contains(&p.pgrp))
        .map(|p| p.pid)
        .collect())
}

/// Live pids owned by `uid`
pub fn live_owned_by(uid: u32) -> io::Result<Vec<u32>> {
    Ok(list_processes()?
        .into_iter()
        .filter(|p| p.is_alive() && p.uid == Some(uid))
        .map(|p| p.pid)
        .collect())
}

/// Extracts state and process group from `/proc/<pid>/stat`
///
/// The command name is wrapped in parentheses and may itself contain spaces
/// and parentheses, so fields are counted from the last `)`.
fn parse_stat(stat: &str) -> Option<(char, i32)> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((state, pgrp))
}

/// Real uid from `/proc/<pid>/status`
fn parse_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|ids| ids.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}
