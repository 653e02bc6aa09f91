//! Stray-process sweep.
//!
//! A worker's descendant can leave the worker's process group with
//! `setsid()`, out of reach of the group kill. This process marks itself a
//! child subreaper, so such a descendant is re-parented here as soon as its
//! own parent dies. After every run, each child of ours that is not a live
//! worker is killed and reaped, repeatedly, until none are left.

use lazy_static::lazy_static;
use std::{
    collections::HashSet,
    io,
    sync::{Mutex, MutexGuard},
    time::Duration,
};
use tokio::process::{Child, Command};

use crate::Result;

lazy_static! {
    /// Pids of workers that are spawned and not yet reaped by tokio.
    static ref WORKERS: Mutex<HashSet<u32>> = Default::default();
    static ref ADOPTING: bool = become_subreaper();
}

fn workers() -> MutexGuard<'static, HashSet<u32>> {
    // The set stays consistent even if a holder panicked
    WORKERS.lock().unwrap_or_else(|e| e.into_inner())
}

/// Keeps a spawned process out of [`sweep`] until dropped.
#[derive(Debug)]
pub struct Tracked(Option<u32>);

impl Drop for Tracked {
    fn drop(&mut self) {
        if let Some(pid) = self.0 {
            workers().remove(&pid);
        }
    }
}

/// Spawns `command` and registers the child before any sweep can see it.
pub fn spawn(command: &mut Command) -> io::Result<(Child, Tracked)> {
    lazy_static::initialize(&ADOPTING);

    let mut workers = workers();
    let child = command.spawn()?;
    let pid = child.id();
    if let Some(pid) = pid {
        workers.insert(pid);
    }

    Ok((child, Tracked(pid)))
}

/// Whether escaped descendants are re-parented to this process.
pub fn is_adopting() -> bool {
    *ADOPTING
}

#[cfg(target_os = "linux")]
fn become_subreaper() -> bool {
    match nix::sys::prctl::set_child_subreaper(true) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Unable to become a child subreaper, escaped workers can't be swept: {}", e);
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn become_subreaper() -> bool {
    false
}

/// Kills and reaps every child of this process that is not a tracked
/// worker. Blocking; returns how many were found.
#[cfg(target_os = "linux")]
pub fn sweep(grace: Duration) -> Result<usize> {
    use nix::sys::signal::{kill, Signal};
    use std::time::Instant;

    if !is_adopting() {
        return Ok(0);
    }

    let deadline = Instant::now() + grace;
    let mut swept = 0;
    loop {
        let strays: Vec<u32> = {
            let workers = workers();
            let strays: Vec<u32> = children()
                .into_iter()
                .filter(|pid| !workers.contains(pid))
                .collect();
            for &pid in &strays {
                // ESRCH: already gone, only the zombie is left to reap
                let _ = kill(to_pid(pid), Signal::SIGKILL);
            }
            strays
        };

        if strays.is_empty() {
            return Ok(swept);
        }
        if Instant::now() >= deadline {
            return Err(crate::Error::StrayProcessesSurvived {
                remaining: strays.len(),
                grace,
            });
        }

        log::debug!("Killed stray processes {:?}", strays);
        swept += strays.len();
        for pid in strays {
            reap(pid, deadline);
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn sweep(_grace: Duration) -> Result<usize> {
    Ok(0)
}

#[cfg(target_os = "linux")]
fn reap(pid: u32, deadline: std::time::Instant) {
    use nix::errno::Errno;
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use std::{thread, time::Instant};

    const POLL_INTERVAL: Duration = Duration::from_millis(5);

    loop {
        match waitpid(to_pid(pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if Instant::now() >= deadline {
                    return;
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(Errno::EINTR) => {}
            // Reaped, or ECHILD because a concurrent sweep got there first.
            _ => return,
        }
    }
}

#[cfg(target_os = "linux")]
fn to_pid(pid: u32) -> nix::unistd::Pid {
    nix::unistd::Pid::from_raw(pid as i32)
}

/// Direct children of this process, zombies included.
#[cfg(target_os = "linux")]
fn children() -> Vec<u32> {
    use std::fs;

    let me = std::process::id();
    let entries = match fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("Unable to list /proc: {}", e);
            return Vec::new();
        }
    };

    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|&pid| {
            fs::read_to_string(format!("/proc/{}/stat", pid))
                .ok()
                .and_then(|stat| parent_of(&stat))
                == Some(me)
        })
        .collect()
}

/// The ppid field of `/proc/<pid>/stat`. The command name may itself
/// contain spaces and parentheses, so fields are counted after the last `)`.
fn parent_of(stat: &str) -> Option<u32> {
    let rest = stat.get(stat.rfind(')')? + 1..)?;
    rest.split_whitespace().nth(1)?.parse().ok()
}
