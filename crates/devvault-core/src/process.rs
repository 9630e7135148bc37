//! Process management utilities

use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};

/// How a termination request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited after SIGTERM within the grace period
    Graceful,
    /// Needed SIGKILL after the grace period
    Killed,
    /// There was no live process with that pid
    NotRunning,
}

fn refresh(sys: &mut System, pid: Pid) {
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
}

/// Check if a process with the given pid is alive (zombies count as dead)
pub fn is_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    refresh(&mut sys, pid);

    match sys.process(pid) {
        Some(p) => !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

/// Send SIGTERM, wait up to `grace`, then SIGKILL.
pub fn terminate(pid: u32, grace: Duration) -> Termination {
    let sys_pid = Pid::from_u32(pid);
    let mut sys = System::new();
    refresh(&mut sys, sys_pid);

    let Some(process) = sys.process(sys_pid) else {
        return Termination::NotRunning;
    };
    if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
        return Termination::NotRunning;
    }

    // kill_with returns None when the platform lacks the signal
    if process.kill_with(Signal::Term).is_none() {
        process.kill();
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_alive(pid) {
            return Termination::Graceful;
        }
        thread::sleep(Duration::from_millis(100));
    }

    refresh(&mut sys, sys_pid);
    if let Some(process) = sys.process(sys_pid) {
        process.kill();
    }
    Termination::Killed
}
