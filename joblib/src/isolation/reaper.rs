use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::{HashMap, VecDeque};

/// Every live descendant of `root` (not including `root`), found by walking the parent
/// links in `/proc`.
pub fn descendants_of(root: i32) -> Vec<i32> {
    let processes = match procfs::process::all_processes() {
        Ok(processes) => processes,
        Err(err) => {
            tracing::warn!(error = %err, "cannot read process table");
            return vec![];
        }
    };
    let table: Vec<(i32, i32)> = processes
        .filter_map(|proc| proc.ok())
        // processes can vanish while we walk the table
        .filter_map(|proc| proc.stat().ok())
        .map(|stat| (stat.pid, stat.ppid))
        .collect();
    descendants_in(&table, root)
}

/// Breadth-first walk of a `(pid, ppid)` table starting below `root`.
pub(crate) fn descendants_in(table: &[(i32, i32)], root: i32) -> Vec<i32> {
    let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
    for &(pid, ppid) in table {
        children.entry(ppid).or_default().push(pid);
    }

    let mut found = vec![];
    let mut queue = VecDeque::from([root]);
    while let Some(parent) = queue.pop_front() {
        if let Some(kids) = children.get(&parent) {
            for &kid in kids {
                if kid != root && !found.contains(&kid) {
                    found.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }
    found
}

/// Send `signal` to every descendant of `root`. Returns how many were signalled.
pub fn signal_descendants(root: i32, signal: Signal) -> usize {
    let mut signalled = 0;
    for pid in descendants_of(root) {
        match kill(Pid::from_raw(pid), signal) {
            Ok(()) => signalled += 1,
            Err(Errno::ESRCH) => {}
            Err(err) => tracing::warn!(pid, error = %err, "failed to signal descendant"),
        }
    }
    signalled
}
