use sysinfo::{ProcessesToUpdate, System};

/// Returns the resident set size of the current process in bytes, or
/// `None` when the process table cannot be read on this platform.
///
/// Only the current pid is refreshed, never the full process table.
pub(crate) fn current_rss_bytes() -> Option<i64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    let process = system.process(pid)?;
    i64::try_from(process.memory()).ok()
}
